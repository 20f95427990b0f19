//! Composition types and configuration
//!
//! This module defines the styling spec a finished recording is composited
//! with, progress tracking, and error handling.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum background blur intensity
pub const MAX_BLUR: u8 = 20;

/// Allowed interior scale range
pub const MIN_SCALE: f64 = 0.5;
pub const MAX_SCALE: f64 = 1.0;

/// Target canvas aspect ratio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AspectRatio {
    #[serde(rename = "16:9")]
    Landscape,
    #[serde(rename = "9:16")]
    Portrait,
    #[serde(rename = "1:1")]
    Square,
    #[serde(rename = "4:3")]
    Classic,
    #[serde(rename = "4:5")]
    Vertical,
}

impl AspectRatio {
    /// Output canvas size in pixels
    pub fn canvas(&self) -> (u32, u32) {
        match self {
            AspectRatio::Landscape => (1920, 1080),
            AspectRatio::Portrait => (1080, 1920),
            AspectRatio::Square => (1080, 1080),
            AspectRatio::Classic => (1440, 1080),
            AspectRatio::Vertical => (1080, 1350),
        }
    }
}

impl std::str::FromStr for AspectRatio {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "16:9" => Ok(AspectRatio::Landscape),
            "9:16" => Ok(AspectRatio::Portrait),
            "1:1" => Ok(AspectRatio::Square),
            "4:3" => Ok(AspectRatio::Classic),
            "4:5" => Ok(AspectRatio::Vertical),
            other => Err(ExportError::InvalidSpec(format!("unknown aspect ratio {}", other))),
        }
    }
}

impl Default for AspectRatio {
    fn default() -> Self {
        Self::Landscape
    }
}

/// Background image handed to the encoding engine as a second input
#[derive(Debug, Clone, PartialEq)]
pub struct BackgroundImage {
    /// Original file name, used for the extension
    pub file_name: String,
    pub data: Bytes,
}

impl BackgroundImage {
    pub fn extension(&self) -> &str {
        std::path::Path::new(&self.file_name)
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("png")
    }
}

/// Styling applied to a finished recording
#[derive(Debug, Clone, PartialEq)]
pub struct CompositionSpec {
    pub background: Option<BackgroundImage>,
    pub aspect: AspectRatio,
    /// Draw a border box around the recording
    pub border: bool,
    /// Draw a drop shadow behind the recording
    pub shadow: bool,
    /// Background blur, 0..=20
    pub blur: u8,
    /// Interior size relative to the canvas, 0.5..=1.0
    pub scale: f64,
}

impl Default for CompositionSpec {
    fn default() -> Self {
        Self {
            background: None,
            aspect: AspectRatio::default(),
            border: false,
            shadow: false,
            blur: 0,
            scale: 0.85,
        }
    }
}

impl CompositionSpec {
    pub fn validate(&self) -> Result<(), ExportError> {
        if self.blur > MAX_BLUR {
            return Err(ExportError::InvalidSpec(format!(
                "blur must be at most {}, got {}",
                MAX_BLUR, self.blur
            )));
        }
        if !(MIN_SCALE..=MAX_SCALE).contains(&self.scale) {
            return Err(ExportError::InvalidSpec(format!(
                "scale must be within {}..={}, got {}",
                MIN_SCALE, MAX_SCALE, self.scale
            )));
        }
        Ok(())
    }

    /// Size of the scaled recording inside the canvas, rounded to even pixels.
    ///
    /// An out-of-range scale is clamped, so the interior always fits.
    pub fn interior(&self) -> (u32, u32) {
        let (width, height) = self.aspect.canvas();
        let scale = self.scale.clamp(MIN_SCALE, MAX_SCALE);
        let even = |v: u32| ((v as f64 * scale) as u32).min(v) & !1;
        (even(width), even(height))
    }

    /// Top-left corner of the interior on the canvas
    pub fn interior_origin(&self) -> (u32, u32) {
        let (width, height) = self.aspect.canvas();
        let (inner_w, inner_h) = self.interior();
        (width.saturating_sub(inner_w) / 2, height.saturating_sub(inner_h) / 2)
    }
}

/// Encoder settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderSettings {
    /// x264 constant rate factor; lower is higher quality
    pub crf: u8,
    pub preset: String,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            crf: 23,
            preset: "medium".to_string(),
        }
    }
}

impl From<&crate::config::CompositionSection> for EncoderSettings {
    fn from(section: &crate::config::CompositionSection) -> Self {
        Self {
            crf: section.crf,
            preset: section.preset.clone(),
        }
    }
}

/// Composition progress stages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum ExportStage {
    /// Writing inputs, checking the engine
    Preparing,
    /// Engine is encoding
    Encoding,
    /// Reading the artifact back
    Finalizing,
    /// Composition completed successfully
    Complete,
    /// Composition failed with error
    Error { message: String },
}

/// Composition progress information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportProgress {
    /// Progress percentage (0.0 to 100.0)
    pub percent: f32,
    /// Current stage
    pub stage: ExportStage,
    /// Encoded output time so far, in milliseconds
    pub encoded_ms: u64,
    /// Expected output duration, in milliseconds
    pub total_ms: u64,
}

impl ExportProgress {
    pub fn preparing() -> Self {
        Self {
            percent: 0.0,
            stage: ExportStage::Preparing,
            encoded_ms: 0,
            total_ms: 0,
        }
    }

    pub fn encoding(encoded_ms: u64, total_ms: u64) -> Self {
        let percent = if total_ms > 0 {
            10.0 + (encoded_ms.min(total_ms) as f32 / total_ms as f32) * 85.0
        } else {
            10.0
        };
        Self {
            percent,
            stage: ExportStage::Encoding,
            encoded_ms,
            total_ms,
        }
    }

    pub fn finalizing() -> Self {
        Self {
            percent: 95.0,
            stage: ExportStage::Finalizing,
            encoded_ms: 0,
            total_ms: 0,
        }
    }

    pub fn complete() -> Self {
        Self {
            percent: 100.0,
            stage: ExportStage::Complete,
            encoded_ms: 0,
            total_ms: 0,
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            percent: 0.0,
            stage: ExportStage::Error { message },
            encoded_ms: 0,
            total_ms: 0,
        }
    }
}

/// Composition errors
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encoding engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("No background image provided")]
    MissingBackground,

    #[error("Encoding failed: {diagnostic}")]
    EncodingFailed { diagnostic: String },

    #[error("Invalid composition spec: {0}")]
    InvalidSpec(String),

    #[error("Composition cancelled")]
    Cancelled,
}

impl From<ExportError> for String {
    fn from(e: ExportError) -> String {
        e.to_string()
    }
}

pub type ExportResult<T> = Result<T, ExportError>;
