//! Capture state management
//!
//! Defines the capture session state machine, active span tracking and the
//! finalized recording.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Current state of a capture session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureState {
    /// Nothing acquired yet
    Idle,
    /// Waiting for devices
    Acquiring,
    /// Stream composed, not recording
    Previewing,
    /// Currently recording
    Recording,
    /// Recording is paused
    Paused,
    /// Flushing the recorder and assembling the blob
    Finalizing,
    /// Recording finalized
    Completed,
    /// Aborted or failed; everything released
    Failed,
}

impl CaptureState {
    /// Whether the session is in an active recording (including paused)
    pub fn is_active(&self) -> bool {
        matches!(self, CaptureState::Recording | CaptureState::Paused)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CaptureState::Completed | CaptureState::Failed)
    }
}

impl Default for CaptureState {
    fn default() -> Self {
        Self::Idle
    }
}

impl std::fmt::Display for CaptureState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CaptureState::Idle => "idle",
            CaptureState::Acquiring => "acquiring",
            CaptureState::Previewing => "previewing",
            CaptureState::Recording => "recording",
            CaptureState::Paused => "paused",
            CaptureState::Finalizing => "finalizing",
            CaptureState::Completed => "completed",
            CaptureState::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// A stretch of time spent in the Recording state
///
/// A new span is opened each time recording is started or resumed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSpan {
    /// Span index (0, 1, 2, ...)
    pub index: usize,

    /// Offset from the recording origin when the span started
    pub start_ms: f64,

    /// Offset from the recording origin when the span ended
    pub end_ms: Option<f64>,

    /// Unix timestamp when the span started
    pub unix_start_ms: i64,
}

impl ActiveSpan {
    pub fn new(index: usize, start_ms: f64) -> Self {
        Self {
            index,
            start_ms,
            end_ms: None,
            unix_start_ms: Utc::now().timestamp_millis(),
        }
    }

    /// End the span
    pub fn end(&mut self, end_ms: f64) {
        if self.end_ms.is_none() {
            self.end_ms = Some(end_ms);
        }
    }

    /// Duration of the span; open spans are measured up to `now_ms`
    pub fn duration_ms(&self, now_ms: f64) -> f64 {
        (self.end_ms.unwrap_or(now_ms) - self.start_ms).max(0.0)
    }
}

/// What the caller asks the session to acquire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturePlan {
    /// Video kinds, first one rendered
    pub video: Vec<crate::capture::SourceKind>,

    /// Audio kinds mixed into the single audio track
    pub audio: Vec<crate::capture::SourceKind>,
}

impl CapturePlan {
    /// Camera with microphone, used for practice takes
    pub fn camera_with_microphone() -> Self {
        use crate::capture::SourceKind;
        Self {
            video: vec![SourceKind::Camera],
            audio: vec![SourceKind::Microphone],
        }
    }

    /// Screen (rendered) plus camera, microphone and system audio
    pub fn feedback() -> Self {
        use crate::capture::SourceKind;
        Self {
            video: vec![SourceKind::Screen, SourceKind::Camera],
            audio: vec![SourceKind::Microphone, SourceKind::SystemAudio],
        }
    }

    pub fn kinds(&self) -> Vec<crate::capture::SourceKind> {
        self.video.iter().chain(self.audio.iter()).copied().collect()
    }
}

/// A finalized recording: immutable blob in the recorder's container
#[derive(Debug, Clone, PartialEq)]
pub struct Recording {
    pub id: Uuid,
    pub data: Bytes,
    pub mime_type: String,
    /// Time spent recording, paused spans excluded
    pub duration: Duration,
    pub created_at: DateTime<Utc>,
    pub chunk_count: usize,
}

impl Recording {
    /// Wrap an existing blob, e.g. a file read from disk
    pub fn from_blob(data: Bytes, mime_type: impl Into<String>, duration: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            data,
            mime_type: mime_type.into(),
            duration,
            created_at: Utc::now(),
            chunk_count: 1,
        }
    }

    /// File extension for the container
    pub fn extension(&self) -> &'static str {
        extension_for_mime(&self.mime_type)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Map a container mime type to a file extension
pub fn extension_for_mime(mime_type: &str) -> &'static str {
    let base = mime_type.split(';').next().unwrap_or("").trim();
    match base {
        "video/mp4" => "mp4",
        "video/quicktime" => "mov",
        "video/x-matroska" => "mkv",
        _ => "webm",
    }
}

/// Map a file extension back to a container mime type
pub fn mime_for_extension(extension: &str) -> &'static str {
    match extension.to_ascii_lowercase().as_str() {
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "mkv" => "video/x-matroska",
        _ => "video/webm",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_duration() {
        let mut span = ActiveSpan::new(0, 100.0);
        assert_eq!(span.duration_ms(350.0), 250.0);

        span.end(300.0);
        span.end(900.0);
        assert_eq!(span.duration_ms(1000.0), 200.0);
    }

    #[test]
    fn test_mime_extension() {
        assert_eq!(extension_for_mime("video/webm;codecs=vp9,opus"), "webm");
        assert_eq!(extension_for_mime("video/mp4"), "mp4");
        assert_eq!(mime_for_extension("MP4"), "video/mp4");
    }

    #[test]
    fn test_feedback_plan_renders_screen_first() {
        let plan = CapturePlan::feedback();
        assert_eq!(plan.video[0], crate::capture::SourceKind::Screen);
        assert_eq!(plan.kinds().len(), 4);
    }
}
