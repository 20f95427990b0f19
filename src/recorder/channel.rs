//! Platform recorder trait
//!
//! Defines the interface a platform media recorder implements. A recorder
//! encodes a [`ComposedStream`] into a container and hands over encoded chunks
//! in arrival order through a channel.

use crate::capture::CaptureError;
use crate::composer::ComposedStream;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

use super::state::CaptureState;

/// Errors that can occur during recording
#[derive(Error, Debug)]
pub enum RecordingError {
    #[error("No sources available to record")]
    NoSourcesAvailable,

    #[error("Invalid transition: cannot {action} while {state}")]
    InvalidTransition {
        action: &'static str,
        state: CaptureState,
    },

    #[error("Not recording")]
    NotRecording,

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Recorder error: {0}")]
    Recorder(String),
}

/// Result type for recording operations
pub type RecordingResult<T> = Result<T, RecordingError>;

/// Options a recorder is created with
#[derive(Debug, Clone, PartialEq)]
pub struct RecorderOptions {
    /// Container the recorder produces (e.g. "video/webm")
    pub mime_type: String,

    /// How often a chunk is handed over while recording
    pub timeslice: Duration,

    /// Rate video frames are encoded at
    pub frame_rate: u32,

    pub video_bitrate: Option<u32>,

    pub audio_bitrate: Option<u32>,
}

impl Default for RecorderOptions {
    fn default() -> Self {
        Self {
            mime_type: "video/webm".to_string(),
            timeslice: Duration::from_secs(1),
            frame_rate: 30,
            video_bitrate: None,
            audio_bitrate: None,
        }
    }
}

impl From<&crate::config::CaptureConfig> for RecorderOptions {
    fn from(config: &crate::config::CaptureConfig) -> Self {
        Self {
            mime_type: config.mime_type.clone(),
            timeslice: config.timeslice(),
            frame_rate: config.frame_rate.unwrap_or(30),
            video_bitrate: config.video_bitrate,
            audio_bitrate: config.audio_bitrate,
        }
    }
}

/// Trait for platform media recorders
///
/// Implementations:
/// - `FfmpegRecorder`: encodes the stream's feeds with the ffmpeg binary
/// - `synthetic::SyntheticRecorder`: emits deterministic chunks on a timer,
///   behind the `synthetic` feature
#[async_trait]
pub trait MediaRecorder: Send + Sync {
    /// Container of the produced chunks
    fn mime_type(&self) -> &str;

    /// Start encoding the stream. Chunks arrive on the returned receiver.
    async fn start(&mut self, stream: &ComposedStream) -> RecordingResult<mpsc::UnboundedReceiver<Bytes>>;

    /// Pause encoding. Chunks already produced stay queued.
    async fn pause(&mut self) -> RecordingResult<()>;

    /// Resume encoding after a pause
    async fn resume(&mut self) -> RecordingResult<()>;

    /// Flush the final chunk and close the chunk channel
    async fn stop(&mut self) -> RecordingResult<()>;

    /// Check if the recorder is currently encoding
    fn is_recording(&self) -> bool;
}

/// Creates recorders for new capture sessions
pub trait RecorderFactory: Send + Sync {
    fn create(&self, options: &RecorderOptions) -> Box<dyn MediaRecorder>;
}
