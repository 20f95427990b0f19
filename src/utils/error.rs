//! Error types and handling
//!
//! The aggregate error type used at the crate boundary.

use crate::capture::CaptureError;
use crate::combiner::CombineError;
use crate::config::ConfigError;
use crate::export::ExportError;
use crate::feedback::FeedbackError;
use crate::practice::PracticeError;
use crate::project::BundleError;
use crate::recorder::RecordingError;
use crate::segments::SegmentError;
use crate::timeline::TimelineError;
use crate::upload::UploadError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Recording(#[from] RecordingError),

    #[error(transparent)]
    Timeline(#[from] TimelineError),

    #[error(transparent)]
    Segment(#[from] SegmentError),

    #[error(transparent)]
    Feedback(#[from] FeedbackError),

    #[error(transparent)]
    Combine(#[from] CombineError),

    #[error(transparent)]
    Export(#[from] ExportError),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error(transparent)]
    Practice(#[from] PracticeError),

    #[error(transparent)]
    Bundle(#[from] BundleError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

fn capture_code(error: &CaptureError) -> &'static str {
    match error {
        CaptureError::PermissionDenied(_) => "PERMISSION_DENIED",
        CaptureError::DeviceUnavailable(_) => "DEVICE_UNAVAILABLE",
        CaptureError::Platform(_) => "PLATFORM_ERROR",
    }
}

fn recording_code(error: &RecordingError) -> &'static str {
    match error {
        RecordingError::NoSourcesAvailable => "NO_SOURCES_AVAILABLE",
        RecordingError::Capture(e) => capture_code(e),
        RecordingError::InvalidTransition { .. } | RecordingError::NotRecording => "INVALID_STATE",
        RecordingError::Recorder(_) => "RECORDING_ERROR",
    }
}

fn segment_code(error: &SegmentError) -> &'static str {
    match error {
        SegmentError::InvalidRange(_) => "INVALID_RANGE",
        SegmentError::SegmentLimitExceeded(_) => "SEGMENT_LIMIT_EXCEEDED",
        SegmentError::NotFound(_) => "NOT_FOUND",
        SegmentError::Playback(_) => "PLAYBACK_ERROR",
        SegmentError::Cancelled => "CANCELLED",
    }
}

fn export_code(error: &ExportError) -> &'static str {
    match error {
        ExportError::EngineUnavailable(_) => "ENGINE_UNAVAILABLE",
        ExportError::MissingBackground => "MISSING_BACKGROUND",
        ExportError::EncodingFailed { .. } => "ENCODING_FAILED",
        ExportError::InvalidSpec(_) => "INVALID_SPEC",
        ExportError::Io(_) => "IO_ERROR",
        ExportError::Cancelled => "CANCELLED",
    }
}

impl AppError {
    /// Stable error code
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Io(_) => "IO_ERROR",
            AppError::Serialization(_) => "SERIALIZATION_ERROR",
            AppError::Capture(e) => capture_code(e),
            AppError::Recording(e) => recording_code(e),
            AppError::Timeline(_) => "TIMELINE_ERROR",
            AppError::Segment(e) => segment_code(e),
            AppError::Feedback(FeedbackError::Segment(e)) => segment_code(e),
            AppError::Feedback(FeedbackError::Recording(e)) => recording_code(e),
            AppError::Feedback(FeedbackError::Aborted) => "CANCELLED",
            AppError::Combine(CombineError::Recording(e)) => recording_code(e),
            AppError::Combine(CombineError::Cancelled) => "CANCELLED",
            AppError::Combine(_) => "COMBINE_ERROR",
            AppError::Export(e) => export_code(e),
            AppError::Upload(UploadError::AuthRequired(_)) => "AUTH_REQUIRED",
            AppError::Upload(UploadError::ChannelRequired(_)) => "CHANNEL_REQUIRED",
            AppError::Upload(UploadError::UploadFailed { .. }) => "UPLOAD_FAILED",
            AppError::Upload(UploadError::Cancelled) => "CANCELLED",
            AppError::Practice(PracticeError::Recording(e)) => recording_code(e),
            AppError::Practice(_) => "PRACTICE_ERROR",
            AppError::Bundle(_) => "BUNDLE_ERROR",
            AppError::Config(_) => "CONFIG_ERROR",
        }
    }

    /// Composition and upload failures can be retried by the user; nothing
    /// is retried automatically.
    pub fn allows_manual_retry(&self) -> bool {
        matches!(
            self,
            AppError::Export(ExportError::EncodingFailed { .. } | ExportError::EngineUnavailable(_))
                | AppError::Upload(UploadError::UploadFailed { .. })
        )
    }

    /// Whether the user can fix this themselves (grant access, sign in,
    /// create a channel, pick a background, adjust a range)
    pub fn is_user_actionable(&self) -> bool {
        matches!(
            self.code(),
            "PERMISSION_DENIED"
                | "DEVICE_UNAVAILABLE"
                | "NO_SOURCES_AVAILABLE"
                | "INVALID_RANGE"
                | "SEGMENT_LIMIT_EXCEEDED"
                | "MISSING_BACKGROUND"
                | "AUTH_REQUIRED"
                | "CHANNEL_REQUIRED"
        )
    }
}

/// Error response for callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl From<AppError> for ErrorResponse {
    fn from(error: AppError) -> Self {
        ErrorResponse {
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }
}

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;
