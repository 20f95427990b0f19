//! Video hosting upload
//!
//! Packages a recording as a multipart request (JSON metadata + media) and
//! reports where the uploaded video can be watched.

pub mod client;

pub use client::UploadClient;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Authorization required: {0}")]
    AuthRequired(String),

    #[error("A channel must be created before uploading: {0}")]
    ChannelRequired(String),

    #[error("Upload failed{}: {message}", .status.map(|s| format!(" ({})", s)).unwrap_or_default())]
    UploadFailed { status: Option<u16>, message: String },

    #[error("Upload cancelled")]
    Cancelled,
}

/// Metadata sent with the media part
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadMetadata {
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    /// Privacy status, "unlisted" unless configured otherwise
    pub privacy: String,
}

impl UploadMetadata {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            tags: Vec::new(),
            privacy: "unlisted".to_string(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }
}

/// Where the uploaded video lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResult {
    pub remote_id: String,
    pub remote_url: String,
}

/// Coarse upload progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadProgress {
    Preparing,
    Sending { bytes: usize },
    Processing,
    Done,
}
