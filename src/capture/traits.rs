//! Capture trait definitions
//!
//! Platform-agnostic traits for capture sources. A platform provides a
//! [`DeviceBackend`] that hands out live [`MediaTrack`]s; everything above it
//! (acquirer, composer, sessions) only talks to these traits.

use super::feed::{AudioBlock, VideoFrame};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, watch};

/// Errors that can occur while acquiring devices
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Platform error: {0}")]
    Platform(String),
}

/// Result type for capture operations
pub type CaptureResult<T> = Result<T, CaptureError>;

/// Kind of media source a caller can ask for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    Camera,
    Microphone,
    Screen,
    SystemAudio,
}

impl SourceKind {
    /// Whether this kind produces the video a session renders.
    ///
    /// Video kinds are required by an acquisition; audio kinds degrade to a
    /// warning when they cannot be opened.
    pub fn is_video(&self) -> bool {
        matches!(self, SourceKind::Camera | SourceKind::Screen)
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceKind::Camera => write!(f, "camera"),
            SourceKind::Microphone => write!(f, "microphone"),
            SourceKind::Screen => write!(f, "screen"),
            SourceKind::SystemAudio => write!(f, "system-audio"),
        }
    }
}

/// Kind of a single track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Video,
    Audio,
}

/// Video resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// Resolution and bitrate hints passed to the platform when opening a device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureHints {
    /// Preferred video resolution
    pub resolution: Option<Resolution>,

    /// Preferred frame rate
    pub frame_rate: Option<u32>,

    /// Target video bitrate in bits per second
    pub video_bitrate: Option<u32>,

    /// Target audio bitrate in bits per second
    pub audio_bitrate: Option<u32>,
}

/// A live track handed out by a device backend.
///
/// Stopping is idempotent. `ended()` flips to `true` whenever the track stops,
/// whether through [`MediaTrack::stop`] or because the platform revoked it
/// (for example the user pressed "stop sharing").
pub trait MediaTrack: Send + Sync + std::fmt::Debug {
    /// Unique track identifier
    fn id(&self) -> &str;

    /// Whether this is an audio or video track
    fn kind(&self) -> TrackKind;

    /// Human readable label (device name)
    fn label(&self) -> &str;

    /// Whether the track is still delivering media
    fn is_live(&self) -> bool;

    /// Stop the track. Safe to call on an already stopped track.
    fn stop(&self);

    /// Watch that becomes `true` once the track has ended
    fn ended(&self) -> watch::Receiver<bool>;

    /// Frames captured by a video track. `None` when the track carries no
    /// media this process can read.
    fn video_feed(&self) -> Option<broadcast::Receiver<VideoFrame>> {
        None
    }

    /// PCM captured by an audio track
    fn audio_feed(&self) -> Option<broadcast::Receiver<AudioBlock>> {
        None
    }
}

/// Shared handle to a live track
pub type TrackRef = Arc<dyn MediaTrack>;

/// Platform device backend
///
/// Implementations:
/// - `native::NativeDevices`: camera (nokhwa), microphone and system audio
///   (cpal), screen (ffmpeg grab)
/// - `synthetic::SyntheticDevices`: deterministic in-memory devices
#[async_trait]
pub trait DeviceBackend: Send + Sync {
    /// Ask the platform for the tracks of one source kind.
    ///
    /// A granted request may legitimately return zero tracks (screen share
    /// granted without system audio).
    async fn request(&self, kind: SourceKind, hints: &CaptureHints) -> CaptureResult<Vec<TrackRef>>;

    /// Backend name for logging
    fn name(&self) -> &str;
}
