//! Native device backend
//!
//! Screen capture runs an ffmpeg grab process and is always available. The
//! camera (nokhwa) and the microphone and system audio (cpal) need the
//! `native` feature, which links the platform capture libraries.

mod screen;

#[cfg(feature = "native")]
mod audio;
#[cfg(feature = "native")]
mod webcam;

pub use screen::{grab_args, GrabInput};

use super::traits::{CaptureError, CaptureHints, CaptureResult, DeviceBackend, Resolution, SourceKind, TrackRef};
use async_trait::async_trait;
use std::path::PathBuf;

/// Resolution used when the caller gives no hint
pub const DEFAULT_RESOLUTION: Resolution = Resolution {
    width: 1280,
    height: 720,
};

/// Frame rate used when the caller gives no hint
pub const DEFAULT_FRAME_RATE: u32 = 30;

/// Map a platform failure message onto the capture error a caller acts on
pub(crate) fn classify_platform_error(kind: SourceKind, message: &str) -> CaptureError {
    let lower = message.to_lowercase();
    if ["denied", "not permitted", "not authorized", "permission"]
        .iter()
        .any(|needle| lower.contains(needle))
    {
        CaptureError::PermissionDenied(format!("{}: {}", kind, message.trim()))
    } else if ["no such", "not found", "cannot open display", "not available", "no device"]
        .iter()
        .any(|needle| lower.contains(needle))
    {
        CaptureError::DeviceUnavailable(format!("{}: {}", kind, message.trim()))
    } else {
        CaptureError::Platform(format!("{}: {}", kind, message.trim()))
    }
}

/// Devices of the machine the engine runs on
#[derive(Debug, Clone, Default)]
pub struct NativeDevices {
    ffmpeg: Option<PathBuf>,
}

impl NativeDevices {
    /// `ffmpeg` is used for screen capture; looked up on PATH when `None`
    pub fn new(ffmpeg: Option<PathBuf>) -> Self {
        Self { ffmpeg }
    }
}

#[cfg(not(feature = "native"))]
fn without_native(kind: SourceKind) -> CaptureResult<Vec<TrackRef>> {
    Err(CaptureError::DeviceUnavailable(format!(
        "{} capture needs the `native` feature",
        kind
    )))
}

#[async_trait]
impl DeviceBackend for NativeDevices {
    async fn request(&self, kind: SourceKind, hints: &CaptureHints) -> CaptureResult<Vec<TrackRef>> {
        tracing::debug!("Requesting {} from native devices", kind);
        match kind {
            SourceKind::Screen => screen::open(self.ffmpeg.as_deref(), hints).await,
            #[cfg(feature = "native")]
            SourceKind::Camera => webcam::open(hints).await,
            #[cfg(feature = "native")]
            SourceKind::Microphone => audio::open_microphone().await,
            #[cfg(feature = "native")]
            SourceKind::SystemAudio => audio::open_system_audio().await,
            #[cfg(not(feature = "native"))]
            kind => without_native(kind),
        }
    }

    fn name(&self) -> &str {
        "native"
    }
}
