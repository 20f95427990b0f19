//! Device acquisition
//!
//! This module provides the platform-agnostic capture traits, the media feed
//! carried by live tracks, the native device backend and the
//! [`DeviceAcquirer`] that opens camera, microphone, screen and system audio.

pub mod acquirer;
pub mod feed;
pub mod native;
pub mod track;
pub mod traits;

pub use acquirer::{AcquireWarning, Acquisition, DeviceAcquirer, MediaSource, PreviewBinding};
pub use feed::{f32le_bytes, AudioBlock, VideoFrame, AUDIO_FEED_CAPACITY, VIDEO_FEED_CAPACITY};
pub use native::NativeDevices;
pub use track::LocalTrack;
pub use traits::{
    CaptureError, CaptureHints, CaptureResult, DeviceBackend, MediaTrack, Resolution, SourceKind,
    TrackKind, TrackRef,
};
