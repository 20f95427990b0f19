use crate::capture::{
    CaptureError, CaptureHints, CaptureResult, DeviceBackend, LocalTrack, MediaTrack, SourceKind,
    TrackKind, TrackRef,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// In-memory devices.
///
/// Every kind is granted by default. Camera and screen hand out one video
/// track, microphone and system audio one audio track.
#[derive(Debug, Default)]
pub struct SyntheticDevices {
    failures: HashMap<SourceKind, CaptureError>,
    empty: Vec<SourceKind>,
    issued: Mutex<Vec<(SourceKind, Arc<LocalTrack>)>>,
}

impl SyntheticDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// The user refuses permission for `kind`
    pub fn deny(mut self, kind: SourceKind) -> Self {
        self.failures.insert(
            kind,
            CaptureError::PermissionDenied(format!("{} access denied", kind)),
        );
        self
    }

    /// No device of `kind` is present
    pub fn unavailable(mut self, kind: SourceKind) -> Self {
        self.failures.insert(
            kind,
            CaptureError::DeviceUnavailable(format!("no {} device", kind)),
        );
        self
    }

    /// Granted, but no tracks (screen shared without system audio)
    pub fn empty(mut self, kind: SourceKind) -> Self {
        self.empty.push(kind);
        self
    }

    /// Simulate the platform ending every live track of `kind`, e.g. the
    /// user pressing "stop sharing"
    pub fn revoke(&self, kind: SourceKind) {
        for (issued_kind, track) in self.issued.lock().iter() {
            if *issued_kind == kind {
                track.stop();
            }
        }
    }

    pub fn live_tracks(&self, kind: SourceKind) -> usize {
        self.issued
            .lock()
            .iter()
            .filter(|(k, track)| *k == kind && track.is_live())
            .count()
    }

    pub fn total_live_tracks(&self) -> usize {
        self.issued.lock().iter().filter(|(_, t)| t.is_live()).count()
    }
}

#[async_trait]
impl DeviceBackend for SyntheticDevices {
    async fn request(&self, kind: SourceKind, _hints: &CaptureHints) -> CaptureResult<Vec<TrackRef>> {
        if let Some(error) = self.failures.get(&kind) {
            return Err(error.clone());
        }
        if self.empty.contains(&kind) {
            return Ok(Vec::new());
        }

        let track_kind = if kind.is_video() {
            TrackKind::Video
        } else {
            TrackKind::Audio
        };
        let track = Arc::new(LocalTrack::new(track_kind, format!("synthetic {}", kind)));
        self.issued.lock().push((kind, track.clone()));

        Ok(vec![track as TrackRef])
    }

    fn name(&self) -> &str {
        "synthetic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_revoke_ends_only_that_kind() {
        let devices = SyntheticDevices::new();
        let hints = CaptureHints::default();
        let screen = devices.request(SourceKind::Screen, &hints).await.unwrap();
        devices.request(SourceKind::Camera, &hints).await.unwrap();

        devices.revoke(SourceKind::Screen);

        assert!(!screen[0].is_live());
        assert!(*screen[0].ended().borrow());
        assert_eq!(devices.total_live_tracks(), 1);
    }

    #[tokio::test]
    async fn test_empty_grant() {
        let devices = SyntheticDevices::new().empty(SourceKind::SystemAudio);
        let tracks = devices
            .request(SourceKind::SystemAudio, &CaptureHints::default())
            .await
            .unwrap();
        assert!(tracks.is_empty());
    }
}
