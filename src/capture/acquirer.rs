//! Device acquisition
//!
//! Opens and releases media sources through a [`DeviceBackend`], making sure a
//! kind is never held twice, and keeps the camera preview binding current.

use super::traits::{
    CaptureError, CaptureHints, CaptureResult, DeviceBackend, SourceKind, TrackKind, TrackRef,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

/// A set of live tracks for one source kind
#[derive(Debug, Clone)]
pub struct MediaSource {
    id: Uuid,
    kind: SourceKind,
    tracks: Vec<TrackRef>,
    hints: CaptureHints,
}

impl MediaSource {
    pub fn new(kind: SourceKind, tracks: Vec<TrackRef>, hints: CaptureHints) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            tracks,
            hints,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn hints(&self) -> &CaptureHints {
        &self.hints
    }

    pub fn tracks(&self) -> &[TrackRef] {
        &self.tracks
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &TrackRef> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Video)
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &TrackRef> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Audio)
    }

    /// Number of tracks that are still live
    pub fn live_track_count(&self) -> usize {
        self.tracks.iter().filter(|t| t.is_live()).count()
    }

    /// Stop every track of this source
    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// Non-blocking problem reported alongside a successful acquisition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquireWarning {
    pub kind: SourceKind,
    pub reason: CaptureError,
}

/// Outcome of [`DeviceAcquirer::open`]
#[derive(Debug, Default)]
pub struct Acquisition {
    pub sources: Vec<MediaSource>,
    pub warnings: Vec<AcquireWarning>,
}

impl Acquisition {
    /// Take the source of a kind out of the acquisition
    pub fn take(&mut self, kind: SourceKind) -> Option<MediaSource> {
        let index = self.sources.iter().position(|s| s.kind() == kind)?;
        Some(self.sources.remove(index))
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

/// Live preview binding of the camera
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewBinding {
    pub source_id: Uuid,
    pub track_id: String,
}

/// Opens/releases camera, microphone, screen and system audio.
///
/// Sources are handed out by value; the acquirer keeps track handles per kind
/// so that reopening a kind always stops whatever was handed out before.
pub struct DeviceAcquirer {
    backend: Arc<dyn DeviceBackend>,
    hints: CaptureHints,
    held: HashMap<SourceKind, Vec<TrackRef>>,
    preview_tx: watch::Sender<Option<PreviewBinding>>,
}

impl DeviceAcquirer {
    pub fn new(backend: Arc<dyn DeviceBackend>) -> Self {
        let (preview_tx, _) = watch::channel(None);
        Self {
            backend,
            hints: CaptureHints::default(),
            held: HashMap::new(),
            preview_tx,
        }
    }

    /// Use these hints for every subsequent request
    pub fn with_hints(mut self, hints: CaptureHints) -> Self {
        self.hints = hints;
        self
    }

    /// Subscribe to preview binding changes
    pub fn preview(&self) -> watch::Receiver<Option<PreviewBinding>> {
        self.preview_tx.subscribe()
    }

    /// Open the requested kinds.
    ///
    /// Any tracks previously handed out for a requested kind are stopped first.
    /// A failing video kind releases everything opened by this call and
    /// returns the error; a failing audio kind becomes a warning.
    pub async fn open(&mut self, kinds: &[SourceKind]) -> CaptureResult<Acquisition> {
        let mut acquisition = Acquisition::default();

        for &kind in kinds {
            self.release_kind(kind);

            tracing::info!("Requesting {} from {}", kind, self.backend.name());

            match self.backend.request(kind, &self.hints).await {
                Ok(tracks) => {
                    if tracks.is_empty() {
                        tracing::warn!("{} granted without any tracks", kind);
                    }
                    let source = MediaSource::new(kind, tracks, self.hints.clone());
                    self.held.insert(kind, source.tracks().to_vec());
                    if kind == SourceKind::Camera {
                        self.bind_preview(&source);
                    }
                    acquisition.sources.push(source);
                }
                Err(e) if kind.is_video() => {
                    tracing::error!("Failed to acquire {}: {}", kind, e);
                    self.close(&acquisition.sources);
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!("Continuing without {}: {}", kind, e);
                    acquisition.warnings.push(AcquireWarning { kind, reason: e });
                }
            }
        }

        Ok(acquisition)
    }

    /// Stop the given sources. Idempotent.
    pub fn close(&mut self, sources: &[MediaSource]) {
        for source in sources {
            source.stop();

            if let Some(held) = self.held.get(&source.kind()) {
                let same = held
                    .iter()
                    .all(|t| source.tracks().iter().any(|s| s.id() == t.id()));
                if same {
                    self.held.remove(&source.kind());
                }
            }

            if source.kind() == SourceKind::Camera {
                self.clear_preview(source.id());
            }
        }
    }

    /// Stop everything this acquirer has handed out
    pub fn close_all(&mut self) {
        for (kind, tracks) in self.held.drain() {
            tracing::debug!("Releasing {} ({} tracks)", kind, tracks.len());
            for track in tracks {
                track.stop();
            }
        }
        self.preview_tx.send_replace(None);
    }

    /// Number of live tracks currently held for a kind
    pub fn live_tracks(&self, kind: SourceKind) -> usize {
        self.held
            .get(&kind)
            .map(|tracks| tracks.iter().filter(|t| t.is_live()).count())
            .unwrap_or(0)
    }

    fn release_kind(&mut self, kind: SourceKind) {
        if let Some(tracks) = self.held.remove(&kind) {
            tracing::info!("Stopping {} previous {} tracks before reopening", tracks.len(), kind);
            for track in tracks {
                track.stop();
            }
            if kind == SourceKind::Camera {
                self.preview_tx.send_replace(None);
            }
        }
    }

    fn bind_preview(&self, source: &MediaSource) {
        let binding = source.video_tracks().next().map(|track| PreviewBinding {
            source_id: source.id(),
            track_id: track.id().to_string(),
        });
        self.preview_tx.send_replace(binding);
    }

    fn clear_preview(&self, source_id: Uuid) {
        self.preview_tx.send_if_modified(|current| match current {
            Some(binding) if binding.source_id == source_id => {
                *current = None;
                true
            }
            _ => false,
        });
    }
}

impl Drop for DeviceAcquirer {
    fn drop(&mut self) {
        self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::SyntheticDevices;

    fn acquirer(devices: &Arc<SyntheticDevices>) -> DeviceAcquirer {
        DeviceAcquirer::new(devices.clone())
    }

    #[tokio::test]
    async fn test_reacquire_camera_stops_previous_tracks() {
        let devices = Arc::new(SyntheticDevices::new());
        let mut acquirer = acquirer(&devices);

        let first = acquirer.open(&[SourceKind::Camera]).await.unwrap();
        let first_camera = &first.sources[0];
        assert_eq!(first_camera.live_track_count(), 1);

        let second = acquirer.open(&[SourceKind::Camera]).await.unwrap();

        assert_eq!(first_camera.live_track_count(), 0);
        assert_eq!(second.sources[0].live_track_count(), 1);
        assert_eq!(acquirer.live_tracks(SourceKind::Camera), 1);
        assert_eq!(devices.live_tracks(SourceKind::Camera), 1);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let devices = Arc::new(SyntheticDevices::new());
        let mut acquirer = acquirer(&devices);

        let acquisition = acquirer
            .open(&[SourceKind::Camera, SourceKind::Microphone])
            .await
            .unwrap();

        acquirer.close(&acquisition.sources);
        acquirer.close(&acquisition.sources);

        assert_eq!(devices.total_live_tracks(), 0);
        assert_eq!(acquirer.live_tracks(SourceKind::Camera), 0);
    }

    #[tokio::test]
    async fn test_denied_microphone_is_a_warning() {
        let devices = Arc::new(SyntheticDevices::new().deny(SourceKind::Microphone));
        let mut acquirer = acquirer(&devices);

        let acquisition = acquirer
            .open(&[SourceKind::Camera, SourceKind::Microphone])
            .await
            .unwrap();

        assert_eq!(acquisition.sources.len(), 1);
        assert_eq!(acquisition.warnings.len(), 1);
        assert_eq!(acquisition.warnings[0].kind, SourceKind::Microphone);
        assert!(matches!(
            acquisition.warnings[0].reason,
            CaptureError::PermissionDenied(_)
        ));
    }

    #[tokio::test]
    async fn test_failed_screen_releases_partial_acquisition() {
        let devices = Arc::new(SyntheticDevices::new().unavailable(SourceKind::Screen));
        let mut acquirer = acquirer(&devices);

        let result = acquirer
            .open(&[SourceKind::Camera, SourceKind::Microphone, SourceKind::Screen])
            .await;

        assert!(matches!(result, Err(CaptureError::DeviceUnavailable(_))));
        assert_eq!(devices.total_live_tracks(), 0);
    }

    #[tokio::test]
    async fn test_preview_follows_camera() {
        let devices = Arc::new(SyntheticDevices::new());
        let mut acquirer = acquirer(&devices);
        let preview = acquirer.preview();

        let acquisition = acquirer.open(&[SourceKind::Camera]).await.unwrap();
        let binding = preview.borrow().clone().unwrap();
        assert_eq!(binding.source_id, acquisition.sources[0].id());

        acquirer.close(&acquisition.sources);
        assert!(preview.borrow().is_none());
    }
}
