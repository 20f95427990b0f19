//! Capture session
//!
//! Wraps a platform recorder around a composed stream and drives it through
//! the capture state machine. The session exclusively owns its stream and
//! sources; every exit path (stop, abort, failure, drop) releases them.

use super::channel::{MediaRecorder, RecordingError, RecordingResult};
use super::state::{ActiveSpan, CapturePlan, CaptureState, Recording};
use crate::capture::{AcquireWarning, DeviceAcquirer, MediaSource, SourceKind};
use crate::composer::{self, ComposedStream};
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

/// Events emitted during a capture session
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// State machine moved
    StateChanged(CaptureState),
    /// Recorder handed over a chunk
    ChunkReceived { index: usize, size: usize },
    /// The user stopped sharing the screen
    ExternalStop,
    /// Error occurred
    Error(String),
}

/// Read-only view of a session's state and elapsed-time origin
#[derive(Debug, Clone)]
pub struct SessionHandle {
    state: Arc<RwLock<CaptureState>>,
    origin: Arc<RwLock<Option<Instant>>>,
}

impl SessionHandle {
    pub fn state(&self) -> CaptureState {
        *self.state.read()
    }

    pub fn is_recording(&self) -> bool {
        self.state() == CaptureState::Recording
    }

    /// Time since the recording origin, if recording has started
    pub fn elapsed(&self) -> Option<Duration> {
        self.origin.read().map(|origin| origin.elapsed())
    }
}

/// Resolves once the user revokes a screen share
pub struct RevocationWatch {
    rx: watch::Receiver<bool>,
}

impl RevocationWatch {
    pub async fn wait(&mut self) {
        let closed = self.rx.wait_for(|revoked| *revoked).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }

    pub fn is_revoked(&self) -> bool {
        *self.rx.borrow()
    }
}

/// A single recording take
pub struct CaptureSession {
    id: Uuid,

    /// Current capture state
    state: Arc<RwLock<CaptureState>>,

    /// Elapsed-time origin, set by `start()`
    origin: Arc<RwLock<Option<Instant>>>,

    recorder: Box<dyn MediaRecorder>,
    stream: Option<ComposedStream>,
    sources: Vec<MediaSource>,

    /// Chunks in arrival order
    chunks: Arc<Mutex<Vec<Bytes>>>,
    collector: Option<JoinHandle<()>>,

    /// Recording spans (one per start/resume)
    spans: Vec<ActiveSpan>,

    revoked_tx: Arc<watch::Sender<bool>>,
    releasing: Arc<AtomicBool>,
    watchers: Vec<JoinHandle<()>>,
    external_stop_pending: bool,

    recording: Option<Recording>,

    /// Event broadcaster
    event_tx: broadcast::Sender<SessionEvent>,
}

impl CaptureSession {
    pub fn new(recorder: Box<dyn MediaRecorder>) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        let (revoked_tx, _) = watch::channel(false);
        Self {
            id: Uuid::new_v4(),
            state: Arc::new(RwLock::new(CaptureState::Idle)),
            origin: Arc::new(RwLock::new(None)),
            recorder,
            stream: None,
            sources: Vec::new(),
            chunks: Arc::new(Mutex::new(Vec::new())),
            collector: None,
            spans: Vec::new(),
            revoked_tx: Arc::new(revoked_tx),
            releasing: Arc::new(AtomicBool::new(false)),
            watchers: Vec::new(),
            external_stop_pending: false,
            recording: None,
            event_tx,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> CaptureState {
        *self.state.read()
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            state: self.state.clone(),
            origin: self.origin.clone(),
        }
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    pub fn revocation_watch(&self) -> RevocationWatch {
        RevocationWatch {
            rx: self.revoked_tx.subscribe(),
        }
    }

    pub fn stream(&self) -> Option<&ComposedStream> {
        self.stream.as_ref()
    }

    pub fn sources(&self) -> &[MediaSource] {
        &self.sources
    }

    pub fn spans(&self) -> &[ActiveSpan] {
        &self.spans
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.lock().len()
    }

    /// Live tracks still owned by this session
    pub fn live_track_count(&self) -> usize {
        let stream_tracks = self
            .stream
            .as_ref()
            .map(|s| {
                s.video_tracks().iter().filter(|t| t.is_live()).count()
                    + usize::from(s.audio_track().is_live())
            })
            .unwrap_or(0);
        stream_tracks + self.sources.iter().map(|s| s.live_track_count()).sum::<usize>()
    }

    /// Recorded time so far, paused spans excluded
    pub fn duration(&self) -> Duration {
        let now = self.elapsed_ms();
        let total_ms: f64 = self.spans.iter().map(|s| s.duration_ms(now)).sum();
        Duration::from_secs_f64(total_ms / 1000.0)
    }

    fn elapsed_ms(&self) -> f64 {
        self.origin
            .read()
            .map(|origin| origin.elapsed().as_secs_f64() * 1000.0)
            .unwrap_or(0.0)
    }

    fn set_state(&self, state: CaptureState) {
        *self.state.write() = state;
        tracing::debug!("Capture session {} -> {}", self.id, state);
        let _ = self.event_tx.send(SessionEvent::StateChanged(state));
    }

    /// Acquire the plan's devices and compose them into the session stream
    pub async fn acquire(
        &mut self,
        acquirer: &mut DeviceAcquirer,
        plan: &CapturePlan,
    ) -> RecordingResult<Vec<AcquireWarning>> {
        let state = self.state();
        if state != CaptureState::Idle {
            return Err(RecordingError::InvalidTransition {
                action: "acquire",
                state,
            });
        }

        self.set_state(CaptureState::Acquiring);

        let mut acquisition = match acquirer.open(&plan.kinds()).await {
            Ok(acquisition) => acquisition,
            Err(e) => {
                tracing::error!("Acquisition failed: {}", e);
                let _ = self.event_tx.send(SessionEvent::Error(e.to_string()));
                self.set_state(CaptureState::Failed);
                return Err(e.into());
            }
        };

        let warnings = std::mem::take(&mut acquisition.warnings);
        let video: Vec<MediaSource> = plan
            .video
            .iter()
            .filter_map(|&kind| acquisition.take(kind))
            .collect();
        let audio: Vec<MediaSource> = plan
            .audio
            .iter()
            .filter_map(|&kind| acquisition.take(kind))
            .collect();

        let stream = composer::compose(
            &video.iter().collect::<Vec<_>>(),
            &audio.iter().collect::<Vec<_>>(),
        );

        let mut sources = video;
        sources.extend(audio);
        self.prepare(stream, sources)?;

        Ok(warnings)
    }

    /// Take ownership of an already composed stream and its sources
    pub fn prepare(&mut self, stream: ComposedStream, sources: Vec<MediaSource>) -> RecordingResult<()> {
        let state = self.state();
        if !matches!(state, CaptureState::Idle | CaptureState::Acquiring) {
            let mut stream = stream;
            stream.stop();
            for source in &sources {
                source.stop();
            }
            return Err(RecordingError::InvalidTransition {
                action: "prepare",
                state,
            });
        }

        self.releasing.store(false, Ordering::SeqCst);
        for source in sources.iter().filter(|s| s.kind() == SourceKind::Screen) {
            for track in source.video_tracks() {
                self.watch_revocation(track.ended());
            }
        }

        self.stream = Some(stream);
        self.sources = sources;
        self.set_state(CaptureState::Previewing);
        Ok(())
    }

    fn watch_revocation(&mut self, mut ended: watch::Receiver<bool>) {
        let revoked_tx = self.revoked_tx.clone();
        let releasing = self.releasing.clone();
        let event_tx = self.event_tx.clone();

        self.watchers.push(tokio::spawn(async move {
            let ended_ok = ended.wait_for(|ended| *ended).await.is_ok();
            if ended_ok && !releasing.load(Ordering::SeqCst) {
                tracing::info!("Screen share stopped by the user");
                revoked_tx.send_replace(true);
                let _ = event_tx.send(SessionEvent::ExternalStop);
            }
        }));
    }

    /// Start recording
    pub async fn start(&mut self) -> RecordingResult<()> {
        let state = self.state();
        if !matches!(
            state,
            CaptureState::Idle | CaptureState::Acquiring | CaptureState::Previewing
        ) {
            return Err(RecordingError::InvalidTransition {
                action: "start",
                state,
            });
        }

        let stream = match &self.stream {
            Some(stream) if stream.has_live_tracks() => stream,
            _ => return Err(RecordingError::NoSourcesAvailable),
        };

        let mut rx = match self.recorder.start(stream).await {
            Ok(rx) => rx,
            Err(e) => {
                tracing::error!("Recorder failed to start: {}", e);
                self.release();
                self.set_state(CaptureState::Failed);
                return Err(e);
            }
        };

        let chunks = self.chunks.clone();
        let event_tx = self.event_tx.clone();
        self.collector = Some(tokio::spawn(async move {
            while let Some(chunk) = rx.recv().await {
                if chunk.is_empty() {
                    continue;
                }
                let size = chunk.len();
                let index = {
                    let mut chunks = chunks.lock();
                    chunks.push(chunk);
                    chunks.len() - 1
                };
                tracing::debug!("Chunk {} received ({} bytes)", index, size);
                let _ = event_tx.send(SessionEvent::ChunkReceived { index, size });
            }
        }));

        *self.origin.write() = Some(Instant::now());
        self.spans.clear();
        self.spans.push(ActiveSpan::new(0, 0.0));
        self.set_state(CaptureState::Recording);

        tracing::info!("Recording started ({})", self.recorder.mime_type());
        Ok(())
    }

    /// Pause recording. No-op unless recording.
    pub async fn pause(&mut self) -> RecordingResult<()> {
        if self.state() != CaptureState::Recording {
            tracing::debug!("Ignoring pause while {}", self.state());
            return Ok(());
        }

        tracing::info!("Pausing recording");

        self.recorder.pause().await?;

        let now = self.elapsed_ms();
        if let Some(span) = self.spans.last_mut() {
            span.end(now);
        }

        self.set_state(CaptureState::Paused);
        Ok(())
    }

    /// Resume recording. No-op unless paused.
    ///
    /// If the screen share was revoked while paused, this finalizes the
    /// recording instead; `stop()` then returns it.
    pub async fn resume(&mut self) -> RecordingResult<()> {
        if self.state() != CaptureState::Paused {
            tracing::debug!("Ignoring resume while {}", self.state());
            return Ok(());
        }

        if self.external_stop_pending {
            tracing::info!("Screen share ended while paused, finalizing");
            self.finalize().await?;
            return Ok(());
        }

        tracing::info!("Resuming recording");

        self.recorder.resume().await?;

        let index = self.spans.len();
        self.spans.push(ActiveSpan::new(index, self.elapsed_ms()));

        self.set_state(CaptureState::Recording);
        Ok(())
    }

    /// Stop recording and return the finalized blob.
    ///
    /// Always releases every owned track. Calling it again after completion
    /// returns the same recording.
    pub async fn stop(&mut self) -> RecordingResult<Recording> {
        if let Some(recording) = &self.recording {
            return Ok(recording.clone());
        }

        match self.state() {
            CaptureState::Recording | CaptureState::Paused => self.finalize().await,
            state => {
                self.release();
                if matches!(state, CaptureState::Acquiring | CaptureState::Previewing) {
                    tracing::info!("Stopped before recording, preview released");
                    self.set_state(CaptureState::Idle);
                }
                Err(RecordingError::NotRecording)
            }
        }
    }

    /// React to the user stopping the screen share.
    ///
    /// Recording finalizes immediately; a paused session finalizes on the next
    /// `resume()`.
    pub async fn handle_external_stop(&mut self) -> RecordingResult<Option<Recording>> {
        match self.state() {
            CaptureState::Recording => self.finalize().await.map(Some),
            CaptureState::Paused => {
                self.external_stop_pending = true;
                Ok(None)
            }
            _ => Ok(self.recording.clone()),
        }
    }

    /// Cancel the take: release everything and discard chunks
    pub async fn abort(&mut self) {
        let state = self.state();
        if state == CaptureState::Completed {
            return;
        }

        tracing::info!("Aborting capture session {} while {}", self.id, state);

        if self.recorder.is_recording() || state.is_active() {
            if let Err(e) = self.recorder.stop().await {
                tracing::warn!("Recorder did not stop cleanly: {}", e);
            }
        }
        if let Some(collector) = self.collector.take() {
            collector.abort();
        }
        self.chunks.lock().clear();
        self.release();
        self.set_state(CaptureState::Failed);
    }

    async fn finalize(&mut self) -> RecordingResult<Recording> {
        self.set_state(CaptureState::Finalizing);

        let now = self.elapsed_ms();
        if let Some(span) = self.spans.last_mut() {
            span.end(now);
        }

        let stop_result = self.recorder.stop().await;

        if let Some(collector) = self.collector.take() {
            if stop_result.is_ok() {
                if let Err(e) = collector.await {
                    tracing::error!("Chunk collector failed: {}", e);
                }
            } else {
                collector.abort();
            }
        }

        self.release();

        if let Err(e) = stop_result {
            tracing::error!("Recorder failed to finalize: {}", e);
            self.chunks.lock().clear();
            let _ = self.event_tx.send(SessionEvent::Error(e.to_string()));
            self.set_state(CaptureState::Failed);
            return Err(e);
        }

        let chunks = std::mem::take(&mut *self.chunks.lock());
        let mut data = BytesMut::with_capacity(chunks.iter().map(|c| c.len()).sum());
        for chunk in &chunks {
            data.extend_from_slice(chunk);
        }

        let recording = Recording {
            id: self.id,
            data: data.freeze(),
            mime_type: self.recorder.mime_type().to_string(),
            duration: self.duration(),
            created_at: Utc::now(),
            chunk_count: chunks.len(),
        };

        tracing::info!(
            "Recording finalized: {} chunks, {} bytes, {}ms",
            recording.chunk_count,
            recording.len(),
            recording.duration.as_millis()
        );

        self.recording = Some(recording.clone());
        self.set_state(CaptureState::Completed);
        Ok(recording)
    }

    /// Stop every owned track. Idempotent.
    fn release(&mut self) {
        self.releasing.store(true, Ordering::SeqCst);
        for watcher in self.watchers.drain(..) {
            watcher.abort();
        }
        if let Some(mut stream) = self.stream.take() {
            stream.stop();
        }
        for source in self.sources.drain(..) {
            source.stop();
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if let Some(collector) = self.collector.take() {
            collector.abort();
        }
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::channel::{RecorderFactory, RecorderOptions};
    use crate::synthetic::{SyntheticDevices, SyntheticRecorderFactory};
    use assert_matches::assert_matches;

    fn options() -> RecorderOptions {
        RecorderOptions {
            timeslice: Duration::from_secs(1),
            ..Default::default()
        }
    }

    async fn recording_session(devices: &Arc<SyntheticDevices>) -> (CaptureSession, DeviceAcquirer) {
        let mut acquirer = DeviceAcquirer::new(devices.clone());
        let mut session = CaptureSession::new(SyntheticRecorderFactory::new().create(&options()));
        session
            .acquire(&mut acquirer, &CapturePlan::camera_with_microphone())
            .await
            .unwrap();
        (session, acquirer)
    }

    #[tokio::test]
    async fn test_start_without_sources() {
        let mut session = CaptureSession::new(SyntheticRecorderFactory::new().create(&options()));
        assert_matches!(session.start().await, Err(RecordingError::NoSourcesAvailable));
        assert_eq!(session.state(), CaptureState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_releases_all_tracks() {
        let devices = Arc::new(SyntheticDevices::new());
        let (mut session, _acquirer) = recording_session(&devices).await;
        assert_eq!(session.state(), CaptureState::Previewing);

        session.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(2500)).await;

        let recording = session.stop().await.unwrap();
        assert_eq!(session.state(), CaptureState::Completed);
        assert_eq!(devices.total_live_tracks(), 0);
        assert_eq!(session.live_track_count(), 0);
        assert!(!recording.is_empty());

        let again = session.stop().await.unwrap();
        assert_eq!(again, recording);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_while_previewing_returns_to_idle() {
        let devices = Arc::new(SyntheticDevices::new());
        let (mut session, mut acquirer) = recording_session(&devices).await;

        assert_matches!(session.stop().await, Err(RecordingError::NotRecording));
        assert_eq!(session.state(), CaptureState::Idle);
        assert_eq!(session.live_track_count(), 0);
        assert_eq!(devices.total_live_tracks(), 0);
        assert!(session.stream().is_none());

        session
            .acquire(&mut acquirer, &CapturePlan::camera_with_microphone())
            .await
            .unwrap();
        session.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!session.stop().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_keeps_chunks_and_excludes_paused_time() {
        let devices = Arc::new(SyntheticDevices::new());
        let (mut session, _acquirer) = recording_session(&devices).await;

        session.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        session.pause().await.unwrap();
        let before_pause = session.chunk_count();
        assert_eq!(before_pause, 2);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(session.chunk_count(), before_pause);

        session.resume().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        let recording = session.stop().await.unwrap();
        assert_eq!(recording.chunk_count, 4);
        let millis = recording.duration.as_millis() as i64;
        assert!((millis - 4000).abs() <= 20, "duration was {}ms", millis);
        assert_eq!(session.spans().len(), 2);
    }

    #[tokio::test]
    async fn test_pause_and_resume_are_noops_outside_recording() {
        let devices = Arc::new(SyntheticDevices::new());
        let (mut session, _acquirer) = recording_session(&devices).await;

        session.pause().await.unwrap();
        session.resume().await.unwrap();
        assert_eq!(session.state(), CaptureState::Previewing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_discards_chunks() {
        let devices = Arc::new(SyntheticDevices::new());
        let (mut session, _acquirer) = recording_session(&devices).await;

        session.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(3500)).await;
        session.abort().await;

        assert_eq!(session.state(), CaptureState::Failed);
        assert_eq!(session.chunk_count(), 0);
        assert_eq!(devices.total_live_tracks(), 0);
        assert_matches!(session.stop().await, Err(RecordingError::NotRecording));
    }

    #[tokio::test(start_paused = true)]
    async fn test_screen_revocation_finalizes() {
        let devices = Arc::new(SyntheticDevices::new());
        let mut acquirer = DeviceAcquirer::new(devices.clone());
        let mut session = CaptureSession::new(SyntheticRecorderFactory::new().create(&options()));
        session
            .acquire(&mut acquirer, &CapturePlan::feedback())
            .await
            .unwrap();
        let mut revoked = session.revocation_watch();

        session.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        devices.revoke(SourceKind::Screen);

        revoked.wait().await;
        let recording = session.handle_external_stop().await.unwrap();

        assert!(recording.is_some());
        assert_eq!(session.state(), CaptureState::Completed);
        assert_eq!(devices.total_live_tracks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_revocation_while_paused_finalizes_on_resume() {
        let devices = Arc::new(SyntheticDevices::new());
        let mut acquirer = DeviceAcquirer::new(devices.clone());
        let mut session = CaptureSession::new(SyntheticRecorderFactory::new().create(&options()));
        session
            .acquire(&mut acquirer, &CapturePlan::feedback())
            .await
            .unwrap();
        let mut revoked = session.revocation_watch();

        session.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1200)).await;
        session.pause().await.unwrap();

        devices.revoke(SourceKind::Screen);
        revoked.wait().await;
        assert_eq!(session.handle_external_stop().await.unwrap(), None);
        assert_eq!(session.state(), CaptureState::Paused);

        session.resume().await.unwrap();
        assert_eq!(session.state(), CaptureState::Completed);
        assert!(session.stop().await.is_ok());
    }

    #[tokio::test]
    async fn test_own_stop_is_not_a_revocation() {
        let devices = Arc::new(SyntheticDevices::new());
        let mut acquirer = DeviceAcquirer::new(devices.clone());
        let mut session = CaptureSession::new(SyntheticRecorderFactory::new().create(&options()));
        session
            .acquire(&mut acquirer, &CapturePlan::feedback())
            .await
            .unwrap();
        let revoked = session.revocation_watch();

        session.start().await.unwrap();
        session.stop().await.unwrap();
        tokio::task::yield_now().await;

        assert!(!revoked.is_revoked());
    }

    #[tokio::test]
    async fn test_failed_acquisition_leaves_nothing_open() {
        let devices = Arc::new(SyntheticDevices::new().deny(SourceKind::Camera));
        let mut acquirer = DeviceAcquirer::new(devices.clone());
        let mut session = CaptureSession::new(SyntheticRecorderFactory::new().create(&options()));

        let result = session
            .acquire(&mut acquirer, &CapturePlan::camera_with_microphone())
            .await;

        assert_matches!(result, Err(RecordingError::Capture(_)));
        assert_eq!(session.state(), CaptureState::Failed);
        assert_eq!(devices.total_live_tracks(), 0);
    }

    #[tokio::test]
    async fn test_events_report_transitions() {
        let devices = Arc::new(SyntheticDevices::new());
        let (mut session, _acquirer) = recording_session(&devices).await;
        let mut events = session.subscribe();

        session.start().await.unwrap();

        assert_matches!(
            events.recv().await,
            Ok(SessionEvent::StateChanged(CaptureState::Recording))
        );
    }
}
