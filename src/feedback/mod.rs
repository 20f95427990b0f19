//! Feedback recorder
//!
//! Records a user's reaction to a segment: the segment plays while the
//! screen, camera and microphone are captured, then recording continues for a
//! bounded countdown. The finished take is attached to the segment.

use crate::capture::{AcquireWarning, DeviceAcquirer};
use crate::config::FeedbackSection;
use crate::recorder::{
    CapturePlan, CaptureSession, RecorderFactory, RecorderOptions, Recording, RecordingError,
};
use crate::segments::{SegmentError, SegmentManager};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum FeedbackError {
    #[error(transparent)]
    Segment(#[from] SegmentError),

    #[error(transparent)]
    Recording(#[from] RecordingError),

    #[error("Feedback take aborted")]
    Aborted,
}

pub type FeedbackResult<T> = Result<T, FeedbackError>;

#[derive(Debug, Clone, PartialEq)]
pub struct FeedbackConfig {
    /// How long the reaction keeps recording after the segment finished
    pub countdown: Duration,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            countdown: Duration::from_secs(60),
        }
    }
}

impl From<&FeedbackSection> for FeedbackConfig {
    fn from(section: &FeedbackSection) -> Self {
        Self {
            countdown: Duration::from_secs(section.countdown_secs),
        }
    }
}

/// Progress of a feedback take
#[derive(Debug, Clone, PartialEq)]
pub enum FeedbackEvent {
    Acquired { segment_id: Uuid },
    AcquireWarning(AcquireWarning),
    PlaybackStarted { segment_id: Uuid },
    PlaybackFinished { segment_id: Uuid },
    Countdown { remaining: Duration },
    Finalized { segment_id: Uuid, recording_id: Uuid },
}

/// Why a take ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// The countdown ran out
    Timeout,
    /// The user asked to stop
    Stopped,
    /// The user stopped sharing the screen
    ScreenShareEnded,
}

/// Caller-side controls for a running take
#[derive(Debug, Clone, Default)]
pub struct FeedbackControl {
    /// Finish the take early and keep it
    pub stop: CancellationToken,
    /// Discard the take
    pub abort: CancellationToken,
}

#[derive(Debug, Clone)]
pub struct FeedbackOutcome {
    pub recording: Recording,
    pub reason: FinishReason,
}

enum Phase {
    Finished,
    Stopped,
    Revoked,
    Aborted,
    TimedOut,
}

pub struct FeedbackRecorder {
    acquirer: DeviceAcquirer,
    recorders: Arc<dyn RecorderFactory>,
    options: RecorderOptions,
    config: FeedbackConfig,
    event_tx: broadcast::Sender<FeedbackEvent>,
}

impl FeedbackRecorder {
    pub fn new(
        acquirer: DeviceAcquirer,
        recorders: Arc<dyn RecorderFactory>,
        options: RecorderOptions,
        config: FeedbackConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            acquirer,
            recorders,
            options,
            config,
            event_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FeedbackEvent> {
        self.event_tx.subscribe()
    }

    pub fn acquirer(&self) -> &DeviceAcquirer {
        &self.acquirer
    }

    fn emit(&self, event: FeedbackEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Record a reaction to `segment_id` and attach it to the segment
    pub async fn record(
        &mut self,
        segments: &mut SegmentManager,
        segment_id: Uuid,
        control: &FeedbackControl,
    ) -> FeedbackResult<FeedbackOutcome> {
        segments.get(segment_id)?;

        let mut session = CaptureSession::new(self.recorders.create(&self.options));
        let warnings = session
            .acquire(&mut self.acquirer, &CapturePlan::feedback())
            .await?;
        for warning in warnings {
            self.emit(FeedbackEvent::AcquireWarning(warning));
        }
        self.emit(FeedbackEvent::Acquired { segment_id });

        session.start().await?;
        let mut revoked = session.revocation_watch();

        self.emit(FeedbackEvent::PlaybackStarted { segment_id });
        let playback_cancel = control.abort.child_token();

        let phase = tokio::select! {
            biased;
            _ = control.abort.cancelled() => Phase::Aborted,
            _ = revoked.wait() => Phase::Revoked,
            _ = control.stop.cancelled() => Phase::Stopped,
            result = segments.play(segment_id, &playback_cancel) => match result {
                Ok(outcome) => {
                    tracing::debug!("Segment playback stopped at {:.2}s", outcome.stopped_at);
                    Phase::Finished
                }
                Err(e) => {
                    session.abort().await;
                    return Err(e.into());
                }
            },
        };

        let phase = match phase {
            Phase::Finished => {
                self.emit(FeedbackEvent::PlaybackFinished { segment_id });
                self.countdown(control, &mut revoked).await
            }
            other => {
                segments.halt().await.ok();
                other
            }
        };

        let (recording, reason) = match phase {
            Phase::Aborted => {
                tracing::info!("Feedback take for {} aborted", segment_id);
                session.abort().await;
                return Err(FeedbackError::Aborted);
            }
            Phase::Revoked => {
                let recording = match session.handle_external_stop().await? {
                    Some(recording) => recording,
                    None => session.stop().await?,
                };
                (recording, FinishReason::ScreenShareEnded)
            }
            Phase::Stopped => (session.stop().await?, FinishReason::Stopped),
            Phase::TimedOut | Phase::Finished => (session.stop().await?, FinishReason::Timeout),
        };

        segments.attach_feedback(segment_id, recording.clone())?;
        self.emit(FeedbackEvent::Finalized {
            segment_id,
            recording_id: recording.id,
        });

        tracing::info!(
            "Feedback for segment {} recorded ({:?}, {}ms)",
            segment_id,
            reason,
            recording.duration.as_millis()
        );

        Ok(FeedbackOutcome { recording, reason })
    }

    async fn countdown(
        &self,
        control: &FeedbackControl,
        revoked: &mut crate::recorder::RevocationWatch,
    ) -> Phase {
        let deadline = Instant::now() + self.config.countdown;
        let mut ticker = tokio::time::interval(Duration::from_secs(1));

        loop {
            tokio::select! {
                biased;
                _ = control.abort.cancelled() => return Phase::Aborted,
                _ = revoked.wait() => return Phase::Revoked,
                _ = control.stop.cancelled() => return Phase::Stopped,
                _ = tokio::time::sleep_until(deadline) => return Phase::TimedOut,
                _ = ticker.tick() => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    self.emit(FeedbackEvent::Countdown { remaining });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::SourceKind;
    use crate::segments::{PlaybackSource, SegmentConfig};
    use crate::segments::ClockPlayer;
    use crate::synthetic::{SyntheticDevices, SyntheticRecorderFactory};
    use assert_matches::assert_matches;

    struct Fixture {
        devices: Arc<SyntheticDevices>,
        player: Arc<ClockPlayer>,
        segments: SegmentManager,
        recorder: FeedbackRecorder,
        segment_id: Uuid,
    }

    async fn fixture(devices: SyntheticDevices) -> Fixture {
        let devices = Arc::new(devices);
        let player = Arc::new(ClockPlayer::new(120.0));
        let mut segments = SegmentManager::new(player.clone(), SegmentConfig::default());

        player.seek(10.0).await.unwrap();
        segments.mark_start();
        player.seek(15.0).await.unwrap();
        let segment_id = segments.mark_end("intro").unwrap().id;

        let recorder = FeedbackRecorder::new(
            DeviceAcquirer::new(devices.clone()),
            Arc::new(SyntheticRecorderFactory::new()),
            RecorderOptions::default(),
            FeedbackConfig {
                countdown: Duration::from_secs(10),
            },
        );

        Fixture {
            devices,
            player,
            segments,
            recorder,
            segment_id,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_countdown_timeout_attaches_take() {
        let mut f = fixture(SyntheticDevices::new()).await;
        let mut events = f.recorder.subscribe();

        let outcome = f
            .recorder
            .record(&mut f.segments, f.segment_id, &FeedbackControl::default())
            .await
            .unwrap();

        assert_eq!(outcome.reason, FinishReason::Timeout);
        let millis = outcome.recording.duration.as_millis() as i64;
        assert!((millis - 15_000).abs() <= 150, "duration was {}ms", millis);
        assert!(f.segments.get(f.segment_id).unwrap().has_feedback());
        assert_eq!(f.devices.total_live_tracks(), 0);
        assert!(!f.player.is_playing());

        let mut saw_countdown = false;
        let mut saw_finalized = false;
        while let Ok(event) = events.try_recv() {
            match event {
                FeedbackEvent::Countdown { .. } => saw_countdown = true,
                FeedbackEvent::Finalized { .. } => saw_finalized = true,
                _ => {}
            }
        }
        assert!(saw_countdown);
        assert!(saw_finalized);
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_stop_during_countdown() {
        let mut f = fixture(SyntheticDevices::new()).await;
        let control = FeedbackControl::default();

        let stop = control.stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(7)).await;
            stop.cancel();
        });

        let outcome = f
            .recorder
            .record(&mut f.segments, f.segment_id, &control)
            .await
            .unwrap();

        assert_eq!(outcome.reason, FinishReason::Stopped);
        assert!(outcome.recording.duration < Duration::from_secs(8));
        assert_eq!(f.devices.total_live_tracks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_discards_take() {
        let mut f = fixture(SyntheticDevices::new()).await;
        let control = FeedbackControl::default();

        let abort = control.abort.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            abort.cancel();
        });

        let result = f
            .recorder
            .record(&mut f.segments, f.segment_id, &control)
            .await;

        assert_matches!(result, Err(FeedbackError::Aborted));
        assert!(!f.segments.get(f.segment_id).unwrap().has_feedback());
        assert_eq!(f.devices.total_live_tracks(), 0);
        assert!(!f.player.is_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_screen_share_revoked_finalizes() {
        let mut f = fixture(SyntheticDevices::new()).await;
        let devices = f.devices.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            devices.revoke(SourceKind::Screen);
        });

        let outcome = f
            .recorder
            .record(&mut f.segments, f.segment_id, &FeedbackControl::default())
            .await
            .unwrap();

        assert_eq!(outcome.reason, FinishReason::ScreenShareEnded);
        assert!(f.segments.get(f.segment_id).unwrap().has_feedback());
        assert_eq!(f.devices.total_live_tracks(), 0);
    }

    #[tokio::test]
    async fn test_denied_screen_leaves_nothing_open() {
        let mut f = fixture(SyntheticDevices::new().deny(SourceKind::Screen)).await;

        let result = f
            .recorder
            .record(&mut f.segments, f.segment_id, &FeedbackControl::default())
            .await;

        assert_matches!(
            result,
            Err(FeedbackError::Recording(RecordingError::Capture(_)))
        );
        assert_eq!(f.devices.total_live_tracks(), 0);
    }

    #[tokio::test]
    async fn test_unknown_segment() {
        let mut f = fixture(SyntheticDevices::new()).await;

        let result = f
            .recorder
            .record(&mut f.segments, Uuid::new_v4(), &FeedbackControl::default())
            .await;

        assert_matches!(result, Err(FeedbackError::Segment(SegmentError::NotFound(_))));
        assert_eq!(f.devices.total_live_tracks(), 0);
    }
}
