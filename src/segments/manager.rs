//! Segment manager
//!
//! Marks start/end points on a source video, stores them as segments and
//! plays any segment back by polling the player position.

use super::player::{PlaybackSource, PlayerState};
use crate::config::SegmentsConfig;
use crate::recorder::Recording;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Segment errors
#[derive(Error, Debug)]
pub enum SegmentError {
    #[error("Invalid range: {0}")]
    InvalidRange(String),

    #[error("Segment limit of {0} reached")]
    SegmentLimitExceeded(usize),

    #[error("Segment not found: {0}")]
    NotFound(Uuid),

    #[error("Playback error: {0}")]
    Playback(String),

    #[error("Playback cancelled")]
    Cancelled,
}

pub type SegmentResult<T> = Result<T, SegmentError>;

/// A time-bounded slice of the source video
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub id: Uuid,
    /// Seconds, source-relative
    pub start_time: f64,
    /// Seconds, source-relative, always greater than `start_time`
    pub end_time: f64,
    pub note: String,
    #[serde(skip)]
    pub feedback_recording: Option<Recording>,
}

impl Segment {
    pub fn duration(&self) -> f64 {
        self.end_time - self.start_time
    }

    pub fn has_feedback(&self) -> bool {
        self.feedback_recording.is_some()
    }
}

/// Segment manager settings
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentConfig {
    pub max_segments: usize,
    pub poll_interval: Duration,
    /// Overshoot past the end beyond which playback is logged as late
    pub tolerance: Duration,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            max_segments: 3,
            poll_interval: Duration::from_millis(100),
            tolerance: Duration::from_millis(250),
        }
    }
}

impl From<&SegmentsConfig> for SegmentConfig {
    fn from(config: &SegmentsConfig) -> Self {
        Self {
            max_segments: config.max_segments,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            tolerance: Duration::from_millis(config.boundary_tolerance_ms),
        }
    }
}

/// Where segment playback stopped
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackOutcome {
    pub stopped_at: f64,
    /// Seconds played past the segment end
    pub overshoot: f64,
}

pub struct SegmentManager {
    player: Arc<dyn PlaybackSource>,
    config: SegmentConfig,
    segments: Vec<Segment>,
    pending_start: Option<f64>,
}

impl SegmentManager {
    pub fn new(player: Arc<dyn PlaybackSource>, config: SegmentConfig) -> Self {
        Self {
            player,
            config,
            segments: Vec::new(),
            pending_start: None,
        }
    }

    pub fn config(&self) -> &SegmentConfig {
        &self.config
    }

    /// Wait until the player reports it has loaded
    pub async fn wait_ready(&self) -> SegmentResult<()> {
        let mut states = self.player.state_changes();
        let closed = states
            .wait_for(|state| *state != PlayerState::Unstarted)
            .await
            .is_err();
        if closed {
            return Err(SegmentError::Playback("player went away before it was ready".into()));
        }
        Ok(())
    }

    /// Capture the current position as the pending start
    pub fn mark_start(&mut self) -> f64 {
        let position = self.player.current_time();
        tracing::debug!("Pending segment start at {:.2}s", position);
        self.pending_start = Some(position);
        position
    }

    pub fn pending_start(&self) -> Option<f64> {
        self.pending_start
    }

    pub fn clear_pending(&mut self) {
        self.pending_start = None;
    }

    /// Close the pending segment at the current position
    pub fn mark_end(&mut self, note: impl Into<String>) -> SegmentResult<Segment> {
        let start = self
            .pending_start
            .ok_or_else(|| SegmentError::InvalidRange("no start point marked".into()))?;

        let end = self.player.current_time();
        if end <= start {
            return Err(SegmentError::InvalidRange(format!(
                "end {:.2}s must be after start {:.2}s",
                end, start
            )));
        }

        if self.segments.len() >= self.config.max_segments {
            return Err(SegmentError::SegmentLimitExceeded(self.config.max_segments));
        }

        let segment = Segment {
            id: Uuid::new_v4(),
            start_time: start,
            end_time: end,
            note: note.into(),
            feedback_recording: None,
        };

        tracing::info!(
            "Segment {} created: {:.2}s - {:.2}s",
            segment.id,
            segment.start_time,
            segment.end_time
        );

        self.segments.push(segment.clone());
        self.pending_start = None;
        Ok(segment)
    }

    pub fn list(&self) -> &[Segment] {
        &self.segments
    }

    pub fn get(&self, id: Uuid) -> SegmentResult<&Segment> {
        self.segments
            .iter()
            .find(|s| s.id == id)
            .ok_or(SegmentError::NotFound(id))
    }

    pub fn delete(&mut self, id: Uuid) -> SegmentResult<Segment> {
        let index = self
            .segments
            .iter()
            .position(|s| s.id == id)
            .ok_or(SegmentError::NotFound(id))?;
        tracing::info!("Segment {} deleted", id);
        Ok(self.segments.remove(index))
    }

    /// Attach a feedback take, returning the one it replaced
    pub fn attach_feedback(&mut self, id: Uuid, recording: Recording) -> SegmentResult<Option<Recording>> {
        let segment = self
            .segments
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(SegmentError::NotFound(id))?;
        Ok(segment.feedback_recording.replace(recording))
    }

    /// Feedback takes in segment order
    pub fn feedback_recordings(&self) -> Vec<Recording> {
        self.segments
            .iter()
            .filter_map(|s| s.feedback_recording.clone())
            .collect()
    }

    /// Play a segment from its start and pause once the end is reached.
    pub async fn play(&self, id: Uuid, cancel: &CancellationToken) -> SegmentResult<PlaybackOutcome> {
        let (start, end) = {
            let segment = self.get(id)?;
            (segment.start_time, segment.end_time)
        };

        tracing::info!("Playing segment {} ({:.2}s - {:.2}s)", id, start, end);

        self.player.seek(start).await.map_err(SegmentError::Playback)?;
        self.player.play().await.map_err(SegmentError::Playback)?;

        let states = self.player.state_changes();
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.halt().await?;
                    return Err(SegmentError::Cancelled);
                }
                _ = ticker.tick() => {
                    let position = self.player.current_time();
                    let ended = *states.borrow() == PlayerState::Ended;
                    tracing::trace!("Segment {} at {:.3}s", id, position);

                    if position >= end || ended {
                        self.player.pause().await.map_err(SegmentError::Playback)?;

                        let overshoot = (position - end).max(0.0);
                        if overshoot > self.config.tolerance.as_secs_f64() {
                            tracing::warn!("Segment {} overshot its end by {:.3}s", id, overshoot);
                        }
                        return Ok(PlaybackOutcome {
                            stopped_at: position,
                            overshoot,
                        });
                    }
                }
            }
        }
    }

    /// Pause the player
    pub async fn halt(&self) -> SegmentResult<()> {
        self.player.pause().await.map_err(SegmentError::Playback)
    }
}
