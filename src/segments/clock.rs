//! Clock-driven playback
//!
//! A headless transport for a source that has no player of its own (a local
//! file reviewed from the command line, or a host that only reports position).
//! Position advances with the runtime clock while playing and stops at the
//! source duration.

use super::player::{PlaybackSource, PlayerState};
use crate::export::{locate_ffmpeg, inspect_media};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::Path;
use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Debug)]
struct Position {
    /// Position when playback last started or seeked
    anchor: f64,
    playing_since: Option<Instant>,
}

/// Source player advancing in real (tokio) time
#[derive(Debug)]
pub struct ClockPlayer {
    duration: f64,
    position: Mutex<Position>,
    state_tx: watch::Sender<PlayerState>,
}

impl ClockPlayer {
    /// A loaded player, ready to play
    pub fn new(duration: f64) -> Self {
        Self::with_state(duration, PlayerState::Ready)
    }

    /// A player still loading; call [`ClockPlayer::mark_ready`]
    pub fn unstarted(duration: f64) -> Self {
        Self::with_state(duration, PlayerState::Unstarted)
    }

    /// A player for a local media file, sized from the file's duration
    pub async fn for_media(ffmpeg: Option<&Path>, path: &Path) -> Result<Self, String> {
        let binary = locate_ffmpeg(ffmpeg).map_err(|e| e.to_string())?;
        let info = inspect_media(&binary, path).await.map_err(|e| e.to_string())?;
        let duration = info
            .duration
            .ok_or_else(|| format!("{:?} has no known duration", path))?;
        tracing::debug!("Source {:?} is {:.2}s long", path, duration.as_secs_f64());
        Ok(Self::new(duration.as_secs_f64()))
    }

    fn with_state(duration: f64, state: PlayerState) -> Self {
        let (state_tx, _) = watch::channel(state);
        Self {
            duration,
            position: Mutex::new(Position {
                anchor: 0.0,
                playing_since: None,
            }),
            state_tx,
        }
    }

    pub fn mark_ready(&self) {
        self.state_tx.send_replace(PlayerState::Ready);
    }

    pub fn is_playing(&self) -> bool {
        self.position.lock().playing_since.is_some() && *self.state_tx.borrow() == PlayerState::Playing
    }

    fn position_of(&self, position: &Position) -> f64 {
        let elapsed = position
            .playing_since
            .map(|since| since.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        (position.anchor + elapsed).min(self.duration)
    }
}

#[async_trait]
impl PlaybackSource for ClockPlayer {
    async fn seek(&self, seconds: f64) -> Result<(), String> {
        if !(0.0..=self.duration).contains(&seconds) {
            return Err(format!("seek to {:.2}s outside 0..{:.2}s", seconds, self.duration));
        }
        let mut position = self.position.lock();
        position.anchor = seconds;
        if position.playing_since.is_some() {
            position.playing_since = Some(Instant::now());
        }
        Ok(())
    }

    async fn play(&self) -> Result<(), String> {
        if *self.state_tx.borrow() == PlayerState::Unstarted {
            return Err("player has not loaded".to_string());
        }
        let mut position = self.position.lock();
        if position.playing_since.is_none() {
            position.playing_since = Some(Instant::now());
        }
        self.state_tx.send_replace(PlayerState::Playing);
        Ok(())
    }

    async fn pause(&self) -> Result<(), String> {
        let mut position = self.position.lock();
        position.anchor = self.position_of(&position);
        position.playing_since = None;
        if *self.state_tx.borrow() == PlayerState::Playing {
            self.state_tx.send_replace(PlayerState::Paused);
        }
        Ok(())
    }

    fn current_time(&self) -> f64 {
        let mut position = self.position.lock();
        let current = self.position_of(&position);
        if position.playing_since.is_some() && current >= self.duration {
            position.anchor = self.duration;
            position.playing_since = None;
            self.state_tx.send_replace(PlayerState::Ended);
        }
        current
    }

    fn duration(&self) -> f64 {
        self.duration
    }

    fn state_changes(&self) -> watch::Receiver<PlayerState> {
        self.state_tx.subscribe()
    }
}
