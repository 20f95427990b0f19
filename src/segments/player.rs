//! Source video playback trait
//!
//! The segment manager drives an externally hosted player (an embedded video
//! host) through this interface.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Player state as reported by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerState {
    Unstarted,
    Ready,
    Buffering,
    Playing,
    Paused,
    Ended,
}

/// Externally hosted source video
#[async_trait]
pub trait PlaybackSource: Send + Sync {
    async fn seek(&self, seconds: f64) -> Result<(), String>;

    async fn play(&self) -> Result<(), String>;

    async fn pause(&self) -> Result<(), String>;

    /// Current playback position in seconds
    fn current_time(&self) -> f64;

    /// Total duration in seconds
    fn duration(&self) -> f64;

    /// Ready/state-change events
    fn state_changes(&self) -> watch::Receiver<PlayerState>;
}
