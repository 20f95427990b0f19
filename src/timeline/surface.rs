//! Stills taken from a live video track

use super::{RenderedStill, TimelineError, TimelineResult, VisualSurface};
use crate::capture::{TrackRef, VideoFrame};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Renders the most recent frame of a video track
pub struct TrackSurface {
    latest: Arc<Mutex<Option<VideoFrame>>>,
    task: JoinHandle<()>,
}

impl TrackSurface {
    pub fn new(track: &TrackRef) -> TimelineResult<Self> {
        let mut feed = track
            .video_feed()
            .ok_or_else(|| TimelineError::Render(format!("track {} carries no frames", track.label())))?;

        let latest = Arc::new(Mutex::new(None));
        let slot = latest.clone();
        let task = tokio::spawn(async move {
            loop {
                match feed.recv().await {
                    Ok(frame) if frame.is_rgb24() => *slot.lock() = Some(frame),
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(Self { latest, task })
    }
}

impl VisualSurface for TrackSurface {
    fn render(&self) -> TimelineResult<RenderedStill> {
        let frame = self
            .latest
            .lock()
            .clone()
            .ok_or_else(|| TimelineError::Render("no frame captured yet".into()))?;

        let rgba = frame
            .data
            .chunks_exact(3)
            .flat_map(|px| [px[0], px[1], px[2], 255])
            .collect();
        Ok(RenderedStill {
            width: frame.width,
            height: frame.height,
            rgba,
        })
    }
}

impl Drop for TrackSurface {
    fn drop(&mut self) {
        self.task.abort();
    }
}
