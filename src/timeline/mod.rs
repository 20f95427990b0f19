//! Timeline synchronizer
//!
//! Correlates UI events (e.g. "question changed") with the elapsed time of an
//! active capture session and keeps an ordered log of rendered stills.

mod surface;

pub use surface::TrackSurface;

use crate::recorder::SessionHandle;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Timeline errors
#[derive(Error, Debug)]
pub enum TimelineError {
    #[error("Failed to render visual surface: {0}")]
    Render(String),

    #[error("PNG encode error: {0}")]
    Encode(#[from] png::EncodingError),

    #[error("Invalid still: expected {expected} bytes, got {actual}")]
    InvalidStill { expected: usize, actual: usize },
}

pub type TimelineResult<T> = Result<T, TimelineError>;

/// Raw RGBA still of the visual surface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedStill {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

/// Something that can be rendered to a still (the question card, the page)
pub trait VisualSurface: Send + Sync {
    fn render(&self) -> TimelineResult<RenderedStill>;
}

/// One tracked UI event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Milliseconds since the recording origin
    pub timestamp_ms: f64,
    pub event_index: usize,
    /// PNG encoded still
    #[serde(skip)]
    pub visual: Vec<u8>,
}

pub struct TimelineSynchronizer {
    session: SessionHandle,
    surface: Arc<dyn VisualSurface>,
    snapshots: Vec<Snapshot>,
}

impl TimelineSynchronizer {
    pub fn new(session: SessionHandle, surface: Arc<dyn VisualSurface>) -> Self {
        Self {
            session,
            surface,
            snapshots: Vec::new(),
        }
    }

    /// Record a snapshot for `event_index` if the session is recording.
    ///
    /// Returns `None` when the session is not in the Recording state.
    pub fn on_event(&mut self, event_index: usize) -> TimelineResult<Option<&Snapshot>> {
        if !self.session.is_recording() {
            tracing::debug!("Ignoring event {} outside recording", event_index);
            return Ok(None);
        }

        let Some(elapsed) = self.session.elapsed() else {
            return Ok(None);
        };

        let mut timestamp_ms = elapsed.as_secs_f64() * 1000.0;
        if let Some(last) = self.snapshots.last() {
            // Clock resolution: keep timestamps strictly increasing.
            if timestamp_ms <= last.timestamp_ms {
                timestamp_ms = last.timestamp_ms + 0.001;
            }
        }

        let still = self.surface.render()?;
        let visual = encode_png(&still)?;

        tracing::debug!(
            "Snapshot for event {} at {:.1}ms ({} bytes)",
            event_index,
            timestamp_ms,
            visual.len()
        );

        self.snapshots.push(Snapshot {
            timestamp_ms,
            event_index,
            visual,
        });
        Ok(self.snapshots.last())
    }

    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }

    pub fn into_snapshots(self) -> Vec<Snapshot> {
        self.snapshots
    }
}

/// Encode an RGBA still as PNG
pub fn encode_png(still: &RenderedStill) -> TimelineResult<Vec<u8>> {
    let expected = still.width as usize * still.height as usize * 4;
    if still.rgba.len() != expected {
        return Err(TimelineError::InvalidStill {
            expected,
            actual: still.rgba.len(),
        });
    }

    let mut out = Vec::new();
    {
        let mut encoder = png::Encoder::new(&mut out, still.width, still.height);
        encoder.set_color(png::ColorType::Rgba);
        encoder.set_depth(png::BitDepth::Eight);
        let mut writer = encoder.write_header()?;
        writer.write_image_data(&still.rgba)?;
    }
    Ok(out)
}
