//! Practice bundle schema
//!
//! On-disk JSON documents of a practice bundle.

use crate::practice::QuestionSet;
use crate::segments::Segment;
use crate::timeline::Snapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const BUNDLE_FORMAT: &str = "mockview-v1";

// =============================================================================
// Meta
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleMeta {
    pub version: String,
    pub format: String,
    pub created_at: DateTime<Utc>,
    pub recording_id: Uuid,
    /// File name of the recording inside the bundle
    pub recording_file: String,
    pub mime_type: String,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question_set: Option<QuestionSet>,
}

impl BundleMeta {
    pub fn new(recording_id: Uuid, recording_file: String, mime_type: String, duration_ms: u64) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            format: BUNDLE_FORMAT.to_string(),
            created_at: Utc::now(),
            recording_id,
            recording_file,
            mime_type,
            duration_ms,
            question_set: None,
        }
    }
}

// =============================================================================
// Timeline
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEntry {
    pub timestamp_ms: f64,
    pub event_index: usize,
    /// Relative path of the still, e.g. `snapshots/snapshot-000.png`
    pub still: String,
}

impl TimelineEntry {
    pub fn from_snapshot(position: usize, snapshot: &Snapshot) -> Self {
        Self {
            timestamp_ms: snapshot.timestamp_ms,
            event_index: snapshot.event_index,
            still: format!("snapshots/snapshot-{:03}.png", position),
        }
    }
}

// =============================================================================
// Segments
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentEntry {
    pub id: Uuid,
    pub start_time: f64,
    pub end_time: f64,
    pub note: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback_file: Option<String>,
}

impl SegmentEntry {
    pub fn from_segment(segment: &Segment) -> Self {
        Self {
            id: segment.id,
            start_time: segment.start_time,
            end_time: segment.end_time,
            note: segment.note.clone(),
            feedback_file: segment
                .feedback_recording
                .as_ref()
                .map(|r| format!("feedback/{}.{}", segment.id, r.extension())),
        }
    }
}
