//! Practice bundle read/write operations
//!
//! A bundle is a directory containing:
//! - meta.json: Version and recording metadata
//! - recording.<ext>: The finished take
//! - timeline.json: Question changes with their recording timestamps
//! - snapshots/: One PNG still per timeline entry
//! - segments.json: Marked segments, with feedback takes under feedback/

use super::schema::{BundleMeta, SegmentEntry, TimelineEntry};
use crate::practice::PracticeOutcome;
use crate::recorder::Recording;
use crate::segments::Segment;
use crate::timeline::Snapshot;
use bytes::Bytes;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Bundle-related errors
#[derive(Error, Debug)]
pub enum BundleError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid bundle: {0}")]
    InvalidBundle(String),

    #[error("Missing required file: {0}")]
    MissingFile(String),
}

pub type BundleResult<T> = Result<T, BundleError>;

/// Contents written to a bundle
pub struct BundleContents<'a> {
    pub recording: &'a Recording,
    pub snapshots: &'a [Snapshot],
    pub segments: &'a [Segment],
    pub question_set: Option<&'a crate::practice::QuestionSet>,
}

impl<'a> From<&'a PracticeOutcome> for BundleContents<'a> {
    fn from(outcome: &'a PracticeOutcome) -> Self {
        Self {
            recording: &outcome.recording,
            snapshots: &outcome.snapshots,
            segments: &[],
            question_set: Some(&outcome.question_set),
        }
    }
}

/// Write a bundle directory, replacing any previous contents of the same files
pub fn write_bundle(contents: &BundleContents<'_>, bundle_path: &Path) -> BundleResult<BundleMeta> {
    if bundle_path.exists() && !bundle_path.is_dir() {
        return Err(BundleError::InvalidBundle(
            "Path is not a directory".to_string(),
        ));
    }
    fs::create_dir_all(bundle_path)?;

    let recording = contents.recording;
    let recording_file = format!("recording.{}", recording.extension());
    fs::write(bundle_path.join(&recording_file), &recording.data)?;

    let snapshots_path = bundle_path.join("snapshots");
    fs::create_dir_all(&snapshots_path)?;
    let timeline: Vec<TimelineEntry> = contents
        .snapshots
        .iter()
        .enumerate()
        .map(|(position, snapshot)| {
            let entry = TimelineEntry::from_snapshot(position, snapshot);
            fs::write(bundle_path.join(&entry.still), &snapshot.visual).map(|_| entry)
        })
        .collect::<Result<_, _>>()?;
    fs::write(
        bundle_path.join("timeline.json"),
        serde_json::to_string_pretty(&timeline)?,
    )?;

    let mut entries = Vec::with_capacity(contents.segments.len());
    for segment in contents.segments {
        let entry = SegmentEntry::from_segment(segment);
        if let (Some(file), Some(feedback)) = (&entry.feedback_file, &segment.feedback_recording) {
            fs::create_dir_all(bundle_path.join("feedback"))?;
            fs::write(bundle_path.join(file), &feedback.data)?;
        }
        entries.push(entry);
    }
    fs::write(
        bundle_path.join("segments.json"),
        serde_json::to_string_pretty(&entries)?,
    )?;

    let mut meta = BundleMeta::new(
        recording.id,
        recording_file,
        recording.mime_type.clone(),
        recording.duration.as_millis() as u64,
    );
    meta.question_set = contents.question_set.cloned();
    fs::write(
        bundle_path.join("meta.json"),
        serde_json::to_string_pretty(&meta)?,
    )?;

    tracing::debug!(
        "Saved bundle for recording {} to {:?} ({} snapshots, {} segments)",
        recording.id,
        bundle_path,
        timeline.len(),
        entries.len()
    );

    Ok(meta)
}

/// Read bundle metadata
pub fn read_meta(bundle_path: &Path) -> BundleResult<BundleMeta> {
    if !bundle_path.is_dir() {
        return Err(BundleError::InvalidBundle(
            "Path is not a directory".to_string(),
        ));
    }

    let meta_path = bundle_path.join("meta.json");
    if !meta_path.exists() {
        return Err(BundleError::MissingFile("meta.json".to_string()));
    }

    let meta: BundleMeta = serde_json::from_str(&fs::read_to_string(&meta_path)?)?;
    Ok(meta)
}

/// Read the recording back with its original id
pub fn read_recording(bundle_path: &Path) -> BundleResult<Recording> {
    let meta = read_meta(bundle_path)?;
    let recording_path = bundle_path.join(&meta.recording_file);
    if !recording_path.exists() {
        return Err(BundleError::MissingFile(meta.recording_file));
    }

    let data = fs::read(&recording_path)?;
    Ok(Recording {
        id: meta.recording_id,
        data: Bytes::from(data),
        mime_type: meta.mime_type,
        duration: Duration::from_millis(meta.duration_ms),
        created_at: meta.created_at,
        chunk_count: 1,
    })
}

/// Read the timeline
pub fn read_timeline(bundle_path: &Path) -> BundleResult<Vec<TimelineEntry>> {
    let timeline_path = bundle_path.join("timeline.json");

    if !timeline_path.exists() {
        // A take without question changes has no timeline
        return Ok(Vec::new());
    }

    let timeline: Vec<TimelineEntry> = serde_json::from_str(&fs::read_to_string(&timeline_path)?)?;
    Ok(timeline)
}

/// Read the timeline with the stills loaded
pub fn read_snapshots(bundle_path: &Path) -> BundleResult<Vec<Snapshot>> {
    read_timeline(bundle_path)?
        .into_iter()
        .map(|entry| {
            let still_path = bundle_path.join(&entry.still);
            if !still_path.exists() {
                return Err(BundleError::MissingFile(entry.still));
            }
            Ok(Snapshot {
                timestamp_ms: entry.timestamp_ms,
                event_index: entry.event_index,
                visual: fs::read(still_path)?,
            })
        })
        .collect()
}

/// Read segments, attaching feedback takes that are present
pub fn read_segments(bundle_path: &Path) -> BundleResult<Vec<Segment>> {
    let segments_path = bundle_path.join("segments.json");

    if !segments_path.exists() {
        return Ok(Vec::new());
    }

    let entries: Vec<SegmentEntry> = serde_json::from_str(&fs::read_to_string(&segments_path)?)?;

    entries
        .into_iter()
        .map(|entry| {
            let feedback_recording = match &entry.feedback_file {
                Some(file) => {
                    let path = bundle_path.join(file);
                    if !path.exists() {
                        return Err(BundleError::MissingFile(file.clone()));
                    }
                    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("webm");
                    let duration = Duration::from_secs_f64((entry.end_time - entry.start_time).max(0.0));
                    Some(Recording::from_blob(
                        Bytes::from(fs::read(&path)?),
                        crate::recorder::state::mime_for_extension(extension),
                        duration,
                    ))
                }
                None => None,
            };

            Ok(Segment {
                id: entry.id,
                start_time: entry.start_time,
                end_time: entry.end_time,
                note: entry.note,
                feedback_recording,
            })
        })
        .collect()
}

/// Check if a path is a valid practice bundle
pub fn is_valid_bundle(path: &Path) -> bool {
    if !path.is_dir() {
        return false;
    }

    // A valid bundle must have meta.json and the recording it names
    match read_meta(path) {
        Ok(meta) => path.join(&meta.recording_file).exists(),
        Err(_) => false,
    }
}

/// Get the bundle extension
pub const BUNDLE_EXTENSION: &str = "mvp";
