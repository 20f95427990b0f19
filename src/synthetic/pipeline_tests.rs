//! End-to-end pipeline tests
//!
//! Segments are cut from a source video, reactions are recorded for each,
//! the takes are stitched together, composed onto a background and saved as
//! a bundle. Everything runs on the synthetic platform with a paused clock.

use bytes::Bytes;
use crate::capture::DeviceAcquirer;
use crate::combiner::SequenceCombiner;
use crate::export::{BackgroundImage, CompositionSpec, CompositionStage, EncoderSettings};
use crate::feedback::{FeedbackConfig, FeedbackControl, FeedbackRecorder, FinishReason};
use crate::project::{self, BundleContents};
use crate::recorder::RecorderOptions;
use crate::segments::{ClockPlayer, PlaybackSource, SegmentConfig, SegmentManager};
use super::{SyntheticCanvas, SyntheticClipLoader, SyntheticDevices, SyntheticEngine, SyntheticRecorderFactory};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

async fn mark(segments: &mut SegmentManager, player: &ClockPlayer, start: f64, end: f64, note: &str) -> Uuid {
    player.seek(start).await.unwrap();
    segments.mark_start();
    player.seek(end).await.unwrap();
    segments.mark_end(note).unwrap().id
}

#[tokio::test(start_paused = true)]
async fn test_segments_to_composed_bundle() {
    let devices = Arc::new(SyntheticDevices::new());
    let player = Arc::new(ClockPlayer::new(300.0));
    let recorders = Arc::new(SyntheticRecorderFactory::new());

    let mut segments = SegmentManager::new(player.clone(), SegmentConfig::default());
    segments.wait_ready().await.unwrap();
    let first = mark(&mut segments, &player, 10.0, 12.0, "opening").await;
    let second = mark(&mut segments, &player, 30.0, 33.0, "tradeoffs").await;

    let mut feedback = FeedbackRecorder::new(
        DeviceAcquirer::new(devices.clone()),
        recorders.clone(),
        RecorderOptions::default(),
        FeedbackConfig {
            countdown: Duration::from_secs(2),
        },
    );

    for id in [first, second] {
        let outcome = feedback
            .record(&mut segments, id, &FeedbackControl::default())
            .await
            .unwrap();
        assert_eq!(outcome.reason, FinishReason::Timeout);
        assert_eq!(devices.total_live_tracks(), 0);
    }

    let takes = segments.feedback_recordings();
    assert_eq!(takes.len(), 2);
    let expected: Duration = takes.iter().map(|t| t.duration).sum();

    let canvas = Arc::new(SyntheticCanvas::new());
    let combiner = SequenceCombiner::new(
        Arc::new(SyntheticClipLoader::new()),
        canvas.clone(),
        recorders,
        RecorderOptions::default(),
        30,
    );
    let combined = combiner
        .combine(&takes, &CancellationToken::new())
        .await
        .unwrap();

    let diff = (combined.duration.as_secs_f64() - expected.as_secs_f64()).abs();
    assert!(diff <= combiner.frame_period().as_secs_f64(), "off by {}s", diff);
    assert_eq!(canvas.live_capture_tracks(), 0);

    let stage = CompositionStage::new(Arc::new(SyntheticEngine::new()), EncoderSettings::default());
    let spec = CompositionSpec {
        background: Some(BackgroundImage {
            file_name: "studio.png".into(),
            data: Bytes::from_static(b"png"),
        }),
        border: true,
        shadow: true,
        ..Default::default()
    };
    let composed = stage
        .compose(&combined, &spec, &CancellationToken::new(), |_| {})
        .await
        .unwrap();
    assert_eq!(composed.mime_type, "video/mp4");

    let dir = tempdir().unwrap();
    let bundle_path = dir.path().join(format!("review.{}", project::BUNDLE_EXTENSION));
    project::write_bundle(
        &BundleContents {
            recording: &combined,
            snapshots: &[],
            segments: segments.list(),
            question_set: None,
        },
        &bundle_path,
    )
    .unwrap();

    assert!(project::is_valid_bundle(&bundle_path));
    let restored = project::read_segments(&bundle_path).unwrap();
    assert_eq!(restored.len(), 2);
    assert!(restored.iter().all(|s| s.has_feedback()));
    assert_eq!(restored[1].note, "tradeoffs");
}

#[tokio::test(start_paused = true)]
async fn test_stopping_early_keeps_take() {
    let devices = Arc::new(SyntheticDevices::new());
    let player = Arc::new(ClockPlayer::new(60.0));
    let mut segments = SegmentManager::new(player.clone(), SegmentConfig::default());
    let id = mark(&mut segments, &player, 5.0, 20.0, "long answer").await;

    let mut feedback = FeedbackRecorder::new(
        DeviceAcquirer::new(devices.clone()),
        Arc::new(SyntheticRecorderFactory::new()),
        RecorderOptions::default(),
        FeedbackConfig::default(),
    );

    let control = FeedbackControl::default();
    let stop = control.stop.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(3)).await;
        stop.cancel();
    });

    let outcome = feedback.record(&mut segments, id, &control).await.unwrap();

    assert_eq!(outcome.reason, FinishReason::Stopped);
    assert!(outcome.recording.duration <= Duration::from_millis(3100));
    assert!(segments.get(id).unwrap().has_feedback());
    assert!(!player.is_playing());
    assert_eq!(devices.total_live_tracks(), 0);
}
