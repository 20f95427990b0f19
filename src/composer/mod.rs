//! Stream composition
//!
//! Merges the video tracks of one or more sources and mixes their audio into a
//! single recordable [`ComposedStream`].

pub mod graph;

pub use graph::{GainNode, MixingGraph, SourceNode};

use crate::capture::{AudioBlock, MediaSource, TrackRef, VideoFrame};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Where the stream's single audio track comes from
#[derive(Debug)]
pub enum AudioOutput {
    /// Output of a software mixing graph
    Mixed(MixingGraph),
    /// A track carried directly (drawing-surface capture)
    Direct(TrackRef),
}

/// N video tracks plus exactly one audio track
#[derive(Debug)]
pub struct ComposedStream {
    id: Uuid,
    video_tracks: Vec<TrackRef>,
    audio: AudioOutput,
}

impl ComposedStream {
    /// Build a stream around a track that already carries mixed audio
    pub fn direct(video_tracks: Vec<TrackRef>, audio_track: TrackRef) -> Self {
        Self {
            id: Uuid::new_v4(),
            video_tracks,
            audio: AudioOutput::Direct(audio_track),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// All video tracks, in composition order
    pub fn video_tracks(&self) -> &[TrackRef] {
        &self.video_tracks
    }

    /// The only video track a recorder renders
    pub fn rendered_video(&self) -> Option<&TrackRef> {
        self.video_tracks.first()
    }

    pub fn audio_track(&self) -> TrackRef {
        match &self.audio {
            AudioOutput::Mixed(graph) => graph.output(),
            AudioOutput::Direct(track) => track.clone(),
        }
    }

    pub fn audio(&self) -> &AudioOutput {
        &self.audio
    }

    /// Number of audio inputs feeding the stream
    pub fn mixed_input_count(&self) -> usize {
        match &self.audio {
            AudioOutput::Mixed(graph) => graph.input_count(),
            AudioOutput::Direct(_) => 1,
        }
    }

    /// Frames of the rendered video track
    pub fn video_feed(&self) -> Option<broadcast::Receiver<VideoFrame>> {
        self.rendered_video().and_then(|track| track.video_feed())
    }

    /// PCM of the stream's audio track, starting the mix if needed.
    ///
    /// `None` when no audio input carries readable PCM.
    pub fn audio_feed(&self) -> Option<broadcast::Receiver<AudioBlock>> {
        match &self.audio {
            AudioOutput::Mixed(graph) => {
                let feed = graph.output().audio_feed();
                if graph.start_mixing() {
                    feed
                } else {
                    None
                }
            }
            AudioOutput::Direct(track) => track.audio_feed(),
        }
    }

    /// Whether there is anything a recorder could capture
    pub fn has_live_tracks(&self) -> bool {
        self.video_tracks.iter().any(|t| t.is_live())
            || match &self.audio {
                AudioOutput::Mixed(graph) => graph.sources().iter().any(|s| s.track.is_live()),
                AudioOutput::Direct(track) => track.is_live(),
            }
    }

    /// Stop every track the stream holds. Idempotent.
    pub fn stop(&mut self) {
        for track in &self.video_tracks {
            track.stop();
        }
        match &mut self.audio {
            AudioOutput::Mixed(graph) => graph.close(),
            AudioOutput::Direct(track) => track.stop(),
        }
    }
}

/// Compose a recordable stream.
///
/// Video tracks are taken verbatim in the order given. Audio sources without
/// tracks are left out of the mix.
pub fn compose(video: &[&MediaSource], audio: &[&MediaSource]) -> ComposedStream {
    let video_tracks: Vec<TrackRef> = video
        .iter()
        .flat_map(|source| source.video_tracks().cloned())
        .collect();

    let mut graph = MixingGraph::new();
    for source in audio {
        let mut connected = false;
        for track in source.audio_tracks() {
            graph.connect(source.id(), track.clone());
            connected = true;
        }
        if !connected {
            tracing::warn!("{} source has no audio tracks, omitting from mix", source.kind());
        }
    }

    tracing::info!(
        "Composed stream: {} video tracks, {} mixed audio inputs",
        video_tracks.len(),
        graph.input_count()
    );

    ComposedStream {
        id: Uuid::new_v4(),
        video_tracks,
        audio: AudioOutput::Mixed(graph),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureHints, LocalTrack, SourceKind, TrackKind};
    use std::sync::Arc;

    fn source(kind: SourceKind, tracks: &[TrackKind]) -> MediaSource {
        let tracks = tracks
            .iter()
            .map(|&k| Arc::new(LocalTrack::new(k, kind.to_string())) as TrackRef)
            .collect();
        MediaSource::new(kind, tracks, CaptureHints::default())
    }

    #[test]
    fn test_camera_mic_and_empty_system_audio() {
        let camera = source(SourceKind::Camera, &[TrackKind::Video]);
        let mic = source(SourceKind::Microphone, &[TrackKind::Audio]);
        let system = source(SourceKind::SystemAudio, &[]);

        let stream = compose(&[&camera], &[&mic, &system]);

        assert_eq!(stream.video_tracks().len(), 1);
        assert_eq!(stream.mixed_input_count(), 1);
        assert_eq!(stream.audio_track().kind(), TrackKind::Audio);
    }

    #[test]
    fn test_first_video_track_is_rendered() {
        let screen = source(SourceKind::Screen, &[TrackKind::Video]);
        let camera = source(SourceKind::Camera, &[TrackKind::Video]);

        let stream = compose(&[&screen, &camera], &[]);

        assert_eq!(stream.video_tracks().len(), 2);
        assert_eq!(
            stream.rendered_video().map(|t| t.id().to_string()),
            screen.video_tracks().next().map(|t| t.id().to_string())
        );
        assert!(stream.audio_track().is_live());
    }

    #[test]
    fn test_stop_ends_all_tracks() {
        let camera = source(SourceKind::Camera, &[TrackKind::Video]);
        let mic = source(SourceKind::Microphone, &[TrackKind::Audio]);
        let mut stream = compose(&[&camera], &[&mic]);
        let output = stream.audio_track();

        stream.stop();
        stream.stop();

        assert_eq!(camera.live_track_count(), 0);
        assert!(!output.is_live());
        assert!(!stream.has_live_tracks());
    }

    #[tokio::test(start_paused = true)]
    async fn test_feeds_follow_the_rendered_track_and_mix() {
        let screen = Arc::new(LocalTrack::with_feed(TrackKind::Video, "screen"));
        let mic = Arc::new(LocalTrack::with_feed(TrackKind::Audio, "mic"));
        let screen_source = MediaSource::new(SourceKind::Screen, vec![screen.clone() as TrackRef], CaptureHints::default());
        let mic_source = MediaSource::new(SourceKind::Microphone, vec![mic.clone() as TrackRef], CaptureHints::default());

        let stream = compose(&[&screen_source], &[&mic_source]);
        let mut frames = stream.video_feed().unwrap();
        let mut mixed = stream.audio_feed().unwrap();

        mic.push_audio(AudioBlock::new(48_000, 1, vec![0.25; 480]));
        let block = tokio::time::timeout(std::time::Duration::from_secs(1), mixed.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(block.samples.len(), 480);
        assert!(block.samples.iter().all(|&s| (s - 0.25).abs() < 1e-6));

        screen.push_video(VideoFrame {
            width: 1,
            height: 1,
            timestamp: std::time::Duration::ZERO,
            data: bytes::Bytes::from_static(&[1, 2, 3]),
        });
        assert_eq!(frames.recv().await.unwrap().width, 1);
    }

    #[test]
    fn test_no_audio_feed_without_pcm_inputs() {
        let camera = source(SourceKind::Camera, &[TrackKind::Video]);
        let mic = source(SourceKind::Microphone, &[TrackKind::Audio]);
        let stream = compose(&[&camera], &[&mic]);

        assert!(stream.video_feed().is_none());
        assert!(stream.audio_feed().is_none());
    }
}
