//! In-process track handle
//!
//! Backs every track this crate creates itself: platform capture tracks,
//! the mixing destination, drawing-surface captures and synthetic devices.
//! A track created with a feed publishes the media pushed into it.

use super::feed::{AudioBlock, VideoFrame, AUDIO_FEED_CAPACITY, VIDEO_FEED_CAPACITY};
use super::traits::{MediaTrack, TrackKind};
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

#[derive(Debug)]
enum Feed {
    None,
    Video(broadcast::Sender<VideoFrame>),
    Audio(broadcast::Sender<AudioBlock>),
}

/// A track whose lifetime is tracked with a watch flag
#[derive(Debug)]
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    label: String,
    ended_tx: watch::Sender<bool>,
    feed: Feed,
}

impl LocalTrack {
    /// A track without media, used for lifecycle bookkeeping
    pub fn new(kind: TrackKind, label: impl Into<String>) -> Self {
        Self::build(kind, label.into(), Feed::None)
    }

    /// A track that publishes frames or PCM pushed by its producer
    pub fn with_feed(kind: TrackKind, label: impl Into<String>) -> Self {
        let feed = match kind {
            TrackKind::Video => Feed::Video(broadcast::channel(VIDEO_FEED_CAPACITY).0),
            TrackKind::Audio => Feed::Audio(broadcast::channel(AUDIO_FEED_CAPACITY).0),
        };
        Self::build(kind, label.into(), feed)
    }

    fn build(kind: TrackKind, label: String, feed: Feed) -> Self {
        let (ended_tx, _) = watch::channel(false);
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            label,
            ended_tx,
            feed,
        }
    }

    /// Publish a frame. Returns `false` once the track has stopped, which
    /// tells the producer to shut down.
    pub fn push_video(&self, frame: VideoFrame) -> bool {
        if !self.is_live() {
            return false;
        }
        if let Feed::Video(tx) = &self.feed {
            // No subscribers yet is fine
            let _ = tx.send(frame);
        }
        true
    }

    /// Publish a PCM block. Same contract as [`LocalTrack::push_video`].
    pub fn push_audio(&self, block: AudioBlock) -> bool {
        if !self.is_live() {
            return false;
        }
        if let Feed::Audio(tx) = &self.feed {
            let _ = tx.send(block);
        }
        true
    }
}

impl MediaTrack for LocalTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn is_live(&self) -> bool {
        !*self.ended_tx.borrow()
    }

    fn stop(&self) {
        if !self.ended_tx.send_replace(true) {
            tracing::debug!("Track {} ({}) stopped", self.label, self.id);
        }
    }

    fn ended(&self) -> watch::Receiver<bool> {
        self.ended_tx.subscribe()
    }

    fn video_feed(&self) -> Option<broadcast::Receiver<VideoFrame>> {
        match &self.feed {
            Feed::Video(tx) => Some(tx.subscribe()),
            _ => None,
        }
    }

    fn audio_feed(&self) -> Option<broadcast::Receiver<AudioBlock>> {
        match &self.feed {
            Feed::Audio(tx) => Some(tx.subscribe()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;

    #[test]
    fn test_stop_twice() {
        let track = LocalTrack::new(TrackKind::Video, "cam");
        let ended = track.ended();
        assert!(track.is_live());

        track.stop();
        track.stop();

        assert!(!track.is_live());
        assert!(*ended.borrow());
        assert!(track.video_feed().is_none());
    }

    #[test]
    fn test_feed_delivers_until_stopped() {
        let track = LocalTrack::with_feed(TrackKind::Video, "cam");
        let mut frames = track.video_feed().unwrap();
        assert!(track.audio_feed().is_none());

        let frame = VideoFrame {
            width: 1,
            height: 1,
            timestamp: Duration::ZERO,
            data: Bytes::from_static(&[1, 2, 3]),
        };
        assert!(track.push_video(frame.clone()));
        assert_eq!(frames.try_recv().unwrap(), frame);

        track.stop();
        assert!(!track.push_video(frame));
        assert!(frames.try_recv().is_err());
    }
}
