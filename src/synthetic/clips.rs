use super::recorder::CHUNK_HEADER;
use crate::capture::{LocalTrack, MediaTrack, TrackKind, TrackRef};
use crate::combiner::{ClipLoader, ClipPlayback, DrawingSurface, VideoFrame};
use crate::composer::ComposedStream;
use crate::recorder::Recording;
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const CLIP_MAGIC: &[u8] = b"MVCLIP";

/// Loads clips created by [`SyntheticClipLoader::clip`].
///
/// Output of the synthetic recorder also loads, as a 1280x720 clip labelled
/// 0 that plays for the recording's duration.
#[derive(Debug, Clone, Default)]
pub struct SyntheticClipLoader;

impl SyntheticClipLoader {
    pub fn new() -> Self {
        Self
    }

    /// A clip whose frames all carry `label`
    pub fn clip(label: u8, width: u32, height: u32, duration: Duration) -> Recording {
        let mut buf = BytesMut::with_capacity(CLIP_MAGIC.len() + 17);
        buf.put_slice(CLIP_MAGIC);
        buf.put_u8(label);
        buf.put_u32(width);
        buf.put_u32(height);
        buf.put_u64(duration.as_millis() as u64);
        Recording::from_blob(buf.freeze(), "video/webm", duration)
    }
}

#[async_trait]
impl ClipLoader for SyntheticClipLoader {
    async fn load(&self, clip: &Recording) -> Result<Box<dyn ClipPlayback>, String> {
        let mut data = clip.data.clone();

        let (label, width, height, duration) =
            if data.len() == CLIP_MAGIC.len() + 17 && data.starts_with(CLIP_MAGIC) {
                data.advance(CLIP_MAGIC.len());
                (
                    data.get_u8(),
                    data.get_u32(),
                    data.get_u32(),
                    Duration::from_millis(data.get_u64()),
                )
            } else if data.starts_with(CHUNK_HEADER) {
                (0, 1280, 720, clip.duration)
            } else {
                return Err(format!("recording {} is not a synthetic clip", clip.id));
            };

        Ok(Box::new(SyntheticClip {
            label,
            width,
            height,
            duration,
            started: Mutex::new(None),
            released: AtomicBool::new(false),
        }))
    }
}

/// Off-screen playback of a synthetic clip
#[derive(Debug)]
pub struct SyntheticClip {
    label: u8,
    width: u32,
    height: u32,
    duration: Duration,
    started: Mutex<Option<Instant>>,
    released: AtomicBool,
}

#[async_trait]
impl ClipPlayback for SyntheticClip {
    async fn dimensions(&self) -> Result<(u32, u32), String> {
        Ok((self.width, self.height))
    }

    async fn play(&self) -> Result<(), String> {
        if self.released.load(Ordering::SeqCst) {
            return Err("clip already released".to_string());
        }
        self.started.lock().get_or_insert_with(Instant::now);
        Ok(())
    }

    fn current_frame(&self) -> Option<VideoFrame> {
        let started = (*self.started.lock())?;
        Some(VideoFrame {
            width: self.width,
            height: self.height,
            timestamp: started.elapsed().min(self.duration),
            data: Bytes::from(vec![self.label]),
        })
    }

    async fn ended(&self) {
        let started = *self.started.lock();
        match started {
            Some(started) => tokio::time::sleep_until(started + self.duration).await,
            None => std::future::pending().await,
        }
    }

    fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

/// Drawing surface that remembers what was drawn
#[derive(Debug, Default)]
pub struct SyntheticCanvas {
    size: Mutex<Option<(u32, u32)>>,
    drawn: Mutex<Vec<u8>>,
    captures: Mutex<Vec<Arc<LocalTrack>>>,
}

impl SyntheticCanvas {
    pub fn new() -> Self {
        Self::default()
    }

    /// First byte of every drawn frame, in draw order
    pub fn drawn_labels(&self) -> Vec<u8> {
        self.drawn.lock().clone()
    }

    pub fn size(&self) -> Option<(u32, u32)> {
        *self.size.lock()
    }

    pub fn live_capture_tracks(&self) -> usize {
        self.captures.lock().iter().filter(|t| t.is_live()).count()
    }
}

impl DrawingSurface for SyntheticCanvas {
    fn resize(&self, width: u32, height: u32) {
        *self.size.lock() = Some((width, height));
    }

    fn draw(&self, frame: &VideoFrame) {
        if let Some(&label) = frame.data.first() {
            self.drawn.lock().push(label);
        }
    }

    fn capture(&self, frame_rate: u32) -> ComposedStream {
        let video = Arc::new(LocalTrack::new(
            TrackKind::Video,
            format!("canvas capture @{}fps", frame_rate),
        ));
        let audio = Arc::new(LocalTrack::new(TrackKind::Audio, "canvas audio"));
        self.captures.lock().extend([video.clone(), audio.clone()]);

        ComposedStream::direct(vec![video as TrackRef], audio as TrackRef)
    }
}
