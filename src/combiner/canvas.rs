//! In-memory drawing surface
//!
//! Holds one RGB24 image the size of the canvas. Clip frames are scaled onto
//! it, letterboxed, and every live capture re-publishes the image at its
//! frame rate together with the clip audio routed in since the last frame.

use super::DrawingSurface;
use crate::capture::{AudioBlock, LocalTrack, MediaTrack, TrackKind, TrackRef, VideoFrame};
use crate::composer::ComposedStream;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};

/// Format of the capture audio track
pub const CANVAS_SAMPLE_RATE: u32 = 48_000;
pub const CANVAS_CHANNELS: u16 = 2;

#[derive(Debug)]
struct Image {
    width: u32,
    height: u32,
    pixels: Bytes,
}

impl Image {
    fn black(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: Bytes::from(vec![0u8; VideoFrame::rgb24_len(width, height)]),
        }
    }
}

#[derive(Debug)]
struct Shared {
    image: Mutex<Image>,
    /// Interleaved samples at the capture format, oldest first
    audio: Mutex<VecDeque<f32>>,
}

/// Drawing surface backed by an RGB24 buffer
#[derive(Debug)]
pub struct FrameCanvas {
    shared: Arc<Shared>,
    captures: Mutex<Vec<Arc<LocalTrack>>>,
}

impl Default for FrameCanvas {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCanvas {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                image: Mutex::new(Image::black(2, 2)),
                audio: Mutex::new(VecDeque::new()),
            }),
            captures: Mutex::new(Vec::new()),
        }
    }

    pub fn size(&self) -> (u32, u32) {
        let image = self.shared.image.lock();
        (image.width, image.height)
    }

    pub fn live_capture_tracks(&self) -> usize {
        self.captures.lock().iter().filter(|t| t.is_live()).count()
    }
}

/// Nearest-neighbour scale of `frame` into a `width`x`height` image,
/// centered with black bars
fn letterbox(frame: &VideoFrame, width: u32, height: u32) -> Bytes {
    let mut out = vec![0u8; VideoFrame::rgb24_len(width, height)];
    if frame.width == 0 || frame.height == 0 {
        return Bytes::from(out);
    }

    let scale = (width as f64 / frame.width as f64).min(height as f64 / frame.height as f64);
    let fit_w = ((frame.width as f64 * scale).round() as u32).clamp(1, width);
    let fit_h = ((frame.height as f64 * scale).round() as u32).clamp(1, height);
    let x0 = (width - fit_w) / 2;
    let y0 = (height - fit_h) / 2;

    for y in 0..fit_h {
        let src_y = (y as u64 * frame.height as u64 / fit_h as u64) as usize;
        for x in 0..fit_w {
            let src_x = (x as u64 * frame.width as u64 / fit_w as u64) as usize;
            let src = (src_y * frame.width as usize + src_x) * 3;
            let dst = (((y0 + y) * width + x0 + x) as usize) * 3;
            out[dst..dst + 3].copy_from_slice(&frame.data[src..src + 3]);
        }
    }

    Bytes::from(out)
}

impl DrawingSurface for FrameCanvas {
    fn resize(&self, width: u32, height: u32) {
        // Encoders need even dimensions
        let width = (width.max(2)) & !1;
        let height = (height.max(2)) & !1;
        *self.shared.image.lock() = Image::black(width, height);
        tracing::debug!("Canvas resized to {}x{}", width, height);
    }

    fn draw(&self, frame: &VideoFrame) {
        if !frame.is_rgb24() {
            tracing::trace!("Skipping frame that is not packed RGB24");
            return;
        }
        let mut image = self.shared.image.lock();
        image.pixels = letterbox(frame, image.width, image.height);
    }

    fn mix_audio(&self, block: &AudioBlock) {
        let samples = block.convert(CANVAS_SAMPLE_RATE, CANVAS_CHANNELS);
        self.shared.audio.lock().extend(samples);
    }

    fn capture(&self, frame_rate: u32) -> ComposedStream {
        let frame_rate = frame_rate.max(1);
        let video = Arc::new(LocalTrack::with_feed(
            TrackKind::Video,
            format!("canvas capture @{}fps", frame_rate),
        ));
        let audio = Arc::new(LocalTrack::with_feed(TrackKind::Audio, "canvas audio"));
        self.captures.lock().extend([video.clone(), audio.clone()]);
        self.shared.audio.lock().clear();

        tokio::spawn(publish(self.shared.clone(), video.clone(), audio.clone(), frame_rate));

        ComposedStream::direct(vec![video as TrackRef], audio as TrackRef)
    }
}

/// Publish the canvas once per frame until the capture is stopped
async fn publish(shared: Arc<Shared>, video: Arc<LocalTrack>, audio: Arc<LocalTrack>, frame_rate: u32) {
    let samples_per_frame = (CANVAS_SAMPLE_RATE / frame_rate) as usize * CANVAS_CHANNELS as usize;
    let started = Instant::now();
    let mut ticker = interval(Duration::from_secs_f64(1.0 / frame_rate as f64));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;

        let frame = {
            let image = shared.image.lock();
            VideoFrame {
                width: image.width,
                height: image.height,
                timestamp: started.elapsed(),
                data: image.pixels.clone(),
            }
        };
        let samples: Vec<f32> = {
            let mut queued = shared.audio.lock();
            let take = samples_per_frame.min(queued.len());
            let mut samples: Vec<f32> = queued.drain(..take).collect();
            samples.resize(samples_per_frame, 0.0);
            samples
        };

        let video_live = video.push_video(frame);
        let audio_live = audio.push_audio(AudioBlock::new(CANVAS_SAMPLE_RATE, CANVAS_CHANNELS, samples));
        if !video_live || !audio_live {
            break;
        }
    }

    video.stop();
    audio.stop();
    tracing::debug!("Canvas capture ended");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(width: u32, height: u32, rgb: [u8; 3]) -> VideoFrame {
        VideoFrame {
            width,
            height,
            timestamp: Duration::ZERO,
            data: Bytes::from(rgb.repeat((width * height) as usize)),
        }
    }

    #[test]
    fn test_letterbox_centers_narrow_frame() {
        // A 1x2 frame keeps its aspect inside a 4x2 canvas
        let pixels = letterbox(&solid(1, 2, [255, 0, 0]), 4, 2);
        let row: Vec<&[u8]> = pixels[..12].chunks(3).collect();
        assert_eq!(row, vec![&[0, 0, 0][..], &[255, 0, 0], &[0, 0, 0], &[0, 0, 0]]);
    }

    #[test]
    fn test_resize_rounds_to_even() {
        let canvas = FrameCanvas::new();
        canvas.resize(641, 361);
        assert_eq!(canvas.size(), (640, 360));
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_publishes_canvas_and_audio() {
        let canvas = FrameCanvas::new();
        canvas.resize(4, 2);

        let mut stream = canvas.capture(10);
        let mut frames = stream.video_feed().unwrap();
        let mut blocks = stream.audio_feed().unwrap();

        canvas.draw(&solid(2, 1, [0, 255, 0]));
        canvas.mix_audio(&AudioBlock::new(48_000, 2, vec![0.5; 20]));

        let frame = loop {
            let frame = frames.recv().await.unwrap();
            if frame.data[1] == 255 {
                break frame;
            }
        };
        assert_eq!((frame.width, frame.height), (4, 2));
        assert!(frame.data.chunks(3).all(|px| px == [0, 255, 0]));

        let block = loop {
            let block = blocks.recv().await.unwrap();
            if block.samples[0] != 0.0 {
                break block;
            }
        };
        assert_eq!(block.samples.len(), 4800 * 2);
        assert!(block.samples[..20].iter().all(|&s| s == 0.5));
        assert!(block.samples[20..].iter().all(|&s| s == 0.0));

        assert_eq!(canvas.live_capture_tracks(), 2);
        stream.stop();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(canvas.live_capture_tracks(), 0);
    }

    #[test]
    fn test_non_rgb_frames_are_ignored() {
        let canvas = FrameCanvas::new();
        canvas.resize(2, 2);
        canvas.draw(&VideoFrame {
            width: 2,
            height: 2,
            timestamp: Duration::ZERO,
            data: Bytes::from_static(&[1]),
        });
        assert!(canvas.shared.image.lock().pixels.iter().all(|&b| b == 0));
    }
}
