//! Media carried by live tracks
//!
//! Platform tracks publish what they capture on broadcast channels: video
//! tracks publish packed RGB24 frames, audio tracks publish interleaved `f32`
//! PCM blocks. Slow subscribers lag and lose the oldest items instead of
//! stalling the capture thread.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

/// Frames buffered per video subscriber
pub const VIDEO_FEED_CAPACITY: usize = 8;

/// Blocks buffered per audio subscriber
pub const AUDIO_FEED_CAPACITY: usize = 256;

/// One decoded video frame
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    /// Capture time relative to the start of the track
    pub timestamp: Duration,
    /// Packed RGB24 pixels for platform frames
    pub data: Bytes,
}

impl VideoFrame {
    /// Bytes a packed RGB24 frame of this size occupies
    pub fn rgb24_len(width: u32, height: u32) -> usize {
        width as usize * height as usize * 3
    }

    pub fn is_rgb24(&self) -> bool {
        self.data.len() == Self::rgb24_len(self.width, self.height)
    }
}

/// One block of interleaved PCM samples
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBlock {
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Arc<[f32]>,
}

impl AudioBlock {
    pub fn new(sample_rate: u32, channels: u16, samples: Vec<f32>) -> Self {
        Self {
            sample_rate,
            channels: channels.max(1),
            samples: samples.into(),
        }
    }

    /// Number of sample frames (one sample per channel)
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frames() as f64 / self.sample_rate as f64)
    }

    /// Samples converted to `channels` channels at `sample_rate`.
    ///
    /// Channel changes go through a mono downmix; rate changes use linear
    /// interpolation.
    pub fn convert(&self, sample_rate: u32, channels: u16) -> Vec<f32> {
        let channels = channels.max(1);
        let remixed = remix(&self.samples, self.channels, channels);
        if self.sample_rate == sample_rate || self.sample_rate == 0 {
            remixed
        } else {
            resample(&remixed, channels, self.sample_rate, sample_rate)
        }
    }
}

fn remix(samples: &[f32], from: u16, to: u16) -> Vec<f32> {
    if from == to {
        return samples.to_vec();
    }
    let from = from.max(1) as usize;
    let to = to as usize;
    samples
        .chunks_exact(from)
        .flat_map(|frame| {
            let mono = frame.iter().sum::<f32>() / from as f32;
            std::iter::repeat(mono).take(to)
        })
        .collect()
}

fn resample(samples: &[f32], channels: u16, from: u32, to: u32) -> Vec<f32> {
    let channels = channels as usize;
    let frames = samples.len() / channels;
    if frames == 0 {
        return Vec::new();
    }

    let out_frames = ((frames as u64 * to as u64) / from as u64).max(1) as usize;
    let step = from as f64 / to as f64;
    let mut out = Vec::with_capacity(out_frames * channels);

    for i in 0..out_frames {
        let position = i as f64 * step;
        let left = (position.floor() as usize).min(frames - 1);
        let right = (left + 1).min(frames - 1);
        let t = (position - left as f64) as f32;
        for c in 0..channels {
            let a = samples[left * channels + c];
            let b = samples[right * channels + c];
            out.push(a + (b - a) * t);
        }
    }
    out
}

/// Interleaved `f32` samples as little-endian bytes
pub fn f32le_bytes(samples: &[f32]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stereo_to_mono_averages() {
        let block = AudioBlock::new(48_000, 2, vec![0.2, 0.4, -1.0, 1.0]);
        assert_eq!(block.frames(), 2);
        let mono = block.convert(48_000, 1);
        assert!((mono[0] - 0.3).abs() < 1e-6);
        assert_eq!(mono[1], 0.0);
    }

    #[test]
    fn test_mono_to_stereo_duplicates() {
        let block = AudioBlock::new(48_000, 1, vec![0.5, -0.5]);
        assert_eq!(block.convert(48_000, 2), vec![0.5, 0.5, -0.5, -0.5]);
    }

    #[test]
    fn test_resample_halves_frames() {
        let block = AudioBlock::new(48_000, 1, (0..480).map(|i| i as f32 / 480.0).collect());
        let out = block.convert(24_000, 1);
        assert_eq!(out.len(), 240);
        assert!((out[10] - 20.0 / 480.0).abs() < 1e-6);
        assert_eq!(block.duration(), Duration::from_millis(10));
    }

    #[test]
    fn test_rgb24_frame_size() {
        let frame = VideoFrame {
            width: 4,
            height: 2,
            timestamp: Duration::ZERO,
            data: Bytes::from(vec![0u8; 24]),
        };
        assert!(frame.is_rgb24());
        assert_eq!(f32le_bytes(&[1.0]), 1.0f32.to_le_bytes().to_vec());
    }
}
