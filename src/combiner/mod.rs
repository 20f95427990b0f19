//! Sequence combiner
//!
//! Concatenates independently recorded clips into one continuous recording by
//! playing them back in order through a drawing surface and recording a live
//! capture of that surface.

pub mod canvas;
pub mod loader;

pub use crate::capture::VideoFrame;
pub use canvas::FrameCanvas;
pub use loader::{FfmpegClip, FfmpegClipLoader};

use crate::capture::AudioBlock;
use crate::composer::ComposedStream;
use crate::recorder::{CaptureSession, RecorderFactory, RecorderOptions, Recording, RecordingError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum CombineError {
    #[error("No clips to combine")]
    NoClips,

    #[error("Failed to load clip {index}: {message}")]
    Load { index: usize, message: String },

    #[error("Playback of clip {index} failed: {message}")]
    Playback { index: usize, message: String },

    #[error(transparent)]
    Recording(#[from] RecordingError),

    #[error("Combine cancelled")]
    Cancelled,
}

pub type CombineResult<T> = Result<T, CombineError>;

/// Loads clips into off-screen playback sources
#[async_trait]
pub trait ClipLoader: Send + Sync {
    async fn load(&self, clip: &Recording) -> Result<Box<dyn ClipPlayback>, String>;
}

/// An off-screen playback source
#[async_trait]
pub trait ClipPlayback: Send + Sync {
    /// Natural dimensions, available once metadata has loaded
    async fn dimensions(&self) -> Result<(u32, u32), String>;

    async fn play(&self) -> Result<(), String>;

    /// Frame currently on display, if any
    fn current_frame(&self) -> Option<VideoFrame>;

    /// Resolves when the clip reaches its natural end
    async fn ended(&self);

    /// Decoded soundtrack while playing, for clips that carry audio
    fn audio_feed(&self) -> Option<broadcast::Receiver<AudioBlock>> {
        None
    }

    /// Release decoder resources
    fn release(&self);
}

/// Canvas the clips are drawn onto
pub trait DrawingSurface: Send + Sync {
    fn resize(&self, width: u32, height: u32);

    fn draw(&self, frame: &VideoFrame);

    /// Route clip audio into the capture's audio track
    fn mix_audio(&self, _block: &AudioBlock) {}

    /// Live capture of the surface at a fixed frame rate. The capture carries
    /// its own audio track.
    fn capture(&self, frame_rate: u32) -> ComposedStream;
}

pub struct SequenceCombiner {
    loader: Arc<dyn ClipLoader>,
    surface: Arc<dyn DrawingSurface>,
    recorders: Arc<dyn RecorderFactory>,
    options: RecorderOptions,
    frame_rate: u32,
}

impl SequenceCombiner {
    pub fn new(
        loader: Arc<dyn ClipLoader>,
        surface: Arc<dyn DrawingSurface>,
        recorders: Arc<dyn RecorderFactory>,
        options: RecorderOptions,
        frame_rate: u32,
    ) -> Self {
        Self {
            loader,
            surface,
            recorders,
            options,
            frame_rate: frame_rate.max(1),
        }
    }

    /// Frame period at the configured frame rate
    pub fn frame_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.frame_rate as f64)
    }

    /// Combine clips in order into one recording
    pub async fn combine(&self, clips: &[Recording], cancel: &CancellationToken) -> CombineResult<Recording> {
        match clips.len() {
            0 => return Err(CombineError::NoClips),
            1 => return Ok(clips[0].clone()),
            _ => {}
        }

        tracing::info!("Combining {} clips at {}fps", clips.len(), self.frame_rate);

        let mut players: Vec<Box<dyn ClipPlayback>> = Vec::with_capacity(clips.len());
        let loaded = self.load_all(clips, &mut players, cancel).await;
        let result = match loaded {
            Ok((width, height)) => self.record_sequence(&players, width, height, cancel).await,
            Err(e) => Err(e),
        };

        for player in &players {
            player.release();
        }
        result
    }

    /// Load every clip and wait for its natural dimensions.
    ///
    /// Players loaded before a failure or cancellation stay in `players` so
    /// the caller can release them.
    async fn load_all(
        &self,
        clips: &[Recording],
        players: &mut Vec<Box<dyn ClipPlayback>>,
        cancel: &CancellationToken,
    ) -> CombineResult<(u32, u32)> {
        for (index, clip) in clips.iter().enumerate() {
            let player = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CombineError::Cancelled),
                loaded = self.loader.load(clip) => {
                    loaded.map_err(|message| CombineError::Load { index, message })?
                }
            };
            players.push(player);
        }

        let mut first = None;
        for (index, player) in players.iter().enumerate() {
            let dimensions = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CombineError::Cancelled),
                dimensions = player.dimensions() => {
                    dimensions.map_err(|message| CombineError::Load { index, message })?
                }
            };
            tracing::debug!("Clip {} is {}x{}", index, dimensions.0, dimensions.1);
            first.get_or_insert(dimensions);
        }

        first.ok_or(CombineError::NoClips)
    }

    async fn record_sequence(
        &self,
        players: &[Box<dyn ClipPlayback>],
        width: u32,
        height: u32,
        cancel: &CancellationToken,
    ) -> CombineResult<Recording> {
        self.surface.resize(width, height);

        let mut session = CaptureSession::new(self.recorders.create(&self.options));
        session.prepare(self.surface.capture(self.frame_rate), Vec::new())?;
        session.start().await?;

        for (index, player) in players.iter().enumerate() {
            if let Err(e) = self.draw_clip(index, player.as_ref(), cancel).await {
                session.abort().await;
                return Err(e);
            }
        }

        Ok(session.stop().await?)
    }

    async fn draw_clip(
        &self,
        index: usize,
        player: &dyn ClipPlayback,
        cancel: &CancellationToken,
    ) -> CombineResult<()> {
        player
            .play()
            .await
            .map_err(|message| CombineError::Playback { index, message })?;

        let mut ticker = tokio::time::interval(self.frame_period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let ended = player.ended();
        tokio::pin!(ended);
        let mut audio = player.audio_feed();

        let mut frames = 0u64;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CombineError::Cancelled),
                _ = &mut ended => break,
                block = next_block(&mut audio) => match block {
                    Some(block) => self.surface.mix_audio(&block),
                    None => audio = None,
                },
                _ = ticker.tick() => {
                    if let Some(frame) = player.current_frame() {
                        self.surface.draw(&frame);
                        frames += 1;
                    }
                }
            }
        }

        tracing::debug!("Clip {} drawn ({} frames)", index, frames);
        Ok(())
    }
}

/// Next block of a clip soundtrack; pending forever for silent clips
async fn next_block(feed: &mut Option<broadcast::Receiver<AudioBlock>>) -> Option<AudioBlock> {
    let Some(feed) = feed else {
        return std::future::pending().await;
    };
    loop {
        match feed.recv().await {
            Ok(block) => return Some(block),
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::{SyntheticCanvas, SyntheticClipLoader, SyntheticRecorderFactory};
    use assert_matches::assert_matches;

    fn clip(label: u8, millis: u64) -> Recording {
        SyntheticClipLoader::clip(label, 640, 360, Duration::from_millis(millis))
    }

    fn combiner(canvas: &Arc<SyntheticCanvas>) -> SequenceCombiner {
        SequenceCombiner::new(
            Arc::new(SyntheticClipLoader::new()),
            canvas.clone(),
            Arc::new(SyntheticRecorderFactory::new()),
            RecorderOptions::default(),
            30,
        )
    }

    #[tokio::test]
    async fn test_no_clips() {
        let canvas = Arc::new(SyntheticCanvas::new());
        let result = combiner(&canvas).combine(&[], &CancellationToken::new()).await;
        assert_matches!(result, Err(CombineError::NoClips));
    }

    #[tokio::test]
    async fn test_single_clip_returned_unchanged() {
        let canvas = Arc::new(SyntheticCanvas::new());
        let only = clip(1, 2000);

        let combined = combiner(&canvas)
            .combine(std::slice::from_ref(&only), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(combined, only);
        assert!(canvas.drawn_labels().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duration_is_sum_and_order_preserved() {
        let canvas = Arc::new(SyntheticCanvas::new());
        let clips = vec![clip(0, 2000), clip(1, 1500), clip(2, 3250)];
        let combiner = combiner(&canvas);

        let combined = combiner
            .combine(&clips, &CancellationToken::new())
            .await
            .unwrap();

        let expected = Duration::from_millis(6750);
        let diff = combined.duration.as_secs_f64() - expected.as_secs_f64();
        assert!(
            diff.abs() <= combiner.frame_period().as_secs_f64(),
            "duration was {:?}",
            combined.duration
        );

        let mut labels = canvas.drawn_labels();
        assert!(labels.windows(2).all(|w| w[0] <= w[1]));
        labels.dedup();
        assert_eq!(labels, vec![0, 1, 2]);
        assert_eq!(canvas.size(), Some((640, 360)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_releases_surface_capture() {
        let canvas = Arc::new(SyntheticCanvas::new());
        let clips = vec![clip(0, 5000), clip(1, 5000)];
        let combiner = combiner(&canvas);

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let result = combiner.combine(&clips, &cancel).await;

        assert_matches!(result, Err(CombineError::Cancelled));
        assert_eq!(canvas.live_capture_tracks(), 0);
    }

    /// Clip whose metadata never finishes loading
    struct StalledClip {
        released: Arc<std::sync::atomic::AtomicBool>,
    }

    #[async_trait]
    impl ClipPlayback for StalledClip {
        async fn dimensions(&self) -> Result<(u32, u32), String> {
            std::future::pending().await
        }

        async fn play(&self) -> Result<(), String> {
            Ok(())
        }

        fn current_frame(&self) -> Option<VideoFrame> {
            None
        }

        async fn ended(&self) {
            std::future::pending().await
        }

        fn release(&self) {
            self.released.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    /// Loads the first clip as a stalled clip and never finishes the second
    struct StallingLoader {
        loads: std::sync::atomic::AtomicUsize,
        released: Arc<std::sync::atomic::AtomicBool>,
        hang_on_load: bool,
    }

    #[async_trait]
    impl ClipLoader for StallingLoader {
        async fn load(&self, _clip: &Recording) -> Result<Box<dyn ClipPlayback>, String> {
            let n = self.loads.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if self.hang_on_load && n > 0 {
                std::future::pending::<()>().await;
            }
            Ok(Box::new(StalledClip {
                released: self.released.clone(),
            }))
        }
    }

    async fn cancel_stalled_combine(hang_on_load: bool) {
        let released = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let canvas = Arc::new(SyntheticCanvas::new());
        let combiner = SequenceCombiner::new(
            Arc::new(StallingLoader {
                loads: std::sync::atomic::AtomicUsize::new(0),
                released: released.clone(),
                hang_on_load,
            }),
            canvas.clone(),
            Arc::new(SyntheticRecorderFactory::new()),
            RecorderOptions::default(),
            30,
        );

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            canceller.cancel();
        });

        let result = combiner.combine(&[clip(0, 1000), clip(1, 1000)], &cancel).await;

        assert_matches!(result, Err(CombineError::Cancelled));
        assert!(released.load(std::sync::atomic::Ordering::SeqCst));
        assert!(canvas.size().is_none());
        assert_eq!(canvas.live_capture_tracks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_loading_clip() {
        cancel_stalled_combine(true).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_waiting_for_dimensions() {
        cancel_stalled_combine(false).await;
    }
}
