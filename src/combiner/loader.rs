//! FFmpeg clip playback
//!
//! Each clip is written to a temp file, its banner is read for dimensions and
//! it is decoded in real time (`-re`) into raw RGB24 frames and `f32le` PCM.

use super::{ClipLoader, ClipPlayback};
use crate::capture::{AudioBlock, VideoFrame, AUDIO_FEED_CAPACITY};
use crate::export::{locate_ffmpeg, inspect_media, MediaInfo};
use crate::recorder::Recording;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Format clip audio is decoded to
const DECODE_SAMPLE_RATE: u32 = 48_000;
const DECODE_CHANNELS: u16 = 2;

/// Samples per published block (10 ms)
const BLOCK_FRAMES: usize = DECODE_SAMPLE_RATE as usize / 100;

/// Arguments decoding the first video stream to packed RGB24 frames
pub fn decode_video_args(path: &Path) -> Vec<String> {
    let mut args = vec!["-hide_banner".to_string(), "-loglevel".to_string(), "error".to_string()];
    args.extend(["-re".to_string(), "-i".to_string(), path.to_string_lossy().to_string()]);
    args.extend(
        ["-map", "0:v:0", "-f", "rawvideo", "-pix_fmt", "rgb24", "pipe:1"]
            .iter()
            .map(|s| s.to_string()),
    );
    args
}

/// Arguments decoding the first audio stream to interleaved `f32le`
pub fn decode_audio_args(path: &Path) -> Vec<String> {
    let mut args = vec!["-hide_banner".to_string(), "-loglevel".to_string(), "error".to_string()];
    args.extend(["-re".to_string(), "-i".to_string(), path.to_string_lossy().to_string()]);
    args.extend([
        "-map".to_string(),
        "0:a:0".to_string(),
        "-f".to_string(),
        "f32le".to_string(),
        "-ar".to_string(),
        DECODE_SAMPLE_RATE.to_string(),
        "-ac".to_string(),
        DECODE_CHANNELS.to_string(),
        "pipe:1".to_string(),
    ]);
    args
}

fn extension(mime_type: &str) -> &'static str {
    if mime_type.contains("mp4") {
        ".mp4"
    } else {
        ".webm"
    }
}

/// Loads recordings through the ffmpeg binary
#[derive(Debug, Clone, Default)]
pub struct FfmpegClipLoader {
    binary: Option<PathBuf>,
}

impl FfmpegClipLoader {
    /// Use `binary` if given, otherwise look ffmpeg up on PATH
    pub fn new(binary: Option<PathBuf>) -> Self {
        Self { binary }
    }
}

#[async_trait]
impl ClipLoader for FfmpegClipLoader {
    async fn load(&self, clip: &Recording) -> Result<Box<dyn ClipPlayback>, String> {
        let binary = locate_ffmpeg(self.binary.as_deref()).map_err(|e| e.to_string())?;

        let mut file = tempfile::Builder::new()
            .prefix("mockview-clip-")
            .suffix(extension(&clip.mime_type))
            .tempfile()
            .map_err(|e| format!("failed to create clip file: {}", e))?;
        file.write_all(&clip.data)
            .and_then(|_| file.flush())
            .map_err(|e| format!("failed to write clip file: {}", e))?;

        let info = inspect_media(&binary, file.path()).await.map_err(|e| e.to_string())?;
        tracing::debug!("Loaded clip {}: {:?}", clip.id, info);

        Ok(Box::new(FfmpegClip::new(binary, file, info)))
    }
}

/// Off-screen playback of one clip file
pub struct FfmpegClip {
    binary: PathBuf,
    file: NamedTempFile,
    info: MediaInfo,
    frame: Arc<Mutex<Option<VideoFrame>>>,
    ended: Arc<watch::Sender<bool>>,
    audio: broadcast::Sender<AudioBlock>,
    children: Mutex<Vec<Child>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    released: AtomicBool,
}

impl FfmpegClip {
    fn new(binary: PathBuf, file: NamedTempFile, info: MediaInfo) -> Self {
        Self {
            binary,
            file,
            info,
            frame: Arc::new(Mutex::new(None)),
            ended: Arc::new(watch::channel(false).0),
            audio: broadcast::channel(AUDIO_FEED_CAPACITY).0,
            children: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            released: AtomicBool::new(false),
        }
    }

    fn spawn_decoder(&self, args: Vec<String>) -> Result<(Child, tokio::process::ChildStdout), String> {
        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("Failed to start FFmpeg: {}", e))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| "Failed to capture FFmpeg stdout".to_string())?;
        Ok((child, stdout))
    }
}

async fn read_frames<R: AsyncRead + Unpin>(
    mut source: R,
    width: u32,
    height: u32,
    frame: Arc<Mutex<Option<VideoFrame>>>,
    ended: Arc<watch::Sender<bool>>,
) {
    let started = Instant::now();
    let mut buf = vec![0u8; VideoFrame::rgb24_len(width, height)];
    let mut count = 0u64;

    while source.read_exact(&mut buf).await.is_ok() {
        *frame.lock() = Some(VideoFrame {
            width,
            height,
            timestamp: started.elapsed(),
            data: Bytes::copy_from_slice(&buf),
        });
        count += 1;
    }

    tracing::debug!("Clip decoder finished after {} frames", count);
    ended.send_replace(true);
}

async fn read_pcm<R: AsyncRead + Unpin>(mut source: R, audio: broadcast::Sender<AudioBlock>) {
    let mut buf = vec![0u8; BLOCK_FRAMES * DECODE_CHANNELS as usize * 4];
    loop {
        let read = match source.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n - n % 4,
        };
        let samples = buf[..read]
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        let _ = audio.send(AudioBlock::new(DECODE_SAMPLE_RATE, DECODE_CHANNELS, samples));
    }
}

#[async_trait]
impl ClipPlayback for FfmpegClip {
    async fn dimensions(&self) -> Result<(u32, u32), String> {
        self.info
            .dimensions
            .ok_or_else(|| format!("clip {:?} has no video stream", self.file.path()))
    }

    async fn play(&self) -> Result<(), String> {
        if self.released.load(Ordering::SeqCst) {
            return Err("clip already released".to_string());
        }
        if !self.children.lock().is_empty() {
            return Ok(());
        }
        let (width, height) = self.dimensions().await?;

        let (video_child, stdout) = self.spawn_decoder(decode_video_args(self.file.path()))?;
        let mut tasks = vec![tokio::spawn(read_frames(
            stdout,
            width,
            height,
            self.frame.clone(),
            self.ended.clone(),
        ))];
        let mut children = vec![video_child];

        if self.info.has_audio {
            let (audio_child, stdout) = self.spawn_decoder(decode_audio_args(self.file.path()))?;
            tasks.push(tokio::spawn(read_pcm(stdout, self.audio.clone())));
            children.push(audio_child);
        }

        self.children.lock().extend(children);
        self.tasks.lock().extend(tasks);
        Ok(())
    }

    fn current_frame(&self) -> Option<VideoFrame> {
        self.frame.lock().clone()
    }

    async fn ended(&self) {
        let mut ended = self.ended.subscribe();
        let _ = ended.wait_for(|ended| *ended).await;
    }

    fn audio_feed(&self) -> Option<broadcast::Receiver<AudioBlock>> {
        self.info.has_audio.then(|| self.audio.subscribe())
    }

    fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        for mut child in self.children.lock().drain(..) {
            let _ = child.start_kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_decoder_args() {
        let path = Path::new("/tmp/clip.webm");

        let video = decode_video_args(path);
        assert!(video.windows(2).any(|w| w == ["-i", "/tmp/clip.webm"]));
        assert!(video.contains(&"-re".to_string()));
        assert!(video.windows(2).any(|w| w == ["-pix_fmt", "rgb24"]));

        let audio = decode_audio_args(path);
        assert!(audio.windows(2).any(|w| w == ["-map", "0:a:0"]));
        assert!(audio.windows(2).any(|w| w == ["-ar", "48000"]));
        assert_eq!(audio.last().map(String::as_str), Some("pipe:1"));
    }

    #[tokio::test]
    async fn test_load_without_ffmpeg() {
        let loader = FfmpegClipLoader::new(Some(PathBuf::from("/nonexistent/ffmpeg")));
        let clip = Recording::from_blob(Bytes::from_static(b"webm"), "video/webm", Duration::from_secs(1));

        let error = loader.load(&clip).await.err().unwrap();
        assert!(error.contains("not found"));
    }

    #[tokio::test]
    async fn test_frames_published_until_eof() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let frame = Arc::new(Mutex::new(None));
        let ended = Arc::new(watch::channel(false).0);
        let mut ended_rx = ended.subscribe();
        let task = tokio::spawn(read_frames(reader, 2, 1, frame.clone(), ended));

        tokio::io::AsyncWriteExt::write_all(&mut writer, &[1, 2, 3, 4, 5, 6, 7, 8]).await.unwrap();
        drop(writer);
        task.await.unwrap();

        // The trailing partial frame is dropped
        let last = frame.lock().clone().unwrap();
        assert_eq!(last.data, Bytes::from_static(&[1, 2, 3, 4, 5, 6]));
        assert!(*ended_rx.borrow_and_update());
    }

    #[tokio::test]
    async fn test_silent_clip_has_no_audio_feed() {
        let file = NamedTempFile::new().unwrap();
        let clip = FfmpegClip::new(
            PathBuf::from("ffmpeg"),
            file,
            MediaInfo {
                duration: Some(Duration::from_secs(2)),
                dimensions: Some((640, 360)),
                has_audio: false,
            },
        );

        assert_eq!(clip.dimensions().await.unwrap(), (640, 360));
        assert!(clip.audio_feed().is_none());
        assert!(clip.current_frame().is_none());

        clip.release();
        assert!(clip.play().await.is_err());
    }
}
