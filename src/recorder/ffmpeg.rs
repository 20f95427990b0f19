//! FFmpeg-backed media recorder
//!
//! Feeds the rendered video track to ffmpeg as raw RGB24 frames on stdin and
//! the mixed audio as `f32le` PCM over a loopback TCP input. The encoded
//! container is read from ffmpeg's stdout and handed over once per timeslice.

use crate::capture::{f32le_bytes, AudioBlock, VideoFrame};
use crate::composer::ComposedStream;
use crate::export::locate_ffmpeg;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::channel::{MediaRecorder, RecorderFactory, RecorderOptions, RecordingError, RecordingResult};

/// How long to wait for the first frame of the video track
const FIRST_FRAME_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait for the first PCM block before recording silence
const FIRST_AUDIO_TIMEOUT: Duration = Duration::from_secs(1);

/// Output container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Container {
    Webm,
    Mp4,
}

impl Container {
    pub fn from_mime(mime_type: &str) -> Self {
        if mime_type.contains("mp4") {
            Container::Mp4
        } else {
            Container::Webm
        }
    }
}

/// Where the audio stream comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioInput {
    /// Interleaved `f32le` PCM written to a loopback socket
    Pcm {
        sample_rate: u32,
        channels: u16,
        address: SocketAddr,
    },
    /// Generated silence
    Silence,
}

/// Arguments of one recorder process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecorderCommand {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub audio: AudioInput,
    pub container: Container,
    pub video_bitrate: Option<u32>,
    pub audio_bitrate: Option<u32>,
}

impl RecorderCommand {
    pub fn to_args(&self) -> Vec<String> {
        let mut args: Vec<String> = [
            "-hide_banner",
            "-loglevel",
            "error",
            "-f",
            "rawvideo",
            "-pix_fmt",
            "rgb24",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.extend([
            "-s".to_string(),
            format!("{}x{}", self.width, self.height),
            "-r".to_string(),
            self.frame_rate.to_string(),
            "-i".to_string(),
            "pipe:0".to_string(),
        ]);

        match self.audio {
            AudioInput::Pcm {
                sample_rate,
                channels,
                address,
            } => args.extend([
                "-f".to_string(),
                "f32le".to_string(),
                "-ar".to_string(),
                sample_rate.to_string(),
                "-ac".to_string(),
                channels.to_string(),
                "-i".to_string(),
                format!("tcp://{}", address),
            ]),
            AudioInput::Silence => args.extend([
                "-f".to_string(),
                "lavfi".to_string(),
                "-i".to_string(),
                "anullsrc=r=48000:cl=stereo".to_string(),
                "-shortest".to_string(),
            ]),
        }

        args.extend(["-map", "0:v", "-map", "1:a"].iter().map(|s| s.to_string()));

        let video_bitrate = self.video_bitrate.unwrap_or(2_500_000).to_string();
        let audio_bitrate = self.audio_bitrate.unwrap_or(128_000).to_string();
        match self.container {
            Container::Webm => {
                args.extend(
                    ["-c:v", "libvpx", "-deadline", "realtime", "-cpu-used", "8"]
                        .iter()
                        .map(|s| s.to_string()),
                );
                args.extend(["-b:v".to_string(), video_bitrate]);
                args.extend(["-c:a".to_string(), "libopus".to_string()]);
                args.extend(["-b:a".to_string(), audio_bitrate]);
                args.extend(["-f".to_string(), "webm".to_string()]);
            }
            Container::Mp4 => {
                args.extend(
                    ["-c:v", "libx264", "-preset", "veryfast", "-pix_fmt", "yuv420p"]
                        .iter()
                        .map(|s| s.to_string()),
                );
                args.extend(["-b:v".to_string(), video_bitrate]);
                args.extend(["-c:a".to_string(), "aac".to_string()]);
                args.extend(["-b:a".to_string(), audio_bitrate]);
                // A seekable moov atom is impossible on a pipe
                args.extend(
                    ["-movflags", "frag_keyframe+empty_moov", "-f", "mp4"]
                        .iter()
                        .map(|s| s.to_string()),
                );
            }
        }

        args.push("pipe:1".to_string());
        args
    }
}

struct Running {
    child: Child,
    stop: CancellationToken,
    writers: Vec<JoinHandle<()>>,
    reader: JoinHandle<()>,
    log: JoinHandle<String>,
}

/// Records a composed stream through the ffmpeg binary
pub struct FfmpegRecorder {
    options: RecorderOptions,
    binary: Option<PathBuf>,
    paused: Arc<AtomicBool>,
    running: Option<Running>,
}

impl FfmpegRecorder {
    /// Use `binary` if given, otherwise look ffmpeg up on PATH
    pub fn new(options: RecorderOptions, binary: Option<PathBuf>) -> Self {
        Self {
            options,
            binary,
            paused: Arc::new(AtomicBool::new(false)),
            running: None,
        }
    }

    fn running(&self) -> RecordingResult<&Running> {
        self.running
            .as_ref()
            .ok_or_else(|| RecordingError::Recorder("recorder not started".into()))
    }
}

async fn first_video_frame(feed: &mut broadcast::Receiver<VideoFrame>) -> Option<VideoFrame> {
    loop {
        match feed.recv().await {
            Ok(frame) if frame.is_rgb24() && frame.width > 0 => return Some(frame),
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

async fn next_audio_block(feed: &mut broadcast::Receiver<AudioBlock>) -> Option<AudioBlock> {
    loop {
        match feed.recv().await {
            Ok(block) => return Some(block),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!("Recorder audio lagged, {} blocks dropped", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

/// Write the latest frame once per frame period until stopped
async fn write_video<W: AsyncWrite + Unpin>(
    mut sink: W,
    mut feed: broadcast::Receiver<VideoFrame>,
    mut latest: VideoFrame,
    frame_rate: u32,
    paused: Arc<AtomicBool>,
    stop: CancellationToken,
) {
    let mut ticker = interval(Duration::from_secs_f64(1.0 / frame_rate.max(1) as f64));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            frame = feed.recv() => match frame {
                // The encoder is fixed to the first frame's size
                Ok(frame) if frame.width == latest.width && frame.height == latest.height && frame.is_rgb24() => {
                    latest = frame;
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = ticker.tick() => {
                if paused.load(Ordering::SeqCst) {
                    continue;
                }
                if let Err(e) = sink.write_all(&latest.data).await {
                    tracing::warn!("Recorder video input closed: {}", e);
                    break;
                }
            }
        }
    }

    let _ = sink.shutdown().await;
}

/// Accept the encoder's connection and stream PCM into it until stopped
async fn write_audio(
    listener: TcpListener,
    mut feed: broadcast::Receiver<AudioBlock>,
    first: AudioBlock,
    paused: Arc<AtomicBool>,
    stop: CancellationToken,
) {
    let mut socket = tokio::select! {
        _ = stop.cancelled() => return,
        accepted = listener.accept() => match accepted {
            Ok((socket, _)) => socket,
            Err(e) => {
                tracing::warn!("Recorder audio input never connected: {}", e);
                return;
            }
        },
    };

    let (sample_rate, channels) = (first.sample_rate, first.channels);
    let mut pending = Some(first);

    loop {
        let block = match pending.take() {
            Some(block) => block,
            None => tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                block = next_audio_block(&mut feed) => match block {
                    Some(block) => block,
                    None => break,
                },
            },
        };

        if paused.load(Ordering::SeqCst) {
            continue;
        }
        let bytes = f32le_bytes(&block.convert(sample_rate, channels));
        if let Err(e) = socket.write_all(&bytes).await {
            tracing::warn!("Recorder audio input closed: {}", e);
            break;
        }
    }

    let _ = socket.shutdown().await;
}

/// Hand over everything read since the last timeslice, then the remainder at EOF
async fn read_chunks<R: AsyncRead + Unpin>(mut source: R, timeslice: Duration, chunk_tx: mpsc::UnboundedSender<Bytes>) {
    let mut buf = BytesMut::with_capacity(64 * 1024);
    let mut ticker = interval_at(Instant::now() + timeslice, timeslice);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            read = source.read_buf(&mut buf) => match read {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::error!("Failed to read recorder output: {}", e);
                    break;
                }
            },
            _ = ticker.tick() => {
                if !buf.is_empty() && chunk_tx.send(buf.split().freeze()).is_err() {
                    return;
                }
            }
        }
    }

    if !buf.is_empty() {
        let _ = chunk_tx.send(buf.freeze());
    }
}

#[async_trait]
impl MediaRecorder for FfmpegRecorder {
    fn mime_type(&self) -> &str {
        &self.options.mime_type
    }

    async fn start(&mut self, stream: &ComposedStream) -> RecordingResult<mpsc::UnboundedReceiver<Bytes>> {
        if self.running.is_some() {
            return Err(RecordingError::Recorder("recorder already started".into()));
        }

        let mut video = stream
            .video_feed()
            .ok_or_else(|| RecordingError::Recorder("stream has no video frames to encode".into()))?;
        let first_frame = timeout(FIRST_FRAME_TIMEOUT, first_video_frame(&mut video))
            .await
            .ok()
            .flatten()
            .ok_or_else(|| RecordingError::Recorder("no video frames arrived".into()))?;

        let mut audio_feed = stream.audio_feed();
        let first_block = match audio_feed.as_mut() {
            Some(feed) => timeout(FIRST_AUDIO_TIMEOUT, next_audio_block(feed)).await.ok().flatten(),
            None => None,
        };

        let binary = locate_ffmpeg(self.binary.as_deref()).map_err(|e| RecordingError::Recorder(e.to_string()))?;

        let listener = match &first_block {
            Some(_) => Some(
                TcpListener::bind(("127.0.0.1", 0))
                    .await
                    .map_err(|e| RecordingError::Recorder(format!("failed to open audio input: {}", e)))?,
            ),
            None => None,
        };
        let audio = match (&listener, &first_block) {
            (Some(listener), Some(block)) => AudioInput::Pcm {
                sample_rate: block.sample_rate,
                channels: block.channels,
                address: listener
                    .local_addr()
                    .map_err(|e| RecordingError::Recorder(format!("failed to open audio input: {}", e)))?,
            },
            _ => {
                tracing::warn!("No audio reached the recorder, recording silence");
                AudioInput::Silence
            }
        };

        let command = RecorderCommand {
            width: first_frame.width,
            height: first_frame.height,
            frame_rate: self.options.frame_rate,
            audio,
            container: Container::from_mime(&self.options.mime_type),
            video_bitrate: self.options.video_bitrate,
            audio_bitrate: self.options.audio_bitrate,
        };
        let args = command.to_args();
        tracing::info!("Starting FFmpeg recorder: {:?}", args);

        let mut child = Command::new(&binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RecordingError::Recorder(format!("Failed to start FFmpeg: {}", e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RecordingError::Recorder("Failed to capture FFmpeg stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RecordingError::Recorder("Failed to capture FFmpeg stdout".into()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| RecordingError::Recorder("Failed to capture FFmpeg stderr".into()))?;

        let log = tokio::spawn(async move {
            let mut log = String::new();
            let _ = stderr.read_to_string(&mut log).await;
            log
        });

        let stop = CancellationToken::new();
        self.paused.store(false, Ordering::SeqCst);

        let mut writers = vec![tokio::spawn(write_video(
            stdin,
            video,
            first_frame,
            self.options.frame_rate,
            self.paused.clone(),
            stop.clone(),
        ))];
        if let (Some(listener), Some(feed), Some(block)) = (listener, audio_feed, first_block) {
            writers.push(tokio::spawn(write_audio(
                listener,
                feed,
                block,
                self.paused.clone(),
                stop.clone(),
            )));
        }

        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_chunks(stdout, self.options.timeslice, chunk_tx));

        self.running = Some(Running {
            child,
            stop,
            writers,
            reader,
            log,
        });
        Ok(chunk_rx)
    }

    async fn pause(&mut self) -> RecordingResult<()> {
        self.running()?;
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&mut self) -> RecordingResult<()> {
        self.running()?;
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&mut self) -> RecordingResult<()> {
        let mut running = self
            .running
            .take()
            .ok_or_else(|| RecordingError::Recorder("recorder not started".into()))?;

        // Closing both inputs lets ffmpeg flush the container trailer
        running.stop.cancel();
        for writer in running.writers {
            let _ = writer.await;
        }
        running
            .reader
            .await
            .map_err(|e| RecordingError::Recorder(format!("recorder output failed: {}", e)))?;

        let status = running
            .child
            .wait()
            .await
            .map_err(|e| RecordingError::Recorder(format!("FFmpeg did not exit: {}", e)))?;
        let log = running.log.await.unwrap_or_default();

        if !status.success() {
            tracing::error!("FFmpeg recorder exited with {}", status);
            let tail: Vec<&str> = log.lines().rev().take(10).collect();
            return Err(RecordingError::Recorder(format!(
                "ffmpeg exited with {}: {}",
                status,
                tail.into_iter().rev().collect::<Vec<_>>().join(" | ")
            )));
        }

        tracing::debug!("FFmpeg recorder finished");
        Ok(())
    }

    fn is_recording(&self) -> bool {
        self.running.is_some() && !self.paused.load(Ordering::SeqCst)
    }
}

impl Drop for FfmpegRecorder {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.stop.cancel();
            for writer in running.writers {
                writer.abort();
            }
            running.reader.abort();
            running.log.abort();
        }
    }
}

/// Creates ffmpeg recorders sharing one binary location
#[derive(Debug, Clone, Default)]
pub struct FfmpegRecorderFactory {
    binary: Option<PathBuf>,
}

impl FfmpegRecorderFactory {
    pub fn new(binary: Option<PathBuf>) -> Self {
        Self { binary }
    }
}

impl RecorderFactory for FfmpegRecorderFactory {
    fn create(&self, options: &RecorderOptions) -> Box<dyn MediaRecorder> {
        Box::new(FfmpegRecorder::new(options.clone(), self.binary.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{LocalTrack, TrackKind, TrackRef};
    use crate::capture::traits::MediaTrack;
    use assert_matches::assert_matches;

    fn command(audio: AudioInput, container: Container) -> RecorderCommand {
        RecorderCommand {
            width: 1280,
            height: 720,
            frame_rate: 30,
            audio,
            container,
            video_bitrate: Some(2_500_000),
            audio_bitrate: None,
        }
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Vec<&'a str> {
        args.windows(2)
            .filter(|w| w[0] == flag)
            .map(|w| w[1].as_str())
            .collect()
    }

    #[test]
    fn test_webm_with_pcm_input() {
        let address: SocketAddr = "127.0.0.1:40123".parse().unwrap();
        let args = command(
            AudioInput::Pcm {
                sample_rate: 48_000,
                channels: 2,
                address,
            },
            Container::Webm,
        )
        .to_args();

        assert_eq!(value_after(&args, "-i"), vec!["pipe:0", "tcp://127.0.0.1:40123"]);
        assert_eq!(value_after(&args, "-s"), vec!["1280x720"]);
        assert_eq!(value_after(&args, "-f"), vec!["rawvideo", "f32le", "webm"]);
        assert_eq!(value_after(&args, "-c:a"), vec!["libopus"]);
        assert_eq!(value_after(&args, "-b:v"), vec!["2500000"]);
        assert!(!args.contains(&"-shortest".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("pipe:1"));
    }

    #[test]
    fn test_mp4_with_silence_is_fragmented() {
        let args = command(AudioInput::Silence, Container::Mp4).to_args();

        assert!(value_after(&args, "-i").contains(&"anullsrc=r=48000:cl=stereo"));
        assert!(args.contains(&"-shortest".to_string()));
        assert_eq!(value_after(&args, "-movflags"), vec!["frag_keyframe+empty_moov"]);
        assert_eq!(value_after(&args, "-c:v"), vec!["libx264"]);
    }

    #[test]
    fn test_container_from_mime() {
        assert_eq!(Container::from_mime("video/mp4"), Container::Mp4);
        assert_eq!(Container::from_mime("video/webm;codecs=vp8,opus"), Container::Webm);
    }

    fn stream(video: LocalTrack) -> ComposedStream {
        ComposedStream::direct(
            vec![Arc::new(video) as TrackRef],
            Arc::new(LocalTrack::new(TrackKind::Audio, "mic")) as TrackRef,
        )
    }

    #[tokio::test]
    async fn test_start_needs_video_frames() {
        let mut recorder = FfmpegRecorder::new(RecorderOptions::default(), None);
        let result = recorder.start(&stream(LocalTrack::new(TrackKind::Video, "cam"))).await;

        assert_matches!(result, Err(RecordingError::Recorder(_)));
        assert!(!recorder.is_recording());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_times_out_without_first_frame() {
        let mut recorder = FfmpegRecorder::new(RecorderOptions::default(), None);
        let started = Instant::now();
        let result = recorder.start(&stream(LocalTrack::with_feed(TrackKind::Video, "cam"))).await;

        assert_matches!(result, Err(RecordingError::Recorder(message)) if message.contains("no video frames"));
        assert_eq!(started.elapsed(), FIRST_FRAME_TIMEOUT);
    }

    #[tokio::test]
    async fn test_pause_before_start() {
        let mut recorder = FfmpegRecorder::new(RecorderOptions::default(), None);
        assert_matches!(recorder.pause().await, Err(RecordingError::Recorder(_)));
        assert_matches!(recorder.stop().await, Err(RecordingError::Recorder(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_output_is_chunked_per_timeslice() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(read_chunks(reader, Duration::from_secs(1), chunk_tx));

        writer.write_all(b"header").await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        writer.write_all(b"tail").await.unwrap();
        drop(writer);
        task.await.unwrap();

        assert_eq!(chunk_rx.recv().await.unwrap(), Bytes::from_static(b"header"));
        assert_eq!(chunk_rx.recv().await.unwrap(), Bytes::from_static(b"tail"));
        assert!(chunk_rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_video_writes_nothing() {
        let (writer, mut reader) = tokio::io::duplex(1 << 16);
        let track = LocalTrack::with_feed(TrackKind::Video, "cam");
        let frame = VideoFrame {
            width: 2,
            height: 1,
            timestamp: Duration::ZERO,
            data: Bytes::from(vec![9u8; 6]),
        };
        let paused = Arc::new(AtomicBool::new(true));
        let stop = CancellationToken::new();
        let task = tokio::spawn(write_video(
            writer,
            track.video_feed().unwrap(),
            frame,
            10,
            paused.clone(),
            stop.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(500)).await;
        paused.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(250)).await;
        stop.cancel();
        task.await.unwrap();

        let mut written = Vec::new();
        reader.read_to_end(&mut written).await.unwrap();
        // Only the ticks after resume wrote a frame
        assert!(!written.is_empty() && written.len() <= 6 * 4);
        assert_eq!(written.len() % 6, 0);
    }
}
