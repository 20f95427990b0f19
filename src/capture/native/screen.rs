//! Screen capture through an ffmpeg grab process
//!
//! The grab device writes packed RGB24 frames at the requested size to
//! stdout. The grab ending on its own is reported as the track ending, the
//! same way a revoked share would be.

use super::{classify_platform_error, DEFAULT_FRAME_RATE, DEFAULT_RESOLUTION};
use crate::capture::feed::VideoFrame;
use crate::capture::track::LocalTrack;
use crate::capture::traits::{
    CaptureError, CaptureHints, CaptureResult, MediaTrack, Resolution, SourceKind, TrackKind, TrackRef,
};
use crate::export::locate_ffmpeg;
use bytes::Bytes;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStdout, Command};
use tokio::time::{timeout, Instant};

/// How long the grab may take to deliver its first frame
const FIRST_FRAME_TIMEOUT: Duration = Duration::from_secs(5);

/// Platform grab device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrabInput {
    /// X11 display, e.g. `:0.0`
    X11(String),
    /// Windows GDI desktop
    Gdi,
    /// macOS AVFoundation screen device
    AvFoundation,
}

impl GrabInput {
    /// Grab device of the platform this binary was built for
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            GrabInput::Gdi
        } else if cfg!(target_os = "macos") {
            GrabInput::AvFoundation
        } else {
            let display = std::env::var("DISPLAY").unwrap_or_else(|_| ":0.0".to_string());
            GrabInput::X11(display)
        }
    }

    fn describe(&self) -> String {
        match self {
            GrabInput::X11(display) => format!("x11grab {}", display),
            GrabInput::Gdi => "gdigrab desktop".to_string(),
            GrabInput::AvFoundation => "avfoundation screen".to_string(),
        }
    }
}

/// Arguments grabbing the screen scaled and letterboxed to `size`
pub fn grab_args(input: &GrabInput, size: Resolution, frame_rate: u32) -> Vec<String> {
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "error".into()];

    let (format, device) = match input {
        GrabInput::X11(display) => ("x11grab", display.clone()),
        GrabInput::Gdi => ("gdigrab", "desktop".to_string()),
        GrabInput::AvFoundation => ("avfoundation", "Capture screen 0:none".to_string()),
    };
    args.extend([
        "-f".to_string(),
        format.to_string(),
        "-framerate".to_string(),
        frame_rate.to_string(),
        "-i".to_string(),
        device,
    ]);

    let (w, h) = (size.width, size.height);
    args.extend([
        "-vf".to_string(),
        format!(
            "scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2"
        ),
        "-pix_fmt".to_string(),
        "rgb24".to_string(),
        "-f".to_string(),
        "rawvideo".to_string(),
        "pipe:1".to_string(),
    ]);
    args
}

/// Start a screen grab and return its video track once the first frame
/// arrives
pub async fn open(ffmpeg: Option<&Path>, hints: &CaptureHints) -> CaptureResult<Vec<TrackRef>> {
    let binary = locate_ffmpeg(ffmpeg).map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?;
    let size = hints.resolution.unwrap_or(DEFAULT_RESOLUTION);
    let frame_rate = hints.frame_rate.unwrap_or(DEFAULT_FRAME_RATE);
    let input = GrabInput::current();
    let args = grab_args(&input, size, frame_rate);

    tracing::info!("Starting screen grab: {:?}", args);

    let mut child = Command::new(&binary)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| CaptureError::Platform(format!("Failed to start screen grab: {}", e)))?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| CaptureError::Platform("Failed to capture grab stdout".into()))?;

    let mut buf = vec![0u8; VideoFrame::rgb24_len(size.width, size.height)];
    let first = timeout(FIRST_FRAME_TIMEOUT, stdout.read_exact(&mut buf)).await;
    if !matches!(first, Ok(Ok(_))) {
        return Err(grab_failure(child).await);
    }

    let track = Arc::new(LocalTrack::with_feed(
        TrackKind::Video,
        format!("screen ({})", input.describe()),
    ));
    let started = Instant::now();
    track.push_video(VideoFrame {
        width: size.width,
        height: size.height,
        timestamp: Duration::ZERO,
        data: Bytes::from(buf),
    });

    tokio::spawn(pump_frames(child, stdout, track.clone(), size, started));
    Ok(vec![track as TrackRef])
}

/// Turn a grab that died before its first frame into a capture error
async fn grab_failure(mut child: Child) -> CaptureError {
    let _ = child.start_kill();
    let mut log = String::new();
    if let Some(mut stderr) = child.stderr.take() {
        let _ = stderr.read_to_string(&mut log).await;
    }
    let _ = child.wait().await;

    if log.trim().is_empty() {
        CaptureError::Platform("screen grab produced no frames".into())
    } else {
        tracing::error!("Screen grab failed: {}", log.trim());
        classify_platform_error(SourceKind::Screen, &log)
    }
}

async fn pump_frames(mut child: Child, stdout: ChildStdout, track: Arc<LocalTrack>, size: Resolution, started: Instant) {
    read_frames(stdout, &track, size, started).await;

    if track.is_live() {
        tracing::warn!("Screen grab ended, treating the share as revoked");
        track.stop();
    }
    let _ = child.kill().await;
}

/// Publish frames until the source closes or the track is stopped
async fn read_frames<R: AsyncRead + Unpin>(mut source: R, track: &LocalTrack, size: Resolution, started: Instant) {
    let mut ended = track.ended();
    let mut buf = vec![0u8; VideoFrame::rgb24_len(size.width, size.height)];

    loop {
        tokio::select! {
            _ = ended.wait_for(|ended| *ended) => break,
            read = source.read_exact(&mut buf) => {
                if read.is_err() {
                    break;
                }
                let frame = VideoFrame {
                    width: size.width,
                    height: size.height,
                    timestamp: started.elapsed(),
                    data: Bytes::copy_from_slice(&buf),
                };
                if !track.push_video(frame) {
                    break;
                }
            }
        }
    }
}
