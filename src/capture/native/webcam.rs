//! Camera capture using nokhwa
//!
//! The camera is opened and read on a dedicated thread. Frames are decoded to
//! RGB24 and published until the track is stopped.

use super::{classify_platform_error, DEFAULT_FRAME_RATE};
use crate::capture::feed::VideoFrame;
use crate::capture::track::LocalTrack;
use crate::capture::traits::{CaptureError, CaptureHints, CaptureResult, MediaTrack, SourceKind, TrackKind, TrackRef};
use bytes::Bytes;
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{
    ApiBackend, CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType,
    Resolution as CameraResolution,
};
use nokhwa::Camera;
use std::sync::Arc;
use tokio::sync::oneshot;

fn requested_format(hints: &CaptureHints) -> RequestedFormat<'static> {
    match hints.resolution {
        Some(resolution) => RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(CameraFormat::new(
            CameraResolution::new(resolution.width, resolution.height),
            FrameFormat::MJPEG,
            hints.frame_rate.unwrap_or(DEFAULT_FRAME_RATE),
        ))),
        None => RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestResolution),
    }
}

/// Open the first camera
pub async fn open(hints: &CaptureHints) -> CaptureResult<Vec<TrackRef>> {
    let cameras = nokhwa::query(ApiBackend::Auto)
        .map_err(|e| classify_platform_error(SourceKind::Camera, &e.to_string()))?;
    let info = cameras
        .first()
        .ok_or_else(|| CaptureError::DeviceUnavailable("no camera found".into()))?;
    let index = info.index().clone();
    let name = info.human_name();

    let track = Arc::new(LocalTrack::with_feed(TrackKind::Video, name.clone()));
    let requested = requested_format(hints);
    let (ready_tx, ready_rx) = oneshot::channel();

    let thread_track = track.clone();
    std::thread::spawn(move || run_camera(index, requested, thread_track, ready_tx));

    ready_rx
        .await
        .map_err(|_| CaptureError::Platform("camera thread exited".into()))??;

    tracing::info!("Camera {} opened", name);
    Ok(vec![track as TrackRef])
}

fn run_camera(
    index: CameraIndex,
    requested: RequestedFormat<'static>,
    track: Arc<LocalTrack>,
    ready: oneshot::Sender<CaptureResult<()>>,
) {
    let fail = |ready: oneshot::Sender<CaptureResult<()>>, e: nokhwa::NokhwaError| {
        let _ = ready.send(Err(classify_platform_error(SourceKind::Camera, &e.to_string())));
    };

    let mut camera = match Camera::new(index, requested) {
        Ok(camera) => camera,
        Err(e) => return fail(ready, e),
    };
    if let Err(e) = camera.open_stream() {
        return fail(ready, e);
    }

    let format = camera.camera_format();
    tracing::debug!(
        "Camera stream: {}x{} @ {}fps ({:?})",
        format.resolution().width(),
        format.resolution().height(),
        format.frame_rate(),
        format.format()
    );
    let _ = ready.send(Ok(()));

    let started = std::time::Instant::now();
    while track.is_live() {
        let buffer = match camera.frame() {
            Ok(buffer) => buffer,
            Err(e) => {
                tracing::error!("Camera frame failed: {}", e);
                break;
            }
        };
        let image = match buffer.decode_image::<RgbFormat>() {
            Ok(image) => image,
            Err(e) => {
                tracing::warn!("Failed to decode camera frame: {}", e);
                continue;
            }
        };

        let frame = VideoFrame {
            width: image.width(),
            height: image.height(),
            timestamp: started.elapsed(),
            data: Bytes::from(image.into_raw()),
        };
        if !track.push_video(frame) {
            break;
        }
    }

    let _ = camera.stop_stream();
    track.stop();
    tracing::debug!("Camera thread finished");
}
