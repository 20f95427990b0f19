//! Microphone and system audio capture using cpal
//!
//! The cpal stream is built and kept alive on its own thread while the track
//! is live. System audio uses WASAPI loopback (an input stream on the default
//! output device) and is only available on Windows.

use super::classify_platform_error;
use crate::capture::feed::AudioBlock;
use crate::capture::track::LocalTrack;
use crate::capture::traits::{CaptureError, CaptureResult, MediaTrack, SourceKind, TrackKind, TrackRef};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, SizedSample, StreamConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy)]
enum Endpoint {
    Microphone,
    Loopback,
}

impl Endpoint {
    fn kind(self) -> SourceKind {
        match self {
            Endpoint::Microphone => SourceKind::Microphone,
            Endpoint::Loopback => SourceKind::SystemAudio,
        }
    }
}

pub async fn open_microphone() -> CaptureResult<Vec<TrackRef>> {
    open(Endpoint::Microphone).await
}

pub async fn open_system_audio() -> CaptureResult<Vec<TrackRef>> {
    if !cfg!(target_os = "windows") {
        return Err(CaptureError::DeviceUnavailable(
            "system audio loopback is only available on Windows".into(),
        ));
    }
    open(Endpoint::Loopback).await
}

async fn open(endpoint: Endpoint) -> CaptureResult<Vec<TrackRef>> {
    let (ready_tx, ready_rx) = oneshot::channel();
    let track = Arc::new(LocalTrack::with_feed(TrackKind::Audio, endpoint.kind().to_string()));

    let thread_track = track.clone();
    std::thread::spawn(move || run_stream(endpoint, thread_track, ready_tx));

    ready_rx
        .await
        .map_err(|_| CaptureError::Platform("audio thread exited".into()))??;

    tracing::info!("{} capture started", endpoint.kind());
    Ok(vec![track as TrackRef])
}

fn build_stream<T>(device: &Device, config: &StreamConfig, track: Arc<LocalTrack>) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let sample_rate = config.sample_rate.0;
    let channels = config.channels;

    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            let samples = data.iter().map(|s| s.to_sample::<f32>()).collect();
            track.push_audio(AudioBlock::new(sample_rate, channels, samples));
        },
        |err| tracing::error!("Audio stream error: {}", err),
        None,
    )
}

fn run_stream(endpoint: Endpoint, track: Arc<LocalTrack>, ready: oneshot::Sender<CaptureResult<()>>) {
    let kind = endpoint.kind();
    let host = cpal::default_host();

    let device = match endpoint {
        Endpoint::Microphone => host.default_input_device(),
        Endpoint::Loopback => host.default_output_device(),
    };
    let Some(device) = device else {
        let _ = ready.send(Err(CaptureError::DeviceUnavailable(format!("no {} device", kind))));
        return;
    };

    let config = match endpoint {
        Endpoint::Microphone => device.default_input_config(),
        Endpoint::Loopback => device.default_output_config(),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            let _ = ready.send(Err(classify_platform_error(kind, &e.to_string())));
            return;
        }
    };

    let sample_format = config.sample_format();
    let stream_config: StreamConfig = config.into();
    let stream = match sample_format {
        SampleFormat::F32 => build_stream::<f32>(&device, &stream_config, track.clone()),
        SampleFormat::I16 => build_stream::<i16>(&device, &stream_config, track.clone()),
        SampleFormat::U16 => build_stream::<u16>(&device, &stream_config, track.clone()),
        other => {
            let _ = ready.send(Err(CaptureError::Platform(format!(
                "unsupported sample format {:?}",
                other
            ))));
            return;
        }
    };

    let stream = match stream.map_err(|e| e.to_string()).and_then(|s| s.play().map(|_| s).map_err(|e| e.to_string())) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(classify_platform_error(kind, &e)));
            return;
        }
    };

    tracing::debug!(
        "{} stream: {}Hz, {} channels, {:?}",
        kind,
        stream_config.sample_rate.0,
        stream_config.channels,
        sample_format
    );
    let _ = ready.send(Ok(()));

    // Keep the stream alive while the track is live
    while track.is_live() {
        std::thread::sleep(Duration::from_millis(100));
    }

    drop(stream);
    tracing::debug!("{} stream stopped", kind);
}
