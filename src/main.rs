mod cli;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use cli::{Cli, Commands};
use mockview_capture::capture::{DeviceAcquirer, NativeDevices, SourceKind};
use mockview_capture::combiner::{FfmpegClipLoader, FrameCanvas, SequenceCombiner};
use mockview_capture::config::{self, EngineConfig};
use mockview_capture::export::{
    AspectRatio, BackgroundImage, CompositionSpec, CompositionStage, EncoderSettings,
    EncodingEngine, ExportStage, FfmpegEngine,
};
use mockview_capture::recorder::state::mime_for_extension;
use mockview_capture::recorder::{
    CapturePlan, CaptureSession, FfmpegRecorderFactory, RecorderFactory, RecorderOptions, Recording,
};
use mockview_capture::upload::{UploadClient, UploadMetadata, UploadProgress};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Cancel `token` on Ctrl-C
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, cancelling");
            token.cancel();
        }
    });
}

fn read_recording(path: &Path, duration: Option<f64>) -> Result<Recording> {
    let data = std::fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("webm");
    let duration = duration.map(Duration::from_secs_f64).unwrap_or_default();
    Ok(Recording::from_blob(Bytes::from(data), mime_for_extension(extension), duration))
}

/// Recorder options for a file written to `output`
fn recorder_options(config: &EngineConfig, output: &Path) -> RecorderOptions {
    let mut options = RecorderOptions::from(&config.capture);
    if let Some(extension) = output.extension().and_then(|e| e.to_str()) {
        options.mime_type = mime_for_extension(extension).to_string();
    }
    options
}

async fn record(config: &EngineConfig, output: &Path, screen: bool, duration: Option<f64>) -> Result<()> {
    let ffmpeg = config.composition.ffmpeg_path.clone();
    let mut acquirer =
        DeviceAcquirer::new(Arc::new(NativeDevices::new(ffmpeg.clone()))).with_hints(config.capture.hints());

    let plan = if screen {
        CapturePlan {
            video: vec![SourceKind::Screen],
            audio: vec![SourceKind::Microphone, SourceKind::SystemAudio],
        }
    } else {
        CapturePlan::camera_with_microphone()
    };

    let recorder = FfmpegRecorderFactory::new(ffmpeg).create(&recorder_options(config, output));
    let mut session = CaptureSession::new(recorder);
    for warning in session.acquire(&mut acquirer, &plan).await? {
        eprintln!("warning: {} unavailable ({})", warning.kind, warning.reason);
    }
    let mut revoked = session.revocation_watch();

    session.start().await?;
    eprintln!("Recording... press Ctrl-C to stop");

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());
    let limit = async {
        match duration {
            Some(seconds) => tokio::time::sleep(Duration::from_secs_f64(seconds)).await,
            None => std::future::pending().await,
        }
    };

    let recording = tokio::select! {
        _ = cancel.cancelled() => session.stop().await?,
        _ = limit => session.stop().await?,
        _ = revoked.wait() => {
            eprintln!("Screen share ended");
            session
                .handle_external_stop()
                .await?
                .context("Recording did not finalize")?
        }
    };
    acquirer.close_all();

    std::fs::write(output, &recording.data).with_context(|| format!("Failed to write {:?}", output))?;
    eprintln!(
        "{} bytes, {:.1}s",
        recording.len(),
        recording.duration.as_secs_f64()
    );
    println!("{}", output.display());
    Ok(())
}

async fn combine(config: &EngineConfig, inputs: &[PathBuf], output: &Path) -> Result<()> {
    let clips = inputs
        .iter()
        .map(|path| read_recording(path, None))
        .collect::<Result<Vec<_>>>()?;

    let ffmpeg = config.composition.ffmpeg_path.clone();
    let combiner = SequenceCombiner::new(
        Arc::new(FfmpegClipLoader::new(ffmpeg.clone())),
        Arc::new(FrameCanvas::new()),
        Arc::new(FfmpegRecorderFactory::new(ffmpeg)),
        recorder_options(config, output),
        config.combiner.frame_rate,
    );

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let combined = combiner.combine(&clips, &cancel).await?;
    std::fs::write(output, &combined.data).with_context(|| format!("Failed to write {:?}", output))?;
    println!("{}", output.display());
    Ok(())
}

struct ComposeArgs {
    input: PathBuf,
    background: PathBuf,
    output: Option<PathBuf>,
    aspect: String,
    border: bool,
    shadow: bool,
    blur: u8,
    scale: Option<f64>,
    duration: Option<f64>,
}

async fn compose(config: &EngineConfig, args: ComposeArgs) -> Result<()> {
    let recording = read_recording(&args.input, args.duration)?;
    let background_data = std::fs::read(&args.background)
        .with_context(|| format!("Failed to read background {:?}", args.background))?;
    let file_name = args
        .background
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "background.png".to_string());

    let spec = CompositionSpec {
        background: Some(BackgroundImage {
            file_name,
            data: Bytes::from(background_data),
        }),
        aspect: args.aspect.parse::<AspectRatio>()?,
        border: args.border,
        shadow: args.shadow,
        blur: args.blur,
        scale: args.scale.unwrap_or(config.composition.default_scale),
    };

    let engine = Arc::new(FfmpegEngine::new(config.composition.ffmpeg_path.clone()));
    let stage = CompositionStage::new(engine, EncoderSettings::from(&config.composition));

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let file = stage
        .compose(&recording, &spec, &cancel, |progress| {
            if !matches!(progress.stage, ExportStage::Error { .. }) {
                eprintln!("{:>5.1}% {:?}", progress.percent, progress.stage);
            }
        })
        .await?;

    let output = args
        .output
        .unwrap_or_else(|| args.input.with_extension("composed.mp4"));
    std::fs::write(&output, &file.data).with_context(|| format!("Failed to write {:?}", output))?;
    println!("{}", output.display());
    Ok(())
}

async fn upload(
    config: &EngineConfig,
    file: &Path,
    title: String,
    description: String,
    tags: Vec<String>,
    token: Option<String>,
) -> Result<()> {
    let recording = read_recording(file, None)?;

    let mut all_tags = config.upload.default_tags.clone();
    all_tags.extend(tags);
    let mut metadata = UploadMetadata::new(title)
        .with_description(description)
        .with_tags(all_tags);
    metadata.privacy = config.upload.privacy.clone();

    let client = UploadClient::new(&config.upload, token);
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let result = client
        .upload(&recording, &metadata, &cancel, |progress| match progress {
            UploadProgress::Sending { bytes } => eprintln!("Sending {} bytes...", bytes),
            other => eprintln!("{:?}", other),
        })
        .await?;

    println!("{}", result.remote_url);
    Ok(())
}

async fn check_tools(config: &EngineConfig) -> Result<()> {
    let engine = FfmpegEngine::new(config.composition.ffmpeg_path.clone());
    match engine.load().await {
        Ok(()) => println!("ffmpeg: ok"),
        Err(e) => println!("ffmpeg: {}", e),
    }
    Ok(())
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    let config = config::load_config_or_default(path)?;
    println!("Configuration is valid");
    println!("  segments: at most {}", config.segments.max_segments);
    println!("  feedback countdown: {}s", config.feedback.countdown_secs);
    println!("  upload endpoint: {}", config.upload.endpoint);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    mockview_capture::init_tracing();

    if let Commands::Validate { config: config_path } = &cli.command {
        let path = config_path.clone().or_else(|| cli.config.clone());
        return validate_config(path.as_deref());
    }

    let config = config::load_config_or_default(cli.config.as_deref())?;

    match cli.command {
        Commands::Record {
            output,
            screen,
            duration,
        } => record(&config, &output, screen, duration).await,
        Commands::Combine { inputs, output } => combine(&config, &inputs, &output).await,
        Commands::Compose {
            input,
            background,
            output,
            aspect,
            border,
            shadow,
            blur,
            scale,
            duration,
        } => {
            compose(
                &config,
                ComposeArgs {
                    input,
                    background,
                    output,
                    aspect,
                    border,
                    shadow,
                    blur,
                    scale,
                    duration,
                },
            )
            .await
        }
        Commands::Upload {
            file,
            title,
            description,
            tags,
            token,
        } => upload(&config, &file, title, description, tags, token).await,
        Commands::CheckTools => check_tools(&config).await,
        Commands::Validate { .. } => Ok(()),
    }
}
