//! FFmpeg command building and execution
//!
//! Builds the filter graph that places a recording on a styled background and
//! drives the `ffmpeg` binary, parsing its `-progress` output.

use crate::export::types::{CompositionSpec, EncoderSettings, ExportError, ExportResult};
use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Label of the final video stage
pub const VIDEO_OUT: &str = "vout";

/// One named stage of a filter graph: `[in1][in2]filter[out]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterStage {
    pub inputs: Vec<String>,
    pub filter: String,
    pub output: String,
}

impl FilterStage {
    pub fn new(inputs: &[&str], filter: impl Into<String>, output: &str) -> Self {
        Self {
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            filter: filter.into(),
            output: output.to_string(),
        }
    }

    /// Name of the filter (first filter of the chain)
    pub fn name(&self) -> &str {
        self.filter
            .split(|c| c == '=' || c == ',')
            .next()
            .unwrap_or("")
    }
}

impl fmt::Display for FilterStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for input in &self.inputs {
            write!(f, "[{}]", input)?;
        }
        write!(f, "{}[{}]", self.filter, self.output)
    }
}

/// Ordered filter stages chained by output labels
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterGraph {
    stages: Vec<FilterStage>,
}

impl FilterGraph {
    pub fn push(&mut self, stage: FilterStage) {
        self.stages.push(stage);
    }

    pub fn stages(&self) -> &[FilterStage] {
        &self.stages
    }

    /// Label of the last stage
    pub fn output_label(&self) -> Option<&str> {
        self.stages.last().map(|s| s.output.as_str())
    }

    pub fn stage(&self, output: &str) -> Option<&FilterStage> {
        self.stages.iter().find(|s| s.output == output)
    }
}

impl fmt::Display for FilterGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.stages.iter().map(|s| s.to_string()).collect();
        write!(f, "{}", parts.join(";"))
    }
}

/// Build the overlay graph.
///
/// Input 0 is the recording, input 1 the background image.
/// 1. background scaled/cropped to the canvas (optionally blurred)
/// 2. recording scaled/padded to the interior size
/// 3. optional shadow box behind the interior
/// 4. recording overlaid centered
/// 5. optional border box at the same coordinates
pub fn build_filter_graph(spec: &CompositionSpec) -> FilterGraph {
    let (width, height) = spec.aspect.canvas();
    let (inner_w, inner_h) = spec.interior();
    let (x, y) = spec.interior_origin();
    let mut graph = FilterGraph::default();

    let mut background = format!(
        "scale={}:{}:force_original_aspect_ratio=increase,crop={}:{}",
        width, height, width, height
    );
    if spec.blur > 0 {
        background.push_str(&format!(",gblur=sigma={}", spec.blur));
    }
    background.push_str(",setsar=1");
    graph.push(FilterStage::new(&["1:v"], background, "bg"));

    graph.push(FilterStage::new(
        &["0:v"],
        format!(
            "scale={}:{}:force_original_aspect_ratio=decrease,pad={}:{}:(ow-iw)/2:(oh-ih)/2:black,setsar=1",
            inner_w, inner_h, inner_w, inner_h
        ),
        "fg",
    ));

    let mut base = "bg";
    if spec.shadow {
        let offset = (width / 100).max(4);
        graph.push(FilterStage::new(
            &["bg"],
            format!(
                "drawbox=x={}:y={}:w={}:h={}:color=black@0.45:t=fill",
                x + offset,
                y + offset,
                inner_w,
                inner_h
            ),
            "shadow",
        ));
        base = "shadow";
    }

    let overlay_out = if spec.border { "composed" } else { VIDEO_OUT };
    graph.push(FilterStage::new(
        &[base, "fg"],
        format!("overlay={}:{}:shortest=1", x, y),
        overlay_out,
    ));

    if spec.border {
        let thickness = (width / 240).max(4);
        graph.push(FilterStage::new(
            &["composed"],
            format!(
                "drawbox=x={}:y={}:w={}:h={}:color=white@0.9:t={}",
                x, y, inner_w, inner_h, thickness
            ),
            VIDEO_OUT,
        ));
    }

    graph
}

/// One engine input with its input-side options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineInput {
    pub options: Vec<String>,
    pub path: PathBuf,
}

/// Ordered engine command: inputs, filter graph, output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineCommand {
    pub inputs: Vec<EngineInput>,
    pub graph: FilterGraph,
    pub output_options: Vec<String>,
    pub output: PathBuf,
}

impl EngineCommand {
    /// Command that composites `recording` over `background`
    pub fn composition(
        recording: &Path,
        background: &Path,
        spec: &CompositionSpec,
        settings: &EncoderSettings,
        output: &Path,
    ) -> Self {
        let inputs = vec![
            EngineInput {
                options: Vec::new(),
                path: recording.to_path_buf(),
            },
            EngineInput {
                options: vec!["-loop".to_string(), "1".to_string()],
                path: background.to_path_buf(),
            },
        ];

        let output_options = vec![
            "-map".to_string(),
            format!("[{}]", VIDEO_OUT),
            "-map".to_string(),
            "0:a?".to_string(),
            "-c:v".to_string(),
            "libx264".to_string(),
            "-preset".to_string(),
            settings.preset.clone(),
            "-crf".to_string(),
            settings.crf.to_string(),
            "-pix_fmt".to_string(),
            "yuv420p".to_string(),
            "-c:a".to_string(),
            "aac".to_string(),
            "-b:a".to_string(),
            "192k".to_string(),
            "-movflags".to_string(),
            "+faststart".to_string(),
        ];

        Self {
            inputs,
            graph: build_filter_graph(spec),
            output_options,
            output: output.to_path_buf(),
        }
    }

    /// Full argument list for the ffmpeg binary
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec!["-y".to_string(), "-hide_banner".to_string()];

        for input in &self.inputs {
            args.extend(input.options.iter().cloned());
            args.extend(["-i".to_string(), input.path.to_string_lossy().to_string()]);
        }

        args.extend(["-filter_complex".to_string(), self.graph.to_string()]);
        args.extend(self.output_options.iter().cloned());

        // Progress output for tracking
        args.extend([
            "-progress".to_string(),
            "pipe:1".to_string(),
            "-nostats".to_string(),
        ]);

        args.push(self.output.to_string_lossy().to_string());
        args
    }
}

/// Progress reported by an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineProgress {
    /// Output encoded up to this time
    OutTime(Duration),
    /// Engine finished writing
    End,
}

/// Parse one line of ffmpeg `-progress` output
pub fn parse_progress_line(line: &str) -> Option<EngineProgress> {
    let (key, value) = line.trim().split_once('=')?;
    match key {
        // out_time_ms is reported in microseconds as well
        "out_time_us" | "out_time_ms" => value
            .parse::<u64>()
            .ok()
            .map(|us| EngineProgress::OutTime(Duration::from_micros(us))),
        "progress" if value == "end" => Some(EngineProgress::End),
        _ => None,
    }
}

/// Engine output
#[derive(Debug, Clone, Default)]
pub struct EngineOutput {
    pub log: String,
}

/// External encoding engine
///
/// Implementations:
/// - `FfmpegEngine`: the ffmpeg binary
/// - `synthetic::SyntheticEngine`: in-process stand-in, behind the
///   `synthetic` feature
#[async_trait]
pub trait EncodingEngine: Send + Sync {
    /// Make sure the engine can run
    async fn load(&self) -> ExportResult<()>;

    /// Run a command to completion, streaming progress
    async fn execute(
        &self,
        command: &EngineCommand,
        on_progress: &(dyn Fn(EngineProgress) + Send + Sync),
        cancel: &CancellationToken,
    ) -> ExportResult<EngineOutput>;
}

/// Number of log lines kept in an `EncodingFailed` diagnostic
const DIAGNOSTIC_LINES: usize = 20;

/// Drives the ffmpeg binary
#[derive(Debug, Clone, Default)]
pub struct FfmpegEngine {
    binary: Option<PathBuf>,
}

impl FfmpegEngine {
    /// Use `binary` if given, otherwise look ffmpeg up on PATH
    pub fn new(binary: Option<PathBuf>) -> Self {
        Self { binary }
    }

    fn locate(&self) -> ExportResult<PathBuf> {
        locate_ffmpeg(self.binary.as_deref())
    }
}

/// Resolve the ffmpeg binary: the configured path if given, otherwise PATH
pub fn locate_ffmpeg(configured: Option<&Path>) -> ExportResult<PathBuf> {
    match configured {
        Some(path) if path.exists() => Ok(path.to_path_buf()),
        Some(path) => Err(ExportError::EngineUnavailable(format!(
            "configured ffmpeg not found at {:?}",
            path
        ))),
        None => which::which("ffmpeg")
            .map_err(|e| ExportError::EngineUnavailable(format!("ffmpeg not found on PATH: {}", e))),
    }
}

/// Container facts read from the ffmpeg input banner
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaInfo {
    pub duration: Option<Duration>,
    pub dimensions: Option<(u32, u32)>,
    pub has_audio: bool,
}

/// Parse the `Input #0` banner ffmpeg prints to stderr
pub fn parse_media_info(banner: &str) -> MediaInfo {
    let mut info = MediaInfo::default();

    for line in banner.lines().map(str::trim) {
        if let Some(rest) = line.strip_prefix("Duration:") {
            info.duration = rest.split(',').next().and_then(|t| parse_timestamp(t.trim()));
        } else if line.starts_with("Stream #") {
            if line.contains("Video:") && info.dimensions.is_none() {
                info.dimensions = line
                    .split(|c: char| c == ',' || c == ' ')
                    .find_map(parse_dimensions);
            } else if line.contains("Audio:") {
                info.has_audio = true;
            }
        }
    }

    info
}

/// `hh:mm:ss.xx`; `N/A` for live or unfinished files
fn parse_timestamp(value: &str) -> Option<Duration> {
    let mut parts = value.split(':');
    let hours: u64 = parts.next()?.parse().ok()?;
    let minutes: u64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    Some(Duration::from_secs(hours * 3600 + minutes * 60) + Duration::from_secs_f64(seconds))
}

fn parse_dimensions(token: &str) -> Option<(u32, u32)> {
    let (w, h) = token.split_once('x')?;
    let w = w.parse().ok()?;
    let h = h.parse().ok()?;
    (w > 0 && h > 0).then_some((w, h))
}

/// Read duration and dimensions of a media file
pub async fn inspect_media(binary: &Path, path: &Path) -> ExportResult<MediaInfo> {
    let output = Command::new(binary)
        .args(["-hide_banner", "-i"])
        .arg(path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| ExportError::EngineUnavailable(format!("Failed to start FFmpeg: {}", e)))?;

    // No output file was given, so ffmpeg always exits non-zero here
    Ok(parse_media_info(&String::from_utf8_lossy(&output.stderr)))
}

#[async_trait]
impl EncodingEngine for FfmpegEngine {
    async fn load(&self) -> ExportResult<()> {
        let binary = self.locate()?;
        tracing::debug!("Using ffmpeg at {:?}", binary);
        Ok(())
    }

    async fn execute(
        &self,
        command: &EngineCommand,
        on_progress: &(dyn Fn(EngineProgress) + Send + Sync),
        cancel: &CancellationToken,
    ) -> ExportResult<EngineOutput> {
        let binary = self.locate()?;
        let args = command.to_args();

        tracing::info!("Starting FFmpeg: {:?}", args);

        let mut child = Command::new(&binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExportError::EngineUnavailable(format!("Failed to start FFmpeg: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExportError::EngineUnavailable("Failed to capture FFmpeg stdout".into()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| ExportError::EngineUnavailable("Failed to capture FFmpeg stderr".into()))?;

        let log_task = tokio::spawn(async move {
            let mut log = String::new();
            let _ = stderr.read_to_string(&mut log).await;
            log
        });

        let mut lines = BufReader::new(stdout).lines();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Cancelling FFmpeg");
                    let _ = child.kill().await;
                    log_task.abort();
                    return Err(ExportError::Cancelled);
                }
                line = lines.next_line() => match line? {
                    Some(line) => {
                        if let Some(progress) = parse_progress_line(&line) {
                            on_progress(progress);
                        }
                    }
                    None => break,
                }
            }
        }

        let status = child.wait().await?;
        let log = log_task.await.unwrap_or_default();

        if !status.success() {
            tracing::error!("FFmpeg exited with {}", status);
            return Err(ExportError::EncodingFailed {
                diagnostic: diagnostic_tail(&log, status),
            });
        }

        Ok(EngineOutput { log })
    }
}

fn diagnostic_tail(log: &str, status: std::process::ExitStatus) -> String {
    let lines: Vec<&str> = log.lines().collect();
    let start = lines.len().saturating_sub(DIAGNOSTIC_LINES);
    let tail = lines[start..].join("\n");
    if tail.is_empty() {
        format!("ffmpeg exited with {}", status)
    } else {
        tail
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::types::AspectRatio;

    fn spec(border: bool, shadow: bool, blur: u8) -> CompositionSpec {
        CompositionSpec {
            border,
            shadow,
            blur,
            ..Default::default()
        }
    }

    #[test]
    fn test_border_stage_present_only_when_enabled() {
        let with_border = build_filter_graph(&spec(true, false, 0));
        let border = with_border.stage(VIDEO_OUT).unwrap();
        assert_eq!(border.name(), "drawbox");
        assert_eq!(border.inputs, vec!["composed".to_string()]);

        let without = build_filter_graph(&spec(false, false, 0));
        assert!(without.stages().iter().all(|s| s.name() != "drawbox"));
        assert_eq!(without.stage(VIDEO_OUT).unwrap().name(), "overlay");
    }

    #[test]
    fn test_border_matches_overlay_coordinates() {
        let spec = CompositionSpec {
            border: true,
            aspect: AspectRatio::Square,
            scale: 0.8,
            ..Default::default()
        };
        let graph = build_filter_graph(&spec);
        let (x, y) = spec.interior_origin();

        let overlay = graph.stage("composed").unwrap();
        assert!(overlay.filter.starts_with(&format!("overlay={}:{}", x, y)));
        let border = graph.stage(VIDEO_OUT).unwrap();
        assert!(border.filter.contains(&format!("x={}:y={}", x, y)));
    }

    #[test]
    fn test_oversized_scale_stays_on_canvas() {
        let spec = CompositionSpec {
            scale: 1.5,
            border: true,
            ..Default::default()
        };
        let graph = build_filter_graph(&spec);

        assert_eq!(spec.interior(), (1920, 1080));
        assert_eq!(spec.interior_origin(), (0, 0));
        assert!(graph.stage("composed").unwrap().filter.starts_with("overlay=0:0"));
    }

    #[test]
    fn test_parse_media_banner() {
        let banner = "Input #0, matroska,webm, from 'clip.webm':
  Metadata:
    ENCODER         : Lavf60.3.100
  Duration: 00:01:02.50, start: 0.000000, bitrate: 812 kb/s
  Stream #0:0: Video: vp8, yuv420p(progressive), 1280x720, SAR 1:1 DAR 16:9, 30 fps
  Stream #0:1: Audio: opus, 48000 Hz, stereo, fltp
At least one output file must be specified";

        let info = parse_media_info(banner);
        assert_eq!(info.duration, Some(Duration::from_millis(62_500)));
        assert_eq!(info.dimensions, Some((1280, 720)));
        assert!(info.has_audio);
    }

    #[test]
    fn test_live_recording_has_no_duration() {
        let banner = "  Duration: N/A, start: 0.000000, bitrate: N/A
  Stream #0:0(eng): Video: vp9 (Profile 0), yuv420p(tv), 640x360, 30 fps";

        let info = parse_media_info(banner);
        assert_eq!(info.duration, None);
        assert_eq!(info.dimensions, Some((640, 360)));
        assert!(!info.has_audio);
    }

    #[test]
    fn test_missing_configured_binary() {
        let result = locate_ffmpeg(Some(Path::new("/nonexistent/ffmpeg")));
        assert!(matches!(result, Err(ExportError::EngineUnavailable(_))));
    }

    #[test]
    fn test_shadow_and_blur() {
        let graph = build_filter_graph(&spec(false, true, 12));
        assert!(graph.stage("bg").unwrap().filter.contains("gblur=sigma=12"));
        assert_eq!(graph.stage("shadow").unwrap().name(), "drawbox");
        assert_eq!(
            graph.stage(VIDEO_OUT).unwrap().inputs,
            vec!["shadow".to_string(), "fg".to_string()]
        );
    }

    #[test]
    fn test_stages_chain_by_label() {
        let graph = build_filter_graph(&spec(true, true, 5));
        let rendered = graph.to_string();
        assert!(rendered.starts_with("[1:v]scale=1920:1080"));
        assert!(rendered.ends_with(&format!("[{}]", VIDEO_OUT)));
        assert_eq!(graph.output_label(), Some(VIDEO_OUT));
    }

    #[test]
    fn test_command_args_order() {
        let command = EngineCommand::composition(
            Path::new("/tmp/in.webm"),
            Path::new("/tmp/bg.png"),
            &spec(false, false, 0),
            &EncoderSettings::default(),
            Path::new("/tmp/out.mp4"),
        );
        let args = command.to_args();

        let first_input = args.iter().position(|a| a == "/tmp/in.webm").unwrap();
        let loop_flag = args.iter().position(|a| a == "-loop").unwrap();
        let filter = args.iter().position(|a| a == "-filter_complex").unwrap();
        assert!(first_input < loop_flag);
        assert!(loop_flag < filter);
        assert_eq!(args.last().map(String::as_str), Some("/tmp/out.mp4"));
        assert!(args.windows(2).any(|w| w[0] == "-progress" && w[1] == "pipe:1"));
    }

    #[test]
    fn test_parse_progress() {
        assert_eq!(
            parse_progress_line("out_time_us=1500000"),
            Some(EngineProgress::OutTime(Duration::from_millis(1500)))
        );
        assert_eq!(parse_progress_line("progress=end"), Some(EngineProgress::End));
        assert_eq!(parse_progress_line("progress=continue"), None);
        assert_eq!(parse_progress_line("out_time_us=N/A"), None);
        assert_eq!(parse_progress_line("frame=42"), None);
    }

    #[tokio::test]
    async fn test_engine_load_missing_configured_binary() {
        let engine = FfmpegEngine::new(Some(PathBuf::from("/nonexistent/bin/ffmpeg")));
        assert!(matches!(
            engine.load().await,
            Err(ExportError::EngineUnavailable(_))
        ));
    }
}
