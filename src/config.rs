//! Engine configuration
//!
//! TOML configuration for every stage of the engine. Every section has
//! defaults, so an empty file (or no file at all) is a valid configuration.

use crate::capture::{CaptureHints, Resolution};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub capture: CaptureConfig,

    #[serde(default)]
    pub segments: SegmentsConfig,

    #[serde(default)]
    pub feedback: FeedbackSection,

    #[serde(default)]
    pub combiner: CombinerSection,

    #[serde(default)]
    pub composition: CompositionSection,

    #[serde(default)]
    pub upload: UploadSection,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CaptureConfig {
    /// How often the recorder hands over a chunk, in milliseconds
    #[serde(default = "default_timeslice_ms")]
    pub timeslice_ms: u64,

    /// Container the recorder produces
    #[serde(default = "default_mime_type")]
    pub mime_type: String,

    #[serde(default)]
    pub width: Option<u32>,

    #[serde(default)]
    pub height: Option<u32>,

    #[serde(default)]
    pub frame_rate: Option<u32>,

    #[serde(default = "default_video_bitrate")]
    pub video_bitrate: Option<u32>,

    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate: Option<u32>,
}

fn default_timeslice_ms() -> u64 {
    1000
}

fn default_mime_type() -> String {
    "video/webm".to_string()
}

fn default_video_bitrate() -> Option<u32> {
    Some(2_500_000)
}

fn default_audio_bitrate() -> Option<u32> {
    Some(128_000)
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            timeslice_ms: default_timeslice_ms(),
            mime_type: default_mime_type(),
            width: None,
            height: None,
            frame_rate: None,
            video_bitrate: default_video_bitrate(),
            audio_bitrate: default_audio_bitrate(),
        }
    }
}

impl CaptureConfig {
    pub fn timeslice(&self) -> Duration {
        Duration::from_millis(self.timeslice_ms)
    }

    /// Hints handed to the device backend
    pub fn hints(&self) -> CaptureHints {
        let resolution = match (self.width, self.height) {
            (Some(width), Some(height)) => Some(Resolution { width, height }),
            _ => None,
        };
        CaptureHints {
            resolution,
            frame_rate: self.frame_rate,
            video_bitrate: self.video_bitrate,
            audio_bitrate: self.audio_bitrate,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SegmentsConfig {
    /// Maximum number of segments per source video
    #[serde(default = "default_max_segments")]
    pub max_segments: usize,

    /// Playback position poll interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Allowed overshoot past a segment end, in milliseconds
    #[serde(default = "default_tolerance_ms")]
    pub boundary_tolerance_ms: u64,
}

fn default_max_segments() -> usize {
    3
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_tolerance_ms() -> u64 {
    250
}

impl Default for SegmentsConfig {
    fn default() -> Self {
        Self {
            max_segments: default_max_segments(),
            poll_interval_ms: default_poll_interval_ms(),
            boundary_tolerance_ms: default_tolerance_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FeedbackSection {
    /// Reaction countdown after the segment finished playing, in seconds
    #[serde(default = "default_countdown_secs")]
    pub countdown_secs: u64,
}

fn default_countdown_secs() -> u64 {
    60
}

impl Default for FeedbackSection {
    fn default() -> Self {
        Self {
            countdown_secs: default_countdown_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CombinerSection {
    #[serde(default = "default_frame_rate")]
    pub frame_rate: u32,
}

fn default_frame_rate() -> u32 {
    30
}

impl Default for CombinerSection {
    fn default() -> Self {
        Self {
            frame_rate: default_frame_rate(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CompositionSection {
    /// Explicit ffmpeg binary; looked up on PATH when unset
    #[serde(default)]
    pub ffmpeg_path: Option<PathBuf>,

    /// Interior scale used when a request does not set one
    #[serde(default = "default_scale")]
    pub default_scale: f64,

    /// x264 constant rate factor
    #[serde(default = "default_crf")]
    pub crf: u8,

    #[serde(default = "default_preset")]
    pub preset: String,
}

fn default_scale() -> f64 {
    0.85
}

fn default_crf() -> u8 {
    23
}

fn default_preset() -> String {
    "medium".to_string()
}

impl Default for CompositionSection {
    fn default() -> Self {
        Self {
            ffmpeg_path: None,
            default_scale: default_scale(),
            crf: default_crf(),
            preset: default_preset(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UploadSection {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Prefix joined with the remote id to build the watch URL
    #[serde(default = "default_watch_url_base")]
    pub watch_url_base: String,

    #[serde(default = "default_privacy")]
    pub privacy: String,

    #[serde(default = "default_tags")]
    pub default_tags: Vec<String>,
}

fn default_endpoint() -> String {
    "https://www.googleapis.com/upload/youtube/v3/videos".to_string()
}

fn default_watch_url_base() -> String {
    "https://www.youtube.com/watch?v=".to_string()
}

fn default_privacy() -> String {
    "unlisted".to_string()
}

fn default_tags() -> Vec<String> {
    vec!["interview".to_string(), "practice".to_string()]
}

impl Default for UploadSection {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            watch_url_base: default_watch_url_base(),
            privacy: default_privacy(),
            default_tags: default_tags(),
        }
    }
}

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> ConfigResult<EngineConfig> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let config: EngineConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    validate_config(&config)?;

    Ok(config)
}

/// Load config from default locations or return default config
pub fn load_config_or_default(custom_path: Option<&Path>) -> ConfigResult<EngineConfig> {
    if let Some(path) = custom_path {
        return load_config(path);
    }

    let default_paths = ["./mockview.toml", "~/.config/mockview/config.toml"];

    for path_str in default_paths {
        let path = shellexpand::tilde(path_str);
        let path = Path::new(path.as_ref());
        if path.exists() {
            tracing::debug!("Loading config from {:?}", path);
            return load_config(path);
        }
    }

    Ok(EngineConfig::default())
}

/// Validate configuration
pub fn validate_config(config: &EngineConfig) -> ConfigResult<()> {
    if config.capture.timeslice_ms == 0 {
        return Err(ConfigError::Invalid("capture.timeslice_ms cannot be 0".into()));
    }

    if config.segments.max_segments == 0 {
        return Err(ConfigError::Invalid("segments.max_segments cannot be 0".into()));
    }

    if config.segments.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("segments.poll_interval_ms cannot be 0".into()));
    }

    if config.feedback.countdown_secs == 0 {
        return Err(ConfigError::Invalid("feedback.countdown_secs cannot be 0".into()));
    }

    if config.combiner.frame_rate == 0 {
        return Err(ConfigError::Invalid("combiner.frame_rate cannot be 0".into()));
    }

    if !(0.5..=1.0).contains(&config.composition.default_scale) {
        return Err(ConfigError::Invalid(format!(
            "composition.default_scale must be within 0.5..=1.0, got {}",
            config.composition.default_scale
        )));
    }

    if config.composition.crf > 51 {
        return Err(ConfigError::Invalid("composition.crf must be at most 51".into()));
    }

    if let Some(path) = &config.composition.ffmpeg_path {
        if !path.exists() {
            tracing::warn!("Configured ffmpeg path does not exist: {:?}", path);
        }
    }

    if config.upload.endpoint.is_empty() {
        return Err(ConfigError::Invalid("upload.endpoint cannot be empty".into()));
    }

    Ok(())
}
