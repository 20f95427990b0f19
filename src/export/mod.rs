//! Composition stage
//!
//! This module re-composites a finished recording onto a styled background
//! through an external encoding engine.

pub mod ffmpeg;
pub mod pipeline;
pub mod types;

pub use ffmpeg::{
    build_filter_graph, locate_ffmpeg, parse_media_info, inspect_media, EncodingEngine, EngineCommand,
    EngineOutput, EngineProgress, FfmpegEngine, FilterGraph, FilterStage, MediaInfo,
};
pub use pipeline::{CompositionStage, FinalFile};
pub use types::{
    AspectRatio, BackgroundImage, CompositionSpec, EncoderSettings, ExportError, ExportProgress,
    ExportResult, ExportStage,
};
