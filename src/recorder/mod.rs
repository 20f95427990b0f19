//! Recording system module
//!
//! This module implements the capture session architecture:
//! - MediaRecorder trait for platform recorders
//! - FfmpegRecorder, the ffmpeg-fed recorder
//! - CaptureSession state machine around a composed stream
//! - Recording, the finalized blob

pub mod channel;
pub mod ffmpeg;
pub mod session;
pub mod state;

pub use channel::{MediaRecorder, RecorderFactory, RecorderOptions, RecordingError, RecordingResult};
pub use ffmpeg::{FfmpegRecorder, FfmpegRecorderFactory, RecorderCommand};
pub use session::{CaptureSession, RevocationWatch, SessionEvent, SessionHandle};
pub use state::{ActiveSpan, CapturePlan, CaptureState, Recording};
