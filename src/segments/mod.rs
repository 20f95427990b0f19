//! Segments of a source video

pub mod clock;
pub mod manager;
pub mod player;

pub use manager::{
    PlaybackOutcome, Segment, SegmentConfig, SegmentError, SegmentManager, SegmentResult,
};
pub use clock::ClockPlayer;
pub use player::{PlaybackSource, PlayerState};
