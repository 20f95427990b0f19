//! Synthetic platform
//!
//! Deterministic, hardware-free implementations of every platform trait:
//! devices, recorder, drawing surface, clip loader, visual surface and
//! encoding engine. Everything is driven by `tokio::time`, so
//! tests running with a paused clock are fully reproducible.

mod clips;
mod devices;
mod engine;
mod recorder;
mod surface;

pub use clips::{SyntheticCanvas, SyntheticClip, SyntheticClipLoader};
pub use devices::SyntheticDevices;
pub use engine::SyntheticEngine;
pub use recorder::{SyntheticRecorder, SyntheticRecorderFactory, CHUNK_HEADER};
pub use surface::SolidSurface;

#[cfg(test)]
mod pipeline_tests;
