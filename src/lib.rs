//! MockView capture engine - record, review and share interview practice.
//!
//! This is the library crate behind the MockView practice tools. It acquires
//! camera, microphone and screen media, records composed streams, correlates
//! question changes with the recording, cuts segments out of a source video,
//! records reactions to them, stitches clips together and re-composites the
//! result onto a styled background before upload.

pub mod capture;
pub mod combiner;
pub mod composer;
pub mod config;
pub mod export;
pub mod feedback;
pub mod practice;
pub mod project;
pub mod recorder;
pub mod segments;
#[cfg(any(test, feature = "synthetic"))]
pub mod synthetic;
pub mod timeline;
pub mod upload;
pub mod utils;

pub use config::{load_config, load_config_or_default, EngineConfig};
pub use utils::error::{AppError, AppResult, ErrorResponse};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing/logging
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mockview_capture=debug,mockview=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("Starting MockView capture v{}", env!("CARGO_PKG_VERSION"));
}
