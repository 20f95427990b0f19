//! Practice bundles on disk

pub mod bundle;
pub mod schema;

pub use bundle::{
    is_valid_bundle, read_meta, read_recording, read_segments, read_snapshots, read_timeline,
    write_bundle, BundleContents, BundleError, BundleResult, BUNDLE_EXTENSION,
};
pub use schema::{BundleMeta, SegmentEntry, TimelineEntry};
