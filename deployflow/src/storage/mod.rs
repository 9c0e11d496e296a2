//! Durable stores used by the pipeline.
//!
//! - [`ArtifactStore`]: write-once, content-addressed handoff medium between stages
//! - [`BuildCache`]: overwrite-on-write blobs keyed by a build environment fingerprint

mod artifact_store;
mod cache;
mod fingerprint;

pub use artifact_store::{
    bundle_key, load_bundle, store_bundle, ArtifactStore, FsArtifactStore, InMemoryArtifactStore,
};
pub use cache::{BuildCache, FsBuildCache, InMemoryBuildCache};
pub use fingerprint::{CacheFingerprint, FingerprintInput};

use regex::Regex;
use std::sync::OnceLock;

/// Returns true if `key` is usable as an object name in a store.
///
/// Keys are `/`-separated segments of `[A-Za-z0-9._-]`, with no empty,
/// `.` or `..` segments.
pub(crate) fn is_valid_key(key: &str) -> bool {
    static SEGMENT: OnceLock<Option<Regex>> = OnceLock::new();
    let Some(segment) = SEGMENT
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9._-]*$").ok())
        .as_ref()
    else {
        return false;
    };

    !key.is_empty() && key.split('/').all(|part| segment.is_match(part))
}
