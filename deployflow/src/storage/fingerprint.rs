//! Deterministic cache fingerprints.
//!
//! A fingerprint is the hex SHA-256 of a canonical JSON document describing
//! everything that can change the cached files: the pinned image, the
//! environment variables, the phase and its commands, and the cached paths.
//! When a cached path overlaps the checked-out sources the source digest is
//! hashed too.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

const FINGERPRINT_FORMAT_VERSION: u32 = 1;

/// Inputs hashed into a [`CacheFingerprint`].
#[derive(Debug, Clone)]
pub struct FingerprintInput<'a> {
    /// The pinned build image reference.
    pub image: &'a str,
    /// Build environment variables.
    pub variables: &'a BTreeMap<String, String>,
    /// The phase the cache entry belongs to.
    pub phase: &'a str,
    /// The commands of that phase, in order.
    pub commands: Vec<String>,
    /// The cached paths.
    pub cache_paths: &'a [String],
    /// Digest of the source artifact, when cached paths overlap it.
    pub source_digest: Option<&'a str>,
}

#[derive(Serialize)]
struct CanonicalInput<'a> {
    format: u32,
    image: &'a str,
    variables: &'a BTreeMap<String, String>,
    phase: &'a str,
    commands: &'a [String],
    cache_paths: Vec<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_digest: Option<&'a str>,
}

/// A deterministic key derived from build environment state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheFingerprint(String);

impl CacheFingerprint {
    /// Computes the fingerprint for a phase.
    #[must_use]
    pub fn compute(input: &FingerprintInput<'_>) -> Self {
        let mut cache_paths: Vec<&str> = input.cache_paths.iter().map(String::as_str).collect();
        cache_paths.sort_unstable();
        cache_paths.dedup();

        let canonical = CanonicalInput {
            format: FINGERPRINT_FORMAT_VERSION,
            image: input.image,
            variables: input.variables,
            phase: input.phase,
            commands: &input.commands,
            cache_paths,
            source_digest: input.source_digest,
        };
        let json = serde_json::to_vec(&canonical).unwrap_or_default();
        Self(crate::utils::sha256_hex(&json))
    }

    /// Returns the fingerprint as a hex string, usable as a cache key.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
