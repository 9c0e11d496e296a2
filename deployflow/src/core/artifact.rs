//! Artifacts: immutable bundles handed from one stage to the next.

use super::Revision;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Where an artifact's bundle lives in the artifact store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactLocation(String);

impl ArtifactLocation {
    /// Creates a location from a store key.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Returns the store key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An artifact produced by a pipeline action.
///
/// Artifacts are write-once: the struct only describes the stored bundle and
/// exposes no way to change it. A later trigger produces a new artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Unique identifier of this artifact.
    pub id: Uuid,

    /// Artifact name used for handoff (e.g. "SourceOutput").
    pub name: String,

    /// The stage that produced the artifact.
    pub producing_stage: String,

    /// Store location of the bundle.
    pub location: ArtifactLocation,

    /// Hex SHA-256 of the canonical bundle encoding.
    pub digest: String,

    /// The revision the artifact was derived from.
    pub revision: Revision,

    /// Number of files in the bundle.
    pub file_count: usize,

    /// Total size of file contents in bytes.
    pub size_bytes: u64,

    /// When the artifact was created (ISO 8601).
    pub created_at: String,

    /// Additional metadata about the artifact.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Artifact {
    /// Creates a new artifact record.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        producing_stage: impl Into<String>,
        location: ArtifactLocation,
        digest: impl Into<String>,
        revision: Revision,
    ) -> Self {
        Self {
            id: crate::utils::generate_uuid(),
            name: name.into(),
            producing_stage: producing_stage.into(),
            location,
            digest: digest.into(),
            revision,
            file_count: 0,
            size_bytes: 0,
            created_at: crate::utils::iso_timestamp(),
            metadata: HashMap::new(),
        }
    }

    /// Records the bundle size.
    #[must_use]
    pub fn with_size(mut self, file_count: usize, size_bytes: u64) -> Self {
        self.file_count = file_count;
        self.size_bytes = size_bytes;
        self
    }

    /// Adds metadata to the artifact.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Returns true if both artifacts carry the same file content.
    #[must_use]
    pub fn same_content(&self, other: &Self) -> bool {
        self.digest == other.digest
    }
}
