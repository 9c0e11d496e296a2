//! Source trigger: snapshots a repository revision into an immutable artifact.

mod git;
mod memory;

pub use git::GitRepository;
pub use memory::InMemoryRepository;

use crate::core::{Artifact, FileBundle, Revision};
use crate::errors::{PipelineError, SourceError};
use crate::storage::{store_bundle, ArtifactStore};
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::{info, warn};

/// Default name of the artifact produced by the source stage.
pub const SOURCE_OUTPUT: &str = "SourceOutput";

/// A version-controlled repository the pipeline builds from.
#[async_trait]
pub trait SourceRepository: Send + Sync + Debug {
    /// Returns the repository name.
    fn name(&self) -> &str;

    /// Returns the file content of the repository at `revision`.
    async fn snapshot(&self, revision: &Revision) -> Result<FileBundle, SourceError>;
}

/// Materializes snapshot artifacts for new commits.
#[derive(Debug, Clone)]
pub struct SourceTrigger {
    repository: Arc<dyn SourceRepository>,
    store: Arc<dyn ArtifactStore>,
    output_name: String,
    stage_name: String,
}

impl SourceTrigger {
    /// Creates a trigger reading from `repository` and writing to `store`.
    #[must_use]
    pub fn new(repository: Arc<dyn SourceRepository>, store: Arc<dyn ArtifactStore>) -> Self {
        Self {
            repository,
            store,
            output_name: SOURCE_OUTPUT.to_string(),
            stage_name: "Source".to_string(),
        }
    }

    /// Sets the name of the produced artifact.
    #[must_use]
    pub fn with_output_name(mut self, name: impl Into<String>) -> Self {
        self.output_name = name.into();
        self
    }

    /// Sets the stage recorded as the artifact producer.
    #[must_use]
    pub fn with_stage_name(mut self, name: impl Into<String>) -> Self {
        self.stage_name = name.into();
        self
    }

    /// Returns the name of the produced artifact.
    #[must_use]
    pub fn output_name(&self) -> &str {
        &self.output_name
    }

    /// Snapshots `revision` into a new artifact.
    ///
    /// Triggering the same revision twice yields artifacts with the same
    /// content digest; only the artifact id and timestamp differ.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::SourceUnavailable` if the revision cannot be
    /// fetched, or `PipelineError::Store` if the snapshot cannot be stored.
    pub async fn on_commit(&self, revision: &Revision) -> Result<Artifact, PipelineError> {
        let bundle = self.repository.snapshot(revision).await.map_err(|e| {
            warn!(
                repository = self.repository.name(),
                revision = %revision,
                error = %e,
                "Source snapshot failed"
            );
            PipelineError::SourceUnavailable {
                revision: revision.to_string(),
                reason: e.to_string(),
            }
        })?;

        let (location, digest) = store_bundle(self.store.as_ref(), &bundle).await?;
        info!(
            repository = self.repository.name(),
            revision = %revision,
            files = bundle.len(),
            digest = crate::utils::short_digest(&digest),
            "Source snapshot stored"
        );

        Ok(Artifact::new(
            &self.output_name,
            &self.stage_name,
            location,
            digest,
            revision.clone(),
        )
        .with_size(bundle.len(), bundle.total_bytes())
        .with_metadata("repository", serde_json::json!(self.repository.name())))
    }
}
