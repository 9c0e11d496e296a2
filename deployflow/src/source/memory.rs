//! In-memory repository, for tests and embedding.

use super::SourceRepository;
use crate::core::{FileBundle, Revision};
use crate::errors::SourceError;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

/// A repository whose revisions are held in memory.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    name: String,
    description: Option<String>,
    revisions: RwLock<HashMap<Revision, FileBundle>>,
}

impl InMemoryRepository {
    /// Creates an empty repository.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Sets the repository description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Returns the repository description.
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Records the content of a revision.
    pub fn commit(&self, revision: Revision, files: FileBundle) {
        self.revisions.write().insert(revision, files);
    }

    /// Returns the number of known revisions.
    #[must_use]
    pub fn revision_count(&self) -> usize {
        self.revisions.read().len()
    }
}

#[async_trait]
impl SourceRepository for InMemoryRepository {
    fn name(&self) -> &str {
        &self.name
    }

    async fn snapshot(&self, revision: &Revision) -> Result<FileBundle, SourceError> {
        self.revisions
            .read()
            .get(revision)
            .cloned()
            .ok_or_else(|| SourceError::RevisionNotFound {
                revision: revision.to_string(),
            })
    }
}
