//! Local git repository backend.
//!
//! Reads a revision straight out of the object database with the `git`
//! command line, without touching any working tree.

use super::SourceRepository;
use crate::core::{FileBundle, Revision};
use crate::errors::SourceError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

/// A git repository on the local filesystem.
#[derive(Debug, Clone)]
pub struct GitRepository {
    path: PathBuf,
    name: String,
    description: Option<String>,
}

impl GitRepository {
    /// Creates a backend for the repository at `path`.
    #[must_use]
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
            description: None,
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

    /// Returns the repository path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn git(&self, args: &[&str]) -> Result<std::process::Output, SourceError> {
        Command::new("git")
            .arg("-C")
            .arg(&self.path)
            .args(args)
            .output()
            .await
            .map_err(|e| SourceError::Backend(format!("failed to run git: {e}")))
    }

    async fn resolve(&self, revision: &Revision) -> Result<String, SourceError> {
        let spec = format!("{revision}^{{commit}}");
        let output = self.git(&["rev-parse", "--verify", "--quiet", &spec]).await?;
        if !output.status.success() {
            return Err(SourceError::RevisionNotFound {
                revision: revision.to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// One blob entry of `git ls-tree -r -z` output.
#[derive(Debug, PartialEq, Eq)]
struct TreeEntry {
    object: String,
    path: String,
    executable: bool,
}

fn parse_ls_tree(output: &[u8]) -> Vec<TreeEntry> {
    output
        .split(|b| *b == 0)
        .filter(|record| !record.is_empty())
        .filter_map(|record| {
            let record = String::from_utf8_lossy(record);
            let (meta, path) = record.split_once('\t')?;
            let mut fields = meta.split_whitespace();
            let mode = fields.next()?;
            let kind = fields.next()?;
            let object = fields.next()?;
            // Submodules show up as "commit" entries and have no content here.
            (kind == "blob").then(|| TreeEntry {
                object: object.to_string(),
                path: path.to_string(),
                executable: mode == "100755",
            })
        })
        .collect()
}

#[async_trait]
impl SourceRepository for GitRepository {
    fn name(&self) -> &str {
        &self.name
    }

    async fn snapshot(&self, revision: &Revision) -> Result<FileBundle, SourceError> {
        if revision.as_str().starts_with('-') {
            return Err(SourceError::InvalidRevision(revision.to_string()));
        }

        let commit = self.resolve(revision).await?;
        let listing = self.git(&["ls-tree", "-r", "-z", "--full-tree", &commit]).await?;
        if !listing.status.success() {
            return Err(SourceError::Backend(
                String::from_utf8_lossy(&listing.stderr).trim().to_string(),
            ));
        }

        let mut bundle = FileBundle::new();
        for entry in parse_ls_tree(&listing.stdout) {
            let blob = self.git(&["cat-file", "blob", &entry.object]).await?;
            if !blob.status.success() {
                return Err(SourceError::Backend(format!(
                    "failed to read '{}' at {commit}",
                    entry.path
                )));
            }
            bundle
                .insert_file(&entry.path, blob.stdout, entry.executable)
                .map_err(|e| SourceError::Backend(e.to_string()))?;
        }

        debug!(
            repository = %self.name,
            revision = %revision,
            commit = %commit,
            files = bundle.len(),
            "Read git revision"
        );
        Ok(bundle)
    }
}
