//! Write-once artifact stores.

use super::is_valid_key;
use crate::core::{ArtifactLocation, FileBundle};
use crate::errors::StoreError;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt::Debug;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Holder of pipeline-stage outputs.
///
/// Entries are write-once: a key, once written, always returns the same
/// bytes. Putting identical bytes again is a no-op that returns the existing
/// handle; putting different bytes is a [`StoreError::WriteOnceViolation`].
#[async_trait]
pub trait ArtifactStore: Send + Sync + Debug {
    /// Stores `bytes` under `key` and returns its handle.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<ArtifactLocation, StoreError>;

    /// Reads the bytes behind a handle.
    async fn get(&self, handle: &ArtifactLocation) -> Result<Vec<u8>, StoreError>;
}

/// Returns the content address for a bundle digest.
#[must_use]
pub fn bundle_key(digest: &str) -> String {
    format!("sha256/{digest}")
}

/// Stores a bundle under its content address.
///
/// Returns the handle and the bundle digest.
pub async fn store_bundle(
    store: &dyn ArtifactStore,
    bundle: &FileBundle,
) -> Result<(ArtifactLocation, String), StoreError> {
    let bytes = bundle.encode();
    let digest = crate::utils::sha256_hex(&bytes);
    let location = store.put(&bundle_key(&digest), bytes).await?;
    Ok((location, digest))
}

/// Loads and decodes the bundle behind a handle.
pub async fn load_bundle(
    store: &dyn ArtifactStore,
    handle: &ArtifactLocation,
) -> Result<FileBundle, StoreError> {
    let bytes = store.get(handle).await?;
    FileBundle::decode(&bytes).map_err(|e| StoreError::Corrupt {
        key: handle.key().to_string(),
        reason: e.to_string(),
    })
}

/// In-memory artifact store.
#[derive(Debug, Default, Clone)]
pub struct InMemoryArtifactStore {
    objects: Arc<DashMap<String, Arc<Vec<u8>>>>,
}

impl InMemoryArtifactStore {
    /// Creates a new in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Returns true if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<ArtifactLocation, StoreError> {
        if !is_valid_key(key) {
            return Err(StoreError::InvalidKey {
                key: key.to_string(),
            });
        }

        match self.objects.entry(key.to_string()) {
            Entry::Occupied(existing) => {
                if existing.get().as_slice() != bytes.as_slice() {
                    return Err(StoreError::WriteOnceViolation {
                        key: key.to_string(),
                    });
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(bytes));
            }
        }
        Ok(ArtifactLocation::new(key))
    }

    async fn get(&self, handle: &ArtifactLocation) -> Result<Vec<u8>, StoreError> {
        self.objects
            .get(handle.key())
            .map(|bytes| bytes.as_ref().clone())
            .ok_or_else(|| StoreError::NotFound {
                key: handle.key().to_string(),
            })
    }
}

/// Filesystem-backed artifact store.
///
/// Objects are written to a temporary file and hard-linked into place, so a
/// concurrent writer of the same key either wins or observes the winner.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    /// Creates a store rooted at `root`. The directory is created on first write.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the store root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.root.join("objects").join(key)
    }
}

fn backend(err: &std::io::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<ArtifactLocation, StoreError> {
        if !is_valid_key(key) {
            return Err(StoreError::InvalidKey {
                key: key.to_string(),
            });
        }

        let dest = self.object_path(key);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| backend(&e))?;
        }
        let tmp_dir = self.root.join("tmp");
        tokio::fs::create_dir_all(&tmp_dir).await.map_err(|e| backend(&e))?;
        let tmp = tmp_dir.join(crate::utils::generate_uuid().to_string());
        tokio::fs::write(&tmp, &bytes).await.map_err(|e| backend(&e))?;

        let linked = tokio::fs::hard_link(&tmp, &dest).await;
        let _ = tokio::fs::remove_file(&tmp).await;

        match linked {
            Ok(()) => {
                debug!(key, size = bytes.len(), "Stored artifact object");
                Ok(ArtifactLocation::new(key))
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let existing = tokio::fs::read(&dest).await.map_err(|e| backend(&e))?;
                if existing == bytes {
                    Ok(ArtifactLocation::new(key))
                } else {
                    Err(StoreError::WriteOnceViolation {
                        key: key.to_string(),
                    })
                }
            }
            Err(e) => Err(backend(&e)),
        }
    }

    async fn get(&self, handle: &ArtifactLocation) -> Result<Vec<u8>, StoreError> {
        if !is_valid_key(handle.key()) {
            return Err(StoreError::InvalidKey {
                key: handle.key().to_string(),
            });
        }
        match tokio::fs::read(self.object_path(handle.key())).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound {
                key: handle.key().to_string(),
            }),
            Err(e) => Err(backend(&e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    async fn exercise_write_once(store: &dyn ArtifactStore) {
        let handle = store.put("sha256/aa", b"one".to_vec()).await.unwrap();
        assert_eq!(handle.key(), "sha256/aa");

        let again = store.put("sha256/aa", b"one".to_vec()).await.unwrap();
        assert_eq!(again, handle);

        let err = store.put("sha256/aa", b"two".to_vec()).await.unwrap_err();
        assert_eq!(
            err,
            StoreError::WriteOnceViolation {
                key: "sha256/aa".to_string()
            }
        );

        assert_eq!(store.get(&handle).await.unwrap(), b"one".to_vec());
        assert!(matches!(
            store.get(&ArtifactLocation::new("sha256/missing")).await,
            Err(StoreError::NotFound { .. })
        ));
        assert!(matches!(
            store.put("../escape", Vec::new()).await,
            Err(StoreError::InvalidKey { .. })
        ));
    }

    #[tokio::test]
    async fn test_in_memory_store_is_write_once() {
        let store = InMemoryArtifactStore::new();
        exercise_write_once(&store).await;
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_fs_store_is_write_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        exercise_write_once(&store).await;
        assert!(dir.path().join("objects/sha256/aa").exists());
    }

    #[tokio::test]
    async fn test_store_bundle_is_content_addressed() {
        let store = InMemoryArtifactStore::new();
        let bundle = FileBundle::new().with_file("main.cpp", "int main(){}").unwrap();

        let (loc1, digest1) = store_bundle(&store, &bundle).await.unwrap();
        let (loc2, digest2) = store_bundle(&store, &bundle.clone()).await.unwrap();

        assert_eq!(loc1, loc2);
        assert_eq!(digest1, digest2);
        assert_eq!(loc1.key(), bundle_key(&digest1));
        assert_eq!(load_bundle(&store, &loc1).await.unwrap(), bundle);
    }

    #[tokio::test]
    async fn test_load_bundle_reports_corruption() {
        let store = InMemoryArtifactStore::new();
        let handle = store.put("raw", b"garbage".to_vec()).await.unwrap();
        assert!(matches!(
            load_bundle(&store, &handle).await,
            Err(StoreError::Corrupt { .. })
        ));
    }
}
