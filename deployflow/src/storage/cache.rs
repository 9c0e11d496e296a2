//! Build caches.
//!
//! Cache entries are advisory: a reader may see any complete value that was
//! written under the key (last write wins), never a torn one.

use super::is_valid_key;
use crate::errors::CacheError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::fmt::Debug;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Persistent key-value blob cache shared across builds.
#[async_trait]
pub trait BuildCache: Send + Sync + Debug {
    /// Reads the entry for `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// Writes the entry for `key`, replacing any previous value.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), CacheError>;
}

/// In-memory build cache.
#[derive(Debug, Default, Clone)]
pub struct InMemoryBuildCache {
    entries: Arc<DashMap<String, Arc<Vec<u8>>>>,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
}

impl InMemoryBuildCache {
    /// Creates a new in-memory cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the number of reads that found an entry.
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Returns the number of reads that found nothing.
    #[must_use]
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl BuildCache for InMemoryBuildCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let value = self.entries.get(key).map(|v| v.as_ref().clone());
        if value.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        Ok(value)
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), CacheError> {
        self.entries.insert(key.to_string(), Arc::new(bytes));
        Ok(())
    }
}

/// Filesystem-backed build cache.
///
/// Each write goes to a unique temporary file that is renamed over the entry.
#[derive(Debug, Clone)]
pub struct FsBuildCache {
    root: PathBuf,
}

impl FsBuildCache {
    /// Creates a cache rooted at `root`. The directory is created on first write.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the cache root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, key: &str) -> Result<PathBuf, CacheError> {
        if !is_valid_key(key) || key.contains('/') {
            return Err(CacheError::Unavailable(format!("invalid cache key '{key}'")));
        }
        Ok(self.root.join("entries").join(key))
    }
}

fn unavailable(err: &std::io::Error) -> CacheError {
    CacheError::Unavailable(err.to_string())
}

#[async_trait]
impl BuildCache for FsBuildCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let path = self.entry_path(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(unavailable(&e)),
        }
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), CacheError> {
        let path = self.entry_path(key)?;
        let entries = self.root.join("entries");
        let tmp_dir = self.root.join("tmp");
        tokio::fs::create_dir_all(&entries).await.map_err(|e| unavailable(&e))?;
        tokio::fs::create_dir_all(&tmp_dir).await.map_err(|e| unavailable(&e))?;

        let tmp = tmp_dir.join(crate::utils::generate_uuid().to_string());
        tokio::fs::write(&tmp, &bytes).await.map_err(|e| unavailable(&e))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(unavailable(&e));
        }
        debug!(key, size = bytes.len(), "Wrote build cache entry");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_cache_overwrites() {
        let cache = InMemoryBuildCache::new();
        assert_eq!(cache.get("k").await.unwrap(), None);

        cache.put("k", b"v1".to_vec()).await.unwrap();
        cache.put("k", b"v2".to_vec()).await.unwrap();

        assert_eq!(cache.get("k").await.unwrap(), Some(b"v2".to_vec()));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 1);
    }

    #[tokio::test]
    async fn test_fs_cache_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FsBuildCache::new(dir.path());

        assert_eq!(cache.get("abc").await.unwrap(), None);
        cache.put("abc", b"first".to_vec()).await.unwrap();
        cache.put("abc", b"second".to_vec()).await.unwrap();
        assert_eq!(cache.get("abc").await.unwrap(), Some(b"second".to_vec()));
    }

    #[tokio::test]
    async fn test_fs_cache_rejects_nested_keys() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FsBuildCache::new(dir.path());
        assert!(cache.put("a/b", Vec::new()).await.is_err());
        assert!(cache.get("../b").await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_writers_never_tear_values() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(FsBuildCache::new(dir.path()));

        let mut handles = Vec::new();
        for i in 0..16u8 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                cache.put("shared", vec![i; 4096]).await.unwrap();
                cache.get("shared").await.unwrap()
            }));
        }

        for handle in handles {
            let value = handle.await.unwrap().unwrap();
            assert_eq!(value.len(), 4096);
            assert!(value.iter().all(|b| *b == value[0]));
        }
    }
}
