//! File bundles: the content carried by artifacts and cache entries.

use crate::errors::{BuildSpecError, BundleError};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const BUNDLE_FORMAT_VERSION: u32 = 1;

/// One file of a bundle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BundleFile {
    /// File content.
    pub content: Vec<u8>,
    /// Whether the file carries the executable bit.
    pub executable: bool,
}

/// An ordered set of files keyed by relative path.
///
/// The encoded form is canonical: paths are sorted and contents are base64
/// so two bundles with the same files and modes always encode to the same
/// bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileBundle {
    files: BTreeMap<String, BundleFile>,
}

#[derive(Serialize, Deserialize)]
struct EncodedBundle {
    version: u32,
    files: Vec<EncodedFile>,
}

#[derive(Serialize, Deserialize)]
struct EncodedFile {
    path: String,
    content: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    executable: bool,
}

impl FileBundle {
    /// Creates an empty bundle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a regular file, replacing any existing file at the same path.
    ///
    /// # Errors
    ///
    /// Returns `BuildSpecError::InvalidPath` if the path is absolute or escapes the root.
    pub fn insert(
        &mut self,
        path: impl AsRef<str>,
        content: impl Into<Vec<u8>>,
    ) -> Result<(), BuildSpecError> {
        self.insert_file(path, content, false)
    }

    /// Adds a file with an explicit executable bit.
    ///
    /// # Errors
    ///
    /// Returns `BuildSpecError::InvalidPath` if the path is absolute or escapes the root.
    pub fn insert_file(
        &mut self,
        path: impl AsRef<str>,
        content: impl Into<Vec<u8>>,
        executable: bool,
    ) -> Result<(), BuildSpecError> {
        let path = normalize_relative_path(path.as_ref())?;
        self.files.insert(
            path,
            BundleFile {
                content: content.into(),
                executable,
            },
        );
        Ok(())
    }

    /// Adds a regular file and returns the bundle.
    ///
    /// # Errors
    ///
    /// Returns `BuildSpecError::InvalidPath` if the path is invalid.
    pub fn with_file(
        mut self,
        path: impl AsRef<str>,
        content: impl Into<Vec<u8>>,
    ) -> Result<Self, BuildSpecError> {
        self.insert(path, content)?;
        Ok(self)
    }

    /// Adds an executable file and returns the bundle.
    ///
    /// # Errors
    ///
    /// Returns `BuildSpecError::InvalidPath` if the path is invalid.
    pub fn with_executable(
        mut self,
        path: impl AsRef<str>,
        content: impl Into<Vec<u8>>,
    ) -> Result<Self, BuildSpecError> {
        self.insert_file(path, content, true)?;
        Ok(self)
    }

    /// Returns the content of a file.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(|f| f.content.as_slice())
    }

    /// Returns true if the file exists and is executable.
    #[must_use]
    pub fn is_executable(&self, path: &str) -> bool {
        self.files.get(path).is_some_and(|f| f.executable)
    }

    /// Returns true if the bundle holds a file at `path`.
    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    /// Returns true if any file lives at or below `prefix`.
    #[must_use]
    pub fn has_files_under(&self, prefix: &str) -> bool {
        // "" and "." name the whole tree.
        let Ok(prefix) = normalize_relative_path(prefix) else {
            return !self.files.is_empty();
        };
        let dir = format!("{prefix}/");
        self.files
            .keys()
            .any(|path| *path == prefix || path.starts_with(&dir))
    }

    /// Keeps only the files whose path satisfies `keep`.
    pub fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.files.retain(|path, _| keep(path.as_str()));
    }

    /// Returns the number of files.
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Returns true if the bundle has no files.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Iterates over files in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &BundleFile)> {
        self.files.iter().map(|(p, f)| (p.as_str(), f))
    }

    /// Returns the total size of all file contents.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.files.values().map(|f| f.content.len() as u64).sum()
    }

    /// Encodes the bundle canonically.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let encoded = EncodedBundle {
            version: BUNDLE_FORMAT_VERSION,
            files: self
                .files
                .iter()
                .map(|(path, file)| EncodedFile {
                    path: path.clone(),
                    content: BASE64.encode(&file.content),
                    executable: file.executable,
                })
                .collect(),
        };
        // Serializing plain strings, booleans and integers cannot fail.
        serde_json::to_vec(&encoded).unwrap_or_default()
    }

    /// Decodes a bundle produced by [`FileBundle::encode`].
    ///
    /// # Errors
    ///
    /// Returns a [`BundleError`] if the bytes are not a valid bundle.
    pub fn decode(bytes: &[u8]) -> Result<Self, BundleError> {
        let encoded: EncodedBundle =
            serde_json::from_slice(bytes).map_err(|e| BundleError::Malformed(e.to_string()))?;
        if encoded.version != BUNDLE_FORMAT_VERSION {
            return Err(BundleError::UnsupportedVersion(encoded.version));
        }

        let mut bundle = Self::new();
        for file in encoded.files {
            let content = BASE64.decode(file.content.as_bytes()).map_err(|e| {
                BundleError::InvalidContent {
                    path: file.path.clone(),
                    reason: e.to_string(),
                }
            })?;
            bundle.insert_file(&file.path, content, file.executable)?;
        }
        Ok(bundle)
    }

    /// Returns the hex SHA-256 of the canonical encoding.
    #[must_use]
    pub fn digest(&self) -> String {
        crate::utils::sha256_hex(&self.encode())
    }
}

/// Normalizes a relative path, rejecting absolute paths and `..` components.
///
/// # Errors
///
/// Returns `BuildSpecError::InvalidPath` for paths that escape the root or are empty.
pub fn normalize_relative_path(path: &str) -> Result<String, BuildSpecError> {
    let invalid = || BuildSpecError::InvalidPath {
        path: path.to_string(),
    };

    let unified = path.replace('\\', "/");
    if unified.starts_with('/') {
        return Err(invalid());
    }

    let mut parts = Vec::new();
    for part in unified.split('/') {
        match part {
            "" | "." => {}
            ".." => return Err(invalid()),
            other => parts.push(other),
        }
    }

    if parts.is_empty() {
        return Err(invalid());
    }
    Ok(parts.join("/"))
}
