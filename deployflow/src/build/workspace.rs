//! Per-run build workspaces.

use super::spec::ArtifactsSpec;
use crate::core::FileBundle;
use crate::errors::PipelineError;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::debug;

/// A private directory holding one build's files.
///
/// Dropping the workspace removes the directory.
#[derive(Debug)]
pub struct BuildWorkspace {
    dir: TempDir,
}

impl BuildWorkspace {
    /// Creates an empty workspace.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Workspace` if the directory cannot be created.
    pub fn empty() -> Result<Self, PipelineError> {
        let dir = tempfile::Builder::new().prefix("deployflow-build-").tempdir()?;
        Ok(Self { dir })
    }

    /// Creates a workspace holding the files of `bundle`.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Workspace` on I/O failure.
    pub async fn materialize(bundle: &FileBundle) -> Result<Self, PipelineError> {
        let workspace = Self::empty()?;
        workspace.restore(bundle).await?;
        debug!(
            path = %workspace.path().display(),
            files = bundle.len(),
            "Materialized build workspace"
        );
        Ok(workspace)
    }

    /// Returns the workspace root.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Writes the files of `bundle` into the workspace, overwriting existing
    /// ones. File modes follow each entry's executable bit.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if a file cannot be written.
    pub async fn restore(&self, bundle: &FileBundle) -> std::io::Result<()> {
        for (path, file) in bundle.iter() {
            let target = self.path().join(path);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, &file.content).await?;
            set_executable(&target, file.executable).await?;
        }
        Ok(())
    }

    /// Captures the files under `paths` (files or directories, recursively).
    ///
    /// Missing paths are skipped. Bundle paths are relative to the workspace root.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Workspace` on I/O failure.
    pub async fn capture(&self, paths: &[String]) -> Result<FileBundle, PipelineError> {
        let mut bundle = FileBundle::new();
        for path in paths {
            for (relative, absolute) in collect_files(self.path(), path).await? {
                let (content, executable) = read_file(&absolute).await?;
                bundle.insert_file(relative, content, executable)?;
            }
        }
        Ok(bundle)
    }

    /// Collects the build output selected by `artifacts`.
    ///
    /// Output paths are relative to the base directory.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Workspace` on I/O failure or if a named file is missing.
    pub async fn collect_output(&self, artifacts: &ArtifactsSpec) -> Result<FileBundle, PipelineError> {
        let base = match &artifacts.base_directory {
            Some(dir) => self.path().join(dir),
            None => self.path().to_path_buf(),
        };
        if !tokio::fs::try_exists(&base).await? {
            return Err(PipelineError::Workspace(format!(
                "base directory '{}' does not exist",
                artifacts.base_directory.as_deref().unwrap_or(".")
            )));
        }

        let mut bundle = FileBundle::new();
        for pattern in &artifacts.files {
            let selector = if pattern == "**/*" || pattern == "**" {
                ""
            } else {
                pattern.strip_suffix("/**/*").unwrap_or(pattern)
            };
            let files = collect_files(&base, selector).await?;
            if files.is_empty() && !selector.is_empty() {
                return Err(PipelineError::Workspace(format!(
                    "artifact path '{pattern}' matched no files"
                )));
            }
            for (relative, absolute) in files {
                let (content, executable) = read_file(&absolute).await?;
                bundle.insert_file(relative, content, executable)?;
            }
        }
        Ok(bundle)
    }
}

/// Lists regular files under `root/selector`, relative to `root`.
///
/// An empty selector lists everything. Symlinks are not followed.
async fn collect_files(root: &Path, selector: &str) -> std::io::Result<Vec<(String, PathBuf)>> {
    let start = if selector.is_empty() {
        root.to_path_buf()
    } else {
        root.join(selector)
    };
    let Ok(meta) = tokio::fs::symlink_metadata(&start).await else {
        return Ok(Vec::new());
    };

    let mut found = Vec::new();
    if meta.is_file() {
        found.push((relative_to(root, &start), start));
        return Ok(found);
    }
    if !meta.is_dir() {
        return Ok(found);
    }

    let mut pending = vec![start];
    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let kind = entry.file_type().await?;
            let path = entry.path();
            if kind.is_dir() {
                pending.push(path);
            } else if kind.is_file() {
                found.push((relative_to(root, &path), path));
            }
        }
    }
    found.sort();
    Ok(found)
}

async fn read_file(path: &Path) -> std::io::Result<(Vec<u8>, bool)> {
    let meta = tokio::fs::metadata(path).await?;
    let content = tokio::fs::read(path).await?;
    Ok((content, is_executable(&meta)))
}

#[cfg(unix)]
fn is_executable(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &std::fs::Metadata) -> bool {
    false
}

#[cfg(unix)]
async fn set_executable(path: &Path, executable: bool) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = if executable { 0o755 } else { 0o644 };
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
}

#[cfg(not(unix))]
async fn set_executable(_path: &Path, _executable: bool) -> std::io::Result<()> {
    Ok(())
}

fn relative_to(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sources() -> FileBundle {
        FileBundle::new()
            .with_file("CMakeLists.txt", b"project(s3Read)".to_vec())
            .unwrap()
            .with_file("src/main.cpp", b"int main() {}".to_vec())
            .unwrap()
    }

    #[tokio::test]
    async fn test_materialize_then_capture_everything() {
        let workspace = BuildWorkspace::materialize(&sources()).await.unwrap();
        let captured = workspace.capture(&[String::new()]).await.unwrap();
        assert_eq!(captured, sources());
    }

    #[tokio::test]
    async fn test_capture_skips_missing_paths() {
        let workspace = BuildWorkspace::materialize(&sources()).await.unwrap();
        let captured = workspace
            .capture(&["src".to_string(), "build/_deps".to_string()])
            .await
            .unwrap();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured.get("src/main.cpp"), Some(&b"int main() {}"[..]));
    }

    #[tokio::test]
    async fn test_collect_output_relative_to_base_directory() {
        let workspace = BuildWorkspace::materialize(&sources()).await.unwrap();
        tokio::fs::create_dir_all(workspace.path().join("build/pkg"))
            .await
            .unwrap();
        tokio::fs::write(workspace.path().join("build/s3Read.zip"), b"zip")
            .await
            .unwrap();
        tokio::fs::write(workspace.path().join("build/pkg/extra.txt"), b"x")
            .await
            .unwrap();

        let spec = ArtifactsSpec {
            files: vec!["s3Read.zip".to_string()],
            base_directory: Some("build".to_string()),
        };
        let output = workspace.collect_output(&spec).await.unwrap();
        assert_eq!(output.len(), 1);
        assert_eq!(output.get("s3Read.zip"), Some(&b"zip"[..]));

        let everything = ArtifactsSpec {
            files: vec!["**/*".to_string()],
            base_directory: Some("build".to_string()),
        };
        let output = workspace.collect_output(&everything).await.unwrap();
        assert_eq!(output.len(), 2);
        assert!(output.get("pkg/extra.txt").is_some());
    }

    #[tokio::test]
    async fn test_collect_output_missing_file_fails() {
        let workspace = BuildWorkspace::materialize(&sources()).await.unwrap();
        let spec = ArtifactsSpec {
            files: vec!["missing.zip".to_string()],
            base_directory: None,
        };
        let err = workspace.collect_output(&spec).await.unwrap_err();
        assert!(matches!(err, PipelineError::Workspace(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_executable_bit_round_trips() {
        use std::os::unix::fs::PermissionsExt;

        let bundle = sources().with_executable("build.sh", "#!/bin/sh\nmake\n").unwrap();
        let workspace = BuildWorkspace::materialize(&bundle).await.unwrap();

        let mode = |path: &str| {
            std::fs::metadata(workspace.path().join(path))
                .unwrap()
                .permissions()
                .mode()
                & 0o777
        };
        assert_eq!(mode("build.sh"), 0o755);
        assert_eq!(mode("src/main.cpp"), 0o644);

        let captured = workspace.capture(&[String::new()]).await.unwrap();
        assert_eq!(captured, bundle);

        let spec = ArtifactsSpec {
            files: vec!["build.sh".to_string()],
            base_directory: None,
        };
        let output = workspace.collect_output(&spec).await.unwrap();
        assert!(output.is_executable("build.sh"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_restore_clears_stale_executable_bit() {
        let workspace = BuildWorkspace::materialize(
            &FileBundle::new().with_executable("run", "a").unwrap(),
        )
        .await
        .unwrap();

        workspace
            .restore(&FileBundle::new().with_file("run", "b").unwrap())
            .await
            .unwrap();

        let captured = workspace.capture(&["run".to_string()]).await.unwrap();
        assert!(!captured.is_executable("run"));
        assert_eq!(captured.get("run"), Some(&b"b"[..]));
    }

    #[tokio::test]
    async fn test_workspaces_are_isolated() {
        let a = BuildWorkspace::materialize(&sources()).await.unwrap();
        let b = BuildWorkspace::materialize(&sources()).await.unwrap();
        tokio::fs::write(a.path().join("only-in-a"), b"a").await.unwrap();

        assert_ne!(a.path(), b.path());
        assert!(!b.path().join("only-in-a").exists());
    }
}
