//! Container-backed command runner.
//!
//! Each session starts one detached container from the pinned image with the
//! workspace mounted at `/workspace`, runs every command through
//! `podman exec`, and removes the container on close.

use super::runner::{run_with_timeout, CommandOutcome, CommandRunner, CommandSession};
use super::spec::BuildEnvironment;
use crate::errors::PipelineError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Mount point of the workspace inside the container.
pub const CONTAINER_WORKDIR: &str = "/workspace";

/// Runs build commands inside podman containers.
#[derive(Debug, Clone)]
pub struct PodmanRunner {
    binary: PathBuf,
}

impl Default for PodmanRunner {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("podman"),
        }
    }
}

impl PodmanRunner {
    /// Creates a runner using `podman` from `PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses a specific podman binary.
    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Checks that podman is installed and working.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Workspace` if `podman --version` fails.
    pub async fn check_available(&self) -> Result<String, PipelineError> {
        let output = Command::new(&self.binary)
            .arg("--version")
            .output()
            .await
            .map_err(|e| PipelineError::Workspace(format!("podman is not available: {e}")))?;
        if !output.status.success() {
            return Err(PipelineError::Workspace(
                "podman is not working correctly".to_string(),
            ));
        }
        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!(version = %version, "Podman is available");
        Ok(version)
    }

    fn run_args(environment: &BuildEnvironment, name: &str, workspace: &Path) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            name.to_string(),
            "--entrypoint".to_string(),
            "/bin/sh".to_string(),
            "-v".to_string(),
            format!("{}:{CONTAINER_WORKDIR}", workspace.display()),
            "-w".to_string(),
            CONTAINER_WORKDIR.to_string(),
            "-e".to_string(),
            format!("HOME={CONTAINER_WORKDIR}"),
        ];
        for (key, value) in &environment.variables {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push(environment.image.clone());
        args.push("-c".to_string());
        args.push("sleep infinity".to_string());
        args
    }
}

#[async_trait]
impl CommandRunner for PodmanRunner {
    async fn open(
        &self,
        environment: &BuildEnvironment,
        workspace: &Path,
    ) -> Result<Box<dyn CommandSession>, PipelineError> {
        environment.validate()?;

        let name = format!("deployflow-{}", crate::utils::generate_uuid().simple());
        let output = Command::new(&self.binary)
            .args(Self::run_args(environment, &name, workspace))
            .output()
            .await
            .map_err(|e| PipelineError::Workspace(format!("failed to run podman: {e}")))?;

        if !output.status.success() {
            return Err(PipelineError::Workspace(format!(
                "failed to start container for image {}: exit_code={}, stderr='{}'",
                environment.image,
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        info!(
            container = %name,
            image = %environment.image,
            "Build container started"
        );

        Ok(Box::new(PodmanSession {
            binary: self.binary.clone(),
            container: name,
            timeout: environment.command_timeout(),
            closed: false,
        }))
    }
}

#[derive(Debug)]
struct PodmanSession {
    binary: PathBuf,
    container: String,
    timeout: Duration,
    closed: bool,
}

#[async_trait]
impl CommandSession for PodmanSession {
    async fn run(&mut self, command: &str) -> Result<CommandOutcome, PipelineError> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("exec")
            .arg("-w")
            .arg(CONTAINER_WORKDIR)
            .arg(&self.container)
            .arg("/bin/sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        run_with_timeout(cmd, command, self.timeout).await
    }

    async fn close(&mut self) -> Result<(), PipelineError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let output = Command::new(&self.binary)
            .args(["rm", "-f", self.container.as_str()])
            .output()
            .await
            .map_err(|e| PipelineError::Workspace(format!("failed to run podman rm: {e}")))?;
        if output.status.success() {
            debug!(container = %self.container, "Build container removed");
            Ok(())
        } else {
            warn!(
                container = %self.container,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "Failed to remove build container"
            );
            Err(PipelineError::Workspace(format!(
                "failed to remove container {}",
                self.container
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_args_mount_workspace_and_pass_variables() {
        let env = BuildEnvironment::new("amazonlinux:2").with_variable("BUCKET", "cpp");
        let args = PodmanRunner::run_args(&env, "deployflow-x", Path::new("/tmp/ws"));

        assert_eq!(&args[..4], ["run", "-d", "--name", "deployflow-x"]);
        assert!(args.contains(&"/tmp/ws:/workspace".to_string()));
        assert!(args.contains(&"BUCKET=cpp".to_string()));
        let image_at = args.iter().position(|a| a == "amazonlinux:2").unwrap();
        assert_eq!(&args[image_at + 1..], ["-c", "sleep infinity"]);
    }

    #[tokio::test]
    async fn test_open_rejects_unpinned_image() {
        let runner = PodmanRunner::new().with_binary("/nonexistent/podman");
        let err = runner
            .open(&BuildEnvironment::new("alpine:latest"), Path::new("/tmp"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::BuildSpec(_)));
    }

    #[tokio::test]
    async fn test_missing_binary_is_unavailable() {
        let runner = PodmanRunner::new().with_binary("/nonexistent/podman");
        assert!(runner.check_available().await.is_err());
    }
}
