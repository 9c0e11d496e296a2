//! Command runners: where build commands actually execute.

use super::spec::BuildEnvironment;
use crate::errors::PipelineError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, warn};

/// Exit code reported for a command killed by its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Exit code reported when a command could not be started.
pub const SPAWN_FAILURE_EXIT_CODE: i32 = 127;

/// Result of running one command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutcome {
    /// Process exit code.
    pub exit_code: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: f64,
    /// True if the command was killed by its timeout.
    pub timed_out: bool,
}

impl CommandOutcome {
    /// Creates an outcome with the given exit code and no output.
    #[must_use]
    pub fn exited(exit_code: i32) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 0.0,
            timed_out: false,
        }
    }

    /// Creates the outcome of a command killed by its timeout.
    #[must_use]
    pub fn timed_out(duration_ms: f64) -> Self {
        Self {
            exit_code: TIMEOUT_EXIT_CODE,
            duration_ms,
            timed_out: true,
            ..Self::exited(TIMEOUT_EXIT_CODE)
        }
    }

    /// Returns true if the command exited with status zero.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// Starts build sessions inside a build environment.
#[async_trait]
pub trait CommandRunner: Send + Sync + Debug {
    /// Opens a session rooted at `workspace`.
    async fn open(
        &self,
        environment: &BuildEnvironment,
        workspace: &Path,
    ) -> Result<Box<dyn CommandSession>, PipelineError>;
}

/// A live build session. Commands run one at a time, in order.
#[async_trait]
pub trait CommandSession: Send + Debug {
    /// Runs one shell command in the workspace.
    ///
    /// A non-zero exit is reported in the outcome, not as an error; errors
    /// mean the session itself is broken.
    async fn run(&mut self, command: &str) -> Result<CommandOutcome, PipelineError>;

    /// Releases the session's resources.
    async fn close(&mut self) -> Result<(), PipelineError>;
}

/// Runs commands with `sh -c` on the host, one fresh process per command.
///
/// The process environment is cleared except for `PATH`; `HOME` points at
/// the workspace.
#[derive(Debug, Clone, Default)]
pub struct LocalShellRunner {
    shell: Option<PathBuf>,
}

impl LocalShellRunner {
    /// Creates a runner using `sh` from `PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses a specific shell binary.
    #[must_use]
    pub fn with_shell(mut self, shell: impl Into<PathBuf>) -> Self {
        self.shell = Some(shell.into());
        self
    }
}

#[async_trait]
impl CommandRunner for LocalShellRunner {
    async fn open(
        &self,
        environment: &BuildEnvironment,
        workspace: &Path,
    ) -> Result<Box<dyn CommandSession>, PipelineError> {
        let mut variables = BTreeMap::new();
        if let Ok(path) = std::env::var("PATH") {
            variables.insert("PATH".to_string(), path);
        }
        variables.insert("HOME".to_string(), workspace.display().to_string());
        variables.insert("BUILD_IMAGE".to_string(), environment.image.clone());
        variables.extend(environment.variables.clone());

        Ok(Box::new(LocalShellSession {
            shell: self.shell.clone().unwrap_or_else(|| PathBuf::from("sh")),
            workdir: workspace.to_path_buf(),
            variables,
            timeout: environment.command_timeout(),
        }))
    }
}

#[derive(Debug)]
struct LocalShellSession {
    shell: PathBuf,
    workdir: PathBuf,
    variables: BTreeMap<String, String>,
    timeout: Duration,
}

#[async_trait]
impl CommandSession for LocalShellSession {
    async fn run(&mut self, command: &str) -> Result<CommandOutcome, PipelineError> {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(command)
            .current_dir(&self.workdir)
            .env_clear()
            .envs(&self.variables)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        run_with_timeout(cmd, command, self.timeout).await
    }

    async fn close(&mut self) -> Result<(), PipelineError> {
        Ok(())
    }
}

/// Spawns `cmd` and waits for it, killing it after `timeout`.
pub(crate) async fn run_with_timeout(
    mut cmd: Command,
    label: &str,
    timeout: Duration,
) -> Result<CommandOutcome, PipelineError> {
    let started = Instant::now();
    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!(command = label, error = %e, "Failed to start command");
            return Ok(CommandOutcome {
                stderr: e.to_string(),
                ..CommandOutcome::exited(SPAWN_FAILURE_EXIT_CODE)
            });
        }
    };

    // Dropping the wait future drops the child, which kills it.
    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let outcome = CommandOutcome {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                duration_ms: started.elapsed().as_secs_f64() * 1000.0,
                timed_out: false,
            };
            debug!(
                command = label,
                exit_code = outcome.exit_code,
                duration_ms = outcome.duration_ms,
                "Command finished"
            );
            Ok(outcome)
        }
        Ok(Err(e)) => Err(PipelineError::Workspace(format!(
            "failed waiting for '{label}': {e}"
        ))),
        Err(_) => {
            warn!(command = label, timeout_s = timeout.as_secs(), "Command timed out");
            Ok(CommandOutcome::timed_out(
                started.elapsed().as_secs_f64() * 1000.0,
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn environment() -> BuildEnvironment {
        BuildEnvironment::new("local:1").with_variable("GREETING", "hello")
    }

    #[tokio::test]
    async fn test_local_session_runs_in_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let runner = LocalShellRunner::new();
        let mut session = runner.open(&environment(), dir.path()).await.unwrap();

        let outcome = session
            .run("echo \"$GREETING\" > out.txt && cat out.txt")
            .await
            .unwrap();
        assert!(outcome.success());
        assert_eq!(outcome.stdout.trim(), "hello");
        assert!(dir.path().join("out.txt").exists());
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = LocalShellRunner::new()
            .open(&environment(), dir.path())
            .await
            .unwrap();

        let outcome = session.run("exit 3").await.unwrap();
        assert_eq!(outcome.exit_code, 3);
        assert!(!outcome.success());
    }

    #[tokio::test]
    async fn test_timeout_kills_command() {
        let dir = tempfile::tempdir().unwrap();
        let env = environment().with_command_timeout(Duration::from_secs(1));
        let mut session = LocalShellRunner::new().open(&env, dir.path()).await.unwrap();

        let outcome = session.run("sleep 30").await.unwrap();
        assert!(outcome.timed_out);
        assert_eq!(outcome.exit_code, TIMEOUT_EXIT_CODE);
        assert!(outcome.duration_ms < 10_000.0);
    }

    #[tokio::test]
    async fn test_missing_shell_reports_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = LocalShellRunner::new()
            .with_shell("/nonexistent/deployflow-shell")
            .open(&environment(), dir.path())
            .await
            .unwrap();

        let outcome = session.run("true").await.unwrap();
        assert_eq!(outcome.exit_code, SPAWN_FAILURE_EXIT_CODE);
    }

    #[tokio::test]
    async fn test_host_environment_is_not_inherited() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = LocalShellRunner::new()
            .open(&environment(), dir.path())
            .await
            .unwrap();

        let outcome = session.run("echo \"[$USER]\"").await.unwrap();
        assert_eq!(outcome.stdout.trim(), "[]");
    }
}
