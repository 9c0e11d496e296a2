//! Test doubles for the pipeline's external collaborators.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::build::{BuildEnvironment, CommandOutcome, CommandRunner, CommandSession};
use crate::core::{FileBundle, Revision};
use crate::deploy::{DeployAck, DeployRequest, FunctionDeployer};
use crate::errors::{CacheError, DeployError, PipelineError, SourceError};
use crate::source::SourceRepository;
use crate::storage::BuildCache;

/// A deployer that acknowledges every call and records the requests.
#[derive(Debug, Default)]
pub struct RecordingDeployer {
    calls: Mutex<Vec<DeployRequest>>,
}

impl RecordingDeployer {
    /// Creates a new recording deployer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the recorded requests, in call order.
    #[must_use]
    pub fn calls(&self) -> Vec<DeployRequest> {
        self.calls.lock().clone()
    }

    /// Returns the number of calls.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl FunctionDeployer for RecordingDeployer {
    async fn update_function_code(&self, request: &DeployRequest) -> Result<DeployAck, DeployError> {
        let mut calls = self.calls.lock();
        calls.push(request.clone());
        Ok(DeployAck::for_request(request, calls.len().to_string()))
    }
}

/// A deployer whose every call fails.
#[derive(Debug)]
pub struct FailingDeployer {
    status: Option<u16>,
    message: String,
    calls: AtomicUsize,
}

impl FailingDeployer {
    /// Fails every call with a transport error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
            calls: AtomicUsize::new(0),
        }
    }

    /// Fails every call with an API rejection.
    #[must_use]
    pub fn rejecting(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            ..Self::new(message)
        }
    }

    /// Returns the number of calls.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FunctionDeployer for FailingDeployer {
    async fn update_function_code(&self, _request: &DeployRequest) -> Result<DeployAck, DeployError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(match self.status {
            Some(status) => DeployError::Rejected {
                status,
                message: self.message.clone(),
            },
            None => DeployError::Transport(self.message.clone()),
        })
    }
}

#[derive(Debug, Clone, Default)]
struct Script {
    exit_code: i32,
    writes: Vec<(String, Vec<u8>)>,
    delay: Option<Duration>,
}

#[derive(Debug, Default)]
struct ScriptState {
    scripts: Mutex<HashMap<String, Script>>,
    executed: Mutex<Vec<String>>,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

/// A command runner that never spawns processes.
///
/// Commands succeed unless scripted otherwise. Scripted commands can write
/// files into the workspace, sleep, or exit with a given code.
#[derive(Debug, Clone, Default)]
pub struct ScriptedRunner {
    state: Arc<ScriptState>,
}

impl ScriptedRunner {
    /// Creates a runner where every command succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `command` exit with `exit_code`.
    #[must_use]
    pub fn fail_on(self, command: impl Into<String>, exit_code: i32) -> Self {
        self.state
            .scripts
            .lock()
            .entry(command.into())
            .or_default()
            .exit_code = exit_code;
        self
    }

    /// Makes `command` write `content` to `path` in the workspace.
    #[must_use]
    pub fn writes(self, command: impl Into<String>, path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        self.state
            .scripts
            .lock()
            .entry(command.into())
            .or_default()
            .writes
            .push((path.into(), content.into()));
        self
    }

    /// Makes `command` take `delay` before finishing.
    #[must_use]
    pub fn delay_on(self, command: impl Into<String>, delay: Duration) -> Self {
        self.state
            .scripts
            .lock()
            .entry(command.into())
            .or_default()
            .delay = Some(delay);
        self
    }

    /// Returns every command run through any session, in order.
    #[must_use]
    pub fn executed(&self) -> Vec<String> {
        self.state.executed.lock().clone()
    }

    /// Returns the number of sessions opened.
    #[must_use]
    pub fn sessions_opened(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }

    /// Returns the number of sessions closed.
    #[must_use]
    pub fn sessions_closed(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn open(
        &self,
        _environment: &BuildEnvironment,
        workspace: &Path,
    ) -> Result<Box<dyn CommandSession>, PipelineError> {
        self.state.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            state: Arc::clone(&self.state),
            workdir: workspace.to_path_buf(),
        }))
    }
}

#[derive(Debug)]
struct ScriptedSession {
    state: Arc<ScriptState>,
    workdir: PathBuf,
}

#[async_trait]
impl CommandSession for ScriptedSession {
    async fn run(&mut self, command: &str) -> Result<CommandOutcome, PipelineError> {
        self.state.executed.lock().push(command.to_string());
        let script = self.state.scripts.lock().get(command).cloned().unwrap_or_default();

        if let Some(delay) = script.delay {
            tokio::time::sleep(delay).await;
        }
        for (path, content) in &script.writes {
            let target = self.workdir.join(path);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, content).await?;
        }
        Ok(CommandOutcome::exited(script.exit_code))
    }

    async fn close(&mut self) -> Result<(), PipelineError> {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A build cache whose backend is always down.
#[derive(Debug, Default)]
pub struct UnavailableCache {
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl UnavailableCache {
    /// Creates a new unavailable cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of attempted reads.
    #[must_use]
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Returns the number of attempted writes.
    #[must_use]
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BuildCache for UnavailableCache {
    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Err(CacheError::Unavailable("cache backend offline".to_string()))
    }

    async fn put(&self, _key: &str, _bytes: Vec<u8>) -> Result<(), CacheError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Err(CacheError::Unavailable("cache backend offline".to_string()))
    }
}

/// A repository that is always unreachable.
#[derive(Debug, Default)]
pub struct UnreachableRepository {
    attempts: AtomicUsize,
}

impl UnreachableRepository {
    /// Creates a new unreachable repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of snapshot attempts.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceRepository for UnreachableRepository {
    fn name(&self) -> &str {
        "unreachable"
    }

    async fn snapshot(&self, _revision: &Revision) -> Result<FileBundle, SourceError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(SourceError::Backend("connection refused".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_runner_writes_and_fails() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::new()
            .writes("make", "build/out.zip", b"zip".to_vec())
            .fail_on("make test", 2);
        let mut session = runner
            .open(&BuildEnvironment::new("img:1"), dir.path())
            .await
            .unwrap();

        assert_eq!(session.run("make").await.unwrap().exit_code, 0);
        assert_eq!(session.run("make test").await.unwrap().exit_code, 2);
        session.close().await.unwrap();

        assert!(dir.path().join("build/out.zip").exists());
        assert_eq!(runner.executed(), vec!["make", "make test"]);
        assert_eq!(runner.sessions_opened(), 1);
        assert_eq!(runner.sessions_closed(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_cache_counts_attempts() {
        let cache = UnavailableCache::new();
        assert!(cache.get("k").await.is_err());
        assert!(cache.put("k", vec![1]).await.is_err());
        assert_eq!((cache.reads(), cache.writes()), (1, 1));
    }
}
