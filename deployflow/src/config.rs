//! Pipeline configuration.
//!
//! A pipeline is described by one JSON document naming the source
//! repository, the target function, the build environment and the build
//! spec. Optional fields fall back to the `default_*` functions below.

use crate::build::{BuildEnvironment, BuildSpec};
use crate::deploy::FunctionIdentity;
use crate::errors::ConfigError;
use crate::observability::LogFormat;
use crate::pipeline::{QueueConfig, DEFAULT_MAX_CONCURRENT_EXECUTIONS};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where sources come from.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    /// Repository name.
    pub repository: String,
    /// Free-form description.
    #[serde(default)]
    pub description: Option<String>,
    /// Local path of the git repository.
    #[serde(default = "default_source_path")]
    pub path: PathBuf,
}

/// The function that receives new code.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FunctionConfig {
    /// Function name.
    pub name: String,
    /// Resource id the credential scope is granted on; derived from the name if unset.
    #[serde(default)]
    pub resource_id: Option<String>,
}

/// How the deploy API is reached.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeployConfig {
    /// Principal the credential scope is bound to.
    #[serde(default = "default_principal")]
    pub principal: String,
    /// Base URL of the deploy API.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Request timeout, in seconds.
    #[serde(default = "default_deploy_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            principal: default_principal(),
            endpoint: None,
            timeout_seconds: default_deploy_timeout_seconds(),
        }
    }
}

/// Which runner executes build commands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerKind {
    /// One podman container per execution.
    #[default]
    Podman,
    /// Host shell with a scrubbed environment.
    Local,
}

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// Pipeline name.
    pub name: String,
    /// Source repository.
    pub source: SourceConfig,
    /// Deploy target.
    pub function: FunctionConfig,
    /// Deploy API settings.
    #[serde(default)]
    pub deploy: DeployConfig,
    /// Build image and variables.
    pub environment: BuildEnvironment,
    /// Phases, cache paths and artifact selection.
    pub build_spec: BuildSpec,
    /// Artifact store root.
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: PathBuf,
    /// Build cache root; the cache lives in memory when unset.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    /// Executions allowed to run at once.
    #[serde(default = "default_max_concurrent_executions")]
    pub max_concurrent_executions: usize,
    /// Command runner.
    #[serde(default)]
    pub runner: RunnerKind,
    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_source_path() -> PathBuf {
    PathBuf::from(".")
}

fn default_principal() -> String {
    "pipeline-build-role".to_string()
}

fn default_deploy_timeout_seconds() -> u64 {
    30
}

fn default_artifact_dir() -> PathBuf {
    PathBuf::from(".deployflow/artifacts")
}

fn default_max_concurrent_executions() -> usize {
    DEFAULT_MAX_CONCURRENT_EXECUTIONS
}

impl PipelineConfig {
    /// Reads and validates a config file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Read` if the file cannot be read, otherwise
    /// whatever [`Self::from_json_str`] returns.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let document = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&document)
    }

    /// Parses and validates a config document.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Parse` for malformed documents (including an
    /// invalid embedded build spec) and the validation error otherwise.
    pub fn from_json_str(document: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(document).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every field that deserialization alone cannot.
    ///
    /// # Errors
    ///
    /// Returns the first invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::invalid("name", "must not be empty"));
        }
        if self.source.repository.trim().is_empty() {
            return Err(ConfigError::invalid("source.repository", "must not be empty"));
        }
        self.function_identity()?;
        if self.deploy.principal.trim().is_empty() {
            return Err(ConfigError::invalid("deploy.principal", "must not be empty"));
        }
        if self.deploy.timeout_seconds == 0 {
            return Err(ConfigError::invalid("deploy.timeout_seconds", "must be at least 1"));
        }
        if self.build_spec.has_deploy_step() && self.deploy.endpoint.is_none() {
            return Err(ConfigError::invalid(
                "deploy.endpoint",
                "required when the build spec contains a deploy step",
            ));
        }
        if self.max_concurrent_executions == 0 {
            return Err(ConfigError::invalid("max_concurrent_executions", "must be at least 1"));
        }
        self.environment.validate()?;
        Ok(())
    }

    /// Returns the deploy target.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` for an unusable function name.
    pub fn function_identity(&self) -> Result<FunctionIdentity, ConfigError> {
        let identity = FunctionIdentity::new(self.function.name.as_str())
            .map_err(|e| ConfigError::invalid("function.name", e.to_string()))?;
        Ok(match &self.function.resource_id {
            Some(resource_id) => identity.with_resource_id(resource_id.as_str()),
            None => identity,
        })
    }

    /// Returns the deploy API request timeout.
    #[must_use]
    pub fn deploy_timeout(&self) -> Duration {
        Duration::from_secs(self.deploy.timeout_seconds)
    }

    /// Returns the trigger queue sizing.
    #[must_use]
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig::default().with_max_concurrent_executions(self.max_concurrent_executions)
    }
}
