//! Error types for the deployflow pipeline.
//!
//! The top-level [`PipelineError`] carries the taxonomy surfaced to
//! operators: source unavailability, failed build commands, failed deploy
//! calls and (non-fatal) cache unavailability. Each collaborator has its own
//! leaf error type that converts into it.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// The kind of a pipeline error, as reported on execution records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The source revision could not be snapshotted.
    SourceUnavailable,
    /// A build command exited non-zero or timed out.
    PhaseCommandFailed,
    /// The deploy call failed after a successful build.
    DeployCallFailed,
    /// The build cache could not be read or written.
    CacheUnavailable,
    /// The pipeline or build definition is invalid.
    Validation,
    /// The artifact store rejected or lost an object.
    Store,
    /// A credential check failed.
    Credential,
    /// The build workspace could not be prepared.
    Workspace,
    /// Anything else.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::SourceUnavailable => "SourceUnavailable",
            Self::PhaseCommandFailed => "PhaseCommandFailed",
            Self::DeployCallFailed => "DeployCallFailed",
            Self::CacheUnavailable => "CacheUnavailable",
            Self::Validation => "Validation",
            Self::Store => "Store",
            Self::Credential => "Credential",
            Self::Workspace => "Workspace",
            Self::Internal => "Internal",
        };
        f.write_str(s)
    }
}

/// The main error type for pipeline operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The trigger could not snapshot the revision.
    #[error("Source unavailable for revision '{revision}': {reason}")]
    SourceUnavailable {
        /// The revision that was requested.
        revision: String,
        /// Why it could not be fetched.
        reason: String,
    },

    /// A build command exited non-zero.
    #[error("Command failed in phase '{phase}': `{command}` exited with code {exit_code}")]
    PhaseCommandFailed {
        /// The phase the command belongs to.
        phase: String,
        /// The command text.
        command: String,
        /// The exit code (124 when the command was killed on timeout).
        exit_code: i32,
    },

    /// The deploy call failed after the build succeeded.
    #[error("Deploy call failed: {reason}")]
    DeployCallFailed {
        /// The failure reason reported by the deploy API or the credential check.
        reason: String,
    },

    /// The build cache could not be used. Never fatal to a build.
    #[error("Build cache unavailable: {reason}")]
    CacheUnavailable {
        /// The backend failure.
        reason: String,
    },

    /// The pipeline definition is invalid.
    #[error("{0}")]
    Validation(#[from] PipelineValidationError),

    /// The build spec or build environment is invalid.
    #[error("{0}")]
    BuildSpec(#[from] BuildSpecError),

    /// The artifact store failed.
    #[error("{0}")]
    Store(#[from] StoreError),

    /// A credential check failed outside of a deploy call.
    #[error("{0}")]
    Credential(#[from] CredentialError),

    /// The build workspace could not be prepared or collected.
    #[error("Workspace error: {0}")]
    Workspace(String),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Creates a phase command failure.
    #[must_use]
    pub fn phase_command_failed(
        phase: impl Into<String>,
        command: impl Into<String>,
        exit_code: i32,
    ) -> Self {
        Self::PhaseCommandFailed {
            phase: phase.into(),
            command: command.into(),
            exit_code,
        }
    }

    /// Creates a deploy call failure.
    #[must_use]
    pub fn deploy_call_failed(reason: impl Into<String>) -> Self {
        Self::DeployCallFailed {
            reason: reason.into(),
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SourceUnavailable { .. } => ErrorKind::SourceUnavailable,
            Self::PhaseCommandFailed { .. } => ErrorKind::PhaseCommandFailed,
            Self::DeployCallFailed { .. } => ErrorKind::DeployCallFailed,
            Self::CacheUnavailable { .. } => ErrorKind::CacheUnavailable,
            Self::Validation(_) | Self::BuildSpec(_) => ErrorKind::Validation,
            Self::Store(_) => ErrorKind::Store,
            Self::Credential(_) => ErrorKind::Credential,
            Self::Workspace(_) => ErrorKind::Workspace,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Returns true if the error must abort the current stage.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::CacheUnavailable { .. })
    }

    /// Builds the serializable report stored on execution records.
    #[must_use]
    pub fn to_report(&self) -> ErrorReport {
        let (phase, command, exit_code) = match self {
            Self::PhaseCommandFailed {
                phase,
                command,
                exit_code,
            } => (Some(phase.clone()), Some(command.clone()), Some(*exit_code)),
            _ => (None, None, None),
        };
        ErrorReport {
            kind: self.kind(),
            message: self.to_string(),
            phase,
            command,
            exit_code,
        }
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        Self::Workspace(err.to_string())
    }
}

/// Serializable summary of a [`PipelineError`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    /// The error kind.
    pub kind: ErrorKind,
    /// Human readable message.
    pub message: String,
    /// Offending phase, for command failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    /// Offending command, for command failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Exit code, for command failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// Error raised when a pipeline definition fails validation.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PipelineValidationError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<String>,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
}

impl PipelineValidationError {
    /// Creates a new pipeline validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
            fix_hint: None,
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }
}

/// Errors raised while validating a build spec or build environment.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildSpecError {
    /// The document could not be parsed.
    #[error("Invalid build spec document: {0}")]
    Parse(String),

    /// Only version 0.2 documents are understood.
    #[error("Unsupported build spec version '{0}' (expected \"0.2\")")]
    UnsupportedVersion(String),

    /// A command was empty or whitespace.
    #[error("Phase '{phase}' contains an empty command")]
    EmptyCommand {
        /// The phase name.
        phase: String,
    },

    /// The deploy step appeared before the final phase.
    #[error("Deploy step declared in phase '{phase}'; it is only allowed in the final phase")]
    DeployOutsideFinalPhase {
        /// The phase name.
        phase: String,
    },

    /// More than one deploy step was declared.
    #[error("Deploy step declared more than once")]
    DuplicateDeploy,

    /// The base image is not pinned to a version.
    #[error("Build image '{image}' is not pinned to a tag or digest")]
    UnpinnedImage {
        /// The image reference.
        image: String,
    },

    /// A declared path escapes the workspace.
    #[error("Path '{path}' must be relative and stay inside the workspace")]
    InvalidPath {
        /// The offending path.
        path: String,
    },
}

/// Errors raised while decoding a file bundle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BundleError {
    /// The bytes are not a bundle document.
    #[error("invalid bundle document: {0}")]
    Malformed(String),

    /// The bundle was written by an unknown format version.
    #[error("unsupported bundle version {0}")]
    UnsupportedVersion(u32),

    /// A file's content is not valid base64.
    #[error("invalid content for '{path}': {reason}")]
    InvalidContent {
        /// The file path.
        path: String,
        /// Decoding failure.
        reason: String,
    },

    /// A file path escapes the bundle root.
    #[error(transparent)]
    InvalidPath(#[from] BuildSpecError),
}

/// Errors raised by the artifact store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// No object exists under the key.
    #[error("Artifact object not found: {key}")]
    NotFound {
        /// The missing key.
        key: String,
    },

    /// A different object already exists under the key.
    #[error("Artifact object '{key}' already exists with different content")]
    WriteOnceViolation {
        /// The conflicting key.
        key: String,
    },

    /// The key is not usable as an object name.
    #[error("Invalid artifact key '{key}'")]
    InvalidKey {
        /// The rejected key.
        key: String,
    },

    /// The stored object could not be decoded.
    #[error("Artifact object '{key}' is corrupt: {reason}")]
    Corrupt {
        /// The key.
        key: String,
        /// Decoding failure.
        reason: String,
    },

    /// The backend failed.
    #[error("Artifact store backend error: {0}")]
    Backend(String),
}

/// Errors raised by the build cache.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The cache backend could not be reached.
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),

    /// A cache entry could not be decoded.
    #[error("cache entry '{key}' is corrupt: {reason}")]
    Corrupt {
        /// The key.
        key: String,
        /// Decoding failure.
        reason: String,
    },
}

impl From<CacheError> for PipelineError {
    fn from(err: CacheError) -> Self {
        Self::CacheUnavailable {
            reason: err.to_string(),
        }
    }
}

/// Errors raised by source repositories.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    /// The revision does not exist.
    #[error("revision '{revision}' not found")]
    RevisionNotFound {
        /// The requested revision.
        revision: String,
    },

    /// The revision identifier is malformed.
    #[error("invalid revision identifier '{0}'")]
    InvalidRevision(String),

    /// The repository backend failed.
    #[error("repository backend error: {0}")]
    Backend(String),
}

/// Errors raised by credential checks.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialError {
    /// The scope grants more than one action on one resource.
    #[error("Credential scope is broader than a single deploy grant: {reason}")]
    ScopeTooBroad {
        /// What made the scope too broad.
        reason: String,
    },

    /// The requested action is not granted.
    #[error("Principal '{principal}' is not permitted to perform '{action}' on '{resource}'")]
    NotPermitted {
        /// The principal.
        principal: String,
        /// The requested action.
        action: String,
        /// The requested resource.
        resource: String,
    },

    /// The scope has been revoked.
    #[error("Credential scope for principal '{principal}' has been revoked")]
    Revoked {
        /// The principal.
        principal: String,
    },
}

/// Errors raised by the deploy API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeployError {
    /// The credential check refused the call.
    #[error("{0}")]
    Unauthorized(#[from] CredentialError),

    /// The deploy API rejected the request.
    #[error("deploy API rejected the update (status {status}): {message}")]
    Rejected {
        /// HTTP-like status code.
        status: u16,
        /// Response message.
        message: String,
    },

    /// The deploy API could not be reached.
    #[error("deploy API unreachable: {0}")]
    Transport(String),

    /// The function name is not usable by the deploy API.
    #[error("invalid function name '{name}': expected 1-64 characters of letters, digits, '-' or '_'")]
    InvalidFunction {
        /// The rejected name.
        name: String,
    },
}

/// Errors raised while loading pipeline configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("Failed to read config '{path}': {source}")]
    Read {
        /// The config path.
        path: String,
        /// The I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// The document is not valid configuration JSON.
    #[error("Invalid config document: {0}")]
    Parse(String),

    /// A field holds an unusable value.
    #[error("Invalid config field '{field}': {message}")]
    Invalid {
        /// Dotted field path.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// The embedded build spec or environment is invalid.
    #[error(transparent)]
    BuildSpec(#[from] BuildSpecError),
}

impl ConfigError {
    /// Creates an invalid-field error.
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl From<DeployError> for PipelineError {
    fn from(err: DeployError) -> Self {
        Self::DeployCallFailed {
            reason: err.to_string(),
        }
    }
}

impl From<SourceError> for PipelineError {
    fn from(err: SourceError) -> Self {
        let revision = match &err {
            SourceError::RevisionNotFound { revision } => revision.clone(),
            SourceError::InvalidRevision(revision) => revision.clone(),
            SourceError::Backend(_) => String::new(),
        };
        Self::SourceUnavailable {
            revision,
            reason: err.to_string(),
        }
    }
}
