//! Transition events emitted for observability.

use super::ExecutionStatus;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// What a transition event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionScope {
    /// A whole pipeline execution.
    Pipeline,
    /// A stage within an execution.
    Stage,
    /// An action within a stage.
    Action,
    /// A build phase within a build action.
    Phase,
}

impl fmt::Display for TransitionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pipeline => write!(f, "pipeline"),
            Self::Stage => write!(f, "stage"),
            Self::Action => write!(f, "action"),
            Self::Phase => write!(f, "phase"),
        }
    }
}

/// A status transition of a pipeline, stage, action or phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionEvent {
    /// The execution the transition belongs to.
    pub execution_id: Uuid,
    /// What changed status.
    pub scope: TransitionScope,
    /// Name of the pipeline, stage, action or phase.
    pub name: String,
    /// The new status.
    pub status: ExecutionStatus,
    /// When the transition happened (ISO 8601).
    pub timestamp: String,
    /// Duration in milliseconds, for terminal transitions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
    /// Error message, for failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TransitionEvent {
    /// Creates a new transition event.
    #[must_use]
    pub fn new(
        execution_id: Uuid,
        scope: TransitionScope,
        name: impl Into<String>,
        status: ExecutionStatus,
    ) -> Self {
        Self {
            execution_id,
            scope,
            name: name.into(),
            status,
            timestamp: crate::utils::iso_timestamp(),
            duration_ms: None,
            error: None,
        }
    }

    /// Sets the duration.
    #[must_use]
    pub fn with_duration_ms(mut self, duration_ms: f64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Sets the error message.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Returns the event type, e.g. `stage.started` or `action.failed`.
    #[must_use]
    pub fn event_type(&self) -> String {
        let verb = match self.status {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "started",
            ExecutionStatus::Succeeded => "succeeded",
            ExecutionStatus::Failed => "failed",
        };
        format!("{}.{verb}", self.scope)
    }
}

/// Which side of the build cache degraded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheOperation {
    /// Restoring an entry at phase start.
    Read,
    /// Saving an entry at phase end.
    Write,
}

impl fmt::Display for CacheOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
        }
    }
}

/// Everything the controller and build executor report to an event sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// A pipeline, stage, action or phase changed status.
    Transition(TransitionEvent),
    /// The build cache failed; the build carries on without it.
    CacheUnavailable {
        /// The execution affected.
        execution_id: Uuid,
        /// The phase being restored or saved.
        phase: String,
        /// Read or write.
        operation: CacheOperation,
        /// Why the cache was unusable.
        reason: String,
    },
    /// The function now runs the new code.
    Deployed {
        /// The execution that deployed.
        execution_id: Uuid,
        /// The updated function.
        function: String,
        /// Version reported by the deploy API.
        version: String,
        /// Store key of the deployed bundle.
        artifact: String,
    },
    /// The deploy call was refused or failed.
    DeployFailed {
        /// The execution that tried to deploy.
        execution_id: Uuid,
        /// The target function.
        function: String,
        /// The failure.
        error: String,
    },
}

impl PipelineEvent {
    /// Returns the event type, e.g. `stage.started` or `cache.unavailable`.
    #[must_use]
    pub fn event_type(&self) -> String {
        match self {
            Self::Transition(transition) => transition.event_type(),
            Self::CacheUnavailable { .. } => "cache.unavailable".to_string(),
            Self::Deployed { .. } => "deploy.succeeded".to_string(),
            Self::DeployFailed { .. } => "deploy.failed".to_string(),
        }
    }

    /// Returns true for failures and degradations.
    #[must_use]
    pub fn is_problem(&self) -> bool {
        match self {
            Self::Transition(transition) => transition.status == ExecutionStatus::Failed,
            Self::CacheUnavailable { .. } | Self::DeployFailed { .. } => true,
            Self::Deployed { .. } => false,
        }
    }
}

impl From<TransitionEvent> for PipelineEvent {
    fn from(event: TransitionEvent) -> Self {
        Self::Transition(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type() {
        let id = Uuid::new_v4();
        let started = TransitionEvent::new(id, TransitionScope::Stage, "Build", ExecutionStatus::Running);
        let failed = TransitionEvent::new(id, TransitionScope::Action, "CodeBuild", ExecutionStatus::Failed);

        assert_eq!(started.event_type(), "stage.started");
        assert_eq!(failed.event_type(), "action.failed");
    }

    #[test]
    fn test_event_payload() {
        let event = TransitionEvent::new(
            Uuid::nil(),
            TransitionScope::Pipeline,
            "CppOnLambda",
            ExecutionStatus::Failed,
        )
        .with_duration_ms(12.5)
        .with_error("boom");

        let value = serde_json::to_value(PipelineEvent::from(event)).unwrap();
        assert_eq!(value["kind"], serde_json::json!("transition"));
        assert_eq!(value["scope"], serde_json::json!("pipeline"));
        assert_eq!(value["status"], serde_json::json!("failed"));
        assert_eq!(value["error"], serde_json::json!("boom"));
        assert_eq!(value["duration_ms"], serde_json::json!(12.5));
        assert!(value["timestamp"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn test_build_event_types() {
        let cache = PipelineEvent::CacheUnavailable {
            execution_id: Uuid::nil(),
            phase: "install".to_string(),
            operation: CacheOperation::Write,
            reason: "disk full".to_string(),
        };
        let failed = PipelineEvent::DeployFailed {
            execution_id: Uuid::nil(),
            function: "s3Read".to_string(),
            error: "revoked".to_string(),
        };
        let deployed = PipelineEvent::Deployed {
            execution_id: Uuid::nil(),
            function: "s3Read".to_string(),
            version: "2".to_string(),
            artifact: "sha256/aa".to_string(),
        };

        assert_eq!(cache.event_type(), "cache.unavailable");
        assert_eq!(failed.event_type(), "deploy.failed");
        assert_eq!(deployed.event_type(), "deploy.succeeded");
        assert!(cache.is_problem() && failed.is_problem());
        assert!(!deployed.is_problem());
        assert_eq!(serde_json::to_value(&cache).unwrap()["operation"], "write");
    }
}
