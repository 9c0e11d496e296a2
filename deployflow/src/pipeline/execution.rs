//! Execution records and their persistence.

use crate::build::PhaseRecord;
use crate::core::{Artifact, ExecutionStatus, Revision};
use crate::deploy::DeployOutcome;
use crate::errors::{ErrorReport, PipelineError};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Debug;
use uuid::Uuid;

/// Moves `status` to `next`, rejecting transitions out of terminal states.
pub(crate) fn transition(
    status: &mut ExecutionStatus,
    next: ExecutionStatus,
    what: &str,
) -> Result<(), PipelineError> {
    if !status.can_transition_to(next) {
        return Err(PipelineError::Internal(format!(
            "invalid transition for {what}: {status} -> {next}"
        )));
    }
    *status = next;
    Ok(())
}

/// The record of one action run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    /// The action name.
    pub name: String,
    /// The action status.
    pub status: ExecutionStatus,
    /// Consumed artifact names.
    pub inputs: Vec<String>,
    /// Ids of produced artifacts.
    #[serde(default)]
    pub artifacts: Vec<Uuid>,
    /// Build phases, for build actions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub phases: Vec<PhaseRecord>,
    /// When the action started (ISO 8601).
    pub started_at: Option<String>,
    /// When the action finished (ISO 8601).
    pub finished_at: Option<String>,
    /// The failure, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
}

impl ActionRecord {
    /// Creates a pending record.
    #[must_use]
    pub fn pending(name: impl Into<String>, inputs: Vec<String>) -> Self {
        Self {
            name: name.into(),
            status: ExecutionStatus::Pending,
            inputs,
            artifacts: Vec::new(),
            phases: Vec::new(),
            started_at: None,
            finished_at: None,
            error: None,
        }
    }
}

/// The record of one stage run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    /// The stage name.
    pub name: String,
    /// The stage status.
    pub status: ExecutionStatus,
    /// Action records, in order.
    pub actions: Vec<ActionRecord>,
    /// When the stage started (ISO 8601).
    pub started_at: Option<String>,
    /// When the stage finished (ISO 8601).
    pub finished_at: Option<String>,
    /// Duration in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
}

impl StageRecord {
    /// Creates a pending record.
    #[must_use]
    pub fn pending(name: impl Into<String>, actions: Vec<ActionRecord>) -> Self {
        Self {
            name: name.into(),
            status: ExecutionStatus::Pending,
            actions,
            started_at: None,
            finished_at: None,
            duration_ms: None,
        }
    }
}

/// One run of the pipeline for one trigger event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineExecution {
    /// Unique execution id.
    pub id: Uuid,
    /// The triggering event id.
    pub trigger_id: Uuid,
    /// The pipeline name.
    pub pipeline: String,
    /// The revision being built.
    pub revision: Revision,
    /// Overall status.
    pub status: ExecutionStatus,
    /// Stage records in execution order.
    pub stages: Vec<StageRecord>,
    /// Every artifact produced.
    pub artifacts: Vec<Artifact>,
    /// What happened at the deploy step.
    pub deploy: DeployOutcome,
    /// The failure, if the execution failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
    /// When the execution started (ISO 8601).
    pub started_at: String,
    /// When the execution finished (ISO 8601).
    pub finished_at: Option<String>,
    /// Duration in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
}

/// The final execution record returned to the caller.
pub type PipelineResult = PipelineExecution;

impl PipelineExecution {
    /// Returns true if every stage succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Returns the status of the named stage.
    #[must_use]
    pub fn stage_status(&self, name: &str) -> Option<ExecutionStatus> {
        self.stages.iter().find(|s| s.name == name).map(|s| s.status)
    }

    /// Returns the artifact named `name`, if produced.
    #[must_use]
    pub fn artifact(&self, name: &str) -> Option<&Artifact> {
        self.artifacts.iter().find(|a| a.name == name)
    }

    /// Serializes the record as pretty JSON.
    #[must_use]
    pub fn to_json_pretty(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Persistence for execution records.
#[async_trait]
pub trait ExecutionStore: Send + Sync + Debug {
    /// Inserts or replaces a record.
    async fn save(&self, execution: &PipelineExecution);

    /// Gets a record by id.
    async fn get(&self, id: Uuid) -> Option<PipelineExecution>;

    /// Lists records for a revision, oldest first.
    async fn list_for_revision(&self, revision: &Revision) -> Vec<PipelineExecution>;
}

/// In-memory execution store.
#[derive(Debug, Default)]
pub struct InMemoryExecutionStore {
    records: RwLock<HashMap<Uuid, PipelineExecution>>,
}

impl InMemoryExecutionStore {
    /// Creates a new in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Returns true if no records are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn save(&self, execution: &PipelineExecution) {
        self.records.write().insert(execution.id, execution.clone());
    }

    async fn get(&self, id: Uuid) -> Option<PipelineExecution> {
        self.records.read().get(&id).cloned()
    }

    async fn list_for_revision(&self, revision: &Revision) -> Vec<PipelineExecution> {
        let mut found: Vec<_> = self
            .records
            .read()
            .values()
            .filter(|e| &e.revision == revision)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        found
    }
}
