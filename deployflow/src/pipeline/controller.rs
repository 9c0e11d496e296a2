//! The pipeline controller: drives one execution through its stages.

use super::action::{ActionContext, ActionOutput};
use super::definition::{PipelineDefinition, StageDefinition};
use super::execution::{
    transition, ActionRecord, ExecutionStore, InMemoryExecutionStore, PipelineExecution,
    PipelineResult, StageRecord,
};
use crate::core::{Artifact, ExecutionStatus, TransitionEvent, TransitionScope, TriggerEvent};
use crate::deploy::DeployOutcome;
use crate::errors::PipelineError;
use crate::events::{EventSink, NoOpEventSink};
use crate::observability::SpanTimer;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Runs pipeline executions.
///
/// Stages run strictly in order and a stage starts only after its
/// predecessor succeeded. The first failure halts the execution; later
/// stages stay pending.
#[derive(Clone)]
pub struct PipelineController {
    definition: Arc<PipelineDefinition>,
    events: Arc<dyn EventSink>,
    executions: Arc<dyn ExecutionStore>,
}

impl fmt::Debug for PipelineController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineController")
            .field("pipeline", &self.definition.name())
            .field("stages", &self.definition.stage_names())
            .field("executions", &self.executions)
            .finish_non_exhaustive()
    }
}

struct StageRun<'a> {
    execution_id: Uuid,
    trigger: &'a TriggerEvent,
    handoff: HashMap<String, Artifact>,
    artifacts: Vec<Artifact>,
    deploy: DeployOutcome,
}

impl PipelineController {
    /// Creates a controller for `definition`.
    #[must_use]
    pub fn new(definition: PipelineDefinition) -> Self {
        Self {
            definition: Arc::new(definition),
            events: Arc::new(NoOpEventSink),
            executions: Arc::new(InMemoryExecutionStore::new()),
        }
    }

    /// Sets the sink for transition events.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Sets where execution records are persisted.
    #[must_use]
    pub fn with_execution_store(mut self, executions: Arc<dyn ExecutionStore>) -> Self {
        self.executions = executions;
        self
    }

    /// Returns the pipeline definition.
    #[must_use]
    pub fn definition(&self) -> &PipelineDefinition {
        &self.definition
    }

    /// Returns the execution store.
    #[must_use]
    pub fn executions(&self) -> &Arc<dyn ExecutionStore> {
        &self.executions
    }

    /// Runs one execution for `event` and returns its final record.
    pub async fn run(&self, event: TriggerEvent) -> PipelineResult {
        let execution_id = crate::utils::generate_uuid_v7();
        let timer = SpanTimer::start(self.definition.name());
        let mut record = self.new_record(execution_id, &event);

        info!(
            execution_id = %execution_id,
            pipeline = %record.pipeline,
            revision = %event.revision,
            "Pipeline execution started"
        );
        if let Err(e) = transition(&mut record.status, ExecutionStatus::Running, "pipeline") {
            warn!(error = %e, "Unexpected pipeline status");
        }
        self.emit(execution_id, TransitionScope::Pipeline, self.definition.name(), ExecutionStatus::Running, None, None);
        self.executions.save(&record).await;

        let mut run = StageRun {
            execution_id,
            trigger: &event,
            handoff: HashMap::new(),
            artifacts: Vec::new(),
            deploy: DeployOutcome::NotAttempted,
        };

        let mut failure = None;
        for (index, stage) in self.definition.stages().iter().enumerate() {
            let result = self.run_stage(stage, &mut record.stages[index], &mut run).await;
            record.artifacts.clone_from(&run.artifacts);
            record.deploy = run.deploy.clone();
            self.executions.save(&record).await;
            if let Err(e) = result {
                failure = Some(e);
                break;
            }
        }

        let duration_ms = timer.finish();
        let next = if failure.is_some() {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Succeeded
        };
        if let Err(e) = transition(&mut record.status, next, "pipeline") {
            warn!(error = %e, "Unexpected pipeline status");
        }
        record.error = failure.as_ref().map(PipelineError::to_report);
        record.finished_at = Some(crate::utils::iso_timestamp());
        record.duration_ms = Some(duration_ms);

        match &failure {
            None => info!(
                execution_id = %execution_id,
                duration_ms,
                deployed = record.deploy.is_deployed(),
                "Pipeline execution succeeded"
            ),
            Some(e) => error!(
                execution_id = %execution_id,
                duration_ms,
                error_kind = %e.kind(),
                error = %e,
                "Pipeline execution failed"
            ),
        }
        self.emit(
            execution_id,
            TransitionScope::Pipeline,
            self.definition.name(),
            next,
            Some(duration_ms),
            failure.as_ref().map(ToString::to_string),
        );
        self.executions.save(&record).await;
        record
    }

    fn new_record(&self, execution_id: Uuid, event: &TriggerEvent) -> PipelineExecution {
        let stages = self
            .definition
            .stages()
            .iter()
            .map(|stage| {
                let actions = stage
                    .actions
                    .iter()
                    .map(|a| ActionRecord::pending(a.name(), a.input_artifacts()))
                    .collect();
                StageRecord::pending(&stage.name, actions)
            })
            .collect();

        PipelineExecution {
            id: execution_id,
            trigger_id: event.id,
            pipeline: self.definition.name().to_string(),
            revision: event.revision.clone(),
            status: ExecutionStatus::Pending,
            stages,
            artifacts: Vec::new(),
            deploy: DeployOutcome::NotAttempted,
            error: None,
            started_at: crate::utils::iso_timestamp(),
            finished_at: None,
            duration_ms: None,
        }
    }

    async fn run_stage(
        &self,
        stage: &StageDefinition,
        record: &mut StageRecord,
        run: &mut StageRun<'_>,
    ) -> Result<(), PipelineError> {
        let timer = SpanTimer::start(stage.name.as_str());
        transition(&mut record.status, ExecutionStatus::Running, &stage.name)?;
        record.started_at = Some(crate::utils::iso_timestamp());
        self.emit(run.execution_id, TransitionScope::Stage, &stage.name, ExecutionStatus::Running, None, None);
        info!(execution_id = %run.execution_id, stage = %stage.name, "Stage started");

        let mut failure = None;
        for (action, action_record) in stage.actions.iter().zip(record.actions.iter_mut()) {
            transition(&mut action_record.status, ExecutionStatus::Running, action.name())?;
            action_record.started_at = Some(crate::utils::iso_timestamp());
            self.emit(run.execution_id, TransitionScope::Action, action.name(), ExecutionStatus::Running, None, None);

            let inputs = action
                .input_artifacts()
                .into_iter()
                .filter_map(|name| run.handoff.get(&name).cloned().map(|a| (name, a)))
                .collect();
            let ctx = ActionContext::new(run.execution_id, run.trigger.clone(), &stage.name, inputs);
            let action_timer = SpanTimer::start(action.name());
            let output = action.execute(&ctx).await;
            let action_ms = action_timer.finish();

            let error = Self::absorb(output, action_record, run);
            action_record.finished_at = Some(crate::utils::iso_timestamp());
            match error {
                None => {
                    transition(&mut action_record.status, ExecutionStatus::Succeeded, action.name())?;
                    self.emit(
                        run.execution_id,
                        TransitionScope::Action,
                        action.name(),
                        ExecutionStatus::Succeeded,
                        Some(action_ms),
                        None,
                    );
                }
                Some(e) => {
                    transition(&mut action_record.status, ExecutionStatus::Failed, action.name())?;
                    action_record.error = Some(e.to_report());
                    self.emit(
                        run.execution_id,
                        TransitionScope::Action,
                        action.name(),
                        ExecutionStatus::Failed,
                        Some(action_ms),
                        Some(e.to_string()),
                    );
                    failure = Some(e);
                    break;
                }
            }
        }

        let duration_ms = timer.finish();
        record.finished_at = Some(crate::utils::iso_timestamp());
        record.duration_ms = Some(duration_ms);
        match failure {
            None => {
                transition(&mut record.status, ExecutionStatus::Succeeded, &stage.name)?;
                self.emit(
                    run.execution_id,
                    TransitionScope::Stage,
                    &stage.name,
                    ExecutionStatus::Succeeded,
                    Some(duration_ms),
                    None,
                );
                info!(execution_id = %run.execution_id, stage = %stage.name, duration_ms, "Stage succeeded");
                Ok(())
            }
            Some(e) => {
                transition(&mut record.status, ExecutionStatus::Failed, &stage.name)?;
                self.emit(
                    run.execution_id,
                    TransitionScope::Stage,
                    &stage.name,
                    ExecutionStatus::Failed,
                    Some(duration_ms),
                    Some(e.to_string()),
                );
                warn!(execution_id = %run.execution_id, stage = %stage.name, error = %e, "Stage failed");
                Err(e)
            }
        }
    }

    /// Folds an action's output into the records; returns its failure, if any.
    fn absorb(output: ActionOutput, record: &mut ActionRecord, run: &mut StageRun<'_>) -> Option<PipelineError> {
        for artifact in output.artifacts {
            record.artifacts.push(artifact.id);
            run.handoff.insert(artifact.name.clone(), artifact.clone());
            run.artifacts.push(artifact);
        }
        if let Some(deploy) = output.deploy {
            run.deploy = deploy;
        }
        record.phases = output.phases;

        match (output.status, output.error) {
            (_, Some(e)) => Some(e),
            (ExecutionStatus::Succeeded, None) => None,
            (status, None) => Some(PipelineError::Internal(format!(
                "action '{}' finished with status {status} and no error",
                record.name
            ))),
        }
    }

    fn emit(
        &self,
        execution_id: Uuid,
        scope: TransitionScope,
        name: &str,
        status: ExecutionStatus,
        duration_ms: Option<f64>,
        error: Option<String>,
    ) {
        let mut event = TransitionEvent::new(execution_id, scope, name, status);
        if let Some(ms) = duration_ms {
            event = event.with_duration_ms(ms);
        }
        if let Some(error) = error {
            event = event.with_error(error);
        }
        self.events.emit(&event.into());
    }
}
