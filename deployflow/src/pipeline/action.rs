//! Pipeline actions: the units of work inside a stage.

use crate::build::{BuildExecutor, PhaseRecord};
use crate::core::{Artifact, ExecutionStatus, TriggerEvent};
use crate::deploy::DeployOutcome;
use crate::errors::PipelineError;
use crate::source::SourceTrigger;
use crate::storage::BuildCache;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use uuid::Uuid;

/// What an action sees when it runs.
#[derive(Debug, Clone)]
pub struct ActionContext {
    /// The execution the action belongs to.
    pub execution_id: Uuid,
    /// The triggering event.
    pub trigger: TriggerEvent,
    /// The stage the action runs in.
    pub stage_name: String,
    inputs: HashMap<String, Artifact>,
}

impl ActionContext {
    /// Creates a context with the given input artifacts.
    #[must_use]
    pub fn new(
        execution_id: Uuid,
        trigger: TriggerEvent,
        stage_name: impl Into<String>,
        inputs: HashMap<String, Artifact>,
    ) -> Self {
        Self {
            execution_id,
            trigger,
            stage_name: stage_name.into(),
            inputs,
        }
    }

    /// Returns the input artifact named `name`.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Internal` if the artifact was not handed over.
    pub fn input(&self, name: &str) -> Result<&Artifact, PipelineError> {
        self.inputs.get(name).ok_or_else(|| {
            PipelineError::Internal(format!(
                "input artifact '{name}' missing for stage '{}'",
                self.stage_name
            ))
        })
    }
}

/// The result of running an action.
#[derive(Debug)]
pub struct ActionOutput {
    /// Succeeded or Failed.
    pub status: ExecutionStatus,
    /// Artifacts produced, including on failure.
    pub artifacts: Vec<Artifact>,
    /// Deploy outcome, for actions that deploy.
    pub deploy: Option<DeployOutcome>,
    /// Build phase records, for build actions.
    pub phases: Vec<PhaseRecord>,
    /// The failure, if any.
    pub error: Option<PipelineError>,
}

impl ActionOutput {
    /// Creates a successful output.
    #[must_use]
    pub fn succeeded() -> Self {
        Self {
            status: ExecutionStatus::Succeeded,
            artifacts: Vec::new(),
            deploy: None,
            phases: Vec::new(),
            error: None,
        }
    }

    /// Creates a failed output.
    #[must_use]
    pub fn failed(error: PipelineError) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            error: Some(error),
            ..Self::succeeded()
        }
    }

    /// Adds a produced artifact.
    #[must_use]
    pub fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.artifacts.push(artifact);
        self
    }

    /// Records the deploy outcome.
    #[must_use]
    pub fn with_deploy(mut self, deploy: DeployOutcome) -> Self {
        self.deploy = Some(deploy);
        self
    }

    /// Records build phases.
    #[must_use]
    pub fn with_phases(mut self, phases: Vec<PhaseRecord>) -> Self {
        self.phases = phases;
        self
    }

    /// Returns true if the action succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// A unit of work within a stage.
#[async_trait]
pub trait Action: Send + Sync + Debug {
    /// Returns the action name, unique within the pipeline.
    fn name(&self) -> &str;

    /// Names of artifacts the action consumes.
    fn input_artifacts(&self) -> Vec<String> {
        Vec::new()
    }

    /// Names of artifacts the action produces.
    fn output_artifacts(&self) -> Vec<String> {
        Vec::new()
    }

    /// Runs the action.
    async fn execute(&self, ctx: &ActionContext) -> ActionOutput;
}

/// Snapshots the triggering revision.
#[derive(Debug, Clone)]
pub struct SourceAction {
    name: String,
    trigger: SourceTrigger,
}

impl SourceAction {
    /// Creates a source action.
    #[must_use]
    pub fn new(name: impl Into<String>, trigger: SourceTrigger) -> Self {
        Self {
            name: name.into(),
            trigger,
        }
    }
}

#[async_trait]
impl Action for SourceAction {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_artifacts(&self) -> Vec<String> {
        vec![self.trigger.output_name().to_string()]
    }

    async fn execute(&self, ctx: &ActionContext) -> ActionOutput {
        match self.trigger.on_commit(&ctx.trigger.revision).await {
            Ok(artifact) => ActionOutput::succeeded().with_artifact(artifact),
            Err(e) => ActionOutput::failed(e),
        }
    }
}

/// Builds (and possibly deploys) an input artifact.
#[derive(Debug, Clone)]
pub struct BuildAction {
    name: String,
    input: String,
    executor: Arc<BuildExecutor>,
    cache: Arc<dyn BuildCache>,
}

impl BuildAction {
    /// Creates a build action consuming `input`.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        input: impl Into<String>,
        executor: Arc<BuildExecutor>,
        cache: Arc<dyn BuildCache>,
    ) -> Self {
        Self {
            name: name.into(),
            input: input.into(),
            executor,
            cache,
        }
    }
}

#[async_trait]
impl Action for BuildAction {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_artifacts(&self) -> Vec<String> {
        vec![self.input.clone()]
    }

    fn output_artifacts(&self) -> Vec<String> {
        vec![self.executor.output_name().to_string()]
    }

    async fn execute(&self, ctx: &ActionContext) -> ActionOutput {
        let source = match ctx.input(&self.input) {
            Ok(artifact) => artifact,
            Err(e) => return ActionOutput::failed(e),
        };

        match self
            .executor
            .execute_for(ctx.execution_id, source, self.cache.as_ref())
            .await
        {
            Ok(output) => ActionOutput::succeeded()
                .with_artifact(output.artifact)
                .with_deploy(output.deploy)
                .with_phases(output.phases),
            Err(failure) => {
                let mut out = ActionOutput::failed(failure.error)
                    .with_deploy(failure.deploy)
                    .with_phases(failure.phases);
                if let Some(artifact) = failure.artifact {
                    out = out.with_artifact(artifact);
                }
                out
            }
        }
    }
}
