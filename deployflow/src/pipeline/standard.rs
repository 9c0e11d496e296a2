//! The standard two-stage pipeline: Source, then Build (with deploy).

use super::action::{Action, BuildAction, SourceAction};
use super::controller::PipelineController;
use super::definition::PipelineBuilder;
use super::execution::ExecutionStore;
use crate::build::BuildExecutor;
use crate::errors::PipelineError;
use crate::events::{EventSink, NoOpEventSink};
use crate::source::{SourceRepository, SourceTrigger};
use crate::storage::{ArtifactStore, BuildCache};
use std::sync::Arc;

/// Name of the source stage.
pub const SOURCE_STAGE: &str = "Source";

/// Name of the build stage.
pub const BUILD_STAGE: &str = "Build";

/// Wires a repository, artifact store, build executor and cache into a
/// Source → Build pipeline.
#[derive(Clone)]
pub struct StandardPipeline {
    name: String,
    repository: Arc<dyn SourceRepository>,
    store: Arc<dyn ArtifactStore>,
    executor: BuildExecutor,
    cache: Arc<dyn BuildCache>,
    events: Arc<dyn EventSink>,
    executions: Option<Arc<dyn ExecutionStore>>,
}

impl std::fmt::Debug for StandardPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StandardPipeline")
            .field("name", &self.name)
            .field("repository", &self.repository.name())
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}

impl StandardPipeline {
    /// Starts wiring a pipeline.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        repository: Arc<dyn SourceRepository>,
        store: Arc<dyn ArtifactStore>,
        executor: BuildExecutor,
        cache: Arc<dyn BuildCache>,
    ) -> Self {
        Self {
            name: name.into(),
            repository,
            store,
            executor,
            cache,
            events: Arc::new(NoOpEventSink),
            executions: None,
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
        self.executions = Some(executions);
        self
    }

    /// Builds the controller.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the stages do not hand over artifacts correctly.
    pub fn build(self) -> Result<PipelineController, PipelineError> {
        let trigger = SourceTrigger::new(self.repository, self.store).with_stage_name(SOURCE_STAGE);
        let source_output = trigger.output_name().to_string();
        let source: Arc<dyn Action> = Arc::new(SourceAction::new("Checkout", trigger));

        let executor = self.executor.with_stage_name(BUILD_STAGE);
        let build: Arc<dyn Action> = Arc::new(BuildAction::new(
            "BuildAndDeploy",
            source_output,
            Arc::new(executor),
            self.cache,
        ));

        let definition = PipelineBuilder::new(self.name)
            .stage(SOURCE_STAGE, vec![source])?
            .stage(BUILD_STAGE, vec![build])?
            .build()?;

        let mut controller = PipelineController::new(definition).with_event_sink(self.events);
        if let Some(executions) = self.executions {
            controller = controller.with_execution_store(executions);
        }
        Ok(controller)
    }
}
