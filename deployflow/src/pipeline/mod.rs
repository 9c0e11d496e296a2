//! Pipeline definition and execution.
//!
//! This module provides:
//! - Actions and stages, assembled by a validating builder
//! - The controller that drives one execution through its stages
//! - Execution records and their store
//! - The trigger queue that runs executions concurrently

mod action;
mod controller;
mod definition;
mod execution;
mod queue;
mod standard;

#[cfg(test)]
mod integration_tests;

pub use action::{Action, ActionContext, ActionOutput, BuildAction, SourceAction};
pub use controller::PipelineController;
pub use definition::{PipelineBuilder, PipelineDefinition, StageDefinition};
pub use execution::{
    ActionRecord, ExecutionStore, InMemoryExecutionStore, PipelineExecution, PipelineResult,
    StageRecord,
};
pub use queue::{
    ExecutionTicket, QueueConfig, TriggerQueue, TriggerSender, DEFAULT_MAX_CONCURRENT_EXECUTIONS,
    DEFAULT_QUEUE_CAPACITY,
};
pub use standard::{StandardPipeline, BUILD_STAGE, SOURCE_STAGE};
