//! Test assertions for execution records.

use crate::core::ExecutionStatus;
use crate::errors::ErrorKind;
use crate::pipeline::PipelineExecution;

/// Asserts that the execution succeeded.
pub fn assert_execution_succeeded(execution: &PipelineExecution) {
    assert!(
        execution.is_success(),
        "Expected success, got status: {:?} (error: {:?})",
        execution.status,
        execution.error
    );
}

/// Asserts that the execution failed with the given error kind.
pub fn assert_execution_failed_with(execution: &PipelineExecution, kind: ErrorKind) {
    assert_eq!(
        execution.status,
        ExecutionStatus::Failed,
        "Expected failure, got status: {:?}",
        execution.status
    );
    let actual = execution.error.as_ref().map(|e| e.kind);
    assert_eq!(actual, Some(kind), "Expected error kind {kind:?}, got {actual:?}");
}

/// Asserts the status of a named stage.
pub fn assert_stage_status(execution: &PipelineExecution, stage: &str, expected: ExecutionStatus) {
    let actual = execution.stage_status(stage);
    assert_eq!(
        actual,
        Some(expected),
        "Expected stage '{stage}' to be {expected:?}, got {actual:?}"
    );
}

/// Asserts that the execution produced the named artifact.
pub fn assert_has_artifact(execution: &PipelineExecution, name: &str) {
    assert!(
        execution.artifact(name).is_some(),
        "Expected artifact '{}', got: {:?}",
        name,
        execution.artifacts.iter().map(|a| a.name.as_str()).collect::<Vec<_>>()
    );
}

/// Asserts that the execution did not attempt a deploy.
pub fn assert_not_deployed(execution: &PipelineExecution) {
    assert!(
        !execution.deploy.is_deployed(),
        "Expected no deploy, got: {:?}",
        execution.deploy
    );
}
