//! Testing utilities for deployflow pipelines.
//!
//! This module provides:
//! - Scripted runners, deployers, caches and repositories
//! - Sample sources, build specs and a wired test pipeline
//! - Assertions over execution records

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{
    assert_execution_failed_with, assert_execution_succeeded, assert_has_artifact,
    assert_not_deployed, assert_stage_status,
};
pub use fixtures::{
    sample_build_spec, sample_sources, sample_sources_with, seed_source, test_capability,
    test_environment, test_function, TestPipeline, TestPipelineBuilder, TEST_FUNCTION, TEST_IMAGE,
    TEST_PRINCIPAL,
};
pub use mocks::{
    FailingDeployer, RecordingDeployer, ScriptedRunner, UnavailableCache, UnreachableRepository,
};
