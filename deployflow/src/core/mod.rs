//! Core domain model types for deployflow.
//!
//! This module contains the fundamental types used throughout the pipeline:
//! - Execution status shared by pipelines, stages, actions and phases
//! - Revisions and trigger events
//! - Artifacts and the file bundles they carry
//! - Transition events for observability

mod artifact;
mod bundle;
mod event;
mod revision;
mod status;

pub use artifact::{Artifact, ArtifactLocation};
pub use bundle::{normalize_relative_path, BundleFile, FileBundle};
pub use event::{CacheOperation, PipelineEvent, TransitionEvent, TransitionScope};
pub use revision::{Revision, TriggerEvent};
pub use status::ExecutionStatus;
