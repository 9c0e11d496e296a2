//! # Deployflow
//!
//! A build-and-deploy pipeline core: a commit is snapshotted, built in an
//! isolated environment, packaged and pushed to a live function.
//!
//! Deployflow provides:
//!
//! - **Source snapshots**: immutable, content-addressed artifacts per revision
//! - **Phased builds**: install, build and post_build phases of shell steps
//! - **Build caching**: environment state keyed by a deterministic fingerprint
//! - **Scoped deploys**: a capability that can update exactly one function
//! - **Concurrent executions**: a trigger queue with isolated workspaces
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use deployflow::prelude::*;
//!
//! let spec = BuildSpec::builder()
//!     .install(["echo ok"])
//!     .build_phase(["make"])
//!     .post_build(["deploy"])
//!     .build()?;
//! let executor = BuildExecutor::new(spec, environment, runner, store.clone(), Some(capability))?;
//! let controller = StandardPipeline::new("my-pipeline", repository, store, executor, cache).build()?;
//!
//! let result = controller.run(TriggerEvent::new(Revision::new("abc123")?)).await;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod build;
pub mod config;
pub mod core;
pub mod credentials;
pub mod deploy;
pub mod errors;
pub mod events;
pub mod observability;
pub mod pipeline;
pub mod source;
pub mod storage;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::build::{
        BuildEnvironment, BuildExecutor, BuildSpec, CommandRunner, LocalShellRunner,
        PodmanRunner, Step,
    };
    pub use crate::config::PipelineConfig;
    pub use crate::core::{
        Artifact, ExecutionStatus, FileBundle, PipelineEvent, Revision, TransitionEvent,
        TriggerEvent,
    };
    pub use crate::credentials::{CredentialScope, DeployCapability};
    pub use crate::deploy::{DeployOutcome, FunctionDeployer, FunctionIdentity};
    pub use crate::errors::{ErrorKind, PipelineError, PipelineValidationError};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::pipeline::{
        PipelineController, PipelineExecution, PipelineResult, QueueConfig, StandardPipeline,
        TriggerQueue,
    };
    pub use crate::source::{GitRepository, SourceRepository, SourceTrigger};
    pub use crate::storage::{ArtifactStore, BuildCache, FsArtifactStore, FsBuildCache};
    pub use crate::utils::{generate_uuid, iso_timestamp, Timestamp};
}
