//! Build stage: phase documents, workspaces, command runners and the executor.
//!
//! - [`BuildSpec`]: validated install/build/post_build phases of tagged [`Step`]s
//! - [`CommandRunner`]: where commands run ([`LocalShellRunner`], [`PodmanRunner`])
//! - [`BuildExecutor`]: runs the phases, uses the cache, packages output and deploys

mod executor;
mod podman;
mod runner;
mod spec;
mod workspace;

pub use executor::{
    BuildExecutor, BuildFailure, BuildOutput, CacheUse, CommandRecord, PhaseRecord, BUILD_OUTPUT,
};
pub use podman::{PodmanRunner, CONTAINER_WORKDIR};
pub use runner::{
    CommandOutcome, CommandRunner, CommandSession, LocalShellRunner, SPAWN_FAILURE_EXIT_CODE,
    TIMEOUT_EXIT_CODE,
};
pub use spec::{
    is_pinned_image, ArtifactsSpec, BuildEnvironment, BuildPhase, BuildSpec, BuildSpecBuilder,
    PhaseName, Step, BUILD_SPEC_VERSION, DEPLOY_COMMAND,
};
pub use workspace::BuildWorkspace;
