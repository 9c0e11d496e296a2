//! The build executor: runs a build spec against a source artifact.

use super::runner::{CommandOutcome, CommandRunner, CommandSession};
use super::spec::{BuildEnvironment, BuildPhase, BuildSpec, PhaseName, Step, DEPLOY_COMMAND};
use super::workspace::BuildWorkspace;
use crate::core::{
    Artifact, CacheOperation, ExecutionStatus, FileBundle, PipelineEvent, TransitionEvent,
    TransitionScope,
};
use crate::credentials::DeployCapability;
use crate::deploy::DeployOutcome;
use crate::errors::{PipelineError, PipelineValidationError};
use crate::events::{EventSink, NoOpEventSink};
use crate::observability::SpanTimer;
use crate::storage::{load_bundle, store_bundle, ArtifactStore, BuildCache, CacheFingerprint, FingerprintInput};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Default name of the artifact produced by the build stage.
pub const BUILD_OUTPUT: &str = "BuildOutput";

/// How a phase used the build cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheUse {
    /// The spec declares no cache paths.
    Disabled,
    /// A matching entry was restored.
    Hit,
    /// No entry for the fingerprint.
    Miss,
    /// The cache could not be used; the phase ran without it.
    Unavailable,
}

/// One executed command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRecord {
    /// The command text.
    pub command: String,
    /// Exit code, or 0 for the deploy step when it succeeded.
    pub exit_code: i32,
    /// Duration in milliseconds.
    pub duration_ms: f64,
    /// True if the command hit its timeout.
    #[serde(default)]
    pub timed_out: bool,
}

impl CommandRecord {
    fn from_outcome(command: &str, outcome: &CommandOutcome) -> Self {
        Self {
            command: command.to_string(),
            exit_code: outcome.exit_code,
            duration_ms: outcome.duration_ms,
            timed_out: outcome.timed_out,
        }
    }
}

/// What happened in one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    /// The phase.
    pub name: PhaseName,
    /// Final status of the phase.
    pub status: ExecutionStatus,
    /// Cache read result at phase start.
    pub cache: CacheUse,
    /// True if the cache entry was written at phase end.
    #[serde(default)]
    pub cache_saved: bool,
    /// Commands that ran, in order.
    pub commands: Vec<CommandRecord>,
    /// Duration in milliseconds.
    pub duration_ms: f64,
}

impl PhaseRecord {
    fn new(name: PhaseName) -> Self {
        Self {
            name,
            status: ExecutionStatus::Running,
            cache: CacheUse::Disabled,
            cache_saved: false,
            commands: Vec::new(),
            duration_ms: 0.0,
        }
    }
}

/// A successful build.
#[derive(Debug, Clone)]
pub struct BuildOutput {
    /// The packaged build output.
    pub artifact: Artifact,
    /// What happened at the deploy step.
    pub deploy: DeployOutcome,
    /// Per-phase records.
    pub phases: Vec<PhaseRecord>,
}

/// A failed build, with whatever was produced before the failure.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct BuildFailure {
    /// Why the build failed.
    #[source]
    pub error: PipelineError,
    /// The packaged output, if the build got as far as the deploy step.
    pub artifact: Option<Artifact>,
    /// What happened at the deploy step.
    pub deploy: DeployOutcome,
    /// Per-phase records up to and including the failed phase.
    pub phases: Vec<PhaseRecord>,
}

impl BuildFailure {
    fn new(error: PipelineError) -> Self {
        Self {
            error,
            artifact: None,
            deploy: DeployOutcome::NotAttempted,
            phases: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct BuildState {
    phases: Vec<PhaseRecord>,
    artifact: Option<Artifact>,
    deploy: DeployOutcome,
}

impl BuildState {
    fn into_failure(self, error: PipelineError) -> BuildFailure {
        BuildFailure {
            error,
            artifact: self.artifact,
            deploy: self.deploy,
            phases: self.phases,
        }
    }
}

struct RunContext<'a> {
    execution_id: Uuid,
    source: &'a Artifact,
    sources: &'a FileBundle,
    cache: &'a dyn BuildCache,
    workspace: &'a BuildWorkspace,
    environment: &'a BuildEnvironment,
}

/// Runs the phases of a build spec in a fresh workspace.
///
/// The deploy step, if present, goes through the [`DeployCapability`] the
/// executor was constructed with; no other path to the deploy API exists.
#[derive(Clone)]
pub struct BuildExecutor {
    spec: Arc<BuildSpec>,
    environment: BuildEnvironment,
    runner: Arc<dyn CommandRunner>,
    store: Arc<dyn ArtifactStore>,
    capability: Option<DeployCapability>,
    events: Arc<dyn EventSink>,
    output_name: String,
    stage_name: String,
}

impl fmt::Debug for BuildExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildExecutor")
            .field("image", &self.environment.image)
            .field("phases", &self.spec.phases().len())
            .field("runner", &self.runner)
            .field("has_capability", &self.capability.is_some())
            .field("output_name", &self.output_name)
            .finish_non_exhaustive()
    }
}

impl BuildExecutor {
    /// Creates an executor.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the image is not pinned, or if the spec
    /// has a deploy step but no capability is given.
    pub fn new(
        spec: BuildSpec,
        environment: BuildEnvironment,
        runner: Arc<dyn CommandRunner>,
        store: Arc<dyn ArtifactStore>,
        capability: Option<DeployCapability>,
    ) -> Result<Self, PipelineError> {
        environment.validate()?;
        if spec.has_deploy_step() && capability.is_none() {
            return Err(PipelineValidationError::new(
                "build spec contains a deploy step but no deploy capability was granted",
            )
            .with_fix_hint("Grant a credential scope for the target function")
            .into());
        }

        Ok(Self {
            spec: Arc::new(spec),
            environment,
            runner,
            store,
            capability,
            events: Arc::new(NoOpEventSink),
            output_name: BUILD_OUTPUT.to_string(),
            stage_name: "Build".to_string(),
        })
    }

    /// Sets the sink for phase, cache and deploy events.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Sets the name of the produced artifact.
    #[must_use]
    pub fn with_output_name(mut self, name: impl Into<String>) -> Self {
        self.output_name = name.into();
        self
    }

    /// Sets the stage recorded as the artifact producer.
    #[must_use]
    pub fn with_stage_name(mut self, name: impl Into<String>) -> Self {
        self.stage_name = name.into();
        self
    }

    /// Returns the build spec.
    #[must_use]
    pub fn spec(&self) -> &BuildSpec {
        &self.spec
    }

    /// Returns the name of the produced artifact.
    #[must_use]
    pub fn output_name(&self) -> &str {
        &self.output_name
    }

    /// Runs the build for `source`.
    ///
    /// # Errors
    ///
    /// Returns a [`BuildFailure`] carrying the first fatal error.
    pub async fn execute(
        &self,
        source: &Artifact,
        cache: &dyn BuildCache,
    ) -> Result<BuildOutput, BuildFailure> {
        self.execute_for(crate::utils::generate_uuid(), source, cache)
            .await
    }

    /// Runs the build for `source`, attributing events to `execution_id`.
    ///
    /// # Errors
    ///
    /// Returns a [`BuildFailure`] carrying the first fatal error.
    pub async fn execute_for(
        &self,
        execution_id: Uuid,
        source: &Artifact,
        cache: &dyn BuildCache,
    ) -> Result<BuildOutput, BuildFailure> {
        let bundle = load_bundle(self.store.as_ref(), &source.location)
            .await
            .map_err(|e| BuildFailure::new(e.into()))?;
        let workspace = BuildWorkspace::materialize(&bundle)
            .await
            .map_err(BuildFailure::new)?;
        let environment = self.environment.layered(self.spec.variables());
        let mut session = self
            .runner
            .open(&environment, workspace.path())
            .await
            .map_err(BuildFailure::new)?;

        info!(
            execution_id = %execution_id,
            revision = %source.revision,
            image = %environment.image,
            "Build started"
        );

        let ctx = RunContext {
            execution_id,
            source,
            sources: &bundle,
            cache,
            workspace: &workspace,
            environment: &environment,
        };
        let mut state = BuildState::default();
        let mut result = self.run_phases(&ctx, session.as_mut(), &mut state).await;

        if let Err(e) = session.close().await {
            warn!(execution_id = %execution_id, error = %e, "Failed to close build session");
        }

        if result.is_ok() && state.artifact.is_none() {
            match self.package(&workspace, source).await {
                Ok(artifact) => state.artifact = Some(artifact),
                Err(e) => result = Err(e),
            }
        }

        match (result, state.artifact.take()) {
            (Ok(()), Some(artifact)) => {
                info!(
                    execution_id = %execution_id,
                    artifact = %artifact.location,
                    deployed = state.deploy.is_deployed(),
                    "Build succeeded"
                );
                Ok(BuildOutput {
                    artifact,
                    deploy: state.deploy,
                    phases: state.phases,
                })
            }
            (Ok(()), None) => Err(state.into_failure(PipelineError::Internal(
                "build finished without an artifact".to_string(),
            ))),
            (Err(error), artifact) => {
                error!(execution_id = %execution_id, error = %error, "Build failed");
                state.artifact = artifact;
                Err(state.into_failure(error))
            }
        }
    }

    async fn run_phases(
        &self,
        ctx: &RunContext<'_>,
        session: &mut dyn CommandSession,
        state: &mut BuildState,
    ) -> Result<(), PipelineError> {
        for phase in self.spec.phases() {
            let timer = SpanTimer::start(phase.name.as_str());
            self.emit_phase(ctx.execution_id, phase.name, ExecutionStatus::Running, None, None);

            let fingerprint = self.fingerprint(phase, ctx);
            let mut record = PhaseRecord::new(phase.name);
            record.cache = self.restore_cache(ctx, phase.name, &fingerprint).await;

            let outcome = self.run_steps(ctx, phase, session, state, &mut record).await;
            record.duration_ms = timer.finish();

            match outcome {
                Ok(()) => {
                    if record.cache != CacheUse::Disabled {
                        record.cache_saved = self.save_cache(ctx, phase.name, &fingerprint).await;
                    }
                    record.status = ExecutionStatus::Succeeded;
                    self.emit_phase(
                        ctx.execution_id,
                        phase.name,
                        ExecutionStatus::Succeeded,
                        Some(record.duration_ms),
                        None,
                    );
                    state.phases.push(record);
                }
                Err(e) => {
                    record.status = ExecutionStatus::Failed;
                    self.emit_phase(
                        ctx.execution_id,
                        phase.name,
                        ExecutionStatus::Failed,
                        Some(record.duration_ms),
                        Some(e.to_string()),
                    );
                    state.phases.push(record);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn run_steps(
        &self,
        ctx: &RunContext<'_>,
        phase: &BuildPhase,
        session: &mut dyn CommandSession,
        state: &mut BuildState,
        record: &mut PhaseRecord,
    ) -> Result<(), PipelineError> {
        for step in &phase.steps {
            match step {
                Step::Shell(command) => {
                    debug!(phase = %phase.name, command = %command, "Running command");
                    let outcome = session.run(command).await?;
                    record.commands.push(CommandRecord::from_outcome(command, &outcome));
                    if !outcome.success() {
                        warn!(
                            phase = %phase.name,
                            command = %command,
                            exit_code = outcome.exit_code,
                            timed_out = outcome.timed_out,
                            stderr = %tail(&outcome.stderr),
                            "Command failed"
                        );
                        return Err(PipelineError::phase_command_failed(
                            phase.name.as_str(),
                            command.as_str(),
                            outcome.exit_code,
                        ));
                    }
                }
                Step::Deploy => {
                    let timer = SpanTimer::start(DEPLOY_COMMAND);
                    let artifact = self.package(ctx.workspace, ctx.source).await?;
                    state.artifact = Some(artifact.clone());
                    let deployed = self.deploy(ctx.execution_id, &artifact, state).await;
                    record.commands.push(CommandRecord {
                        command: DEPLOY_COMMAND.to_string(),
                        exit_code: i32::from(deployed.is_err()),
                        duration_ms: timer.finish(),
                        timed_out: false,
                    });
                    deployed?;
                }
            }
        }
        Ok(())
    }

    async fn package(
        &self,
        workspace: &BuildWorkspace,
        source: &Artifact,
    ) -> Result<Artifact, PipelineError> {
        let output = workspace.collect_output(self.spec.artifacts()).await?;
        let (location, digest) = store_bundle(self.store.as_ref(), &output).await?;
        debug!(artifact = %location, files = output.len(), "Packaged build output");

        Ok(Artifact::new(
            self.output_name.as_str(),
            self.stage_name.as_str(),
            location,
            digest,
            source.revision.clone(),
        )
        .with_size(output.len(), output.total_bytes())
        .with_metadata("source_digest", json!(source.digest)))
    }

    async fn deploy(
        &self,
        execution_id: Uuid,
        artifact: &Artifact,
        state: &mut BuildState,
    ) -> Result<(), PipelineError> {
        let Some(capability) = &self.capability else {
            return Err(PipelineError::Internal(
                "deploy step reached without a deploy capability".to_string(),
            ));
        };
        if !matches!(state.deploy, DeployOutcome::NotAttempted) {
            return Err(PipelineError::Internal(
                "deploy already attempted for this build".to_string(),
            ));
        }

        match capability.update_function_code(artifact).await {
            Ok(ack) => {
                info!(
                    execution_id = %execution_id,
                    function = %capability.function(),
                    version = %ack.version,
                    "Function code updated"
                );
                self.events.emit(&PipelineEvent::Deployed {
                    execution_id,
                    function: ack.function.clone(),
                    version: ack.version.clone(),
                    artifact: artifact.location.key().to_string(),
                });
                state.deploy = DeployOutcome::Deployed { ack };
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                error!(
                    execution_id = %execution_id,
                    function = %capability.function(),
                    error = %reason,
                    "Deploy call failed"
                );
                self.events.emit(&PipelineEvent::DeployFailed {
                    execution_id,
                    function: capability.function().name.clone(),
                    error: reason.clone(),
                });
                state.deploy = DeployOutcome::Failed {
                    reason: reason.clone(),
                };
                Err(PipelineError::deploy_call_failed(reason))
            }
        }
    }

    /// Cache paths that overlap the sources tie the entry to the exact
    /// source content, so another commit never restores them.
    fn fingerprint(&self, phase: &BuildPhase, ctx: &RunContext<'_>) -> CacheFingerprint {
        let overlaps_sources = self
            .spec
            .cache_paths()
            .iter()
            .any(|path| ctx.sources.has_files_under(path));
        CacheFingerprint::compute(&FingerprintInput {
            image: &ctx.environment.image,
            variables: &ctx.environment.variables,
            phase: phase.name.as_str(),
            commands: phase.command_texts(),
            cache_paths: self.spec.cache_paths(),
            source_digest: overlaps_sources.then_some(ctx.source.digest.as_str()),
        })
    }

    async fn restore_cache(
        &self,
        ctx: &RunContext<'_>,
        phase: PhaseName,
        fingerprint: &CacheFingerprint,
    ) -> CacheUse {
        if self.spec.cache_paths().is_empty() {
            return CacheUse::Disabled;
        }

        let reason = match ctx.cache.get(fingerprint.as_str()).await {
            Ok(None) => return CacheUse::Miss,
            Ok(Some(bytes)) => match FileBundle::decode(&bytes) {
                Ok(mut bundle) => {
                    // Checked-out sources always win over cached copies.
                    bundle.retain(|path| !ctx.sources.contains(path));
                    match ctx.workspace.restore(&bundle).await {
                        Ok(()) => {
                            debug!(phase = %phase, files = bundle.len(), "Cache restored");
                            return CacheUse::Hit;
                        }
                        Err(e) => e.to_string(),
                    }
                }
                Err(e) => format!("corrupt cache entry: {e}"),
            },
            Err(e) => e.to_string(),
        };

        self.cache_degraded(ctx.execution_id, phase, CacheOperation::Read, &reason);
        CacheUse::Unavailable
    }

    async fn save_cache(
        &self,
        ctx: &RunContext<'_>,
        phase: PhaseName,
        fingerprint: &CacheFingerprint,
    ) -> bool {
        let bundle = match ctx.workspace.capture(self.spec.cache_paths()).await {
            Ok(bundle) => bundle,
            Err(e) => {
                self.cache_degraded(ctx.execution_id, phase, CacheOperation::Write, &e.to_string());
                return false;
            }
        };
        if bundle.is_empty() {
            return false;
        }

        match ctx.cache.put(fingerprint.as_str(), bundle.encode()).await {
            Ok(()) => true,
            Err(e) => {
                self.cache_degraded(ctx.execution_id, phase, CacheOperation::Write, &e.to_string());
                false
            }
        }
    }

    fn cache_degraded(
        &self,
        execution_id: Uuid,
        phase: PhaseName,
        operation: CacheOperation,
        reason: &str,
    ) {
        warn!(
            execution_id = %execution_id,
            phase = %phase,
            operation = %operation,
            reason,
            "Build cache unavailable, continuing without it"
        );
        self.events.emit(&PipelineEvent::CacheUnavailable {
            execution_id,
            phase: phase.as_str().to_string(),
            operation,
            reason: reason.to_string(),
        });
    }

    fn emit_phase(
        &self,
        execution_id: Uuid,
        phase: PhaseName,
        status: ExecutionStatus,
        duration_ms: Option<f64>,
        error: Option<String>,
    ) {
        let mut event = TransitionEvent::new(execution_id, TransitionScope::Phase, phase.as_str(), status);
        if let Some(ms) = duration_ms {
            event = event.with_duration_ms(ms);
        }
        if let Some(error) = error {
            event = event.with_error(error);
        }
        self.events.emit(&event.into());
    }
}

fn tail(text: &str) -> &str {
    const MAX: usize = 512;
    if text.len() <= MAX {
        return text.trim_end();
    }
    let mut start = text.len() - MAX;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].trim_end()
}

#[cfg(test)]
#[path = "executor_tests.rs"]
mod tests;
