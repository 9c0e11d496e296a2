//! Test fixtures: sample sources, specs, capabilities and a wired pipeline.

use std::sync::Arc;

use super::mocks::{RecordingDeployer, ScriptedRunner};
use crate::build::{BuildEnvironment, BuildExecutor, BuildSpec, CommandRunner};
use crate::core::{Artifact, FileBundle, Revision};
use crate::credentials::{CredentialScope, DeployCapability};
use crate::deploy::{FunctionDeployer, FunctionIdentity};
use crate::errors::DeployError;
use crate::events::{CollectingEventSink, EventSink};
use crate::pipeline::{InMemoryExecutionStore, PipelineController, StandardPipeline};
use crate::source::{InMemoryRepository, SourceRepository, SOURCE_OUTPUT};
use crate::storage::{store_bundle, ArtifactStore, BuildCache, InMemoryArtifactStore, InMemoryBuildCache};

/// A pinned image used throughout tests.
pub const TEST_IMAGE: &str = "public.ecr.aws/codebuild/amazonlinux2-x86_64-standard:3.0";

/// The target function used throughout tests.
pub const TEST_FUNCTION: &str = "s3Read";

/// The principal the test credential scope is granted to.
pub const TEST_PRINCIPAL: &str = "build-role";

/// A small C++ project.
#[must_use]
pub fn sample_sources() -> FileBundle {
    sample_sources_with("hello")
}

/// A small C++ project whose `main.cpp` prints `message`.
#[must_use]
pub fn sample_sources_with(message: &str) -> FileBundle {
    let mut bundle = FileBundle::new();
    let files: [(&str, String); 2] = [
        (
            "CMakeLists.txt",
            "cmake_minimum_required(VERSION 3.5)\nproject(s3Read LANGUAGES CXX)\n".to_string(),
        ),
        (
            "src/main.cpp",
            format!("#include <cstdio>\nint main() {{ std::puts(\"{message}\"); }}\n"),
        ),
    ];
    for (path, content) in files {
        // Paths are constants known to be valid.
        let _ = bundle.insert(path, content.into_bytes());
    }
    bundle
}

/// install/build/post_build echo phases ending in a deploy step.
///
/// # Errors
///
/// Never fails for the fixed commands; the Result mirrors the builder.
pub fn sample_build_spec() -> Result<BuildSpec, crate::errors::BuildSpecError> {
    BuildSpec::builder()
        .install(["echo ok"])
        .build_phase(["echo build"])
        .post_build(["deploy"])
        .build()
}

/// A pinned build environment.
#[must_use]
pub fn test_environment() -> BuildEnvironment {
    BuildEnvironment::new(TEST_IMAGE)
}

/// The identity of [`TEST_FUNCTION`].
///
/// # Errors
///
/// Never fails for the fixed name.
pub fn test_function() -> Result<FunctionIdentity, DeployError> {
    FunctionIdentity::new(TEST_FUNCTION)
}

/// A least-privilege capability for [`TEST_FUNCTION`] backed by `deployer`.
///
/// # Errors
///
/// Never fails for the fixed scope.
pub fn test_capability(
    deployer: Arc<dyn FunctionDeployer>,
) -> Result<DeployCapability, crate::errors::PipelineError> {
    let function = test_function()?;
    let scope = CredentialScope::for_function_update(TEST_PRINCIPAL, &function);
    Ok(DeployCapability::new(scope, function, deployer)?)
}

/// Stores `bundle` as the source artifact for `revision`.
///
/// # Errors
///
/// Returns the store or revision error.
pub async fn seed_source(
    store: &dyn ArtifactStore,
    revision: &str,
    bundle: &FileBundle,
) -> Result<Artifact, crate::errors::PipelineError> {
    let revision = Revision::new(revision)?;
    let (location, digest) = store_bundle(store, bundle).await?;
    Ok(
        Artifact::new(SOURCE_OUTPUT, "Source", location, digest, revision)
            .with_size(bundle.len(), bundle.total_bytes()),
    )
}

/// A fully wired in-memory pipeline.
///
/// Collaborators are exposed so tests can seed commits and inspect calls.
#[derive(Debug, Clone)]
pub struct TestPipeline {
    /// The source repository.
    pub repository: Arc<InMemoryRepository>,
    /// The artifact store.
    pub store: Arc<InMemoryArtifactStore>,
    /// The deployer behind the capability.
    pub deployer: Arc<RecordingDeployer>,
    /// Collected events.
    pub events: Arc<CollectingEventSink>,
    /// Persisted execution records.
    pub executions: Arc<InMemoryExecutionStore>,
    /// The controller.
    pub controller: Arc<PipelineController>,
}

/// Assembles a [`TestPipeline`].
#[derive(Debug)]
pub struct TestPipelineBuilder {
    spec: Option<BuildSpec>,
    runner: Arc<dyn CommandRunner>,
    cache: Arc<dyn BuildCache>,
    deployer: Arc<dyn FunctionDeployer>,
    recording: Arc<RecordingDeployer>,
    repository: Option<Arc<dyn SourceRepository>>,
}

impl Default for TestPipelineBuilder {
    fn default() -> Self {
        let recording = Arc::new(RecordingDeployer::new());
        Self {
            spec: None,
            runner: Arc::new(ScriptedRunner::new()),
            cache: Arc::new(InMemoryBuildCache::new()),
            deployer: recording.clone(),
            recording,
            repository: None,
        }
    }
}

impl TestPipelineBuilder {
    /// Uses a specific build spec instead of [`sample_build_spec`].
    #[must_use]
    pub fn spec(mut self, spec: BuildSpec) -> Self {
        self.spec = Some(spec);
        self
    }

    /// Uses a specific command runner.
    #[must_use]
    pub fn runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    /// Uses a specific build cache.
    #[must_use]
    pub fn cache(mut self, cache: Arc<dyn BuildCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Uses a specific deployer instead of the recording one.
    #[must_use]
    pub fn deployer(mut self, deployer: Arc<dyn FunctionDeployer>) -> Self {
        self.deployer = deployer;
        self
    }

    /// Reads sources from `repository` instead of the in-memory one.
    #[must_use]
    pub fn repository(mut self, repository: Arc<dyn SourceRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Wires the pipeline.
    ///
    /// # Errors
    ///
    /// Returns the first wiring error.
    pub fn build(self) -> Result<TestPipeline, crate::errors::PipelineError> {
        let memory_repository = Arc::new(InMemoryRepository::new("CppOnLambdaRepo"));
        let repository: Arc<dyn SourceRepository> = match self.repository {
            Some(repository) => repository,
            None => memory_repository.clone(),
        };
        let store = Arc::new(InMemoryArtifactStore::new());
        let events = Arc::new(CollectingEventSink::new());
        let executions = Arc::new(InMemoryExecutionStore::new());
        let spec = match self.spec {
            Some(spec) => spec,
            None => sample_build_spec()?,
        };

        let capability = if spec.has_deploy_step() {
            Some(test_capability(self.deployer)?)
        } else {
            None
        };
        let event_sink: Arc<dyn EventSink> = events.clone();
        let executor = BuildExecutor::new(spec, test_environment(), self.runner, store.clone(), capability)?
            .with_event_sink(event_sink.clone());

        let controller = StandardPipeline::new("CppOnLambda", repository, store.clone(), executor, self.cache)
            .with_event_sink(event_sink)
            .with_execution_store(executions.clone())
            .build()?;

        Ok(TestPipeline {
            repository: memory_repository,
            store,
            deployer: self.recording,
            events,
            executions,
            controller: Arc::new(controller),
        })
    }
}

impl TestPipeline {
    /// Returns a builder with scripted commands, an in-memory cache and a recording deployer.
    #[must_use]
    pub fn builder() -> TestPipelineBuilder {
        TestPipelineBuilder::default()
    }

    /// Commits `bundle` at `revision` to the in-memory repository.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid revision.
    pub fn commit(&self, revision: &str, bundle: FileBundle) -> Result<Revision, crate::errors::SourceError> {
        let revision = Revision::new(revision)?;
        self.repository.commit(revision.clone(), bundle);
        Ok(revision)
    }
}
