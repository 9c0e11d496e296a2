use super::*;
use crate::build::{LocalShellRunner, TIMEOUT_EXIT_CODE};
use crate::events::CollectingEventSink;
use crate::storage::{InMemoryArtifactStore, InMemoryBuildCache};
use crate::testing::{
    sample_build_spec, sample_sources, sample_sources_with, seed_source, test_capability,
    test_environment, FailingDeployer, RecordingDeployer, ScriptedRunner, UnavailableCache,
};
use pretty_assertions::assert_eq;
use std::time::Duration;

struct Harness {
    store: Arc<InMemoryArtifactStore>,
    deployer: Arc<RecordingDeployer>,
    events: Arc<CollectingEventSink>,
}

impl Harness {
    fn new() -> Self {
        Self {
            store: Arc::new(InMemoryArtifactStore::new()),
            deployer: Arc::new(RecordingDeployer::new()),
            events: Arc::new(CollectingEventSink::new()),
        }
    }

    fn executor(&self, spec: BuildSpec, runner: Arc<dyn CommandRunner>) -> BuildExecutor {
        let capability = spec
            .has_deploy_step()
            .then(|| test_capability(self.deployer.clone()).unwrap());
        BuildExecutor::new(spec, test_environment(), runner, self.store.clone(), capability)
            .unwrap()
            .with_event_sink(self.events.clone())
    }

    async fn source(&self, revision: &str) -> Artifact {
        seed_source(self.store.as_ref(), revision, &sample_sources())
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn test_successful_build_deploys_once() {
    let h = Harness::new();
    let runner = ScriptedRunner::new();
    let executor = h.executor(sample_build_spec().unwrap(), Arc::new(runner.clone()));
    let source = h.source("abc123").await;

    let output = executor
        .execute(&source, &InMemoryBuildCache::new())
        .await
        .unwrap();

    assert_eq!(runner.executed(), vec!["echo ok", "echo build"]);
    assert_eq!(h.deployer.call_count(), 1);
    assert!(output.deploy.is_deployed());
    assert_eq!(output.artifact.revision.as_str(), "abc123");
    assert_eq!(output.artifact.name, BUILD_OUTPUT);
    assert_eq!(
        h.deployer.calls()[0].artifact_location,
        output.artifact.location
    );

    let phases: Vec<_> = output.phases.iter().map(|p| p.name).collect();
    assert_eq!(phases, PhaseName::ALL.to_vec());
    assert!(output.phases.iter().all(|p| p.status == ExecutionStatus::Succeeded));
    assert_eq!(runner.sessions_opened(), runner.sessions_closed());
}

#[tokio::test]
async fn test_failed_command_stops_build_before_deploy() {
    let h = Harness::new();
    let runner = ScriptedRunner::new().fail_on("exit 1", 1);
    let spec = BuildSpec::builder()
        .install(["echo ok"])
        .build_phase(["exit 1", "echo never"])
        .post_build(["deploy"])
        .build()
        .unwrap();
    let executor = h.executor(spec, Arc::new(runner.clone()));
    let source = h.source("abc123").await;

    let failure = executor
        .execute(&source, &InMemoryBuildCache::new())
        .await
        .unwrap_err();

    match &failure.error {
        PipelineError::PhaseCommandFailed {
            phase,
            command,
            exit_code,
        } => {
            assert_eq!(phase, "build");
            assert_eq!(command, "exit 1");
            assert_eq!(*exit_code, 1);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(h.deployer.call_count(), 0);
    assert_eq!(failure.deploy, DeployOutcome::NotAttempted);
    assert!(failure.artifact.is_none());
    assert_eq!(runner.executed(), vec!["echo ok", "exit 1"]);
    assert_eq!(failure.phases.len(), 2);
    assert_eq!(failure.phases[1].status, ExecutionStatus::Failed);
    assert_eq!(runner.sessions_closed(), 1);
}

#[tokio::test]
async fn test_unavailable_cache_degrades_to_cold_build() {
    let h = Harness::new();
    let spec = BuildSpec::builder()
        .install(["echo ok"])
        .build_phase(["make"])
        .post_build(["deploy"])
        .cache_path("build/_deps")
        .build()
        .unwrap();
    let runner = ScriptedRunner::new().writes("make", "build/_deps/lib.a", b"lib".to_vec());
    let executor = h.executor(spec, Arc::new(runner));
    let source = h.source("abc123").await;
    let cache = UnavailableCache::new();

    let output = executor.execute(&source, &cache).await.unwrap();

    assert!(output.deploy.is_deployed());
    assert!(output.phases.iter().all(|p| p.cache == CacheUse::Unavailable));
    assert_eq!(cache.reads(), 3);
    assert_eq!(cache.writes(), 2);
    assert!(!h.events.events_of_type("cache.unavailable").is_empty());
}

#[tokio::test]
async fn test_cache_round_trip_between_builds() {
    let h = Harness::new();
    let spec = BuildSpec::builder()
        .build_phase(["make"])
        .cache_path("build/_deps")
        .build()
        .unwrap();
    let cache = InMemoryBuildCache::new();
    let source = h.source("abc123").await;

    let first = ScriptedRunner::new().writes("make", "build/_deps/lib.a", b"lib".to_vec());
    let output = h
        .executor(spec.clone(), Arc::new(first))
        .execute(&source, &cache)
        .await
        .unwrap();
    assert_eq!(output.phases[0].cache, CacheUse::Miss);
    assert!(output.phases[0].cache_saved);

    let second = ScriptedRunner::new();
    let output = h
        .executor(spec, Arc::new(second))
        .execute(&source, &cache)
        .await
        .unwrap();
    assert_eq!(output.phases[0].cache, CacheUse::Hit);
    assert_eq!(cache.hits(), 1);
    assert!(output.artifact.file_count >= 3);
}

#[tokio::test]
async fn test_deploy_failure_is_terminal() {
    let h = Harness::new();
    let failing = Arc::new(FailingDeployer::rejecting(503, "throttled"));
    let capability = test_capability(failing.clone()).unwrap();
    let spec = BuildSpec::builder()
        .post_build(["deploy", "echo after"])
        .build()
        .unwrap();
    let runner = ScriptedRunner::new();
    let executor = BuildExecutor::new(
        spec,
        test_environment(),
        Arc::new(runner.clone()),
        h.store.clone(),
        Some(capability),
    )
    .unwrap()
    .with_event_sink(h.events.clone());
    let source = h.source("abc123").await;

    let failure = executor
        .execute(&source, &InMemoryBuildCache::new())
        .await
        .unwrap_err();

    assert!(matches!(failure.error, PipelineError::DeployCallFailed { .. }));
    assert!(matches!(failure.deploy, DeployOutcome::Failed { .. }));
    assert!(failure.artifact.is_some());
    assert_eq!(failing.call_count(), 1);
    assert!(runner.executed().is_empty());
    assert_eq!(h.events.events_of_type("deploy.failed").len(), 1);
}

#[tokio::test]
async fn test_output_collected_before_deploy_step() {
    let h = Harness::new();
    let spec = BuildSpec::builder()
        .build_phase(["package"])
        .post_build(["deploy", "touch late.txt"])
        .artifact_file("s3Read.zip")
        .base_directory("build")
        .build()
        .unwrap();
    let runner = ScriptedRunner::new()
        .writes("package", "build/s3Read.zip", b"zip-v1".to_vec())
        .writes("touch late.txt", "build/late.txt", b"late".to_vec());
    let executor = h.executor(spec, Arc::new(runner));
    let source = h.source("abc123").await;

    let output = executor
        .execute(&source, &InMemoryBuildCache::new())
        .await
        .unwrap();

    let bundle = crate::storage::load_bundle(h.store.as_ref(), &output.artifact.location)
        .await
        .unwrap();
    assert_eq!(bundle.len(), 1);
    assert_eq!(bundle.get("s3Read.zip"), Some(&b"zip-v1"[..]));
    assert_eq!(output.phases[1].commands.len(), 2);
}

#[tokio::test]
async fn test_build_without_deploy_step_still_packages() {
    let h = Harness::new();
    let spec = BuildSpec::builder().build_phase(["echo build"]).build().unwrap();
    let executor = h.executor(spec, Arc::new(ScriptedRunner::new()));
    let source = h.source("abc123").await;

    let output = executor
        .execute(&source, &InMemoryBuildCache::new())
        .await
        .unwrap();

    assert_eq!(output.deploy, DeployOutcome::NotAttempted);
    assert_eq!(output.artifact.file_count, sample_sources().len());
    assert_eq!(h.deployer.call_count(), 0);
}

#[tokio::test]
async fn test_deploy_step_requires_capability() {
    let h = Harness::new();
    let err = BuildExecutor::new(
        sample_build_spec().unwrap(),
        test_environment(),
        Arc::new(ScriptedRunner::new()),
        h.store.clone(),
        None,
    )
    .unwrap_err();
    assert!(matches!(err, PipelineError::Validation(_)));
}

#[tokio::test]
async fn test_unpinned_image_rejected() {
    let h = Harness::new();
    let err = BuildExecutor::new(
        BuildSpec::builder().build_phase(["make"]).build().unwrap(),
        BuildEnvironment::new("alpine:latest"),
        Arc::new(ScriptedRunner::new()),
        h.store.clone(),
        None,
    )
    .unwrap_err();
    assert!(matches!(err, PipelineError::BuildSpec(_)));
}

#[tokio::test]
async fn test_phase_events_in_order() {
    let h = Harness::new();
    let executor = h.executor(sample_build_spec().unwrap(), Arc::new(ScriptedRunner::new()));
    let source = h.source("abc123").await;

    executor
        .execute(&source, &InMemoryBuildCache::new())
        .await
        .unwrap();

    let phases: Vec<_> = h
        .events
        .transitions()
        .into_iter()
        .filter(|t| t.scope == TransitionScope::Phase)
        .map(|t| format!("{}:{}", t.name, t.event_type()))
        .collect();
    assert_eq!(
        phases,
        vec![
            "install:phase.started",
            "install:phase.succeeded",
            "build:phase.started",
            "build:phase.succeeded",
            "post_build:phase.started",
            "post_build:phase.succeeded",
        ]
    );
}

#[tokio::test]
async fn test_local_shell_timeout_reports_exit_124() {
    let h = Harness::new();
    let spec = BuildSpec::builder().build_phase(["sleep 30"]).build().unwrap();
    let executor = BuildExecutor::new(
        spec,
        test_environment().with_command_timeout(Duration::from_secs(1)),
        Arc::new(LocalShellRunner::new()),
        h.store.clone(),
        None,
    )
    .unwrap();
    let source = h.source("abc123").await;

    let failure = executor
        .execute(&source, &InMemoryBuildCache::new())
        .await
        .unwrap_err();
    assert!(matches!(
        failure.error,
        PipelineError::PhaseCommandFailed {
            exit_code: TIMEOUT_EXIT_CODE,
            ..
        }
    ));
    assert!(failure.phases[0].commands[0].timed_out);
}

#[tokio::test]
async fn test_local_shell_builds_are_isolated() {
    let h = Harness::new();
    let spec = BuildSpec::builder()
        .build_phase(["mkdir -p out && cp src/main.cpp out/main.cpp"])
        .artifact_file("out/**/*")
        .build()
        .unwrap();
    let executor = BuildExecutor::new(
        spec,
        test_environment(),
        Arc::new(LocalShellRunner::new()),
        h.store.clone(),
        None,
    )
    .unwrap();

    let a = seed_source(h.store.as_ref(), "aaa111", &sample_sources_with("a"))
        .await
        .unwrap();
    let b = seed_source(h.store.as_ref(), "bbb222", &sample_sources_with("b"))
        .await
        .unwrap();
    let cache = InMemoryBuildCache::new();

    let (out_a, out_b) = tokio::join!(executor.execute(&a, &cache), executor.execute(&b, &cache));
    let (out_a, out_b) = (out_a.unwrap(), out_b.unwrap());

    assert_ne!(out_a.artifact.digest, out_b.artifact.digest);
    let bundle_a = crate::storage::load_bundle(h.store.as_ref(), &out_a.artifact.location)
        .await
        .unwrap();
    let main_a = String::from_utf8(bundle_a.get("out/main.cpp").unwrap().to_vec()).unwrap();
    assert!(main_a.contains("\"a\""));
    assert_eq!(out_a.artifact.revision.as_str(), "aaa111");
    assert_eq!(out_b.artifact.revision.as_str(), "bbb222");
}

#[tokio::test]
async fn test_cached_sources_never_replace_new_commit() {
    let h = Harness::new();
    let spec = BuildSpec::builder()
        .build_phase(["mkdir -p out && cp src/main.cpp out/main.cpp"])
        .cache_path("src")
        .artifact_file("out/**/*")
        .build()
        .unwrap();
    let executor = BuildExecutor::new(
        spec,
        test_environment(),
        Arc::new(LocalShellRunner::new()),
        h.store.clone(),
        None,
    )
    .unwrap();
    let cache = InMemoryBuildCache::new();

    let a = seed_source(h.store.as_ref(), "aaa111", &sample_sources_with("a"))
        .await
        .unwrap();
    let b = seed_source(h.store.as_ref(), "bbb222", &sample_sources_with("b"))
        .await
        .unwrap();

    let first = executor.execute(&a, &cache).await.unwrap();
    assert!(first.phases[0].cache_saved);
    let second = executor.execute(&b, &cache).await.unwrap();
    assert_eq!(second.phases[0].cache, CacheUse::Miss);

    let built = crate::storage::load_bundle(h.store.as_ref(), &second.artifact.location)
        .await
        .unwrap();
    let main = String::from_utf8(built.get("out/main.cpp").unwrap().to_vec()).unwrap();
    assert!(main.contains("\"b\""));

    let again = executor.execute(&a, &cache).await.unwrap();
    assert_eq!(again.phases[0].cache, CacheUse::Hit);
    assert_eq!(again.artifact.digest, first.artifact.digest);
}

#[tokio::test]
async fn test_cache_hit_keeps_checked_out_files() {
    let h = Harness::new();
    let spec = BuildSpec::builder()
        .build_phase(["make"])
        .cache_path("build/_deps")
        .build()
        .unwrap();
    let cache = InMemoryBuildCache::new();
    let stale = FileBundle::new()
        .with_file("build/_deps/lib.a", "cached lib")
        .unwrap()
        .with_file("build/_deps/config.h", "stale")
        .unwrap();
    let sources = sample_sources()
        .with_file("build/_deps/config.h", "checked in")
        .unwrap();
    let source = seed_source(h.store.as_ref(), "abc123", &sources).await.unwrap();

    let executor = h.executor(spec, Arc::new(ScriptedRunner::new()));
    let fingerprint = {
        let bundle = crate::storage::load_bundle(h.store.as_ref(), &source.location)
            .await
            .unwrap();
        let workspace = BuildWorkspace::materialize(&bundle).await.unwrap();
        let environment = executor.environment.layered(executor.spec.variables());
        let ctx = RunContext {
            execution_id: Uuid::nil(),
            source: &source,
            sources: &bundle,
            cache: &cache,
            workspace: &workspace,
            environment: &environment,
        };
        executor.fingerprint(&executor.spec.phases()[0], &ctx)
    };
    cache.put(fingerprint.as_str(), stale.encode()).await.unwrap();

    let output = executor.execute(&source, &cache).await.unwrap();
    assert_eq!(output.phases[0].cache, CacheUse::Hit);

    let built = crate::storage::load_bundle(h.store.as_ref(), &output.artifact.location)
        .await
        .unwrap();
    assert_eq!(built.get("build/_deps/config.h"), Some(&b"checked in"[..]));
    assert_eq!(built.get("build/_deps/lib.a"), Some(&b"cached lib"[..]));
}

#[cfg(unix)]
#[tokio::test]
async fn test_executable_script_from_sources_runs() {
    let h = Harness::new();
    let spec = BuildSpec::builder()
        .build_phase(["./build.sh"])
        .artifact_file("out/**/*")
        .build()
        .unwrap();
    let executor = BuildExecutor::new(
        spec,
        test_environment(),
        Arc::new(LocalShellRunner::new()),
        h.store.clone(),
        None,
    )
    .unwrap();
    let sources = sample_sources()
        .with_executable(
            "build.sh",
            "#!/bin/sh\nmkdir -p out && cp build.sh out/run.sh && echo built > out/result.txt\n",
        )
        .unwrap();
    let source = seed_source(h.store.as_ref(), "abc123", &sources).await.unwrap();

    let output = executor
        .execute(&source, &InMemoryBuildCache::new())
        .await
        .unwrap();

    let built = crate::storage::load_bundle(h.store.as_ref(), &output.artifact.location)
        .await
        .unwrap();
    assert_eq!(built.get("out/result.txt"), Some(&b"built\n"[..]));
    assert!(built.is_executable("out/run.sh"));
    assert!(!built.is_executable("out/result.txt"));
}
