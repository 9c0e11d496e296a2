//! End-to-end tests for pipeline executions.

use crate::build::{BuildExecutor, BuildSpec, BUILD_OUTPUT};
use crate::core::{ExecutionStatus, TransitionScope, TriggerEvent};
use crate::credentials::{CredentialScope, DeployCapability};
use crate::errors::ErrorKind;
use crate::pipeline::{
    ExecutionStore, QueueConfig, StandardPipeline, TriggerQueue, BUILD_STAGE, SOURCE_STAGE,
};
use crate::source::SOURCE_OUTPUT;
use crate::storage::{InMemoryArtifactStore, InMemoryBuildCache};
use crate::testing::{
    assert_execution_failed_with, assert_execution_succeeded, assert_has_artifact,
    assert_not_deployed, assert_stage_status, sample_build_spec, sample_sources,
    sample_sources_with, test_environment, test_function,
    RecordingDeployer, ScriptedRunner, TestPipeline, UnavailableCache, UnreachableRepository,
    TEST_PRINCIPAL,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

fn stage_events(pipeline: &TestPipeline) -> Vec<String> {
    pipeline
        .events
        .transitions()
        .into_iter()
        .filter(|t| t.scope == TransitionScope::Stage)
        .map(|t| format!("{}:{}", t.name, t.status))
        .collect()
}

#[tokio::test]
async fn test_commit_builds_and_deploys_once() {
    let pipeline = TestPipeline::builder().build().unwrap();
    let revision = pipeline.commit("abc123", sample_sources()).unwrap();

    let result = pipeline.controller.run(TriggerEvent::new(revision)).await;

    assert_eq!(result.status, ExecutionStatus::Succeeded);
    assert_eq!(pipeline.deployer.call_count(), 1);
    assert!(result.deploy.is_deployed());

    let output = result.artifact(BUILD_OUTPUT).unwrap();
    assert_eq!(output.revision.as_str(), "abc123");
    let call = &pipeline.deployer.calls()[0];
    assert_eq!(call.revision.as_str(), "abc123");
    assert_eq!(call.artifact_location, output.location);
    assert_eq!(call.principal, TEST_PRINCIPAL);

    assert_stage_status(&result, SOURCE_STAGE, ExecutionStatus::Succeeded);
    assert_stage_status(&result, BUILD_STAGE, ExecutionStatus::Succeeded);
    assert_has_artifact(&result, SOURCE_OUTPUT);
    assert_execution_succeeded(&result);
}

#[tokio::test]
async fn test_failing_build_command_fails_without_deploy() {
    let spec = BuildSpec::builder()
        .install(["echo ok"])
        .build_phase(["exit 1"])
        .post_build(["deploy"])
        .build()
        .unwrap();
    let pipeline = TestPipeline::builder()
        .spec(spec)
        .runner(Arc::new(ScriptedRunner::new().fail_on("exit 1", 1)))
        .build()
        .unwrap();
    let revision = pipeline.commit("abc123", sample_sources()).unwrap();

    let result = pipeline.controller.run(TriggerEvent::new(revision)).await;

    assert_execution_failed_with(&result, ErrorKind::PhaseCommandFailed);
    let error = result.error.as_ref().unwrap();
    assert_eq!(error.phase.as_deref(), Some("build"));
    assert_eq!(error.command.as_deref(), Some("exit 1"));
    assert_eq!(error.exit_code, Some(1));
    assert_eq!(pipeline.deployer.call_count(), 0);
    assert_not_deployed(&result);
    assert_stage_status(&result, BUILD_STAGE, ExecutionStatus::Failed);
}

#[tokio::test]
async fn test_stages_run_strictly_in_order() {
    let pipeline = TestPipeline::builder().build().unwrap();
    let revision = pipeline.commit("abc123", sample_sources()).unwrap();

    pipeline.controller.run(TriggerEvent::new(revision)).await;

    assert_eq!(
        stage_events(&pipeline),
        vec![
            "Source:running",
            "Source:succeeded",
            "Build:running",
            "Build:succeeded",
        ]
    );

    let pipeline_events: Vec<_> = pipeline
        .events
        .events()
        .into_iter()
        .map(|e| e.event_type())
        .filter(|t| t.starts_with("pipeline."))
        .collect();
    assert_eq!(pipeline_events, vec!["pipeline.started", "pipeline.succeeded"]);
}

#[tokio::test]
async fn test_source_failure_halts_before_build() {
    let runner = ScriptedRunner::new();
    let pipeline = TestPipeline::builder()
        .repository(Arc::new(UnreachableRepository::new()))
        .runner(Arc::new(runner.clone()))
        .build()
        .unwrap();
    let revision = crate::core::Revision::new("abc123").unwrap();

    let result = pipeline.controller.run(TriggerEvent::new(revision)).await;

    assert_execution_failed_with(&result, ErrorKind::SourceUnavailable);
    assert_stage_status(&result, BUILD_STAGE, ExecutionStatus::Pending);
    assert_eq!(stage_events(&pipeline), vec!["Source:running", "Source:failed"]);
    assert_eq!(runner.sessions_opened(), 0);
    assert_eq!(pipeline.deployer.call_count(), 0);
}

#[tokio::test]
async fn test_unknown_revision_is_source_unavailable() {
    let pipeline = TestPipeline::builder().build().unwrap();
    let revision = crate::core::Revision::new("deadbeef").unwrap();

    let result = pipeline.controller.run(TriggerEvent::new(revision)).await;

    assert_eq!(result.error.unwrap().kind, ErrorKind::SourceUnavailable);
}

#[tokio::test]
async fn test_cache_outage_does_not_fail_pipeline() {
    let spec = BuildSpec::builder()
        .install(["echo ok"])
        .build_phase(["echo build"])
        .post_build(["deploy"])
        .cache_path("build/_deps")
        .build()
        .unwrap();
    let cache = Arc::new(UnavailableCache::new());
    let pipeline = TestPipeline::builder()
        .spec(spec)
        .cache(cache.clone())
        .build()
        .unwrap();
    let revision = pipeline.commit("abc123", sample_sources()).unwrap();

    let result = pipeline.controller.run(TriggerEvent::new(revision)).await;

    assert_eq!(result.status, ExecutionStatus::Succeeded);
    assert_eq!(pipeline.deployer.call_count(), 1);
    assert!(cache.reads() > 0);
    assert!(!pipeline.events.events_of_type("cache.unavailable").is_empty());
}

#[tokio::test]
async fn test_same_commit_twice_yields_same_content() {
    let pipeline = TestPipeline::builder().build().unwrap();
    let revision = pipeline.commit("abc123", sample_sources()).unwrap();

    let first = pipeline.controller.run(TriggerEvent::new(revision.clone())).await;
    let second = pipeline.controller.run(TriggerEvent::new(revision)).await;

    assert_ne!(first.id, second.id);
    let (a, b) = (
        first.artifact(SOURCE_OUTPUT).unwrap(),
        second.artifact(SOURCE_OUTPUT).unwrap(),
    );
    assert_ne!(a.id, b.id);
    assert!(a.same_content(b));
    assert!(first
        .artifact(BUILD_OUTPUT)
        .unwrap()
        .same_content(second.artifact(BUILD_OUTPUT).unwrap()));
    assert_eq!(pipeline.deployer.call_count(), 2);
}

#[tokio::test]
async fn test_final_record_is_persisted() {
    let pipeline = TestPipeline::builder().build().unwrap();
    let revision = pipeline.commit("abc123", sample_sources()).unwrap();

    let result = pipeline.controller.run(TriggerEvent::new(revision.clone())).await;

    let stored = pipeline.executions.get(result.id).await.unwrap();
    assert_eq!(stored, result);
    assert_eq!(pipeline.executions.list_for_revision(&revision).await.len(), 1);
    assert!(stored.finished_at.is_some());
}

#[tokio::test]
async fn test_revoked_scope_fails_deploy() {
    let deployer = Arc::new(RecordingDeployer::new());
    let function = test_function().unwrap();
    let scope = CredentialScope::for_function_update(TEST_PRINCIPAL, &function);
    let handle = scope.revocation_handle();
    let capability = DeployCapability::new(scope, function, deployer.clone()).unwrap();

    let store = Arc::new(InMemoryArtifactStore::new());
    let repository = Arc::new(crate::source::InMemoryRepository::new("CppOnLambdaRepo"));
    let revision = crate::core::Revision::new("abc123").unwrap();
    repository.commit(revision.clone(), sample_sources());

    let executor = BuildExecutor::new(
        sample_build_spec().unwrap(),
        test_environment(),
        Arc::new(ScriptedRunner::new()),
        store.clone(),
        Some(capability),
    )
    .unwrap();
    let controller = StandardPipeline::new(
        "CppOnLambda",
        repository,
        store,
        executor,
        Arc::new(InMemoryBuildCache::new()),
    )
    .build()
    .unwrap();

    handle.revoke();
    let result = controller.run(TriggerEvent::new(revision)).await;

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(result.error.as_ref().unwrap().kind, ErrorKind::DeployCallFailed);
    assert!(matches!(result.deploy, crate::deploy::DeployOutcome::Failed { .. }));
    assert!(result.artifact(BUILD_OUTPUT).is_some());
    assert_eq!(deployer.call_count(), 0);
}

#[tokio::test]
async fn test_concurrent_commits_are_isolated() {
    let runner = ScriptedRunner::new().delay_on("echo build", Duration::from_millis(50));
    let pipeline = TestPipeline::builder()
        .runner(Arc::new(runner))
        .build()
        .unwrap();
    let first = pipeline.commit("aaa111", sample_sources_with("first")).unwrap();
    let second = pipeline.commit("bbb222", sample_sources_with("second")).unwrap();

    let queue = TriggerQueue::spawn(
        pipeline.controller.clone(),
        QueueConfig::default().with_max_concurrent_executions(2),
    );
    let ticket_a = queue.submit(TriggerEvent::new(first)).await.unwrap();
    let ticket_b = queue.submit(TriggerEvent::new(second)).await.unwrap();
    let (a, b) = (ticket_a.wait().await.unwrap(), ticket_b.wait().await.unwrap());
    queue.shutdown().await;

    assert!(a.is_success() && b.is_success());
    let (out_a, out_b) = (a.artifact(BUILD_OUTPUT).unwrap(), b.artifact(BUILD_OUTPUT).unwrap());
    assert_eq!(out_a.revision.as_str(), "aaa111");
    assert_eq!(out_b.revision.as_str(), "bbb222");
    assert_ne!(out_a.digest, out_b.digest);

    let bundle = crate::storage::load_bundle(pipeline.store.as_ref(), &out_a.location)
        .await
        .unwrap();
    let main = String::from_utf8(bundle.get("src/main.cpp").unwrap().to_vec()).unwrap();
    assert!(main.contains("first"));

    let calls = pipeline.deployer.calls();
    assert_eq!(calls.len(), 2);
    let deployed: std::collections::HashSet<_> =
        calls.iter().map(|c| c.artifact_digest.clone()).collect();
    assert!(deployed.contains(&out_a.digest) && deployed.contains(&out_b.digest));
}

#[tokio::test]
async fn test_queue_with_single_slot_runs_every_event() {
    let pipeline = TestPipeline::builder().build().unwrap();
    let queue = TriggerQueue::spawn(
        pipeline.controller.clone(),
        QueueConfig::default()
            .with_max_concurrent_executions(1)
            .with_capacity(1),
    );

    let mut tickets = Vec::new();
    for (i, rev) in ["r1", "r2", "r3"].iter().enumerate() {
        let revision = pipeline
            .commit(rev, sample_sources_with(&format!("build {i}")))
            .unwrap();
        tickets.push(queue.submit(TriggerEvent::new(revision)).await.unwrap());
    }

    let mut revisions = Vec::new();
    for ticket in tickets {
        let result = ticket.wait().await.unwrap();
        assert!(result.is_success());
        revisions.push(result.revision.as_str().to_string());
    }
    queue.shutdown().await;

    assert_eq!(revisions, vec!["r1", "r2", "r3"]);
    assert_eq!(pipeline.deployer.call_count(), 3);
    assert_eq!(pipeline.executions.len(), 3);
}

#[tokio::test]
async fn test_shutdown_waits_for_in_flight_executions() {
    let runner = ScriptedRunner::new().delay_on("echo build", Duration::from_millis(50));
    let pipeline = TestPipeline::builder()
        .runner(Arc::new(runner))
        .build()
        .unwrap();
    let queue = TriggerQueue::spawn(pipeline.controller.clone(), QueueConfig::default());
    let revision = pipeline.commit("abc123", sample_sources()).unwrap();

    let ticket = queue.submit(TriggerEvent::new(revision)).await.unwrap();
    queue.shutdown().await;

    let result = ticket.wait().await.unwrap();
    assert!(result.is_success());
    assert_eq!(pipeline.deployer.call_count(), 1);
}
