//! Deployflow command line.
//!
//! - `validate`: load a pipeline config and check it
//! - `run`: snapshot, build and deploy one or more revisions of the
//!   configured repository, printing each execution record as JSON

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

use deployflow::build::{BuildExecutor, CommandRunner, LocalShellRunner, PodmanRunner};
use deployflow::config::{PipelineConfig, RunnerKind};
use deployflow::core::{Revision, TriggerEvent};
use deployflow::credentials::{CredentialScope, DeployCapability};
use deployflow::deploy::FunctionDeployer;
use deployflow::events::LoggingEventSink;
use deployflow::observability::{init_tracing, LogFormat};
use deployflow::pipeline::{StandardPipeline, TriggerQueue};
use deployflow::source::GitRepository;
use deployflow::storage::{BuildCache, FsArtifactStore, FsBuildCache, InMemoryBuildCache};

#[derive(Parser)]
#[command(name = "deployflow", version, about = "Build and deploy commits to a function")]
struct Cli {
    /// Log format (overrides the config file)
    #[arg(long, global = true, env = "DEPLOYFLOW_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a pipeline config without running anything
    Validate {
        /// Pipeline config file
        #[arg(short, long, default_value = "deployflow.json")]
        config: PathBuf,
    },
    /// Run the pipeline for one or more revisions
    Run {
        /// Pipeline config file
        #[arg(short, long, default_value = "deployflow.json")]
        config: PathBuf,

        /// Revisions to build; each becomes its own execution
        #[arg(short, long = "revision", required = true)]
        revisions: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config } => {
            let config = load_config(&config, cli.log_format)?;
            println!(
                "{}: ok ({} phases, deploys to '{}')",
                config.name,
                config.build_spec.phases().len(),
                config.function.name
            );
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run { config, revisions } => {
            let config = load_config(&config, cli.log_format)?;
            run(config, revisions).await
        }
    }
}

fn load_config(path: &Path, log_format: Option<LogFormat>) -> Result<PipelineConfig> {
    let config = PipelineConfig::from_path(path)
        .with_context(|| format!("failed to load pipeline config {}", path.display()))?;
    init_tracing(log_format.unwrap_or(config.log_format));
    info!(pipeline = %config.name, path = %path.display(), "Loaded pipeline config");
    Ok(config)
}

async fn run(config: PipelineConfig, revisions: Vec<String>) -> Result<ExitCode> {
    let revisions = revisions
        .into_iter()
        .map(Revision::new)
        .collect::<Result<Vec<_>, _>>()
        .context("invalid revision")?;

    let mut repository = GitRepository::new(&config.source.repository, &config.source.path);
    if let Some(description) = &config.source.description {
        repository = repository.with_description(description);
    }
    let store = Arc::new(FsArtifactStore::new(&config.artifact_dir));
    let cache: Arc<dyn BuildCache> = match &config.cache_dir {
        Some(dir) => Arc::new(FsBuildCache::new(dir)),
        None => Arc::new(InMemoryBuildCache::new()),
    };

    let executor = BuildExecutor::new(
        config.build_spec.clone(),
        config.environment.clone(),
        command_runner(config.runner).await?,
        store.clone(),
        deploy_capability(&config)?,
    )
    .context("failed to set up the build executor")?
    .with_event_sink(Arc::new(LoggingEventSink::default()));

    let controller = StandardPipeline::new(
        config.name.as_str(),
        Arc::new(repository),
        store,
        executor,
        cache,
    )
    .with_event_sink(Arc::new(LoggingEventSink::default()))
    .build()
    .context("invalid pipeline")?;

    let queue = TriggerQueue::spawn(Arc::new(controller), config.queue_config());
    let mut tickets = Vec::with_capacity(revisions.len());
    for revision in revisions {
        let event = TriggerEvent::new(revision).with_origin("cli");
        tickets.push(queue.submit(event).await?);
    }

    let mut failed = 0usize;
    for ticket in tickets {
        let execution = ticket.wait().await?;
        if !execution.is_success() {
            failed += 1;
        }
        println!("{}", execution.to_json_pretty());
    }
    queue.shutdown().await;

    if failed > 0 {
        error!(failed, "Pipeline executions failed");
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

async fn command_runner(kind: RunnerKind) -> Result<Arc<dyn CommandRunner>> {
    match kind {
        RunnerKind::Podman => {
            let runner = PodmanRunner::new();
            runner.check_available().await?;
            Ok(Arc::new(runner))
        }
        RunnerKind::Local => Ok(Arc::new(LocalShellRunner::new())),
    }
}

fn deploy_capability(config: &PipelineConfig) -> Result<Option<DeployCapability>> {
    if !config.build_spec.has_deploy_step() {
        return Ok(None);
    }
    let function = config.function_identity()?;
    let scope = CredentialScope::for_function_update(config.deploy.principal.as_str(), &function);
    let capability = DeployCapability::new(scope, function, function_deployer(config)?)?;
    Ok(Some(capability))
}

#[cfg(feature = "http")]
fn function_deployer(config: &PipelineConfig) -> Result<Arc<dyn FunctionDeployer>> {
    let endpoint = config
        .deploy
        .endpoint
        .as_deref()
        .context("deploy.endpoint is not set")?;
    let deployer = deployflow::deploy::HttpFunctionDeployer::new(endpoint, config.deploy_timeout())?;
    Ok(Arc::new(deployer))
}

#[cfg(not(feature = "http"))]
fn function_deployer(_config: &PipelineConfig) -> Result<Arc<dyn FunctionDeployer>> {
    anyhow::bail!("deploy steps need the `http` feature, which this binary was built without")
}
