use agent_conductor::completion::{CompletionDetector, FileSource};
use agent_conductor::config::{ConductorConfig, ProviderKind};
use agent_conductor::definition::WorkflowDefinition;
use agent_conductor::engine::WorkflowEngine;
use agent_conductor::events::EventBus;
use agent_conductor::facade::Conductor;
use agent_conductor::provider::http::HttpProvider;
use agent_conductor::provider::orchestrator::{
    OrchestratorSettings, ProviderOrchestrator, RegisteredProvider,
};
use agent_conductor::provider::process::ProcessProvider;
use agent_conductor::provider::AgentProvider;
use agent_conductor::storage::file::FileStore;
use agent_conductor::storage::StateStore;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "conductor")]
#[command(about = "Workflow orchestration engine for multi-step AI agents")]
#[command(version)]
#[command(arg_required_else_help = true)]
struct Cli {
    /// Path to the conductor configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the durable state directory
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: CommandKind,
}

#[derive(Subcommand)]
enum CommandKind {
    /// Run the orchestration daemon
    Run {
        /// Root directory scanned for completion files (defaults to cwd)
        #[arg(long)]
        root: Option<PathBuf>,

        /// Override the polling interval in seconds
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Validate a workflow definition file
    Validate {
        /// Path to the workflow definition YAML
        definition: PathBuf,
    },
    /// Create a workflow from a definition; the daemon picks it up
    Submit {
        /// Path to the workflow definition YAML
        definition: PathBuf,

        /// Subject the workflow runs against (e.g. an issue number)
        #[arg(long)]
        subject: String,

        /// Metadata entries as key=value (repeatable)
        #[arg(long = "meta", value_parser = parse_key_value)]
        metadata: Vec<(String, String)>,
    },
    /// Show one workflow, or list all when no id is given
    Status {
        workflow_id: Option<String>,
    },
    /// Pause a running workflow
    Pause {
        workflow_id: String,
    },
    /// Resume a paused workflow
    Resume {
        workflow_id: String,
    },
    /// Stop a workflow and terminate its agents
    Stop {
        workflow_id: String,
    },
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got '{}'", raw)),
    }
}

fn load_config(cli: &Cli) -> Result<ConductorConfig> {
    let mut config = match &cli.config {
        Some(path) => ConductorConfig::load(path)?,
        None => ConductorConfig::default(),
    };
    if let Some(state_dir) = &cli.state_dir {
        config.state_dir = Some(state_dir.clone());
    }
    Ok(config)
}

fn build_providers(
    config: &ConductorConfig,
    state_dir: &std::path::Path,
) -> Result<Vec<RegisteredProvider>> {
    let log_dir = state_dir.join("logs");
    let mut registered = Vec::new();
    for provider_config in &config.providers {
        let provider: Arc<dyn AgentProvider> = match provider_config.kind {
            ProviderKind::Process => Arc::new(ProcessProvider::from_config(
                provider_config,
                Some(log_dir.clone()),
            )?),
            ProviderKind::Http => Arc::new(HttpProvider::from_config(provider_config)?),
        };
        registered.push(RegisteredProvider {
            provider,
            cooldown_threshold: provider_config.cooldown_threshold,
        });
    }
    Ok(registered)
}

async fn run_daemon(config: ConductorConfig, root: Option<PathBuf>, interval: Option<u64>) -> Result<()> {
    let mut config = config;
    if let Some(interval) = interval {
        config.orchestration.interval_seconds = interval;
    }
    config.validate()?;

    let state_dir = config.state_dir();
    let store = Arc::new(
        FileStore::open_exclusive(&state_dir)
            .with_context(|| format!("Failed to open state dir {}", state_dir.display()))?,
    );

    let root = match root {
        Some(root) => root,
        None => std::env::current_dir().context("Failed to resolve working directory")?,
    };

    let events = EventBus::new(256);
    let providers = build_providers(&config, &state_dir)?;
    if providers.is_empty() {
        tracing::warn!("No providers configured; workflows cannot launch agents");
    }
    let orchestrator = ProviderOrchestrator::new(
        providers,
        config.preferences.clone(),
        OrchestratorSettings::from(&config.provider_settings),
        events.clone(),
    );

    let source = FileSource::new(&root, &config.orchestration.completion_pattern)?;
    let detector = CompletionDetector::new(
        vec![Box::new(source)],
        config.orchestration.dedupe_cache_size,
    );

    // Surface engine events in the daemon log; external notification
    // channels subscribe the same way.
    let mut event_rx = events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            if let Ok(line) = serde_json::to_string(&event) {
                tracing::info!(target: "conductor::events", "{}", line);
            }
        }
    });

    let mut conductor = Conductor::new(
        store,
        orchestrator,
        detector,
        config.orchestration.clone(),
        root,
        events,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(true);
        }
    });

    tracing::info!(
        "Conductor running (state dir {}, interval {}s)",
        state_dir.display(),
        config.orchestration.interval_seconds
    );
    conductor.run(shutdown_rx).await?;
    Ok(())
}

fn control_engine(config: &ConductorConfig) -> Result<WorkflowEngine> {
    let store = Arc::new(FileStore::open(&config.state_dir())?);
    Ok(WorkflowEngine::new(store, EventBus::new(16)))
}

fn print_workflow_summary(workflow: &agent_conductor::Workflow) {
    println!(
        "{}  {}  subject={}  state={}  step {}/{}",
        workflow.id,
        workflow.definition_ref,
        workflow.subject,
        workflow.state,
        workflow.current_step_index + 1,
        workflow.steps.len()
    );
    for step in &workflow.steps {
        println!(
            "    {:<20} {:<12} {:?}  attempts={}",
            step.step_id, step.agent_type, step.status, step.attempt_count
        );
    }
    if let Some(error) = &workflow.last_error {
        println!("    last error: {}", error);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        CommandKind::Run { root, interval } => run_daemon(config, root, interval).await?,
        CommandKind::Validate { definition } => {
            let text = std::fs::read_to_string(&definition)
                .with_context(|| format!("Failed to read {}", definition.display()))?;
            let parsed = WorkflowDefinition::from_yaml_str(&text)?;
            println!(
                "OK: {} ({} steps)",
                parsed.name,
                parsed.steps.len()
            );
        }
        CommandKind::Submit {
            definition,
            subject,
            metadata,
        } => {
            let text = std::fs::read_to_string(&definition)
                .with_context(|| format!("Failed to read {}", definition.display()))?;
            let parsed = WorkflowDefinition::from_yaml_str(&text)?;
            let engine = control_engine(&config)?;
            let metadata: BTreeMap<String, String> = metadata.into_iter().collect();
            let workflow = engine.create_workflow(&parsed, &subject, metadata).await?;
            println!("{}", workflow.id);
        }
        CommandKind::Status { workflow_id } => {
            let store = Arc::new(FileStore::open(&config.state_dir())?);
            match workflow_id {
                Some(id) => {
                    let workflow = store
                        .load_workflow(&id)
                        .await?
                        .with_context(|| format!("workflow {} not found", id))?;
                    print_workflow_summary(&workflow);
                }
                None => {
                    for workflow in store.list_workflows(None).await? {
                        print_workflow_summary(&workflow);
                    }
                }
            }
        }
        CommandKind::Pause { workflow_id } => {
            let engine = control_engine(&config)?;
            let workflow = engine.pause_workflow(&workflow_id).await?;
            println!("{} paused", workflow.id);
        }
        CommandKind::Resume { workflow_id } => {
            let engine = control_engine(&config)?;
            let (workflow, _) = engine.resume_workflow(&workflow_id).await?;
            println!("{} resumed", workflow.id);
        }
        CommandKind::Stop { workflow_id } => {
            let engine = control_engine(&config)?;
            let (workflow, running) = engine.stop_workflow(&workflow_id).await?;
            println!("{} stopped ({} step(s) were running)", workflow.id, running.len());
        }
    }

    Ok(())
}
