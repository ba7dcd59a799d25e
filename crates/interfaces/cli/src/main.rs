//! The `engram` binary: flag parsing, logging to stderr, service wiring,
//! and the stdio serve loop.  Exit code 0 on clean shutdown; non-zero on
//! configuration or service-init failure.

mod jobs;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use engram_config::AppConfig;
use engram_embeddings::build_embedder;
use engram_llm::LlmClient;
use engram_memory::{EvolutionEngine, MemoryService, WorkspaceService};
use engram_prompts::{PromptManager, PromptWatcher};
use engram_scheduler::Scheduler;
use engram_server::{Dispatcher, ServerState, ToolRegistry, load_strategy_guide, tools};
use engram_store::{ChromaStore, VectorStore};

#[derive(Debug, Parser)]
#[command(
    name = "engram",
    version,
    about = "Adaptive coding-memory MCP server over stdio"
)]
struct Cli {
    /// YAML configuration file.
    #[arg(long, default_value = "config/engram.yaml")]
    config: PathBuf,

    /// Optional key=value environment file loaded before configuration.
    #[arg(long)]
    env: Option<PathBuf>,

    /// Log verbosity (stderr only; stdout carries the protocol).
    #[arg(long, value_enum, default_value = "info")]
    log_level: CliLogLevel,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliLogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl CliLogLevel {
    fn as_str(self) -> &'static str {
        match self {
            CliLogLevel::Debug => "debug",
            CliLogLevel::Info => "info",
            CliLogLevel::Warn => "warn",
            CliLogLevel::Error => "error",
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(env_file) = &cli.env {
        dotenvy::from_path(env_file)
            .with_context(|| format!("failed to load env file {}", env_file.display()))?;
    } else {
        dotenvy::dotenv().ok();
    }

    // stdout is the JSON-RPC channel; all logs go to stderr.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_str()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("failed to load config {}", cli.config.display()))?;
    info!(config = %cli.config.display(), "configuration loaded");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handler(shutdown_tx.clone());

    // ── Downstream clients ─────────────────────────────────────────────
    let store: Arc<dyn VectorStore> = Arc::new(
        ChromaStore::new(&config.chromadb).context("vector-store client init failed")?,
    );
    store
        .ensure_collection()
        .await
        .context("vector-store collection bootstrap failed")?;

    let embedder = build_embedder(&config.embedding).context("embedding provider init failed")?;
    if embedder.is_degraded() {
        warn!("running with the degraded hash-fallback embedder");
    }
    let llm = Arc::new(
        LlmClient::new(&config.litellm, shutdown_rx.clone()).context("LLM client init failed")?,
    );
    let prompts = Arc::new(PromptManager::new(&config.prompts));
    let _prompt_watcher = if config.prompts.hot_reload {
        match PromptWatcher::start(Arc::clone(&prompts)) {
            Ok(watcher) => Some(watcher),
            Err(err) => {
                warn!(%err, "prompt watcher failed to start — falling back to mtime checks");
                None
            }
        }
    } else {
        None
    };

    // ── Core services ──────────────────────────────────────────────────
    let memory = MemoryService::new(
        Arc::clone(&store),
        Arc::clone(&embedder),
        llm.clone(),
        Arc::clone(&prompts),
    );
    let workspaces = WorkspaceService::new(Arc::clone(&store));
    let evolution = EvolutionEngine::new(Arc::clone(&store), embedder, llm, prompts)
        .with_batching(config.evolution.batch_size, config.evolution.worker_count);
    let strategy_guide = load_strategy_guide(&config.onboarding);
    let state = ServerState::new(memory, workspaces, evolution, strategy_guide);

    // ── Scheduler ──────────────────────────────────────────────────────
    if config.evolution.enabled {
        let scheduler = Arc::new(Scheduler::new(shutdown_rx.clone()));
        scheduler
            .register(
                jobs::EVOLUTION_JOB,
                &config.evolution.schedule,
                Arc::new(jobs::ScheduledEvolutionJob::new(Arc::clone(&state))),
            )
            .context("failed to register the evolution job")?;
        scheduler
            .register(
                jobs::MAINTENANCE_JOB,
                jobs::MAINTENANCE_SCHEDULE,
                Arc::new(jobs::CollectionMaintenanceJob::new(Arc::clone(&store))),
            )
            .context("failed to register the maintenance job")?;
        tokio::spawn(Arc::clone(&scheduler).run());
        info!(schedule = %config.evolution.schedule, "evolution scheduler running");
    }

    // ── Transport ──────────────────────────────────────────────────────
    let mut registry = ToolRegistry::default();
    tools::register_all(&mut registry, state);
    let dispatcher = Dispatcher::new(registry);

    dispatcher
        .serve(tokio::io::stdin(), tokio::io::stdout(), shutdown_rx)
        .await?;

    // Reading has stopped (EOF or signal); make sure background tasks see
    // the shutdown too.
    let _ = shutdown_tx.send(true);
    info!("clean shutdown");
    Ok(())
}

fn spawn_signal_handler(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received — shutting down");
            let _ = shutdown_tx.send(true);
        }
    });
}
