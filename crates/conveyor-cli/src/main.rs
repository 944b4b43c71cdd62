//! conveyor CLI
//!
//! Runs the stage workers in one process on the in-memory broker and the
//! reference collaborators.

mod seed;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use conveyor_core::app::{App, AppBuilder, WorkerGroup};
use conveyor_core::config::WorkerConfig;
use conveyor_core::domain::Stage;
use conveyor_core::impls::{
    InMemoryBroker, InMemoryLedger, InMemoryStoreResolver, MentionAnalyzer, StoringExtractor,
};

const IDLE_POLL: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(name = "conveyor")]
#[command(about = "Staged task dispatch with pipeline continuation", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the stage workers
    Run {
        /// Path to configuration file (falls back to CONVEYOR_CONFIG)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override workers per stage
        #[arg(long)]
        threads: Option<usize>,

        /// JSON-lines file of ingest tasks to publish at startup
        #[arg(long)]
        seed: Option<PathBuf>,

        /// Stop once no dataset has pending or running tasks
        #[arg(long)]
        exit_when_idle: bool,
    },

    /// Load and validate configuration
    CheckConfig {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Print the default configuration as TOML
    PrintConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            threads,
            seed,
            exit_when_idle,
        } => run_command(config.as_deref(), threads, seed.as_deref(), exit_when_idle).await?,

        Commands::CheckConfig { config } => check_config_command(config.as_deref())?,

        Commands::PrintConfig => {
            print!("{}", WorkerConfig::default().to_toml_string()?);
        }
    }

    Ok(())
}

async fn run_command(
    config_path: Option<&Path>,
    threads: Option<usize>,
    seed_path: Option<&Path>,
    exit_when_idle: bool,
) -> Result<()> {
    let mut config = WorkerConfig::load(config_path)?;
    if let Some(threads) = threads {
        config.worker.threads = threads;
    }

    let broker = Arc::new(InMemoryBroker::new());
    let resolver = Arc::new(InMemoryStoreResolver::new());
    let app = AppBuilder::new(config)
        .broker(broker.clone())
        .ledger(Arc::new(InMemoryLedger::new()))
        .store_resolver(resolver.clone())
        .extractor(Arc::new(StoringExtractor))
        .analyzer(Arc::new(MentionAnalyzer))
        .build()?;

    let group = app.start().await?;

    if let Some(path) = seed_path {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading seed file {}", path.display()))?;
        let tasks = seed::parse(&text)?;
        let published = seed::publish_all(app.publisher(), tasks).await?;
        tracing::info!(tasks = published.len(), path = %path.display(), "seeded ingest tasks");
    }

    if exit_when_idle {
        tokio::select! {
            result = wait_until_idle(&app) => result?,
            _ = tokio::signal::ctrl_c() => tracing::info!("interrupted"),
        }
    } else {
        tokio::signal::ctrl_c()
            .await
            .context("waiting for ctrl-c")?;
        tracing::info!("interrupted");
    }

    shutdown(group, &broker).await;
    report(&app, &broker, &resolver)?;
    Ok(())
}

async fn wait_until_idle(app: &App) -> Result<()> {
    loop {
        let active = app.ledger().active_datasets().await?;
        if active.is_empty() {
            tracing::info!("no active datasets, stopping");
            return Ok(());
        }
        tracing::debug!(?active, "datasets still processing");
        tokio::time::sleep(IDLE_POLL).await;
    }
}

async fn shutdown(group: WorkerGroup, broker: &InMemoryBroker) {
    tracing::info!(workers = group.len(), "shutting down");
    group.shutdown_and_join().await;
    broker.close();
}

fn report(app: &App, broker: &InMemoryBroker, resolver: &InMemoryStoreResolver) -> Result<()> {
    let snapshot = app.metrics().snapshot();
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    for stage in Stage::ALL {
        if let Some(stats) = broker.stats(stage.queue_name()) {
            println!(
                "queue {:<8} ready={} scheduled={} acked={} dead={}",
                stage.as_str(), stats.ready, stats.scheduled, stats.acked, stats.dead_lettered
            );
        }
    }
    for dataset in resolver.datasets() {
        if let Some(store) = resolver.store(&dataset) {
            println!(
                "store {dataset}: {} entities, {} fragments",
                store.entity_ids().len(),
                store.fragment_count()
            );
        }
    }
    Ok(())
}

fn check_config_command(config_path: Option<&Path>) -> Result<()> {
    let config = WorkerConfig::load(config_path)?;
    println!("Configuration is valid");
    println!("  Stages: {:?}", config.worker.stages);
    println!("  Workers per stage: {}", config.worker.threads);
    for stage in &config.worker.stages {
        println!("  Prefetch {stage}: {}", config.prefetch_for(*stage));
    }
    println!("  Max priority: {}", config.broker.max_priority);
    println!(
        "  Retry: {} attempts, base {} ms, x{}",
        config.retry.max_attempts, config.retry.base_delay_ms, config.retry.multiplier
    );
    println!("  On publish failure: {:?}", config.worker.on_publish_failure);
    Ok(())
}
