use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nabory_storage::{CatalogStore, PgCatalogStore};
use nabory_sync::{
    build_scheduler, deduplicate, seed_sources, BatchOrchestrator, ScanGuard, ScanTrigger,
    SourceRegistry, SyncConfig,
};
use nabory_web::AppState;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "nabory-cli")]
#[command(about = "Funding call aggregator command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply database migrations.
    Migrate,
    /// Insert sources from the registry file that are not in the catalog yet.
    Seed {
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Scan every active source.
    Scan,
    /// Run numbered batch N (1-based).
    Batch { number: u32 },
    /// Run an explicit slice of the name-ordered active sources.
    Partition {
        #[arg(long, default_value_t = 0)]
        start: usize,
        #[arg(long)]
        count: Option<usize>,
    },
    /// Run the pipeline for one source.
    Source { id: Uuid },
    /// Remove duplicate opportunities, keeping the newest of each fingerprint.
    Dedup,
    /// Serve the HTTP API and, when enabled, the weekly scheduler.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Scan) {
        Commands::Migrate => {
            let store = connect(&config).await?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Seed { file } => {
            let store = connect(&config).await?;
            let path = file.unwrap_or_else(|| config.sources_file.clone());
            let registry = SourceRegistry::load(&path).await?;
            let report = seed_sources(&store, &registry).await?;
            print_json(&report)?;
        }
        Commands::Scan => {
            let orch = Arc::new(orchestrator(&config).await?);
            match ScanTrigger::new(orch, ScanGuard::new()).run_guarded().await {
                Some(summary) => print_json(&summary?)?,
                None => info!("full scan already in progress"),
            }
        }
        Commands::Batch { number } => {
            let summary = orchestrator(&config).await?.run_batch_number(number).await?;
            print_json(&summary)?;
        }
        Commands::Partition { start, count } => {
            let orch = orchestrator(&config).await?;
            let count = count.unwrap_or_else(|| orch.batch_size());
            print_json(&orch.run_partition(start, count).await?)?;
        }
        Commands::Source { id } => {
            let report = orchestrator(&config).await?.run_single_source(id).await?;
            print_json(&report)?;
        }
        Commands::Dedup => {
            let store = connect(&config).await?;
            print_json(&deduplicate(&store).await?)?;
        }
        Commands::Serve => {
            let orch = Arc::new(orchestrator(&config).await?);
            let state = AppState::new(orch, ScanGuard::new());

            let scheduler = build_scheduler(&config, state.trigger.clone()).await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
                info!(cron = %config.scan_cron, "weekly scan scheduled");
            }

            tokio::select! {
                res = nabory_web::serve(state, config.web_port) => res?,
                _ = tokio::signal::ctrl_c() => info!("shutting down"),
            }

            if let Some(mut sched) = scheduler {
                sched.shutdown().await.context("stopping scheduler")?;
            }
        }
    }

    Ok(())
}

async fn connect(config: &SyncConfig) -> Result<PgCatalogStore> {
    PgCatalogStore::connect(&config.database_url)
        .await
        .context("connecting to DATABASE_URL")
}

async fn orchestrator(config: &SyncConfig) -> Result<BatchOrchestrator> {
    let store: Arc<dyn CatalogStore> = Arc::new(connect(config).await?);
    BatchOrchestrator::from_config(config, store)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
