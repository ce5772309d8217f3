//! Bulk request service
//!
//! Hosts the request store and the archiver.
//!
//! Usage:
//!     bulk-service run --config bulk.toml --leader
//!     bulk-service sweep --database sqlite:///var/lib/bulk/bulk.sqlite3
//!     bulk-service stats

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use bulk_logging::{init_logging, LogConfig};
use bulk_store::{
    BulkDb, BulkRequestFilter, BulkRequestStatus, LeadershipListener, RequestArchiver,
    RequestStore, StoreConfig, TargetState,
};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "bulk-service", about = "Bulk request store and archiver")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true, env = "BULK_CONFIG")]
    config: Option<PathBuf>,

    /// Database URL, overrides the configuration file
    #[arg(long, global = true, env = "BULK_DATABASE_URL")]
    database: Option<String>,

    /// Enable verbose logging (info/debug to stderr)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Recover the store and run the archiver until interrupted
    Run {
        /// Start as archiver leader
        #[arg(long, env = "BULK_LEADER")]
        leader: bool,
    },

    /// Archive and delete stale terminal requests once, then exit
    Sweep,

    /// Print request and target counts as JSON
    Stats,
}

#[derive(Debug, Serialize)]
struct Stats {
    requests: BTreeMap<BulkRequestStatus, u64>,
    targets: BTreeMap<TargetState, u64>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(LogConfig {
        app_name: "bulk-service",
        verbose: cli.verbose,
        log_dir: None,
    }) {
        eprintln!("Warning: failed to initialize logging: {:?}", e);
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to start tokio runtime: {}", e);
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{:?}", err);
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    info!(database = %config.database_url, "Opening bulk store");

    let db = BulkDb::connect(&config)
        .await
        .with_context(|| format!("Failed to open database {}", config.database_url))?;
    let store = RequestStore::new(&db, &config).context("Failed to create request store")?;

    let result = match cli.command {
        Commands::Run { leader } => serve(&store, &config, leader).await,
        Commands::Sweep => sweep(&store, &config).await,
        Commands::Stats => stats(&store).await,
    };

    db.close().await;
    result
}

fn load_config(cli: &Cli) -> Result<StoreConfig> {
    let mut config = match &cli.config {
        Some(path) => StoreConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => StoreConfig::default(),
    };
    if let Some(database) = &cli.database {
        config.database_url = database.clone();
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn archiver(store: &RequestStore, config: &StoreConfig) -> RequestArchiver {
    RequestArchiver::new(
        store.clone(),
        config.archive_window(),
        config.archive_period(),
    )
}

async fn serve(store: &RequestStore, config: &StoreConfig, leader: bool) -> Result<()> {
    store.load().await.context("Failed to recover request store")?;

    let archiver = archiver(store, config);
    if leader {
        archiver.is_leader();
    }
    archiver.reset();

    info!(leader, "Bulk service running, press Ctrl+C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutting down");
    archiver.not_leader();
    archiver.shutdown();
    Ok(())
}

async fn sweep(store: &RequestStore, config: &StoreConfig) -> Result<()> {
    let archiver = archiver(store, config);
    archiver.is_leader();
    let report = archiver
        .run_now()
        .await
        .context("Archiver sweep failed")?
        .unwrap_or_default();
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn stats(store: &RequestStore) -> Result<()> {
    let mut requests = BTreeMap::new();
    for status in [
        BulkRequestStatus::Queued,
        BulkRequestStatus::Started,
        BulkRequestStatus::Cancelling,
        BulkRequestStatus::Cancelled,
        BulkRequestStatus::Completed,
    ] {
        let filter = BulkRequestFilter {
            statuses: vec![status],
            ..Default::default()
        };
        requests.insert(status, store.count(Some(&filter)).await?);
    }

    let targets = store.targets().counts_by_state().await?;
    let stats = Stats { requests, targets };
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
