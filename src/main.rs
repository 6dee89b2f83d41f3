use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::future::join_all;
use snapshot_hub::build_store::{BuildStore, MemoryBuildStore, SqliteBuildStore};
use snapshot_hub::config::{AppConfig, CliConfig, FileConfig};
use snapshot_hub::job_registrar::PipelineDispatcher;
use snapshot_hub::snapshot::SnapshotManager;
use snapshot_hub::worker::WorkerPool;
use snapshot_hub::{metrics, server};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    if path_buf.is_absolute() || s == snapshot_hub::config::IN_MEMORY_DB {
        return Ok(path_buf);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(path_buf))
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to a TOML config file. Its values override the flags below.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Path to the SQLite build database, or ":memory:".
    #[clap(long, value_parser = parse_path)]
    pub db_path: Option<PathBuf>,

    /// Log file path recorded on job records.
    #[clap(long)]
    pub log_file: Option<String>,

    /// The port for the metrics server (Prometheus scraping).
    #[clap(long, default_value_t = 9091)]
    pub metrics_port: u16,

    /// Seconds between polls for builds pending a snapshot.
    #[clap(long, default_value_t = 60)]
    pub poll_interval_secs: u64,

    /// Maximum number of pipeline phases running at once.
    #[clap(long, default_value_t = 4)]
    pub max_concurrent_jobs: usize,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Cancel jobs left in progress by a previous run.
    Audit,
    /// Snapshot one index now.
    Snapshot {
        env: String,
        index: String,
        /// Snapshot name, defaults to the index name.
        #[clap(long)]
        name: Option<String>,
    },
    /// Tag a build as pending a snapshot.
    Pending { build_id: String },
    /// Print the configured snapshot environments.
    Info,
    /// Run the pending-snapshot poller and the metrics server.
    Serve,
}

fn open_store(config: &AppConfig) -> Result<Arc<dyn BuildStore>> {
    if config.uses_in_memory_db() {
        warn!("Using an in-memory build store, nothing will be persisted");
        return Ok(Arc::new(MemoryBuildStore::new()));
    }
    info!("Opening SQLite build database at {:?}...", config.db_path);
    Ok(Arc::new(SqliteBuildStore::new(&config.db_path)?))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .unwrap();

    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading config from {:?}", path);
            Some(FileConfig::load(path)?)
        }
        None => None,
    };
    let cli_config = CliConfig {
        db_path: cli_args.db_path.clone(),
        log_file: cli_args.log_file.clone(),
        metrics_port: cli_args.metrics_port,
        poll_interval_secs: cli_args.poll_interval_secs,
        max_concurrent_jobs: cli_args.max_concurrent_jobs,
    };
    let config = AppConfig::resolve(&cli_config, file_config)?;

    let store = open_store(&config)?;
    let dispatcher = Arc::new(PipelineDispatcher::new());
    let workers = WorkerPool::new(config.max_concurrent_jobs);
    let mut manager = SnapshotManager::new(store, dispatcher, workers);
    manager
        .configure(&config)
        .context("Failed to configure snapshot environments")?;

    match cli_args.command {
        Command::Audit => {
            let cancelled = manager.clean_stale_status()?;
            info!("Audit done, {} stale jobs cancelled", cancelled);
        }
        Command::Snapshot { env, index, name } => {
            let cancel = CancellationToken::new();
            let ctrl_c_cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, cancelling snapshot");
                    ctrl_c_cancel.cancel();
                }
            });

            let result = manager
                .snapshot(&env, &index, name.as_deref(), &cancel)
                .await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Pending { build_id } => {
            manager.pending_snapshot(&build_id)?;
            info!("Build '{}' tagged for snapshot", build_id);
        }
        Command::Info => {
            println!("{}", serde_json::to_string_pretty(&manager.snapshot_info())?);
        }
        Command::Serve => serve(manager, &config).await?,
    }
    Ok(())
}

async fn serve(manager: SnapshotManager, config: &AppConfig) -> Result<()> {
    info!("Initializing metrics...");
    metrics::init_metrics();

    let cancelled = manager.clean_stale_status()?;
    if cancelled > 0 {
        warn!("Cancelled {} jobs left running by a previous process", cancelled);
    }

    let cancel = CancellationToken::new();
    let manager = Arc::new(manager);

    let poller = tokio::spawn(manager.poll_pending(config.poll_interval, cancel.clone()));
    let metrics_cancel = cancel.clone();
    let metrics_port = config.metrics_port;
    let metrics_server = tokio::spawn(async move {
        if let Err(e) = server::run_metrics_server(metrics_port, metrics_cancel.clone()).await {
            error!("Metrics server error: {:#}", e);
            metrics_cancel.cancel();
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Shutdown requested"),
        _ = cancel.cancelled() => {}
    }
    cancel.cancel();

    for result in join_all([poller, metrics_server]).await {
        if let Err(e) = result {
            error!("Background task panicked: {}", e);
        }
    }
    info!("Snapshot hub stopped");
    Ok(())
}
