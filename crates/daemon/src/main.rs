//! treesync daemon entry point.
//!
//! Loads configuration, opens both trees and the sync metadata, then runs
//! the periodic diff scheduler, the continuous job runner, and the audit
//! recorder until SIGINT/SIGTERM.

mod audit;
mod scheduler;
mod signals;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use treesync_core::config::{AppConfig, DaemonConfig};
use treesync_core::runner::RunMode;
use treesync_core::SyncSession;

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// treesync reconciliation daemon.
#[derive(Parser, Debug)]
#[command(
    name = "treesync-daemon",
    version,
    about = "Bidirectional reconciliation daemon for two storage trees"
)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Override the log level from the config file (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config =
        AppConfig::load_from_file(&args.config).context("failed to load configuration file")?;
    config
        .validate()
        .context("configuration validation failed")?;

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.daemon.log_level.clone());
    init_tracing(&config.daemon, &log_level)?;

    // Startup banner
    info!("========================================");
    info!("  treesync daemon v{}", env!("CARGO_PKG_VERSION"));
    info!("========================================");
    info!("Config file   : {}", args.config.display());
    info!("Local tree    : {}", config.local.path.display());
    info!("Remote tree   : {}", config.remote.path.display());
    info!("Root          : {}", config.sync.root);
    info!("Poll interval : {}s", config.daemon.poll_interval_secs);
    info!("Concurrency   : {}", config.sync.concurrency);
    info!("Metadata      : {:?}", config.sync.metadata_backend);
    info!("Data dir      : {}", config.daemon.data_dir.display());
    info!("Log level     : {}", log_level);
    info!("========================================");

    let poll_interval = Duration::from_secs(config.daemon.poll_interval_secs);
    let session = SyncSession::open(config)
        .await
        .context("failed to open sync session")?;
    session
        .db
        .set_state("daemon_started_at", &chrono::Utc::now().to_rfc3339())
        .context("failed to record daemon start")?;

    let shutdown = signals::setup_signal_handlers();

    // Subscribe before anything can emit.
    let audit_handle = tokio::spawn(audit::record_events(
        session.db.clone(),
        session.orchestrator.subscribe(),
        shutdown.clone(),
    ));

    let runner = session.runner();
    let runner_shutdown = shutdown.clone();
    let runner_handle =
        tokio::spawn(async move { runner.run(RunMode::Continuous(runner_shutdown)).await });

    let sched = scheduler::Scheduler::new(
        session.orchestrator.clone(),
        session.db.clone(),
        session.root(),
        poll_interval,
    );
    let scheduler_shutdown = shutdown.clone();
    let scheduler_handle = tokio::spawn(async move { sched.run(scheduler_shutdown).await });

    // The scheduler only returns once shutdown has been requested.
    if let Err(e) = scheduler_handle.await {
        warn!("scheduler task error: {}", e);
    }
    info!("Shutdown signal received, stopping...");

    // In-flight jobs run to completion; give them a bounded window.
    match tokio::time::timeout(Duration::from_secs(30), runner_handle).await {
        Ok(Ok(Ok(stats))) => info!(
            applied = stats.applied,
            failed = stats.failed,
            "job runner stopped gracefully"
        ),
        Ok(Ok(Err(e))) => warn!("job runner error: {}", e),
        Ok(Err(e)) => warn!("job runner task error: {}", e),
        Err(_) => warn!("job runner did not stop within 30s, forcing shutdown"),
    }

    match tokio::time::timeout(Duration::from_secs(5), audit_handle).await {
        Ok(Ok(written)) => info!(written, "audit recorder flushed"),
        Ok(Err(e)) => warn!("audit recorder task error: {}", e),
        Err(_) => warn!("audit recorder did not stop within 5s"),
    }

    info!("treesync daemon stopped.");
    Ok(())
}

/// Install the stdout subscriber plus an optional daily-rolling file layer.
fn init_tracing(daemon: &DaemonConfig, log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = match &daemon.log_file {
        Some(log_file) => {
            std::fs::create_dir_all(&daemon.data_dir)
                .context("failed to create data directory")?;
            let appender = RollingFileAppender::new(Rotation::DAILY, &daemon.data_dir, log_file);
            Some(
                fmt::layer()
                    .with_target(true)
                    .with_ansi(false)
                    .with_writer(appender),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(file_layer)
        .try_init()
        .context("failed to initialize tracing")?;
    Ok(())
}
