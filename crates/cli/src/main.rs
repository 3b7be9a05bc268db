//! treesync command-line management tool.
//!
//! Provides subcommands for generating and validating configuration,
//! inspecting and resolving diffs between the two trees, running a
//! reconciliation pass, and viewing status, job errors, and the audit log.

mod report;
mod resolve;
mod setup;
mod style;
mod sync;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use treesync_core::config::AppConfig;
use treesync_core::db::queries::AuditEntry;
use treesync_core::metadata::SyncAction;
use treesync_core::models::SyncEvent;
use treesync_core::SyncSession;

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// treesync command-line management tool.
#[derive(Parser, Debug)]
#[command(
    name = "treesync",
    version,
    about = "Inspect and reconcile two storage trees"
)]
struct Cli {
    /// Path to the TOML configuration file
    /// [default: ~/.config/treesync/config.toml].
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Log level for diagnostic output on stderr.
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a configuration file for a local/remote pair.
    Init {
        /// Local tree. Prompted for when omitted.
        #[arg(long)]
        local: Option<PathBuf>,

        /// Remote tree. Prompted for when omitted.
        #[arg(long)]
        remote: Option<PathBuf>,

        /// Overwrite an existing file without asking.
        #[arg(long)]
        force: bool,
    },

    /// Validate the configuration file.
    Validate,

    /// Refresh and list the differences between the two trees.
    Diff {
        /// Reconciliation root (defaults to `sync.root`).
        #[arg(long)]
        root: Option<String>,

        /// Only show conflicting entries.
        #[arg(long)]
        conflicts: bool,
    },

    /// Record a resolution for one or more paths.
    Accept {
        /// Paths to resolve, e.g. `/docs/readme.md`.
        #[arg(required_unless_present = "all_clean")]
        paths: Vec<String>,

        /// Resolution to record.
        #[arg(long, value_enum, default_value = "auto")]
        action: Resolution,

        /// Accept every non-conflicting diff.
        #[arg(long, conflicts_with = "paths")]
        all_clean: bool,
    },

    /// Walk through undecided conflicts interactively.
    Resolve,

    /// Run one reconciliation pass and apply every pending job.
    Sync {
        /// Reconciliation root (defaults to `sync.root`).
        #[arg(long)]
        root: Option<String>,

        /// Apply only what has already been accepted.
        #[arg(long)]
        no_refresh: bool,
    },

    /// Show the reconciliation status.
    Status,

    /// Show recent job failures.
    Errors {
        /// Maximum number of entries to show.
        #[arg(short, long, default_value = "20")]
        limit: u32,
    },

    /// Show recent audit log entries.
    Audit {
        /// Maximum number of entries to show.
        #[arg(short, long, default_value = "20")]
        limit: u32,

        /// Only show entries with this action, e.g. `job_failed`.
        #[arg(long)]
        action: Option<String>,
    },
}

/// Resolution names accepted on the command line.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Resolution {
    /// Follow the side that changed (non-conflicting diffs only).
    Auto,
    /// Keep the local version.
    Local,
    /// Keep the remote version.
    Remote,
    /// Withdraw an earlier resolution.
    Undecided,
}

impl From<Resolution> for SyncAction {
    fn from(resolution: Resolution) -> Self {
        match resolution {
            Resolution::Auto => SyncAction::AcceptAuto,
            Resolution::Local => SyncAction::AcceptLocal,
            Resolution::Remote => SyncAction::AcceptRemote,
            Resolution::Undecided => SyncAction::Undecided,
        }
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Minimal logging for CLI
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", style::error(&format!("Error: {:#}", e)));
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = resolve_config_path(cli.config.as_deref());

    match cli.command {
        Commands::Init {
            local,
            remote,
            force,
        } => setup::run_init(&config_path, local, remote, force),
        Commands::Validate => setup::run_validate(&config_path),
        Commands::Diff { root, conflicts } => {
            let session = open_session(&config_path).await?;
            resolve::run_diff(&session, root.as_deref(), conflicts).await
        }
        Commands::Accept {
            paths,
            action,
            all_clean,
        } => {
            let session = open_session(&config_path).await?;
            resolve::run_accept(&session, &paths, action.into(), all_clean).await
        }
        Commands::Resolve => {
            let session = open_session(&config_path).await?;
            resolve::run_resolve(&session).await
        }
        Commands::Sync { root, no_refresh } => {
            let session = open_session(&config_path).await?;
            sync::run_sync(&session, root.as_deref(), no_refresh).await
        }
        Commands::Status => {
            let session = open_session(&config_path).await?;
            report::run_status(&session, &config_path)
        }
        Commands::Errors { limit } => {
            let config = load_config(&config_path)?;
            report::run_errors(&config, limit)
        }
        Commands::Audit { limit, action } => {
            let config = load_config(&config_path)?;
            report::run_audit(&config, limit, action.as_deref())
        }
    }
}

// ---------------------------------------------------------------------------
// Config helpers
// ---------------------------------------------------------------------------

/// The `--config` value with `~` expanded, or the per-user default.
fn resolve_config_path(arg: Option<&str>) -> PathBuf {
    match arg {
        Some(path) => PathBuf::from(expand_tilde(path)),
        None => dirs::config_dir()
            .map(|dir| dir.join("treesync").join("config.toml"))
            .unwrap_or_else(|| PathBuf::from("treesync.toml")),
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return format!("{}/{}", home.display(), rest);
        }
    }
    path.to_string()
}

fn load_config(path: &Path) -> Result<AppConfig> {
    let config = AppConfig::load_from_file(path).context("failed to load configuration file")?;
    config.validate().context("invalid configuration")?;
    Ok(config)
}

async fn open_session(path: &Path) -> Result<SyncSession> {
    let config = load_config(path)?;
    SyncSession::open(config)
        .await
        .context("failed to open sync session")
}

/// Write the events emitted so far to the audit log.
///
/// The CLI has no long-running recorder, so commands drain their
/// subscription once the operation is done.
fn record_events(
    session: &SyncSession,
    events: &mut tokio::sync::broadcast::Receiver<SyncEvent>,
) -> usize {
    use tokio::sync::broadcast::error::TryRecvError;

    let mut written = 0;
    loop {
        match events.try_recv() {
            Ok(event) => {
                let Some(entry) = AuditEntry::from_event(&event) else {
                    continue;
                };
                match session.db.insert_audit_entry(&entry) {
                    Ok(_) => written += 1,
                    Err(e) => tracing::warn!(error = %e, "failed to write audit entry"),
                }
            }
            Err(TryRecvError::Lagged(missed)) => {
                tracing::warn!(missed, "audit events dropped");
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
        }
    }
    written
}
