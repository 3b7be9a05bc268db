//! TOML-based configuration for treesync.
//!
//! One file describes one sync pair: where the local and remote trees live,
//! how the daemon polls, and how the runner and auto-accept rules behave.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::diff::DiffKind;
use crate::errors::ConfigError;
use crate::ignore::IgnorePolicy;
use crate::metadata::SyncAction;
use crate::orchestrator::{check_action, default_auto_accept_rules};
use crate::runner::RunnerConfig;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level application configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Daemon / polling settings.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// The local tree.
    pub local: TreeConfig,

    /// The remote tree.
    pub remote: TreeConfig,

    /// Reconciliation behaviour.
    #[serde(default)]
    pub sync: SyncConfig,
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

/// Daemon / polling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Seconds between reconciliation passes (default 60).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory for persistent data (database, log files).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Daily-rolling log file name inside `data_dir`; stdout only if unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

fn default_poll_interval() -> u64 {
    60
}
fn default_log_level() -> String {
    "info".into()
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/treesync")
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            log_level: default_log_level(),
            data_dir: default_data_dir(),
            log_file: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Trees
// ---------------------------------------------------------------------------

/// Location of one side of the sync pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeConfig {
    /// Directory served by the filesystem storage backend.
    pub path: PathBuf,
}

// ---------------------------------------------------------------------------
// Sync
// ---------------------------------------------------------------------------

/// Where per-path sync metadata is persisted.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MetadataBackendKind {
    /// JSON file under the reserved subtree of the local tree.
    #[default]
    Storage,
    /// `sync_metadata` table of the SQLite database in `data_dir`.
    Sqlite,
}

/// Reconciliation behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Subtree reconciled by each pass.
    #[serde(default = "default_root")]
    pub root: String,

    /// Maximum number of jobs in flight.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Seconds a path cools down after a failed job.
    #[serde(default = "default_backoff")]
    pub backoff_secs: u64,

    /// Seconds a path cools down after a successful job.
    #[serde(default)]
    pub success_backoff_secs: u64,

    /// Seconds the runner sleeps when nothing is runnable.
    #[serde(default = "default_idle_interval")]
    pub idle_interval_secs: u64,

    #[serde(default)]
    pub metadata_backend: MetadataBackendKind,

    /// Extra glob patterns excluded from reconciliation.
    #[serde(default)]
    pub ignore_patterns: Vec<String>,

    /// Diff kind (snake_case) to the action recorded automatically.
    #[serde(default = "default_auto_accept")]
    pub auto_accept: BTreeMap<String, SyncAction>,
}

fn default_root() -> String {
    "/".into()
}
fn default_concurrency() -> usize {
    3
}
fn default_backoff() -> u64 {
    30
}
fn default_idle_interval() -> u64 {
    5
}
fn default_auto_accept() -> BTreeMap<String, SyncAction> {
    default_auto_accept_rules()
        .into_iter()
        .map(|(kind, action)| (kind.as_str().to_string(), action))
        .collect()
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            concurrency: default_concurrency(),
            backoff_secs: default_backoff(),
            success_backoff_secs: 0,
            idle_interval_secs: default_idle_interval(),
            metadata_backend: MetadataBackendKind::default(),
            ignore_patterns: Vec::new(),
            auto_accept: default_auto_accept(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading & validation
// ---------------------------------------------------------------------------

impl AppConfig {
    /// A configuration with defaults for everything but the two trees.
    pub fn new(local: impl Into<PathBuf>, remote: impl Into<PathBuf>) -> Self {
        Self {
            daemon: DaemonConfig::default(),
            local: TreeConfig { path: local.into() },
            remote: TreeConfig {
                path: remote.into(),
            },
            sync: SyncConfig::default(),
        }
    }

    /// Load an [`AppConfig`] from a TOML file at the given path.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Convenience: load and validate in one call.
    pub fn load_and_validate<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load_from_file(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))
    }

    /// Write as TOML, creating parent directories.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_toml()?)?;
        info!(path = %path.display(), "configuration written");
        Ok(())
    }

    /// Validate that all required fields are present and sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.local.path.as_os_str().is_empty() {
            return Err(invalid("local.path", "local path must not be empty"));
        }
        if self.remote.path.as_os_str().is_empty() {
            return Err(invalid("remote.path", "remote path must not be empty"));
        }
        if self.local.path == self.remote.path {
            return Err(invalid(
                "remote.path",
                "remote path must differ from the local path",
            ));
        }
        if self.daemon.poll_interval_secs == 0 {
            return Err(invalid("daemon.poll_interval_secs", "poll interval must be > 0"));
        }
        if self.sync.concurrency == 0 {
            return Err(invalid("sync.concurrency", "concurrency must be > 0"));
        }
        if !self.sync.root.starts_with('/') {
            return Err(invalid("sync.root", "root must be an absolute path"));
        }
        for (name, action) in &self.sync.auto_accept {
            let field = format!("sync.auto_accept.{}", name);
            let kind = DiffKind::parse(name)
                .ok_or_else(|| invalid(&field, &format!("unknown diff kind '{}'", name)))?;
            check_action("*", kind, *action).map_err(|_| {
                invalid(
                    &field,
                    &format!("action '{}' cannot resolve '{}' diffs", action, kind),
                )
            })?;
        }
        Ok(())
    }

    /// Parsed auto-accept rules; unknown kinds are skipped.
    pub fn auto_accept_rules(&self) -> HashMap<DiffKind, SyncAction> {
        self.sync
            .auto_accept
            .iter()
            .filter_map(|(name, action)| DiffKind::parse(name).map(|kind| (kind, *action)))
            .collect()
    }

    pub fn ignore_policy(&self) -> IgnorePolicy {
        IgnorePolicy::new(self.sync.ignore_patterns.clone())
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            concurrency: self.sync.concurrency,
            backoff: Duration::from_secs(self.sync.backoff_secs),
            success_backoff: Duration::from_secs(self.sync.success_backoff_secs),
            idle_interval: Duration::from_secs(self.sync.idle_interval_secs),
        }
    }

    /// Location of the SQLite database.
    pub fn database_path(&self) -> PathBuf {
        self.daemon.data_dir.join("treesync.db")
    }
}

fn invalid(field: &str, detail: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.into(),
        detail: detail.into(),
    }
}
