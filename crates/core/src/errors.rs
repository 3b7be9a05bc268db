//! Error types for the treesync core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.

use thiserror::Error;

use crate::diff::DiffKind;
use crate::metadata::SyncAction;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// Storage errors
// ---------------------------------------------------------------------------

/// Errors raised by a [`Storage`](crate::storage::Storage) backend.
///
/// Every variant carries the offending path so that callers can report it
/// without additional bookkeeping.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("'{path}' does not exist: {message}")]
    NotExists { path: String, message: String },

    #[error("'{path}' is not a file: {message}")]
    NotFile { path: String, message: String },

    #[error("'{path}' is not a directory: {message}")]
    NotDirectory { path: String, message: String },

    #[error("'{path}' already exists: {message}")]
    AlreadyExists { path: String, message: String },

    #[error("no permission for '{path}': {message}")]
    NoPermissions { path: String, message: String },

    #[error("operation not supported on '{path}': {message}")]
    NotSupported { path: String, message: String },

    #[error("storage not ready for '{path}': {message}")]
    NotReady { path: String, message: String },

    /// An I/O failure that does not map onto the taxonomy above.
    #[error("storage I/O error at '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    pub fn not_exists(path: impl Into<String>) -> Self {
        Self::NotExists {
            path: path.into(),
            message: "no such entry".into(),
        }
    }

    pub fn not_file(path: impl Into<String>) -> Self {
        Self::NotFile {
            path: path.into(),
            message: "entry is a directory".into(),
        }
    }

    pub fn not_directory(path: impl Into<String>) -> Self {
        Self::NotDirectory {
            path: path.into(),
            message: "entry is a file".into(),
        }
    }

    pub fn already_exists(path: impl Into<String>) -> Self {
        Self::AlreadyExists {
            path: path.into(),
            message: "entry already exists".into(),
        }
    }

    /// Map an `std::io::Error` onto the storage taxonomy.
    pub fn from_io(path: impl Into<String>, err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let path = path.into();
        let message = err.to_string();
        match err.kind() {
            ErrorKind::NotFound => Self::NotExists { path, message },
            ErrorKind::AlreadyExists => Self::AlreadyExists { path, message },
            ErrorKind::PermissionDenied => Self::NoPermissions { path, message },
            ErrorKind::Unsupported => Self::NotSupported { path, message },
            _ => Self::Io { path, source: err },
        }
    }

    /// The path the error refers to.
    pub fn path(&self) -> &str {
        match self {
            Self::NotExists { path, .. }
            | Self::NotFile { path, .. }
            | Self::NotDirectory { path, .. }
            | Self::AlreadyExists { path, .. }
            | Self::NoPermissions { path, .. }
            | Self::NotSupported { path, .. }
            | Self::NotReady { path, .. }
            | Self::Io { path, .. } => path,
        }
    }

    /// Short machine-readable code, e.g. for audit records.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotExists { .. } => "not_exists",
            Self::NotFile { .. } => "not_file",
            Self::NotDirectory { .. } => "not_directory",
            Self::AlreadyExists { .. } => "already_exists",
            Self::NoPermissions { .. } => "no_permissions",
            Self::NotSupported { .. } => "not_supported",
            Self::NotReady { .. } => "not_ready",
            Self::Io { .. } => "io",
        }
    }

    pub fn is_not_exists(&self) -> bool {
        matches!(self, Self::NotExists { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}

// ---------------------------------------------------------------------------
// Metadata errors
// ---------------------------------------------------------------------------

/// Errors from the sync metadata store and its persistence backends.
#[derive(Debug, Error)]
pub enum MetadataError {
    /// The persisted metadata document could not be (de)serialized.
    #[error("metadata serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An entry violates the `action`/`diff` pairing invariant.
    #[error("corrupt metadata for '{path}': {detail}")]
    Corrupt { path: String, detail: String },

    /// Reading or writing the metadata file in storage failed.
    #[error("metadata storage error: {0}")]
    Storage(#[from] StorageError),

    /// Reading or writing the SQLite backend failed.
    #[error("metadata database error: {0}")]
    Database(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// Sync errors
// ---------------------------------------------------------------------------

/// Errors from the reconciliation orchestrator and the job runner.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Another diff update is already in progress.
    #[error("diff update already in progress (started at {started_at})")]
    AlreadyRunning { started_at: String },

    /// The job runner is already executing a run.
    #[error("job runner is already running")]
    RunnerBusy,

    /// The action is not legal for the diff kind.
    #[error("action '{action}' cannot resolve a '{diff}' diff at '{path}'")]
    InvalidAction {
        path: String,
        action: SyncAction,
        diff: DiffKind,
    },

    /// A deletion job was found for a path with no synced state.
    #[error("refusing to delete '{path}': no synced state recorded")]
    DeleteWithoutSynced { path: String },

    /// The source side changed between acceptance and execution.
    #[error("source content of '{path}' changed since acceptance (expected {expected}, found {found})")]
    SourceChanged {
        path: String,
        expected: String,
        found: String,
    },

    /// A directory on the target still holds entries the job may not remove.
    #[error("'{path}' on the target still holds {remaining} unsynced entries")]
    TargetNotEmpty { path: String, remaining: usize },

    /// A spawned job task panicked or was aborted.
    #[error("job task for '{path}' failed: {detail}")]
    JobTask { path: String, detail: String },

    #[error("sync storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("sync metadata error: {0}")]
    Metadata(#[from] MetadataError),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// The configuration could not be rendered as TOML.
    #[error("configuration serialize error: {0}")]
    SerializeError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Database errors
// ---------------------------------------------------------------------------

/// Errors from the SQLite persistence layer.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Underlying rusqlite error.
    #[error("database error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    /// A migration failed.
    #[error("database migration failed (version {version}): {detail}")]
    MigrationFailed { version: u32, detail: String },

    /// A stored row could not be decoded.
    #[error("database row decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// The blocking database task could not be joined.
    #[error("database task failed: {0}")]
    Task(String),

    /// Generic I/O error (e.g. file permissions).
    #[error("database I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
