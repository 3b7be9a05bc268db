//! treesync core library.
//!
//! This crate reconciles two independently mutable storage trees: it
//! fingerprints content, classifies three-way diffs against the last agreed
//! state, records resolutions, and applies them with a bounded job runner.

pub mod config;
pub mod db;
pub mod diff;
pub mod errors;
pub mod identity;
pub mod ignore;
pub mod metadata;
pub mod models;
pub mod orchestrator;
pub mod outline;
pub mod path;
pub mod runner;
pub mod session;
pub mod storage;
pub mod storage_id;

// Re-exports for convenience.
pub use config::AppConfig;
pub use db::Database;
pub use diff::{DiffEntry, DiffKind};
pub use identity::ContentIdentity;
pub use metadata::{EntrySyncMetadata, SyncAction, SyncMetadataStore};
pub use orchestrator::SyncOrchestrator;
pub use runner::{JobRunner, RunMode, RunnerConfig};
pub use session::SyncSession;
pub use storage::{FsStorage, MemoryStorage, Storage};
