//! The storage capability surface consumed from each side of a sync pair.
//!
//! The engine never touches a backend directly: it talks to `dyn Storage`
//! through the operations below. Two reference backends ship with the crate,
//! [`MemoryStorage`] for tests and [`FsStorage`] for directories on disk.

pub mod fs;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::StorageError;

pub use fs::FsStorage;
pub use memory::MemoryStorage;

/// Metadata about a single entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryStats {
    pub is_directory: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl EntryStats {
    pub fn directory() -> Self {
        Self {
            is_directory: true,
            size: None,
            created_at: None,
            updated_at: None,
        }
    }

    pub fn file(size: u64) -> Self {
        Self {
            is_directory: false,
            size: Some(size),
            created_at: None,
            updated_at: None,
        }
    }
}

/// Uniform read/write/stat/list contract over a hierarchical store.
///
/// All paths are normalized absolute paths (see [`crate::path`]).
#[async_trait]
pub trait Storage: Send + Sync {
    /// Short human-readable description used in logs.
    fn describe(&self) -> String;

    async fn exists(&self, path: &str) -> Result<bool, StorageError>;

    /// Fails with `NotExists` for a missing entry.
    async fn stats(&self, path: &str) -> Result<EntryStats, StorageError>;

    /// Fails with `NotExists` or `NotFile`.
    async fn read(&self, path: &str) -> Result<Vec<u8>, StorageError>;

    /// Create or replace a file, creating missing parent directories.
    async fn write_or_create(&self, path: &str, data: &[u8]) -> Result<(), StorageError>;

    /// Create a directory (and missing parents). Fails with `AlreadyExists`.
    async fn create_dir(&self, path: &str) -> Result<(), StorageError>;

    /// Remove a file or a whole directory tree. Fails with `NotExists` or
    /// `NoPermissions`.
    async fn remove(&self, path: &str) -> Result<(), StorageError>;

    /// Names of the direct children of a directory.
    async fn children(&self, path: &str) -> Result<Vec<String>, StorageError>;

    /// Move a file over `to`, replacing an existing file there. Missing
    /// parents of `to` are created. Fails with `NotExists` or `NotFile`.
    async fn rename(&self, from: &str, to: &str) -> Result<(), StorageError>;
}
