//! Stable random identifier stored inside each storage.
//!
//! The record lives at `/.treesync/config.json`. One local storage can sync
//! against several remotes because its metadata files are namespaced by the
//! remote's identifier.

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::errors::{MetadataError, StorageError};
use crate::ignore::METADATA_DIR;
use crate::path;
use crate::storage::Storage;

/// Companion config record stored in the reserved subtree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfigRecord {
    pub storage_id: String,
}

/// Path of the config record.
pub fn config_record_path() -> String {
    path::join(METADATA_DIR, "config.json")
}

/// Path of the metadata file used when syncing against `remote_id`.
pub fn metadata_file_path(remote_id: &str) -> String {
    path::join(METADATA_DIR, &format!("sync-{}.json", remote_id))
}

/// Read the storage id, creating and persisting a fresh one on first use.
pub async fn ensure_storage_id(storage: &dyn Storage) -> Result<String, MetadataError> {
    let record_path = config_record_path();
    match storage.read(&record_path).await {
        Ok(bytes) => {
            let record: StorageConfigRecord = serde_json::from_slice(&bytes)?;
            Ok(record.storage_id)
        }
        Err(StorageError::NotExists { .. }) => {
            let record = StorageConfigRecord {
                storage_id: Uuid::new_v4().to_string(),
            };
            let bytes = serde_json::to_vec_pretty(&record)?;
            storage.write_or_create(&record_path, &bytes).await?;
            info!(
                storage = %storage.describe(),
                storage_id = %record.storage_id,
                "assigned new storage id"
            );
            Ok(record.storage_id)
        }
        Err(e) => Err(e.into()),
    }
}
