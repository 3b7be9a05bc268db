//! Content identity: a content-addressed fingerprint of a storage entry.
//!
//! Files are identified by the hex SHA-256 of their exact bytes, directories
//! by the fixed [`DIRECTORY_MARKER`], and missing entries by `None`.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::StorageError;
use crate::storage::Storage;

/// Identity value reserved for directories. Never a valid hex digest.
pub const DIRECTORY_MARKER: &str = "<directory>";

/// Opaque fingerprint of an entry's content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentIdentity(String);

impl ContentIdentity {
    /// The identity shared by every directory.
    pub fn directory() -> Self {
        Self(DIRECTORY_MARKER.to_string())
    }

    /// Fingerprint raw bytes.
    pub fn of_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hex::encode(hasher.finalize()))
    }

    /// Wrap an already computed identity string.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn is_directory(&self) -> bool {
        self.0 == DIRECTORY_MARKER
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First characters of a file digest, for display.
    pub fn short(&self) -> &str {
        if self.is_directory() {
            &self.0
        } else {
            &self.0[..self.0.len().min(10)]
        }
    }
}

impl fmt::Display for ContentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compute the identity of `path` in `storage`.
///
/// `NotExists` is recovered into `Ok(None)`, including the case where the
/// entry vanishes between the stat and the read.
pub async fn identity(
    storage: &dyn Storage,
    path: &str,
) -> Result<Option<ContentIdentity>, StorageError> {
    let stats = match storage.stats(path).await {
        Ok(stats) => stats,
        Err(e) if e.is_not_exists() => return Ok(None),
        Err(e) => return Err(e),
    };

    if stats.is_directory {
        return Ok(Some(ContentIdentity::directory()));
    }

    match storage.read(path).await {
        Ok(data) => Ok(Some(ContentIdentity::of_bytes(&data))),
        Err(e) if e.is_not_exists() => Ok(None),
        Err(e) => Err(e),
    }
}
