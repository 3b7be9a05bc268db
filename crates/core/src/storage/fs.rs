//! Filesystem storage backend rooted at a directory.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::{EntryStats, Storage};
use crate::errors::StorageError;
use crate::path::{self, ROOT};

/// A storage tree backed by a directory on disk.
///
/// Storage path `/a/b` maps to `<root>/a/b`. Symlinks are followed by the
/// underlying `tokio::fs` calls.
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    /// Open a storage rooted at `root`, creating the directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|e| StorageError::from_io(root.display().to_string(), e))?;
        debug!(root = %root.display(), "opened filesystem storage");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let mut full = self.root.clone();
        for segment in path::segments(path) {
            full.push(segment);
        }
        full
    }
}

fn to_utc(time: std::io::Result<std::time::SystemTime>) -> Option<DateTime<Utc>> {
    time.ok().map(DateTime::<Utc>::from)
}

#[async_trait]
impl Storage for FsStorage {
    fn describe(&self) -> String {
        format!("fs:{}", self.root.display())
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        tokio::fs::try_exists(self.resolve(path))
            .await
            .map_err(|e| StorageError::from_io(path, e))
    }

    async fn stats(&self, path: &str) -> Result<EntryStats, StorageError> {
        let meta = tokio::fs::metadata(self.resolve(path))
            .await
            .map_err(|e| StorageError::from_io(path, e))?;
        Ok(EntryStats {
            is_directory: meta.is_dir(),
            size: if meta.is_dir() { None } else { Some(meta.len()) },
            created_at: to_utc(meta.created()),
            updated_at: to_utc(meta.modified()),
        })
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let full = self.resolve(path);
        let meta = tokio::fs::metadata(&full)
            .await
            .map_err(|e| StorageError::from_io(path, e))?;
        if meta.is_dir() {
            return Err(StorageError::not_file(path));
        }
        tokio::fs::read(&full)
            .await
            .map_err(|e| StorageError::from_io(path, e))
    }

    async fn write_or_create(&self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::from_io(path, e))?;
        }
        if tokio::fs::metadata(&full).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Err(StorageError::not_file(path));
        }
        tokio::fs::write(&full, data)
            .await
            .map_err(|e| StorageError::from_io(path, e))
    }

    async fn create_dir(&self, path: &str) -> Result<(), StorageError> {
        let full = self.resolve(path);
        if tokio::fs::try_exists(&full).await.unwrap_or(false) {
            return Err(StorageError::already_exists(path));
        }
        tokio::fs::create_dir_all(&full)
            .await
            .map_err(|e| StorageError::from_io(path, e))
    }

    async fn remove(&self, path: &str) -> Result<(), StorageError> {
        if path == ROOT {
            return Err(StorageError::NoPermissions {
                path: path.to_string(),
                message: "cannot remove the storage root".into(),
            });
        }
        let full = self.resolve(path);
        let meta = tokio::fs::symlink_metadata(&full)
            .await
            .map_err(|e| StorageError::from_io(path, e))?;
        let result = if meta.is_dir() {
            tokio::fs::remove_dir_all(&full).await
        } else {
            tokio::fs::remove_file(&full).await
        };
        result.map_err(|e| StorageError::from_io(path, e))
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, StorageError> {
        let full = self.resolve(path);
        let meta = tokio::fs::metadata(&full)
            .await
            .map_err(|e| StorageError::from_io(path, e))?;
        if !meta.is_dir() {
            return Err(StorageError::not_directory(path));
        }

        let mut names = Vec::new();
        let mut dir = tokio::fs::read_dir(&full)
            .await
            .map_err(|e| StorageError::from_io(path, e))?;
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| StorageError::from_io(path, e))?
        {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let source = self.resolve(from);
        let meta = tokio::fs::metadata(&source)
            .await
            .map_err(|e| StorageError::from_io(from, e))?;
        if meta.is_dir() {
            return Err(StorageError::not_file(from));
        }
        let dest = self.resolve(to);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::from_io(to, e))?;
        }
        tokio::fs::rename(&source, &dest)
            .await
            .map_err(|e| StorageError::from_io(to, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_round_trip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::open(dir.path()).unwrap();

        storage.write_or_create("/docs/a.txt", b"hello").await.unwrap();
        assert!(dir.path().join("docs/a.txt").exists());
        assert_eq!(storage.read("/docs/a.txt").await.unwrap(), b"hello");

        let stats = storage.stats("/docs").await.unwrap();
        assert!(stats.is_directory);
        assert_eq!(storage.stats("/docs/a.txt").await.unwrap().size, Some(5));
        assert_eq!(storage.children("/docs").await.unwrap(), vec!["a.txt"]);
    }

    #[tokio::test]
    async fn test_errors_map_to_taxonomy() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::open(dir.path()).unwrap();
        storage.create_dir("/d").await.unwrap();

        assert!(storage.stats("/missing").await.unwrap_err().is_not_exists());
        assert_eq!(storage.read("/d").await.unwrap_err().code(), "not_file");
        assert!(storage.create_dir("/d").await.unwrap_err().is_already_exists());
        assert!(storage.remove("/missing").await.unwrap_err().is_not_exists());
    }

    #[tokio::test]
    async fn test_rename_moves_over_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::open(dir.path()).unwrap();
        storage.write_or_create("/a.tmp", b"new").await.unwrap();
        storage.write_or_create("/sub/a", b"old").await.unwrap();

        storage.rename("/a.tmp", "/sub/a").await.unwrap();

        assert_eq!(storage.read("/sub/a").await.unwrap(), b"new");
        assert!(!dir.path().join("a.tmp").exists());
    }

    #[tokio::test]
    async fn test_remove_directory_tree() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::open(dir.path()).unwrap();
        storage.write_or_create("/d/sub/x", b"1").await.unwrap();

        storage.remove("/d").await.unwrap();
        assert!(!storage.exists("/d").await.unwrap());
    }
}
