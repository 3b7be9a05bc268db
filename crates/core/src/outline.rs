//! Recursive snapshots ("outlines") of one side of a sync pair.
//!
//! The orchestrator diffs the local side by walking it live and the remote
//! side through an outline, which is captured once per pass. [`Outline`] also
//! forwards the per-entry primitives the orchestrator needs on that side.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::debug;

use crate::errors::StorageError;
use crate::identity::ContentIdentity;
use crate::ignore::IgnorePolicy;
use crate::path;
use crate::storage::{EntryStats, Storage};

/// Snapshot of one entry and, for directories, its surviving children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutlineEntry {
    pub name: String,
    pub identity: ContentIdentity,
    pub stats: EntryStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<OutlineEntry>>,
}

impl OutlineEntry {
    /// Every `(path, identity)` pair in this subtree, parents first.
    ///
    /// `base` is the path this entry was captured at.
    pub fn flatten(&self, base: &str) -> Vec<(String, ContentIdentity)> {
        let mut out = Vec::new();
        self.flatten_into(base.to_string(), &mut out);
        out
    }

    fn flatten_into(&self, at: String, out: &mut Vec<(String, ContentIdentity)>) {
        if let Some(children) = &self.children {
            out.push((at.clone(), self.identity.clone()));
            for child in children {
                child.flatten_into(path::join(&at, &child.name), out);
            }
        } else {
            out.push((at, self.identity.clone()));
        }
    }

    /// Number of entries in this subtree, including itself.
    pub fn count(&self) -> usize {
        1 + self
            .children
            .iter()
            .flatten()
            .map(OutlineEntry::count)
            .sum::<usize>()
    }
}

type OutlineFuture = Pin<Box<dyn Future<Output = Result<Option<OutlineEntry>, StorageError>> + Send>>;

/// Builds outlines of, and forwards mutations to, one storage.
#[derive(Clone)]
pub struct Outline {
    storage: Arc<dyn Storage>,
    policy: Arc<IgnorePolicy>,
}

impl Outline {
    /// Ignored paths are not descended into while building.
    pub fn new(storage: Arc<dyn Storage>, policy: Arc<IgnorePolicy>) -> Self {
        Self { storage, policy }
    }

    /// Capture the subtree at `path`; `None` if it does not exist.
    pub async fn build(&self, path: &str) -> Result<Option<OutlineEntry>, StorageError> {
        let outline = build_node(self.storage.clone(), self.policy.clone(), path.to_string()).await?;
        debug!(
            storage = %self.storage.describe(),
            path,
            entries = outline.as_ref().map(OutlineEntry::count).unwrap_or(0),
            "built outline"
        );
        Ok(outline)
    }

    pub async fn stats(&self, path: &str) -> Result<EntryStats, StorageError> {
        self.storage.stats(path).await
    }

    pub async fn children(&self, path: &str) -> Result<Vec<String>, StorageError> {
        self.storage.children(path).await
    }

    pub async fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        self.storage.read(path).await
    }

    // TODO: take the expected target identity and let the backend reject the
    // write when it no longer matches (compare-and-swap).
    pub async fn write(&self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        self.storage.write_or_create(path, data).await
    }

    pub async fn create_dir(&self, path: &str) -> Result<(), StorageError> {
        self.storage.create_dir(path).await
    }

    pub async fn remove(&self, path: &str) -> Result<(), StorageError> {
        self.storage.remove(path).await
    }
}

fn build_node(storage: Arc<dyn Storage>, policy: Arc<IgnorePolicy>, at: String) -> OutlineFuture {
    Box::pin(async move {
        let stats = match storage.stats(&at).await {
            Ok(stats) => stats,
            Err(e) if e.is_not_exists() => return Ok(None),
            Err(e) => return Err(e),
        };

        let name = path::name(&at).to_string();

        if !stats.is_directory {
            let data = match storage.read(&at).await {
                Ok(data) => data,
                Err(e) if e.is_not_exists() => return Ok(None),
                Err(e) => return Err(e),
            };
            return Ok(Some(OutlineEntry {
                name,
                identity: ContentIdentity::of_bytes(&data),
                stats,
                children: None,
            }));
        }

        let names = match storage.children(&at).await {
            Ok(names) => names,
            Err(e) if e.is_not_exists() => return Ok(None),
            Err(e) => return Err(e),
        };

        let mut tasks = JoinSet::new();
        for child in names {
            let child_path = path::join(&at, &child);
            if policy.is_ignored(&child_path) {
                continue;
            }
            tasks.spawn(build_node(storage.clone(), policy.clone(), child_path));
        }

        let mut children = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let child = joined.map_err(|e| StorageError::Io {
                path: at.clone(),
                source: std::io::Error::other(e),
            })??;
            if let Some(child) = child {
                children.push(child);
            }
        }
        children.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(Some(OutlineEntry {
            name,
            identity: ContentIdentity::directory(),
            stats,
            children: Some(children),
        }))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn outline_of(storage: MemoryStorage) -> Outline {
        Outline::new(Arc::new(storage), Arc::new(IgnorePolicy::default()))
    }

    #[tokio::test]
    async fn test_missing_path_has_no_outline() {
        let outline = outline_of(MemoryStorage::new("r"));
        assert_eq!(outline.build("/nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_builds_nested_tree() {
        let storage = MemoryStorage::new("r");
        storage.insert_file("/docs/b.txt", "b");
        storage.insert_file("/docs/a.txt", "a");
        storage.insert_dir("/empty");
        let outline = outline_of(storage);

        let root = outline.build("/").await.unwrap().unwrap();
        assert!(root.identity.is_directory());
        let children = root.children.as_ref().unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].name, "docs");

        let docs = children[0].children.as_ref().unwrap();
        assert_eq!(docs[0].name, "a.txt");
        assert_eq!(docs[0].identity, ContentIdentity::of_bytes(b"a"));
        assert_eq!(root.count(), 5);
    }

    #[tokio::test]
    async fn test_flatten_lists_parents_first() {
        let storage = MemoryStorage::new("r");
        storage.insert_file("/d/f.txt", "f");
        let outline = outline_of(storage);

        let root = outline.build("/").await.unwrap().unwrap();
        let paths: Vec<String> = root.flatten("/").into_iter().map(|(p, _)| p).collect();
        assert_eq!(paths, vec!["/", "/d", "/d/f.txt"]);
    }

    #[tokio::test]
    async fn test_ignored_children_are_not_visited() {
        let storage = MemoryStorage::new("r");
        storage.insert_file("/.treesync/config.json", "{}");
        storage.insert_file("/app/node_modules/x.js", "x");
        storage.insert_file("/app/main.js", "m");
        let outline = outline_of(storage);

        let root = outline.build("/").await.unwrap().unwrap();
        let paths: Vec<String> = root.flatten("/").into_iter().map(|(p, _)| p).collect();
        assert_eq!(paths, vec!["/", "/app", "/app/main.js"]);
    }
}
