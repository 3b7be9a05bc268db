//! In-process storage backend.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{EntryStats, Storage};
use crate::errors::StorageError;
use crate::path::{self, ROOT};

#[derive(Debug, Clone)]
enum Node {
    Directory {
        created_at: DateTime<Utc>,
    },
    File {
        data: Vec<u8>,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    },
}

#[derive(Debug)]
struct Inner {
    nodes: BTreeMap<String, Node>,
    read_only: HashSet<String>,
}

/// A tree held entirely in memory.
///
/// Paths marked read-only with [`MemoryStorage::set_read_only`] reject
/// mutations with `NoPermissions`, which lets tests exercise failure paths.
#[derive(Debug)]
pub struct MemoryStorage {
    name: String,
    inner: Mutex<Inner>,
}

impl MemoryStorage {
    pub fn new(name: impl Into<String>) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            ROOT.to_string(),
            Node::Directory {
                created_at: Utc::now(),
            },
        );
        Self {
            name: name.into(),
            inner: Mutex::new(Inner {
                nodes,
                read_only: HashSet::new(),
            }),
        }
    }

    /// Seed a file synchronously (test and demo helper).
    pub fn insert_file(&self, path: &str, data: impl Into<Vec<u8>>) {
        let path = path::normalize(path);
        let mut inner = self.lock();
        ensure_parents(&mut inner.nodes, &path);
        let now = Utc::now();
        inner.nodes.insert(
            path,
            Node::File {
                data: data.into(),
                created_at: now,
                updated_at: now,
            },
        );
    }

    /// Seed a directory synchronously (test and demo helper).
    pub fn insert_dir(&self, path: &str) {
        let path = path::normalize(path);
        let mut inner = self.lock();
        ensure_parents(&mut inner.nodes, &path);
        inner.nodes.insert(
            path,
            Node::Directory {
                created_at: Utc::now(),
            },
        );
    }

    /// Read a file synchronously, `None` if missing or a directory.
    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        match self.lock().nodes.get(&path::normalize(path)) {
            Some(Node::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    /// Toggle write protection for a single path.
    pub fn set_read_only(&self, path: &str, read_only: bool) {
        let path = path::normalize(path);
        let mut inner = self.lock();
        if read_only {
            inner.read_only.insert(path);
        } else {
            inner.read_only.remove(&path);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("memory storage mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

fn ensure_parents(nodes: &mut BTreeMap<String, Node>, path: &str) {
    let mut current = path::parent(path);
    while let Some(dir) = current {
        if nodes.contains_key(&dir) {
            break;
        }
        current = path::parent(&dir);
        nodes.insert(
            dir,
            Node::Directory {
                created_at: Utc::now(),
            },
        );
    }
}

fn check_writable(inner: &Inner, path: &str) -> Result<(), StorageError> {
    if inner.read_only.contains(path) {
        return Err(StorageError::NoPermissions {
            path: path.to_string(),
            message: "path is read-only".into(),
        });
    }
    Ok(())
}

fn check_parent_is_dir(nodes: &BTreeMap<String, Node>, path: &str) -> Result<(), StorageError> {
    let mut current = path::parent(path);
    while let Some(dir) = current {
        match nodes.get(&dir) {
            Some(Node::File { .. }) => return Err(StorageError::not_directory(dir)),
            Some(Node::Directory { .. }) => return Ok(()),
            None => current = path::parent(&dir),
        }
    }
    Ok(())
}

#[async_trait]
impl Storage for MemoryStorage {
    fn describe(&self) -> String {
        format!("memory:{}", self.name)
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        Ok(self.lock().nodes.contains_key(path))
    }

    async fn stats(&self, path: &str) -> Result<EntryStats, StorageError> {
        match self.lock().nodes.get(path) {
            Some(Node::Directory { created_at }) => Ok(EntryStats {
                created_at: Some(*created_at),
                ..EntryStats::directory()
            }),
            Some(Node::File {
                data,
                created_at,
                updated_at,
            }) => Ok(EntryStats {
                is_directory: false,
                size: Some(data.len() as u64),
                created_at: Some(*created_at),
                updated_at: Some(*updated_at),
            }),
            None => Err(StorageError::not_exists(path)),
        }
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        match self.lock().nodes.get(path) {
            Some(Node::File { data, .. }) => Ok(data.clone()),
            Some(Node::Directory { .. }) => Err(StorageError::not_file(path)),
            None => Err(StorageError::not_exists(path)),
        }
    }

    async fn write_or_create(&self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        let mut inner = self.lock();
        check_writable(&inner, path)?;
        check_parent_is_dir(&inner.nodes, path)?;
        let now = Utc::now();
        let created_at = match inner.nodes.get(path) {
            Some(Node::Directory { .. }) => return Err(StorageError::not_file(path)),
            Some(Node::File { created_at, .. }) => *created_at,
            None => now,
        };
        ensure_parents(&mut inner.nodes, path);
        inner.nodes.insert(
            path.to_string(),
            Node::File {
                data: data.to_vec(),
                created_at,
                updated_at: now,
            },
        );
        Ok(())
    }

    async fn create_dir(&self, path: &str) -> Result<(), StorageError> {
        let mut inner = self.lock();
        check_writable(&inner, path)?;
        if inner.nodes.contains_key(path) {
            return Err(StorageError::already_exists(path));
        }
        check_parent_is_dir(&inner.nodes, path)?;
        ensure_parents(&mut inner.nodes, path);
        inner.nodes.insert(
            path.to_string(),
            Node::Directory {
                created_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), StorageError> {
        let mut inner = self.lock();
        check_writable(&inner, path)?;
        if path == ROOT {
            return Err(StorageError::NoPermissions {
                path: path.to_string(),
                message: "cannot remove the root".into(),
            });
        }
        if inner.nodes.remove(path).is_none() {
            return Err(StorageError::not_exists(path));
        }
        inner
            .nodes
            .retain(|candidate, _| !path::is_strictly_inside(path, candidate));
        Ok(())
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, StorageError> {
        let inner = self.lock();
        match inner.nodes.get(path) {
            Some(Node::Directory { .. }) => {}
            Some(Node::File { .. }) => return Err(StorageError::not_directory(path)),
            None => return Err(StorageError::not_exists(path)),
        }
        let names = inner
            .nodes
            .keys()
            .filter(|candidate| path::parent(candidate).as_deref() == Some(path))
            .map(|candidate| path::name(candidate).to_string())
            .collect();
        Ok(names)
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let mut inner = self.lock();
        check_writable(&inner, from)?;
        check_writable(&inner, to)?;
        match inner.nodes.get(from) {
            Some(Node::File { .. }) => {}
            Some(Node::Directory { .. }) => return Err(StorageError::not_file(from)),
            None => return Err(StorageError::not_exists(from)),
        }
        if let Some(Node::Directory { .. }) = inner.nodes.get(to) {
            return Err(StorageError::not_file(to));
        }
        check_parent_is_dir(&inner.nodes, to)?;
        ensure_parents(&mut inner.nodes, to);
        if let Some(node) = inner.nodes.remove(from) {
            inner.nodes.insert(to.to_string(), node);
        }
        Ok(())
    }
}
