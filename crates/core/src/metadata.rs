//! Persisted per-path reconciliation state.
//!
//! The [`SyncMetadataStore`] keeps an in-memory map from normalized path to
//! [`EntrySyncMetadata`] and writes the latest snapshot through a
//! [`MetadataBackend`] after every mutation. Single-key updates run under a
//! synchronous mutex with no await point between read and write, so they are
//! atomic per key.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::diff::DiffKind;
use crate::errors::MetadataError;
use crate::identity::ContentIdentity;
use crate::path;
use crate::storage::Storage;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Resolution recorded for a diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    /// Seen but not decided; revokes an earlier acceptance.
    Undecided,
    /// Follow the clean side of a non-conflicting diff.
    AcceptAuto,
    /// Resolve a conflict in favour of the local side.
    AcceptLocal,
    /// Resolve a conflict in favour of the remote side.
    AcceptRemote,
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undecided => write!(f, "undecided"),
            Self::AcceptAuto => write!(f, "accept_auto"),
            Self::AcceptLocal => write!(f, "accept_local"),
            Self::AcceptRemote => write!(f, "accept_remote"),
        }
    }
}

/// The state a resolution wants both sides to end up in.
///
/// Serialized as the identity string, or `false` for deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "AcceptedRepr", into = "AcceptedRepr")]
pub enum AcceptedState {
    Content(ContentIdentity),
    Deleted,
}

impl AcceptedState {
    pub fn from_identity(identity: Option<&ContentIdentity>) -> Self {
        match identity {
            Some(id) => Self::Content(id.clone()),
            None => Self::Deleted,
        }
    }

    /// The identity this state corresponds to (`None` for deletion).
    pub fn identity(&self) -> Option<&ContentIdentity> {
        match self {
            Self::Content(id) => Some(id),
            Self::Deleted => None,
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum AcceptedRepr {
    Identity(String),
    Flag(bool),
}

impl TryFrom<AcceptedRepr> for AcceptedState {
    type Error = String;

    fn try_from(repr: AcceptedRepr) -> Result<Self, Self::Error> {
        match repr {
            AcceptedRepr::Identity(raw) => Ok(Self::Content(ContentIdentity::from_raw(raw))),
            AcceptedRepr::Flag(false) => Ok(Self::Deleted),
            AcceptedRepr::Flag(true) => Err("accepted may only be an identity or false".into()),
        }
    }
}

impl From<AcceptedState> for AcceptedRepr {
    fn from(state: AcceptedState) -> Self {
        match state {
            AcceptedState::Content(id) => Self::Identity(id.as_str().to_string()),
            AcceptedState::Deleted => Self::Flag(false),
        }
    }
}

/// Last-known reconciliation state for one path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrySyncMetadata {
    /// Identity both sides last agreed on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced: Option<ContentIdentity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepted: Option<AcceptedState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<SyncAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<DiffKind>,
}

impl EntrySyncMetadata {
    pub fn synced(identity: ContentIdentity) -> Self {
        Self {
            synced: Some(identity),
            ..Self::default()
        }
    }

    /// Whether an accepted resolution still has to be applied.
    pub fn is_pending(&self) -> bool {
        match &self.accepted {
            Some(accepted) => accepted.identity() != self.synced.as_ref(),
            None => false,
        }
    }

    /// `action` and `diff` must be set together.
    pub fn validate(&self, path: &str) -> Result<(), MetadataError> {
        if self.action.is_some() != self.diff.is_some() {
            return Err(MetadataError::Corrupt {
                path: path.to_string(),
                detail: "action and diff must be set together".into(),
            });
        }
        Ok(())
    }

    /// Mark the accepted state as applied on both sides.
    pub fn reconciled(&self) -> Self {
        let synced = self.accepted.as_ref().and_then(|a| a.identity().cloned());
        Self {
            synced,
            accepted: self.accepted.clone(),
            action: None,
            diff: None,
        }
    }
}

/// Full metadata map keyed by normalized path.
pub type MetadataMap = BTreeMap<String, EntrySyncMetadata>;

/// Entries of `map` at or beneath `root`, top-down.
pub fn top_down_within(map: &MetadataMap, root: &str) -> Vec<(String, EntrySyncMetadata)> {
    map.range(root.to_string()..)
        .take_while(|(candidate, _)| candidate.starts_with(root))
        .filter(|(candidate, _)| path::is_inside(root, candidate))
        .map(|(path, meta)| (path.clone(), meta.clone()))
        .collect()
}

// ---------------------------------------------------------------------------
// Backends
// ---------------------------------------------------------------------------

/// Where the metadata map is persisted.
#[async_trait]
pub trait MetadataBackend: Send + Sync {
    async fn load(&self) -> Result<MetadataMap, MetadataError>;
    async fn save(&self, map: &MetadataMap) -> Result<(), MetadataError>;
}

/// Persists the map as a JSON document inside a storage tree.
pub struct StorageMetadataBackend {
    storage: Arc<dyn Storage>,
    file: String,
}

impl StorageMetadataBackend {
    pub fn new(storage: Arc<dyn Storage>, file: impl Into<String>) -> Self {
        Self {
            storage,
            file: path::normalize(&file.into()),
        }
    }
}

#[async_trait]
impl MetadataBackend for StorageMetadataBackend {
    async fn load(&self) -> Result<MetadataMap, MetadataError> {
        match self.storage.read(&self.file).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.is_not_exists() => {
                debug!(file = %self.file, "no metadata file yet, starting empty");
                Ok(MetadataMap::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Written to a sibling `.tmp` file first, then renamed over the document.
    async fn save(&self, map: &MetadataMap) -> Result<(), MetadataError> {
        let bytes = serde_json::to_vec_pretty(map)?;
        let tmp = format!("{}.tmp", self.file);
        self.storage.write_or_create(&tmp, &bytes).await?;
        self.storage.rename(&tmp, &self.file).await?;
        Ok(())
    }
}

/// Non-persistent backend for tests and dry runs.
#[derive(Default)]
pub struct MemoryMetadataBackend {
    saved: Mutex<MetadataMap>,
}

impl MemoryMetadataBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataBackend for MemoryMetadataBackend {
    async fn load(&self) -> Result<MetadataMap, MetadataError> {
        Ok(lock_recover(&self.saved).clone())
    }

    async fn save(&self, map: &MetadataMap) -> Result<(), MetadataError> {
        *lock_recover(&self.saved) = map.clone();
        Ok(())
    }
}

fn lock_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("metadata mutex was poisoned, recovering");
        poisoned.into_inner()
    })
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// In-memory metadata map with write-through persistence.
pub struct SyncMetadataStore {
    entries: Mutex<MetadataMap>,
    backend: Box<dyn MetadataBackend>,
    /// Serializes saves so an older snapshot never lands after a newer one.
    save_lock: tokio::sync::Mutex<()>,
}

impl SyncMetadataStore {
    /// Load the current map from `backend`.
    pub async fn open(backend: Box<dyn MetadataBackend>) -> Result<Self, MetadataError> {
        let entries = backend.load().await?;
        for (path, meta) in &entries {
            meta.validate(path)?;
        }
        info!(entries = entries.len(), "loaded sync metadata");
        Ok(Self {
            entries: Mutex::new(entries),
            backend,
            save_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// An empty, non-persistent store.
    pub fn in_memory() -> Self {
        Self {
            entries: Mutex::new(MetadataMap::new()),
            backend: Box::new(MemoryMetadataBackend::new()),
            save_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Snapshot of the whole map.
    pub fn get(&self) -> MetadataMap {
        self.entries().clone()
    }

    pub fn get_entry(&self, path: &str) -> Option<EntrySyncMetadata> {
        self.entries().get(path).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Upsert (`Some`) or delete (`None`) one entry.
    pub async fn set(
        &self,
        path: &str,
        meta: Option<EntrySyncMetadata>,
    ) -> Result<(), MetadataError> {
        if let Some(meta) = &meta {
            meta.validate(path)?;
        }
        {
            let mut entries = self.entries();
            match meta {
                Some(meta) => {
                    entries.insert(path.to_string(), meta);
                }
                None => {
                    entries.remove(path);
                }
            }
        }
        self.persist().await
    }

    /// Atomic read-modify-write of one entry.
    ///
    /// `f` receives the current value and returns the new one, or `None` to
    /// delete the entry. Returns the value that was stored.
    pub async fn update<F>(
        &self,
        path: &str,
        f: F,
    ) -> Result<Option<EntrySyncMetadata>, MetadataError>
    where
        F: FnOnce(Option<&EntrySyncMetadata>) -> Option<EntrySyncMetadata>,
    {
        let stored = {
            let mut entries = self.entries();
            let next = f(entries.get(path));
            if let Some(meta) = &next {
                meta.validate(path)?;
            }
            match &next {
                Some(meta) => {
                    entries.insert(path.to_string(), meta.clone());
                }
                None => {
                    entries.remove(path);
                }
            }
            next
        };
        self.persist().await?;
        Ok(stored)
    }

    /// Merge many entries in one persisted write; `None` deletes the key.
    pub async fn set_multi(
        &self,
        changes: BTreeMap<String, Option<EntrySyncMetadata>>,
    ) -> Result<(), MetadataError> {
        if changes.is_empty() {
            return Ok(());
        }
        for (path, meta) in &changes {
            if let Some(meta) = meta {
                meta.validate(path)?;
            }
        }
        {
            let mut entries = self.entries();
            for (path, meta) in changes {
                match meta {
                    Some(meta) => {
                        entries.insert(path, meta);
                    }
                    None => {
                        entries.remove(&path);
                    }
                }
            }
        }
        self.persist().await
    }

    /// Like [`set_multi`](Self::set_multi), but a key is only written while
    /// its current value still equals the one in `baseline` (absent counts as
    /// a value). Returns the keys that were written.
    pub async fn set_multi_if_unchanged(
        &self,
        baseline: &MetadataMap,
        changes: BTreeMap<String, Option<EntrySyncMetadata>>,
    ) -> Result<Vec<String>, MetadataError> {
        for (path, meta) in &changes {
            if let Some(meta) = meta {
                meta.validate(path)?;
            }
        }
        let written: Vec<String> = {
            let mut entries = self.entries();
            let mut written = Vec::new();
            for (path, meta) in changes {
                if entries.get(&path) != baseline.get(&path) {
                    debug!(path = %path, "entry changed concurrently, not overwriting");
                    continue;
                }
                match meta {
                    Some(meta) => {
                        entries.insert(path.clone(), meta);
                    }
                    None => {
                        entries.remove(&path);
                    }
                }
                written.push(path);
            }
            written
        };
        if !written.is_empty() {
            self.persist().await?;
        }
        Ok(written)
    }

    /// All entries ordered so that every ancestor precedes its descendants.
    ///
    /// Normalized paths sort this way lexicographically: a path is a strict
    /// prefix of each of its descendants.
    pub fn top_down(&self) -> Vec<(String, EntrySyncMetadata)> {
        self.entries()
            .iter()
            .map(|(path, meta)| (path.clone(), meta.clone()))
            .collect()
    }

    fn entries(&self) -> MutexGuard<'_, MetadataMap> {
        lock_recover(&self.entries)
    }

    async fn persist(&self) -> Result<(), MetadataError> {
        let _guard = self.save_lock.lock().await;
        let snapshot = self.get();
        self.backend.save(&snapshot).await?;
        debug!(entries = snapshot.len(), "persisted sync metadata");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn id(s: &str) -> ContentIdentity {
        ContentIdentity::of_bytes(s.as_bytes())
    }

    fn accepted(identity: &str, kind: DiffKind) -> EntrySyncMetadata {
        EntrySyncMetadata {
            synced: None,
            accepted: Some(AcceptedState::Content(id(identity))),
            action: Some(SyncAction::AcceptAuto),
            diff: Some(kind),
        }
    }

    #[test]
    fn test_json_shape() {
        let meta = EntrySyncMetadata {
            synced: Some(id("a")),
            accepted: Some(AcceptedState::Deleted),
            action: Some(SyncAction::AcceptRemote),
            diff: Some(DiffKind::ConflictingLocalRemove),
        };
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["accepted"], serde_json::Value::Bool(false));
        assert_eq!(json["action"], "accept_remote");
        assert_eq!(json["diff"], "conflicting_local_remove");

        let back: EntrySyncMetadata = serde_json::from_value(json).unwrap();
        assert_eq!(back, meta);

        let empty = serde_json::to_string(&EntrySyncMetadata::default()).unwrap();
        assert_eq!(empty, "{}");

        let bad: Result<EntrySyncMetadata, _> = serde_json::from_str(r#"{"accepted": true}"#);
        assert!(bad.is_err());
    }

    #[test]
    fn test_pending() {
        let mut meta = EntrySyncMetadata::synced(id("a"));
        assert!(!meta.is_pending());

        meta.accepted = Some(AcceptedState::Content(id("b")));
        assert!(meta.is_pending());

        meta.accepted = Some(AcceptedState::Content(id("a")));
        assert!(!meta.is_pending());

        let deleted = EntrySyncMetadata {
            synced: None,
            accepted: Some(AcceptedState::Deleted),
            action: None,
            diff: None,
        };
        assert!(!deleted.is_pending());
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let store = SyncMetadataStore::in_memory();
        store
            .update("/a", |current| {
                assert!(current.is_none());
                Some(EntrySyncMetadata::synced(id("x")))
            })
            .await
            .unwrap();
        assert_eq!(store.get_entry("/a").unwrap().synced, Some(id("x")));

        store.update("/a", |_| None).await.unwrap();
        assert!(store.get_entry("/a").is_none());
    }

    #[tokio::test]
    async fn test_rejects_unpaired_action() {
        let store = SyncMetadataStore::in_memory();
        let broken = EntrySyncMetadata {
            action: Some(SyncAction::AcceptAuto),
            ..EntrySyncMetadata::default()
        };
        let err = store.set("/a", Some(broken)).await.unwrap_err();
        assert!(matches!(err, MetadataError::Corrupt { .. }));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_set_multi_merges_and_deletes() {
        let store = SyncMetadataStore::in_memory();
        store
            .set("/keep", Some(EntrySyncMetadata::synced(id("k"))))
            .await
            .unwrap();
        store
            .set("/drop", Some(EntrySyncMetadata::synced(id("d"))))
            .await
            .unwrap();

        let mut changes = BTreeMap::new();
        changes.insert("/drop".to_string(), None);
        changes.insert("/new".to_string(), Some(accepted("n", DiffKind::LocalCreate)));
        store.set_multi(changes).await.unwrap();

        let map = store.get();
        assert_eq!(map.len(), 2);
        assert!(map.contains_key("/keep"));
        assert!(map.contains_key("/new"));
    }

    #[tokio::test]
    async fn test_top_down_orders_ancestors_first() {
        let store = SyncMetadataStore::in_memory();
        for p in ["/a/b/c", "/a-b", "/a", "/a/b", "/z"] {
            store
                .set(p, Some(EntrySyncMetadata::synced(id(p))))
                .await
                .unwrap();
        }
        let order: Vec<String> = store.top_down().into_iter().map(|(p, _)| p).collect();
        let pos = |p: &str| order.iter().position(|x| x == p).unwrap();
        assert!(pos("/a") < pos("/a/b"));
        assert!(pos("/a/b") < pos("/a/b/c"));

        let within: Vec<String> = top_down_within(&store.get(), "/a")
            .into_iter()
            .map(|(p, _)| p)
            .collect();
        assert_eq!(within, vec!["/a", "/a/b", "/a/b/c"]);
    }

    #[tokio::test]
    async fn test_storage_backend_round_trip() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new("local"));
        let backend = StorageMetadataBackend::new(storage.clone(), "/.treesync/sync-r.json");
        let store = SyncMetadataStore::open(Box::new(backend)).await.unwrap();
        assert!(store.is_empty());

        store
            .set("/doc.txt", Some(EntrySyncMetadata::synced(id("doc"))))
            .await
            .unwrap();
        assert!(storage.exists("/.treesync/sync-r.json").await.unwrap());

        let reopened = SyncMetadataStore::open(Box::new(StorageMetadataBackend::new(
            storage,
            "/.treesync/sync-r.json",
        )))
        .await
        .unwrap();
        assert_eq!(reopened.get_entry("/doc.txt").unwrap().synced, Some(id("doc")));
    }

    #[tokio::test]
    async fn test_storage_backend_replaces_document_whole() {
        let storage = Arc::new(MemoryStorage::new("local"));
        // Left over from an interrupted save.
        storage.insert_file("/.treesync/sync-r.json.tmp", "{\"/half");

        let backend = StorageMetadataBackend::new(storage.clone(), "/.treesync/sync-r.json");
        let store = SyncMetadataStore::open(Box::new(backend)).await.unwrap();
        store
            .set("/a", Some(EntrySyncMetadata::synced(id("a"))))
            .await
            .unwrap();

        assert!(storage.file("/.treesync/sync-r.json.tmp").is_none());
        let saved: MetadataMap =
            serde_json::from_slice(&storage.file("/.treesync/sync-r.json").unwrap()).unwrap();
        assert_eq!(saved.len(), 1);
    }

    #[tokio::test]
    async fn test_set_multi_if_unchanged_skips_moved_keys() {
        let store = SyncMetadataStore::in_memory();
        store
            .set("/moved", Some(EntrySyncMetadata::synced(id("old"))))
            .await
            .unwrap();
        let baseline = store.get();

        store
            .set("/moved", Some(EntrySyncMetadata::synced(id("new"))))
            .await
            .unwrap();

        let mut changes = BTreeMap::new();
        changes.insert("/moved".to_string(), None);
        changes.insert("/fresh".to_string(), Some(accepted("f", DiffKind::LocalCreate)));
        let written = store.set_multi_if_unchanged(&baseline, changes).await.unwrap();

        assert_eq!(written, vec!["/fresh".to_string()]);
        assert_eq!(store.get_entry("/moved").unwrap().synced, Some(id("new")));
        assert!(store.get_entry("/fresh").is_some());
    }
}
