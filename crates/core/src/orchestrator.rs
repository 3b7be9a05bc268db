//! Sync orchestrator: computes diffs over a subtree, records resolutions, and
//! turns accepted-but-unapplied resolutions into jobs.
//!
//! # Per-path lifecycle
//!
//! ```text
//!   Undecided ──accept──▶ Accepted ──do_job──▶ Reconciled
//!       ▲                    │
//!       └──accept(Undecided)─┘
//! ```
//!
//! A path is *pending* while its accepted state differs from its synced
//! identity. [`SyncOrchestrator::get_jobs`] hands out pending paths top-down
//! so that parent directories are created before their children. A path whose
//! resolution leaves no directory behind (a deletion, or a file replacing a
//! directory) waits until nothing beneath it is pending.
//!
//! A diff pass reads metadata once, before scanning. Every write-back of that
//! pass is conditional on the entry being unchanged since then, so a job that
//! lands mid-scan is never combined with the pre-job scan.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::diff::{classify, DiffEntry, DiffKind};
use crate::errors::{StorageError, SyncError};
use crate::identity::{self, ContentIdentity};
use crate::ignore::IgnorePolicy;
use crate::metadata::{
    top_down_within, AcceptedState, EntrySyncMetadata, MetadataMap, SyncAction, SyncMetadataStore,
};
use crate::models::{Job, JobOutcome, SyncEvent, UpdateReport};
use crate::outline::Outline;
use crate::path;
use crate::storage::{EntryStats, Storage};

/// Capacity of the event channel; slow subscribers observe `Lagged`.
const EVENT_CAPACITY: usize = 256;

/// Auto-accept rules used when none are configured: every clean kind follows
/// its clean side.
pub fn default_auto_accept_rules() -> HashMap<DiffKind, SyncAction> {
    DiffKind::ALL
        .iter()
        .filter(|kind| !kind.is_conflicting())
        .map(|kind| (*kind, SyncAction::AcceptAuto))
        .collect()
}

/// Check that `action` may resolve a `diff` diff.
///
/// `Undecided` is always allowed. `AcceptAuto` needs a clean kind, and the
/// side picks need a conflicting one.
pub fn check_action(path: &str, diff: DiffKind, action: SyncAction) -> Result<(), SyncError> {
    let legal = match action {
        SyncAction::Undecided => true,
        SyncAction::AcceptAuto => !diff.is_conflicting(),
        SyncAction::AcceptLocal | SyncAction::AcceptRemote => diff.is_conflicting(),
    };
    if legal {
        Ok(())
    } else {
        Err(SyncError::InvalidAction {
            path: path.to_string(),
            action,
            diff,
        })
    }
}

/// Whether resolving `diff` with `action` makes the local side win.
fn toward_local(diff: DiffKind, action: SyncAction) -> bool {
    action == SyncAction::AcceptLocal || (action == SyncAction::AcceptAuto && diff.is_clean_local())
}

/// The state that accepting `entry` with `action` records.
fn accepted_state(entry: &DiffEntry, action: SyncAction) -> Option<AcceptedState> {
    match action {
        SyncAction::Undecided => None,
        _ if toward_local(entry.diff, action) => Some(AcceptedState::from_identity(entry.local.as_ref())),
        _ => Some(AcceptedState::from_identity(entry.remote.as_ref())),
    }
}

/// What a metadata maintenance change does to its entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Maintenance {
    Prune,
    Converge,
    Revoke,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Local,
    Remote,
}

/// Identities observed on both sides beneath one root.
#[derive(Debug, Default)]
struct Scan {
    local: BTreeMap<String, ContentIdentity>,
    remote: BTreeMap<String, ContentIdentity>,
}

impl Scan {
    fn paths(&self) -> impl Iterator<Item = &String> {
        let mut all: Vec<&String> = self.local.keys().chain(self.remote.keys()).collect();
        all.sort();
        all.dedup();
        all.into_iter()
    }
}

/// Coordinates diffing, acceptance, and job execution for one sync pair.
pub struct SyncOrchestrator {
    local: Arc<dyn Storage>,
    remote: Outline,
    metadata: Arc<SyncMetadataStore>,
    policy: Arc<IgnorePolicy>,
    auto_accept: HashMap<DiffKind, SyncAction>,
    /// Working set of the most recent diff passes, keyed by path.
    diffs: Mutex<BTreeMap<String, DiffEntry>>,
    /// Single-flight flag for `update_diff`.
    updating: Arc<AtomicBool>,
    update_started_at: Mutex<Option<DateTime<Utc>>>,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncOrchestrator {
    /// Create an orchestrator with no auto-accept rules.
    pub fn new(
        local: Arc<dyn Storage>,
        remote: Arc<dyn Storage>,
        metadata: Arc<SyncMetadataStore>,
        policy: IgnorePolicy,
    ) -> Self {
        let policy = Arc::new(policy);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        info!(
            local = %local.describe(),
            remote = %remote.describe(),
            "initializing sync orchestrator"
        );
        Self {
            local,
            remote: Outline::new(remote, policy.clone()),
            metadata,
            policy,
            auto_accept: HashMap::new(),
            diffs: Mutex::new(BTreeMap::new()),
            updating: Arc::new(AtomicBool::new(false)),
            update_started_at: Mutex::new(None),
            events,
        }
    }

    /// Install auto-accept rules. Rules that are illegal for their kind are
    /// dropped with a warning.
    pub fn with_auto_accept(mut self, rules: HashMap<DiffKind, SyncAction>) -> Self {
        self.auto_accept = rules
            .into_iter()
            .filter(|(kind, action)| match check_action("*", *kind, *action) {
                Ok(()) => true,
                Err(e) => {
                    warn!(error = %e, "ignoring auto-accept rule");
                    false
                }
            })
            .collect();
        self
    }

    pub fn local(&self) -> &Arc<dyn Storage> {
        &self.local
    }

    pub fn remote(&self) -> &Outline {
        &self.remote
    }

    pub fn metadata(&self) -> &Arc<SyncMetadataStore> {
        &self.metadata
    }

    /// Whether an `update_diff` pass is in progress.
    pub fn is_updating(&self) -> bool {
        self.updating.load(Ordering::SeqCst)
    }

    /// Subscribe to change events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: SyncEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    /// Snapshot of the cached working set.
    pub fn diffs(&self) -> Vec<DiffEntry> {
        lock_recover(&self.diffs).values().cloned().collect()
    }

    /// Cached diff for one path.
    pub fn diff_for(&self, path: &str) -> Option<DiffEntry> {
        lock_recover(&self.diffs).get(&path::normalize(path)).cloned()
    }

    /// Number of pending paths.
    pub fn pending_jobs(&self) -> usize {
        self.metadata
            .top_down()
            .iter()
            .filter(|(_, meta)| meta.is_pending())
            .count()
    }

    // -----------------------------------------------------------------------
    // Diffing
    // -----------------------------------------------------------------------

    /// Compute every diff beneath `root` without touching the working set.
    pub async fn get_diff(&self, root: &str) -> Result<Vec<DiffEntry>, SyncError> {
        let root = path::normalize(root);
        let stored = self.metadata.get();
        let scan = self.scan(&root).await?;
        Ok(classify_scan(&scan, &stored))
    }

    async fn scan(&self, root: &str) -> Result<Scan, SyncError> {
        let mut scan = Scan::default();

        if let Some(outline) = self.remote.build(root).await? {
            scan.remote = outline
                .flatten(root)
                .into_iter()
                .filter(|(p, _)| !self.policy.is_ignored(p))
                .collect();
        }

        // Bottom-up walk of the local side: directories are recorded after
        // their children.
        let mut stack = vec![(root.to_string(), false)];
        while let Some((at, expanded)) = stack.pop() {
            if expanded {
                if !self.policy.is_ignored(&at) {
                    scan.local.insert(at, ContentIdentity::directory());
                }
                continue;
            }
            let Some(id) = identity::identity(self.local.as_ref(), &at).await? else {
                continue;
            };
            if !id.is_directory() {
                if !self.policy.is_ignored(&at) {
                    scan.local.insert(at, id);
                }
                continue;
            }
            let names = match self.local.children(&at).await {
                Ok(names) => names,
                Err(e) if e.is_not_exists() => continue,
                Err(e) => return Err(e.into()),
            };
            stack.push((at.clone(), true));
            for name in names {
                let child = path::join(&at, &name);
                if !self.policy.is_ignored(&child) {
                    stack.push((child, false));
                }
            }
        }

        debug!(
            root,
            local = scan.local.len(),
            remote = scan.remote.len(),
            "scanned both sides"
        );
        Ok(scan)
    }

    /// Refresh the working set for `root` and apply auto-accept rules.
    ///
    /// Only one pass runs at a time; a concurrent call fails with
    /// [`SyncError::AlreadyRunning`].
    pub async fn update_diff(&self, root: &str) -> Result<UpdateReport, SyncError> {
        if self
            .updating
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            let started_at = *lock_recover(&self.update_started_at);
            let started_at = started_at.map(|t| t.to_rfc3339()).unwrap_or_default();
            return Err(SyncError::AlreadyRunning { started_at });
        }
        let _guard = SyncLockGuard(self.updating.clone());
        *lock_recover(&self.update_started_at) = Some(Utc::now());

        let root = path::normalize(root);
        info!(root = %root, "updating diff");

        let baseline = self.metadata.get();
        let scan = self.scan(&root).await?;
        let (mut report, stored) = self.maintain_metadata(&root, &scan, baseline).await?;

        let entries = classify_scan(&scan, &stored);
        {
            let mut cached = lock_recover(&self.diffs);
            cached.retain(|p, _| !path::is_inside(&root, p));
            for entry in &entries {
                cached.insert(entry.path.clone(), entry.clone());
            }
        }

        let decisions: Vec<(DiffEntry, SyncAction)> = entries
            .iter()
            .filter(|entry| !has_decision(entry))
            .filter_map(|entry| {
                self.auto_accept
                    .get(&entry.diff)
                    .map(|action| (entry.clone(), *action))
            })
            .collect();
        report.auto_accepted = self.record_decisions(&decisions, Some(&stored)).await?;

        report.diffs = entries.len();
        report.conflicts = entries.iter().filter(|e| e.diff.is_conflicting()).count();

        info!(
            root = %root,
            diffs = report.diffs,
            conflicts = report.conflicts,
            auto_accepted = report.auto_accepted,
            pruned = report.pruned,
            converged = report.converged,
            revoked = report.revoked,
            "diff updated"
        );
        self.emit(SyncEvent::DiffUpdated {
            root,
            report: report.clone(),
        });
        Ok(report)
    }

    /// Bring stored metadata beneath `root` in line with what was observed.
    ///
    /// - Entries absent on both sides with nothing pending are pruned.
    /// - Entries whose sides have converged get `synced` advanced and any
    ///   recorded decision cleared.
    /// - Pending acceptances that no longer describe the current diff are
    ///   revoked.
    ///
    /// Decisions are made against `baseline`, the map read before `scan` was
    /// taken. Returns the report and `baseline` with the written changes
    /// applied.
    async fn maintain_metadata(
        &self,
        root: &str,
        scan: &Scan,
        mut baseline: MetadataMap,
    ) -> Result<(UpdateReport, MetadataMap), SyncError> {
        let mut report = UpdateReport::default();
        let mut changes = BTreeMap::new();
        let mut kinds = HashMap::new();

        for (p, meta) in top_down_within(&baseline, root) {
            if self.policy.is_ignored(&p) {
                continue;
            }
            let local = scan.local.get(&p);
            let remote = scan.remote.get(&p);
            let pending = meta.is_pending();

            match (local, remote) {
                (None, None) if !pending => {
                    debug!(path = %p, "pruning metadata for vanished path");
                    kinds.insert(p.clone(), Maintenance::Prune);
                    changes.insert(p, None);
                }
                (Some(l), Some(r)) if l == r => {
                    if meta.synced.as_ref() != Some(l) || meta.action.is_some() {
                        debug!(path = %p, identity = %l.short(), "sides converged");
                        kinds.insert(p.clone(), Maintenance::Converge);
                        changes.insert(p, Some(EntrySyncMetadata::synced(l.clone())));
                    }
                }
                _ if pending => {
                    let current = classify(local, remote, meta.synced.as_ref());
                    let still_valid = match (current, meta.action) {
                        (Some(diff), Some(action)) if meta.diff == Some(diff) => {
                            let entry = DiffEntry {
                                path: p.clone(),
                                diff,
                                local: local.cloned(),
                                remote: remote.cloned(),
                                metadata: None,
                            };
                            accepted_state(&entry, action) == meta.accepted
                        }
                        _ => false,
                    };
                    if !still_valid {
                        warn!(path = %p, "acceptance no longer matches the diff, revoking");
                        kinds.insert(p.clone(), Maintenance::Revoke);
                        changes.insert(
                            p,
                            Some(EntrySyncMetadata {
                                synced: meta.synced.clone(),
                                ..EntrySyncMetadata::default()
                            }),
                        );
                    }
                }
                _ => {}
            }
        }

        if changes.is_empty() {
            return Ok((report, baseline));
        }
        let written = self
            .metadata
            .set_multi_if_unchanged(&baseline, changes.clone())
            .await?;
        for p in written {
            match kinds.get(&p) {
                Some(Maintenance::Prune) => report.pruned += 1,
                Some(Maintenance::Converge) => report.converged += 1,
                Some(Maintenance::Revoke) => report.revoked += 1,
                None => {}
            }
            match changes.remove(&p).flatten() {
                Some(meta) => {
                    baseline.insert(p, meta);
                }
                None => {
                    baseline.remove(&p);
                }
            }
        }
        Ok((report, baseline))
    }

    // -----------------------------------------------------------------------
    // Acceptance
    // -----------------------------------------------------------------------

    /// Record `action` as the resolution of `entry`.
    pub async fn accept(
        &self,
        entry: &DiffEntry,
        action: SyncAction,
    ) -> Result<EntrySyncMetadata, SyncError> {
        check_action(&entry.path, entry.diff, action)?;
        let accepted = accepted_state(entry, action);

        let stored = self
            .metadata
            .update(&entry.path, |current| {
                Some(EntrySyncMetadata {
                    synced: current.and_then(|m| m.synced.clone()),
                    accepted,
                    action: Some(action),
                    diff: Some(entry.diff),
                })
            })
            .await?
            .unwrap_or_default();

        debug!(path = %entry.path, diff = %entry.diff, action = %action, "accepted diff");
        self.refresh_cached(&entry.path, &stored);
        self.emit(SyncEvent::DiffAccepted {
            path: entry.path.clone(),
            diff: entry.diff,
            action,
        });
        Ok(stored)
    }

    /// Record many resolutions with one read and one persisted write.
    ///
    /// Every decision is validated before anything is written. Returns the
    /// number of decisions recorded.
    pub async fn accept_multi(
        &self,
        decisions: &[(DiffEntry, SyncAction)],
    ) -> Result<usize, SyncError> {
        self.record_decisions(decisions, None).await
    }

    /// With a `baseline`, decisions whose entry moved away from it are
    /// dropped instead of written.
    async fn record_decisions(
        &self,
        decisions: &[(DiffEntry, SyncAction)],
        baseline: Option<&MetadataMap>,
    ) -> Result<usize, SyncError> {
        if decisions.is_empty() {
            return Ok(0);
        }
        for (entry, action) in decisions {
            check_action(&entry.path, entry.diff, *action)?;
        }

        let current = match baseline {
            Some(map) => map.clone(),
            None => self.metadata.get(),
        };
        let mut changes = BTreeMap::new();
        for (entry, action) in decisions {
            let meta = EntrySyncMetadata {
                synced: current.get(&entry.path).and_then(|m| m.synced.clone()),
                accepted: accepted_state(entry, *action),
                action: Some(*action),
                diff: Some(entry.diff),
            };
            changes.insert(entry.path.clone(), Some(meta));
        }
        let written: HashSet<String> = match baseline {
            Some(map) => self
                .metadata
                .set_multi_if_unchanged(map, changes.clone())
                .await?
                .into_iter()
                .collect(),
            None => {
                self.metadata.set_multi(changes.clone()).await?;
                changes.keys().cloned().collect()
            }
        };

        for (entry, action) in decisions {
            if !written.contains(&entry.path) {
                continue;
            }
            if let Some(Some(meta)) = changes.get(&entry.path) {
                self.refresh_cached(&entry.path, meta);
            }
            self.emit(SyncEvent::DiffAccepted {
                path: entry.path.clone(),
                diff: entry.diff,
                action: *action,
            });
        }
        debug!(
            count = written.len(),
            dropped = decisions.len() - written.len(),
            "accepted diffs"
        );
        Ok(written.len())
    }

    fn refresh_cached(&self, p: &str, meta: &EntrySyncMetadata) {
        if let Some(cached) = lock_recover(&self.diffs).get_mut(p) {
            cached.metadata = Some(meta.clone());
        }
    }

    // -----------------------------------------------------------------------
    // Jobs
    // -----------------------------------------------------------------------

    /// Up to `count` pending paths accepted by `filter`, ancestors first.
    ///
    /// A path whose resolution clears its subtree is held back while any
    /// descendant is still pending.
    pub fn get_jobs<F>(&self, count: usize, filter: F) -> Vec<Job>
    where
        F: Fn(&str) -> bool,
    {
        if count == 0 {
            return Vec::new();
        }
        let entries = self.metadata.get();
        entries
            .iter()
            .filter(|(p, meta)| meta.is_pending() && filter(p))
            .filter(|(p, meta)| !clears_subtree(meta) || !has_pending_descendant(&entries, p))
            .take(count)
            .map(|(path, metadata)| Job {
                path: path.clone(),
                metadata: metadata.clone(),
            })
            .collect()
    }

    /// Apply one job's accepted state to its target side.
    pub async fn do_job(&self, job: &Job) -> Result<JobOutcome, SyncError> {
        let p = job.path.as_str();
        let Some(meta) = self.metadata.get_entry(p).filter(|m| m.is_pending()) else {
            debug!(path = p, "job no longer pending, skipping");
            return Ok(JobOutcome::Skipped);
        };
        let Some(accepted) = meta.accepted.clone() else {
            return Ok(JobOutcome::Skipped);
        };
        let observed_synced = meta.synced.clone();

        let source_is_local = meta.action == Some(SyncAction::AcceptLocal)
            || meta.diff.is_some_and(|d| d.is_clean_local());
        let (source, target) = if source_is_local {
            (Side::Local, Side::Remote)
        } else {
            (Side::Remote, Side::Local)
        };

        match &accepted {
            AcceptedState::Content(id) if id.is_directory() => {
                debug!(path = p, side = ?target, "creating directory");
                match self.create_dir_on(target, p).await {
                    Ok(()) => {}
                    Err(e) if e.is_already_exists() => {
                        if !self.stats_on(target, p).await?.is_directory {
                            debug!(path = p, side = ?target, "replacing file with directory");
                            self.remove_on(target, p).await?;
                            self.create_dir_on(target, p).await?;
                        }
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            AcceptedState::Content(id) => {
                let data = self.read_from(source, p).await?;
                let found = ContentIdentity::of_bytes(&data);
                if &found != id {
                    return Err(SyncError::SourceChanged {
                        path: p.to_string(),
                        expected: id.to_string(),
                        found: found.to_string(),
                    });
                }
                if let Some(stats) = self.existing_on(target, p).await? {
                    if stats.is_directory {
                        self.ensure_empty(target, p).await?;
                        debug!(path = p, side = ?target, "replacing directory with file");
                        self.remove_on(target, p).await?;
                    }
                }
                debug!(path = p, side = ?target, bytes = data.len(), "writing file");
                self.write_to(target, p, &data).await?;
            }
            AcceptedState::Deleted => {
                if observed_synced.is_none() {
                    return Err(SyncError::DeleteWithoutSynced {
                        path: p.to_string(),
                    });
                }
                if let Some(stats) = self.existing_on(target, p).await? {
                    if stats.is_directory {
                        self.ensure_empty(target, p).await?;
                    }
                    debug!(path = p, side = ?target, "removing entry");
                    match self.remove_on(target, p).await {
                        Err(e) if !e.is_not_exists() => return Err(e.into()),
                        _ => {}
                    }
                }
            }
        }

        let mut superseded = false;
        let mut reconciled = false;
        self.metadata
            .update(p, |current| match current {
                Some(c) if c.synced == observed_synced => {
                    if c.accepted.as_ref() == Some(&accepted) {
                        reconciled = true;
                        let next = c.reconciled();
                        // Nothing left to remember once both sides lack the path.
                        next.synced.is_some().then_some(next)
                    } else {
                        Some(EntrySyncMetadata {
                            synced: accepted.identity().cloned(),
                            ..c.clone()
                        })
                    }
                }
                other => {
                    superseded = true;
                    other.cloned()
                }
            })
            .await?;

        if superseded {
            warn!(path = p, "synced state changed while the job ran, leaving metadata as is");
            return Ok(JobOutcome::Superseded);
        }
        if reconciled {
            lock_recover(&self.diffs).remove(p);
        }
        info!(path = p, target = ?target, "job applied");
        Ok(JobOutcome::Applied)
    }

    /// Stats of `p` on `side`, `None` if it is absent.
    async fn existing_on(&self, side: Side, p: &str) -> Result<Option<EntryStats>, StorageError> {
        match self.stats_on(side, p).await {
            Ok(stats) => Ok(Some(stats)),
            Err(e) if e.is_not_exists() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Fail unless the directory `p` on `side` holds nothing but ignored
    /// entries.
    async fn ensure_empty(&self, side: Side, p: &str) -> Result<(), SyncError> {
        let names = match side {
            Side::Local => self.local.children(p).await?,
            Side::Remote => self.remote.children(p).await?,
        };
        let remaining = names
            .iter()
            .filter(|name| !self.policy.is_ignored(&path::join(p, name)))
            .count();
        if remaining > 0 {
            return Err(SyncError::TargetNotEmpty {
                path: p.to_string(),
                remaining,
            });
        }
        Ok(())
    }

    async fn stats_on(&self, side: Side, p: &str) -> Result<EntryStats, StorageError> {
        match side {
            Side::Local => self.local.stats(p).await,
            Side::Remote => self.remote.stats(p).await,
        }
    }

    async fn read_from(&self, side: Side, p: &str) -> Result<Vec<u8>, StorageError> {
        match side {
            Side::Local => self.local.read(p).await,
            Side::Remote => self.remote.read(p).await,
        }
    }

    async fn write_to(&self, side: Side, p: &str, data: &[u8]) -> Result<(), StorageError> {
        match side {
            Side::Local => self.local.write_or_create(p, data).await,
            Side::Remote => self.remote.write(p, data).await,
        }
    }

    async fn create_dir_on(&self, side: Side, p: &str) -> Result<(), StorageError> {
        match side {
            Side::Local => self.local.create_dir(p).await,
            Side::Remote => self.remote.create_dir(p).await,
        }
    }

    async fn remove_on(&self, side: Side, p: &str) -> Result<(), StorageError> {
        match side {
            Side::Local => self.local.remove(p).await,
            Side::Remote => self.remote.remove(p).await,
        }
    }
}

fn classify_scan(scan: &Scan, stored: &MetadataMap) -> Vec<DiffEntry> {
    scan.paths()
        .filter_map(|p| {
            let local = scan.local.get(p);
            let remote = scan.remote.get(p);
            let metadata = stored.get(p);
            let synced = metadata.and_then(|m| m.synced.as_ref());
            classify(local, remote, synced).map(|diff| DiffEntry {
                path: p.clone(),
                diff,
                local: local.cloned(),
                remote: remote.cloned(),
                metadata: metadata.cloned(),
            })
        })
        .collect()
}

/// Whether applying `meta` leaves no directory at its path.
fn clears_subtree(meta: &EntrySyncMetadata) -> bool {
    match &meta.accepted {
        Some(AcceptedState::Deleted) => true,
        Some(AcceptedState::Content(id)) => !id.is_directory(),
        None => false,
    }
}

fn has_pending_descendant(entries: &MetadataMap, p: &str) -> bool {
    let prefix = format!("{}/", p);
    entries
        .range(prefix.clone()..)
        .take_while(|(candidate, _)| candidate.starts_with(&prefix))
        .any(|(_, meta)| meta.is_pending())
}

/// Whether the stored metadata already records a decision for this diff.
fn has_decision(entry: &DiffEntry) -> bool {
    entry
        .metadata
        .as_ref()
        .map(|m| m.diff == Some(entry.diff) && m.action.is_some())
        .unwrap_or(false)
}

fn lock_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("orchestrator mutex was poisoned, recovering");
        poisoned.into_inner()
    })
}

// ---------------------------------------------------------------------------
// Update lock RAII guard
// ---------------------------------------------------------------------------

/// Drop guard that resets the `updating` flag to `false`.
struct SyncLockGuard(Arc<AtomicBool>);

impl Drop for SyncLockGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use async_trait::async_trait;
    use tokio::sync::Notify;

    /// Memory storage that parks the first call of an armed operation on an
    /// armed path until released.
    struct GatedStorage {
        inner: MemoryStorage,
        gate: Mutex<Option<(&'static str, String)>>,
        entered: Notify,
        release: Notify,
    }

    impl GatedStorage {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                inner: MemoryStorage::new(name),
                gate: Mutex::new(None),
                entered: Notify::new(),
                release: Notify::new(),
            })
        }

        fn arm(&self, op: &'static str, path: &str) {
            *lock_recover(&self.gate) = Some((op, path.to_string()));
        }

        async fn pass(&self, op: &'static str, path: &str) {
            let hit = {
                let mut gate = lock_recover(&self.gate);
                let hit = gate.as_ref().is_some_and(|(o, p)| *o == op && p == path);
                if hit {
                    gate.take();
                }
                hit
            };
            if hit {
                self.entered.notify_one();
                self.release.notified().await;
            }
        }
    }

    #[async_trait]
    impl Storage for GatedStorage {
        fn describe(&self) -> String {
            self.inner.describe()
        }

        async fn exists(&self, path: &str) -> Result<bool, StorageError> {
            self.pass("exists", path).await;
            self.inner.exists(path).await
        }

        async fn stats(&self, path: &str) -> Result<EntryStats, StorageError> {
            self.pass("stats", path).await;
            self.inner.stats(path).await
        }

        async fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
            self.pass("read", path).await;
            self.inner.read(path).await
        }

        async fn write_or_create(&self, path: &str, data: &[u8]) -> Result<(), StorageError> {
            self.pass("write_or_create", path).await;
            self.inner.write_or_create(path, data).await
        }

        async fn create_dir(&self, path: &str) -> Result<(), StorageError> {
            self.pass("create_dir", path).await;
            self.inner.create_dir(path).await
        }

        async fn remove(&self, path: &str) -> Result<(), StorageError> {
            self.pass("remove", path).await;
            self.inner.remove(path).await
        }

        async fn children(&self, path: &str) -> Result<Vec<String>, StorageError> {
            self.pass("children", path).await;
            self.inner.children(path).await
        }

        async fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
            self.pass("rename", from).await;
            self.inner.rename(from, to).await
        }
    }

    fn gated_remote_pair() -> (Arc<MemoryStorage>, Arc<GatedStorage>, Arc<SyncOrchestrator>) {
        let local = Arc::new(MemoryStorage::new("local"));
        let remote = GatedStorage::new("remote");
        let orchestrator = SyncOrchestrator::new(
            local.clone(),
            remote.clone(),
            Arc::new(SyncMetadataStore::in_memory()),
            IgnorePolicy::default(),
        );
        (local, remote, Arc::new(orchestrator))
    }

    struct Pair {
        local: Arc<MemoryStorage>,
        remote: Arc<MemoryStorage>,
        orchestrator: SyncOrchestrator,
    }

    fn pair() -> Pair {
        let local = Arc::new(MemoryStorage::new("local"));
        let remote = Arc::new(MemoryStorage::new("remote"));
        let orchestrator = SyncOrchestrator::new(
            local.clone(),
            remote.clone(),
            Arc::new(SyncMetadataStore::in_memory()),
            IgnorePolicy::default(),
        );
        Pair {
            local,
            remote,
            orchestrator,
        }
    }

    fn id(s: &str) -> ContentIdentity {
        ContentIdentity::of_bytes(s.as_bytes())
    }

    async fn run_all(orchestrator: &SyncOrchestrator) {
        loop {
            let jobs = orchestrator.get_jobs(10, |_| true);
            if jobs.is_empty() {
                break;
            }
            for job in jobs {
                orchestrator.do_job(&job).await.unwrap();
            }
        }
    }

    fn find<'a>(diffs: &'a [DiffEntry], p: &str) -> &'a DiffEntry {
        diffs.iter().find(|d| d.path == p).unwrap()
    }

    #[tokio::test]
    async fn test_identical_creates_do_not_differ() {
        let p = pair();
        p.local.insert_file("/same.txt", "hello");
        p.remote.insert_file("/same.txt", "hello");

        let diffs = p.orchestrator.get_diff("/").await.unwrap();
        assert!(diffs.is_empty());
    }

    #[tokio::test]
    async fn test_root_and_reserved_paths_are_not_diffed() {
        let p = pair();
        p.local.insert_file("/.treesync/config.json", "{}");
        p.local.insert_file("/.git/HEAD", "ref");
        p.remote.insert_file("/lib/node_modules/x.js", "x");

        let diffs = p.orchestrator.get_diff("/").await.unwrap();
        assert!(diffs.is_empty(), "unexpected diffs: {diffs:?}");
    }

    #[tokio::test]
    async fn test_divergence_from_baseline_is_conflicting() {
        let p = pair();
        p.orchestrator
            .metadata()
            .set("/doc.txt", Some(EntrySyncMetadata::synced(id("base"))))
            .await
            .unwrap();
        p.local.insert_file("/doc.txt", "mine");
        p.remote.insert_file("/doc.txt", "theirs");

        let diffs = p.orchestrator.get_diff("/").await.unwrap();
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].diff, DiffKind::ConflictingUpdate);
    }

    #[tokio::test]
    async fn test_accept_rejects_illegal_actions() {
        let p = pair();
        p.local.insert_file("/new.txt", "n");
        p.local.insert_file("/both.txt", "l");
        p.remote.insert_file("/both.txt", "r");
        let diffs = p.orchestrator.get_diff("/").await.unwrap();

        let clean = find(&diffs, "/new.txt");
        let err = p
            .orchestrator
            .accept(clean, SyncAction::AcceptRemote)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidAction { .. }));

        let conflict = find(&diffs, "/both.txt");
        let err = p
            .orchestrator
            .accept(conflict, SyncAction::AcceptAuto)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidAction { .. }));
        assert!(p.orchestrator.metadata().is_empty());
    }

    #[tokio::test]
    async fn test_accept_multi_validates_before_writing() {
        let p = pair();
        p.local.insert_file("/a.txt", "a");
        p.local.insert_file("/c.txt", "l");
        p.remote.insert_file("/c.txt", "r");
        let diffs = p.orchestrator.get_diff("/").await.unwrap();

        let decisions = vec![
            (find(&diffs, "/a.txt").clone(), SyncAction::AcceptAuto),
            (find(&diffs, "/c.txt").clone(), SyncAction::AcceptAuto),
        ];
        assert!(p.orchestrator.accept_multi(&decisions).await.is_err());
        assert!(p.orchestrator.metadata().is_empty());
    }

    #[tokio::test]
    async fn test_local_change_round_trip() {
        let p = pair();
        p.local.insert_file("/notes/todo.txt", "buy milk");

        let diffs = p.orchestrator.get_diff("/").await.unwrap();
        let decisions: Vec<_> = diffs
            .iter()
            .map(|d| (d.clone(), SyncAction::AcceptAuto))
            .collect();
        p.orchestrator.accept_multi(&decisions).await.unwrap();

        run_all(&p.orchestrator).await;

        assert_eq!(p.remote.file("/notes/todo.txt").unwrap(), b"buy milk");
        assert!(p.orchestrator.get_diff("/").await.unwrap().is_empty());
        assert_eq!(p.orchestrator.pending_jobs(), 0);
    }

    #[tokio::test]
    async fn test_remote_create_is_pulled_into_local() {
        let p = pair();
        p.remote.insert_file("/report.pdf", "pdf-bytes");

        let diffs = p.orchestrator.get_diff("/").await.unwrap();
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].diff, DiffKind::RemoteCreate);

        let decisions = vec![(diffs[0].clone(), SyncAction::AcceptAuto)];
        p.orchestrator.accept_multi(&decisions).await.unwrap();
        run_all(&p.orchestrator).await;

        assert_eq!(p.local.file("/report.pdf").unwrap(), b"pdf-bytes");
        assert!(p.orchestrator.get_diff("/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_single_local_change_yields_single_job() {
        let p = pair();
        p.local.insert_file("/only.txt", "x");
        let diffs = p.orchestrator.get_diff("/").await.unwrap();
        p.orchestrator
            .accept(&diffs[0], SyncAction::AcceptAuto)
            .await
            .unwrap();

        let jobs = p.orchestrator.get_jobs(3, |_| true);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].path, "/only.txt");
        assert!(p.orchestrator.get_jobs(3, |p| p != "/only.txt").is_empty());
    }

    #[tokio::test]
    async fn test_second_do_job_is_a_no_op() {
        let p = pair();
        p.local.insert_file("/f.txt", "f");
        let diffs = p.orchestrator.get_diff("/").await.unwrap();
        p.orchestrator
            .accept(&diffs[0], SyncAction::AcceptAuto)
            .await
            .unwrap();

        let job = p.orchestrator.get_jobs(1, |_| true).remove(0);
        assert_eq!(p.orchestrator.do_job(&job).await.unwrap(), JobOutcome::Applied);
        assert_eq!(p.orchestrator.do_job(&job).await.unwrap(), JobOutcome::Skipped);
        assert!(p.orchestrator.get_jobs(3, |_| true).is_empty());
    }

    #[tokio::test]
    async fn test_source_change_after_accept_fails_job() {
        let p = pair();
        p.local.insert_file("/f.txt", "v1");
        let diffs = p.orchestrator.get_diff("/").await.unwrap();
        p.orchestrator
            .accept(&diffs[0], SyncAction::AcceptAuto)
            .await
            .unwrap();

        p.local.insert_file("/f.txt", "v2");
        let job = p.orchestrator.get_jobs(1, |_| true).remove(0);
        let err = p.orchestrator.do_job(&job).await.unwrap_err();
        assert!(matches!(err, SyncError::SourceChanged { .. }));
        assert!(p.remote.file("/f.txt").is_none());
    }

    #[tokio::test]
    async fn test_conflict_resolved_toward_remote() {
        let p = pair();
        p.local.insert_file("/c.txt", "local");
        p.remote.insert_file("/c.txt", "remote");
        let diffs = p.orchestrator.get_diff("/").await.unwrap();
        assert_eq!(diffs[0].diff, DiffKind::ConflictingCreate);

        p.orchestrator
            .accept(&diffs[0], SyncAction::AcceptRemote)
            .await
            .unwrap();
        run_all(&p.orchestrator).await;

        assert_eq!(p.local.file("/c.txt").unwrap(), b"remote");
        let meta = p.orchestrator.metadata().get_entry("/c.txt").unwrap();
        assert_eq!(meta.synced, Some(id("remote")));
        assert_eq!(meta.action, None);
    }

    #[tokio::test]
    async fn test_deletion_propagates_and_clears_metadata() {
        let p = pair();
        p.remote.insert_file("/old.txt", "old");
        p.orchestrator
            .metadata()
            .set("/old.txt", Some(EntrySyncMetadata::synced(id("old"))))
            .await
            .unwrap();

        let diffs = p.orchestrator.get_diff("/").await.unwrap();
        assert_eq!(diffs[0].diff, DiffKind::LocalRemove);
        p.orchestrator
            .accept(&diffs[0], SyncAction::AcceptAuto)
            .await
            .unwrap();
        run_all(&p.orchestrator).await;

        assert!(p.remote.file("/old.txt").is_none());
        assert!(p.orchestrator.metadata().get_entry("/old.txt").is_none());
    }

    #[tokio::test]
    async fn test_deletion_without_synced_is_never_pending() {
        let p = pair();
        p.orchestrator
            .metadata()
            .set(
                "/ghost",
                Some(EntrySyncMetadata {
                    synced: None,
                    accepted: Some(AcceptedState::Deleted),
                    action: Some(SyncAction::AcceptAuto),
                    diff: Some(DiffKind::LocalRemove),
                }),
            )
            .await
            .unwrap();
        assert!(p.orchestrator.get_jobs(1, |_| true).is_empty());

        let job = Job {
            path: "/ghost".into(),
            metadata: EntrySyncMetadata::default(),
        };
        assert_eq!(p.orchestrator.do_job(&job).await.unwrap(), JobOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_pending_entry_converged_by_hand_is_cleared() {
        let p = pair();
        p.local.insert_file("/f.txt", "f");
        let diffs = p.orchestrator.get_diff("/").await.unwrap();
        p.orchestrator
            .accept(&diffs[0], SyncAction::AcceptAuto)
            .await
            .unwrap();

        p.remote.insert_file("/f.txt", "f");
        let report = p.orchestrator.update_diff("/").await.unwrap();
        assert_eq!(report.converged, 1);
        assert_eq!(p.orchestrator.pending_jobs(), 0);
        assert_eq!(
            p.orchestrator.metadata().get_entry("/f.txt").unwrap(),
            EntrySyncMetadata::synced(id("f"))
        );
    }

    #[tokio::test]
    async fn test_directories_are_created_before_children() {
        let p = pair();
        p.local.insert_file("/a/b/c.txt", "c");

        let diffs = p.orchestrator.get_diff("/").await.unwrap();
        assert_eq!(diffs.len(), 3);
        let decisions: Vec<_> = diffs
            .iter()
            .map(|d| (d.clone(), SyncAction::AcceptAuto))
            .collect();
        p.orchestrator.accept_multi(&decisions).await.unwrap();

        let jobs: Vec<String> = p
            .orchestrator
            .get_jobs(10, |_| true)
            .into_iter()
            .map(|j| j.path)
            .collect();
        assert_eq!(jobs, vec!["/a", "/a/b", "/a/b/c.txt"]);
    }

    #[tokio::test]
    async fn test_update_diff_auto_accepts_clean_kinds() {
        let p = pair();
        let orchestrator = p.orchestrator.with_auto_accept(default_auto_accept_rules());
        p.local.insert_file("/mine.txt", "m");
        p.local.insert_file("/both.txt", "l");
        p.remote.insert_file("/both.txt", "r");

        let report = orchestrator.update_diff("/").await.unwrap();
        assert_eq!(report.diffs, 2);
        assert_eq!(report.conflicts, 1);
        assert_eq!(report.auto_accepted, 1);
        assert_eq!(orchestrator.diffs().len(), 2);

        let jobs = orchestrator.get_jobs(10, |_| true);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].path, "/mine.txt");
    }

    #[tokio::test]
    async fn test_update_diff_keeps_entries_outside_root() {
        let p = pair();
        p.local.insert_file("/a/x.txt", "x");
        p.local.insert_file("/b/y.txt", "y");

        p.orchestrator.update_diff("/").await.unwrap();
        assert_eq!(p.orchestrator.diffs().len(), 4);

        p.remote.insert_file("/a/x.txt", "x");
        p.orchestrator.update_diff("/a").await.unwrap();

        let paths: Vec<String> = p.orchestrator.diffs().into_iter().map(|d| d.path).collect();
        assert_eq!(paths, vec!["/b", "/b/y.txt"]);
    }

    #[tokio::test]
    async fn test_update_diff_prunes_and_converges() {
        let p = pair();
        let store = p.orchestrator.metadata().clone();
        store
            .set("/gone.txt", Some(EntrySyncMetadata::synced(id("g"))))
            .await
            .unwrap();
        store
            .set("/same.txt", Some(EntrySyncMetadata::synced(id("old"))))
            .await
            .unwrap();
        p.local.insert_file("/same.txt", "new");
        p.remote.insert_file("/same.txt", "new");

        let report = p.orchestrator.update_diff("/").await.unwrap();
        assert_eq!(report.pruned, 1);
        assert_eq!(report.converged, 1);
        assert!(store.get_entry("/gone.txt").is_none());
        assert_eq!(store.get_entry("/same.txt").unwrap().synced, Some(id("new")));

        // A later re-creation on one side is a clean create, not a conflict.
        p.local.insert_file("/gone.txt", "again");
        let diffs = p.orchestrator.get_diff("/").await.unwrap();
        assert_eq!(diffs[0].diff, DiffKind::LocalCreate);
    }

    #[tokio::test]
    async fn test_update_diff_revokes_stale_acceptance() {
        let p = pair();
        p.orchestrator
            .metadata()
            .set("/doc.txt", Some(EntrySyncMetadata::synced(id("base"))))
            .await
            .unwrap();
        p.local.insert_file("/doc.txt", "mine");
        p.remote.insert_file("/doc.txt", "base");

        p.orchestrator.update_diff("/").await.unwrap();
        let entry = p.orchestrator.diff_for("/doc.txt").unwrap();
        assert_eq!(entry.diff, DiffKind::LocalUpdate);
        p.orchestrator
            .accept(&entry, SyncAction::AcceptAuto)
            .await
            .unwrap();
        assert_eq!(p.orchestrator.pending_jobs(), 1);

        // The remote side moves too: the local-wins acceptance must not
        // overwrite it.
        p.remote.insert_file("/doc.txt", "theirs");
        let report = p.orchestrator.update_diff("/").await.unwrap();
        assert_eq!(report.revoked, 1);
        assert_eq!(report.conflicts, 1);
        assert_eq!(p.orchestrator.pending_jobs(), 0);
    }

    #[tokio::test]
    async fn test_undecided_revokes_acceptance() {
        let p = pair();
        p.local.insert_file("/f.txt", "f");
        let diffs = p.orchestrator.get_diff("/").await.unwrap();
        p.orchestrator
            .accept(&diffs[0], SyncAction::AcceptAuto)
            .await
            .unwrap();
        assert_eq!(p.orchestrator.pending_jobs(), 1);

        let stored = p
            .orchestrator
            .accept(&diffs[0], SyncAction::Undecided)
            .await
            .unwrap();
        assert_eq!(stored.accepted, None);
        assert_eq!(stored.action, Some(SyncAction::Undecided));
        assert_eq!(p.orchestrator.pending_jobs(), 0);
    }

    #[tokio::test]
    async fn test_update_diff_is_single_flight() {
        let p = pair();
        p.orchestrator.updating.store(true, Ordering::SeqCst);
        let err = p.orchestrator.update_diff("/").await.unwrap_err();
        assert!(matches!(err, SyncError::AlreadyRunning { .. }));

        p.orchestrator.updating.store(false, Ordering::SeqCst);
        p.orchestrator.update_diff("/").await.unwrap();
        assert!(!p.orchestrator.is_updating());
    }

    #[tokio::test]
    async fn test_events_are_broadcast() {
        let p = pair();
        let mut events = p.orchestrator.subscribe();
        p.local.insert_file("/e.txt", "e");

        let diffs = p.orchestrator.get_diff("/").await.unwrap();
        p.orchestrator
            .accept(&diffs[0], SyncAction::AcceptAuto)
            .await
            .unwrap();

        match events.recv().await.unwrap() {
            SyncEvent::DiffAccepted { path, action, .. } => {
                assert_eq!(path, "/e.txt");
                assert_eq!(action, SyncAction::AcceptAuto);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_file_replaced_by_directory_propagates() {
        let p = pair();
        let orchestrator = p.orchestrator.with_auto_accept(default_auto_accept_rules());
        p.remote.insert_file("/x", "old");
        orchestrator
            .metadata()
            .set("/x", Some(EntrySyncMetadata::synced(id("old"))))
            .await
            .unwrap();
        p.local.insert_file("/x/c.txt", "c");

        let report = orchestrator.update_diff("/").await.unwrap();
        assert_eq!(orchestrator.diff_for("/x").unwrap().diff, DiffKind::LocalUpdate);
        assert_eq!(report.auto_accepted, 2);
        run_all(&orchestrator).await;

        assert!(p.remote.stats("/x").await.unwrap().is_directory);
        assert_eq!(p.remote.file("/x/c.txt").unwrap(), b"c");
        assert_eq!(
            orchestrator.metadata().get_entry("/x").unwrap().synced,
            Some(ContentIdentity::directory())
        );
        assert!(orchestrator.get_diff("/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_directory_deletion_removes_children_first() {
        let p = pair();
        let orchestrator = p.orchestrator.with_auto_accept(default_auto_accept_rules());
        let store = orchestrator.metadata().clone();
        store
            .set("/d", Some(EntrySyncMetadata::synced(ContentIdentity::directory())))
            .await
            .unwrap();
        store
            .set("/d/a.txt", Some(EntrySyncMetadata::synced(id("a"))))
            .await
            .unwrap();
        p.remote.insert_file("/d/a.txt", "a");

        orchestrator.update_diff("/").await.unwrap();
        let first: Vec<String> = orchestrator
            .get_jobs(10, |_| true)
            .into_iter()
            .map(|j| j.path)
            .collect();
        assert_eq!(first, vec!["/d/a.txt"]);

        run_all(&orchestrator).await;
        assert!(!p.remote.exists("/d").await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_directory_deletion_keeps_unsynced_remote_children() {
        let p = pair();
        let orchestrator = p.orchestrator.with_auto_accept(default_auto_accept_rules());
        let store = orchestrator.metadata().clone();
        store
            .set("/d", Some(EntrySyncMetadata::synced(ContentIdentity::directory())))
            .await
            .unwrap();
        store
            .set("/d/a.txt", Some(EntrySyncMetadata::synced(id("a"))))
            .await
            .unwrap();
        p.remote.insert_file("/d/a.txt", "a");
        p.remote.insert_file("/d/new.txt", "n");

        orchestrator.update_diff("/").await.unwrap();
        assert_eq!(orchestrator.diff_for("/d").unwrap().diff, DiffKind::LocalRemove);
        assert_eq!(
            orchestrator.diff_for("/d/new.txt").unwrap().diff,
            DiffKind::RemoteCreate
        );

        let jobs = orchestrator.get_jobs(10, |_| true);
        let paths: Vec<&str> = jobs.iter().map(|j| j.path.as_str()).collect();
        assert_eq!(paths, vec!["/d/a.txt", "/d/new.txt"]);
        for job in &jobs {
            orchestrator.do_job(job).await.unwrap();
        }

        // The new remote child keeps the directory alive on the remote side.
        let job = orchestrator.get_jobs(10, |_| true).remove(0);
        assert_eq!(job.path, "/d");
        let err = orchestrator.do_job(&job).await.unwrap_err();
        assert!(matches!(err, SyncError::TargetNotEmpty { remaining: 1, .. }));

        let report = orchestrator.update_diff("/").await.unwrap();
        assert_eq!(report.converged, 1);
        assert_eq!(orchestrator.pending_jobs(), 0);
        assert_eq!(p.remote.file("/d/new.txt").unwrap(), b"n");
        assert_eq!(p.local.file("/d/new.txt").unwrap(), b"n");
        assert!(p.remote.file("/d/a.txt").is_none());
    }

    #[tokio::test]
    async fn test_job_finishing_mid_scan_is_not_misread() {
        let local = GatedStorage::new("local");
        let remote = Arc::new(MemoryStorage::new("remote"));
        let orchestrator = Arc::new(
            SyncOrchestrator::new(
                local.clone(),
                remote.clone(),
                Arc::new(SyncMetadataStore::in_memory()),
                IgnorePolicy::default(),
            )
            .with_auto_accept(default_auto_accept_rules()),
        );
        local.inner.insert_file("/f.txt", "f");
        orchestrator.update_diff("/").await.unwrap();
        let job = orchestrator.get_jobs(1, |_| true).remove(0);

        // The remote side is captured before the local walk stalls, so the
        // pass sees the file on the local side only.
        local.arm("children", "/");
        let pass = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.update_diff("/").await })
        };
        local.entered.notified().await;
        assert_eq!(orchestrator.do_job(&job).await.unwrap(), JobOutcome::Applied);
        local.release.notify_one();
        pass.await.unwrap().unwrap();

        let meta = orchestrator.metadata().get_entry("/f.txt").unwrap();
        assert_eq!(meta.synced, Some(id("f")));
        assert_eq!(meta.accepted, Some(AcceptedState::Content(id("f"))));
        assert_eq!(orchestrator.pending_jobs(), 0);
        assert_eq!(local.inner.file("/f.txt").unwrap(), b"f");
        assert_eq!(remote.file("/f.txt").unwrap(), b"f");
        assert!(orchestrator.get_diff("/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_synced_change_during_job_supersedes() {
        let (local, remote, orchestrator) = gated_remote_pair();
        local.insert_file("/f.txt", "f");
        let diffs = orchestrator.get_diff("/").await.unwrap();
        orchestrator
            .accept(&diffs[0], SyncAction::AcceptAuto)
            .await
            .unwrap();
        let job = orchestrator.get_jobs(1, |_| true).remove(0);

        remote.arm("write_or_create", "/f.txt");
        let running = {
            let orchestrator = orchestrator.clone();
            let job = job.clone();
            tokio::spawn(async move { orchestrator.do_job(&job).await })
        };
        remote.entered.notified().await;
        let moved = EntrySyncMetadata {
            synced: Some(id("elsewhere")),
            ..job.metadata.clone()
        };
        orchestrator
            .metadata()
            .set("/f.txt", Some(moved.clone()))
            .await
            .unwrap();
        remote.release.notify_one();

        assert_eq!(running.await.unwrap().unwrap(), JobOutcome::Superseded);
        assert_eq!(orchestrator.metadata().get_entry("/f.txt").unwrap(), moved);
    }

    #[tokio::test]
    async fn test_acceptance_change_during_job_keeps_new_decision() {
        let (local, remote, orchestrator) = gated_remote_pair();
        local.insert_file("/f.txt", "f");
        let diffs = orchestrator.get_diff("/").await.unwrap();
        orchestrator
            .accept(&diffs[0], SyncAction::AcceptAuto)
            .await
            .unwrap();
        let job = orchestrator.get_jobs(1, |_| true).remove(0);

        remote.arm("write_or_create", "/f.txt");
        let running = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.do_job(&job).await })
        };
        remote.entered.notified().await;
        orchestrator
            .accept(&diffs[0], SyncAction::Undecided)
            .await
            .unwrap();
        remote.release.notify_one();

        assert_eq!(running.await.unwrap().unwrap(), JobOutcome::Applied);
        let meta = orchestrator.metadata().get_entry("/f.txt").unwrap();
        assert_eq!(meta.synced, Some(id("f")));
        assert_eq!(meta.accepted, None);
        assert_eq!(meta.action, Some(SyncAction::Undecided));
        assert!(!meta.is_pending());
        assert_eq!(remote.inner.file("/f.txt").unwrap(), b"f");
    }

    #[test]
    fn test_with_auto_accept_drops_illegal_rules() {
        let p = pair();
        let mut rules = default_auto_accept_rules();
        rules.insert(DiffKind::ConflictingCreate, SyncAction::AcceptAuto);
        let orchestrator = p.orchestrator.with_auto_accept(rules);
        assert_eq!(orchestrator.auto_accept.len(), 6);
    }
}
