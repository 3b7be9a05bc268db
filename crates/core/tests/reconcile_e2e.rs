//! End-to-end reconciliation tests over two filesystem trees.
//!
//! These tests exercise the real `SyncOrchestrator` and `JobRunner` with:
//! - Two `FsStorage` directories under a temp dir
//! - Metadata persisted as JSON inside the local tree
//! - Real job execution through the runner
//!
//! No network I/O.

use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;

use treesync_core::diff::DiffKind;
use treesync_core::ignore::IgnorePolicy;
use treesync_core::metadata::{StorageMetadataBackend, SyncAction, SyncMetadataStore};
use treesync_core::orchestrator::{default_auto_accept_rules, SyncOrchestrator};
use treesync_core::runner::{JobRunner, RunMode, RunnerConfig};
use treesync_core::storage::{FsStorage, Storage};
use treesync_core::storage_id::{ensure_storage_id, metadata_file_path};

// ===========================================================================
// Helpers
// ===========================================================================

struct Env {
    _tmp: TempDir,
    local_dir: std::path::PathBuf,
    remote_dir: std::path::PathBuf,
}

impl Env {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let local_dir = tmp.path().join("local");
        let remote_dir = tmp.path().join("remote");
        std::fs::create_dir_all(&local_dir).unwrap();
        std::fs::create_dir_all(&remote_dir).unwrap();
        Self {
            _tmp: tmp,
            local_dir,
            remote_dir,
        }
    }

    /// Build an orchestrator the way a fresh process would.
    async fn orchestrator(&self, auto: bool) -> Arc<SyncOrchestrator> {
        let local: Arc<dyn Storage> = Arc::new(FsStorage::open(self.local_dir.clone()).unwrap());
        let remote: Arc<dyn Storage> = Arc::new(FsStorage::open(self.remote_dir.clone()).unwrap());
        let remote_id = ensure_storage_id(remote.as_ref()).await.unwrap();
        ensure_storage_id(local.as_ref()).await.unwrap();

        let backend = StorageMetadataBackend::new(local.clone(), metadata_file_path(&remote_id));
        let metadata = Arc::new(SyncMetadataStore::open(Box::new(backend)).await.unwrap());

        let mut orchestrator =
            SyncOrchestrator::new(local, remote, metadata, IgnorePolicy::default());
        if auto {
            orchestrator = orchestrator.with_auto_accept(default_auto_accept_rules());
        }
        Arc::new(orchestrator)
    }
}

fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

fn read(root: &Path, rel: &str) -> Option<String> {
    std::fs::read_to_string(root.join(rel)).ok()
}

async fn run(orchestrator: &Arc<SyncOrchestrator>) -> treesync_core::models::RunStats {
    JobRunner::new(orchestrator.clone(), RunnerConfig::default())
        .run(RunMode::UntilIdle)
        .await
        .unwrap()
}

// ===========================================================================
// Scenarios
// ===========================================================================

#[tokio::test]
async fn test_identical_trees_have_no_diff() {
    let env = Env::new();
    write(&env.local_dir, "docs/readme.md", "same");
    write(&env.remote_dir, "docs/readme.md", "same");

    let orchestrator = env.orchestrator(false).await;
    let report = orchestrator.update_diff("/").await.unwrap();
    assert_eq!(report.diffs, 0);
}

#[tokio::test]
async fn test_full_bidirectional_pass() {
    let env = Env::new();
    write(&env.local_dir, "src/main.rs", "fn main() {}");
    write(&env.remote_dir, "assets/logo.svg", "<svg/>");

    let orchestrator = env.orchestrator(true).await;
    let report = orchestrator.update_diff("/").await.unwrap();
    assert_eq!(report.conflicts, 0);
    assert_eq!(report.auto_accepted, report.diffs);

    let stats = run(&orchestrator).await;
    assert_eq!(stats.failed, 0);

    assert_eq!(read(&env.remote_dir, "src/main.rs").as_deref(), Some("fn main() {}"));
    assert_eq!(read(&env.local_dir, "assets/logo.svg").as_deref(), Some("<svg/>"));
    assert!(orchestrator.get_diff("/").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_conflict_survives_restart_and_is_resolved() {
    let env = Env::new();
    write(&env.local_dir, "notes.txt", "base");
    write(&env.remote_dir, "notes.txt", "base");

    // One pass so there is persisted metadata to reload, then diverge.
    {
        let orchestrator = env.orchestrator(true).await;
        write(&env.local_dir, "seed.txt", "seed");
        orchestrator.update_diff("/").await.unwrap();
        run(&orchestrator).await;
    }
    write(&env.local_dir, "notes.txt", "local edit");
    write(&env.remote_dir, "notes.txt", "remote edit");

    let orchestrator = env.orchestrator(true).await;
    let report = orchestrator.update_diff("/").await.unwrap();
    assert_eq!(report.conflicts, 1);
    let entry = orchestrator.diff_for("/notes.txt").unwrap();
    assert_eq!(entry.diff, DiffKind::ConflictingCreate);

    // Nothing is applied for an unresolved conflict.
    let stats = run(&orchestrator).await;
    assert_eq!(stats.total(), 0);

    // A new process still sees the conflict.
    let orchestrator = env.orchestrator(true).await;
    orchestrator.update_diff("/").await.unwrap();
    let entry = orchestrator.diff_for("/notes.txt").unwrap();
    orchestrator
        .accept(&entry, SyncAction::AcceptLocal)
        .await
        .unwrap();
    run(&orchestrator).await;

    assert_eq!(read(&env.remote_dir, "notes.txt").as_deref(), Some("local edit"));
    assert!(orchestrator.get_diff("/").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_diverging_from_synced_baseline_conflicts() {
    let env = Env::new();
    write(&env.local_dir, "a.txt", "v1");

    let orchestrator = env.orchestrator(true).await;
    orchestrator.update_diff("/").await.unwrap();
    run(&orchestrator).await;
    assert_eq!(read(&env.remote_dir, "a.txt").as_deref(), Some("v1"));

    write(&env.local_dir, "a.txt", "v2-local");
    write(&env.remote_dir, "a.txt", "v2-remote");
    orchestrator.update_diff("/").await.unwrap();
    assert_eq!(
        orchestrator.diff_for("/a.txt").unwrap().diff,
        DiffKind::ConflictingUpdate
    );
}

#[tokio::test]
async fn test_remote_file_is_pulled() {
    let env = Env::new();
    write(&env.remote_dir, "inbox/report.csv", "a,b\n1,2\n");

    let orchestrator = env.orchestrator(false).await;
    orchestrator.update_diff("/").await.unwrap();
    let decisions: Vec<_> = orchestrator
        .diffs()
        .into_iter()
        .map(|entry| {
            assert_eq!(entry.diff, DiffKind::RemoteCreate);
            (entry, SyncAction::AcceptAuto)
        })
        .collect();
    assert_eq!(decisions.len(), 2);
    orchestrator.accept_multi(&decisions).await.unwrap();
    run(&orchestrator).await;

    assert_eq!(
        std::fs::read(env.local_dir.join("inbox/report.csv")).unwrap(),
        b"a,b\n1,2\n"
    );
    assert!(orchestrator.get_diff("/").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_single_local_change_is_one_job() {
    let env = Env::new();
    write(&env.local_dir, "one.txt", "1");

    let orchestrator = env.orchestrator(false).await;
    let diffs = orchestrator.get_diff("/").await.unwrap();
    assert_eq!(diffs.len(), 1);
    orchestrator
        .accept(&diffs[0], SyncAction::AcceptAuto)
        .await
        .unwrap();
    assert_eq!(orchestrator.get_jobs(3, |_| true).len(), 1);
}

#[tokio::test]
async fn test_deletions_propagate_both_ways() {
    let env = Env::new();
    write(&env.local_dir, "keep/a.txt", "a");
    write(&env.local_dir, "drop/b.txt", "b");

    let orchestrator = env.orchestrator(true).await;
    orchestrator.update_diff("/").await.unwrap();
    run(&orchestrator).await;
    assert!(env.remote_dir.join("drop/b.txt").exists());

    std::fs::remove_dir_all(env.local_dir.join("drop")).unwrap();
    std::fs::remove_file(env.remote_dir.join("keep/a.txt")).unwrap();

    let report = orchestrator.update_diff("/").await.unwrap();
    assert_eq!(report.conflicts, 0);
    run(&orchestrator).await;

    assert!(!env.remote_dir.join("drop").exists());
    assert!(!env.local_dir.join("keep/a.txt").exists());
    assert!(orchestrator.get_diff("/").await.unwrap().is_empty());
    assert!(orchestrator.metadata().get_entry("/drop/b.txt").is_none());
}

#[tokio::test]
async fn test_reserved_subtrees_are_not_synced() {
    let env = Env::new();
    write(&env.local_dir, ".git/HEAD", "ref: refs/heads/main");
    write(&env.local_dir, "web/node_modules/pkg/index.js", "x");
    write(&env.local_dir, "web/index.html", "<html/>");

    let orchestrator = env.orchestrator(true).await;
    orchestrator.update_diff("/").await.unwrap();
    run(&orchestrator).await;

    assert!(env.remote_dir.join("web/index.html").exists());
    assert!(!env.remote_dir.join(".git").exists());
    assert!(!env.remote_dir.join("web/node_modules").exists());
}
