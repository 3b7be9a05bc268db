//! Diff scheduler that refreshes the reconciliation state on a configurable
//! interval.
//!
//! Each cycle runs `update_diff` over the configured root. Auto-accepted
//! entries become pending jobs that the job runner picks up on its own
//! schedule; conflicts stay in the diff list until resolved from the CLI.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use treesync_core::db::Database;
use treesync_core::errors::SyncError;
use treesync_core::models::UpdateReport;
use treesync_core::orchestrator::SyncOrchestrator;
use treesync_core::runner::{is_shutdown_requested, ShutdownFlag};

/// Tracks aggregate statistics across diff cycles.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    pub total_cycles: AtomicU64,
    pub skipped_cycles: AtomicU64,
    pub total_conflicts: AtomicU64,
    pub total_errors: AtomicU64,
    pub consecutive_errors: AtomicU64,
}

/// How a single cycle ended.
#[derive(Debug)]
pub enum CycleResult {
    Completed(UpdateReport),
    /// Another `update_diff` pass was still running.
    Skipped,
    Failed(SyncError),
}

/// The diff scheduler.
pub struct Scheduler {
    orchestrator: Arc<SyncOrchestrator>,
    db: Arc<Database>,
    root: String,
    poll_interval: Duration,
    stats: Arc<SchedulerStats>,
}

impl Scheduler {
    pub fn new(
        orchestrator: Arc<SyncOrchestrator>,
        db: Arc<Database>,
        root: impl Into<String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            orchestrator,
            db,
            root: root.into(),
            poll_interval,
            stats: Arc::new(SchedulerStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<SchedulerStats> {
        self.stats.clone()
    }

    /// Main scheduler loop. Runs one cycle immediately, then one per poll
    /// interval until `shutdown` is set.
    pub async fn run(&self, shutdown: ShutdownFlag) {
        info!(
            root = %self.root,
            poll_interval_secs = self.poll_interval.as_secs(),
            "scheduler started"
        );

        loop {
            if is_shutdown_requested(&shutdown) {
                info!("shutdown requested, exiting scheduler loop");
                break;
            }

            self.run_cycle().await;

            // Sleep with early exit on shutdown
            let sleep_step = Duration::from_secs(1);
            let mut slept = Duration::ZERO;
            while slept < self.poll_interval {
                if is_shutdown_requested(&shutdown) {
                    info!("shutdown requested during sleep, exiting scheduler loop");
                    return;
                }
                tokio::time::sleep(sleep_step).await;
                slept += sleep_step;
            }
        }
    }

    /// Run one `update_diff` pass and record its outcome.
    pub async fn run_cycle(&self) -> CycleResult {
        let cycle_num = self.stats.total_cycles.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(cycle = cycle_num, root = %self.root, "starting diff cycle");

        match self.orchestrator.update_diff(&self.root).await {
            Ok(report) => {
                self.stats.consecutive_errors.store(0, Ordering::SeqCst);
                self.stats
                    .total_conflicts
                    .fetch_add(report.conflicts as u64, Ordering::SeqCst);

                if report.diffs > 0 {
                    info!(
                        cycle = cycle_num,
                        diffs = report.diffs,
                        conflicts = report.conflicts,
                        auto_accepted = report.auto_accepted,
                        pending = self.orchestrator.pending_jobs(),
                        "diff cycle completed with changes"
                    );
                }
                self.record_cycle(&report);
                CycleResult::Completed(report)
            }
            Err(SyncError::AlreadyRunning { started_at }) => {
                self.stats.skipped_cycles.fetch_add(1, Ordering::SeqCst);
                warn!(
                    cycle = cycle_num,
                    started_at = %started_at,
                    "skipping diff cycle: previous pass still running"
                );
                CycleResult::Skipped
            }
            Err(e) => {
                let errors = self.stats.total_errors.fetch_add(1, Ordering::SeqCst) + 1;
                let consecutive = self
                    .stats
                    .consecutive_errors
                    .fetch_add(1, Ordering::SeqCst)
                    + 1;
                error!(
                    cycle = cycle_num,
                    error = %e,
                    total_errors = errors,
                    consecutive_errors = consecutive,
                    "diff cycle failed"
                );
                CycleResult::Failed(e)
            }
        }
    }

    /// Persist the last cycle summary so `treesync status` can show it.
    fn record_cycle(&self, report: &UpdateReport) {
        let summary = serde_json::json!({
            "root": self.root,
            "diffs": report.diffs,
            "conflicts": report.conflicts,
            "auto_accepted": report.auto_accepted,
            "pruned": report.pruned,
            "converged": report.converged,
            "revoked": report.revoked,
        });
        let result = self
            .db
            .set_state("last_update_at", &Utc::now().to_rfc3339())
            .and_then(|()| self.db.set_state("last_update_report", &summary.to_string()));
        if let Err(e) = result {
            warn!(error = %e, "failed to record diff cycle state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    use treesync_core::config::AppConfig;
    use treesync_core::SyncSession;

    async fn session(dir: &std::path::Path) -> SyncSession {
        let mut config = AppConfig::new(dir.join("local"), dir.join("remote"));
        config.daemon.data_dir = dir.join("data");
        SyncSession::open(config).await.unwrap()
    }

    #[tokio::test]
    async fn test_cycle_records_state() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path()).await;
        std::fs::write(dir.path().join("local/a.txt"), "a").unwrap();

        let scheduler = Scheduler::new(
            session.orchestrator.clone(),
            session.db.clone(),
            "/",
            Duration::from_secs(60),
        );
        match scheduler.run_cycle().await {
            CycleResult::Completed(report) => assert_eq!(report.diffs, 1),
            other => panic!("unexpected cycle result: {:?}", other),
        }
        assert_eq!(session.orchestrator.pending_jobs(), 1);
        assert!(session.db.get_state("last_update_at").unwrap().is_some());

        let summary: serde_json::Value = serde_json::from_str(
            &session.db.get_state("last_update_report").unwrap().unwrap(),
        )
        .unwrap();
        assert_eq!(summary["diffs"], 1);
        assert_eq!(scheduler.stats().total_cycles.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_exits_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path()).await;
        let scheduler = Scheduler::new(
            session.orchestrator.clone(),
            session.db.clone(),
            "/",
            Duration::from_secs(3600),
        );

        let shutdown: ShutdownFlag = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            flag.store(true, Ordering::SeqCst);
        });

        tokio::time::timeout(Duration::from_secs(10), scheduler.run(shutdown))
            .await
            .unwrap();
        assert_eq!(scheduler.stats().total_cycles.load(Ordering::SeqCst), 1);
    }
}
