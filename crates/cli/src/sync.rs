//! `sync`: one reconciliation pass followed by a bounded job run.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::oneshot;

use treesync_core::db::queries::AuditEntry;
use treesync_core::db::Database;
use treesync_core::models::SyncEvent;
use treesync_core::path;
use treesync_core::runner::RunMode;
use treesync_core::SyncSession;

use super::style;

/// Refresh the diff (unless `no_refresh`), then apply pending jobs until
/// nothing is runnable.
pub async fn run_sync(session: &SyncSession, root: Option<&str>, no_refresh: bool) -> Result<()> {
    let root = path::normalize(root.unwrap_or(session.root()));

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner:.blue} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    spinner.enable_steady_tick(Duration::from_millis(100));

    let (stop_tx, stop_rx) = oneshot::channel();
    let progress = tokio::spawn(follow_events(
        session.db.clone(),
        session.orchestrator.subscribe(),
        spinner.clone(),
        stop_rx,
    ));

    let runner = session.runner();
    let outcome = async {
        let report = if no_refresh {
            None
        } else {
            spinner.set_message(format!("Comparing trees under {}...", root));
            Some(
                session
                    .orchestrator
                    .update_diff(&root)
                    .await
                    .context("failed to compute diff")?,
            )
        };

        spinner.set_message("Applying jobs...");
        let stats = runner
            .run(RunMode::UntilIdle)
            .await
            .context("job run failed")?;
        anyhow::Ok((report, stats))
    }
    .await;

    let _ = stop_tx.send(());
    let recorded = progress.await.unwrap_or(0);
    spinner.finish_and_clear();

    let (report, stats) = outcome?;

    if let Some(report) = &report {
        println!(
            "{}",
            style::dim(&format!(
                "{} diff(s), {} conflict(s), {} auto-accepted",
                report.diffs, report.conflicts, report.auto_accepted
            ))
        );
    }
    if stats.failed == 0 {
        println!("{}", style::success("Sync complete"));
    } else {
        println!("{}", style::warn("Sync finished with failures"));
    }
    println!("  Applied    : {}", stats.applied);
    println!("  Skipped    : {}", stats.skipped);
    println!("  Superseded : {}", stats.superseded);
    println!("  Failed     : {}", stats.failed);

    for record in runner.errors() {
        println!("  {}", style::error(&format!("{}: {}", record.path, record.error)));
    }

    let undecided = session
        .orchestrator
        .diffs()
        .into_iter()
        .filter(|entry| entry.diff.is_conflicting() && !entry.is_decided())
        .count();
    if undecided > 0 {
        println!();
        println!(
            "{}",
            style::warn(&format!(
                "{} conflict(s) need a decision: run 'treesync resolve'",
                undecided
            ))
        );
    }
    tracing::debug!(recorded, "audit entries written");
    Ok(())
}

/// Mirror runner progress on the spinner and persist audit entries until
/// `stop` fires, then drain what is left.
async fn follow_events(
    db: Arc<Database>,
    mut events: broadcast::Receiver<SyncEvent>,
    spinner: ProgressBar,
    mut stop: oneshot::Receiver<()>,
) -> usize {
    let mut recorded = 0;
    let mut finished = 0usize;

    loop {
        let event = tokio::select! {
            received = events.recv() => match received {
                Ok(event) => event,
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "audit events dropped");
                    continue;
                }
                Err(RecvError::Closed) => break,
            },
            _ = &mut stop => break,
        };
        if let SyncEvent::JobFinished { .. } | SyncEvent::JobFailed { .. } = event {
            finished += 1;
            spinner.set_message(format!("Applying jobs... {} done", finished));
        }
        recorded += record(&db, &event);
    }

    while let Ok(event) = events.try_recv() {
        recorded += record(&db, &event);
    }
    recorded
}

fn record(db: &Database, event: &SyncEvent) -> usize {
    let Some(entry) = AuditEntry::from_event(event) else {
        return 0;
    };
    match db.insert_audit_entry(&entry) {
        Ok(_) => 1,
        Err(e) => {
            tracing::warn!(error = %e, "failed to write audit entry");
            0
        }
    }
}
