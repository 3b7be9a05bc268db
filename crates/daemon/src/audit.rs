//! Audit recorder: persists orchestrator and runner events to the
//! `audit_log` table.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

use treesync_core::db::queries::AuditEntry;
use treesync_core::db::Database;
use treesync_core::models::SyncEvent;
use treesync_core::runner::{is_shutdown_requested, ShutdownFlag};

/// Consume events until the channel closes or `shutdown` is set.
///
/// Returns the number of audit rows written.
pub async fn record_events(
    db: Arc<Database>,
    mut events: broadcast::Receiver<SyncEvent>,
    shutdown: ShutdownFlag,
) -> u64 {
    let mut written = 0u64;

    loop {
        let event = match tokio::time::timeout(Duration::from_secs(1), events.recv()).await {
            Ok(Ok(event)) => event,
            Ok(Err(RecvError::Lagged(missed))) => {
                warn!(missed, "audit recorder lagged behind, events dropped");
                let entry = AuditEntry::failure(
                    "audit_lagged",
                    &format!("{} events were not recorded", missed),
                );
                if db.insert_audit_entry(&entry).is_ok() {
                    written += 1;
                }
                continue;
            }
            Ok(Err(RecvError::Closed)) => break,
            Err(_) => {
                if is_shutdown_requested(&shutdown) {
                    break;
                }
                continue;
            }
        };

        let Some(entry) = AuditEntry::from_event(&event) else {
            continue;
        };
        match db.insert_audit_entry(&entry) {
            Ok(id) => {
                written += 1;
                debug!(id, action = %entry.action, "recorded audit entry");
            }
            Err(e) => warn!(error = %e, action = %entry.action, "failed to write audit entry"),
        }
    }

    info!(written, "audit recorder stopped");
    written
}
