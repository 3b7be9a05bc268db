//! Typed query helpers for every table in the treesync database.

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::Database;
use crate::errors::DatabaseError;
use crate::metadata::{EntrySyncMetadata, MetadataMap};
use crate::models::SyncEvent;

// ---------------------------------------------------------------------------
// Domain structs returned by queries
// ---------------------------------------------------------------------------

/// A row from the `audit_log` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: i64,
    pub action: String,
    pub path: Option<String>,
    pub details: Option<String>,
    pub success: bool,
    pub created_at: DateTime<Utc>,
}

/// An audit record about to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    pub action: String,
    pub path: Option<String>,
    pub details: String,
    pub success: bool,
}

impl AuditEntry {
    pub fn success(action: &str, details: &str) -> Self {
        Self {
            action: action.into(),
            path: None,
            details: details.into(),
            success: true,
        }
    }

    pub fn failure(action: &str, details: &str) -> Self {
        Self {
            success: false,
            ..Self::success(action, details)
        }
    }

    pub fn with_path(mut self, path: &str) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Audit record for a change event; `None` for events not worth keeping.
    pub fn from_event(event: &SyncEvent) -> Option<Self> {
        let entry = match event {
            SyncEvent::DiffUpdated { report, .. } => Self::success(
                event.action(),
                &format!(
                    "diffs: {}, conflicts: {}, auto-accepted: {}, pruned: {}, converged: {}, revoked: {}",
                    report.diffs,
                    report.conflicts,
                    report.auto_accepted,
                    report.pruned,
                    report.converged,
                    report.revoked
                ),
            ),
            SyncEvent::DiffAccepted { diff, action, .. } => {
                Self::success(event.action(), &format!("{} resolved with {}", diff, action))
            }
            SyncEvent::JobFinished { outcome, .. } => {
                Self::success(event.action(), &outcome.to_string())
            }
            SyncEvent::JobFailed { error, .. } => Self::failure(event.action(), error),
            SyncEvent::JobStarted { .. } | SyncEvent::RunnerIdle => return None,
        };
        Some(match event.path() {
            Some(path) => entry.with_path(path),
            None => entry,
        })
    }
}

// ---------------------------------------------------------------------------
// Query implementations
// ---------------------------------------------------------------------------

impl Database {
    // -- sync_metadata ------------------------------------------------------

    /// Load the full metadata map.
    pub fn load_sync_metadata(&self) -> Result<MetadataMap, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT path, entry FROM sync_metadata ORDER BY path")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut map = MetadataMap::new();
        for (path, entry) in rows {
            let meta: EntrySyncMetadata = serde_json::from_str(&entry)?;
            map.insert(path, meta);
        }
        Ok(map)
    }

    /// Replace the stored metadata map with `map` in one transaction.
    pub fn replace_sync_metadata(&self, map: &MetadataMap) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.transaction(|conn| {
            conn.execute("DELETE FROM sync_metadata", [])?;
            let mut stmt = conn.prepare(
                "INSERT INTO sync_metadata (path, entry, updated_at) VALUES (?1, ?2, ?3)",
            )?;
            for (path, meta) in map {
                let entry = serde_json::to_string(meta)?;
                stmt.execute(params![path, entry, now])?;
            }
            Ok(())
        })?;
        debug!(entries = map.len(), "replaced sync_metadata");
        Ok(())
    }

    /// Number of stored metadata entries.
    pub fn count_sync_metadata(&self) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM sync_metadata", [], |row| row.get(0))?;
        Ok(count)
    }

    // -- audit_log ----------------------------------------------------------

    /// Insert an audit-log entry.
    pub fn insert_audit_log(
        &self,
        action: &str,
        path: Option<&str>,
        details: Option<&str>,
        success: bool,
    ) -> Result<i64, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO audit_log (action, path, details, success, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![action, path, details, success, now],
        )?;
        let id = conn.last_insert_rowid();
        debug!(id, action, "inserted audit_log entry");
        Ok(id)
    }

    /// Insert an audit entry from a model struct.
    pub fn insert_audit_entry(&self, entry: &AuditEntry) -> Result<i64, DatabaseError> {
        self.insert_audit_log(
            &entry.action,
            entry.path.as_deref(),
            Some(&entry.details),
            entry.success,
        )
    }

    /// List recent audit-log entries, newest first.
    pub fn list_audit_log(
        &self,
        limit: u32,
        action: Option<&str>,
    ) -> Result<Vec<AuditLogEntry>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, action, path, details, success, created_at
             FROM audit_log
             WHERE ?1 IS NULL OR action = ?1
             ORDER BY id DESC LIMIT ?2",
        )?;
        let entries = stmt
            .query_map(params![action, limit], |row| {
                let created_at: String = row.get(5)?;
                Ok(AuditLogEntry {
                    id: row.get(0)?,
                    action: row.get(1)?,
                    path: row.get(2)?,
                    details: row.get(3)?,
                    success: row.get(4)?,
                    created_at: parse_datetime(&created_at),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Count audit-log entries.
    pub fn count_audit_log(&self) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM audit_log", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Count failed audit-log entries.
    pub fn count_errors(&self) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM audit_log WHERE success = 0",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // -- kv_state -----------------------------------------------------------

    /// Get a key-value state entry.
    pub fn get_state(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT value FROM kv_state WHERE key = ?1")?;
        let mut rows = stmt.query_map(params![key], |row| row.get::<_, String>(0))?;
        match rows.next() {
            Some(Ok(val)) => Ok(Some(val)),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    /// Set a key-value state entry (upsert).
    pub fn set_state(&self, key: &str, value: &str) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO kv_state (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now],
        )?;
        debug!(key, value, "set kv_state");
        Ok(())
    }
}

/// Parse a datetime string, returning Utc::now() as a fallback if parsing fails.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
