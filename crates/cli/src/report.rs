//! `status`, `errors` and `audit`: read-only views over the sync metadata
//! and the database.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use comfy_table::{presets::UTF8_FULL, Cell, Color, ContentArrangement, Table};

use treesync_core::config::AppConfig;
use treesync_core::db::queries::AuditLogEntry;
use treesync_core::db::Database;
use treesync_core::SyncSession;

use super::style;

fn open_database(config: &AppConfig) -> Result<Database> {
    let db = Database::new(config.database_path()).context("failed to open database")?;
    db.initialize().context("failed to initialize database")?;
    Ok(db)
}

/// A daemon is considered alive if it finished a pass within two poll
/// intervals.
fn daemon_alive(last_update: Option<DateTime<Utc>>, poll_interval_secs: u64, now: DateTime<Utc>) -> bool {
    match last_update {
        Some(at) => (now - at).num_seconds() <= 2 * poll_interval_secs as i64,
        None => false,
    }
}

fn parse_time(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Display the status dashboard.
pub fn run_status(session: &SyncSession, config_path: &Path) -> Result<()> {
    let config = &session.config;
    let db = &session.db;

    let last_update = parse_time(db.get_state("last_update_at").context("failed to read state")?);
    let last_report: Option<serde_json::Value> = db
        .get_state("last_update_report")
        .context("failed to read state")?
        .and_then(|raw| serde_json::from_str(&raw).ok());

    println!();
    println!("{}", style::header("treesync"));
    println!("{}", "═".repeat(8));
    println!();

    let daemon = if daemon_alive(last_update, config.daemon.poll_interval_secs, Utc::now()) {
        style::status_running()
    } else {
        style::status_stopped()
    };
    println!("  Daemon       {}", daemon);
    println!("  Config       {}", config_path.display());
    println!(
        "  Local        {} {}",
        config.local.path.display(),
        style::dim(&session.local_id)
    );
    println!(
        "  Remote       {} {}",
        config.remote.path.display(),
        style::dim(&session.remote_id)
    );
    println!(
        "  Last pass    {}",
        last_update
            .map(|at| at.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "never".to_string())
    );

    println!();
    println!("  {}", style::header("Reconciliation"));
    println!("  {}", "─".repeat(40));
    println!("  Tracked paths    : {}", session.orchestrator.metadata().len());
    println!("  Pending jobs     : {}", session.orchestrator.pending_jobs());
    if let Some(report) = &last_report {
        println!("  Last diff count  : {}", report["diffs"]);
        println!("  Last conflicts   : {}", report["conflicts"]);
    }
    println!(
        "  Failed jobs      : {}",
        db.count_errors().context("failed to count errors")?
    );
    println!(
        "  Audit entries    : {}",
        db.count_audit_log().context("failed to count audit entries")?
    );
    println!();
    Ok(())
}

/// List recent job failures.
pub fn run_errors(config: &AppConfig, limit: u32) -> Result<()> {
    let db = open_database(config)?;
    let entries = db
        .list_audit_log(limit, Some("job_failed"))
        .context("failed to list job failures")?;

    println!();
    if entries.is_empty() {
        println!("{}", style::success("No job failures recorded"));
        println!();
        return Ok(());
    }

    println!(
        "{}",
        style::header(&format!("Recent job failures ({})", entries.len()))
    );
    println!();

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Time", "Path", "Error"]);
    for entry in &entries {
        table.add_row(vec![
            Cell::new(short_time(entry)),
            Cell::new(entry.path.as_deref().unwrap_or("—")),
            Cell::new(entry.details.as_deref().unwrap_or("")).fg(Color::Red),
        ]);
    }
    println!("{}", table);
    println!();
    Ok(())
}

/// List recent audit-log entries.
pub fn run_audit(config: &AppConfig, limit: u32, action: Option<&str>) -> Result<()> {
    let db = open_database(config)?;
    let entries = db
        .list_audit_log(limit, action)
        .context("failed to list audit entries")?;

    if entries.is_empty() {
        println!("No audit log entries found.");
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Time", "Action", "Path", "Details", ""]);
    for entry in &entries {
        let marker = if entry.success {
            Cell::new("✓").fg(Color::Green)
        } else {
            Cell::new("✗").fg(Color::Red)
        };
        table.add_row(vec![
            Cell::new(short_time(entry)),
            Cell::new(&entry.action),
            Cell::new(entry.path.as_deref().unwrap_or("—")),
            Cell::new(truncate(entry.details.as_deref().unwrap_or(""), 60)),
            marker,
        ]);
    }

    println!("{}", table);
    println!("{} entries shown", entries.len());
    Ok(())
}

fn short_time(entry: &AuditLogEntry) -> String {
    entry.created_at.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
