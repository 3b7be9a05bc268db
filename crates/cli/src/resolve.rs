//! `diff`, `accept` and `resolve`: inspecting differences and recording
//! resolutions.

use anyhow::{Context, Result};
use comfy_table::{presets::UTF8_FULL, Cell, Color, ContentArrangement, Table};
use dialoguer::Select;

use treesync_core::diff::{DiffEntry, DiffKind, DiffSide};
use treesync_core::identity::ContentIdentity;
use treesync_core::metadata::SyncAction;
use treesync_core::models::UpdateReport;
use treesync_core::path;
use treesync_core::SyncSession;

use super::{record_events, style};

/// Refresh the diff and print it as a table.
pub async fn run_diff(session: &SyncSession, root: Option<&str>, conflicts_only: bool) -> Result<()> {
    let root = path::normalize(root.unwrap_or(session.root()));
    let mut events = session.orchestrator.subscribe();
    let report = session
        .orchestrator
        .update_diff(&root)
        .await
        .context("failed to compute diff")?;
    record_events(session, &mut events);

    let entries: Vec<DiffEntry> = session
        .orchestrator
        .diffs()
        .into_iter()
        .filter(|entry| !conflicts_only || entry.diff.is_conflicting())
        .collect();

    println!();
    if entries.is_empty() {
        let msg = if conflicts_only {
            "No conflicts"
        } else {
            "Trees are in sync"
        };
        println!("{}", style::success(msg));
        print_report(&report);
        println!();
        return Ok(());
    }

    println!(
        "{}",
        style::header(&format!("Differences under {} ({})", root, entries.len()))
    );
    println!();
    println!("{}", diff_table(&entries));
    print_report(&report);
    println!();
    Ok(())
}

fn diff_table(entries: &[DiffEntry]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Path", "Diff", "Local", "Remote", "Decision"]);

    for entry in entries {
        table.add_row(vec![
            Cell::new(&entry.path),
            diff_cell(entry.diff),
            Cell::new(identity_label(entry.local.as_ref())),
            Cell::new(identity_label(entry.remote.as_ref())),
            Cell::new(decision_label(entry)),
        ]);
    }
    table
}

fn diff_cell(kind: DiffKind) -> Cell {
    let color = match kind.side() {
        DiffSide::Local => Color::Blue,
        DiffSide::Remote => Color::Green,
        DiffSide::Conflict => Color::Red,
    };
    Cell::new(kind.as_str()).fg(color)
}

fn print_report(report: &UpdateReport) {
    println!(
        "{}",
        style::dim(&format!(
            "{} diff(s), {} conflict(s), {} auto-accepted, {} pruned, {} converged, {} revoked",
            report.diffs,
            report.conflicts,
            report.auto_accepted,
            report.pruned,
            report.converged,
            report.revoked
        ))
    );
}

fn identity_label(identity: Option<&ContentIdentity>) -> String {
    match identity {
        Some(identity) if identity.is_directory() => "dir".to_string(),
        Some(identity) => identity.short().to_string(),
        None => "—".to_string(),
    }
}

fn decision_label(entry: &DiffEntry) -> String {
    if !entry.is_decided() {
        return "—".to_string();
    }
    entry
        .metadata
        .as_ref()
        .and_then(|meta| meta.action)
        .map(|action| action.to_string())
        .unwrap_or_else(|| "—".to_string())
}

/// Pick the decisions for `accept`: either the named paths or every
/// undecided clean diff.
fn select_decisions(
    diffs: &[DiffEntry],
    paths: &[String],
    action: SyncAction,
    all_clean: bool,
) -> Result<Vec<(DiffEntry, SyncAction)>> {
    if all_clean {
        return Ok(diffs
            .iter()
            .filter(|entry| !entry.diff.is_conflicting() && !entry.is_decided())
            .map(|entry| (entry.clone(), SyncAction::AcceptAuto))
            .collect());
    }

    paths
        .iter()
        .map(|p| {
            let p = path::normalize(p);
            diffs
                .iter()
                .find(|entry| entry.path == p)
                .map(|entry| (entry.clone(), action))
                .ok_or_else(|| anyhow::anyhow!("no difference recorded for '{}'", p))
        })
        .collect()
}

/// Record `action` for `paths`, or `accept_auto` for every clean diff.
pub async fn run_accept(
    session: &SyncSession,
    paths: &[String],
    action: SyncAction,
    all_clean: bool,
) -> Result<()> {
    let mut events = session.orchestrator.subscribe();
    session
        .orchestrator
        .update_diff(session.root())
        .await
        .context("failed to compute diff")?;

    let decisions = select_decisions(&session.orchestrator.diffs(), paths, action, all_clean)?;
    let count = session
        .orchestrator
        .accept_multi(&decisions)
        .await
        .context("failed to record resolution")?;
    record_events(session, &mut events);

    if count == 0 {
        println!("{}", style::success("Nothing to accept"));
        return Ok(());
    }
    for (entry, action) in &decisions {
        println!("  {} {} → {}", style::diff_kind(entry.diff), entry.path, action);
    }
    println!();
    println!(
        "{}",
        style::success(&format!("{} resolution(s) recorded", count))
    );
    println!("Run 'treesync sync' to apply them.");
    Ok(())
}

/// Prompt for each undecided conflict.
pub async fn run_resolve(session: &SyncSession) -> Result<()> {
    let mut events = session.orchestrator.subscribe();
    session
        .orchestrator
        .update_diff(session.root())
        .await
        .context("failed to compute diff")?;

    let conflicts: Vec<DiffEntry> = session
        .orchestrator
        .diffs()
        .into_iter()
        .filter(|entry| entry.diff.is_conflicting() && !entry.is_decided())
        .collect();

    if conflicts.is_empty() {
        println!();
        println!("{}", style::success("No undecided conflicts"));
        println!();
        return Ok(());
    }

    println!();
    println!(
        "{}",
        style::header(&format!("Undecided conflicts ({})", conflicts.len()))
    );

    let choices = ["Keep local", "Keep remote", "Skip", "Quit"];
    let mut resolved = 0;
    for (i, entry) in conflicts.iter().enumerate() {
        println!();
        println!(
            "[{}/{}] {}  {}",
            i + 1,
            conflicts.len(),
            entry.path,
            style::diff_kind(entry.diff)
        );
        println!("  local : {}", identity_label(entry.local.as_ref()));
        println!("  remote: {}", identity_label(entry.remote.as_ref()));

        let choice = Select::new()
            .with_prompt("Resolution")
            .items(&choices)
            .default(2)
            .interact()
            .context("failed to read selection")?;

        let action = match choice {
            0 => SyncAction::AcceptLocal,
            1 => SyncAction::AcceptRemote,
            2 => continue,
            _ => break,
        };
        session
            .orchestrator
            .accept(entry, action)
            .await
            .with_context(|| format!("failed to resolve {}", entry.path))?;
        resolved += 1;
    }
    record_events(session, &mut events);

    println!();
    println!(
        "{}",
        style::success(&format!("{} conflict(s) resolved", resolved))
    );
    if resolved > 0 {
        println!("Run 'treesync sync' to apply them.");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(p: &str, diff: DiffKind) -> DiffEntry {
        DiffEntry {
            path: p.into(),
            diff,
            local: Some(ContentIdentity::of_bytes(b"l")),
            remote: None,
            metadata: None,
        }
    }

    #[test]
    fn test_select_all_clean_skips_conflicts() {
        let diffs = vec![
            entry("/a", DiffKind::LocalCreate),
            entry("/b", DiffKind::ConflictingUpdate),
        ];
        let decisions = select_decisions(&diffs, &[], SyncAction::AcceptAuto, true).unwrap();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].0.path, "/a");
        assert_eq!(decisions[0].1, SyncAction::AcceptAuto);
    }

    #[test]
    fn test_select_named_paths_are_normalized() {
        let diffs = vec![entry("/docs/a.md", DiffKind::LocalCreate)];
        let decisions =
            select_decisions(&diffs, &["docs/a.md".into()], SyncAction::AcceptAuto, false).unwrap();
        assert_eq!(decisions[0].0.path, "/docs/a.md");

        let err = select_decisions(&diffs, &["/missing".into()], SyncAction::AcceptAuto, false)
            .unwrap_err();
        assert!(err.to_string().contains("/missing"));
    }

    #[test]
    fn test_labels() {
        assert_eq!(identity_label(None), "—");
        assert_eq!(identity_label(Some(&ContentIdentity::directory())), "dir");
        assert_eq!(decision_label(&entry("/a", DiffKind::LocalCreate)), "—");
    }
}
