//! Domain model types shared by the orchestrator, the job runner, and the
//! binaries.
//!
//! State changes are announced as [`SyncEvent`]s on a broadcast channel;
//! consumers that need the current state read a snapshot instead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::diff::DiffKind;
use crate::metadata::{EntrySyncMetadata, SyncAction};

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// A path whose accepted state has not been applied to both sides yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub path: String,
    pub metadata: EntrySyncMetadata,
}

/// How a job ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    /// The accepted state was applied and `synced` advanced.
    Applied,
    /// Nothing to do: the path is no longer pending.
    Skipped,
    /// Applied, but `synced` changed meanwhile; metadata left untouched.
    Superseded,
}

impl std::fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Applied => write!(f, "applied"),
            Self::Skipped => write!(f, "skipped"),
            Self::Superseded => write!(f, "superseded"),
        }
    }
}

/// The most recent failure recorded for a path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobErrorRecord {
    pub path: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Reports and snapshots
// ---------------------------------------------------------------------------

/// Summary of one `update_diff` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateReport {
    pub diffs: usize,
    pub conflicts: usize,
    pub auto_accepted: usize,
    pub pruned: usize,
    pub converged: usize,
    pub revoked: usize,
}

/// Snapshot of the job runner.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunnerStatus {
    pub running: bool,
    pub in_flight: Vec<String>,
    pub backing_off: Vec<String>,
    pub errors: Vec<JobErrorRecord>,
    pub completed: u64,
    pub failed: u64,
}

/// Totals from one bounded runner invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub applied: usize,
    pub skipped: usize,
    pub superseded: usize,
    pub failed: usize,
}

impl RunStats {
    pub fn total(&self) -> usize {
        self.applied + self.skipped + self.superseded + self.failed
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Change notification published by the orchestrator and the runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    DiffUpdated {
        root: String,
        report: UpdateReport,
    },
    DiffAccepted {
        path: String,
        diff: DiffKind,
        action: SyncAction,
    },
    JobStarted {
        path: String,
    },
    JobFinished {
        path: String,
        outcome: JobOutcome,
    },
    JobFailed {
        path: String,
        error: String,
    },
    RunnerIdle,
}

impl SyncEvent {
    /// Short action label for audit records.
    pub fn action(&self) -> &'static str {
        match self {
            Self::DiffUpdated { .. } => "diff_updated",
            Self::DiffAccepted { .. } => "diff_accepted",
            Self::JobStarted { .. } => "job_started",
            Self::JobFinished { .. } => "job_finished",
            Self::JobFailed { .. } => "job_failed",
            Self::RunnerIdle => "runner_idle",
        }
    }

    /// The path the event concerns, if any.
    pub fn path(&self) -> Option<&str> {
        match self {
            Self::DiffAccepted { path, .. }
            | Self::JobStarted { path }
            | Self::JobFinished { path, .. }
            | Self::JobFailed { path, .. } => Some(path),
            Self::DiffUpdated { root, .. } => Some(root),
            Self::RunnerIdle => None,
        }
    }
}
