//! Bounded concurrent job execution.
//!
//! The runner repeatedly asks the orchestrator for up to `concurrency -
//! running` jobs, skipping paths that are locked by an in-flight job or still
//! backing off, and spawns each one. When a job ends its path is unlocked and
//! given a new backoff deadline: `backoff` after a failure, `success_backoff`
//! after a success. Started jobs always run to completion.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::errors::SyncError;
use crate::models::{JobErrorRecord, JobOutcome, RunStats, RunnerStatus, SyncEvent};
use crate::orchestrator::SyncOrchestrator;

/// Shared shutdown flag checked by long-running loops.
pub type ShutdownFlag = Arc<AtomicBool>;

/// Check whether the shutdown flag has been set.
pub fn is_shutdown_requested(flag: &ShutdownFlag) -> bool {
    flag.load(Ordering::SeqCst)
}

/// Tuning knobs for [`JobRunner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    /// Maximum number of jobs in flight.
    pub concurrency: usize,
    /// Cooldown applied to a path after its job fails.
    pub backoff: Duration,
    /// Cooldown applied to a path after its job succeeds.
    pub success_backoff: Duration,
    /// Sleep between polls when nothing is runnable in continuous mode.
    pub idle_interval: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            backoff: Duration::from_secs(30),
            success_backoff: Duration::ZERO,
            idle_interval: Duration::from_secs(5),
        }
    }
}

/// When [`JobRunner::run`] returns.
#[derive(Debug, Clone)]
pub enum RunMode {
    /// Return once nothing is runnable and nothing is in flight.
    UntilIdle,
    /// Keep polling until the flag is set.
    Continuous(ShutdownFlag),
}

#[derive(Default)]
struct RunnerState {
    locked: HashSet<String>,
    backoff: HashMap<String, Instant>,
    errors: BTreeMap<String, JobErrorRecord>,
    completed: u64,
    failed: u64,
}

type JobResult = (String, Result<JobOutcome, SyncError>);

/// Executes the orchestrator's jobs with per-path exclusivity and backoff.
pub struct JobRunner {
    orchestrator: Arc<SyncOrchestrator>,
    config: RunnerConfig,
    state: Mutex<RunnerState>,
    running: AtomicBool,
}

impl JobRunner {
    pub fn new(orchestrator: Arc<SyncOrchestrator>, config: RunnerConfig) -> Self {
        Self {
            orchestrator,
            config: RunnerConfig {
                concurrency: config.concurrency.max(1),
                ..config
            },
            state: Mutex::new(RunnerState::default()),
            running: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Recorded failures, one per path.
    pub fn errors(&self) -> Vec<JobErrorRecord> {
        self.state().errors.values().cloned().collect()
    }

    pub fn status(&self) -> RunnerStatus {
        let now = Instant::now();
        let state = self.state();
        let mut in_flight: Vec<String> = state.locked.iter().cloned().collect();
        in_flight.sort();
        let mut backing_off: Vec<String> = state
            .backoff
            .iter()
            .filter(|(_, deadline)| **deadline > now)
            .map(|(path, _)| path.clone())
            .collect();
        backing_off.sort();
        RunnerStatus {
            running: self.is_running(),
            in_flight,
            backing_off,
            errors: state.errors.values().cloned().collect(),
            completed: state.completed,
            failed: state.failed,
        }
    }

    /// Run jobs until `mode` says to stop.
    pub async fn run(&self, mode: RunMode) -> Result<RunStats, SyncError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SyncError::RunnerBusy);
        }
        let _guard = RunningGuard(&self.running);

        info!(
            concurrency = self.config.concurrency,
            mode = ?mode,
            "job runner started"
        );

        let mut stats = RunStats::default();
        let mut tasks: JoinSet<JobResult> = JoinSet::new();
        let mut idle = false;

        loop {
            if let RunMode::Continuous(flag) = &mode {
                if is_shutdown_requested(flag) {
                    info!(in_flight = tasks.len(), "shutdown requested, draining job runner");
                    break;
                }
            }

            let started = self.spawn_ready(&mut tasks);
            if started > 0 {
                idle = false;
            }

            if tasks.is_empty() {
                match &mode {
                    RunMode::UntilIdle => break,
                    RunMode::Continuous(flag) => {
                        if !idle {
                            idle = true;
                            debug!("job runner idle");
                            self.orchestrator.emit(SyncEvent::RunnerIdle);
                        }
                        self.idle_sleep(flag).await;
                        continue;
                    }
                }
            }

            if let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((path, result)) => self.finish(path, result, &mut stats),
                    Err(e) => error!(error = %e, "job supervisor task failed"),
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((path, result)) => self.finish(path, result, &mut stats),
                Err(e) => error!(error = %e, "job supervisor task failed"),
            }
        }

        info!(
            applied = stats.applied,
            skipped = stats.skipped,
            superseded = stats.superseded,
            failed = stats.failed,
            "job runner stopped"
        );
        Ok(stats)
    }

    /// Lock and spawn as many runnable jobs as the budget allows.
    fn spawn_ready(&self, tasks: &mut JoinSet<JobResult>) -> usize {
        let budget = self.config.concurrency.saturating_sub(tasks.len());
        if budget == 0 {
            return 0;
        }

        let now = Instant::now();
        let jobs = {
            let mut state = self.state();
            state.backoff.retain(|_, deadline| *deadline > now);
            let jobs = self.orchestrator.get_jobs(budget, |path| {
                !state.locked.contains(path) && !state.backoff.contains_key(path)
            });
            for job in &jobs {
                state.locked.insert(job.path.clone());
            }
            jobs
        };

        let count = jobs.len();
        for job in jobs {
            debug!(path = %job.path, "starting job");
            self.orchestrator.emit(SyncEvent::JobStarted {
                path: job.path.clone(),
            });
            let orchestrator = self.orchestrator.clone();
            tasks.spawn(async move {
                let path = job.path.clone();
                let handle = tokio::spawn(async move { orchestrator.do_job(&job).await });
                let result = match handle.await {
                    Ok(result) => result,
                    Err(e) => Err(SyncError::JobTask {
                        path: path.clone(),
                        detail: e.to_string(),
                    }),
                };
                (path, result)
            });
        }
        count
    }

    fn finish(&self, path: String, result: Result<JobOutcome, SyncError>, stats: &mut RunStats) {
        let now = Instant::now();
        let event = {
            let mut state = self.state();
            state.locked.remove(&path);
            match result {
                Ok(outcome) => {
                    state.errors.remove(&path);
                    state.completed += 1;
                    if self.config.success_backoff.is_zero() {
                        state.backoff.remove(&path);
                    } else {
                        state
                            .backoff
                            .insert(path.clone(), now + self.config.success_backoff);
                    }
                    match outcome {
                        JobOutcome::Applied => stats.applied += 1,
                        JobOutcome::Skipped => stats.skipped += 1,
                        JobOutcome::Superseded => stats.superseded += 1,
                    }
                    debug!(path = %path, outcome = %outcome, "job finished");
                    SyncEvent::JobFinished { path, outcome }
                }
                Err(e) => {
                    error!(path = %path, error = %e, "job failed");
                    state.failed += 1;
                    state.backoff.insert(path.clone(), now + self.config.backoff);
                    state.errors.insert(
                        path.clone(),
                        JobErrorRecord {
                            path: path.clone(),
                            error: e.to_string(),
                            timestamp: Utc::now(),
                        },
                    );
                    stats.failed += 1;
                    SyncEvent::JobFailed {
                        path,
                        error: e.to_string(),
                    }
                }
            }
        };
        self.orchestrator.emit(event);
    }

    async fn idle_sleep(&self, flag: &ShutdownFlag) {
        let deadline = Instant::now() + self.config.idle_interval;
        let step = Duration::from_secs(1);
        loop {
            let now = Instant::now();
            if now >= deadline || is_shutdown_requested(flag) {
                return;
            }
            tokio::time::sleep(step.min(deadline - now)).await;
        }
    }

    fn state(&self) -> MutexGuard<'_, RunnerState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("runner mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
