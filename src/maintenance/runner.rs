//! Periodic job runner.
//!
//! Each job kind has its own running flag. A trigger that finds its kind
//! already running is skipped rather than queued, so a slow sweep never piles
//! up behind itself. Different kinds run independently.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use super::optimizer::Optimizer;
use super::sweeper::ExpirationSweeper;
use crate::datetime::Clock;

/// Background job kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Expiration sweep.
    Sweep,
    /// Light optimizer pass.
    OptimizeLight,
    /// Aggressive optimizer pass.
    OptimizeAggressive,
}

impl JobKind {
    /// All kinds.
    pub const ALL: [JobKind; 3] = [
        JobKind::Sweep,
        JobKind::OptimizeLight,
        JobKind::OptimizeAggressive,
    ];

    fn slot(self) -> usize {
        match self {
            JobKind::Sweep => 0,
            JobKind::OptimizeLight => 1,
            JobKind::OptimizeAggressive => 2,
        }
    }

    /// Name used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Sweep => "sweep",
            JobKind::OptimizeLight => "optimize_light",
            JobKind::OptimizeAggressive => "optimize_aggressive",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    /// The job ran to the end.
    Completed,
    /// The same kind was already running.
    Skipped,
}

struct Inner {
    sweeper: ExpirationSweeper,
    optimizer: Optimizer,
    clock: Arc<dyn Clock>,
    running: [AtomicBool; 3],
}

/// Clears the running flag on drop, including on panic.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Runs maintenance jobs with per-kind overlap protection.
#[derive(Clone)]
pub struct JobRunner {
    inner: Arc<Inner>,
}

impl JobRunner {
    /// Create a runner.
    pub fn new(sweeper: ExpirationSweeper, optimizer: Optimizer, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                sweeper,
                optimizer,
                clock,
                running: Default::default(),
            }),
        }
    }

    /// Whether a job of `kind` is running right now.
    pub fn is_running(&self, kind: JobKind) -> bool {
        self.inner.running[kind.slot()].load(Ordering::Acquire)
    }

    /// Run the job for `kind` unless one is already running.
    pub async fn trigger(&self, kind: JobKind) -> JobOutcome {
        self.run_exclusive(kind, || self.run_job(kind)).await
    }

    /// Run `job` under the running flag of `kind`.
    ///
    /// Returns `Skipped` without calling `job` if the flag is already set.
    pub async fn run_exclusive<F, Fut>(&self, kind: JobKind, job: F) -> JobOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        let flag = &self.inner.running[kind.slot()];
        if flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(job = %kind, "Job already running, skipping trigger");
            return JobOutcome::Skipped;
        }
        let _guard = RunningGuard(flag);
        job().await;
        JobOutcome::Completed
    }

    async fn run_job(&self, kind: JobKind) {
        let now = self.inner.clock.now();
        match kind {
            JobKind::Sweep => {
                self.inner.sweeper.sweep(now).await;
            }
            JobKind::OptimizeLight => {
                self.inner.optimizer.run_light(now).await;
            }
            JobKind::OptimizeAggressive => {
                self.inner.optimizer.run_aggressive(now).await;
            }
        }
    }

    /// Trigger `kind` every `period` on a background task.
    ///
    /// The first trigger fires immediately. Each tick runs in its own task so a
    /// long job cannot delay the timer; overlapping ticks are skipped by the
    /// running flag.
    pub fn spawn_periodic(&self, kind: JobKind, period: Duration) -> JoinHandle<()> {
        let runner = self.clone();
        info!(job = %kind, interval_secs = period.as_secs(), "Scheduling periodic job");
        tokio::spawn(async move {
            let mut timer = interval(period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                timer.tick().await;
                let runner = runner.clone();
                tokio::spawn(async move {
                    runner.trigger(kind).await;
                });
            }
        })
    }
}

impl std::fmt::Debug for JobRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let running: Vec<JobKind> = JobKind::ALL
            .into_iter()
            .filter(|kind| self.is_running(*kind))
            .collect();
        f.debug_struct("JobRunner").field("running", &running).finish()
    }
}
