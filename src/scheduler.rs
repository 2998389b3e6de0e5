//! Periodic drains with single-flight leases.
//!
//! A [`PeriodicRunner`] owns one interval loop per [`PeriodicTask`]. Every tick
//! tries to take the task's named lease; if the previous run under that name
//! still holds it the tick is skipped, never queued. Runs are bounded by the
//! lease timeout, and a lease left behind past its expiry can be taken over.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::anthropic::MessageSender;
use crate::clock::Clock;
use crate::orchestrator::CorrectionProcessor;
use crate::state_machine::{CorrectionType, WorkStatus};
use crate::store::{StoreError, WorkItemStore};

#[derive(Debug, Clone)]
struct Lease {
    token: Uuid,
    expires_at: DateTime<Utc>,
}

/// Named, time-bounded mutual exclusion markers.
pub struct LeaseRegistry {
    leases: Mutex<HashMap<String, Lease>>,
    clock: Arc<dyn Clock>,
}

impl LeaseRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            leases: Mutex::new(HashMap::new()),
            clock,
        })
    }

    /// Takes the lease unless a live holder has it. Expired leases are taken
    /// over.
    pub fn try_acquire(self: &Arc<Self>, name: &str, ttl: Duration) -> Option<LeaseGuard> {
        let now = self.clock.now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365));
        let mut leases = self.leases.lock();
        if let Some(existing) = leases.get(name) {
            if existing.expires_at > now {
                return None;
            }
            warn!(lease = name, expired_at = %existing.expires_at, "taking over expired lease");
        }
        let token = Uuid::new_v4();
        leases.insert(
            name.to_string(),
            Lease {
                token,
                expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
            },
        );
        Some(LeaseGuard {
            registry: Arc::clone(self),
            name: name.to_string(),
            token,
        })
    }

    /// True while an unexpired lease exists under `name`.
    pub fn is_held(&self, name: &str) -> bool {
        let now = self.clock.now();
        self.leases
            .lock()
            .get(name)
            .is_some_and(|l| l.expires_at > now)
    }

    fn release(&self, name: &str, token: Uuid) {
        let mut leases = self.leases.lock();
        // A run that outlived its lease must not drop the new holder's lease.
        if leases.get(name).is_some_and(|l| l.token == token) {
            leases.remove(name);
        }
    }
}

/// Releases the lease on drop.
#[must_use = "lease is released when LeaseGuard is dropped"]
pub struct LeaseGuard {
    registry: Arc<LeaseRegistry>,
    name: String,
    token: Uuid,
}

impl std::fmt::Debug for LeaseGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseGuard").field("name", &self.name).finish()
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.registry.release(&self.name, self.token);
    }
}

pub type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A named cadence: `run` is invoked every `interval`, at most one run at a
/// time, each bounded by `lease_timeout`.
#[derive(Clone)]
pub struct PeriodicTask {
    pub name: String,
    pub interval: Duration,
    pub lease_timeout: Duration,
    run: Arc<dyn Fn() -> TaskFuture + Send + Sync>,
}

impl PeriodicTask {
    pub fn new<F, Fut>(name: impl Into<String>, interval: Duration, lease_timeout: Duration, run: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            name: name.into(),
            interval,
            lease_timeout,
            run: Arc::new(move || Box::pin(run()) as TaskFuture),
        }
    }
}

impl std::fmt::Debug for PeriodicTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicTask")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .field("lease_timeout", &self.lease_timeout)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Another run under the same name holds the lease.
    Skipped,
    Completed,
    /// The run hit its budget and was dropped; unfinished items stay in
    /// Processing for the reclaimer.
    TimedOut,
}

/// Runs one tick of `task` inline under its lease.
pub async fn run_tick(leases: &Arc<LeaseRegistry>, task: &PeriodicTask) -> TickOutcome {
    let Some(_guard) = leases.try_acquire(&task.name, task.lease_timeout) else {
        debug!(task = %task.name, "previous run still active, skipping tick");
        return TickOutcome::Skipped;
    };
    match timeout(task.lease_timeout, (task.run)()).await {
        Ok(()) => TickOutcome::Completed,
        Err(_) => {
            warn!(task = %task.name, budget = ?task.lease_timeout, "run exceeded its budget");
            TickOutcome::TimedOut
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("task {0} needs a non-zero interval and lease timeout")]
    ZeroDuration(String),

    #[error("task {0} is already registered")]
    Duplicate(String),
}

pub struct PeriodicRunner {
    leases: Arc<LeaseRegistry>,
    tasks: Vec<PeriodicTask>,
}

impl PeriodicRunner {
    pub fn new(leases: Arc<LeaseRegistry>) -> Self {
        Self {
            leases,
            tasks: Vec::new(),
        }
    }

    /// Adds a cadence. Names are lease keys, so they must be unique.
    pub fn register(&mut self, task: PeriodicTask) -> Result<(), ScheduleError> {
        if task.interval.is_zero() || task.lease_timeout.is_zero() {
            return Err(ScheduleError::ZeroDuration(task.name));
        }
        if self.tasks.iter().any(|t| t.name == task.name) {
            return Err(ScheduleError::Duplicate(task.name));
        }
        self.tasks.push(task);
        Ok(())
    }

    pub fn tasks(&self) -> &[PeriodicTask] {
        &self.tasks
    }

    /// Spawns one interval loop per task. Each tick runs on its own task so a
    /// slow run makes later ticks observe the lease and skip. A loop owns its
    /// ticks and, once stopped, waits for them up to the lease timeout.
    pub fn start(self) -> RunnerHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut loops: JoinSet<()> = JoinSet::new();
        for task in self.tasks {
            let leases = Arc::clone(&self.leases);
            let mut stop = stop_rx.clone();
            info!(task = %task.name, interval = ?task.interval, "starting cadence");
            loops.spawn(async move {
                let mut ticker = interval(task.interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                let mut ticks: JoinSet<TickOutcome> = JoinSet::new();
                loop {
                    tokio::select! {
                        _ = stop.changed() => break,
                        _ = ticker.tick() => {
                            let leases = Arc::clone(&leases);
                            let task = task.clone();
                            ticks.spawn(async move { run_tick(&leases, &task).await });
                        }
                        Some(joined) = ticks.join_next(), if !ticks.is_empty() => {
                            log_join_failure(&task.name, joined);
                        }
                    }
                }
                drain_ticks(&task, ticks).await;
            });
        }
        RunnerHandle {
            loops,
            stop: stop_tx,
        }
    }
}

async fn drain_ticks(task: &PeriodicTask, mut ticks: JoinSet<TickOutcome>) {
    if ticks.is_empty() {
        return;
    }
    debug!(task = %task.name, in_flight = ticks.len(), "waiting for in-flight runs");
    let waited = timeout(task.lease_timeout, async {
        while let Some(joined) = ticks.join_next().await {
            log_join_failure(&task.name, joined);
        }
    })
    .await;
    if waited.is_err() {
        warn!(task = %task.name, "in-flight run outlived its budget at shutdown; aborting");
        ticks.abort_all();
        while ticks.join_next().await.is_some() {}
    }
}

fn log_join_failure<T>(name: &str, joined: Result<T, tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!(task = name, "run panicked");
        }
    }
}

pub struct RunnerHandle {
    loops: JoinSet<()>,
    stop: watch::Sender<bool>,
}

impl RunnerHandle {
    /// Stops every cadence and returns once in-flight runs have finished or
    /// hit their lease timeout.
    pub async fn shutdown(mut self) {
        self.stop.send_replace(true);
        while let Some(joined) = self.loops.join_next().await {
            log_join_failure("cadence", joined);
        }
    }
}

/// Counts from one drain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub claimed: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub no_changes: usize,
    pub store_errors: usize,
}

/// Claims a bounded number of items of one type and processes them in turn.
pub struct Drainer<S, C> {
    processor: CorrectionProcessor<S, C>,
    correction_type: CorrectionType,
    claim_limit: usize,
}

impl<S: WorkItemStore, C: MessageSender> Drainer<S, C> {
    pub fn new(
        processor: CorrectionProcessor<S, C>,
        correction_type: CorrectionType,
        claim_limit: usize,
    ) -> Self {
        Self {
            processor,
            correction_type,
            claim_limit,
        }
    }

    pub async fn drain_once(&self) -> Result<DrainReport, StoreError> {
        let items = self
            .processor
            .store()
            .claim_next_pending(self.correction_type, self.claim_limit)?;
        let mut report = DrainReport {
            claimed: items.len(),
            ..Default::default()
        };
        for item in &items {
            match self.processor.process(item, None).await {
                Ok(done) => match done.status {
                    WorkStatus::Completed => report.completed += 1,
                    WorkStatus::Failed => report.failed += 1,
                    WorkStatus::Skipped => report.skipped += 1,
                    WorkStatus::NoChanges => report.no_changes += 1,
                    WorkStatus::Pending | WorkStatus::Processing => {}
                },
                Err(e) => {
                    warn!(id = %item.id, error = %e, "store error while processing; item left pending");
                    report.store_errors += 1;
                }
            }
        }
        if report.claimed > 0 {
            info!(
                correction_type = %self.correction_type,
                claimed = report.claimed,
                completed = report.completed,
                failed = report.failed,
                "drain finished"
            );
        }
        Ok(report)
    }
}
