use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use tasklock_core::{CoreError, SchedulerConfig, TaskConfig};
use tasklock_lease::{LeaseManager, LockConfiguration};

use crate::{
    clock::{Clock, SystemClock},
    error::{Result, SchedulerError},
    runner::{FiringOutcome, ScheduledTask, TaskRunner},
    trigger::{check_firing, FiringCheck, TriggerClock},
};

/// Schedule plus hold policy of one task.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub trigger: TriggerClock,
    pub lock: LockConfiguration,
}

impl TaskSpec {
    pub fn new(trigger: TriggerClock, lock: LockConfiguration) -> Self {
        Self { trigger, lock }
    }

    /// Build from a `[[tasks]]` entry, parsing the cron expression and timezone.
    pub fn from_config(config: &TaskConfig) -> Result<Self> {
        config.validate()?;
        let trigger = TriggerClock::parse(&config.cron, &config.timezone)?;
        let lock = LockConfiguration::new(&config.name, config.lock_at_most_for, config.lock_at_least_for)?;
        Ok(Self { trigger, lock })
    }

    pub fn name(&self) -> &str {
        self.lock.name()
    }

    /// A lease that can outlive the gap to the next firing would let two
    /// cycles overlap.
    fn check_interval(&self, from: DateTime<Utc>) -> Result<()> {
        match self.trigger.min_interval(from) {
            Some(interval) if self.lock.lock_at_most_for() >= interval => {
                Err(SchedulerError::HoldExceedsInterval {
                    task: self.name().to_string(),
                    lock_at_most_for: self.lock.lock_at_most_for(),
                    interval,
                })
            }
            Some(_) => Ok(()),
            None => {
                warn!(task = %self.name(), cron = %self.trigger.expression(), "schedule has fewer than two upcoming firings");
                Ok(())
            }
        }
    }
}

/// One handled firing, as sent to the outcome channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiringReport {
    pub task: String,
    pub scheduled: DateTime<Utc>,
    pub outcome: FiringOutcome,
}

/// Collects tasks and settings for a [`Scheduler`].
pub struct SchedulerBuilder {
    leases: LeaseManager,
    clock: Arc<dyn Clock>,
    skew_tolerance: Duration,
    poll_interval: Duration,
    outcomes: Option<mpsc::Sender<FiringReport>>,
    tasks: Vec<(TaskSpec, Arc<dyn ScheduledTask>)>,
}

impl SchedulerBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Apply the `[scheduler]` section.
    pub fn settings(mut self, config: &SchedulerConfig) -> Self {
        self.skew_tolerance = config.skew_tolerance();
        self.poll_interval = config.poll_interval();
        self
    }

    pub fn skew_tolerance(mut self, tolerance: Duration) -> Self {
        self.skew_tolerance = tolerance;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Receive a [`FiringReport`] for every firing handled by [`Scheduler::run`].
    /// Sent with `try_send`, so a full channel drops reports instead of
    /// stalling the task loops.
    pub fn outcomes(mut self, tx: mpsc::Sender<FiringReport>) -> Self {
        self.outcomes = Some(tx);
        self
    }

    pub fn task(mut self, spec: TaskSpec, body: Arc<dyn ScheduledTask>) -> Self {
        self.tasks.push((spec, body));
        self
    }

    /// Validate every registered task against its schedule and build.
    pub fn build(self) -> Result<Scheduler> {
        let skew_tolerance = chrono::Duration::from_std(self.skew_tolerance)
            .map_err(|e| CoreError::Config(format!("skew tolerance out of range: {e}")))?;
        if self.poll_interval.is_zero() {
            return Err(CoreError::Config("poll interval must be greater than zero".to_string()).into());
        }

        let now = self.clock.now();
        let mut seen = HashSet::new();
        let mut tasks = Vec::with_capacity(self.tasks.len());

        for (spec, body) in self.tasks {
            if !seen.insert(spec.name().to_string()) {
                return Err(SchedulerError::DuplicateTask {
                    name: spec.name().to_string(),
                });
            }
            spec.check_interval(now)?;

            let runner = TaskRunner::new(spec.lock, body, self.leases.clone(), Arc::clone(&self.clock));
            tasks.push(ScheduledEntry {
                trigger: spec.trigger,
                runner: Arc::new(runner),
            });
        }

        Ok(Scheduler {
            tasks,
            clock: self.clock,
            skew_tolerance,
            poll_interval: self.poll_interval,
            outcomes: self.outcomes,
        })
    }
}

struct ScheduledEntry {
    trigger: TriggerClock,
    runner: Arc<TaskRunner>,
}

/// Owns the trigger clocks and task runners of this process.
///
/// Each task gets its own loop; firings of one task are strictly sequential,
/// different tasks proceed independently.
pub struct Scheduler {
    tasks: Vec<ScheduledEntry>,
    clock: Arc<dyn Clock>,
    skew_tolerance: chrono::Duration,
    poll_interval: Duration,
    outcomes: Option<mpsc::Sender<FiringReport>>,
}

impl Scheduler {
    pub fn builder(leases: LeaseManager) -> SchedulerBuilder {
        SchedulerBuilder {
            leases,
            clock: Arc::new(SystemClock),
            skew_tolerance: Duration::from_secs(tasklock_core::config::DEFAULT_SKEW_TOLERANCE_SECS),
            poll_interval: Duration::from_millis(tasklock_core::config::DEFAULT_POLL_INTERVAL_MS),
            outcomes: None,
            tasks: Vec::new(),
        }
    }

    pub fn task_names(&self) -> Vec<&str> {
        self.tasks.iter().map(|e| e.runner.name()).collect()
    }

    /// Next firing of `name` strictly after `after`.
    pub fn next_fire_time(&self, name: &str, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        Ok(self.entry(name)?.trigger.next_fire_time(after))
    }

    /// Run one firing cycle of `name` immediately, bypassing its schedule.
    pub async fn fire_now(&self, name: &str) -> Result<FiringOutcome> {
        let entry = self.entry(name)?;
        Ok(entry.runner.fire(self.clock.now()).await)
    }

    /// Handle the firing of `name` due at `scheduled`, as the task loop
    /// would on waking: too late and it is reported missed, otherwise it runs.
    pub async fn fire_at(&self, name: &str, scheduled: DateTime<Utc>) -> Result<FiringOutcome> {
        let entry = self.entry(name)?;
        Ok(handle_firing(entry, self.clock.as_ref(), self.skew_tolerance, scheduled).await)
    }

    /// Drive every task until `shutdown` broadcasts `true`.
    ///
    /// A firing in progress is finished (and released) before its loop exits.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        info!(tasks = self.tasks.len(), "scheduler started");

        let mut loops = JoinSet::new();
        for entry in self.tasks {
            loops.spawn(task_loop(
                entry,
                Arc::clone(&self.clock),
                self.skew_tolerance,
                self.poll_interval,
                self.outcomes.clone(),
                shutdown.clone(),
            ));
        }

        while let Some(joined) = loops.join_next().await {
            if let Err(e) = joined {
                error!("task loop terminated abnormally: {e}");
            }
        }
        info!("scheduler stopped");
    }

    fn entry(&self, name: &str) -> Result<&ScheduledEntry> {
        self.tasks
            .iter()
            .find(|e| e.runner.name() == name)
            .ok_or_else(|| SchedulerError::UnknownTask {
                name: name.to_string(),
            })
    }
}

async fn task_loop(
    entry: ScheduledEntry,
    clock: Arc<dyn Clock>,
    skew_tolerance: chrono::Duration,
    poll_interval: Duration,
    outcomes: Option<mpsc::Sender<FiringReport>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let task = entry.runner.name().to_string();
    let mut from = clock.now();

    loop {
        let Some(scheduled) = entry.trigger.next_fire_time(from) else {
            warn!(%task, "schedule has no further firings, loop exiting");
            return;
        };
        debug!(%task, next = %scheduled, "waiting for next firing");

        if !wait_until(clock.as_ref(), scheduled, poll_interval, &mut shutdown).await {
            debug!(%task, "task loop shutting down");
            return;
        }

        let outcome = handle_firing(&entry, clock.as_ref(), skew_tolerance, scheduled).await;
        from = match outcome {
            // recompute from the present instead of replaying the backlog
            FiringOutcome::Missed { observed_at, .. } => observed_at,
            _ => scheduled,
        };

        if let Some(tx) = &outcomes {
            let report = FiringReport {
                task: task.clone(),
                scheduled,
                outcome,
            };
            if tx.try_send(report).is_err() {
                warn!(%task, %scheduled, "outcome channel full or closed, report dropped");
            }
        }
    }
}

async fn handle_firing(
    entry: &ScheduledEntry,
    clock: &dyn Clock,
    skew_tolerance: chrono::Duration,
    scheduled: DateTime<Utc>,
) -> FiringOutcome {
    let observed_at = clock.now();
    match check_firing(scheduled, observed_at, skew_tolerance) {
        FiringCheck::OnTime => entry.runner.fire(scheduled).await,
        FiringCheck::Missed { late_by } => {
            warn!(
                task = %entry.runner.name(),
                %scheduled,
                late_by_secs = late_by.num_seconds(),
                "firing observed too late, skipping"
            );
            FiringOutcome::Missed {
                scheduled,
                observed_at,
            }
        }
    }
}

/// Sleep until the clock reads `target`, in slices of at most `poll_interval`
/// so wall-clock corrections are noticed. Returns `false` on shutdown.
async fn wait_until(
    clock: &dyn Clock,
    target: DateTime<Utc>,
    poll_interval: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    loop {
        if *shutdown.borrow() {
            return false;
        }
        let now = clock.now();
        if now >= target {
            return true;
        }
        let slice = (target - now).to_std().map_or(poll_interval, |d| d.min(poll_interval));

        tokio::select! {
            _ = clock.sleep(slice) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return false;
                }
            }
        }
    }
}
