use std::any::Any;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use tasklock_lease::{
    with_lock_scope, AcquireOutcome, ActiveLease, LeaseManager, LockConfiguration, ReleaseOutcome,
};

use crate::clock::Clock;

/// Error type a task body may return.
pub type TaskError = Box<dyn std::error::Error + Send + Sync>;

/// A unit of work guarded by a lease.
#[async_trait]
pub trait ScheduledTask: Send + Sync + 'static {
    async fn run(&self) -> Result<(), TaskError>;
}

/// Adapter turning an async closure into a [`ScheduledTask`].
pub struct FnTask<F>(F);

#[async_trait]
impl<F, Fut> ScheduledTask for FnTask<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
{
    async fn run(&self) -> Result<(), TaskError> {
        (self.0)().await
    }
}

/// Wrap an async closure as a shareable task body.
pub fn task_fn<F, Fut>(f: F) -> Arc<dyn ScheduledTask>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
{
    Arc::new(FnTask(f))
}

/// Result of one firing cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FiringOutcome {
    /// The body ran to completion.
    Executed { release: ReleaseOutcome },
    /// The body returned an error or panicked. Release was still attempted.
    Failed { reason: String, release: ReleaseOutcome },
    /// Another instance holds the lease, or the store was unreachable.
    Skipped,
    /// Observed too late to run. Not replayed.
    Missed {
        scheduled: DateTime<Utc>,
        observed_at: DateTime<Utc>,
    },
}

impl FiringOutcome {
    /// True when this instance ran the body, successfully or not.
    pub fn ran(&self) -> bool {
        matches!(self, FiringOutcome::Executed { .. } | FiringOutcome::Failed { .. })
    }
}

/// Binds one task body to its lock configuration.
///
/// `Idle -> Acquiring -> {Skipped | Running -> Releasing -> Idle}`
pub struct TaskRunner {
    lock: LockConfiguration,
    body: Arc<dyn ScheduledTask>,
    leases: LeaseManager,
    clock: Arc<dyn Clock>,
}

impl TaskRunner {
    pub fn new(
        lock: LockConfiguration,
        body: Arc<dyn ScheduledTask>,
        leases: LeaseManager,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            lock,
            body,
            leases,
            clock,
        }
    }

    pub fn name(&self) -> &str {
        self.lock.name()
    }

    pub fn lock_configuration(&self) -> &LockConfiguration {
        &self.lock
    }

    /// Run one firing cycle for the firing due at `scheduled`.
    ///
    /// Never returns an error: every failure is logged and folded into the
    /// outcome.
    pub async fn fire(&self, scheduled: DateTime<Utc>) -> FiringOutcome {
        let task = self.lock.name();

        let handle = match self.leases.acquire(&self.lock, self.clock.now()).await {
            AcquireOutcome::Acquired(handle) => handle,
            AcquireOutcome::Busy => {
                debug!(%task, %scheduled, "firing skipped, lease busy");
                return FiringOutcome::Skipped;
            }
        };

        info!(%task, %scheduled, until = %handle.lock_until, "executing task");

        let active = Arc::new(ActiveLease::new(self.leases.clone(), self.lock.clone(), handle));

        // Spawned so a panicking body surfaces as a JoinError instead of
        // unwinding through the scheduler loop.
        let body = Arc::clone(&self.body);
        let run = tokio::spawn(with_lock_scope(Arc::clone(&active), async move { body.run().await }));
        let failure = match run.await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(join) if join.is_panic() => Some(format!("panicked: {}", panic_message(join.into_panic()))),
            Err(join) => Some(join.to_string()),
        };

        // the body may have extended the lease
        let release = self.leases.release(active.handle(), self.clock.now()).await;
        if release == ReleaseOutcome::Failed {
            warn!(%task, %scheduled, "lease not released, it will expire on its own");
        }

        match failure {
            None => {
                debug!(%task, %scheduled, "task finished");
                FiringOutcome::Executed { release }
            }
            Some(reason) => {
                error!(%task, %scheduled, %reason, "task body failed");
                FiringOutcome::Failed { reason, release }
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
