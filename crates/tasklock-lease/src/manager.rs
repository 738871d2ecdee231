use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument, warn};

use crate::store::{LeaseStore, OwnerWrite, UpsertOutcome};
use crate::types::{store_precision, InstanceId, LeaseHandle, LockConfiguration};

/// Outcome of [`LeaseManager::acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired(LeaseHandle),
    /// Held elsewhere, or the store could not be reached. The caller must
    /// not run the task.
    Busy,
}

/// Outcome of [`LeaseManager::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The row now expires at `lock_until`.
    Released { lock_until: DateTime<Utc> },
    /// Not written. The row self-expires at its current `lock_until`.
    Failed,
}

/// Outcome of [`LeaseManager::extend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtendOutcome {
    Extended(LeaseHandle),
    Failed,
}

/// Acquire / extend / release protocol over a [`LeaseStore`].
///
/// Stateless apart from the instance token: two managers with the same
/// store and different tokens behave like two processes.
#[derive(Clone)]
pub struct LeaseManager {
    store: Arc<dyn LeaseStore>,
    instance: InstanceId,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn LeaseStore>, instance: InstanceId) -> Self {
        Self { store, instance }
    }

    pub fn instance(&self) -> &InstanceId {
        &self.instance
    }

    pub fn store(&self) -> &Arc<dyn LeaseStore> {
        &self.store
    }

    /// Try to take the lease for `config.name()`.
    ///
    /// Store failures are reported as Busy: skipping a firing is preferred
    /// over risking a second concurrent execution.
    #[instrument(skip(self, config), fields(task = %config.name(), owner = %self.instance))]
    pub async fn acquire(&self, config: &LockConfiguration, now: DateTime<Utc>) -> AcquireOutcome {
        let now = store_precision(now);
        let lock_until = store_precision(config.lock_at_most_until(now));

        match self
            .store
            .conditional_upsert(config.name(), self.instance.as_str(), lock_until, now)
            .await
        {
            Ok(UpsertOutcome::Acquired) => {
                debug!(%lock_until, "lease acquired");
                AcquireOutcome::Acquired(LeaseHandle {
                    task_name: config.name().to_string(),
                    token: self.instance.as_str().to_string(),
                    acquired_at: now,
                    lock_until,
                    earliest_release: store_precision(config.lock_at_least_until(now)),
                })
            }
            Ok(UpsertOutcome::Busy) => {
                debug!("lease held elsewhere");
                AcquireOutcome::Busy
            }
            Err(e) if e.is_store_unavailable() => {
                warn!(error = %e, "lease store unavailable during acquire, treating as busy");
                AcquireOutcome::Busy
            }
            Err(e) => {
                error!(error = %e, "acquire failed, treating as busy");
                AcquireOutcome::Busy
            }
        }
    }

    /// Give the lease back, but never before `handle.earliest_release`:
    /// a release inside the minimum hold only shortens `lock_until` to it.
    #[instrument(skip(self, handle), fields(task = %handle.task_name, owner = %handle.token))]
    pub async fn release(&self, handle: LeaseHandle, now: DateTime<Utc>) -> ReleaseOutcome {
        let lock_until = store_precision(handle.release_deadline(now));

        match self
            .store
            .conditional_release(&handle.task_name, &handle.token, lock_until)
            .await
        {
            Ok(OwnerWrite::Applied) => {
                debug!(%lock_until, "lease released");
                ReleaseOutcome::Released { lock_until }
            }
            Ok(OwnerWrite::NotOwner) => {
                warn!("release rejected, lease is owned by another instance");
                ReleaseOutcome::Failed
            }
            Err(e) => {
                warn!(error = %e, until = %handle.lock_until, "release failed, lease will self-expire");
                ReleaseOutcome::Failed
            }
        }
    }

    /// Push `lock_until` out to `now + lock_at_most_for` while still holding
    /// the lease. Fails once the lease has expired or changed hands.
    #[instrument(skip(self, handle, config), fields(task = %handle.task_name, owner = %handle.token))]
    pub async fn extend(
        &self,
        handle: &LeaseHandle,
        config: &LockConfiguration,
        now: DateTime<Utc>,
    ) -> ExtendOutcome {
        if config.name() != handle.task_name {
            warn!(config = %config.name(), "extend called with a configuration for another task");
            return ExtendOutcome::Failed;
        }

        let now = store_precision(now);
        let lock_until = store_precision(config.lock_at_most_until(now));

        match self
            .store
            .conditional_extend(&handle.task_name, &handle.token, lock_until, now)
            .await
        {
            Ok(OwnerWrite::Applied) => {
                info!(%lock_until, "lease extended");
                ExtendOutcome::Extended(LeaseHandle {
                    task_name: handle.task_name.clone(),
                    token: handle.token.clone(),
                    acquired_at: handle.acquired_at,
                    lock_until,
                    earliest_release: store_precision(config.lock_at_least_until(now)),
                })
            }
            Ok(OwnerWrite::NotOwner) => {
                warn!("extend rejected, lease expired or owned by another instance");
                ExtendOutcome::Failed
            }
            Err(e) => {
                warn!(error = %e, "extend failed");
                ExtendOutcome::Failed
            }
        }
    }
}
