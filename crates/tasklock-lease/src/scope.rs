//! The lease a running task body executes under.
//!
//! The task runner wraps every lease-guarded body in [`with_lock_scope`].
//! Code deep inside the body can then call [`assert_locked`] to refuse work
//! when invoked some other way (a manual call from a test harness, an HTTP
//! handler, ...), or [`extend_active_lock`] to keep a long-running lease
//! alive.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use crate::error::{LeaseError, Result};
use crate::manager::{ExtendOutcome, LeaseManager};
use crate::types::{LeaseHandle, LockConfiguration};

tokio::task_local! {
    static ACTIVE_LEASE: Arc<ActiveLease>;
}

/// A held lease plus what is needed to extend it.
pub struct ActiveLease {
    leases: LeaseManager,
    config: LockConfiguration,
    handle: Mutex<LeaseHandle>,
}

impl ActiveLease {
    pub fn new(leases: LeaseManager, config: LockConfiguration, handle: LeaseHandle) -> Self {
        Self {
            leases,
            config,
            handle: Mutex::new(handle),
        }
    }

    pub fn name(&self) -> &str {
        self.config.name()
    }

    /// Latest handle, including any extension made by the body.
    pub fn handle(&self) -> LeaseHandle {
        self.lock_handle().clone()
    }

    /// Push `lock_until` out to `now + lock_at_most_for`.
    pub async fn extend(&self, now: DateTime<Utc>) -> Result<LeaseHandle> {
        let current = self.handle();
        match self.leases.extend(&current, &self.config, now).await {
            ExtendOutcome::Extended(extended) => {
                *self.lock_handle() = extended.clone();
                Ok(extended)
            }
            ExtendOutcome::Failed => Err(LeaseError::NotExtended {
                name: self.config.name().to_string(),
            }),
        }
    }

    fn lock_handle(&self) -> MutexGuard<'_, LeaseHandle> {
        // A handle is replaced whole, so a poisoned guard still holds a valid one.
        self.handle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Run `fut` with `lease` recorded as the lease it executes under.
pub async fn with_lock_scope<F: Future>(lease: Arc<ActiveLease>, fut: F) -> F::Output {
    ACTIVE_LEASE.scope(lease, fut).await
}

/// Name of the lease the current async task runs under, or
/// [`LeaseError::NotLocked`].
pub fn assert_locked() -> Result<String> {
    ACTIVE_LEASE
        .try_with(|lease| lease.name().to_string())
        .map_err(|_| LeaseError::NotLocked)
}

/// Extend the lease the current async task runs under.
pub async fn extend_active_lock(now: DateTime<Utc>) -> Result<LeaseHandle> {
    let lease = ACTIVE_LEASE
        .try_with(Arc::clone)
        .map_err(|_| LeaseError::NotLocked)?;
    lease.extend(now).await
}
