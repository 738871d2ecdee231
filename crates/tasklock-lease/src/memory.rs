use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{LeaseError, Result};
use crate::store::{LeaseStore, OwnerWrite, UpsertOutcome};
use crate::types::Lease;

/// Process-local lease store. Same semantics as the SQLite table; each
/// conditional write runs under one lock acquisition.
///
/// Share it between managers with `Arc<InMemoryLeaseStore>`.
#[derive(Default)]
pub struct InMemoryLeaseStore {
    rows: Mutex<BTreeMap<String, Lease>>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn rows(&self) -> Result<MutexGuard<'_, BTreeMap<String, Lease>>> {
        self.rows
            .lock()
            .map_err(|_| LeaseError::StoreUnavailable("lease map mutex poisoned".to_string()))
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn conditional_upsert(
        &self,
        task_name: &str,
        new_owner: &str,
        new_lock_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome> {
        let mut rows = self.rows()?;
        if rows.get(task_name).is_some_and(|l| l.is_held_at(now)) {
            return Ok(UpsertOutcome::Busy);
        }
        rows.insert(
            task_name.to_string(),
            Lease {
                task_name: task_name.to_string(),
                locked_by: new_owner.to_string(),
                acquired_at: now,
                lock_until: new_lock_until,
            },
        );
        Ok(UpsertOutcome::Acquired)
    }

    async fn conditional_release(
        &self,
        task_name: &str,
        owner_token: &str,
        new_lock_until: DateTime<Utc>,
    ) -> Result<OwnerWrite> {
        let mut rows = self.rows()?;
        match rows.get_mut(task_name) {
            Some(lease) if lease.locked_by == owner_token => {
                lease.lock_until = new_lock_until;
                Ok(OwnerWrite::Applied)
            }
            _ => Ok(OwnerWrite::NotOwner),
        }
    }

    async fn conditional_extend(
        &self,
        task_name: &str,
        owner_token: &str,
        new_lock_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<OwnerWrite> {
        let mut rows = self.rows()?;
        match rows.get_mut(task_name) {
            Some(lease) if lease.locked_by == owner_token && lease.is_held_at(now) => {
                lease.lock_until = new_lock_until;
                Ok(OwnerWrite::Applied)
            }
            _ => Ok(OwnerWrite::NotOwner),
        }
    }

    async fn find(&self, task_name: &str) -> Result<Option<Lease>> {
        Ok(self.rows()?.get(task_name).cloned())
    }

    async fn list(&self) -> Result<Vec<Lease>> {
        Ok(self.rows()?.values().cloned().collect())
    }
}
