use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::Lease;

/// Result of the acquire primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// The row was inserted, or an expired row was overwritten.
    Acquired,
    /// A non-expired row exists. Nothing was written.
    Busy,
}

/// Result of a write conditioned on `locked_by`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerWrite {
    Applied,
    /// The row is missing, owned by someone else, or (for extend) expired.
    NotOwner,
}

/// Adapter contract for the shared lease table.
///
/// Every mutating method must be a single atomic conditional write against
/// the backing store. Implementations never read-then-write.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Insert the row, or overwrite it when `lock_until <= now`.
    /// On success `acquired_at = now`.
    async fn conditional_upsert(
        &self,
        task_name: &str,
        new_owner: &str,
        new_lock_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome>;

    /// Set `lock_until` when `locked_by == owner_token`.
    async fn conditional_release(
        &self,
        task_name: &str,
        owner_token: &str,
        new_lock_until: DateTime<Utc>,
    ) -> Result<OwnerWrite>;

    /// Set `lock_until` when `locked_by == owner_token` and the row is still
    /// held at `now`.
    async fn conditional_extend(
        &self,
        task_name: &str,
        owner_token: &str,
        new_lock_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<OwnerWrite>;

    /// Read-only inspection. Never used to decide ownership.
    async fn find(&self, task_name: &str) -> Result<Option<Lease>>;

    /// All rows ordered by task name.
    async fn list(&self) -> Result<Vec<Lease>>;
}
