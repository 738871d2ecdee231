use std::fmt;

use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{LeaseError, Result};

/// A persisted lease row. One per task name, reused across firings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Unique key.
    pub task_name: String,
    /// Token of the instance that last acquired the row.
    pub locked_by: String,
    /// When the row was last acquired.
    pub acquired_at: DateTime<Utc>,
    /// Anyone may reacquire once this instant is reached.
    pub lock_until: DateTime<Utc>,
}

impl Lease {
    /// A lease is held while `now < lock_until`.
    pub fn is_held_at(&self, now: DateTime<Utc>) -> bool {
        now < self.lock_until
    }
}

/// Longest hold a lease may be configured with (100 years).
pub const MAX_HOLD: std::time::Duration = std::time::Duration::from_secs(36_500 * 24 * 3600);

/// Per-task hold policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockConfiguration {
    name: String,
    lock_at_most_for: Duration,
    lock_at_least_for: Duration,
}

impl LockConfiguration {
    pub fn new(
        name: impl Into<String>,
        lock_at_most_for: std::time::Duration,
        lock_at_least_for: std::time::Duration,
    ) -> Result<Self> {
        let name = name.into();
        let invalid = |reason: String| LeaseError::InvalidConfiguration {
            name: name.clone(),
            reason,
        };

        if name.trim().is_empty() {
            return Err(invalid("task name must not be empty".to_string()));
        }
        if lock_at_most_for > MAX_HOLD {
            return Err(invalid(format!(
                "lock_at_most_for exceeds the maximum of {} days",
                MAX_HOLD.as_secs() / 86_400
            )));
        }
        let most = Duration::from_std(lock_at_most_for).map_err(|e| invalid(e.to_string()))?;
        let least = Duration::from_std(lock_at_least_for).map_err(|e| invalid(e.to_string()))?;
        if most <= Duration::zero() {
            return Err(invalid("lock_at_most_for must be greater than zero".to_string()));
        }
        if least > most {
            return Err(invalid(format!(
                "lock_at_least_for ({least}) exceeds lock_at_most_for ({most})"
            )));
        }

        Ok(Self {
            name,
            lock_at_most_for: most,
            lock_at_least_for: least,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lock_at_most_for(&self) -> Duration {
        self.lock_at_most_for
    }

    pub fn lock_at_least_for(&self) -> Duration {
        self.lock_at_least_for
    }

    /// `lock_until` written on acquisition or extension.
    pub fn lock_at_most_until(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_add_signed(self.lock_at_most_for).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Earliest instant a release may make the row reacquirable.
    pub fn lock_at_least_until(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_add_signed(self.lock_at_least_for).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Proof of a successful acquisition, handed to the holder.
///
/// Carries the ownership token every later write is conditioned on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseHandle {
    pub task_name: String,
    pub token: String,
    pub acquired_at: DateTime<Utc>,
    pub lock_until: DateTime<Utc>,
    pub earliest_release: DateTime<Utc>,
}

impl LeaseHandle {
    /// `lock_until` to write on release: never earlier than the minimum hold.
    pub fn release_deadline(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.max(self.earliest_release)
    }
}

/// Opaque identity of this process, stored in `locked_by`.
///
/// Format: `<name>/<pid>/<8 hex chars>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceId(String);

impl InstanceId {
    /// Build a fresh token for this process. Call once at startup.
    pub fn generate(name: &str) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("{}/{}/{}", name, std::process::id(), &suffix[..8]))
    }

    /// Wrap an existing token verbatim (tests, tooling).
    pub fn from_token(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stored timestamps have millisecond precision; round every instant the
/// protocol writes so in-memory and SQL stores compare identically.
pub(crate) fn store_precision(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(3)
}
