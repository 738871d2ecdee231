use thiserror::Error;

/// Errors raised while building or driving a [`crate::Scheduler`].
///
/// Task body failures and missed firings are not errors: they surface as
/// [`crate::FiringOutcome`] variants.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The cron expression or timezone could not be parsed.
    #[error("Invalid schedule '{expression}': {reason}")]
    InvalidSchedule { expression: String, reason: String },

    /// `lock_at_most_for` would let a lease outlive the gap to the next firing.
    #[error(
        "lock_at_most_for of task '{task}' ({lock_at_most_for}) must be shorter than its firing interval ({interval})"
    )]
    HoldExceedsInterval {
        task: String,
        lock_at_most_for: chrono::Duration,
        interval: chrono::Duration,
    },

    #[error("Task '{name}' is registered twice")]
    DuplicateTask { name: String },

    #[error("No task named '{name}'")]
    UnknownTask { name: String },

    #[error(transparent)]
    Lease(#[from] tasklock_lease::LeaseError),

    #[error(transparent)]
    Core(#[from] tasklock_core::CoreError),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
