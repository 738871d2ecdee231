//! `tasklock-scheduler`: cron-driven, lease-guarded task execution.
//!
//! # Overview
//!
//! Each registered task pairs a [`TriggerClock`] (cron expression + zone)
//! with a [`TaskRunner`]. The [`Scheduler`] runs one loop per task: wait
//! for the next firing, acquire the lease, run the body, release. Firings
//! that lose the lease are skipped; firings observed later than the skew
//! tolerance are reported missed and never replayed.
//!
//! | Outcome    | Meaning                                              |
//! |------------|------------------------------------------------------|
//! | `Executed` | lease won, body succeeded, release attempted         |
//! | `Failed`   | lease won, body errored or panicked, release attempted |
//! | `Skipped`  | lease held elsewhere or store unreachable            |
//! | `Missed`   | woke up too late for this firing                     |

pub mod clock;
pub mod engine;
pub mod error;
pub mod runner;
pub mod trigger;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{FiringReport, Scheduler, SchedulerBuilder, TaskSpec};
pub use error::{Result, SchedulerError};
pub use runner::{task_fn, FiringOutcome, FnTask, ScheduledTask, TaskError, TaskRunner};
pub use trigger::{check_firing, FiringCheck, ScheduleZone, TriggerClock};
