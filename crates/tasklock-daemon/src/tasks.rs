//! Task bodies compiled into the daemon, keyed by lease name.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tasklock_core::TaskConfig;
use tasklock_lease::assert_locked;
use tasklock_scheduler::{task_fn, ScheduledTask, TaskError};
use tracing::info;

pub const SCHEDULED_TASK: &str = "TaskScheduler_scheduledTask";

/// Every 15 minutes, held at least 5 and at most 14 minutes.
pub fn default_task() -> TaskConfig {
    TaskConfig {
        name: SCHEDULED_TASK.to_string(),
        cron: "0 0/15 * * * ?".to_string(),
        timezone: tasklock_core::config::DEFAULT_TIMEZONE.to_string(),
        lock_at_least_for: Duration::from_secs(5 * 60),
        lock_at_most_for: Duration::from_secs(14 * 60),
    }
}

pub fn registry() -> HashMap<&'static str, Arc<dyn ScheduledTask>> {
    let mut bodies: HashMap<&'static str, Arc<dyn ScheduledTask>> = HashMap::new();
    bodies.insert(SCHEDULED_TASK, task_fn(scheduled_task));
    bodies
}

async fn scheduled_task() -> Result<(), TaskError> {
    let lease = assert_locked()?;
    info!(task = %lease, "Running ShedLock task");
    Ok(())
}
