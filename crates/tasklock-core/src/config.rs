use std::collections::HashSet;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::duration::humanized;
use crate::error::{CoreError, Result};

pub const DEFAULT_TABLE: &str = "shedlock";
pub const DEFAULT_SKEW_TOLERANCE_SECS: u64 = 30;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_TIMEZONE: &str = "UTC";

/// Top-level config (tasklock.toml + TASKLOCK_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TasklockConfig {
    #[serde(default)]
    pub instance: InstanceConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
}

/// Identity of this process in the `locked_by` column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    #[serde(default = "default_instance_name")]
    pub name: String,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            name: default_instance_name(),
        }
    }
}

/// Where the shared lease table lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    /// Lease table name. Must be a plain SQL identifier.
    #[serde(default = "default_table")]
    pub table: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            table: default_table(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// A firing observed later than this is treated as missed, not run late.
    #[serde(default = "default_skew_tolerance_secs")]
    pub skew_tolerance_secs: u64,
    /// Upper bound on a single sleep of the trigger loop, so wall-clock
    /// corrections are noticed within one slice.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            skew_tolerance_secs: DEFAULT_SKEW_TOLERANCE_SECS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

impl SchedulerConfig {
    pub fn skew_tolerance(&self) -> Duration {
        Duration::from_secs(self.skew_tolerance_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// One scheduled, lease-guarded task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskConfig {
    /// Lease key. Every instance running this task must use the same name.
    pub name: String,
    /// Cron expression, 5 fields (minute first) or 6 fields (seconds first).
    pub cron: String,
    /// `UTC`, `local`, an IANA zone such as `Europe/Berlin`, or a fixed offset such as `+05:30`.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Minimum hold after acquisition ("lockAtLeastFor").
    #[serde(with = "humanized", default)]
    pub lock_at_least_for: Duration,
    /// Lease lifetime after which another instance may take over ("lockAtMostFor").
    #[serde(with = "humanized")]
    pub lock_at_most_for: Duration,
}

impl TaskConfig {
    /// Check the hold bounds in isolation. The comparison against the firing
    /// interval needs the parsed schedule and happens in the scheduler.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(CoreError::Config("task name must not be empty".to_string()));
        }
        if self.lock_at_most_for.is_zero() {
            return Err(CoreError::InvalidHoldDurations {
                task: self.name.clone(),
                reason: "lock_at_most_for must be greater than zero".to_string(),
            });
        }
        if self.lock_at_least_for > self.lock_at_most_for {
            return Err(CoreError::InvalidHoldDurations {
                task: self.name.clone(),
                reason: format!(
                    "lock_at_least_for ({:?}) exceeds lock_at_most_for ({:?})",
                    self.lock_at_least_for, self.lock_at_most_for
                ),
            });
        }
        Ok(())
    }
}

impl TasklockConfig {
    /// Load config from a TOML file with TASKLOCK_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. TASKLOCK_CONFIG env var
    ///   3. ~/.tasklock/tasklock.toml
    ///
    /// Nested keys use a double underscore, e.g.
    /// `TASKLOCK_SCHEDULER__SKEW_TOLERANCE_SECS=10`.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .or_else(|| std::env::var("TASKLOCK_CONFIG").ok())
            .unwrap_or_else(default_config_path);

        let config: TasklockConfig = Figment::from(Serialized::defaults(TasklockConfig::default()))
            .merge(Toml::file(&path))
            .merge(Env::prefixed("TASKLOCK_").split("__"))
            .extract()
            .map_err(|e| CoreError::Config(e.to_string()))?;

        config.validate()?;
        tracing::debug!(path = %path, tasks = config.tasks.len(), "configuration loaded");
        Ok(config)
    }

    /// Structural checks that need no schedule parsing.
    pub fn validate(&self) -> Result<()> {
        if !is_sql_identifier(&self.store.table) {
            return Err(CoreError::Config(format!(
                "store.table '{}' is not a plain identifier",
                self.store.table
            )));
        }

        let mut seen = HashSet::new();
        for task in &self.tasks {
            task.validate()?;
            if !seen.insert(task.name.as_str()) {
                return Err(CoreError::DuplicateTask {
                    name: task.name.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn task(&self, name: &str) -> Option<&TaskConfig> {
        self.tasks.iter().find(|t| t.name == name)
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`. The table name is interpolated into SQL.
pub fn is_sql_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn default_instance_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.tasklock/tasklock.db", home)
}
fn default_table() -> String {
    DEFAULT_TABLE.to_string()
}
fn default_skew_tolerance_secs() -> u64 {
    DEFAULT_SKEW_TOLERANCE_SECS
}
fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}
fn default_timezone() -> String {
    DEFAULT_TIMEZONE.to_string()
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.tasklock/tasklock.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(name: &str, least: u64, most: u64) -> TaskConfig {
        TaskConfig {
            name: name.to_string(),
            cron: "0 0/15 * * * *".to_string(),
            timezone: DEFAULT_TIMEZONE.to_string(),
            lock_at_least_for: Duration::from_secs(least),
            lock_at_most_for: Duration::from_secs(most),
        }
    }

    #[test]
    fn loads_toml_with_env_override() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "tasklock.toml",
                r#"
                [instance]
                name = "worker-a"

                [store]
                path = "/tmp/locks.db"

                [[tasks]]
                name = "TaskScheduler_scheduledTask"
                cron = "0 0/15 * * * ?"
                lock_at_least_for = "PT5M"
                lock_at_most_for = "14m"
                "#,
            )?;
            jail.set_env("TASKLOCK_SCHEDULER__SKEW_TOLERANCE_SECS", "10");

            let config = TasklockConfig::load(Some("tasklock.toml")).map_err(|e| e.to_string())?;
            assert_eq!(config.instance.name, "worker-a");
            assert_eq!(config.store.table, DEFAULT_TABLE);
            assert_eq!(config.scheduler.skew_tolerance_secs, 10);
            assert_eq!(config.scheduler.poll_interval_ms, DEFAULT_POLL_INTERVAL_MS);

            let t = config.task("TaskScheduler_scheduledTask").expect("task present");
            assert_eq!(t.timezone, "UTC");
            assert_eq!(t.lock_at_least_for, Duration::from_secs(300));
            assert_eq!(t.lock_at_most_for, Duration::from_secs(840));
            Ok(())
        });
    }

    #[test]
    fn missing_file_yields_defaults() {
        figment::Jail::expect_with(|_jail| {
            let config = TasklockConfig::load(Some("absent.toml")).map_err(|e| e.to_string())?;
            assert!(config.tasks.is_empty());
            assert_eq!(config.scheduler.skew_tolerance_secs, DEFAULT_SKEW_TOLERANCE_SECS);
            Ok(())
        });
    }

    #[test]
    fn rejects_least_above_most() {
        let err = task("t", 600, 300).validate().unwrap_err();
        assert!(matches!(err, CoreError::InvalidHoldDurations { .. }));
    }

    #[test]
    fn rejects_zero_most() {
        let err = task("t", 0, 0).validate().unwrap_err();
        assert!(matches!(err, CoreError::InvalidHoldDurations { .. }));
    }

    #[test]
    fn rejects_duplicate_task_names() {
        let config = TasklockConfig {
            tasks: vec![task("dup", 60, 120), task("dup", 60, 120)],
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(CoreError::DuplicateTask { name }) if name == "dup"
        ));
    }

    #[test]
    fn rejects_unsafe_table_name() {
        let mut config = TasklockConfig::default();
        config.store.table = "locks; DROP TABLE x".to_string();
        assert!(matches!(config.validate(), Err(CoreError::Config(_))));
        assert!(is_sql_identifier("shedlock"));
        assert!(is_sql_identifier("_locks2"));
        assert!(!is_sql_identifier("2locks"));
    }
}
