use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{error, info, warn};

use tasklock_core::{CoreError, TasklockConfig};
use tasklock_lease::{InstanceId, Lease, LeaseManager, LeaseStore, SqliteLeaseStore};
use tasklock_scheduler::{FiringOutcome, Scheduler, TaskSpec};

mod tasks;

#[derive(Parser, Debug)]
#[command(name = "tasklock-daemon", version, about = "Cron scheduler with cross-process lease locking")]
struct Cli {
    /// Path to tasklock.toml (falls back to TASKLOCK_CONFIG, then ~/.tasklock/tasklock.toml)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every configured task on its schedule until Ctrl-C (default)
    Run,
    /// Run a single firing cycle of one task now, honouring its lease
    RunOnce { task: String },
    /// Print the lease table
    Status {
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "tasklock_daemon=info,tasklock_scheduler=info,tasklock_lease=info".into()
            }),
        )
        .init();

    let cli = Cli::parse();

    let mut config = TasklockConfig::load(cli.config.as_deref())
        .map_err(logged)
        .context("loading configuration")?;
    if config.tasks.is_empty() {
        info!(task = tasks::SCHEDULED_TASK, "no tasks configured, using the built-in task");
        config.tasks.push(tasks::default_task());
    }

    let db_path = expand_home(&config.store.path);
    ensure_parent_dir(&db_path)
        .map_err(logged)
        .with_context(|| format!("creating the directory for {db_path}"))?;
    let store = Arc::new(
        SqliteLeaseStore::open(&db_path, &config.store.table)
            .with_context(|| format!("opening lease store at {db_path}"))?,
    );

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(&config, store).await,
        Command::RunOnce { task } => run_once(&config, store, &task).await,
        Command::Status { json } => status(store.as_ref(), json).await,
    }
}

fn build_scheduler(config: &TasklockConfig, store: Arc<SqliteLeaseStore>) -> anyhow::Result<Scheduler> {
    let instance = InstanceId::generate(&config.instance.name);
    info!(%instance, "instance identity");

    let mut bodies = tasks::registry();
    let mut builder = Scheduler::builder(LeaseManager::new(store, instance)).settings(&config.scheduler);
    for task in &config.tasks {
        let body = bodies
            .remove(task.name.as_str())
            .with_context(|| format!("no task body registered for '{}'", task.name))?;
        builder = builder.task(TaskSpec::from_config(task)?, body);
    }
    Ok(builder.build()?)
}

async fn run(config: &TasklockConfig, store: Arc<SqliteLeaseStore>) -> anyhow::Result<()> {
    let scheduler = build_scheduler(config, store)?;
    let now = chrono::Utc::now();
    for name in scheduler.task_names() {
        if let Some(next) = scheduler.next_fire_time(name, now)? {
            info!(task = %name, %next, "task scheduled");
        }
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let engine = tokio::spawn(scheduler.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested, waiting for running tasks");
    let _ = shutdown_tx.send(true);
    engine.await?;
    Ok(())
}

async fn run_once(config: &TasklockConfig, store: Arc<SqliteLeaseStore>, task: &str) -> anyhow::Result<()> {
    let scheduler = build_scheduler(config, store)?;
    match scheduler.fire_now(task).await? {
        FiringOutcome::Executed { release } => info!(%task, ?release, "task executed"),
        FiringOutcome::Failed { reason, release } => {
            warn!(%task, %reason, ?release, "task failed");
            anyhow::bail!("task '{task}' failed: {reason}");
        }
        FiringOutcome::Skipped => info!(%task, "lease held by another instance, not run"),
        FiringOutcome::Missed { scheduled, .. } => info!(%task, %scheduled, "firing missed"),
    }
    Ok(())
}

#[derive(Serialize)]
struct StatusRow {
    #[serde(flatten)]
    lease: Lease,
    held: bool,
}

async fn status(store: &dyn LeaseStore, json: bool) -> anyhow::Result<()> {
    let now = chrono::Utc::now();
    let rows: Vec<StatusRow> = store
        .list()
        .await?
        .into_iter()
        .map(|lease| StatusRow {
            held: lease.is_held_at(now),
            lease,
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    if rows.is_empty() {
        println!("no leases recorded");
        return Ok(());
    }
    println!("{:<32} {:<8} {:<25} {:<25} LOCKED BY", "NAME", "STATE", "LOCKED AT", "LOCK UNTIL");
    for row in rows {
        println!(
            "{:<32} {:<8} {:<25} {:<25} {}",
            row.lease.task_name,
            if row.held { "held" } else { "free" },
            row.lease.acquired_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            row.lease.lock_until.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            row.lease.locked_by,
        );
    }
    Ok(())
}

fn expand_home(path: &str) -> String {
    match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{home}/{rest}"),
        _ => path.to_string(),
    }
}

fn ensure_parent_dir(path: &str) -> tasklock_core::Result<()> {
    match std::path::Path::new(path).parent() {
        Some(parent) if !parent.as_os_str().is_empty() => Ok(std::fs::create_dir_all(parent)?),
        _ => Ok(()),
    }
}

fn logged(e: CoreError) -> CoreError {
    error!(code = e.code(), error = %e, "startup failed");
    e
}
