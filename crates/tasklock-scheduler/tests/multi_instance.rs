// Several instances sharing one SQLite lease table, each with its own
// connection, clock and instance token, as separate processes would.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tasklock_lease::{InstanceId, LeaseManager, LeaseStore, LockConfiguration, ReleaseOutcome, SqliteLeaseStore};
use tasklock_scheduler::{
    task_fn, FiringOutcome, ManualClock, ScheduledTask, Scheduler, TaskError, TaskSpec, TriggerClock,
};

const TASK: &str = "TaskScheduler_scheduledTask";

fn t(min: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap() + chrono::Duration::minutes(min)
}

fn spec() -> TaskSpec {
    TaskSpec::new(
        TriggerClock::parse("0 0/15 * * * ?", "UTC").unwrap(),
        LockConfiguration::new(TASK, Duration::from_secs(14 * 60), Duration::from_secs(5 * 60)).unwrap(),
    )
}

struct Instance {
    scheduler: Scheduler,
    clock: ManualClock,
    store: Arc<SqliteLeaseStore>,
}

fn instance(db: &Path, token: &str, start: DateTime<Utc>, body: Arc<dyn ScheduledTask>) -> Instance {
    let store = Arc::new(SqliteLeaseStore::open(db, "shedlock").unwrap());
    let clock = ManualClock::new(start);
    let leases = LeaseManager::new(store.clone(), InstanceId::from_token(token));
    let scheduler = Scheduler::builder(leases)
        .clock(Arc::new(clock.clone()))
        .task(spec(), body)
        .build()
        .unwrap();
    Instance {
        scheduler,
        clock,
        store,
    }
}

fn counting_body(runs: &Arc<AtomicUsize>) -> Arc<dyn ScheduledTask> {
    let runs = Arc::clone(runs);
    task_fn(move || {
        let runs = Arc::clone(&runs);
        async move {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok::<(), TaskError>(())
        }
    })
}

#[tokio::test]
async fn minimum_hold_blocks_until_earliest_release() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("locks.db");
    let runs = Arc::new(AtomicUsize::new(0));

    // A's body takes one minute
    let a_clock = ManualClock::new(t(0));
    let body_clock = a_clock.clone();
    let a_runs = Arc::clone(&runs);
    let a_body = task_fn(move || {
        let clock = body_clock.clone();
        let runs = Arc::clone(&a_runs);
        async move {
            clock.advance(chrono::Duration::minutes(1));
            runs.fetch_add(1, Ordering::SeqCst);
            Ok::<(), TaskError>(())
        }
    });
    let a_store = Arc::new(SqliteLeaseStore::open(&db, "shedlock").unwrap());
    let a = Scheduler::builder(LeaseManager::new(a_store.clone(), InstanceId::from_token("A")))
        .clock(Arc::new(a_clock))
        .task(spec(), a_body)
        .build()
        .unwrap();
    let b = instance(&db, "B", t(2), counting_body(&runs));
    let c = instance(&db, "C", t(6), counting_body(&runs));

    assert_eq!(
        a.fire_now(TASK).await.unwrap(),
        FiringOutcome::Executed {
            release: ReleaseOutcome::Released { lock_until: t(5) }
        }
    );
    let row = a_store.find(TASK).await.unwrap().unwrap();
    assert_eq!(row.locked_by, "A");
    assert_eq!(row.acquired_at, t(0));
    assert_eq!(row.lock_until, t(5));

    assert_eq!(b.scheduler.fire_now(TASK).await.unwrap(), FiringOutcome::Skipped);

    assert!(c.scheduler.fire_now(TASK).await.unwrap().ran());
    let row = c.store.find(TASK).await.unwrap().unwrap();
    assert_eq!(row.locked_by, "C");
    assert_eq!(row.acquired_at, t(6));

    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn failed_cycle_does_not_block_the_next() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("locks.db");

    let failing = task_fn(|| async { Err::<(), TaskError>("upstream timed out".into()) });
    let a = instance(&db, "A", t(0), failing);
    let runs = Arc::new(AtomicUsize::new(0));
    let b = instance(&db, "B", t(0), counting_body(&runs));

    match a.scheduler.fire_at(TASK, t(0)).await.unwrap() {
        FiringOutcome::Failed { reason, release } => {
            assert_eq!(reason, "upstream timed out");
            assert_eq!(release, ReleaseOutcome::Released { lock_until: t(5) });
        }
        other => panic!("unexpected outcome {other:?}"),
    }

    b.clock.set(t(15));
    assert!(b.scheduler.fire_at(TASK, t(15)).await.unwrap().ran());
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(b.store.find(TASK).await.unwrap().unwrap().locked_by, "B");
}

#[tokio::test]
async fn abandoned_lease_is_recovered_after_max_hold() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("locks.db");
    let runs = Arc::new(AtomicUsize::new(0));

    // A crashes mid-task: acquire without release
    let a_store = Arc::new(SqliteLeaseStore::open(&db, "shedlock").unwrap());
    let a = LeaseManager::new(a_store, InstanceId::from_token("A"));
    let lock = LockConfiguration::new(TASK, Duration::from_secs(14 * 60), Duration::from_secs(5 * 60)).unwrap();
    assert!(matches!(
        a.acquire(&lock, t(0)).await,
        tasklock_lease::AcquireOutcome::Acquired(_)
    ));

    let b = instance(&db, "B", t(13), counting_body(&runs));
    assert_eq!(b.scheduler.fire_now(TASK).await.unwrap(), FiringOutcome::Skipped);
    b.clock.set(t(14));
    assert!(b.scheduler.fire_now(TASK).await.unwrap().ran());
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_instances_run_a_firing_once() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("locks.db");
    let runs = Arc::new(AtomicUsize::new(0));

    let instances: Vec<_> = (0..8)
        .map(|i| instance(&db, &format!("node-{i}"), t(15), counting_body(&runs)))
        .collect();

    let firings: Vec<_> = instances
        .into_iter()
        .map(|inst| tokio::spawn(async move { inst.scheduler.fire_at(TASK, t(15)).await.unwrap() }))
        .collect();

    let mut executed = 0;
    let mut skipped = 0;
    for firing in firings {
        match firing.await.unwrap() {
            FiringOutcome::Executed { .. } => executed += 1,
            FiringOutcome::Skipped => skipped += 1,
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    assert_eq!(executed, 1);
    assert_eq!(skipped, 7);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}
