use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info};

use crate::db::{format_ts, init_db, parse_ts};
use crate::error::{LeaseError, Result};
use crate::store::{LeaseStore, OwnerWrite, UpsertOutcome};
use crate::types::Lease;

/// Lease store backed by a SQLite table.
///
/// Every process that opens the same database file shares the table; the
/// conditional statements below are what arbitrate between them. WAL mode
/// and a busy timeout let concurrent writers queue instead of failing fast.
pub struct SqliteLeaseStore {
    conn: Mutex<Connection>,
    table: String,
}

impl SqliteLeaseStore {
    /// Wrap an open connection, initialising the schema if needed.
    pub fn new(conn: Connection, table: &str) -> Result<Self> {
        init_db(&conn, table)?;
        Ok(Self {
            conn: Mutex::new(conn),
            table: table.to_string(),
        })
    }

    /// Open (or create) the database file at `path`.
    pub fn open(path: impl AsRef<Path>, table: &str) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        info!(path = %path.as_ref().display(), %table, "lease store opened");
        Self::new(conn, table)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| LeaseError::StoreUnavailable("connection mutex poisoned".to_string()))
    }
}

#[async_trait]
impl LeaseStore for SqliteLeaseStore {
    async fn conditional_upsert(
        &self,
        task_name: &str,
        new_owner: &str,
        new_lock_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome> {
        let conn = self.conn()?;
        // One statement: insert when absent, overwrite only an expired row.
        // A held row leaves changes() at 0.
        let n = conn.execute(
            &format!(
                "INSERT INTO {t} (name, lock_until, locked_at, locked_by)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(name) DO UPDATE SET
                     lock_until = excluded.lock_until,
                     locked_at  = excluded.locked_at,
                     locked_by  = excluded.locked_by
                 WHERE {t}.lock_until <= excluded.locked_at",
                t = self.table
            ),
            rusqlite::params![task_name, format_ts(new_lock_until), format_ts(now), new_owner],
        )?;

        debug!(task = %task_name, rows = n, "conditional upsert");
        Ok(if n == 1 {
            UpsertOutcome::Acquired
        } else {
            UpsertOutcome::Busy
        })
    }

    async fn conditional_release(
        &self,
        task_name: &str,
        owner_token: &str,
        new_lock_until: DateTime<Utc>,
    ) -> Result<OwnerWrite> {
        let conn = self.conn()?;
        let n = conn.execute(
            &format!(
                "UPDATE {} SET lock_until = ?3 WHERE name = ?1 AND locked_by = ?2",
                self.table
            ),
            rusqlite::params![task_name, owner_token, format_ts(new_lock_until)],
        )?;
        Ok(owner_write(n))
    }

    async fn conditional_extend(
        &self,
        task_name: &str,
        owner_token: &str,
        new_lock_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<OwnerWrite> {
        let conn = self.conn()?;
        let n = conn.execute(
            &format!(
                "UPDATE {} SET lock_until = ?3
                 WHERE name = ?1 AND locked_by = ?2 AND lock_until > ?4",
                self.table
            ),
            rusqlite::params![task_name, owner_token, format_ts(new_lock_until), format_ts(now)],
        )?;
        Ok(owner_write(n))
    }

    async fn find(&self, task_name: &str) -> Result<Option<Lease>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT name, locked_by, locked_at, lock_until FROM {} WHERE name = ?1",
                    self.table
                ),
                [task_name],
                raw_row,
            )
            .optional()?;
        row.map(lease_from_raw).transpose()
    }

    async fn list(&self) -> Result<Vec<Lease>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT name, locked_by, locked_at, lock_until FROM {} ORDER BY name",
            self.table
        ))?;
        let rows = stmt
            .query_map([], raw_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(lease_from_raw).collect()
    }
}

type RawLease = (String, String, String, String);

fn raw_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawLease> {
    Ok((
        row.get::<_, String>(0)?, // name
        row.get::<_, String>(1)?, // locked_by
        row.get::<_, String>(2)?, // locked_at
        row.get::<_, String>(3)?, // lock_until
    ))
}

fn lease_from_raw((task_name, locked_by, locked_at, lock_until): RawLease) -> Result<Lease> {
    Ok(Lease {
        task_name,
        locked_by,
        acquired_at: parse_ts(&locked_at)?,
        lock_until: parse_ts(&lock_until)?,
    })
}

fn owner_write(changed: usize) -> OwnerWrite {
    if changed == 1 {
        OwnerWrite::Applied
    } else {
        OwnerWrite::NotOwner
    }
}
