use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

use crate::error::{LeaseError, Result};

/// Initialise the lease schema in `conn`.
///
/// Creates the lease table (idempotent). `table` must already be validated
/// as a plain identifier; it is interpolated into the statement.
pub fn init_db(conn: &Connection, table: &str) -> Result<()> {
    conn.execute_batch(&format!(
        "
        CREATE TABLE IF NOT EXISTS {table} (
            name        TEXT    NOT NULL PRIMARY KEY,
            lock_until  TEXT    NOT NULL,   -- RFC-3339 UTC, millisecond precision
            locked_at   TEXT    NOT NULL,
            locked_by   TEXT    NOT NULL
        ) STRICT;
        "
    ))?;
    Ok(())
}

/// Fixed-width rendering (`2026-01-01T12:00:00.000Z`), so string comparison
/// in SQL orders the same way as the instants do.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| LeaseError::InvalidTimestamp(format!("{s}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn, "shedlock").unwrap();
        init_db(&conn, "shedlock").unwrap();
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM shedlock", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn formatted_timestamps_sort_lexically() {
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 9, 59, 59).unwrap();
        let t1 = t0 + Duration::milliseconds(1);
        let t2 = t0 + Duration::hours(3);
        assert!(format_ts(t0) < format_ts(t1));
        assert!(format_ts(t1) < format_ts(t2));
        assert_eq!(format_ts(t0).len(), format_ts(t2).len());
        assert_eq!(parse_ts(&format_ts(t1)).unwrap(), t1);
    }
}
