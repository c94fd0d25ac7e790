//! Queue repository
//!
//! Append, list and clear operations over `pending_locations`.

use crate::error::QueueError;
use crate::types::{format_timestamp, parse_timestamp, LocationRecord, UserId};
use chrono::Utc;
use rusqlite::{params, Connection, Row, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// How long a writer waits on a competing transaction before failing
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// A pending record together with its queue id.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedRecord {
    /// Auto-increment key in the queue
    pub id: i64,
    pub record: LocationRecord,
}

/// Handle to the durable queue (single connection behind a mutex)
pub struct LocationQueue {
    conn: Mutex<Connection>,
}

impl LocationQueue {
    /// Open or create a queue at the given path
    pub fn open(path: &Path) -> Result<Self, QueueError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                QueueError::StorageUnavailable(format!(
                    "cannot create {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let conn = Connection::open(path).map_err(|e| {
            QueueError::StorageUnavailable(format!("cannot open {}: {}", path.display(), e))
        })?;

        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory queue (for testing)
    pub fn open_in_memory() -> Result<Self, QueueError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run migrations on this queue
    pub fn migrate(&self) -> Result<(), QueueError> {
        let conn = self.connection()?;
        super::schema::run_migrations(&conn)
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>, QueueError> {
        self.conn
            .lock()
            .map_err(|_| QueueError::StorageUnavailable("queue connection poisoned".to_string()))
    }

    /// Append a record, returning its queue id.
    ///
    /// All-or-nothing: either the row is committed or nothing is written.
    pub fn append(&self, record: &LocationRecord) -> Result<i64, QueueError> {
        let mut conn = self.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            r#"
            INSERT INTO pending_locations
                (timestamp, userid, latitude, longitude, elevation, queued_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                format_timestamp(&record.timestamp),
                record.user_id.as_str(),
                record.latitude,
                record.longitude,
                record.elevation,
                format_timestamp(&Utc::now()),
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        tracing::debug!(id, timestamp = %format_timestamp(&record.timestamp), "Queued location");
        Ok(id)
    }

    /// All pending records in ascending timestamp order
    pub fn list_all(&self) -> Result<Vec<QueuedRecord>, QueueError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, timestamp, userid, latitude, longitude, elevation
            FROM pending_locations
            ORDER BY timestamp ASC, id ASC
            "#,
        )?;
        let rows = stmt
            .query_map([], row_to_queued)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Number of pending records
    pub fn len(&self) -> Result<usize, QueueError> {
        let conn = self.connection()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM pending_locations", [], |r| r.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len()? == 0)
    }

    /// Remove every pending record
    pub fn clear_all(&self) -> Result<usize, QueueError> {
        let mut conn = self.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let removed = tx.execute("DELETE FROM pending_locations", [])?;
        tx.commit()?;
        Ok(removed)
    }

    /// Remove exactly the records of a synced snapshot.
    ///
    /// Rows appended after the snapshot was read stay queued.
    pub fn clear_batch(&self, batch: &[QueuedRecord]) -> Result<usize, QueueError> {
        if batch.is_empty() {
            return Ok(0);
        }

        let mut conn = self.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut removed = 0;
        {
            let mut stmt = tx.prepare("DELETE FROM pending_locations WHERE id = ?1")?;
            for queued in batch {
                removed += stmt.execute([queued.id])?;
            }
        }
        tx.commit()?;
        Ok(removed)
    }

    /// Raw SQL access for tests that need to break the store on purpose
    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> Result<(), QueueError> {
        self.connection()?.execute_batch(sql)?;
        Ok(())
    }
}

fn row_to_queued(row: &Row<'_>) -> rusqlite::Result<QueuedRecord> {
    let raw_ts: String = row.get(1)?;
    let timestamp = parse_timestamp(&raw_ts).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(QueuedRecord {
        id: row.get(0)?,
        record: LocationRecord {
            location_id: None,
            user_id: UserId::new(row.get::<_, String>(2)?),
            timestamp,
            latitude: row.get(3)?,
            longitude: row.get(4)?,
            elevation: row.get(5)?,
        },
    })
}
