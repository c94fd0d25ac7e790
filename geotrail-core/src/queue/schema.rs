//! Queue schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.

use crate::error::QueueError;
use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: pending locations keyed by auto-increment id
    r#"
    CREATE TABLE IF NOT EXISTS pending_locations (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp   TEXT NOT NULL,
        userid      TEXT NOT NULL,
        latitude    REAL NOT NULL,
        longitude   REAL NOT NULL,
        elevation   REAL,
        queued_at   TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_pending_locations_timestamp
        ON pending_locations(timestamp);
    "#,
];

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> Result<(), QueueError> {
    let current_version: i32 = conn
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .unwrap_or(0);

    tracing::debug!(
        current_version,
        target_version = SCHEMA_VERSION,
        "Checking queue migrations"
    );

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running queue migration");
            conn.execute_batch(migration)?;
            conn.execute(&format!("PRAGMA user_version = {}", version), [])?;
        }
    }

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<i32, QueueError> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    Ok(version)
}
