//! Durable local queue
//!
//! Crash-safe storage for records that have not reached the remote store yet:
//! - SQLite file in the XDG data dir, WAL journal, full fsync
//! - Schema migrations tracked via `PRAGMA user_version`
//! - Every write runs inside its own immediate transaction

pub mod schema;
pub mod store;

pub use store::{LocationQueue, QueuedRecord};
