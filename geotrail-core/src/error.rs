//! Error types for geotrail-core
//!
//! The pipeline has three failure families (sample, sync, queue write), each
//! with its own enum. [`Error`] wraps them for callers that only need to
//! propagate.

use thiserror::Error;

/// Main error type for the geotrail-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error outside a queue operation (migrations, pragmas)
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Identity store error
    #[error("identity store error: {0}")]
    Identity(String),

    /// Durable queue error
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Remote sync error
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// Logging setup error
    #[error("logging error: {0}")]
    Logging(String),
}

/// Result type alias for geotrail-core
pub type Result<T> = std::result::Result<T, Error>;

/// Failure to obtain a position fix.
///
/// Terminal for the capture cycle that hit it: the row is rendered as
/// unavailable and nothing is persisted.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleError {
    /// The user or OS refused access to location
    #[error("location permission denied")]
    PermissionDenied,

    /// No provider, or the provider could not produce a fix
    #[error("position unavailable")]
    Unavailable,

    /// The provider did not answer within the sampling timeout
    #[error("position request timed out")]
    Timeout,
}

/// Failure while pushing pending records to the remote store.
///
/// Always recoverable: the queue is left untouched and the next trigger
/// retries.
#[derive(Error, Debug)]
pub enum SyncError {
    /// No connectivity; returned by calls that need the remote right away
    /// (a sync pass reports this as [`crate::SyncOutcome::Deferred`] instead)
    #[error("offline")]
    Offline,

    /// Transport failure (DNS, connect, timeout, malformed response)
    #[error("network failure: {0}")]
    NetworkFailure(String),

    /// The remote answered with a non-2xx status
    #[error("remote rejected request ({status}): {body}")]
    RemoteRejected { status: u16, body: String },

    /// Reading or clearing the queue failed during a sync pass
    #[error("queue error during sync: {0}")]
    Queue(#[from] QueueError),
}

impl SyncError {
    /// Whether retrying the same request later could succeed
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::NetworkFailure(_) => true,
            SyncError::RemoteRejected { status, .. } => *status >= 500 || *status == 429,
            SyncError::Offline | SyncError::Queue(_) => false,
        }
    }
}

/// Failure of the durable local queue.
///
/// An append failure means the sample for that cycle is lost.
#[derive(Error, Debug)]
pub enum QueueError {
    /// The backing store could not be opened or is unusable
    #[error("queue storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A transaction failed and was rolled back
    #[error("queue transaction failed: {0}")]
    TransactionFailed(#[from] rusqlite::Error),
}
