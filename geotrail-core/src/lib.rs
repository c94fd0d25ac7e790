//! # geotrail-core
//!
//! Core library for geotrail - an offline-resilient location tracker.
//!
//! This library provides:
//! - A durable local queue of pending location records (SQLite)
//! - Position sampling behind a provider trait
//! - Foreground capture loop and background capture agent
//! - Sync of the queue to a remote REST store
//! - Lifecycle handling for visibility and connectivity edges
//! - Configuration and logging infrastructure
//!
//! ## Architecture
//!
//! Records flow from a sampler to one of two paths:
//! - **Direct:** the foreground loop inserts into the remote store while online
//! - **Queued:** the background agent (or a failed direct insert) appends to
//!   the durable queue, which the sync coordinator drains later
//!
//! A record leaves the queue only after the remote confirmed it.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use geotrail_core::{Config, LocationQueue, RestLocationStore, SyncCoordinator};
//! use geotrail_core::connectivity::NetworkStatus;
//!
//! # async fn demo() -> geotrail_core::Result<()> {
//! let config = Config::load()?;
//!
//! let queue = LocationQueue::open(&Config::queue_path())?;
//! queue.migrate()?;
//!
//! let store = RestLocationStore::new(&config.remote)?;
//! let sync = SyncCoordinator::new(Arc::new(queue), Arc::new(store), NetworkStatus::new(true));
//! let outcome = sync.sync_pending().await?;
//! println!("synced {}", outcome.count());
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use agent::{AgentHandle, CaptureAgent};
pub use capture::{CaptureLoop, HistoryRefresher, Surface};
pub use config::Config;
pub use context::AppContext;
pub use error::{Error, QueueError, Result, SampleError, SyncError};
pub use lifecycle::{LifecycleEvent, LifecycleMonitor, Visibility};
pub use queue::{LocationQueue, QueuedRecord};
pub use remote::{LocationStore, RestLocationStore};
pub use sampler::Sampler;
pub use sync::{SyncCoordinator, SyncOutcome};
pub use types::*;

// Public modules
pub mod agent;
pub mod capture;
pub mod config;
pub mod connectivity;
pub mod context;
pub mod display;
pub mod error;
pub mod geo;
pub mod identity;
pub mod lifecycle;
pub mod logging;
pub mod queue;
pub mod remote;
pub mod sampler;
pub mod sync;
pub mod types;
