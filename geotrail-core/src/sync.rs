//! Sync coordinator
//!
//! Drains the durable queue to the remote store. Each pass re-reads the
//! whole queue, submits it as one batch, and removes that snapshot only
//! after the remote confirmed the insert. Uncoordinated repeated triggers
//! are therefore safe; the worst case is a duplicate insert.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::connectivity::NetworkStatus;
use crate::error::SyncError;
use crate::queue::LocationQueue;
use crate::remote::LocationStore;
use crate::types::LocationRecord;

/// Result of a sync pass that did not fail
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// Offline; nothing was attempted
    Deferred,
    /// The batch was accepted and removed from the queue
    Synced {
        count: usize,
        /// Rows echoed back by the remote, with `locationid` set
        committed: Vec<LocationRecord>,
    },
}

impl SyncOutcome {
    /// Number of records pushed by this pass
    pub fn count(&self) -> usize {
        match self {
            SyncOutcome::Deferred => 0,
            SyncOutcome::Synced { count, .. } => *count,
        }
    }
}

/// Running counters for reporting
#[derive(Debug, Default)]
pub struct SyncStats {
    passes: AtomicUsize,
    deferred: AtomicUsize,
    failures: AtomicUsize,
    records_synced: AtomicUsize,
}

/// Point-in-time copy of [`SyncStats`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncStatsSnapshot {
    pub passes: usize,
    pub deferred: usize,
    pub failures: usize,
    pub records_synced: usize,
}

impl SyncStats {
    pub fn snapshot(&self) -> SyncStatsSnapshot {
        SyncStatsSnapshot {
            passes: self.passes.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            records_synced: self.records_synced.load(Ordering::Relaxed),
        }
    }
}

/// Moves pending records from the queue to the remote store
pub struct SyncCoordinator {
    queue: Arc<LocationQueue>,
    store: Arc<dyn LocationStore>,
    network: NetworkStatus,
    stats: SyncStats,
}

impl SyncCoordinator {
    pub fn new(
        queue: Arc<LocationQueue>,
        store: Arc<dyn LocationStore>,
        network: NetworkStatus,
    ) -> Self {
        Self {
            queue,
            store,
            network,
            stats: SyncStats::default(),
        }
    }

    pub fn queue(&self) -> &Arc<LocationQueue> {
        &self.queue
    }

    pub fn stats(&self) -> SyncStatsSnapshot {
        self.stats.snapshot()
    }

    /// Push every pending record to the remote store.
    ///
    /// The queue lock is only held while reading the snapshot and while
    /// clearing it, never across the network request.
    pub async fn sync_pending(&self) -> Result<SyncOutcome, SyncError> {
        if !self.network.is_online() {
            tracing::debug!("Offline, deferring sync");
            self.stats.deferred.fetch_add(1, Ordering::Relaxed);
            return Ok(SyncOutcome::Deferred);
        }

        self.stats.passes.fetch_add(1, Ordering::Relaxed);

        let snapshot = self.queue.list_all().inspect_err(|_| {
            self.stats.failures.fetch_add(1, Ordering::Relaxed);
        })?;
        if snapshot.is_empty() {
            tracing::debug!("No pending locations to sync");
            return Ok(SyncOutcome::Synced {
                count: 0,
                committed: Vec::new(),
            });
        }

        let batch: Vec<LocationRecord> = snapshot.iter().map(|q| q.record.clone()).collect();
        tracing::info!(count = batch.len(), "Syncing pending locations");

        let committed = match self.store.insert_batch(&batch).await {
            Ok(committed) => committed,
            Err(e) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, pending = batch.len(), "Sync failed, queue left intact");
                return Err(e);
            }
        };

        // The remote has the rows now. If clearing fails they will be sent
        // again on the next pass.
        match self.queue.clear_batch(&snapshot) {
            Ok(removed) => {
                tracing::info!(synced = batch.len(), removed, "Locations synced");
            }
            Err(e) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    error = %e,
                    count = batch.len(),
                    "Synced locations could not be cleared; they will be re-sent"
                );
                return Err(SyncError::Queue(e));
            }
        }

        self.stats
            .records_synced
            .fetch_add(batch.len(), Ordering::Relaxed);

        Ok(SyncOutcome::Synced {
            count: batch.len(),
            committed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Position, UserId};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingStore {
        fail_with: Mutex<Option<u16>>,
        batches: Mutex<Vec<Vec<LocationRecord>>>,
    }

    #[async_trait]
    impl LocationStore for RecordingStore {
        async fn insert_batch(
            &self,
            records: &[LocationRecord],
        ) -> Result<Vec<LocationRecord>, SyncError> {
            self.batches.lock().unwrap().push(records.to_vec());
            if let Some(status) = *self.fail_with.lock().unwrap() {
                return Err(SyncError::RemoteRejected {
                    status,
                    body: "nope".to_string(),
                });
            }
            Ok(records
                .iter()
                .enumerate()
                .map(|(i, r)| LocationRecord {
                    location_id: Some(i as i64 + 1),
                    ..r.clone()
                })
                .collect())
        }

        async fn fetch_all(&self) -> Result<Vec<LocationRecord>, SyncError> {
            Ok(Vec::new())
        }

        async fn is_reachable(&self) -> bool {
            true
        }
    }

    fn queue_with(n: u32) -> Arc<LocationQueue> {
        let queue = LocationQueue::open_in_memory().unwrap();
        queue.migrate().unwrap();
        for i in 0..n {
            queue
                .append(&LocationRecord::from_position(
                    UserId::new("u"),
                    Utc.with_ymd_and_hms(2025, 1, 1, 0, i, 0).unwrap(),
                    Position {
                        latitude: 1.0,
                        longitude: 2.0,
                        elevation: None,
                    },
                ))
                .unwrap();
        }
        Arc::new(queue)
    }

    #[tokio::test]
    async fn test_offline_is_noop() {
        let queue = queue_with(2);
        let store = Arc::new(RecordingStore::default());
        let coordinator = SyncCoordinator::new(queue.clone(), store.clone(), NetworkStatus::new(false));

        let outcome = coordinator.sync_pending().await.unwrap();
        assert_eq!(outcome, SyncOutcome::Deferred);
        assert_eq!(outcome.count(), 0);
        assert_eq!(queue.len().unwrap(), 2);
        assert!(store.batches.lock().unwrap().is_empty());
        assert_eq!(coordinator.stats().deferred, 1);
    }

    #[tokio::test]
    async fn test_empty_queue_does_not_call_remote() {
        let queue = queue_with(0);
        let store = Arc::new(RecordingStore::default());
        let coordinator = SyncCoordinator::new(queue, store.clone(), NetworkStatus::new(true));

        assert_eq!(coordinator.sync_pending().await.unwrap().count(), 0);
        assert!(store.batches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejection_leaves_queue_intact() {
        let queue = queue_with(3);
        let store = Arc::new(RecordingStore::default());
        *store.fail_with.lock().unwrap() = Some(500);
        let coordinator = SyncCoordinator::new(queue.clone(), store.clone(), NetworkStatus::new(true));

        let err = coordinator.sync_pending().await.unwrap_err();
        assert!(matches!(err, SyncError::RemoteRejected { status: 500, .. }));
        assert_eq!(queue.len().unwrap(), 3);
        assert_eq!(coordinator.stats().failures, 1);
    }

    #[tokio::test]
    async fn test_success_clears_and_reports_count() {
        let queue = queue_with(3);
        let store = Arc::new(RecordingStore::default());
        let coordinator = SyncCoordinator::new(queue.clone(), store.clone(), NetworkStatus::new(true));

        let outcome = coordinator.sync_pending().await.unwrap();
        assert_eq!(outcome.count(), 3);
        assert_eq!(queue.len().unwrap(), 0);

        // One request carrying the whole batch, in timestamp order
        let batches = store.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 3);
        assert!(batches[0].windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[tokio::test]
    async fn test_clear_failure_resends_batch() {
        let queue = queue_with(2);
        let store = Arc::new(RecordingStore::default());
        let coordinator = SyncCoordinator::new(queue.clone(), store.clone(), NetworkStatus::new(true));

        queue
            .execute_batch(
                "CREATE TRIGGER block_clear BEFORE DELETE ON pending_locations
                 BEGIN SELECT RAISE(ABORT, 'clear blocked'); END;",
            )
            .unwrap();

        // Remote accepted, local clear failed: records stay queued
        let err = coordinator.sync_pending().await.unwrap_err();
        assert!(matches!(err, SyncError::Queue(_)));
        assert_eq!(queue.len().unwrap(), 2);

        queue.execute_batch("DROP TRIGGER block_clear;").unwrap();

        // Next pass sends the same rows again: the remote now holds duplicates
        assert_eq!(coordinator.sync_pending().await.unwrap().count(), 2);
        assert_eq!(queue.len().unwrap(), 0);

        let batches = store.batches.lock().unwrap();
        let remote_rows: usize = batches.iter().map(Vec::len).sum();
        assert_eq!(remote_rows, 4);
        assert_eq!(batches[0], batches[1]);
    }

    #[tokio::test]
    async fn test_appends_during_sync_stay_queued() {
        let queue = queue_with(2);
        let snapshot = queue.list_all().unwrap();
        queue
            .append(&LocationRecord::from_position(
                UserId::new("u"),
                Utc.with_ymd_and_hms(2025, 1, 1, 1, 0, 0).unwrap(),
                Position {
                    latitude: 3.0,
                    longitude: 4.0,
                    elevation: None,
                },
            ))
            .unwrap();

        assert_eq!(queue.clear_batch(&snapshot).unwrap(), 2);
        assert_eq!(queue.len().unwrap(), 1);
    }
}
