//! End-to-end tests for the capture and sync pipeline
//!
//! The remote store is an in-memory fake and positions come from scripted
//! providers, so every scenario runs without network or hardware.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use geotrail_core::agent::{AgentEvent, CaptureAgent, Trigger};
use geotrail_core::capture::{CaptureLoop, CycleOutcome, Surface};
use geotrail_core::connectivity::NetworkStatus;
use geotrail_core::display::DisplayRow;
use geotrail_core::identity::{IdentityStore, JsonFileIdentityStore, USER_ID_KEY};
use geotrail_core::lifecycle::{LifecycleEvent, LifecycleMonitor, NoWakeLock, Visibility};
use geotrail_core::sampler::{PositionProvider, SampleOptions, Sampler};
use geotrail_core::{
    AppContext, LocationQueue, LocationRecord, LocationStore, Position, SampleError, SyncCoordinator,
    SyncError, SyncOutcome, UserId,
};
use tempfile::TempDir;
use tokio::sync::watch;

// ============================================
// Fakes
// ============================================

/// Remote store kept in memory; assigns ids like a serial column
#[derive(Default)]
struct MemoryRemote {
    rows: Mutex<Vec<LocationRecord>>,
    insert_calls: AtomicUsize,
    reject_with: Mutex<Option<u16>>,
    /// Time each insert takes
    latency: Duration,
}

impl MemoryRemote {
    fn rows(&self) -> Vec<LocationRecord> {
        self.rows.lock().unwrap().clone()
    }

    fn calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LocationStore for MemoryRemote {
    async fn insert_batch(&self, records: &[LocationRecord]) -> Result<Vec<LocationRecord>, SyncError> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if let Some(status) = *self.reject_with.lock().unwrap() {
            return Err(SyncError::RemoteRejected {
                status,
                body: r#"{"message":"rejected"}"#.to_string(),
            });
        }

        let mut rows = self.rows.lock().unwrap();
        let mut committed = Vec::with_capacity(records.len());
        for record in records {
            let row = LocationRecord {
                location_id: Some(rows.len() as i64 + 1),
                ..record.clone()
            };
            rows.push(row.clone());
            committed.push(row);
        }
        Ok(committed)
    }

    async fn fetch_all(&self) -> Result<Vec<LocationRecord>, SyncError> {
        Ok(self.rows())
    }

    async fn is_reachable(&self) -> bool {
        true
    }
}

/// Hands out positions from a script, then fails
struct ScriptedProvider {
    fixes: Mutex<Vec<Result<Position, SampleError>>>,
}

impl ScriptedProvider {
    fn new(mut fixes: Vec<Result<Position, SampleError>>) -> Self {
        fixes.reverse();
        Self {
            fixes: Mutex::new(fixes),
        }
    }
}

#[async_trait]
impl PositionProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn current_position(&self, _options: &SampleOptions) -> Result<Position, SampleError> {
        self.fixes
            .lock()
            .unwrap()
            .pop()
            .unwrap_or(Err(SampleError::Unavailable))
    }
}

#[derive(Default)]
struct NullSurface {
    rows: Mutex<Vec<DisplayRow>>,
}

impl Surface for NullSurface {
    fn append_row(&self, row: DisplayRow) {
        self.rows.lock().unwrap().push(row);
    }

    fn replace_rows(&self, rows: Vec<DisplayRow>) {
        *self.rows.lock().unwrap() = rows;
    }
}

// ============================================
// Helpers
// ============================================

fn fix(latitude: f64, longitude: f64) -> Result<Position, SampleError> {
    Ok(Position {
        latitude,
        longitude,
        elevation: None,
    })
}

fn sampler(fixes: Vec<Result<Position, SampleError>>) -> Arc<Sampler> {
    geotrail_core::logging::init_test();
    Arc::new(Sampler::new(
        Some(Arc::new(ScriptedProvider::new(fixes))),
        SampleOptions::default(),
    ))
}

fn memory_queue() -> Arc<LocationQueue> {
    let queue = LocationQueue::open_in_memory().unwrap();
    queue.migrate().unwrap();
    Arc::new(queue)
}

struct Pipeline {
    ctx: AppContext,
    queue: Arc<LocationQueue>,
    remote: Arc<MemoryRemote>,
    sync: Arc<SyncCoordinator>,
}

fn pipeline(online: bool) -> Pipeline {
    let ctx = AppContext::new(UserId::new("device-a"), NetworkStatus::new(online));
    let queue = memory_queue();
    let remote = Arc::new(MemoryRemote::default());
    let sync = Arc::new(SyncCoordinator::new(
        queue.clone(),
        remote.clone(),
        ctx.network().clone(),
    ));
    Pipeline {
        ctx,
        queue,
        remote,
        sync,
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

// ============================================
// Conservation and sync gates
// ============================================

#[tokio::test]
async fn test_offline_captures_then_sync_on_reconnect() {
    let p = pipeline(false);
    let (agent, _handle) = CaptureAgent::new(
        p.ctx.clone(),
        sampler(vec![fix(15.37, 119.94), fix(15.38, 119.95), fix(15.39, 119.96)]),
        Some(p.queue.clone()),
        Some(p.sync.clone()),
        Duration::from_secs(900),
    );

    for _ in 0..3 {
        assert!(agent.capture(Trigger::PeriodicWake).await.is_queued());
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(p.queue.len().unwrap(), 3);
    assert!(p.remote.rows().is_empty());

    // Offline sync is a no-op
    assert_eq!(p.sync.sync_pending().await.unwrap(), SyncOutcome::Deferred);
    assert_eq!(p.queue.len().unwrap(), 3);
    assert_eq!(p.remote.calls(), 0);

    p.ctx.network().set_online(true);
    let outcome = p.sync.sync_pending().await.unwrap();
    assert_eq!(outcome.count(), 3);

    assert_eq!(p.queue.len().unwrap(), 0);
    assert_eq!(p.remote.calls(), 1);
    let remote = p.remote.rows();
    assert_eq!(remote.len(), 3);
    assert!(remote.iter().all(LocationRecord::is_committed));
    assert!(remote.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    assert!(remote.iter().all(|r| r.user_id.as_str() == "device-a"));
}

#[tokio::test]
async fn test_sample_failure_never_reaches_queue_or_remote() {
    let p = pipeline(true);
    let failing = sampler(vec![
        Err(SampleError::PermissionDenied),
        Err(SampleError::Timeout),
    ]);

    let (agent, _handle) = CaptureAgent::new(
        p.ctx.clone(),
        failing.clone(),
        Some(p.queue.clone()),
        Some(p.sync.clone()),
        Duration::from_secs(900),
    );
    assert!(!agent.capture(Trigger::Flush).await.is_queued());

    let surface = Arc::new(NullSurface::default());
    let mut capture = CaptureLoop::new(
        p.ctx.clone(),
        failing,
        Some(p.remote.clone()),
        None,
        surface.clone(),
    );
    assert_eq!(
        capture.run_cycle().await,
        CycleOutcome::Unavailable(SampleError::Timeout)
    );

    assert_eq!(p.queue.len().unwrap(), 0);
    assert_eq!(p.remote.calls(), 0);
    // The foreground still shows the failed cycle
    assert!(surface.rows.lock().unwrap()[0].is_unavailable());
}

#[tokio::test]
async fn test_rejected_batch_leaves_queue_unchanged() {
    let p = pipeline(false);
    let (agent, _handle) = CaptureAgent::new(
        p.ctx.clone(),
        sampler(vec![fix(1.0, 1.0), fix(2.0, 2.0)]),
        Some(p.queue.clone()),
        Some(p.sync.clone()),
        Duration::from_secs(900),
    );
    agent.capture(Trigger::Flush).await;
    agent.capture(Trigger::Flush).await;

    p.ctx.network().set_online(true);
    *p.remote.reject_with.lock().unwrap() = Some(422);

    let err = p.sync.sync_pending().await.unwrap_err();
    assert!(matches!(err, SyncError::RemoteRejected { status: 422, .. }));
    assert!(!err.is_transient());
    assert_eq!(p.queue.len().unwrap(), 2);

    // A later trigger succeeds once the remote accepts again
    *p.remote.reject_with.lock().unwrap() = None;
    assert_eq!(p.sync.sync_pending().await.unwrap().count(), 2);
    assert_eq!(p.queue.len().unwrap() + p.remote.rows().len(), 2);
}

#[tokio::test]
async fn test_queue_survives_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("queue.db");

    {
        let queue = LocationQueue::open(&path).unwrap();
        queue.migrate().unwrap();
        let ctx = AppContext::new(UserId::new("device-a"), NetworkStatus::new(false));
        let (agent, _handle) = CaptureAgent::new(
            ctx,
            sampler(vec![fix(1.0, 1.0)]),
            Some(Arc::new(queue)),
            None,
            Duration::from_secs(900),
        );
        assert!(agent.capture(Trigger::Flush).await.is_queued());
    }

    let queue = LocationQueue::open(&path).unwrap();
    queue.migrate().unwrap();
    let pending = queue.list_all().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].record.latitude, Some(1.0));
}

// ============================================
// Lifecycle driven triggers
// ============================================

#[tokio::test]
async fn test_hidden_flushes_through_agent_and_syncs() {
    let p = pipeline(true);
    let (agent, handle) = CaptureAgent::new(
        p.ctx.clone(),
        sampler(vec![fix(14.6, 121.0)]),
        Some(p.queue.clone()),
        Some(p.sync.clone()),
        Duration::from_secs(900),
    );
    let mut events = handle.subscribe();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(agent.run(shutdown_rx));

    let mut monitor = LifecycleMonitor::new(
        Visibility::Visible,
        p.ctx.network().clone(),
        Some(handle),
        Box::new(NoWakeLock),
        None,
    );
    monitor.handle(LifecycleEvent::Hidden);

    let AgentEvent::NewLocationRecorded(record) = events.recv().await.unwrap();
    assert_eq!(record.latitude, Some(14.6));

    let remote = p.remote.clone();
    wait_until(move || remote.rows().len() == 1).await;
    assert_eq!(p.queue.len().unwrap(), 0);
}

#[tokio::test]
async fn test_online_edge_drains_queue() {
    let p = pipeline(false);
    let (agent, handle) = CaptureAgent::new(
        p.ctx.clone(),
        sampler(vec![fix(1.0, 2.0), fix(3.0, 4.0)]),
        Some(p.queue.clone()),
        Some(p.sync.clone()),
        Duration::from_secs(900),
    );
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(agent.run(shutdown_rx));

    assert!(handle.record_now().await.unwrap());
    assert!(handle.record_now().await.unwrap());
    assert_eq!(p.queue.len().unwrap(), 2);

    let mut monitor = LifecycleMonitor::new(
        Visibility::Hidden,
        p.ctx.network().clone(),
        Some(handle),
        Box::new(NoWakeLock),
        None,
    );
    monitor.handle(LifecycleEvent::Online);

    let queue = p.queue.clone();
    wait_until(move || queue.len().unwrap() == 0).await;
    assert_eq!(p.remote.rows().len(), 2);
}

// ============================================
// Identity
// ============================================

#[test]
fn test_identity_generated_once_and_reused() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("identity.json");

    let first = AppContext::initialize(&JsonFileIdentityStore::new(&path), false).unwrap();
    let id = first.user_id().as_str().to_string();

    // UUID v4: version nibble 4, variant nibble 8..b
    let parsed = uuid::Uuid::parse_str(&id).unwrap();
    assert_eq!(parsed.get_version_num(), 4);
    let variant = id.chars().nth(19).unwrap();
    assert!(matches!(variant, '8' | '9' | 'a' | 'b'), "variant {variant}");

    let second = AppContext::initialize(&JsonFileIdentityStore::new(&path), true).unwrap();
    assert_eq!(second.user_id().as_str(), id);

    let stored = JsonFileIdentityStore::new(&path).get(USER_ID_KEY).unwrap();
    assert_eq!(stored.as_deref(), Some(id.as_str()));
}

// ============================================
// Agent responsiveness
// ============================================

#[tokio::test(start_paused = true)]
async fn test_foreground_fallback_queues_while_agent_syncs() {
    let ctx = AppContext::new(UserId::new("device-a"), NetworkStatus::new(true));
    let queue = memory_queue();
    let remote = Arc::new(MemoryRemote {
        latency: Duration::from_secs(25),
        ..Default::default()
    });
    let sync = Arc::new(SyncCoordinator::new(
        queue.clone(),
        remote.clone(),
        ctx.network().clone(),
    ));
    let (agent, handle) = CaptureAgent::new(
        ctx.clone(),
        sampler(vec![fix(14.6, 121.0)]),
        Some(queue.clone()),
        Some(sync),
        Duration::from_secs(900),
    );
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(agent.run(shutdown_rx));

    // Leaves a slow sync pass running in the background
    assert!(handle.record_now().await.unwrap());

    let mut capture = CaptureLoop::new(
        ctx,
        sampler(vec![fix(14.7, 121.1)]),
        None,
        Some(handle),
        Arc::new(NullSurface::default()),
    );
    assert_eq!(capture.run_cycle().await, CycleOutcome::Queued);
    assert_eq!(queue.len().unwrap(), 2);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(queue.len().unwrap(), 0);
    assert_eq!(remote.rows().len(), 2);
}
