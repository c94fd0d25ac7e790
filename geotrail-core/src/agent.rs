//! Background capture agent
//!
//! Runs independently of the foreground surface. It wakes on three
//! independent triggers:
//!
//! - a low-frequency periodic timer (at least every 15 minutes)
//! - an explicit "record now" request, sent when the surface is hidden
//! - a sync request, sent when connectivity comes back
//!
//! A capture samples a position, appends it to the durable queue, tells the
//! foreground about it, and then attempts a sync pass if online.
//!
//! Sync passes run on their own task so the request loop keeps answering
//! while a pass waits on the network. At most one pass runs at a time;
//! triggers that arrive meanwhile are folded into one follow-up pass.
//!
//! Other execution contexts talk to the agent through [`AgentHandle`].
//! Every request carries its own reply channel.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};

use crate::connectivity::NetworkStatus;
use crate::context::AppContext;
use crate::error::{QueueError, SampleError};
use crate::queue::LocationQueue;
use crate::sampler::Sampler;
use crate::sync::{SyncCoordinator, SyncOutcome};
use crate::types::{LocationRecord, UserId};

/// Capacity of the request channel
const REQUEST_BUFFER: usize = 32;

/// Capacity of the notification channel
const EVENT_BUFFER: usize = 64;

/// Extra time granted to a reply beyond the sampling timeout
const REPLY_MARGIN: Duration = Duration::from_secs(5);

/// How long [`AgentHandle::sync_now`] waits for its pass to finish
const SYNC_REPLY_TIMEOUT: Duration = Duration::from_secs(120);

/// Requests accepted by the agent.
#[derive(Debug)]
pub enum AgentRequest {
    /// Register the foreground's user id; the reply says whether it matches
    StoreUserId {
        user_id: UserId,
        reply: oneshot::Sender<bool>,
    },
    /// Ask which user id the agent attributes records to
    GetUserId { reply: oneshot::Sender<UserId> },
    /// Sample and queue immediately
    RecordLocationNow { reply: oneshot::Sender<bool> },
    /// Queue an already-sampled record (foreground fallback path)
    StoreLocation {
        record: LocationRecord,
        reply: oneshot::Sender<bool>,
    },
    /// Run a sync pass; the reply is sent once a pass covering this
    /// request has finished
    SyncNow { reply: oneshot::Sender<bool> },
}

/// Notifications from the agent to any foreground listener.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    NewLocationRecorded(LocationRecord),
}

/// Failure to talk to the agent
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentError {
    #[error("capture agent is not running")]
    Stopped,

    /// The request could not be delivered in time
    #[error("capture agent is not accepting requests")]
    Busy,

    /// The request was delivered but no reply came back in time
    #[error("capture agent did not reply in time")]
    Timeout,
}

/// Why a capture ran (for logs)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    PeriodicWake,
    Flush,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::PeriodicWake => f.write_str("periodic"),
            Trigger::Flush => f.write_str("flush"),
        }
    }
}

/// What one background capture achieved
#[derive(Debug)]
pub enum CaptureReport {
    /// Durably queued under this id
    Queued { id: i64, record: LocationRecord },
    /// No position; nothing was written
    SampleFailed(SampleError),
    /// The append failed; this sample is gone
    Lost(QueueError),
}

impl CaptureReport {
    pub fn is_queued(&self) -> bool {
        matches!(self, CaptureReport::Queued { .. })
    }
}

/// Cloneable client side of the agent
#[derive(Clone)]
pub struct AgentHandle {
    tx: mpsc::Sender<AgentRequest>,
    events: broadcast::Sender<AgentEvent>,
    reply_timeout: Duration,
}

impl AgentHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> AgentRequest,
    ) -> Result<T, AgentError> {
        self.request_within(self.reply_timeout, make).await
    }

    async fn request_within<T>(
        &self,
        reply_timeout: Duration,
        make: impl FnOnce(oneshot::Sender<T>) -> AgentRequest,
    ) -> Result<T, AgentError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        tokio::time::timeout(self.reply_timeout, self.tx.send(make(reply_tx)))
            .await
            .map_err(|_| AgentError::Busy)?
            .map_err(|_| AgentError::Stopped)?;

        match tokio::time::timeout(reply_timeout, reply_rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(AgentError::Stopped),
            Err(_) => Err(AgentError::Timeout),
        }
    }

    /// Register the foreground user id with the agent
    pub async fn store_user_id(&self, user_id: UserId) -> Result<bool, AgentError> {
        self.request(|reply| AgentRequest::StoreUserId { user_id, reply })
            .await
    }

    /// The user id the agent uses for its records
    pub async fn user_id(&self) -> Result<UserId, AgentError> {
        self.request(|reply| AgentRequest::GetUserId { reply }).await
    }

    /// Sample and queue now, waiting for the result
    pub async fn record_now(&self) -> Result<bool, AgentError> {
        self.request(|reply| AgentRequest::RecordLocationNow { reply })
            .await
    }

    /// Hand a sampled record to the queue path, waiting for the result
    pub async fn store_location(&self, record: LocationRecord) -> Result<bool, AgentError> {
        self.request(|reply| AgentRequest::StoreLocation { record, reply })
            .await
    }

    /// Run a sync pass, waiting for it to finish
    pub async fn sync_now(&self) -> Result<bool, AgentError> {
        self.request_within(SYNC_REPLY_TIMEOUT, |reply| AgentRequest::SyncNow { reply })
            .await
    }

    /// Ask for an immediate capture without waiting; false if not delivered
    pub fn flush_now(&self) -> bool {
        let (reply, _) = oneshot::channel();
        self.tx
            .try_send(AgentRequest::RecordLocationNow { reply })
            .is_ok()
    }

    /// Ask for a sync opportunity without waiting; false if not delivered
    pub fn request_sync(&self) -> bool {
        let (reply, _) = oneshot::channel();
        self.tx.try_send(AgentRequest::SyncNow { reply }).is_ok()
    }

    /// Subscribe to agent notifications
    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }
    /// Handle whose requests land in the returned receiver
    #[cfg(test)]
    pub(crate) fn detached(reply_timeout: Duration) -> (Self, mpsc::Receiver<AgentRequest>) {
        let (tx, rx) = mpsc::channel(REQUEST_BUFFER);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let handle = Self {
            tx,
            events,
            reply_timeout,
        };
        (handle, rx)
    }
}

/// Runs sync passes off the request loop, one at a time
#[derive(Clone)]
struct SyncRunner {
    sync: Arc<SyncCoordinator>,
    network: NetworkStatus,
    running: Arc<AtomicBool>,
    again: Arc<AtomicBool>,
    waiters: Arc<Mutex<Vec<oneshot::Sender<bool>>>>,
}

impl SyncRunner {
    fn new(sync: Arc<SyncCoordinator>, network: NetworkStatus) -> Self {
        Self {
            sync,
            network,
            running: Arc::new(AtomicBool::new(false)),
            again: Arc::new(AtomicBool::new(false)),
            waiters: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Start a pass, or fold into the one in flight
    fn trigger(&self, waiter: Option<oneshot::Sender<bool>>) {
        if !self.network.is_online() {
            tracing::debug!("Offline, sync postponed");
            if let Some(waiter) = waiter {
                let _ = waiter.send(true);
            }
            return;
        }

        if let Some(waiter) = waiter {
            self.lock_waiters().push(waiter);
        }
        self.again.store(true, Ordering::SeqCst);
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::debug!("Sync pass in flight; another will follow");
            return;
        }

        let runner = self.clone();
        tokio::spawn(async move { runner.drive().await });
    }

    async fn drive(self) {
        loop {
            self.again.store(false, Ordering::SeqCst);
            let waiters = std::mem::take(&mut *self.lock_waiters());

            let ok = match self.sync.sync_pending().await {
                Ok(SyncOutcome::Synced { count, .. }) if count > 0 => {
                    tracing::info!(count, "Background sync complete");
                    true
                }
                Ok(_) => true,
                Err(e) => {
                    tracing::warn!(error = %e, "Background sync failed; will retry on next trigger");
                    false
                }
            };
            for waiter in waiters {
                let _ = waiter.send(ok);
            }

            self.running.store(false, Ordering::SeqCst);
            if !self.again.load(Ordering::SeqCst) || self.running.swap(true, Ordering::SeqCst) {
                break;
            }
        }
    }

    fn lock_waiters(&self) -> std::sync::MutexGuard<'_, Vec<oneshot::Sender<bool>>> {
        // Plain data; a panicked holder leaves it usable
        self.waiters.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// The background capture/caching agent
pub struct CaptureAgent {
    ctx: AppContext,
    sampler: Arc<Sampler>,
    queue: Option<Arc<LocationQueue>>,
    sync: Option<SyncRunner>,
    events: broadcast::Sender<AgentEvent>,
    requests: mpsc::Receiver<AgentRequest>,
    wake_interval: Duration,
    periodic: bool,
}

impl CaptureAgent {
    /// Create an agent and its handle.
    ///
    /// `queue` is `None` when the durable queue could not be opened; the
    /// agent then still answers requests but cannot capture.
    pub fn new(
        ctx: AppContext,
        sampler: Arc<Sampler>,
        queue: Option<Arc<LocationQueue>>,
        sync: Option<Arc<SyncCoordinator>>,
        wake_interval: Duration,
    ) -> (Self, AgentHandle) {
        let (tx, requests) = mpsc::channel(REQUEST_BUFFER);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let reply_timeout = sampler.options().timeout + REPLY_MARGIN;
        let sync = sync.map(|sync| SyncRunner::new(sync, ctx.network().clone()));

        let handle = AgentHandle {
            tx,
            events: events.clone(),
            reply_timeout,
        };
        let agent = Self {
            ctx,
            sampler,
            queue,
            sync,
            events,
            requests,
            wake_interval,
            periodic: true,
        };
        (agent, handle)
    }

    /// Serve requests only; another process owns the periodic wake
    pub fn without_periodic_wake(mut self) -> Self {
        self.periodic = false;
        self
    }

    /// Serve requests and periodic wakes until shutdown
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut wake =
            tokio::time::interval_at(Instant::now() + self.wake_interval, self.wake_interval);
        wake.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            wake_interval_secs = self.wake_interval.as_secs(),
            periodic = self.periodic,
            queue_available = self.queue.is_some(),
            "Capture agent started"
        );

        loop {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(request) => self.handle(request).await,
                    None => break,
                },
                _ = wake.tick(), if self.periodic => {
                    let report = self.capture(Trigger::PeriodicWake).await;
                    if !matches!(report, CaptureReport::SampleFailed(_)) {
                        self.start_sync(None);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Capture agent stopped");
    }

    async fn handle(&mut self, request: AgentRequest) {
        match request {
            AgentRequest::StoreUserId { user_id, reply } => {
                let matches = &user_id == self.ctx.user_id();
                if !matches {
                    tracing::warn!(
                        offered = %user_id,
                        current = %self.ctx.user_id(),
                        "Refusing to replace the user id"
                    );
                }
                let _ = reply.send(matches);
            }
            AgentRequest::GetUserId { reply } => {
                let _ = reply.send(self.ctx.user_id().clone());
            }
            AgentRequest::RecordLocationNow { reply } => {
                let report = self.capture(Trigger::Flush).await;
                let _ = reply.send(report.is_queued());
                if !matches!(report, CaptureReport::SampleFailed(_)) {
                    self.start_sync(None);
                }
            }
            AgentRequest::StoreLocation { record, reply } => {
                let queued = self.store(&record).is_some();
                let _ = reply.send(queued);
                if record.has_position() {
                    self.start_sync(None);
                }
            }
            AgentRequest::SyncNow { reply } => self.start_sync(Some(reply)),
        }
    }

    /// Sample, queue and announce one record
    pub async fn capture(&self, trigger: Trigger) -> CaptureReport {
        let position = match self.sampler.sample().await {
            Ok(position) => position,
            Err(e) => {
                tracing::warn!(%trigger, error = %e, "Background capture skipped: no position");
                return CaptureReport::SampleFailed(e);
            }
        };

        let record =
            LocationRecord::from_position(self.ctx.user_id().clone(), Utc::now(), position);

        let Some(queue) = &self.queue else {
            tracing::error!(%trigger, lost = true, "Queue unavailable; background capture lost");
            return CaptureReport::Lost(QueueError::StorageUnavailable(
                "queue is not open".to_string(),
            ));
        };

        match queue.append(&record) {
            Ok(id) => {
                tracing::info!(%trigger, id, "Location recorded in background");
                // No listeners is fine
                let _ = self.events.send(AgentEvent::NewLocationRecorded(record.clone()));
                CaptureReport::Queued { id, record }
            }
            Err(e) => {
                tracing::error!(%trigger, lost = true, error = %e, "Failed to queue location; sample lost");
                CaptureReport::Lost(e)
            }
        }
    }

    /// Queue a record sampled elsewhere; `None` if it was not stored
    fn store(&self, record: &LocationRecord) -> Option<i64> {
        if !record.has_position() {
            tracing::warn!("Refusing to queue a record without a position");
            return None;
        }
        let Some(queue) = &self.queue else {
            tracing::error!(lost = true, "Queue unavailable; foreground record lost");
            return None;
        };
        match queue.append(record) {
            Ok(id) => {
                tracing::info!(id, "Foreground location queued for later sync");
                Some(id)
            }
            Err(e) => {
                tracing::error!(lost = true, error = %e, "Failed to queue foreground location; record lost");
                None
            }
        }
    }

    /// Kick off a sync pass without waiting for it
    fn start_sync(&self, waiter: Option<oneshot::Sender<bool>>) {
        match &self.sync {
            Some(runner) => runner.trigger(waiter),
            None => {
                if let Some(waiter) = waiter {
                    let _ = waiter.send(true);
                }
            }
        }
    }
}
