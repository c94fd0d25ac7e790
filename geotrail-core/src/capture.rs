//! Foreground capture loop
//!
//! While the surface is visible, samples a position on a fixed cadence,
//! renders it, and tries to insert it into the remote store directly. A
//! record the remote did not accept is handed to the capture agent, which
//! queues it durably.
//!
//! ```text
//! Idle -> ScheduledWait -> Sampling -> Rendered -> ScheduledWait -> ...
//! ```
//!
//! The first cycle is aligned to the next minute boundary.

use std::slice;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;

use crate::agent::{AgentError, AgentEvent, AgentHandle};
use crate::connectivity::NetworkStatus;
use crate::context::AppContext;
use crate::display::DisplayRow;
use crate::error::{SampleError, SyncError};
use crate::lifecycle::Visibility;
use crate::remote::LocationStore;
use crate::sampler::Sampler;
use crate::types::LocationRecord;

/// Where rows are rendered
pub trait Surface: Send + Sync {
    fn append_row(&self, row: DisplayRow);
    fn replace_rows(&self, rows: Vec<DisplayRow>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    ScheduledWait,
    Sampling,
    Rendered,
}

/// Result of one foreground cycle
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Accepted by the remote on the direct path
    Stored { committed: Option<LocationRecord> },
    /// Handed to the agent and durably queued
    Queued,
    /// Delivered to the agent, which did not confirm in time
    Unconfirmed,
    /// Neither stored nor queued
    Lost,
    /// Sampling failed; only an unavailable row was rendered
    Unavailable(SampleError),
}

/// Shortest cadence the loop accepts
const MIN_PERIOD: Duration = Duration::from_secs(1);

/// Time until the next whole minute, counted from `now`
pub fn delay_until_next_minute(now: DateTime<Utc>) -> Duration {
    Duration::from_secs(60 - u64::from(now.second()))
}

pub struct CaptureLoop {
    ctx: AppContext,
    sampler: Arc<Sampler>,
    store: Option<Arc<dyn LocationStore>>,
    agent: Option<AgentHandle>,
    surface: Arc<dyn Surface>,
    period: Duration,
    align_to_minute: bool,
    state: CaptureState,
}

impl CaptureLoop {
    pub fn new(
        ctx: AppContext,
        sampler: Arc<Sampler>,
        store: Option<Arc<dyn LocationStore>>,
        agent: Option<AgentHandle>,
        surface: Arc<dyn Surface>,
    ) -> Self {
        Self {
            ctx,
            sampler,
            store,
            agent,
            surface,
            period: Duration::from_secs(60),
            align_to_minute: true,
            state: CaptureState::Idle,
        }
    }

    /// Cadence after the first cycle, at least one second
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period.max(MIN_PERIOD);
        self
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn with_minute_alignment(mut self, align: bool) -> Self {
        self.align_to_minute = align;
        self
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    /// Run cycles while visible, idle while hidden, until shutdown
    pub async fn run(
        mut self,
        mut visibility: watch::Receiver<Visibility>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        'outer: loop {
            self.state = CaptureState::Idle;

            // Sleep until the surface is shown
            while *visibility.borrow_and_update() == Visibility::Hidden {
                tokio::select! {
                    changed = visibility.changed() => {
                        if changed.is_err() {
                            break 'outer;
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break 'outer;
                        }
                    }
                }
            }

            let first = if self.align_to_minute {
                delay_until_next_minute(Utc::now())
            } else {
                self.period
            };
            let mut next = Instant::now() + first;
            self.state = CaptureState::ScheduledWait;
            tracing::debug!(first_in_secs = first.as_secs(), "Capture loop scheduled");

            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(next) => {
                        self.run_cycle().await;
                        self.state = CaptureState::ScheduledWait;
                        next += self.period;
                        // A long cycle skips missed slots instead of bursting
                        let now = Instant::now();
                        while next <= now {
                            next += self.period;
                        }
                    }
                    changed = visibility.changed() => {
                        if changed.is_err() {
                            break 'outer;
                        }
                        if *visibility.borrow() == Visibility::Hidden {
                            continue 'outer;
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break 'outer;
                        }
                    }
                }
            }
        }

        self.state = CaptureState::Idle;
        tracing::debug!("Capture loop stopped");
    }

    /// One sample, render and persist attempt
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        self.state = CaptureState::Sampling;
        let now = Utc::now();

        let position = match self.sampler.sample().await {
            Ok(position) => position,
            Err(e) => {
                self.surface
                    .append_row(DisplayRow::unavailable(self.ctx.user_id(), now));
                self.state = CaptureState::Rendered;
                tracing::warn!(error = %e, "Location unavailable this cycle");
                return CycleOutcome::Unavailable(e);
            }
        };

        let record = LocationRecord::from_position(self.ctx.user_id().clone(), now, position);
        self.surface.append_row(DisplayRow::from_record(&record));
        self.state = CaptureState::Rendered;

        self.persist(record).await
    }

    async fn persist(&self, record: LocationRecord) -> CycleOutcome {
        match &self.store {
            Some(store) if self.ctx.network().is_online() => {
                match store.insert_batch(slice::from_ref(&record)).await {
                    Ok(committed) => {
                        tracing::debug!("Location stored remotely");
                        return CycleOutcome::Stored {
                            committed: committed.into_iter().next(),
                        };
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Direct insert failed; handing record to the agent");
                    }
                }
            }
            Some(_) => tracing::debug!("Offline; handing record to the agent"),
            None => tracing::debug!("No remote store; handing record to the agent"),
        }

        let Some(agent) = &self.agent else {
            tracing::error!(lost = true, "No capture agent to queue the record; it is lost");
            return CycleOutcome::Lost;
        };

        match agent.store_location(record).await {
            Ok(true) => CycleOutcome::Queued,
            Ok(false) => CycleOutcome::Lost,
            Err(AgentError::Timeout) => {
                tracing::warn!("Capture agent took the record but did not confirm; delivery unconfirmed");
                CycleOutcome::Unconfirmed
            }
            Err(e) => {
                tracing::error!(lost = true, error = %e, "Capture agent unreachable; record lost");
                CycleOutcome::Lost
            }
        }
    }
}

/// Replaces the surface contents with the remote history
pub struct HistoryRefresher {
    store: Arc<dyn LocationStore>,
    surface: Arc<dyn Surface>,
    network: Option<NetworkStatus>,
}

impl HistoryRefresher {
    pub fn new(store: Arc<dyn LocationStore>, surface: Arc<dyn Surface>) -> Self {
        Self {
            store,
            surface,
            network: None,
        }
    }

    /// Skip the request while this status reports offline
    pub fn with_network(mut self, network: NetworkStatus) -> Self {
        self.network = Some(network);
        self
    }

    /// Fetch and render the full history; returns the number of rows.
    ///
    /// Fails with [`SyncError::Offline`] without touching the surface when
    /// the network is known to be down.
    pub async fn refresh(&self) -> Result<usize, SyncError> {
        if self.network.as_ref().is_some_and(|n| !n.is_online()) {
            return Err(SyncError::Offline);
        }
        let mut records = self.store.fetch_all().await?;
        records.sort_by_key(|r| r.timestamp);

        let rows: Vec<DisplayRow> = records.iter().map(DisplayRow::from_record).collect();
        let count = rows.len();
        self.surface.replace_rows(rows);
        tracing::debug!(count, "History refreshed");
        Ok(count)
    }
}

/// Append rows for records the agent captured in the background
pub async fn relay_agent_events(
    mut events: broadcast::Receiver<AgentEvent>,
    surface: Arc<dyn Surface>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(AgentEvent::NewLocationRecorded(record)) => {
                    surface.append_row(DisplayRow::from_record(&record));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Missed agent notifications");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
