//! Lifecycle monitor
//!
//! Reacts to surface visibility and connectivity transitions. Events are
//! edge-triggered: a repeated `Hidden` or `Online` is ignored.
//!
//! | Edge              | Actions                                              |
//! |-------------------|------------------------------------------------------|
//! | visible -> hidden | release wake lock, flush the agent, request a sync   |
//! | hidden -> visible | re-acquire wake lock, refresh history from remote    |
//! | offline -> online | mark online, request a sync                          |
//! | online -> offline | mark offline                                         |

use std::any::Any;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::agent::AgentHandle;
use crate::capture::HistoryRefresher;
use crate::connectivity::NetworkStatus;
use crate::error::{Result, SyncError};

/// Transition reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Visible,
    Hidden,
    Online,
    Offline,
}

/// Whether the rendering surface is on screen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

/// Something the monitor did in response to an edge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    WakeLockAcquired,
    WakeLockReleased,
    FlushRequested,
    SyncRequested,
    RefreshHistory,
    MarkedOnline,
    MarkedOffline,
}

/// Held wake-lock-like resource; released on drop
pub struct WakeGuard(#[allow(dead_code)] Box<dyn Any + Send + Sync>);

impl WakeGuard {
    pub fn new(resource: impl Any + Send + Sync) -> Self {
        Self(Box::new(resource))
    }
}

impl std::fmt::Debug for WakeGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("WakeGuard")
    }
}

/// Source of a wake-lock-like resource.
///
/// `Ok(None)` means the resource is not available right now, which is not
/// an error.
pub trait WakeLock: Send + Sync {
    fn acquire(&self) -> Result<Option<WakeGuard>>;
}

/// Platform without any wake lock
#[derive(Debug, Default, Clone, Copy)]
pub struct NoWakeLock;

impl WakeLock for NoWakeLock {
    fn acquire(&self) -> Result<Option<WakeGuard>> {
        Ok(None)
    }
}

pub struct LifecycleMonitor {
    network: NetworkStatus,
    agent: Option<AgentHandle>,
    wake_lock: Box<dyn WakeLock>,
    guard: Option<WakeGuard>,
    visibility: watch::Sender<Visibility>,
    refresher: Option<Arc<HistoryRefresher>>,
}

impl LifecycleMonitor {
    /// Create a monitor for a surface that starts out `initial`.
    ///
    /// When starting visible the wake lock is acquired right away.
    pub fn new(
        initial: Visibility,
        network: NetworkStatus,
        agent: Option<AgentHandle>,
        wake_lock: Box<dyn WakeLock>,
        refresher: Option<Arc<HistoryRefresher>>,
    ) -> Self {
        let (visibility, _) = watch::channel(initial);
        let mut monitor = Self {
            network,
            agent,
            wake_lock,
            guard: None,
            visibility,
            refresher,
        };
        if initial == Visibility::Visible {
            monitor.acquire_wake_lock();
        }
        monitor
    }

    /// Receiver the capture loop uses to pause while hidden
    pub fn visibility(&self) -> watch::Receiver<Visibility> {
        self.visibility.subscribe()
    }

    pub fn current_visibility(&self) -> Visibility {
        *self.visibility.borrow()
    }

    pub fn holds_wake_lock(&self) -> bool {
        self.guard.is_some()
    }

    /// Apply one event. Returns the actions taken; empty when the event was
    /// not an edge.
    ///
    /// `RefreshHistory` is returned but not performed here, since it needs
    /// to await the network.
    pub fn handle(&mut self, event: LifecycleEvent) -> Vec<LifecycleAction> {
        let mut actions = Vec::new();

        match event {
            LifecycleEvent::Hidden => {
                if !self.set_visibility(Visibility::Hidden) {
                    return actions;
                }
                tracing::debug!("Surface hidden");
                if self.guard.take().is_some() {
                    actions.push(LifecycleAction::WakeLockReleased);
                }
                if let Some(agent) = &self.agent {
                    if agent.flush_now() {
                        actions.push(LifecycleAction::FlushRequested);
                    } else {
                        tracing::warn!("Capture agent did not accept flush request");
                    }
                    if agent.request_sync() {
                        actions.push(LifecycleAction::SyncRequested);
                    }
                }
            }
            LifecycleEvent::Visible => {
                if !self.set_visibility(Visibility::Visible) {
                    return actions;
                }
                tracing::debug!("Surface visible");
                if self.acquire_wake_lock() {
                    actions.push(LifecycleAction::WakeLockAcquired);
                }
                if self.refresher.is_some() {
                    actions.push(LifecycleAction::RefreshHistory);
                }
            }
            LifecycleEvent::Online => {
                if !self.network.set_online(true) {
                    return actions;
                }
                tracing::info!("Back online");
                actions.push(LifecycleAction::MarkedOnline);
                if let Some(agent) = &self.agent {
                    if agent.request_sync() {
                        actions.push(LifecycleAction::SyncRequested);
                    }
                }
            }
            LifecycleEvent::Offline => {
                if !self.network.set_online(false) {
                    return actions;
                }
                tracing::info!("Gone offline");
                actions.push(LifecycleAction::MarkedOffline);
            }
        }

        actions
    }

    /// Consume events until the sender side closes or shutdown is signalled
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<LifecycleEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let event = tokio::select! {
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            let actions = self.handle(event);
            if actions.contains(&LifecycleAction::RefreshHistory) {
                if let Some(refresher) = self.refresher.clone() {
                    tokio::spawn(async move {
                        match refresher.refresh().await {
                            Ok(_) => {}
                            Err(SyncError::Offline) => {
                                tracing::debug!("Offline; history refresh skipped");
                            }
                            Err(e) => tracing::warn!(error = %e, "History refresh failed"),
                        }
                    });
                }
            }
        }

        // Leaving: nothing should stay held
        self.guard = None;
        tracing::debug!("Lifecycle monitor stopped");
    }

    fn set_visibility(&self, next: Visibility) -> bool {
        self.visibility.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        })
    }

    fn acquire_wake_lock(&mut self) -> bool {
        if self.guard.is_some() {
            return false;
        }
        match self.wake_lock.acquire() {
            Ok(Some(guard)) => {
                self.guard = Some(guard);
                true
            }
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(error = %e, "Could not acquire wake lock");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts live guards
    #[derive(Default)]
    struct CountingWakeLock {
        live: Arc<AtomicUsize>,
    }

    struct Held(Arc<AtomicUsize>);

    impl Drop for Held {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl WakeLock for CountingWakeLock {
        fn acquire(&self) -> Result<Option<WakeGuard>> {
            self.live.fetch_add(1, Ordering::SeqCst);
            Ok(Some(WakeGuard::new(Held(self.live.clone()))))
        }
    }

    fn monitor(initial: Visibility, online: bool) -> (LifecycleMonitor, Arc<AtomicUsize>) {
        let lock = CountingWakeLock::default();
        let live = lock.live.clone();
        let monitor = LifecycleMonitor::new(
            initial,
            NetworkStatus::new(online),
            None,
            Box::new(lock),
            None,
        );
        (monitor, live)
    }

    #[test]
    fn test_hidden_releases_and_visible_reacquires() {
        let (mut monitor, live) = monitor(Visibility::Visible, true);
        assert_eq!(live.load(Ordering::SeqCst), 1);

        let actions = monitor.handle(LifecycleEvent::Hidden);
        assert_eq!(actions, vec![LifecycleAction::WakeLockReleased]);
        assert_eq!(live.load(Ordering::SeqCst), 0);
        assert_eq!(monitor.current_visibility(), Visibility::Hidden);

        let actions = monitor.handle(LifecycleEvent::Visible);
        assert_eq!(actions, vec![LifecycleAction::WakeLockAcquired]);
        assert_eq!(live.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_repeated_events_are_ignored() {
        let (mut monitor, _live) = monitor(Visibility::Hidden, false);
        assert!(monitor.handle(LifecycleEvent::Hidden).is_empty());
        assert!(monitor.handle(LifecycleEvent::Offline).is_empty());

        assert_eq!(
            monitor.handle(LifecycleEvent::Online),
            vec![LifecycleAction::MarkedOnline]
        );
        assert!(monitor.handle(LifecycleEvent::Online).is_empty());
        assert_eq!(
            monitor.handle(LifecycleEvent::Offline),
            vec![LifecycleAction::MarkedOffline]
        );
    }

    #[test]
    fn test_visibility_receiver_follows_edges() {
        let (mut monitor, _live) = monitor(Visibility::Visible, true);
        let rx = monitor.visibility();
        monitor.handle(LifecycleEvent::Hidden);
        assert_eq!(*rx.borrow(), Visibility::Hidden);
    }

    #[test]
    fn test_no_wake_lock() {
        let mut monitor = LifecycleMonitor::new(
            Visibility::Visible,
            NetworkStatus::new(true),
            None,
            Box::new(NoWakeLock),
            None,
        );
        assert!(!monitor.holds_wake_lock());
        monitor.handle(LifecycleEvent::Hidden);
        assert!(monitor.handle(LifecycleEvent::Visible).is_empty());
    }
}
