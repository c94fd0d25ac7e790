//! Connectivity state
//!
//! [`NetworkStatus`] is the single shared online/offline flag. The
//! [`ConnectivityProbe`] turns periodic reachability checks into edge
//! events, so downstream consumers only ever see transitions.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use crate::lifecycle::LifecycleEvent;
use crate::remote::LocationStore;

/// Shared online/offline flag.
#[derive(Clone, Debug)]
pub struct NetworkStatus {
    tx: Arc<watch::Sender<bool>>,
}

impl NetworkStatus {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Update the flag; returns true when this was an actual transition
    pub fn set_online(&self, online: bool) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Periodically checks reachability and reports edges as lifecycle events.
pub struct ConnectivityProbe {
    store: Arc<dyn LocationStore>,
    interval: Duration,
    events: mpsc::UnboundedSender<LifecycleEvent>,
}

impl ConnectivityProbe {
    pub fn new(
        store: Arc<dyn LocationStore>,
        interval: Duration,
        events: mpsc::UnboundedSender<LifecycleEvent>,
    ) -> Self {
        Self {
            store,
            interval,
            events,
        }
    }

    /// Probe until the event receiver goes away or shutdown is signalled
    pub async fn run(self, initial: bool, mut shutdown: watch::Receiver<bool>) {
        let mut last = initial;
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let online = self.store.is_reachable().await;
            if online == last {
                continue;
            }
            last = online;

            tracing::info!(online, "Connectivity changed");
            let event = if online {
                LifecycleEvent::Online
            } else {
                LifecycleEvent::Offline
            };
            if self.events.send(event).is_err() {
                break;
            }
        }

        tracing::debug!("Connectivity probe stopped");
    }
}
