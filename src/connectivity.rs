//! Online/offline state machine.
//!
//! The monitor only records state and fans changes out over a watch channel;
//! reacting to a transition (draining the queue) is the engine's job.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::remote::RemoteStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
    Online,
    Offline,
}

impl ConnectivityState {
    pub fn is_online(&self) -> bool {
        matches!(self, ConnectivityState::Online)
    }

    pub fn from_reachable(reachable: bool) -> Self {
        if reachable {
            ConnectivityState::Online
        } else {
            ConnectivityState::Offline
        }
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectivityState::Online => "online",
            ConnectivityState::Offline => "offline",
        })
    }
}

/// Edge-triggered connectivity tracker.
#[derive(Debug)]
pub struct ConnectivityMonitor {
    tx: watch::Sender<ConnectivityState>,
}

impl ConnectivityMonitor {
    pub fn new(initial: ConnectivityState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn state(&self) -> ConnectivityState {
        *self.tx.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.state().is_online()
    }

    /// Apply a network event. Returns `true` when the state actually
    /// changed; repeated events for the current state are ignored and wake
    /// no observers.
    pub fn transition(&self, next: ConnectivityState) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            info!(state = %next, "Connectivity changed");
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.tx.subscribe()
    }
}

/// Periodically ask the remote store whether it is reachable and feed the
/// answer to `on_event`. Runs until `cancel` fires.
pub fn spawn_health_probe<F>(
    remote: Arc<dyn RemoteStore>,
    interval: Duration,
    cancel: CancellationToken,
    on_event: F,
) -> tokio::task::JoinHandle<()>
where
    F: Fn(ConnectivityState) + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let reachable = remote.health_check().await;
            debug!(reachable, "Health probe");
            on_event(ConnectivityState::from_reachable(reachable));
        }
        debug!("Health probe stopped");
    })
}
