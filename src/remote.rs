//! Remote authoritative store abstraction.
//!
//! The engine only talks to the remote side through [`RemoteStore`]. The
//! HTTP implementation lives in `api`; [`MemoryRemoteStore`] keeps
//! everything in process and records every call, which makes it the test
//! double for the engine.

use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};
use crate::models::{Order, OrderStatus};

/// Remote operations used by the engine. Every call may fail with
/// [`SyncError::Transport`].
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Create `order` (its local id is ignored) and return the id the
    /// remote store assigned.
    async fn create_order(&self, order: &Order) -> SyncResult<String>;

    /// Write `order` under its own id, replacing whatever is there.
    async fn upsert_order(&self, order: &Order) -> SyncResult<()>;

    async fn update_order_status(&self, id: &str, status: OrderStatus) -> SyncResult<()>;

    async fn delete_order(&self, id: &str) -> SyncResult<()>;

    /// Current full order list.
    async fn fetch_orders(&self) -> SyncResult<Vec<Order>>;

    /// Lightweight reachability check.
    async fn health_check(&self) -> bool;
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Handle for a running snapshot subscription. Dropping it (or calling
/// [`Subscription::unsubscribe`]) stops the feed.
#[derive(Debug)]
pub struct Subscription {
    token: CancellationToken,
}

impl Subscription {
    pub fn unsubscribe(self) {
        self.token.cancel();
    }

    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Push the remote store's full order list into a channel every `interval`
/// (the first snapshot is fetched immediately). Failed fetches are logged
/// and skipped; the feed keeps going until unsubscribed or the receiver is
/// dropped.
pub fn subscribe_to_all(
    remote: Arc<dyn RemoteStore>,
    interval: Duration,
) -> (Subscription, mpsc::Receiver<Vec<Order>>) {
    let (tx, rx) = mpsc::channel(8);
    let token = CancellationToken::new();
    let child = token.clone();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = child.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match remote.fetch_orders().await {
                Ok(orders) => {
                    debug!(count = orders.len(), "Remote snapshot received");
                    if tx.send(orders).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!("Remote snapshot fetch failed: {e}"),
            }
        }
        debug!("Remote snapshot subscription stopped");
    });

    (Subscription { token }, rx)
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

/// A call received by [`MemoryRemoteStore`], in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCall {
    Create { local_id: String, remote_id: String },
    Upsert { id: String },
    UpdateStatus { id: String, status: OrderStatus },
    Delete { id: String },
    Fetch,
}

#[derive(Default)]
struct MemoryState {
    orders: BTreeMap<String, Order>,
    calls: Vec<RemoteCall>,
    scripted_failures: VecDeque<String>,
    fail_all: Option<String>,
    reachable: bool,
}

/// In-process remote store with failure injection.
pub struct MemoryRemoteStore {
    state: Mutex<MemoryState>,
    next_id: AtomicU64,
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                reachable: true,
                ..MemoryState::default()
            }),
            next_id: AtomicU64::new(1),
        }
    }

    /// Fail the next mutating call with `message`. Queued failures are
    /// consumed in order.
    pub fn fail_next(&self, message: impl Into<String>) {
        if let Ok(mut state) = self.state.lock() {
            state.scripted_failures.push_back(message.into());
        }
    }

    /// Fail every mutating call until cleared with `None`.
    pub fn fail_all(&self, message: Option<String>) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_all = message;
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.reachable = reachable;
        }
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.state
            .lock()
            .map(|state| state.calls.clone())
            .unwrap_or_default()
    }

    pub fn orders(&self) -> Vec<Order> {
        self.state
            .lock()
            .map(|state| state.orders.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn order(&self, id: &str) -> Option<Order> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.orders.get(id).cloned())
    }

    /// Place an order directly on the remote side, as another terminal would.
    pub fn insert_order(&self, order: Order) {
        if let Ok(mut state) = self.state.lock() {
            state.orders.insert(order.id.clone(), order);
        }
    }

    fn check_failure(state: &mut MemoryState) -> SyncResult<()> {
        if let Some(message) = state.scripted_failures.pop_front() {
            return Err(SyncError::transport(message));
        }
        if let Some(message) = &state.fail_all {
            return Err(SyncError::transport(message.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn create_order(&self, order: &Order) -> SyncResult<String> {
        let mut state = self.state.lock()?;
        Self::check_failure(&mut state)?;
        let remote_id = format!("-Nremote{:06}", self.next_id.fetch_add(1, Ordering::SeqCst));
        state
            .orders
            .insert(remote_id.clone(), order.with_id(remote_id.clone()));
        state.calls.push(RemoteCall::Create {
            local_id: order.id.clone(),
            remote_id: remote_id.clone(),
        });
        Ok(remote_id)
    }

    async fn upsert_order(&self, order: &Order) -> SyncResult<()> {
        let mut state = self.state.lock()?;
        Self::check_failure(&mut state)?;
        state.orders.insert(order.id.clone(), order.clone());
        state.calls.push(RemoteCall::Upsert {
            id: order.id.clone(),
        });
        Ok(())
    }

    async fn update_order_status(&self, id: &str, status: OrderStatus) -> SyncResult<()> {
        let mut state = self.state.lock()?;
        Self::check_failure(&mut state)?;
        if let Some(order) = state.orders.get_mut(id) {
            order.status = status;
        }
        state.calls.push(RemoteCall::UpdateStatus {
            id: id.to_string(),
            status,
        });
        Ok(())
    }

    async fn delete_order(&self, id: &str) -> SyncResult<()> {
        let mut state = self.state.lock()?;
        Self::check_failure(&mut state)?;
        state.orders.remove(id);
        state.calls.push(RemoteCall::Delete { id: id.to_string() });
        Ok(())
    }

    async fn fetch_orders(&self) -> SyncResult<Vec<Order>> {
        let mut state = self.state.lock()?;
        if !state.reachable {
            return Err(SyncError::transport("remote unreachable"));
        }
        state.calls.push(RemoteCall::Fetch);
        Ok(state.orders.values().cloned().collect())
    }

    async fn health_check(&self) -> bool {
        self.state.lock().map(|state| state.reachable).unwrap_or(false)
    }
}
