//! Offline-first sync engine.
//!
//! Local mutations are applied to the [`OrderStore`] immediately and recorded
//! as queue entries in the same transaction. A single background worker
//! drains the queue to the [`RemoteStore`] strictly in FIFO order, stopping
//! at the first failure, and merges remote snapshots back into the local
//! store.

use chrono::{DateTime, SubsecRound, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::connectivity::{self, ConnectivityMonitor, ConnectivityState};
use crate::db::{OrderChange, OrderStore, SortDirection};
use crate::error::{SyncError, SyncResult};
use crate::models::{
    is_provisional_id, new_provisional_id, DeadLetter, Order, OperationPayload, OrderDraft,
    OrderRef, OrderStatus, QueuedOperation, StatusChange,
};
use crate::remote::{subscribe_to_all, RemoteStore};

/// Recorded on an update/delete whose target has not been created remotely.
const AWAITING_REMOTE_ID: &str = "awaiting remote id";

/// Why a drain pass did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Offline,
    AlreadyRunning,
}

/// Result of one drain pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    Skipped(SkipReason),
    /// The queue was emptied (as loaded at the start of the pass).
    Completed { synced: usize },
    /// The pass stopped at `queue_id`. `dropped` is set when the entry hit
    /// the retry ceiling and was moved to the dead-letter table.
    Halted {
        synced: usize,
        queue_id: i64,
        error: String,
        dropped: bool,
    },
}

impl DrainOutcome {
    pub fn synced(&self) -> usize {
        match self {
            DrainOutcome::Skipped(_) => 0,
            DrainOutcome::Completed { synced } | DrainOutcome::Halted { synced, .. } => *synced,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_online: bool,
    pub pending_items: u64,
    pub sync_in_flight: bool,
    pub last_sync: Option<DateTime<Utc>>,
    pub dead_letters: usize,
}

/// What pushing one queue entry did on the remote side.
enum Pushed {
    Done,
    /// A provisional order now has a remote id.
    Confirmed { local_id: String, remote_id: String },
    /// The target still has a provisional id; nothing was sent.
    Deferred,
}

/// Clears the in-flight flag when the pass ends, however it ends.
struct InFlightGuard<'a>(&'a AtomicBool);

impl<'a> InFlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Inner {
    store: Arc<dyn OrderStore>,
    remote: Arc<dyn RemoteStore>,
    config: SyncConfig,
    connectivity: ConnectivityMonitor,
    in_flight: AtomicBool,
    pending_tx: watch::Sender<u64>,
    next_order_number: AtomicI64,
    last_sync: Mutex<Option<DateTime<Utc>>>,
    /// Ids whose delete the remote has acknowledged. A snapshot fetched
    /// before that point may still list them.
    deleted_remotely: Mutex<HashSet<String>>,
    wake: Notify,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the sync engine. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn OrderStore>,
        remote: Arc<dyn RemoteStore>,
        config: SyncConfig,
        initial: ConnectivityState,
    ) -> SyncResult<Self> {
        let pending = store.pending_count()?;
        let next_number = store.max_order_number()?.saturating_add(1);
        let (pending_tx, _) = watch::channel(pending);

        info!(pending, next_number, state = %initial, "Sync engine ready");

        Ok(Self {
            inner: Arc::new(Inner {
                store,
                remote,
                config,
                connectivity: ConnectivityMonitor::new(initial),
                in_flight: AtomicBool::new(false),
                pending_tx,
                next_order_number: AtomicI64::new(next_number),
                last_sync: Mutex::new(None),
                deleted_remotely: Mutex::new(HashSet::new()),
                wake: Notify::new(),
                shutdown: CancellationToken::new(),
                worker: Mutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    // -----------------------------------------------------------------------
    // Local mutations
    // -----------------------------------------------------------------------

    /// Store a new order under a provisional id and queue its remote create.
    /// Returns the provisional id.
    pub fn record_local_create(&self, draft: OrderDraft) -> SyncResult<String> {
        let now = now_millis();
        let id = new_provisional_id(now);
        let order_number = self.inner.next_order_number.fetch_add(1, Ordering::SeqCst);
        let order = draft.into_order(id.clone(), order_number, now);

        if let Err(e) = self.inner.store.commit_mutation(
            OrderChange::Put(&order),
            &OperationPayload::Create(order.clone()),
            now,
        ) {
            // Hand the number back unless another create already took the next one.
            let _ = self.inner.next_order_number.compare_exchange(
                order_number.saturating_add(1),
                order_number,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
            return Err(e);
        }
        info!(order_id = %id, order_number, total = order.total, "Order recorded locally");

        self.after_local_mutation()?;
        Ok(id)
    }

    /// Move an order forward in the kitchen workflow. Re-applying the current
    /// status queues nothing.
    pub fn record_local_status_change(&self, order_id: &str, status: OrderStatus) -> SyncResult<()> {
        let mut order = self
            .inner
            .store
            .get_order(order_id)?
            .ok_or_else(|| SyncError::NotFound(order_id.to_string()))?;

        if order.status == status {
            debug!(order_id, %status, "Status unchanged; nothing to queue");
            return Ok(());
        }
        if !order.status.can_advance_to(status) {
            return Err(SyncError::InvalidTransition {
                from: order.status,
                to: status,
            });
        }

        order.status = status;
        self.inner.store.commit_mutation(
            OrderChange::Put(&order),
            &OperationPayload::Update(StatusChange {
                id: order_id.to_string(),
                status,
            }),
            now_millis(),
        )?;
        info!(order_id, %status, "Order status changed locally");

        self.after_local_mutation()
    }

    pub fn record_local_delete(&self, order_id: &str) -> SyncResult<()> {
        if self.inner.store.get_order(order_id)?.is_none() {
            return Err(SyncError::NotFound(order_id.to_string()));
        }
        self.inner.store.commit_mutation(
            OrderChange::Delete(order_id),
            &OperationPayload::Delete(OrderRef {
                id: order_id.to_string(),
            }),
            now_millis(),
        )?;
        info!(order_id, "Order deleted locally");

        self.after_local_mutation()
    }

    fn after_local_mutation(&self) -> SyncResult<()> {
        self.refresh_pending()?;
        if self.inner.connectivity.is_online() {
            self.inner.wake.notify_one();
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Every local order, newest first.
    pub fn get_all_orders_from_local(&self) -> SyncResult<Vec<Order>> {
        self.inner.store.list_orders(SortDirection::Descending)
    }

    pub fn get_order(&self, order_id: &str) -> SyncResult<Option<Order>> {
        self.inner.store.get_order(order_id)
    }

    pub fn pending_operations(&self) -> SyncResult<Vec<QueuedOperation>> {
        self.inner.store.list_queue()
    }

    pub fn dead_letters(&self) -> SyncResult<Vec<DeadLetter>> {
        self.inner.store.list_dead_letters()
    }

    pub fn sync_status(&self) -> SyncResult<SyncStatus> {
        Ok(SyncStatus {
            is_online: self.inner.connectivity.is_online(),
            pending_items: self.inner.store.pending_count()?,
            sync_in_flight: self.inner.in_flight.load(Ordering::Acquire),
            last_sync: *self.inner.last_sync.lock()?,
            dead_letters: self.inner.store.list_dead_letters()?.len(),
        })
    }

    // -----------------------------------------------------------------------
    // Observers
    // -----------------------------------------------------------------------

    /// Current number of queued operations, updated after every change.
    /// Dropping the receiver unsubscribes.
    pub fn on_pending_count_change(&self) -> watch::Receiver<u64> {
        self.inner.pending_tx.subscribe()
    }

    pub fn on_connectivity_change(&self) -> watch::Receiver<ConnectivityState> {
        self.inner.connectivity.subscribe()
    }

    pub fn connectivity(&self) -> ConnectivityState {
        self.inner.connectivity.state()
    }

    fn refresh_pending(&self) -> SyncResult<u64> {
        let count = self.inner.store.pending_count()?;
        self.inner.pending_tx.send_if_modified(|current| {
            if *current == count {
                false
            } else {
                *current = count;
                true
            }
        });
        Ok(count)
    }

    // -----------------------------------------------------------------------
    // Connectivity
    // -----------------------------------------------------------------------

    /// Feed a network event. A transition to online makes the background
    /// worker drain the queue; repeated events are ignored.
    pub fn on_network_event(&self, state: ConnectivityState) {
        if self.inner.connectivity.transition(state) && state.is_online() {
            info!("Network restored; resuming queued sync");
        }
    }

    // -----------------------------------------------------------------------
    // Draining
    // -----------------------------------------------------------------------

    /// Push an explicit drain pass. Fails with [`SyncError::Offline`] when
    /// disconnected.
    pub async fn force_sync_now(&self) -> SyncResult<DrainOutcome> {
        if !self.inner.connectivity.is_online() {
            return Err(SyncError::Offline);
        }
        self.drain_queue().await
    }

    /// Run one drain pass: push queued operations in FIFO order and stop at
    /// the first failure. Remote failures are recorded on the entry, not
    /// returned; an `Err` means the local store itself failed.
    pub async fn drain_queue(&self) -> SyncResult<DrainOutcome> {
        if !self.inner.connectivity.is_online() {
            return Ok(DrainOutcome::Skipped(SkipReason::Offline));
        }
        let Some(_guard) = InFlightGuard::acquire(&self.inner.in_flight) else {
            debug!("Drain already running; skipping");
            return Ok(DrainOutcome::Skipped(SkipReason::AlreadyRunning));
        };

        let mut queue = self.inner.store.list_queue()?;
        if queue.is_empty() {
            self.mark_synced()?;
            return Ok(DrainOutcome::Completed { synced: 0 });
        }
        debug!(pending = queue.len(), "Drain pass started");

        let mut synced = 0;
        for index in 0..queue.len() {
            let queue_id = queue[index].id;
            let pushed = self.push(&queue[index]).await;

            let failure = match pushed {
                Ok(Pushed::Done) => {
                    if let OperationPayload::Delete(target) = &queue[index].payload {
                        self.inner.deleted_remotely.lock()?.insert(target.id.clone());
                    }
                    None
                }
                Ok(Pushed::Confirmed {
                    local_id,
                    remote_id,
                }) => {
                    self.inner.store.rewrite_order_id(&local_id, &remote_id)?;
                    for later in queue.iter_mut().skip(index + 1) {
                        if later.payload.order_id() == local_id {
                            later.payload.set_order_id(&remote_id);
                        }
                    }
                    info!(local_id = %local_id, remote_id = %remote_id, "Order confirmed by remote");
                    None
                }
                Ok(Pushed::Deferred) => Some(AWAITING_REMOTE_ID.to_string()),
                // Whatever the remote returned counts against the entry.
                Err(e) => Some(e.to_string()),
            };

            match failure {
                None => {
                    self.inner.store.delete_queue_entry(queue_id)?;
                    self.refresh_pending()?;
                    synced += 1;
                }
                Some(message) => {
                    let dropped = self.record_failure(&queue[index], &message)?;
                    info!(synced, queue_id, "Drain pass halted");
                    return Ok(DrainOutcome::Halted {
                        synced,
                        queue_id,
                        error: message,
                        dropped,
                    });
                }
            }
        }

        self.mark_synced()?;
        if synced > 0 {
            info!("Sync cycle complete: {synced} items synced");
        }
        Ok(DrainOutcome::Completed { synced })
    }

    async fn push(&self, op: &QueuedOperation) -> SyncResult<Pushed> {
        let remote = &self.inner.remote;
        match &op.payload {
            OperationPayload::Create(order) if order.is_provisional() => {
                let remote_id = remote.create_order(order).await?;
                Ok(Pushed::Confirmed {
                    local_id: order.id.clone(),
                    remote_id,
                })
            }
            OperationPayload::Create(order) => {
                remote.upsert_order(order).await?;
                Ok(Pushed::Done)
            }
            OperationPayload::Update(change) => {
                if is_provisional_id(&change.id) {
                    return Ok(Pushed::Deferred);
                }
                remote.update_order_status(&change.id, change.status).await?;
                Ok(Pushed::Done)
            }
            OperationPayload::Delete(target) => {
                if is_provisional_id(&target.id) {
                    return Ok(Pushed::Deferred);
                }
                remote.delete_order(&target.id).await?;
                Ok(Pushed::Done)
            }
        }
    }

    /// Bump the entry's retry count; dead-letter it once the ceiling is
    /// reached. Returns whether it was dropped.
    fn record_failure(&self, op: &QueuedOperation, message: &str) -> SyncResult<bool> {
        let store = &self.inner.store;
        let retry_count = store.record_queue_failure(op.id, message)?;
        let order_id = op.payload.order_id();

        if retry_count < self.inner.config.max_retries {
            warn!(
                queue_id = op.id,
                order_id,
                operation = %op.operation(),
                retry_count,
                "Sync failed, will retry: {message}"
            );
            return Ok(false);
        }

        store.dead_letter(op.id, Utc::now())?;
        self.refresh_pending()?;
        error!(
            queue_id = op.id,
            order_id,
            operation = %op.operation(),
            retry_count,
            "Dropping operation after exhausting retries: {message}"
        );
        Ok(true)
    }

    fn mark_synced(&self) -> SyncResult<()> {
        *self.inner.last_sync.lock()? = Some(Utc::now());
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Remote merge
    // -----------------------------------------------------------------------

    /// Upsert a remote snapshot into the local store (last write wins).
    /// Orders carrying a provisional id are skipped, and local provisional
    /// orders are never touched. Orders deleted locally (delete still queued
    /// or already acknowledged) are not brought back. Returns how many
    /// orders were written.
    pub fn merge_remote_snapshot(&self, remote_orders: &[Order]) -> SyncResult<usize> {
        let pending_deletes = self.inner.store.pending_delete_ids()?;
        let deleted_remotely = self.inner.deleted_remotely.lock()?.clone();

        let mut merged = 0;
        let mut max_number = 0;
        for order in remote_orders {
            max_number = max_number.max(order.order_number);
            if order.is_provisional() {
                debug!(order_id = %order.id, "Skipping provisional order in remote snapshot");
                continue;
            }
            if pending_deletes.contains(&order.id) || deleted_remotely.contains(&order.id) {
                debug!(order_id = %order.id, "Skipping locally deleted order in remote snapshot");
                continue;
            }
            self.inner.store.put_order(order)?;
            merged += 1;
        }
        self.inner
            .next_order_number
            .fetch_max(max_number.saturating_add(1), Ordering::SeqCst);
        if merged > 0 {
            debug!(merged, "Remote snapshot merged");
        }
        Ok(merged)
    }

    // -----------------------------------------------------------------------
    // Background worker
    // -----------------------------------------------------------------------

    /// Spawn the background worker. Must be called inside a tokio runtime.
    /// Calling it again while the worker runs, or after shutdown, does
    /// nothing.
    pub fn start(&self) -> SyncResult<()> {
        if self.inner.shutdown.is_cancelled() {
            warn!("Sync engine already shut down; not starting worker");
            return Ok(());
        }
        let mut worker = self.inner.worker.lock()?;
        if worker.is_some() {
            return Ok(());
        }
        let engine = self.clone();
        *worker = Some(tokio::spawn(async move { engine.run_worker().await }));
        Ok(())
    }

    /// Spawn a probe that feeds remote reachability into
    /// [`SyncEngine::on_network_event`] until shutdown.
    pub fn spawn_health_probe(&self) -> JoinHandle<()> {
        let engine = self.clone();
        connectivity::spawn_health_probe(
            self.inner.remote.clone(),
            self.inner.config.probe_interval,
            self.inner.shutdown.child_token(),
            move |state| engine.on_network_event(state),
        )
    }

    /// Stop the worker. A drain pass already under way finishes first.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let handle = self.inner.worker.lock().ok().and_then(|mut worker| worker.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Sync worker ended abnormally: {e}");
            }
        }
        info!("Sync engine stopped");
    }

    async fn run_worker(self) {
        let config = &self.inner.config;
        info!(
            poll_secs = config.poll_interval.as_secs_f64(),
            snapshot_secs = config.snapshot_interval.as_secs_f64(),
            "Sync worker started"
        );

        let mut connectivity = self.inner.connectivity.subscribe();
        let (subscription, mut snapshots) =
            subscribe_to_all(self.inner.remote.clone(), config.snapshot_interval);
        let mut ticker = tokio::time::interval(config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.inner.shutdown.cancelled() => break,
                changed = connectivity.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *connectivity.borrow_and_update();
                    if !state.is_online() {
                        info!("Network offline; deferring remote sync and keeping queue pending");
                        continue;
                    }
                }
                Some(snapshot) = snapshots.recv() => {
                    if let Err(e) = self.merge_remote_snapshot(&snapshot) {
                        error!("Failed to merge remote snapshot: {e}");
                    }
                    continue;
                }
                _ = self.inner.wake.notified() => {}
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.drain_queue().await {
                error!("Drain pass failed: {e}");
            }
        }

        subscription.unsubscribe();
        info!("Sync worker stopped");
    }
}

/// Timestamps are kept at millisecond precision so the stored text form
/// round-trips exactly.
fn now_millis() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}
