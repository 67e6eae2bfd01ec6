//! Offline-first order synchronization for a point-of-sale terminal.
//!
//! Orders are written to a local SQLite store first and every mutation is
//! queued. [`SyncEngine`] drains that queue to the remote order store in
//! strict FIFO order whenever the terminal is online, rewrites provisional
//! ids once the remote confirms a create, and merges remote snapshots back
//! into the local store.

use anyhow::Context;
use std::sync::Arc;
use tracing::{info, warn};

mod api;
mod config;
mod connectivity;
mod db;
mod diagnostics;
mod error;
mod models;
mod remote;
mod sync;

pub use api::{normalize_base_url, HttpRemoteStore};
pub use config::SyncConfig;
pub use connectivity::{ConnectivityMonitor, ConnectivityState};
pub use db::{OrderChange, OrderStore, SortDirection, SqliteStore};
pub use diagnostics::{init_logging, prune_old_logs};
pub use error::{SyncError, SyncResult};
pub use models::{
    is_provisional_id, AddOns, DeadLetter, MenuItem, OperationKind, OperationPayload, Order,
    OrderDraft, OrderItem, OrderModifiers, OrderRef, OrderStatus, OrderTotals, QueuedOperation,
    Size, StatusChange, SugarLevel, LOCAL_ID_PREFIX,
};
pub use remote::{subscribe_to_all, MemoryRemoteStore, RemoteCall, RemoteStore, Subscription};
pub use sync::{DrainOutcome, SkipReason, SyncEngine, SyncStatus};

/// Entry point of the `pos-order-sync` binary: configure from the
/// environment, start the engine and the connectivity probe, and run until
/// Ctrl-C.
pub async fn run() -> anyhow::Result<()> {
    let config = SyncConfig::from_env().context("invalid configuration")?;

    let _log_guard = init_logging(&config.log_dir()).context("failed to initialize logging")?;
    info!("Starting POS order sync v{}", env!("CARGO_PKG_VERSION"));

    let remote_url = config
        .remote_url
        .clone()
        .with_context(|| format!("{} must be set", config::ENV_REMOTE_URL))?;

    let store = SqliteStore::init(config.data_dir())
        .with_context(|| format!("failed to open store in {}", config.data_dir().display()))?;
    let remote = HttpRemoteStore::new(&remote_url, config.api_key.clone(), config.request_timeout)
        .context("failed to build remote client")?;
    info!("Remote order store: {}", remote.base_url());

    let remote: Arc<dyn RemoteStore> = Arc::new(remote);
    let initial = ConnectivityState::from_reachable(remote.health_check().await);
    let engine = SyncEngine::new(Arc::new(store), remote, config, initial)
        .context("failed to start sync engine")?;

    engine.start()?;
    let probe = engine.spawn_health_probe();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    engine.shutdown().await;
    if let Err(e) = probe.await {
        warn!("Health probe ended abnormally: {e}");
    }

    let status = engine.sync_status()?;
    info!(
        pending = status.pending_items,
        dead_letters = status.dead_letters,
        "Exiting"
    );
    Ok(())
}
