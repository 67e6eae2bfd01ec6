//! Local durable store for orders and the sync queue.
//!
//! Uses rusqlite with WAL mode. Every public call holds the connection lock
//! for its whole duration, so each call is atomic with respect to the others;
//! calls touching more than one row run inside an immediate transaction.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

use crate::error::{SyncError, SyncResult};
use crate::models::{
    format_timestamp, parse_timestamp, DeadLetter, Order, OperationKind, OperationPayload,
    OrderItem, QueuedOperation, ORDERS_TABLE,
};

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 2;

const DB_FILE_NAME: &str = "orders.db";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// Change applied to the orders table together with a queue append.
#[derive(Debug, Clone, Copy)]
pub enum OrderChange<'a> {
    Put(&'a Order),
    Delete(&'a str),
}

/// Persistence seam used by the sync engine.
///
/// Implementations must make every call atomic: a reader never observes a
/// half-applied call.
pub trait OrderStore: Send + Sync {
    fn get_order(&self, id: &str) -> SyncResult<Option<Order>>;

    /// Insert or overwrite by id.
    fn put_order(&self, order: &Order) -> SyncResult<()>;

    /// Returns whether a row was removed.
    fn delete_order(&self, id: &str) -> SyncResult<bool>;

    fn list_orders(&self, direction: SortDirection) -> SyncResult<Vec<Order>>;

    /// Highest order number seen locally, 0 when empty.
    fn max_order_number(&self) -> SyncResult<i64>;

    /// Apply a local order change and append its queue entry as one unit.
    /// The stored enqueue time is clamped to the newest queued entry, so a
    /// wall clock stepping backwards cannot reorder the queue. Returns the
    /// new queue entry id.
    fn commit_mutation(
        &self,
        change: OrderChange<'_>,
        payload: &OperationPayload,
        enqueued_at: DateTime<Utc>,
    ) -> SyncResult<i64>;

    /// Queue entries in FIFO order.
    fn list_queue(&self) -> SyncResult<Vec<QueuedOperation>>;

    fn delete_queue_entry(&self, queue_id: i64) -> SyncResult<()>;

    /// Bump the retry counter and remember the error. Returns the new count.
    fn record_queue_failure(&self, queue_id: i64, error: &str) -> SyncResult<u32>;

    /// Move a queue entry to the dead-letter table.
    fn dead_letter(&self, queue_id: i64, dropped_at: DateTime<Utc>) -> SyncResult<()>;

    fn list_dead_letters(&self) -> SyncResult<Vec<DeadLetter>>;

    fn pending_count(&self) -> SyncResult<u64>;

    /// Ids of orders with a queued `delete` not yet confirmed remotely.
    fn pending_delete_ids(&self) -> SyncResult<HashSet<String>>;

    /// Move the local record `old_id` (if it still exists) to `new_id`
    /// keeping its current content, and point queued entries at the new id.
    /// Returns how many queue entries were rewritten.
    fn rewrite_order_id(&self, old_id: &str, new_id: &str) -> SyncResult<usize>;
}

// ---------------------------------------------------------------------------
// SQLite implementation
// ---------------------------------------------------------------------------

pub struct SqliteStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl SqliteStore {
    /// Open (or create) the database at `{data_dir}/orders.db` and run any
    /// pending migrations.
    pub fn init(data_dir: &Path) -> SyncResult<Self> {
        fs::create_dir_all(data_dir).map_err(|e| {
            SyncError::Config(format!(
                "cannot create data dir {}: {e}",
                data_dir.display()
            ))
        })?;

        let db_path = data_dir.join(DB_FILE_NAME);
        info!("Opening database at {}", db_path.display());

        let conn = open_and_configure(&db_path)?;
        run_migrations(&conn)?;

        info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

        Ok(Self {
            conn: Mutex::new(conn),
            db_path,
        })
    }

    /// Throwaway database for tests and demos.
    pub fn open_in_memory() -> SyncResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            db_path: PathBuf::from(":memory:"),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> SyncResult<Connection> {
    let conn = Connection::open(path)?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> SyncResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    if current >= CURRENT_SCHEMA_VERSION {
        debug!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Migration v1: orders and the outbound operation queue.
fn migrate_v1(conn: &Connection) -> SyncResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS orders (
            id TEXT PRIMARY KEY,
            order_number INTEGER NOT NULL,
            items TEXT NOT NULL DEFAULT '[]',
            subtotal REAL NOT NULL DEFAULT 0,
            discount_percentage REAL NOT NULL DEFAULT 0,
            discount_amount REAL NOT NULL DEFAULT 0,
            gst REAL NOT NULL DEFAULT 0,
            total REAL NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'new'
                CHECK (status IN ('new', 'preparing', 'ready')),
            timestamp TEXT NOT NULL,
            payment_method TEXT NOT NULL DEFAULT '',
            updated_at TEXT DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_orders_timestamp ON orders(timestamp);

        CREATE TABLE IF NOT EXISTS sync_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            operation TEXT NOT NULL CHECK (operation IN ('create', 'update', 'delete')),
            table_name TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            enqueued_at TEXT NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            updated_at TEXT DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_sync_queue_order ON sync_queue(enqueued_at, id);
        CREATE INDEX IF NOT EXISTS idx_sync_queue_entity ON sync_queue(entity_id);

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )?;
    info!("Applied migration v1");
    Ok(())
}

/// Migration v2: keep operations dropped after exhausting their retries.
fn migrate_v2(conn: &Connection) -> SyncResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS sync_dead_letters (
            id INTEGER PRIMARY KEY,
            operation TEXT NOT NULL,
            table_name TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            enqueued_at TEXT NOT NULL,
            retry_count INTEGER NOT NULL,
            last_error TEXT,
            dropped_at TEXT NOT NULL
        );

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )?;
    info!("Applied migration v2");
    Ok(())
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

const ORDER_COLUMNS: &str = "id, order_number, items, subtotal, discount_percentage, \
     discount_amount, gst, total, status, timestamp, payment_method";

const QUEUE_COLUMNS: &str =
    "id, operation, table_name, payload, enqueued_at, retry_count, last_error";

struct OrderRow {
    id: String,
    order_number: i64,
    items: String,
    subtotal: f64,
    discount_percentage: f64,
    discount_amount: f64,
    gst: f64,
    total: f64,
    status: String,
    timestamp: String,
    payment_method: String,
}

impl OrderRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            order_number: row.get(1)?,
            items: row.get(2)?,
            subtotal: row.get(3)?,
            discount_percentage: row.get(4)?,
            discount_amount: row.get(5)?,
            gst: row.get(6)?,
            total: row.get(7)?,
            status: row.get(8)?,
            timestamp: row.get(9)?,
            payment_method: row.get(10)?,
        })
    }

    fn into_order(self) -> SyncResult<Order> {
        let items: Vec<OrderItem> = serde_json::from_str(&self.items)?;
        Ok(Order {
            id: self.id,
            order_number: self.order_number,
            items,
            subtotal: self.subtotal,
            discount_percentage: self.discount_percentage,
            discount_amount: self.discount_amount,
            gst: self.gst,
            total: self.total,
            status: self.status.parse()?,
            timestamp: parse_timestamp(&self.timestamp)?,
            payment_method: self.payment_method,
        })
    }
}

struct QueueRow {
    id: i64,
    operation: String,
    table_name: String,
    payload: String,
    enqueued_at: String,
    retry_count: i64,
    last_error: Option<String>,
}

impl QueueRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            operation: row.get(1)?,
            table_name: row.get(2)?,
            payload: row.get(3)?,
            enqueued_at: row.get(4)?,
            retry_count: row.get(5)?,
            last_error: row.get(6)?,
        })
    }

    fn into_operation(self) -> SyncResult<QueuedOperation> {
        let kind: OperationKind = self.operation.parse()?;
        Ok(QueuedOperation {
            id: self.id,
            table: self.table_name,
            payload: OperationPayload::from_json(kind, &self.payload)?,
            timestamp: parse_timestamp(&self.enqueued_at)?,
            retry_count: u32::try_from(self.retry_count).unwrap_or(0),
            last_error: self.last_error,
        })
    }
}

fn upsert_order(conn: &Connection, order: &Order) -> SyncResult<()> {
    let items = serde_json::to_string(&order.items)?;
    conn.execute(
        "INSERT INTO orders (
            id, order_number, items, subtotal, discount_percentage,
            discount_amount, gst, total, status, timestamp, payment_method, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, datetime('now'))
        ON CONFLICT(id) DO UPDATE SET
            order_number = excluded.order_number,
            items = excluded.items,
            subtotal = excluded.subtotal,
            discount_percentage = excluded.discount_percentage,
            discount_amount = excluded.discount_amount,
            gst = excluded.gst,
            total = excluded.total,
            status = excluded.status,
            timestamp = excluded.timestamp,
            payment_method = excluded.payment_method,
            updated_at = excluded.updated_at",
        params![
            order.id,
            order.order_number,
            items,
            order.subtotal,
            order.discount_percentage,
            order.discount_amount,
            order.gst,
            order.total,
            order.status.as_str(),
            format_timestamp(&order.timestamp),
            order.payment_method,
        ],
    )?;
    Ok(())
}

fn insert_queue_row(
    conn: &Connection,
    payload: &OperationPayload,
    enqueued_at: DateTime<Utc>,
) -> SyncResult<i64> {
    let newest: Option<String> =
        conn.query_row("SELECT MAX(enqueued_at) FROM sync_queue", [], |row| row.get(0))?;
    let enqueued_at = match newest {
        Some(raw) => enqueued_at.max(parse_timestamp(&raw)?),
        None => enqueued_at,
    };
    conn.execute(
        "INSERT INTO sync_queue (operation, table_name, entity_id, payload, enqueued_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            payload.kind().as_str(),
            ORDERS_TABLE,
            payload.order_id(),
            payload.to_json()?,
            format_timestamp(&enqueued_at),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

impl OrderStore for SqliteStore {
    fn get_order(&self, id: &str) -> SyncResult<Option<Order>> {
        let conn = self.conn.lock()?;
        let row = conn
            .query_row(
                &format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = ?1"),
                params![id],
                OrderRow::from_row,
            )
            .optional()?;
        row.map(OrderRow::into_order).transpose()
    }

    fn put_order(&self, order: &Order) -> SyncResult<()> {
        let conn = self.conn.lock()?;
        upsert_order(&conn, order)
    }

    fn delete_order(&self, id: &str) -> SyncResult<bool> {
        let conn = self.conn.lock()?;
        let removed = conn.execute("DELETE FROM orders WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }

    fn list_orders(&self, direction: SortDirection) -> SyncResult<Vec<Order>> {
        let conn = self.conn.lock()?;
        let order_by = match direction {
            SortDirection::Ascending => "timestamp ASC, order_number ASC",
            SortDirection::Descending => "timestamp DESC, order_number DESC",
        };
        let mut stmt =
            conn.prepare(&format!("SELECT {ORDER_COLUMNS} FROM orders ORDER BY {order_by}"))?;
        let rows = stmt
            .query_map([], OrderRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(OrderRow::into_order).collect()
    }

    fn max_order_number(&self) -> SyncResult<i64> {
        let conn = self.conn.lock()?;
        let max = conn.query_row(
            "SELECT COALESCE(MAX(order_number), 0) FROM orders",
            [],
            |row| row.get(0),
        )?;
        Ok(max)
    }

    fn commit_mutation(
        &self,
        change: OrderChange<'_>,
        payload: &OperationPayload,
        enqueued_at: DateTime<Utc>,
    ) -> SyncResult<i64> {
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        match change {
            OrderChange::Put(order) => upsert_order(&tx, order)?,
            OrderChange::Delete(id) => {
                tx.execute("DELETE FROM orders WHERE id = ?1", params![id])?;
            }
        }
        let queue_id = insert_queue_row(&tx, payload, enqueued_at)?;
        tx.commit()?;
        Ok(queue_id)
    }

    fn list_queue(&self) -> SyncResult<Vec<QueuedOperation>> {
        let conn = self.conn.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {QUEUE_COLUMNS} FROM sync_queue ORDER BY enqueued_at ASC, id ASC"
        ))?;
        let rows = stmt
            .query_map([], QueueRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(QueueRow::into_operation).collect()
    }

    fn delete_queue_entry(&self, queue_id: i64) -> SyncResult<()> {
        let conn = self.conn.lock()?;
        conn.execute("DELETE FROM sync_queue WHERE id = ?1", params![queue_id])?;
        Ok(())
    }

    fn record_queue_failure(&self, queue_id: i64, error: &str) -> SyncResult<u32> {
        let conn = self.conn.lock()?;
        let retry_count: Option<i64> = conn
            .query_row(
                "UPDATE sync_queue
                 SET retry_count = retry_count + 1,
                     last_error = ?2,
                     updated_at = datetime('now')
                 WHERE id = ?1
                 RETURNING retry_count",
                params![queue_id, error],
                |row| row.get(0),
            )
            .optional()?;
        let retry_count =
            retry_count.ok_or_else(|| SyncError::NotFound(format!("sync_queue#{queue_id}")))?;
        Ok(u32::try_from(retry_count).unwrap_or(u32::MAX))
    }

    fn dead_letter(&self, queue_id: i64, dropped_at: DateTime<Utc>) -> SyncResult<()> {
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let copied = tx.execute(
            "INSERT OR REPLACE INTO sync_dead_letters (
                id, operation, table_name, entity_id, payload,
                enqueued_at, retry_count, last_error, dropped_at
             )
             SELECT id, operation, table_name, entity_id, payload,
                    enqueued_at, retry_count, last_error, ?2
             FROM sync_queue WHERE id = ?1",
            params![queue_id, format_timestamp(&dropped_at)],
        )?;
        if copied == 0 {
            return Err(SyncError::NotFound(format!("sync_queue#{queue_id}")));
        }
        tx.execute("DELETE FROM sync_queue WHERE id = ?1", params![queue_id])?;
        tx.commit()?;
        Ok(())
    }

    fn list_dead_letters(&self) -> SyncResult<Vec<DeadLetter>> {
        let conn = self.conn.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {QUEUE_COLUMNS}, dropped_at FROM sync_dead_letters ORDER BY dropped_at ASC, id ASC"
        ))?;
        let rows = stmt
            .query_map([], |row| Ok((QueueRow::from_row(row)?, row.get::<_, String>(7)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|(row, dropped_at)| {
                let op = row.into_operation()?;
                Ok(DeadLetter {
                    id: op.id,
                    table: op.table,
                    payload: op.payload,
                    timestamp: op.timestamp,
                    retry_count: op.retry_count,
                    last_error: op.last_error,
                    dropped_at: parse_timestamp(&dropped_at)?,
                })
            })
            .collect()
    }

    fn pending_count(&self) -> SyncResult<u64> {
        let conn = self.conn.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM sync_queue", [], |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    fn pending_delete_ids(&self) -> SyncResult<HashSet<String>> {
        let conn = self.conn.lock()?;
        let mut stmt =
            conn.prepare("SELECT DISTINCT entity_id FROM sync_queue WHERE operation = 'delete'")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<HashSet<String>>>()?;
        Ok(ids)
    }

    fn rewrite_order_id(&self, old_id: &str, new_id: &str) -> SyncResult<usize> {
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        // The local copy is at least as new as anything a snapshot delivered
        // under the confirmed id.
        let moved = tx.execute(
            "UPDATE orders SET id = ?2, updated_at = datetime('now') WHERE id = ?1",
            params![old_id, new_id],
        );
        let moved = match moved {
            Ok(n) => n,
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                tx.execute("DELETE FROM orders WHERE id = ?1", params![new_id])?;
                tx.execute(
                    "UPDATE orders SET id = ?2, updated_at = datetime('now') WHERE id = ?1",
                    params![old_id, new_id],
                )?
            }
            Err(e) => return Err(e.into()),
        };
        if moved == 0 {
            debug!(old_id, "Provisional order no longer stored locally");
        }

        // Later entries for the same order were queued under the provisional
        // id; point them at the confirmed one.
        let rows = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {QUEUE_COLUMNS} FROM sync_queue WHERE entity_id = ?1"
            ))?;
            let rows = stmt
                .query_map(params![old_id], QueueRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        let mut rewritten = 0;
        for row in rows {
            let mut op = row.into_operation()?;
            op.payload.set_order_id(new_id);
            tx.execute(
                "UPDATE sync_queue
                 SET entity_id = ?2, payload = ?3, updated_at = datetime('now')
                 WHERE id = ?1",
                params![op.id, new_id, op.payload.to_json()?],
            )?;
            rewritten += 1;
        }

        tx.commit()?;
        Ok(rewritten)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderDraft, OrderRef, OrderStatus, StatusChange};
    use chrono::{Duration, SubsecRound};

    fn test_store() -> SqliteStore {
        SqliteStore::open_in_memory().expect("open in-memory store")
    }

    /// Helper: list table names in the database.
    fn table_names(store: &SqliteStore) -> Vec<String> {
        let conn = store.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .expect("prepare table list");
        stmt.query_map([], |row| row.get(0))
            .expect("query tables")
            .filter_map(|r| r.ok())
            .collect()
    }

    fn order(id: &str, number: i64, ts: DateTime<Utc>) -> Order {
        OrderDraft::from_subtotal(100.0, 10.0, "cash").into_order(id.to_string(), number, ts)
    }

    fn update(id: &str, status: OrderStatus) -> OperationPayload {
        OperationPayload::Update(StatusChange {
            id: id.to_string(),
            status,
        })
    }

    #[test]
    fn test_migrations_create_tables() {
        let store = test_store();
        let tables = table_names(&store);
        for expected in ["orders", "schema_version", "sync_dead_letters", "sync_queue"] {
            assert!(tables.contains(&expected.to_string()), "missing {expected}");
        }
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let store = test_store();
        let conn = store.conn.lock().unwrap();
        run_migrations(&conn).expect("second run should succeed");
        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .expect("read schema version");
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_wal_mode_on_file_db() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = SqliteStore::init(dir.path()).expect("init file store");
        assert_eq!(store.db_path(), dir.path().join("orders.db"));

        let conn = store.conn.lock().unwrap();
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .expect("read journal_mode");
        assert_eq!(mode.to_lowercase(), "wal", "journal_mode should be WAL");
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().expect("temp dir");
        let now = Utc::now();
        {
            let store = SqliteStore::init(dir.path()).unwrap();
            let o = order("local-1-aaaaaaaaa", 1, now);
            store
                .commit_mutation(OrderChange::Put(&o), &OperationPayload::Create(o.clone()), now)
                .unwrap();
        }
        let reopened = SqliteStore::init(dir.path()).unwrap();
        assert!(reopened.get_order("local-1-aaaaaaaaa").unwrap().is_some());
        assert_eq!(reopened.pending_count().unwrap(), 1);
    }

    #[test]
    fn test_order_put_get_roundtrip_preserves_totals() {
        let store = test_store();
        let o = order("o1", 3, Utc::now());
        store.put_order(&o).unwrap();

        let loaded = store.get_order("o1").unwrap().expect("order stored");
        assert_eq!(loaded.order_number, 3);
        assert_eq!(loaded.total, o.total);
        assert_eq!(loaded.gst, o.gst);
        assert_eq!(loaded.status, OrderStatus::New);
        assert_eq!(
            loaded.timestamp.timestamp_millis(),
            o.timestamp.timestamp_millis()
        );
        assert!(store.get_order("missing").unwrap().is_none());
    }

    #[test]
    fn test_put_overwrites_by_id() {
        let store = test_store();
        let mut o = order("o1", 1, Utc::now());
        store.put_order(&o).unwrap();
        o.status = OrderStatus::Ready;
        store.put_order(&o).unwrap();

        let all = store.list_orders(SortDirection::Ascending).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, OrderStatus::Ready);
    }

    #[test]
    fn test_list_orders_by_timestamp() {
        let store = test_store();
        let base = Utc::now();
        store.put_order(&order("b", 2, base + Duration::seconds(5))).unwrap();
        store.put_order(&order("a", 1, base)).unwrap();
        store.put_order(&order("c", 3, base + Duration::seconds(10))).unwrap();

        let asc: Vec<String> = store
            .list_orders(SortDirection::Ascending)
            .unwrap()
            .into_iter()
            .map(|o| o.id)
            .collect();
        assert_eq!(asc, vec!["a", "b", "c"]);

        let desc: Vec<String> = store
            .list_orders(SortDirection::Descending)
            .unwrap()
            .into_iter()
            .map(|o| o.id)
            .collect();
        assert_eq!(desc, vec!["c", "b", "a"]);
        assert_eq!(store.max_order_number().unwrap(), 3);
    }

    #[test]
    fn test_delete_order_reports_removal() {
        let store = test_store();
        store.put_order(&order("o1", 1, Utc::now())).unwrap();
        assert!(store.delete_order("o1").unwrap());
        assert!(!store.delete_order("o1").unwrap());
    }

    #[test]
    fn test_queue_is_fifo_when_clock_steps_back() {
        let store = test_store();
        let now = Utc::now();
        let o = order("o1", 1, now);
        store
            .commit_mutation(OrderChange::Put(&o), &update("o1", OrderStatus::Preparing), now)
            .unwrap();
        store
            .commit_mutation(OrderChange::Put(&o), &update("o1", OrderStatus::Ready), now)
            .unwrap();
        store
            .commit_mutation(
                OrderChange::Put(&o),
                &update("o1", OrderStatus::New),
                now - Duration::seconds(1),
            )
            .unwrap();

        let statuses: Vec<OrderStatus> = store
            .list_queue()
            .unwrap()
            .into_iter()
            .map(|op| match op.payload {
                OperationPayload::Update(change) => change.status,
                other => panic!("unexpected payload {other:?}"),
            })
            .collect();
        assert_eq!(
            statuses,
            vec![OrderStatus::Preparing, OrderStatus::Ready, OrderStatus::New]
        );
        assert_eq!(store.pending_count().unwrap(), 3);

        let queue = store.list_queue().unwrap();
        assert!(queue.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert_eq!(queue[2].timestamp, now.trunc_subsecs(3));
    }

    #[test]
    fn test_regressed_clock_keeps_update_behind_its_create() {
        let store = test_store();
        let now = Utc::now();
        let o = order("local-1-aaaaaaaaa", 1, now);
        store
            .commit_mutation(OrderChange::Put(&o), &OperationPayload::Create(o.clone()), now)
            .unwrap();
        store
            .commit_mutation(
                OrderChange::Put(&o),
                &update("local-1-aaaaaaaaa", OrderStatus::Ready),
                now - Duration::seconds(2),
            )
            .unwrap();

        let kinds: Vec<OperationKind> =
            store.list_queue().unwrap().iter().map(|op| op.operation()).collect();
        assert_eq!(kinds, vec![OperationKind::Create, OperationKind::Update]);
    }

    #[test]
    fn test_pending_delete_ids() {
        let store = test_store();
        let now = Utc::now();
        store.put_order(&order("-Nr1", 1, now)).unwrap();
        store.put_order(&order("-Nr2", 2, now)).unwrap();
        store
            .commit_mutation(
                OrderChange::Delete("-Nr1"),
                &OperationPayload::Delete(OrderRef { id: "-Nr1".into() }),
                now,
            )
            .unwrap();
        store
            .commit_mutation(
                OrderChange::Put(&order("-Nr2", 2, now)),
                &update("-Nr2", OrderStatus::Ready),
                now,
            )
            .unwrap();

        let ids = store.pending_delete_ids().unwrap();
        assert_eq!(ids.len(), 1);
        assert!(ids.contains("-Nr1"));
    }

    #[test]
    fn test_commit_mutation_delete_removes_order() {
        let store = test_store();
        let now = Utc::now();
        store.put_order(&order("o1", 1, now)).unwrap();
        store
            .commit_mutation(
                OrderChange::Delete("o1"),
                &OperationPayload::Delete(OrderRef { id: "o1".into() }),
                now,
            )
            .unwrap();
        assert!(store.get_order("o1").unwrap().is_none());
        let queue = store.list_queue().unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].table, ORDERS_TABLE);
    }

    #[test]
    fn test_record_failure_counts_up() {
        let store = test_store();
        let now = Utc::now();
        let o = order("o1", 1, now);
        let id = store
            .commit_mutation(OrderChange::Put(&o), &update("o1", OrderStatus::Ready), now)
            .unwrap();

        assert_eq!(store.record_queue_failure(id, "timeout").unwrap(), 1);
        assert_eq!(store.record_queue_failure(id, "HTTP 503").unwrap(), 2);

        let entry = &store.list_queue().unwrap()[0];
        assert_eq!(entry.retry_count, 2);
        assert_eq!(entry.last_error.as_deref(), Some("HTTP 503"));

        assert!(matches!(
            store.record_queue_failure(9999, "x"),
            Err(SyncError::NotFound(_))
        ));
    }

    #[test]
    fn test_dead_letter_moves_entry() {
        let store = test_store();
        let now = Utc::now();
        let o = order("o1", 1, now);
        let id = store
            .commit_mutation(OrderChange::Put(&o), &update("o1", OrderStatus::Ready), now)
            .unwrap();
        store.record_queue_failure(id, "boom").unwrap();
        store.dead_letter(id, now).unwrap();

        assert_eq!(store.pending_count().unwrap(), 0);
        let letters = store.list_dead_letters().unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].id, id);
        assert_eq!(letters[0].retry_count, 1);
        assert_eq!(letters[0].last_error.as_deref(), Some("boom"));
        assert_eq!(letters[0].payload, update("o1", OrderStatus::Ready));
    }

    #[test]
    fn test_rewrite_order_id_replaces_record_and_queue_refs() {
        let store = test_store();
        let now = Utc::now();
        let provisional = order("local-1-abcdefghi", 1, now);
        store
            .commit_mutation(
                OrderChange::Put(&provisional),
                &OperationPayload::Create(provisional.clone()),
                now,
            )
            .unwrap();
        store
            .commit_mutation(
                OrderChange::Put(&provisional),
                &update("local-1-abcdefghi", OrderStatus::Preparing),
                now,
            )
            .unwrap();
        let other = order("other", 2, now);
        store
            .commit_mutation(OrderChange::Put(&other), &update("other", OrderStatus::Ready), now)
            .unwrap();

        let rewritten = store
            .rewrite_order_id("local-1-abcdefghi", "-Nremote1")
            .unwrap();
        assert_eq!(rewritten, 2);

        assert!(store.get_order("local-1-abcdefghi").unwrap().is_none());
        let loaded = store.get_order("-Nremote1").unwrap().unwrap();
        assert_eq!(loaded.total, provisional.total);
        assert_eq!(store.list_orders(SortDirection::Ascending).unwrap().len(), 2);

        let ids: Vec<String> = store
            .list_queue()
            .unwrap()
            .iter()
            .map(|op| op.payload.order_id().to_string())
            .collect();
        assert_eq!(ids, vec!["-Nremote1", "-Nremote1", "other"]);
    }

    #[test]
    fn test_rewrite_keeps_latest_local_content() {
        let store = test_store();
        let now = Utc::now();
        let mut provisional = order("local-2-abcdefghi", 2, now);
        provisional.status = OrderStatus::Ready;
        store.put_order(&provisional).unwrap();
        // A snapshot already delivered an older copy under the confirmed id.
        store.put_order(&order("-Nremote2", 2, now)).unwrap();

        store.rewrite_order_id("local-2-abcdefghi", "-Nremote2").unwrap();

        let all = store.list_orders(SortDirection::Ascending).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, "-Nremote2");
        assert_eq!(all[0].status, OrderStatus::Ready);
    }

    #[test]
    fn test_rewrite_does_not_resurrect_deleted_order() {
        let store = test_store();
        let now = Utc::now();
        store
            .commit_mutation(
                OrderChange::Delete("local-3-abcdefghi"),
                &OperationPayload::Delete(OrderRef {
                    id: "local-3-abcdefghi".into(),
                }),
                now,
            )
            .unwrap();

        assert_eq!(store.rewrite_order_id("local-3-abcdefghi", "-Nremote3").unwrap(), 1);
        assert!(store.get_order("-Nremote3").unwrap().is_none());
        assert_eq!(store.list_queue().unwrap()[0].payload.order_id(), "-Nremote3");
    }
}
