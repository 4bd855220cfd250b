//! Local SQLite store for the offline-first POS data layer.
//!
//! Uses rusqlite with WAL mode. Provides additive schema migrations, typed
//! per-table access for every cached entity, chunked bulk writes, atomic
//! multi-table transactions, the settings table and order pruning.

use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value as SqlValue};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, ToSql};
use rust_decimal::Decimal;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::error::{PosError, Result};
use crate::models::{
    MenuCategory, MenuItem, Order, OrderItem, OrderStatus, OrderType, OutboxAction, OutboxEntry,
    OutboxRecord, OutboxStatus, PaymentMethod, RestaurantTable, Table, TableStatus, Waiter,
};

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 3;

/// Bulk writes above this size are split into batches with a yield between
/// them so large reference refreshes do not starve other tasks.
pub const BULK_BATCH_SIZE: usize = 100;

/// Settings category holding sync bookkeeping (freshness timestamps etc).
pub const SYNC_SETTINGS: &str = "sync";

/// Handle to the local database.
pub struct LocalStore {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

impl LocalStore {
    /// Open (or create) the store at `{data_dir}/pos.db`.
    ///
    /// On open failure the unreadable file is moved aside, not deleted, so
    /// queued orders can still be recovered by hand, and a fresh store is
    /// created.
    pub fn open(data_dir: &Path) -> Result<Self> {
        fs::create_dir_all(data_dir)?;

        let db_path = data_dir.join("pos.db");
        info!("Opening local store at {}", db_path.display());

        let conn = match open_and_configure(&db_path) {
            Ok(c) => c,
            Err(first_err) => {
                warn!(
                    "Local store open failed ({}), moving file aside and retrying once",
                    first_err
                );
                if db_path.exists() {
                    let aside = db_path.with_extension(format!(
                        "db.corrupt-{}",
                        Utc::now().format("%Y%m%d%H%M%S")
                    ));
                    let _ = fs::rename(&db_path, &aside);
                    let _ = fs::remove_file(db_path.with_extension("db-wal"));
                    let _ = fs::remove_file(db_path.with_extension("db-shm"));
                }
                open_and_configure(&db_path)?
            }
        };

        run_migrations(&conn)?;
        let requeued = requeue_stuck_outbox(&conn)?;
        if requeued > 0 {
            warn!(requeued, "Outbox entries left in syncing state were requeued");
        }

        info!("Local store initialized (schema v{CURRENT_SCHEMA_VERSION})");

        Ok(Self {
            conn: Mutex::new(conn),
            db_path,
        })
    }

    /// In-memory store, used by tests and throwaway sessions.
    pub fn open_in_memory() -> Result<Self> {
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

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| PosError::Lock)
    }

    // -----------------------------------------------------------------------
    // Typed record access
    // -----------------------------------------------------------------------

    pub fn get<T: Record>(&self, id: &str) -> Result<Option<T>> {
        let conn = self.lock()?;
        get_record(&conn, id)
    }

    /// All records of a table in its natural order, optionally filtered.
    pub fn get_all<T: Record>(&self, filter: Option<&dyn Fn(&T) -> bool>) -> Result<Vec<T>> {
        let conn = self.lock()?;
        let all = all_records::<T>(&conn)?;
        Ok(match filter {
            Some(keep) => all.into_iter().filter(|r| keep(r)).collect(),
            None => all,
        })
    }

    /// Index lookup on one of the table's indexed columns.
    pub fn find_by<T: Record>(&self, column: &str, value: &dyn ToSql) -> Result<Vec<T>> {
        let conn = self.lock()?;
        find_records(&conn, column, value)
    }

    pub fn put<T: Record>(&self, record: &T) -> Result<()> {
        let conn = self.lock()?;
        put_record(&conn, record)
    }

    /// Upsert many records. Batches of [`BULK_BATCH_SIZE`] are committed in
    /// separate transactions with a cooperative yield in between.
    pub async fn bulk_put<T: Record>(&self, records: &[T]) -> Result<usize> {
        let mut written = 0;
        let batches = records.chunks(BULK_BATCH_SIZE).count();
        for (index, batch) in records.chunks(BULK_BATCH_SIZE).enumerate() {
            {
                let mut conn = self.lock()?;
                let tx = conn.transaction()?;
                for record in batch {
                    put_record(&tx, record)?;
                }
                tx.commit()?;
            }
            written += batch.len();
            if index + 1 < batches {
                tokio::task::yield_now().await;
            }
        }
        debug!(table = %T::TABLE, written, "bulk_put complete");
        Ok(written)
    }

    pub fn delete<T: Record>(&self, id: &str) -> Result<bool> {
        let conn = self.lock()?;
        delete_record::<T>(&conn, id)
    }

    pub async fn bulk_delete<T: Record>(&self, ids: &[String]) -> Result<usize> {
        let mut deleted = 0;
        let batches = ids.chunks(BULK_BATCH_SIZE).count();
        for (index, batch) in ids.chunks(BULK_BATCH_SIZE).enumerate() {
            {
                let mut conn = self.lock()?;
                let tx = conn.transaction()?;
                for id in batch {
                    if delete_record::<T>(&tx, id)? {
                        deleted += 1;
                    }
                }
                tx.commit()?;
            }
            if index + 1 < batches {
                tokio::task::yield_now().await;
            }
        }
        Ok(deleted)
    }

    pub fn clear<T: Record>(&self) -> Result<usize> {
        let conn = self.lock()?;
        Ok(conn.execute(&format!("DELETE FROM {}", T::TABLE), [])?)
    }

    pub fn count<T: Record>(&self) -> Result<i64> {
        let conn = self.lock()?;
        Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {}", T::TABLE), [], |row| {
            row.get(0)
        })?)
    }

    /// Replace the whole table in one transaction. If any insert fails the
    /// previous rows are left in place.
    ///
    /// Replacing restaurant tables re-occupies every table that still has a
    /// pending dine-in order the backend has not seen.
    pub async fn replace_all<T: Record>(&self, records: &[T]) -> Result<usize> {
        let (written, kept) = self.transaction(|tx| {
            let written = replace_records(tx, records)?;
            let kept = if T::TABLE == Table::RestaurantTables {
                restore_table_occupancy(tx)?
            } else {
                0
            };
            Ok((written, kept))
        })?;
        if kept > 0 {
            info!(kept, "Kept local occupancy for unsynced dine-in orders");
        }
        tokio::task::yield_now().await;
        Ok(written)
    }

    /// Run `f` inside one transaction. Any error rolls back every write made
    /// by `f`.
    pub fn transaction<R>(&self, f: impl FnOnce(&Connection) -> Result<R>) -> Result<R> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    // -----------------------------------------------------------------------
    // Settings
    // -----------------------------------------------------------------------

    pub fn setting(&self, category: &str, key: &str) -> Option<String> {
        match self.lock() {
            Ok(conn) => get_setting(&conn, category, key),
            Err(e) => {
                warn!(category, key, error = %e, "Could not read setting");
                None
            }
        }
    }

    pub fn set_setting(&self, category: &str, key: &str, value: &str) -> Result<()> {
        let conn = self.lock()?;
        set_setting(&conn, category, key, value)
    }

    // -----------------------------------------------------------------------
    // Orders
    // -----------------------------------------------------------------------

    /// Orders not yet mirrored to the remote backend, oldest first.
    pub fn unsynced_orders(&self) -> Result<Vec<Order>> {
        let conn = self.lock()?;
        let mut orders: Vec<Order> = find_records(&conn, "synced", &0_i64)?;
        orders.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(orders)
    }

    pub fn order_items_for(&self, order_id: &str) -> Result<Vec<OrderItem>> {
        let conn = self.lock()?;
        find_records(&conn, "order_id", &order_id)
    }

    /// Delete completed, already-mirrored orders beyond the most recent
    /// `keep`, together with their items, in one transaction.
    pub fn prune_completed_orders(&self, keep: usize) -> Result<usize> {
        let keep = keep as i64;
        self.transaction(|tx| {
            let victims = "SELECT id FROM orders
                           WHERE status = 'completed' AND synced = 1
                           ORDER BY created_at DESC
                           LIMIT -1 OFFSET ?1";
            let items = tx.execute(
                &format!("DELETE FROM order_items WHERE order_id IN ({victims})"),
                params![keep],
            )?;
            let orders = tx.execute(
                &format!("DELETE FROM orders WHERE id IN ({victims})"),
                params![keep],
            )?;
            if orders > 0 {
                info!(orders, items, "Pruned completed orders");
            }
            Ok(orders)
        })
    }

    // -----------------------------------------------------------------------
    // Outbox
    // -----------------------------------------------------------------------

    pub fn enqueue(&self, entry: &OutboxEntry) -> Result<()> {
        entry.validate()?;
        self.put(entry)?;
        debug!(
            outbox_id = %entry.id,
            table = %entry.table(),
            action = %entry.action,
            "Outbox entry queued"
        );
        Ok(())
    }

    /// Pending and failed entries in creation order.
    ///
    /// Entries whose payload no longer decodes are marked failed and left out.
    /// With `max_retries` set, entries that reached the cap are left out too.
    pub fn outbox_ready(&self, max_retries: Option<u32>) -> Result<Vec<OutboxEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, target_table, action, record, status, retries, last_error, created_at
             FROM outbox
             WHERE status IN ('pending', 'failed')
             ORDER BY created_at ASC, rowid ASC",
        )?;
        let rows: Vec<(String, rusqlite::Result<OutboxEntry>)> = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, OutboxEntry::from_row(row))))?
            .collect::<rusqlite::Result<_>>()?;
        drop(stmt);

        let mut ready = Vec::with_capacity(rows.len());
        for (id, decoded) in rows {
            match decoded {
                Ok(entry) => {
                    if let Some(cap) = max_retries {
                        if entry.retries >= cap {
                            continue;
                        }
                    }
                    ready.push(entry);
                }
                Err(e) => {
                    warn!(outbox_id = %id, error = %e, "Outbox entry payload is unreadable");
                    conn.execute(
                        "UPDATE outbox SET status = 'failed', last_error = ?2 WHERE id = ?1",
                        params![id, format!("undecodable payload: {e}")],
                    )?;
                }
            }
        }
        Ok(ready)
    }

    pub fn mark_outbox_syncing(&self, id: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE outbox SET status = 'syncing' WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    /// Mark an entry failed and bump its retry count.
    pub fn mark_outbox_failed(&self, id: &str, error_msg: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE outbox
             SET status = 'failed', retries = retries + 1, last_error = ?2
             WHERE id = ?1",
            params![id, error_msg],
        )?;
        Ok(())
    }

    /// `(pending_or_syncing, failed)` counts for status reporting.
    pub fn outbox_counts(&self) -> Result<(i64, i64)> {
        let conn = self.lock()?;
        let pending = conn.query_row(
            "SELECT COUNT(*) FROM outbox WHERE status IN ('pending', 'syncing')",
            [],
            |row| row.get(0),
        )?;
        let failed = conn.query_row(
            "SELECT COUNT(*) FROM outbox WHERE status = 'failed'",
            [],
            |row| row.get(0),
        )?;
        Ok((pending, failed))
    }

    pub fn schema_version(&self) -> Result<i32> {
        let conn = self.lock()?;
        Ok(conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )?)
    }
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;

    Ok(conn)
}

fn requeue_stuck_outbox(conn: &Connection) -> Result<usize> {
    Ok(conn.execute(
        "UPDATE outbox SET status = 'pending' WHERE status = 'syncing'",
        [],
    )?)
}

// ---------------------------------------------------------------------------
// Migrations
// ---------------------------------------------------------------------------

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
///
/// Migrations are additive only: existing rows survive every version bump.
fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        debug!("Local store schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating local store from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    if current < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Migration v1: reference tables, orders and the outbox.
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        -- local_settings (category/key/value store)
        CREATE TABLE IF NOT EXISTS local_settings (
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now')),
            PRIMARY KEY(setting_category, setting_key)
        );

        CREATE TABLE IF NOT EXISTS menu_categories (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            icon TEXT NOT NULL DEFAULT '',
            display_order INTEGER NOT NULL DEFAULT 0,
            active INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS menu_items (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT,
            price TEXT NOT NULL,
            category_id TEXT NOT NULL,
            image_url TEXT,
            available INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS restaurant_tables (
            id TEXT PRIMARY KEY,
            table_number INTEGER NOT NULL UNIQUE CHECK (table_number > 0),
            capacity INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'available'
                CHECK (status IN ('available', 'occupied', 'reserved')),
            current_order_id TEXT,
            waiter_id TEXT
        );

        CREATE TABLE IF NOT EXISTS waiters (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            phone TEXT NOT NULL DEFAULT '',
            active INTEGER NOT NULL DEFAULT 1,
            on_duty INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS orders (
            id TEXT PRIMARY KEY,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'completed', 'cancelled')),
            order_type TEXT NOT NULL
                CHECK (order_type IN ('dine-in', 'delivery', 'takeaway')),
            subtotal TEXT NOT NULL,
            tax TEXT NOT NULL,
            delivery_charges TEXT,
            total_amount TEXT NOT NULL,
            table_id TEXT,
            customer_name TEXT,
            customer_phone TEXT,
            customer_address TEXT,
            payment_method TEXT,
            synced INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS order_items (
            id TEXT PRIMARY KEY,
            order_id TEXT NOT NULL,
            menu_item_id TEXT NOT NULL,
            name TEXT NOT NULL DEFAULT '',
            quantity INTEGER NOT NULL CHECK (quantity > 0),
            unit_price TEXT NOT NULL,
            total_price TEXT NOT NULL,
            FOREIGN KEY(order_id) REFERENCES orders(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS outbox (
            id TEXT PRIMARY KEY,
            target_table TEXT NOT NULL,
            action TEXT NOT NULL CHECK (action IN ('create', 'update', 'delete')),
            record TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'syncing', 'failed')),
            retries INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_menu_items_category ON menu_items(category_id);
        CREATE INDEX IF NOT EXISTS idx_menu_items_available ON menu_items(available);
        CREATE INDEX IF NOT EXISTS idx_menu_categories_active ON menu_categories(active);
        CREATE INDEX IF NOT EXISTS idx_restaurant_tables_status ON restaurant_tables(status);
        CREATE INDEX IF NOT EXISTS idx_waiters_on_duty ON waiters(on_duty);
        CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status);
        CREATE INDEX IF NOT EXISTS idx_orders_synced ON orders(synced);
        CREATE INDEX IF NOT EXISTS idx_orders_table_id ON orders(table_id);
        CREATE INDEX IF NOT EXISTS idx_orders_created_at ON orders(created_at);
        CREATE INDEX IF NOT EXISTS idx_order_items_order_id ON order_items(order_id);
        CREATE INDEX IF NOT EXISTS idx_outbox_status ON outbox(status);

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        PosError::from(e)
    })?;

    info!("Applied migration v1");
    Ok(())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Migration v2: offline thumbnails for menu items.
fn migrate_v2(conn: &Connection) -> Result<()> {
    if !column_exists(conn, "menu_items", "compressed_image")? {
        conn.execute_batch("ALTER TABLE menu_items ADD COLUMN compressed_image TEXT;")?;
    }
    conn.execute_batch("INSERT INTO schema_version (version) VALUES (2);")
        .map_err(|e| {
            error!("Migration v2 failed: {e}");
            PosError::from(e)
        })?;

    info!("Applied migration v2 (menu item thumbnails)");
    Ok(())
}

/// Migration v3: keep the last replay error on outbox entries.
fn migrate_v3(conn: &Connection) -> Result<()> {
    if !column_exists(conn, "outbox", "last_error")? {
        conn.execute_batch("ALTER TABLE outbox ADD COLUMN last_error TEXT;")?;
    }
    conn.execute_batch(
        "
        CREATE INDEX IF NOT EXISTS idx_outbox_status_created ON outbox(status, created_at);

        INSERT INTO schema_version (version) VALUES (3);
        ",
    )
    .map_err(|e| {
        error!("Migration v3 failed: {e}");
        PosError::from(e)
    })?;

    info!("Applied migration v3 (outbox last_error)");
    Ok(())
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a single setting value. A missing key is `None`; a failed read is
/// logged and also reads as `None`.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    let value = conn
        .query_row(
            "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
            params![category, key],
            |row| row.get(0),
        )
        .optional();
    match value {
        Ok(value) => value,
        Err(e) => {
            warn!(category, key, error = %e, "Could not read setting");
            None
        }
    }
}

/// Insert or update a setting.
pub fn set_setting(conn: &Connection, category: &str, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Record mapping
// ---------------------------------------------------------------------------

/// A row type stored in one local table.
///
/// `COLUMNS[0]` is always the `id` primary key. Values returned by
/// [`Record::to_sql_values`] follow `COLUMNS` order.
pub trait Record: Sized + Send + Sync {
    const TABLE: Table;
    const COLUMNS: &'static [&'static str];
    /// Columns usable with [`LocalStore::find_by`].
    const INDEXED: &'static [&'static str];
    const ORDER_BY: &'static str;

    fn id(&self) -> &str;
    fn to_sql_values(&self) -> Vec<SqlValue>;
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self>;
}

fn select_sql<T: Record>() -> String {
    format!("SELECT {} FROM {}", T::COLUMNS.join(", "), T::TABLE)
}

pub fn get_record<T: Record>(conn: &Connection, id: &str) -> Result<Option<T>> {
    let sql = format!("{} WHERE id = ?1", select_sql::<T>());
    Ok(conn.query_row(&sql, params![id], T::from_row).optional()?)
}

pub fn all_records<T: Record>(conn: &Connection) -> Result<Vec<T>> {
    let sql = format!("{} ORDER BY {}", select_sql::<T>(), T::ORDER_BY);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], T::from_row)?
        .collect::<rusqlite::Result<Vec<T>>>()?;
    Ok(rows)
}

pub fn find_records<T: Record>(conn: &Connection, column: &str, value: &dyn ToSql) -> Result<Vec<T>> {
    if !T::INDEXED.contains(&column) {
        return Err(PosError::Validation(format!(
            "{column} is not an indexed column of {}",
            T::TABLE
        )));
    }
    let sql = format!(
        "{} WHERE {column} = ?1 ORDER BY {}",
        select_sql::<T>(),
        T::ORDER_BY
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([value], T::from_row)?
        .collect::<rusqlite::Result<Vec<T>>>()?;
    Ok(rows)
}

/// Upsert by primary key. Uses `ON CONFLICT DO UPDATE` rather than
/// `INSERT OR REPLACE` so dependent rows are not cascade-deleted.
pub fn put_record<T: Record>(conn: &Connection, record: &T) -> Result<()> {
    let columns = T::COLUMNS.join(", ");
    let placeholders = (1..=T::COLUMNS.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let updates = T::COLUMNS[1..]
        .iter()
        .map(|c| format!("{c} = excluded.{c}"))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "INSERT INTO {} ({columns}) VALUES ({placeholders})
         ON CONFLICT(id) DO UPDATE SET {updates}",
        T::TABLE
    );
    let values = record.to_sql_values();
    debug_assert_eq!(values.len(), T::COLUMNS.len());
    conn.prepare_cached(&sql)?
        .execute(params_from_iter(values.iter()))?;
    Ok(())
}

/// Delete every row of `T`'s table and insert `records`. Runs on the caller's
/// transaction.
pub fn replace_records<T: Record>(conn: &Connection, records: &[T]) -> Result<usize> {
    let cleared = conn.execute(&format!("DELETE FROM {}", T::TABLE), [])?;
    for record in records {
        put_record(conn, record)?;
    }
    debug!(table = %T::TABLE, cleared, written = records.len(), "Replaced table");
    Ok(records.len())
}

/// Point each table at its newest unsynced pending dine-in order.
fn restore_table_occupancy(conn: &Connection) -> Result<usize> {
    Ok(conn.execute(
        "UPDATE restaurant_tables
         SET status = 'occupied',
             current_order_id = (
                SELECT o.id FROM orders o
                WHERE o.table_id = restaurant_tables.id
                  AND o.status = 'pending' AND o.order_type = 'dine-in' AND o.synced = 0
                ORDER BY o.created_at DESC LIMIT 1)
         WHERE id IN (
                SELECT table_id FROM orders
                WHERE table_id IS NOT NULL
                  AND status = 'pending' AND order_type = 'dine-in' AND synced = 0)",
        [],
    )?)
}

pub fn delete_record<T: Record>(conn: &Connection, id: &str) -> Result<bool> {
    let sql = format!("DELETE FROM {} WHERE id = ?1", T::TABLE);
    Ok(conn.execute(&sql, params![id])? > 0)
}

fn text(value: impl Into<String>) -> SqlValue {
    SqlValue::Text(value.into())
}

fn opt_text(value: Option<&str>) -> SqlValue {
    value.map(|v| text(v)).unwrap_or(SqlValue::Null)
}

fn money(value: Decimal) -> SqlValue {
    SqlValue::Text(value.to_string())
}

fn flag(value: bool) -> SqlValue {
    SqlValue::Integer(i64::from(value))
}

fn timestamp(value: &DateTime<Utc>) -> SqlValue {
    SqlValue::Text(value.to_rfc3339())
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn col_money(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let raw: String = row.get(idx)?;
    Decimal::from_str(&raw).map_err(|e| conversion_error(idx, format!("decimal {raw}: {e}")))
}

fn col_opt_money(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Decimal>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|r| {
        Decimal::from_str(&r).map_err(|e| conversion_error(idx, format!("decimal {r}: {e}")))
    })
    .transpose()
}

fn col_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, format!("timestamp {raw}: {e}")))
}

fn col_enum<E>(row: &Row<'_>, idx: usize, parse: fn(&str) -> Option<E>) -> rusqlite::Result<E> {
    let raw: String = row.get(idx)?;
    parse(&raw).ok_or_else(|| conversion_error(idx, format!("unknown value {raw}")))
}

impl Record for MenuCategory {
    const TABLE: Table = Table::MenuCategories;
    const COLUMNS: &'static [&'static str] = &["id", "name", "icon", "display_order", "active"];
    const INDEXED: &'static [&'static str] = &["id", "active"];
    const ORDER_BY: &'static str = "display_order ASC, name ASC";

    fn id(&self) -> &str {
        &self.id
    }

    fn to_sql_values(&self) -> Vec<SqlValue> {
        vec![
            text(&*self.id),
            text(&*self.name),
            text(&*self.icon),
            SqlValue::Integer(self.display_order),
            flag(self.active),
        ]
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            icon: row.get(2)?,
            display_order: row.get(3)?,
            active: row.get(4)?,
        })
    }
}

impl Record for MenuItem {
    const TABLE: Table = Table::MenuItems;
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "name",
        "description",
        "price",
        "category_id",
        "image_url",
        "compressed_image",
        "available",
    ];
    const INDEXED: &'static [&'static str] = &["id", "category_id", "available"];
    const ORDER_BY: &'static str = "name ASC, id ASC";

    fn id(&self) -> &str {
        &self.id
    }

    fn to_sql_values(&self) -> Vec<SqlValue> {
        vec![
            text(&*self.id),
            text(&*self.name),
            opt_text(self.description.as_deref()),
            money(self.price),
            text(&*self.category_id),
            opt_text(self.image_url.as_deref()),
            opt_text(self.compressed_image.as_deref()),
            flag(self.available),
        ]
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            price: col_money(row, 3)?,
            category_id: row.get(4)?,
            image_url: row.get(5)?,
            compressed_image: row.get(6)?,
            available: row.get(7)?,
        })
    }
}

impl Record for RestaurantTable {
    const TABLE: Table = Table::RestaurantTables;
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "table_number",
        "capacity",
        "status",
        "current_order_id",
        "waiter_id",
    ];
    const INDEXED: &'static [&'static str] = &["id", "table_number", "status"];
    const ORDER_BY: &'static str = "table_number ASC";

    fn id(&self) -> &str {
        &self.id
    }

    fn to_sql_values(&self) -> Vec<SqlValue> {
        vec![
            text(&*self.id),
            SqlValue::Integer(self.table_number),
            SqlValue::Integer(self.capacity),
            text(self.status.as_str()),
            opt_text(self.current_order_id.as_deref()),
            opt_text(self.waiter_id.as_deref()),
        ]
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            table_number: row.get(1)?,
            capacity: row.get(2)?,
            status: col_enum(row, 3, TableStatus::parse)?,
            current_order_id: row.get(4)?,
            waiter_id: row.get(5)?,
        })
    }
}

impl Record for Waiter {
    const TABLE: Table = Table::Waiters;
    const COLUMNS: &'static [&'static str] = &["id", "name", "phone", "active", "on_duty"];
    const INDEXED: &'static [&'static str] = &["id", "on_duty"];
    const ORDER_BY: &'static str = "name ASC, id ASC";

    fn id(&self) -> &str {
        &self.id
    }

    fn to_sql_values(&self) -> Vec<SqlValue> {
        vec![
            text(&*self.id),
            text(&*self.name),
            text(&*self.phone),
            flag(self.active),
            flag(self.on_duty),
        ]
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            phone: row.get(2)?,
            active: row.get(3)?,
            on_duty: row.get(4)?,
        })
    }
}

impl Record for Order {
    const TABLE: Table = Table::Orders;
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "status",
        "order_type",
        "subtotal",
        "tax",
        "delivery_charges",
        "total_amount",
        "table_id",
        "customer_name",
        "customer_phone",
        "customer_address",
        "payment_method",
        "synced",
        "created_at",
        "updated_at",
    ];
    const INDEXED: &'static [&'static str] = &["id", "status", "synced", "table_id"];
    const ORDER_BY: &'static str = "created_at DESC";

    fn id(&self) -> &str {
        &self.id
    }

    fn to_sql_values(&self) -> Vec<SqlValue> {
        vec![
            text(&*self.id),
            text(self.status.as_str()),
            text(self.order_type.as_str()),
            money(self.subtotal),
            money(self.tax),
            self.delivery_charges.map(money).unwrap_or(SqlValue::Null),
            money(self.total_amount),
            opt_text(self.table_id.as_deref()),
            opt_text(self.customer_name.as_deref()),
            opt_text(self.customer_phone.as_deref()),
            opt_text(self.customer_address.as_deref()),
            opt_text(self.payment_method.map(|m| m.as_str())),
            flag(self.synced),
            timestamp(&self.created_at),
            timestamp(&self.updated_at),
        ]
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let payment_method: Option<String> = row.get(11)?;
        Ok(Self {
            id: row.get(0)?,
            status: col_enum(row, 1, OrderStatus::parse)?,
            order_type: col_enum(row, 2, OrderType::parse)?,
            subtotal: col_money(row, 3)?,
            tax: col_money(row, 4)?,
            delivery_charges: col_opt_money(row, 5)?,
            total_amount: col_money(row, 6)?,
            table_id: row.get(7)?,
            customer_name: row.get(8)?,
            customer_phone: row.get(9)?,
            customer_address: row.get(10)?,
            payment_method: payment_method.as_deref().and_then(PaymentMethod::parse),
            synced: row.get(12)?,
            created_at: col_time(row, 13)?,
            updated_at: col_time(row, 14)?,
        })
    }
}

impl Record for OrderItem {
    const TABLE: Table = Table::OrderItems;
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "order_id",
        "menu_item_id",
        "name",
        "quantity",
        "unit_price",
        "total_price",
    ];
    const INDEXED: &'static [&'static str] = &["id", "order_id"];
    const ORDER_BY: &'static str = "rowid ASC";

    fn id(&self) -> &str {
        &self.id
    }

    fn to_sql_values(&self) -> Vec<SqlValue> {
        vec![
            text(&*self.id),
            text(&*self.order_id),
            text(&*self.menu_item_id),
            text(&*self.name),
            SqlValue::Integer(self.quantity),
            money(self.unit_price),
            money(self.total_price),
        ]
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            order_id: row.get(1)?,
            menu_item_id: row.get(2)?,
            name: row.get(3)?,
            quantity: row.get(4)?,
            unit_price: col_money(row, 5)?,
            total_price: col_money(row, 6)?,
        })
    }
}

impl Record for OutboxEntry {
    const TABLE: Table = Table::Outbox;
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "target_table",
        "action",
        "record",
        "status",
        "retries",
        "last_error",
        "created_at",
    ];
    const INDEXED: &'static [&'static str] = &["id", "status"];
    const ORDER_BY: &'static str = "created_at ASC, rowid ASC";

    fn id(&self) -> &str {
        &self.id
    }

    fn to_sql_values(&self) -> Vec<SqlValue> {
        // Serializing an in-memory record cannot fail: every field is a plain
        // string, number, bool or decimal.
        let record = serde_json::to_string(&self.record).unwrap_or_else(|_| "{}".to_string());
        vec![
            text(&*self.id),
            text(self.table().as_str()),
            text(self.action.as_str()),
            text(record),
            text(self.status.as_str()),
            SqlValue::Integer(i64::from(self.retries)),
            opt_text(self.last_error.as_deref()),
            timestamp(&self.created_at),
        ]
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let raw_record: String = row.get(3)?;
        let record: OutboxRecord = serde_json::from_str(&raw_record)
            .map_err(|e| conversion_error(3, format!("outbox record: {e}")))?;
        let retries: i64 = row.get(5)?;
        Ok(Self {
            id: row.get(0)?,
            action: col_enum(row, 2, OutboxAction::parse)?,
            record,
            status: col_enum(row, 4, OutboxStatus::parse)?,
            retries: u32::try_from(retries).unwrap_or(0),
            last_error: row.get(6)?,
            created_at: col_time(row, 7)?,
        })
    }
}

/// Run all migrations on the given connection (test helper, not public API).
#[cfg(test)]
pub fn run_migrations_for_test(conn: &Connection) {
    run_migrations(conn).expect("run_migrations should succeed in test");
}

// ===========================================================================
// Tests
// ===========================================================================
