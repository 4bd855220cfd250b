//! Diagnostics for the POS data layer.
//!
//! Provides:
//! - **About info**: version, build timestamp, git SHA, platform
//! - **System health**: schema version, outbox backlog, unsynced orders,
//!   last sync and download times, cached reference counts
//! - **Logging**: console plus daily rolling file, with pruning of old files

use rusqlite::Connection;
use serde_json::{json, Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::db::{get_setting, LocalStore, SYNC_SETTINGS};
use crate::error::{PosError, Result};
use crate::models::Table;

/// Maximum number of log files to retain.
pub const MAX_LOG_FILES: usize = 10;

const LOG_FILE_PREFIX: &str = "pos";

// ---------------------------------------------------------------------------
// About info
// ---------------------------------------------------------------------------

pub fn get_about_info() -> Value {
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "buildTimestamp": env!("BUILD_TIMESTAMP"),
        "gitSha": env!("BUILD_GIT_SHA"),
        "platform": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
    })
}

// ---------------------------------------------------------------------------
// System health
// ---------------------------------------------------------------------------

/// Snapshot of the local store for the status screen and `pos-sync status`.
pub fn get_system_health(store: &LocalStore) -> Result<Value> {
    let conn = store.conn.lock().map_err(|_| PosError::Lock)?;

    let schema_version: i32 = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| {
            row.get(0)
        })
        .unwrap_or(0);

    let unsynced_orders: i64 = conn
        .query_row("SELECT COUNT(*) FROM orders WHERE synced = 0", [], |row| {
            row.get(0)
        })
        .unwrap_or(0);

    let mut reference_counts = Map::new();
    for table in Table::REFERENCE {
        let count: i64 = conn
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
            .unwrap_or(0);
        reference_counts.insert(table.to_string(), json!(count));
    }

    let db_size = fs::metadata(&store.db_path).map(|m| m.len()).unwrap_or(0);

    Ok(json!({
        "schemaVersion": schema_version,
        "outboxBacklog": get_outbox_backlog(&conn),
        "unsyncedOrders": unsynced_orders,
        "lastSyncTimes": get_last_sync_times(&conn),
        "referenceCounts": reference_counts,
        "dbSizeBytes": db_size,
    }))
}

/// Outbox entries grouped by target table and status.
fn get_outbox_backlog(conn: &Connection) -> Value {
    let mut result = Map::new();
    let Ok(mut stmt) = conn.prepare(
        "SELECT target_table, status, COUNT(*) FROM outbox GROUP BY target_table, status",
    ) else {
        return Value::Object(result);
    };
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, i64>(2)?,
        ))
    });
    if let Ok(rows) = rows {
        for (table, status, count) in rows.flatten() {
            let entry = result.entry(table).or_insert_with(|| json!({}));
            entry[status.as_str()] = json!(count);
        }
    }
    Value::Object(result)
}

fn get_last_sync_times(conn: &Connection) -> Value {
    let mut times = Map::new();
    times.insert(
        "sync".into(),
        json!(get_setting(conn, SYNC_SETTINGS, "last_sync")),
    );
    for table in Table::REFERENCE {
        times.insert(
            table.to_string(),
            json!(get_setting(conn, SYNC_SETTINGS, &format!("last_download:{table}"))),
        );
    }
    Value::Object(times)
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Delete all but the newest [`MAX_LOG_FILES`] log files in `log_dir`.
pub fn prune_old_logs(log_dir: &Path) -> usize {
    if !log_dir.exists() {
        return 0;
    }

    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
    if let Ok(entries) = fs::read_dir(log_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            let is_log = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(&format!("{LOG_FILE_PREFIX}.")))
                .unwrap_or(false);
            if path.is_file() && is_log {
                let modified = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .unwrap_or(std::time::UNIX_EPOCH);
                log_files.push((path, modified));
            }
        }
    }

    // Newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    let mut removed = 0;
    for (path, _) in log_files.iter().skip(MAX_LOG_FILES) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to prune log file {}: {e}", path.display()),
        }
    }
    removed
}

/// Install the global subscriber: console output plus a daily file under
/// `log_dir`. Keep the returned guard alive until exit so the file writer
/// flushes.
pub fn init_logging(log_dir: &Path) -> Result<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,pos_offline_sync=debug"));

    fs::create_dir_all(log_dir)?;
    prune_old_logs(log_dir);

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| PosError::Config(format!("logging already initialised: {e}")))?;

    Ok(guard)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderItem, OutboxAction, OutboxEntry, OutboxRecord};
    use rust_decimal::Decimal;

    #[test]
    fn test_about_info_has_build_metadata() {
        let info = get_about_info();
        assert_eq!(info["version"], env!("CARGO_PKG_VERSION"));
        assert!(info["gitSha"].as_str().is_some());
    }

    #[test]
    fn test_health_reports_backlog() {
        let store = LocalStore::open_in_memory().unwrap();
        store
            .enqueue(&OutboxEntry::new(
                OutboxAction::Create,
                OutboxRecord::OrderItems(OrderItem::new(
                    "remote-1",
                    "item-cola",
                    "Cola",
                    1,
                    Decimal::new(250, 2),
                )),
            ))
            .unwrap();
        store
            .set_setting(SYNC_SETTINGS, "last_sync", "2026-01-01T00:00:00Z")
            .unwrap();

        let health = get_system_health(&store).unwrap();

        assert!(health["schemaVersion"].as_i64().unwrap() >= 3);
        assert_eq!(health["outboxBacklog"]["order_items"]["pending"], 1);
        assert_eq!(health["unsyncedOrders"], 0);
        assert_eq!(health["lastSyncTimes"]["sync"], "2026-01-01T00:00:00Z");
        assert_eq!(health["referenceCounts"]["menu_items"], 0);
    }

    #[test]
    fn test_prune_keeps_newest_logs() {
        let dir = tempfile::tempdir().unwrap();
        for day in 1..=12 {
            fs::write(dir.path().join(format!("pos.2026-01-{day:02}")), "x").unwrap();
        }
        fs::write(dir.path().join("other.txt"), "keep").unwrap();

        let removed = prune_old_logs(dir.path());

        assert_eq!(removed, 2);
        let left = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(left, MAX_LOG_FILES + 1);
        assert!(dir.path().join("other.txt").exists());
    }

    #[test]
    fn test_prune_missing_dir_is_noop() {
        assert_eq!(prune_old_logs(Path::new("/nonexistent/pos-logs")), 0);
    }
}
