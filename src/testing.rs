//! In-memory remote backend and fixtures for unit tests.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::broadcast;

use crate::error::RemoteError;
use crate::models::Table;
use crate::receipt::PrintSink;
use crate::remote::{ChangeEvent, ChangeKind, Query, RemoteBackend};

pub struct MockBackend {
    online: AtomicBool,
    calls: AtomicUsize,
    collections: Mutex<HashMap<Table, Vec<Value>>>,
    images: Mutex<HashMap<String, Vec<u8>>>,
    failing_ids: Mutex<HashSet<String>>,
    failing_collections: Mutex<HashSet<Table>>,
    feed: broadcast::Sender<ChangeEvent>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            online: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
            collections: Mutex::new(HashMap::new()),
            images: Mutex::new(HashMap::new()),
            failing_ids: Mutex::new(HashSet::new()),
            failing_collections: Mutex::new(HashSet::new()),
            feed: broadcast::channel(64).0,
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Number of backend calls, health probes included.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seed(&self, collection: Table, rows: Vec<Value>) {
        self.collections.lock().unwrap().insert(collection, rows);
    }

    pub fn rows(&self, collection: Table) -> Vec<Value> {
        self.collections
            .lock()
            .unwrap()
            .get(&collection)
            .cloned()
            .unwrap_or_default()
    }

    pub fn row(&self, collection: Table, id: &str) -> Option<Value> {
        self.rows(collection)
            .into_iter()
            .find(|r| r.get("id").and_then(Value::as_str) == Some(id))
    }

    pub fn add_image(&self, url: &str, bytes: Vec<u8>) {
        self.images.lock().unwrap().insert(url.to_string(), bytes);
    }

    /// Every write touching a row with this id (or an item of this order)
    /// fails with HTTP 500.
    pub fn fail_writes_for(&self, id: &str) {
        self.failing_ids.lock().unwrap().insert(id.to_string());
    }

    pub fn clear_failures(&self) {
        self.failing_ids.lock().unwrap().clear();
        self.failing_collections.lock().unwrap().clear();
    }

    /// Reads of this collection fail with HTTP 503.
    pub fn fail_collection(&self, collection: Table) {
        self.failing_collections.lock().unwrap().insert(collection);
    }

    fn enter(&self) -> Result<(), RemoteError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RemoteError::Offline)
        }
    }

    fn check_write(&self, row_id: &str, row: Option<&Value>) -> Result<(), RemoteError> {
        let failing = self.failing_ids.lock().unwrap();
        let order_id = row
            .and_then(|r| r.get("order_id"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        if failing.contains(row_id) || failing.contains(order_id) {
            return Err(RemoteError::Http {
                status: 500,
                body: "injected failure".into(),
            });
        }
        Ok(())
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn row_id(row: &Value) -> String {
    row.get("id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

#[async_trait]
impl RemoteBackend for MockBackend {
    async fn health(&self) -> bool {
        self.enter().is_ok()
    }

    async fn fetch_all(&self, collection: Table, query: &Query) -> Result<Vec<Value>, RemoteError> {
        self.enter()?;
        if self.failing_collections.lock().unwrap().contains(&collection) {
            return Err(RemoteError::Http {
                status: 503,
                body: "injected failure".into(),
            });
        }
        let mut rows: Vec<Value> = self
            .rows(collection)
            .into_iter()
            .filter(|r| query.matches(r))
            .collect();
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn fetch_one(&self, collection: Table, id: &str) -> Result<Option<Value>, RemoteError> {
        self.enter()?;
        Ok(self.row(collection, id))
    }

    async fn upsert(&self, collection: Table, row: &Value) -> Result<(), RemoteError> {
        self.enter()?;
        let id = row_id(row);
        self.check_write(&id, Some(row))?;
        {
            let mut all = self.collections.lock().unwrap();
            let rows = all.entry(collection).or_default();
            match rows.iter_mut().find(|r| row_id(r) == id) {
                Some(existing) => *existing = row.clone(),
                None => rows.push(row.clone()),
            }
        }
        let _ = self.feed.send(ChangeEvent {
            collection,
            id,
            kind: ChangeKind::Upserted,
            row: Some(row.clone()),
        });
        Ok(())
    }

    async fn update(&self, collection: Table, id: &str, patch: &Value) -> Result<(), RemoteError> {
        self.enter()?;
        self.check_write(id, None)?;
        let mut all = self.collections.lock().unwrap();
        let existing = all
            .get_mut(&collection)
            .and_then(|rows| rows.iter_mut().find(|r| row_id(r) == id))
            .ok_or_else(|| RemoteError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            })?;
        if let (Some(target), Some(fields)) = (existing.as_object_mut(), patch.as_object()) {
            for (k, v) in fields {
                target.insert(k.clone(), v.clone());
            }
        }
        Ok(())
    }

    async fn delete(&self, collection: Table, id: &str) -> Result<(), RemoteError> {
        self.enter()?;
        self.check_write(id, None)?;
        if let Some(rows) = self.collections.lock().unwrap().get_mut(&collection) {
            rows.retain(|r| row_id(r) != id);
        }
        Ok(())
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, RemoteError> {
        self.enter()?;
        self.images
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or(RemoteError::Http {
                status: 404,
                body: format!("no image at {url}"),
            })
    }

    fn subscribe(&self, _collection: Table) -> broadcast::Receiver<ChangeEvent> {
        self.feed.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub const TABLE_FREE: &str = "table-1";
pub const TABLE_SECOND: &str = "table-2";

/// Two categories, three menu items, two tables and two waiters.
pub fn seed_reference(backend: &MockBackend) {
    backend.seed(
        Table::MenuCategories,
        vec![
            json!({"id": "cat-mains", "name": "Mains", "icon": "🍝", "display_order": 2, "is_active": true}),
            json!({"id": "cat-drinks", "name": "Drinks", "icon": "🥤", "display_order": 1, "is_active": true}),
        ],
    );
    backend.seed(
        Table::MenuItems,
        vec![
            json!({"id": "item-pasta", "name": "Pasta", "price": 12.5, "category_id": "cat-mains", "is_available": true}),
            json!({"id": "item-salad", "name": "Salad", "description": "Greek", "price": "8.00", "category_id": "cat-mains", "is_available": true}),
            json!({"id": "item-cola", "name": "Cola", "price": 2.5, "category_id": "cat-drinks", "is_available": true}),
        ],
    );
    backend.seed(
        Table::RestaurantTables,
        vec![
            json!({"id": TABLE_FREE, "table_number": 1, "capacity": 4, "status": "available"}),
            json!({"id": TABLE_SECOND, "table_number": 2, "capacity": 2, "status": "available"}),
        ],
    );
    backend.seed(
        Table::Waiters,
        vec![
            json!({"id": "waiter-1", "name": "Nikos", "phone": "555-0101", "is_active": true, "is_on_duty": true}),
            json!({"id": "waiter-2", "name": "Eleni", "phone": "555-0102", "is_active": true, "is_on_duty": false}),
        ],
    );
}

// ---------------------------------------------------------------------------
// Print sinks
// ---------------------------------------------------------------------------

/// Keeps every printed receipt in memory.
#[derive(Default)]
pub struct MemoryPrintSink {
    pub printed: Mutex<Vec<(String, String)>>,
}

impl MemoryPrintSink {
    pub fn count(&self) -> usize {
        self.printed.lock().unwrap().len()
    }

    pub fn last(&self) -> Option<String> {
        self.printed.lock().unwrap().last().map(|(_, text)| text.clone())
    }
}

impl PrintSink for MemoryPrintSink {
    fn print(&self, receipt_id: &str, text: &str) -> crate::error::Result<()> {
        self.printed
            .lock()
            .unwrap()
            .push((receipt_id.to_string(), text.to_string()));
        Ok(())
    }
}

/// A printer that is always out of paper.
pub struct FailingPrintSink;

impl PrintSink for FailingPrintSink {
    fn print(&self, _receipt_id: &str, _text: &str) -> crate::error::Result<()> {
        Err(crate::error::PosError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "printer offline",
        )))
    }
}
