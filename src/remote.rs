//! Remote backend client.
//!
//! The sync engine only talks to the backend through [`RemoteBackend`], so the
//! HTTP client below can be swapped for an in-memory fake in tests. The HTTP
//! implementation speaks the PostgREST dialect exposed by the hosted backend:
//! one REST collection per table, `col=eq.value` filters, upserts via
//! `Prefer: resolution=merge-duplicates`.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::RemoteError;
use crate::models::Table;

/// Default timeout for API requests (30 seconds).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout used for the lightweight health probe.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Buffered change events per collection before slow subscribers lag.
const CHANGE_FEED_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Query / change feed types
// ---------------------------------------------------------------------------

/// Equality filters, ordering and limit for a collection read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filters: Vec<(String, String)>,
    pub order_by: Option<(String, bool)>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: &str, value: impl ToString) -> Self {
        self.filters.push((column.to_string(), value.to_string()));
        self
    }

    pub fn order(mut self, column: &str, ascending: bool) -> Self {
        self.order_by = Some((column.to_string(), ascending));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether a JSON row satisfies every equality filter.
    pub fn matches(&self, row: &Value) -> bool {
        self.filters.iter().all(|(column, expected)| {
            match row.get(column) {
                Some(Value::String(s)) => s == expected,
                Some(Value::Null) | None => expected == "null",
                Some(other) => other.to_string() == *expected,
            }
        })
    }

    fn to_params(&self) -> Vec<(String, String)> {
        let mut params = vec![("select".to_string(), "*".to_string())];
        for (column, value) in &self.filters {
            params.push((column.clone(), format!("eq.{value}")));
        }
        if let Some((column, ascending)) = &self.order_by {
            let dir = if *ascending { "asc" } else { "desc" };
            params.push(("order".to_string(), format!("{column}.{dir}")));
        }
        if let Some(limit) = self.limit {
            params.push(("limit".to_string(), limit.to_string()));
        }
        params
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Upserted,
    Updated,
    Deleted,
}

/// One row-level change on a remote collection.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub collection: Table,
    pub id: String,
    pub kind: ChangeKind,
    pub row: Option<Value>,
}

// ---------------------------------------------------------------------------
// Backend trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Cheap reachability check. Never errors: unreachable is `false`.
    async fn health(&self) -> bool;

    async fn fetch_all(&self, collection: Table, query: &Query) -> Result<Vec<Value>, RemoteError>;

    async fn fetch_one(&self, collection: Table, id: &str) -> Result<Option<Value>, RemoteError>;

    /// Insert, or overwrite the row with the same primary key.
    async fn upsert(&self, collection: Table, row: &Value) -> Result<(), RemoteError>;

    /// Patch the row with the given id. Missing rows are `NotFound`.
    async fn update(&self, collection: Table, id: &str, patch: &Value) -> Result<(), RemoteError>;

    async fn delete(&self, collection: Table, id: &str) -> Result<(), RemoteError>;

    /// Raw bytes of an absolute URL (menu images).
    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, RemoteError>;

    /// Change feed for one collection.
    fn subscribe(&self, collection: Table) -> broadcast::Receiver<ChangeEvent>;
}

/// Fetch a collection and decode each row.
pub async fn fetch_typed<T: DeserializeOwned>(
    backend: &dyn RemoteBackend,
    collection: Table,
    query: &Query,
) -> Result<Vec<T>, RemoteError> {
    let rows = backend.fetch_all(collection, query).await?;
    rows.into_iter()
        .map(|row| {
            serde_json::from_value(row)
                .map_err(|e| RemoteError::Decode(format!("{collection} row: {e}")))
        })
        .collect()
}

/// Fetch one row by id and decode it.
pub async fn fetch_one_typed<T: DeserializeOwned>(
    backend: &dyn RemoteBackend,
    collection: Table,
    id: &str,
) -> Result<Option<T>, RemoteError> {
    match backend.fetch_one(collection, id).await? {
        Some(row) => serde_json::from_value(row)
            .map(Some)
            .map_err(|e| RemoteError::Decode(format!("{collection}/{id}: {e}"))),
        None => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the backend URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes
/// - strip a trailing `/rest/v1` segment
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    if url.ends_with("/rest/v1") {
        url.truncate(url.len() - "/rest/v1".len());
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert an HTTP status code into a readable message.
fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API key is invalid or expired".to_string(),
        403 => "Terminal not authorized".to_string(),
        404 => "Backend endpoint not found".to_string(),
        409 => "Conflicting row on the backend".to_string(),
        s if s >= 500 => format!("Backend server error (HTTP {s})"),
        s => format!("Unexpected response from backend (HTTP {s})"),
    }
}

/// Turn a non-success response into `RemoteError::Http`, keeping the
/// backend's own message when it sends one.
async fn http_error(resp: reqwest::Response) -> RemoteError {
    let status = resp.status();
    let body_text = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body_text)
        .ok()
        .and_then(|json| {
            json.get("message")
                .or_else(|| json.get("error"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| {
            if body_text.trim().is_empty() {
                status_error(status)
            } else {
                format!("{}: {}", status_error(status), body_text.trim())
            }
        });
    RemoteError::Http {
        status: status.as_u16(),
        body: message,
    }
}

// ---------------------------------------------------------------------------
// HTTP backend
// ---------------------------------------------------------------------------

pub struct HttpBackend {
    base_url: String,
    api_key: String,
    client: Client,
    feeds: Mutex<HashMap<Table, broadcast::Sender<ChangeEvent>>>,
}

impl HttpBackend {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| RemoteError::Transport(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            base_url: normalize_base_url(base_url),
            api_key: api_key.trim().to_string(),
            client,
            feeds: Mutex::new(HashMap::new()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn collection_url(&self, collection: Table) -> String {
        format!("{}/rest/v1/{}", self.base_url, collection)
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.client
            .request(method, url)
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
    }

    async fn send(&self, req: RequestBuilder) -> Result<reqwest::Response, RemoteError> {
        let resp = req.send().await?;
        if resp.status().is_success() {
            Ok(resp)
        } else {
            Err(http_error(resp).await)
        }
    }

    /// Echo a successful write made through this client to local subscribers.
    fn publish(&self, event: ChangeEvent) {
        let feeds = match self.feeds.lock() {
            Ok(f) => f,
            Err(_) => return,
        };
        if let Some(tx) = feeds.get(&event.collection) {
            let _ = tx.send(event);
        }
    }
}

#[async_trait]
impl RemoteBackend for HttpBackend {
    async fn health(&self) -> bool {
        let url = format!("{}/rest/v1/", self.base_url);
        let start = Instant::now();
        match self
            .request(Method::GET, &url)
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) => {
                let up = !resp.status().is_server_error();
                debug!(
                    status = resp.status().as_u16(),
                    latency_ms = start.elapsed().as_millis() as u64,
                    "Backend health probe"
                );
                up
            }
            Err(e) => {
                debug!(error = %e, "Backend health probe failed");
                false
            }
        }
    }

    async fn fetch_all(&self, collection: Table, query: &Query) -> Result<Vec<Value>, RemoteError> {
        let url = self.collection_url(collection);
        let resp = self
            .send(self.request(Method::GET, &url).query(&query.to_params()))
            .await?;
        let rows: Vec<Value> = resp.json().await?;
        debug!(collection = %collection, rows = rows.len(), "Fetched collection");
        Ok(rows)
    }

    async fn fetch_one(&self, collection: Table, id: &str) -> Result<Option<Value>, RemoteError> {
        let rows = self
            .fetch_all(collection, &Query::new().eq("id", id).limit(1))
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn upsert(&self, collection: Table, row: &Value) -> Result<(), RemoteError> {
        let url = self.collection_url(collection);
        self.send(
            self.request(Method::POST, &url)
                .header("Prefer", "resolution=merge-duplicates,return=minimal")
                .json(row),
        )
        .await?;
        let id = row
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        debug!(collection = %collection, id = %id, "Upserted remote row");
        self.publish(ChangeEvent {
            collection,
            id,
            kind: ChangeKind::Upserted,
            row: Some(row.clone()),
        });
        Ok(())
    }

    async fn update(&self, collection: Table, id: &str, patch: &Value) -> Result<(), RemoteError> {
        let url = self.collection_url(collection);
        let resp = self
            .send(
                self.request(Method::PATCH, &url)
                    .query(&[("id", format!("eq.{id}"))])
                    .header("Prefer", "return=representation")
                    .json(patch),
            )
            .await?;
        let updated: Vec<Value> = resp.json().await?;
        if updated.is_empty() {
            return Err(RemoteError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        }
        self.publish(ChangeEvent {
            collection,
            id: id.to_string(),
            kind: ChangeKind::Updated,
            row: updated.into_iter().next(),
        });
        Ok(())
    }

    async fn delete(&self, collection: Table, id: &str) -> Result<(), RemoteError> {
        let url = self.collection_url(collection);
        self.send(
            self.request(Method::DELETE, &url)
                .query(&[("id", format!("eq.{id}"))]),
        )
        .await?;
        self.publish(ChangeEvent {
            collection,
            id: id.to_string(),
            kind: ChangeKind::Deleted,
            row: None,
        });
        Ok(())
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, RemoteError> {
        let resp = self.client.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(http_error(resp).await);
        }
        Ok(resp.bytes().await?.to_vec())
    }

    fn subscribe(&self, collection: Table) -> broadcast::Receiver<ChangeEvent> {
        let mut feeds = match self.feeds.lock() {
            Ok(f) => f,
            Err(poisoned) => {
                warn!("Change feed registry lock poisoned, recovering");
                poisoned.into_inner()
            }
        };
        let tx = feeds.entry(collection).or_insert_with(|| {
            info!(collection = %collection, "Opening change feed");
            broadcast::channel(CHANGE_FEED_CAPACITY).0
        });
        tx.subscribe()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
