//! Reference data downloader.
//!
//! Refreshes the locally cached menu categories, menu items, restaurant tables
//! and waiters from the remote backend. Each collection is replaced wholesale
//! when its fetch succeeds and left untouched when it fails.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::config::PosConfig;
use crate::db::{LocalStore, Record, SYNC_SETTINGS};
use crate::error::RemoteError;
use crate::events::{EventBus, SyncEvent};
use crate::images;
use crate::models::{MenuCategory, MenuItem, RestaurantTable, Table, Waiter};
use crate::remote::{fetch_typed, Query, RemoteBackend};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DownloadResult {
    pub success: bool,
    /// Nothing fetched because every collection was still fresh.
    pub skipped: bool,
    pub counts: BTreeMap<String, usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn freshness_key(table: Table) -> String {
    format!("last_download:{table}")
}

pub struct Downloader {
    store: Arc<LocalStore>,
    backend: Arc<dyn RemoteBackend>,
    events: EventBus,
    freshness_window: Duration,
    thumbnail_budget: usize,
    image_batch_size: usize,
}

impl Downloader {
    pub fn new(
        store: Arc<LocalStore>,
        backend: Arc<dyn RemoteBackend>,
        events: EventBus,
        config: &PosConfig,
    ) -> Self {
        Self {
            store,
            backend,
            events,
            freshness_window: config.freshness_window(),
            thumbnail_budget: config.thumbnail_budget_bytes,
            image_batch_size: config.image_batch_size.max(1),
        }
    }

    /// When `table` was last refreshed successfully.
    pub fn last_download(&self, table: Table) -> Option<DateTime<Utc>> {
        self.store
            .setting(SYNC_SETTINGS, &freshness_key(table))
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|t| t.with_timezone(&Utc))
    }

    fn is_fresh(&self, table: Table) -> bool {
        let Some(last) = self.last_download(table) else {
            return false;
        };
        let age = Utc::now().signed_duration_since(last);
        match age.to_std() {
            Ok(age) => age < self.freshness_window,
            // Timestamp in the future (clock moved back): treat as stale.
            Err(_) => false,
        }
    }

    /// Refresh every reference collection.
    ///
    /// Without `force`, nothing is fetched (not even a health probe) while
    /// every collection is younger than the freshness window. Always ends with
    /// exactly one `SyncCompleted` or `SyncFailed` event.
    pub async fn download_essential(&self, force: bool) -> DownloadResult {
        if !force && Table::REFERENCE.iter().all(|t| self.is_fresh(*t)) {
            debug!("Reference data is fresh, skipping download");
            self.events.emit(SyncEvent::SyncCompleted {
                counts: BTreeMap::new(),
            });
            return DownloadResult {
                success: true,
                skipped: true,
                ..Default::default()
            };
        }

        if !self.backend.health().await {
            warn!("Reference download skipped: backend unreachable");
            self.events.emit(SyncEvent::SyncFailed {
                reason: "offline".into(),
            });
            return DownloadResult {
                success: false,
                error: Some("offline".into()),
                ..Default::default()
            };
        }

        info!(force, "Downloading reference data");
        self.events.progress(0.05, "Downloading reference data");

        let backend = self.backend.as_ref();
        let all = Query::new();
        let (categories, items, tables, waiters) = tokio::join!(
            fetch_typed::<MenuCategory>(backend, Table::MenuCategories, &all),
            fetch_typed::<MenuItem>(backend, Table::MenuItems, &all),
            fetch_typed::<RestaurantTable>(backend, Table::RestaurantTables, &all),
            fetch_typed::<Waiter>(backend, Table::Waiters, &all),
        );

        let mut counts = BTreeMap::new();
        let mut failures = Vec::new();
        let total = Table::REFERENCE.len() as f32;

        let items = match items {
            Ok(mut items) => {
                self.attach_thumbnails(&mut items).await;
                Ok(items)
            }
            Err(e) => Err(e),
        };

        let outcomes = [
            self.store_collection(categories).await,
            self.store_collection(items).await,
            self.store_collection(tables).await,
            self.store_collection(waiters).await,
        ];

        for (done, (table, outcome)) in Table::REFERENCE.iter().zip(outcomes).enumerate() {
            match outcome {
                Ok(count) => {
                    counts.insert(table.to_string(), count);
                }
                Err(reason) => failures.push(format!("{table}: {reason}")),
            }
            self.events
                .progress(0.2 + 0.8 * (done as f32 + 1.0) / total, table.as_str());
        }

        if failures.is_empty() {
            info!(?counts, "Reference data downloaded");
            self.events.emit(SyncEvent::SyncCompleted {
                counts: counts.clone(),
            });
            DownloadResult {
                success: true,
                skipped: false,
                counts,
                error: None,
            }
        } else {
            let reason = failures.join("; ");
            warn!(%reason, "Reference download incomplete");
            self.events.emit(SyncEvent::SyncFailed {
                reason: reason.clone(),
            });
            DownloadResult {
                success: false,
                skipped: false,
                counts,
                error: Some(reason),
            }
        }
    }

    /// Replace the local copy of one collection and stamp its freshness.
    async fn store_collection<T: Record>(
        &self,
        fetched: Result<Vec<T>, RemoteError>,
    ) -> Result<usize, String> {
        let records = fetched.map_err(|e| {
            warn!(table = %T::TABLE, error = %e, "Fetch failed, keeping cached copy");
            e.to_string()
        })?;
        let written = self
            .store
            .replace_all(&records)
            .await
            .map_err(|e| e.to_string())?;
        self.store
            .set_setting(
                SYNC_SETTINGS,
                &freshness_key(T::TABLE),
                &Utc::now().to_rfc3339(),
            )
            .map_err(|e| e.to_string())?;
        trace!(table = %T::TABLE, written, "Collection replaced");
        Ok(written)
    }

    /// Compress remote menu images into inline thumbnails, a few at a time.
    /// A thumbnail already cached for the same item and URL is reused.
    /// Failures leave the item without a thumbnail.
    async fn attach_thumbnails(&self, items: &mut [MenuItem]) {
        let cached: HashMap<String, (Option<String>, String)> = match self
            .store
            .get_all::<MenuItem>(Some(&|i: &MenuItem| i.compressed_image.is_some()))
        {
            Ok(prev) => prev
                .into_iter()
                .filter_map(|i| Some((i.id, (i.image_url, i.compressed_image?))))
                .collect(),
            Err(e) => {
                warn!(error = %e, "Could not read cached thumbnails");
                HashMap::new()
            }
        };

        let mut pending: Vec<(usize, String)> = Vec::new();
        for (index, item) in items.iter_mut().enumerate() {
            let Some(url) = item.image_url.clone().filter(|u| !u.trim().is_empty()) else {
                continue;
            };
            if images::is_data_url(&url) {
                continue;
            }
            if let Some((cached_url, thumb)) = cached.get(&item.id) {
                if cached_url.as_deref() == Some(url.as_str()) {
                    item.compressed_image = Some(thumb.clone());
                    continue;
                }
            }
            pending.push((index, url));
        }

        if pending.is_empty() {
            return;
        }
        debug!(count = pending.len(), "Compressing menu thumbnails");

        let backend = self.backend.as_ref();
        let budget = self.thumbnail_budget;
        for batch in pending.chunks(self.image_batch_size) {
            let results = join_all(
                batch
                    .iter()
                    .map(|(_, url)| images::fetch_thumbnail(backend, url, budget)),
            )
            .await;
            for ((index, url), result) in batch.iter().zip(results) {
                match result {
                    Ok(thumb) => items[*index].compressed_image = Some(thumb),
                    Err(e) => {
                        debug!(item = %items[*index].id, %url, error = %e, "Thumbnail skipped")
                    }
                }
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
