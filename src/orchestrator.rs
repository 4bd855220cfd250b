//! Sync orchestration.
//!
//! Decides when the reconciler and the downloader run. At most one sync
//! episode runs at a time; triggers that arrive mid-sync are dropped rather
//! than queued. The periodic timer is only a safety net for missed network
//! events.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PosConfig;
use crate::db::{LocalStore, SYNC_SETTINGS};
use crate::downloader::{DownloadResult, Downloader};
use crate::error::Result;
use crate::events::{EventBus, SyncEvent};
use crate::reconciler::{Reconciler, UploadResult};
use crate::remote::RemoteBackend;

const LAST_SYNC_KEY: &str = "last_sync";

// ---------------------------------------------------------------------------
// Sync guard
// ---------------------------------------------------------------------------

/// Process-wide "a sync is running" flag.
#[derive(Debug, Clone, Default)]
pub struct SyncGuard {
    running: Arc<AtomicBool>,
}

/// Held for the duration of one sync episode. Releases the guard on drop.
#[derive(Debug)]
pub struct SyncPermit {
    running: Arc<AtomicBool>,
}

impl SyncGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self) -> Option<SyncPermit> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SyncPermit {
                running: self.running.clone(),
            })
    }

    pub fn is_held(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for SyncPermit {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    NetworkRestored,
    Foregrounded,
    Periodic,
    Manual,
}

impl std::fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SyncTrigger::NetworkRestored => "network_restored",
            SyncTrigger::Foregrounded => "foregrounded",
            SyncTrigger::Periodic => "periodic",
            SyncTrigger::Manual => "manual",
        };
        f.write_str(name)
    }
}

/// Outcome of one full sync episode.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    pub trigger: SyncTrigger,
    pub upload: UploadResult,
    pub download: DownloadResult,
}

/// Snapshot for the storage status panel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatus {
    pub online: bool,
    pub syncing: bool,
    pub pending_orders: usize,
    pub outbox_pending: i64,
    pub outbox_failed: i64,
    pub last_sync: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    store: Arc<LocalStore>,
    backend: Arc<dyn RemoteBackend>,
    events: EventBus,
    guard: SyncGuard,
    reconciler: Reconciler,
    downloader: Downloader,
    online: AtomicBool,
    sync_interval: Duration,
    network_check_interval: Duration,
    maintenance_interval: Duration,
    orders_to_keep: usize,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<LocalStore>,
        backend: Arc<dyn RemoteBackend>,
        events: EventBus,
        config: &PosConfig,
    ) -> Self {
        let guard = SyncGuard::new();
        let reconciler = Reconciler::new(
            store.clone(),
            backend.clone(),
            events.clone(),
            guard.clone(),
            config.max_outbox_retries,
        );
        let downloader = Downloader::new(store.clone(), backend.clone(), events.clone(), config);
        Self {
            store,
            backend,
            events,
            guard,
            reconciler,
            downloader,
            online: AtomicBool::new(false),
            sync_interval: config.sync_interval(),
            network_check_interval: config.network_check_interval(),
            maintenance_interval: config.maintenance_interval(),
            orders_to_keep: config.completed_orders_to_keep,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn downloader(&self) -> &Downloader {
        &self.downloader
    }

    /// Upload, then non-forced download. `None` when another sync is running.
    pub async fn trigger(&self, trigger: SyncTrigger) -> Option<SyncReport> {
        self.trigger_with(trigger, false).await
    }

    /// Like [`trigger`](Self::trigger); with `force_download` the reference
    /// download ignores the freshness window. It still runs after the upload,
    /// under the same permit.
    pub async fn trigger_with(
        &self,
        trigger: SyncTrigger,
        force_download: bool,
    ) -> Option<SyncReport> {
        let Some(_permit) = self.guard.try_acquire() else {
            debug!(%trigger, "Sync trigger dropped: sync already in progress");
            return None;
        };

        info!(%trigger, force_download, "Sync started");
        self.events.emit(SyncEvent::SyncStarted);

        let upload = self.reconciler.upload_held().await;
        let download = self.downloader.download_essential(force_download).await;

        if upload.success || download.success {
            self.online.store(true, Ordering::Release);
            if let Err(e) =
                self.store
                    .set_setting(SYNC_SETTINGS, LAST_SYNC_KEY, &Utc::now().to_rfc3339())
            {
                warn!(error = %e, "Could not record last sync time");
            }
        }

        info!(
            %trigger,
            uploaded = upload.synced_count,
            upload_failures = upload.failed_count,
            downloaded = download.success,
            "Sync finished"
        );
        Some(SyncReport {
            trigger,
            upload,
            download,
        })
    }

    pub async fn on_foreground(&self) -> Option<SyncReport> {
        self.trigger(SyncTrigger::Foregrounded).await
    }

    /// Upload-only pass right after a local write. No-op while a sync runs.
    pub async fn sync_after_create(&self) -> UploadResult {
        let result = self.reconciler.upload_pending().await;
        if result.success {
            let counts = BTreeMap::from([
                ("synced".to_string(), result.synced_count),
                ("failed".to_string(), result.failed_count),
            ]);
            self.events.emit(SyncEvent::SyncCompleted { counts });
        }
        result
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.store
            .setting(SYNC_SETTINGS, LAST_SYNC_KEY)
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|t| t.with_timezone(&Utc))
    }

    pub fn status(&self) -> Result<SyncStatus> {
        let pending_orders = self.store.unsynced_orders()?.len();
        let (outbox_pending, outbox_failed) = self.store.outbox_counts()?;
        Ok(SyncStatus {
            online: self.is_online(),
            syncing: self.guard.is_held(),
            pending_orders,
            outbox_pending,
            outbox_failed,
            last_sync: self.last_sync(),
        })
    }

    /// Check the backend once. Triggers a sync on an offline → online
    /// transition and returns the new state.
    async fn check_network(&self, previous: Option<bool>) -> bool {
        let online = self.backend.health().await;
        self.online.store(online, Ordering::Release);
        match (previous, online) {
            (Some(false), true) => {
                info!("Network restored; resuming queued sync");
                self.trigger(SyncTrigger::NetworkRestored).await;
            }
            (Some(true), false) | (None, false) => {
                info!("Network offline; writes stay queued locally");
            }
            _ => {}
        }
        online
    }

    fn run_maintenance(&self) {
        match self.store.prune_completed_orders(self.orders_to_keep) {
            Ok(0) => debug!("Maintenance: nothing to prune"),
            Ok(pruned) => info!(pruned, "Maintenance: pruned completed orders"),
            Err(e) => warn!(error = %e, "Maintenance prune failed"),
        }
    }

    // -----------------------------------------------------------------------
    // Background tasks
    // -----------------------------------------------------------------------

    /// Spawn the network monitor, the periodic fallback timer and the
    /// maintenance pruner. Maintenance runs once immediately.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = match self.tasks.lock() {
            Ok(t) => t,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !tasks.is_empty() {
            warn!("Orchestrator already started");
            return;
        }

        let this = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            this.run_maintenance();
            let period = this.maintenance_interval;
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = this.cancel.cancelled() => break,
                    _ = ticker.tick() => this.run_maintenance(),
                }
            }
        }));

        let this = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let period = this.network_check_interval;
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut previous = None;
            loop {
                tokio::select! {
                    _ = this.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        previous = Some(this.check_network(previous).await);
                    }
                }
            }
        }));

        let this = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let period = this.sync_interval;
            info!("Sync loop started (interval: {}s)", period.as_secs());
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = this.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        this.trigger(SyncTrigger::Periodic).await;
                    }
                }
            }
            info!("Sync loop stopped");
        }));
    }

    /// Cancel background tasks and wait for them to finish. An in-flight sync
    /// episode is allowed to complete.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut t) => t.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        debug!("Orchestrator stopped");
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        Order, OrderItem, OrderStatus, OrderType, RestaurantTable, Table, TableStatus,
    };
    use crate::testing::{seed_reference, MockBackend, TABLE_FREE};
    use rust_decimal::Decimal;

    fn setup(config: PosConfig) -> (Arc<LocalStore>, Arc<MockBackend>, Arc<Orchestrator>, EventBus) {
        let store = Arc::new(LocalStore::open_in_memory().unwrap());
        let backend = Arc::new(MockBackend::new());
        seed_reference(&backend);
        let events = EventBus::new();
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            backend.clone(),
            events.clone(),
            &config,
        ));
        (store, backend, orchestrator, events)
    }

    fn queued_takeaway(store: &LocalStore, id: &str, synced: bool, minutes_ago: i64) {
        let at = Utc::now() - chrono::Duration::minutes(minutes_ago);
        store
            .put(&Order {
                id: id.to_string(),
                status: OrderStatus::Completed,
                order_type: OrderType::Takeaway,
                subtotal: Decimal::new(250, 2),
                tax: Decimal::ZERO,
                delivery_charges: None,
                total_amount: Decimal::new(250, 2),
                table_id: None,
                customer_name: None,
                customer_phone: None,
                customer_address: None,
                payment_method: None,
                synced,
                created_at: at,
                updated_at: at,
            })
            .unwrap();
        store
            .put(&OrderItem::new(id, "item-cola", "Cola", 1, Decimal::new(250, 2)))
            .unwrap();
    }

    #[test]
    fn test_guard_is_exclusive_and_released_on_drop() {
        let guard = SyncGuard::new();
        let permit = guard.try_acquire().expect("first acquire");
        assert!(guard.is_held());
        assert!(guard.clone().try_acquire().is_none());
        drop(permit);
        assert!(!guard.is_held());
        assert!(guard.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_full_sync_uploads_then_downloads() {
        let (store, backend, orchestrator, events) = setup(PosConfig::default());
        queued_takeaway(&store, "o-1", false, 0);
        let mut rx = events.subscribe();

        let report = orchestrator
            .trigger(SyncTrigger::Manual)
            .await
            .expect("ran");

        assert_eq!(report.upload.synced_count, 1);
        assert!(report.download.success);
        assert!(backend.row(Table::Orders, "o-1").is_some());
        assert_eq!(store.count::<crate::models::MenuItem>().unwrap(), 3);
        assert!(orchestrator.last_sync().is_some());
        assert!(!orchestrator.status().unwrap().syncing);
        assert_eq!(rx.recv().await.unwrap(), SyncEvent::SyncStarted);
    }

    #[tokio::test]
    async fn test_forced_sync_downloads_after_upload() {
        let (store, backend, orchestrator, events) = setup(PosConfig::default());
        assert!(orchestrator.downloader().download_essential(false).await.success);

        // Dine-in order placed while offline.
        let at = Utc::now();
        store
            .put(&Order {
                id: "o-table".to_string(),
                status: OrderStatus::Pending,
                order_type: OrderType::DineIn,
                subtotal: Decimal::new(250, 2),
                tax: Decimal::ZERO,
                delivery_charges: None,
                total_amount: Decimal::new(250, 2),
                table_id: Some(TABLE_FREE.to_string()),
                customer_name: None,
                customer_phone: None,
                customer_address: None,
                payment_method: None,
                synced: false,
                created_at: at,
                updated_at: at,
            })
            .unwrap();
        store
            .put(&OrderItem::new("o-table", "item-cola", "Cola", 1, Decimal::new(250, 2)))
            .unwrap();
        let mut table: RestaurantTable = store.get(TABLE_FREE).unwrap().unwrap();
        table.occupy("o-table");
        store.put(&table).unwrap();
        let mut rx = events.subscribe();

        let report = orchestrator
            .trigger_with(SyncTrigger::Manual, true)
            .await
            .expect("ran");

        assert_eq!(report.upload.synced_count, 1);
        assert!(report.download.success);
        assert!(!report.download.skipped);
        assert!(store.get::<Order>("o-table").unwrap().is_none());
        let table: RestaurantTable = store.get(TABLE_FREE).unwrap().unwrap();
        assert_eq!(table.status, TableStatus::Occupied);
        assert_eq!(table.current_order_id.as_deref(), Some("o-table"));
        assert_eq!(backend.rows(Table::Orders).len(), 1);
        // Nothing is downloaded before the episode starts.
        assert_eq!(rx.recv().await.unwrap(), SyncEvent::SyncStarted);
    }

    #[tokio::test]
    async fn test_forced_trigger_mid_sync_is_dropped() {
        let (store, backend, orchestrator, _) = setup(PosConfig::default());
        let _permit = orchestrator.guard.try_acquire().unwrap();

        assert!(orchestrator
            .trigger_with(SyncTrigger::Manual, true)
            .await
            .is_none());
        assert_eq!(backend.calls(), 0);
        assert_eq!(store.count::<RestaurantTable>().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_trigger_mid_sync_is_dropped() {
        let (_store, backend, orchestrator, _) = setup(PosConfig::default());
        let _permit = orchestrator.guard.try_acquire().unwrap();

        assert!(orchestrator.trigger(SyncTrigger::Periodic).await.is_none());
        assert_eq!(orchestrator.sync_after_create().await, UploadResult::default());
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_sync_after_create_is_upload_only() {
        let (store, _backend, orchestrator, _) = setup(PosConfig::default());
        queued_takeaway(&store, "o-1", false, 0);

        let result = orchestrator.sync_after_create().await;

        assert_eq!(result.synced_count, 1);
        assert_eq!(store.count::<crate::models::MenuItem>().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_network_restore_triggers_sync() {
        let (store, backend, orchestrator, _) = setup(PosConfig::default());
        queued_takeaway(&store, "o-1", false, 0);
        backend.set_online(false);

        let state = orchestrator.check_network(None).await;
        assert!(!state);
        assert!(store.get::<Order>("o-1").unwrap().is_some());

        backend.set_online(true);
        let state = orchestrator.check_network(Some(state)).await;

        assert!(state);
        assert!(orchestrator.is_online());
        assert!(store.get::<Order>("o-1").unwrap().is_none());
        assert!(backend.row(Table::Orders, "o-1").is_some());
    }

    #[tokio::test]
    async fn test_steady_online_does_not_trigger() {
        let (store, _backend, orchestrator, _) = setup(PosConfig::default());
        queued_takeaway(&store, "o-1", false, 0);

        orchestrator.check_network(Some(true)).await;

        assert!(store.get::<Order>("o-1").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_status_snapshot_counts_backlog() {
        let (store, backend, orchestrator, _) = setup(PosConfig::default());
        queued_takeaway(&store, "o-1", false, 0);
        queued_takeaway(&store, "o-2", false, 1);
        backend.set_online(false);
        orchestrator.trigger(SyncTrigger::Manual).await;

        let status = orchestrator.status().unwrap();

        assert_eq!(status.pending_orders, 2);
        assert_eq!(status.outbox_pending, 0);
        assert!(!status.online);
        assert!(status.last_sync.is_none());
    }

    #[tokio::test]
    async fn test_start_prunes_and_shutdown_stops_tasks() {
        let config = PosConfig {
            completed_orders_to_keep: 1,
            ..PosConfig::default()
        };
        let (store, _backend, orchestrator, _) = setup(config);
        for i in 0..3 {
            queued_takeaway(&store, &format!("done-{i}"), true, i);
        }

        orchestrator.start();
        tokio::time::timeout(Duration::from_secs(5), orchestrator.shutdown())
            .await
            .expect("shutdown completes");

        assert_eq!(store.count::<Order>().unwrap(), 1);
        assert!(store.get::<Order>("done-0").unwrap().is_some());
        assert!(orchestrator.tasks.lock().unwrap().is_empty());
    }
}
