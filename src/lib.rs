//! Offline-first local data layer for The Small POS terminal.
//!
//! The terminal keeps working without the backend: reference data (menu,
//! tables, waiters) is cached in SQLite, orders are written locally first and
//! mirrored when the backend answers, and anything it refuses is queued and
//! replayed by the sync engine.
//!
//! [`PosContext`] wires the pieces together for a running terminal.

use std::sync::Arc;
use tracing::{debug, info};

pub mod checkout;
pub mod config;
pub mod db;
pub mod diagnostics;
pub mod downloader;
pub mod error;
pub mod events;
pub mod images;
pub mod models;
pub mod orchestrator;
pub mod receipt;
pub mod reconciler;
pub mod remote;
pub mod storage;

#[cfg(test)]
mod testing;

pub use checkout::{Cart, CheckoutRequest, CustomerInfo, PlacementOutcome};
pub use config::PosConfig;
pub use db::LocalStore;
pub use error::{PosError, RemoteError, Result};
pub use events::{EventBus, SyncEvent};
pub use orchestrator::{Orchestrator, SyncReport, SyncStatus, SyncTrigger};
pub use remote::{HttpBackend, RemoteBackend};

use checkout::Checkout;
use receipt::PrintSink;

/// Everything a running terminal needs, sharing one store, backend and
/// event bus.
pub struct PosContext {
    pub config: PosConfig,
    pub store: Arc<LocalStore>,
    pub events: EventBus,
    pub orchestrator: Arc<Orchestrator>,
    checkout: Checkout,
}

impl PosContext {
    /// Open (or create) the local store under `config.data_dir`.
    pub fn new(
        config: PosConfig,
        backend: Arc<dyn RemoteBackend>,
        printer: Arc<dyn PrintSink>,
    ) -> Result<Self> {
        let store = Arc::new(LocalStore::open(&config.data_dir)?);
        Ok(Self::with_store(config, store, backend, printer))
    }

    pub fn with_store(
        config: PosConfig,
        store: Arc<LocalStore>,
        backend: Arc<dyn RemoteBackend>,
        printer: Arc<dyn PrintSink>,
    ) -> Self {
        let events = EventBus::new();
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            backend.clone(),
            events.clone(),
            &config,
        ));
        let checkout = Checkout::new(store.clone(), backend, events.clone(), printer)
            .with_layout(config.receipt_layout());
        Self {
            config,
            store,
            events,
            orchestrator,
            checkout,
        }
    }

    /// Place an order. When part of it is still queued, an upload pass is
    /// started in the background.
    pub async fn place_order(&self, request: CheckoutRequest) -> Result<PlacementOutcome> {
        let outcome = self.checkout.place_order(request).await?;
        if !outcome.synced {
            debug!(order_id = %outcome.order_id, "Scheduling upload after placement");
            let orchestrator = Arc::clone(&self.orchestrator);
            tokio::spawn(async move {
                orchestrator.sync_after_create().await;
            });
        }
        Ok(outcome)
    }

    /// Start background sync tasks.
    pub fn start(&self) {
        info!(data_dir = %self.config.data_dir.display(), "Starting POS data layer");
        self.orchestrator.start();
    }

    pub async fn shutdown(&self) {
        self.orchestrator.shutdown().await;
        info!("POS data layer stopped");
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MenuItem, Order, RestaurantTable, Table};
    use crate::testing::{seed_reference, MemoryPrintSink, MockBackend, TABLE_FREE};
    use rust_decimal::Decimal;
    use std::time::Duration;

    async fn context() -> (PosContext, Arc<MockBackend>) {
        let backend = Arc::new(MockBackend::new());
        seed_reference(&backend);
        let store = Arc::new(LocalStore::open_in_memory().unwrap());
        let ctx = PosContext::with_store(
            PosConfig::default(),
            store,
            backend.clone(),
            Arc::new(MemoryPrintSink::default()),
        );
        let download = ctx.orchestrator.downloader().download_essential(true).await;
        assert!(download.success);
        (ctx, backend)
    }

    fn pasta_cart(store: &LocalStore) -> Cart {
        let pasta: MenuItem = store.get("item-pasta").unwrap().unwrap();
        let mut cart = Cart::new();
        cart.add(&pasta, 1).unwrap();
        cart
    }

    #[tokio::test]
    async fn test_downloaded_reference_data_feeds_checkout() {
        let (ctx, backend) = context().await;

        let outcome = ctx
            .place_order(CheckoutRequest::dine_in(
                pasta_cart(&ctx.store),
                TABLE_FREE,
                Decimal::ZERO,
            ))
            .await
            .unwrap();

        assert!(outcome.synced);
        let table: RestaurantTable = ctx.store.get(TABLE_FREE).unwrap().unwrap();
        assert_eq!(table.current_order_id.as_deref(), Some(outcome.order_id.as_str()));
        assert!(backend.row(Table::Orders, &outcome.order_id).is_some());
    }

    #[tokio::test]
    async fn test_receipts_use_configured_layout() {
        let backend = Arc::new(MockBackend::new());
        seed_reference(&backend);
        let printer = Arc::new(MemoryPrintSink::default());
        let config = PosConfig {
            organization_name: "Taverna Nikos".into(),
            receipt_width: 32,
            ..PosConfig::default()
        };
        let ctx = PosContext::with_store(
            config,
            Arc::new(LocalStore::open_in_memory().unwrap()),
            backend,
            printer.clone(),
        );
        assert!(ctx.orchestrator.downloader().download_essential(true).await.success);

        ctx.place_order(CheckoutRequest::dine_in(
            pasta_cart(&ctx.store),
            TABLE_FREE,
            Decimal::ZERO,
        ))
        .await
        .unwrap();

        let text = printer.last().unwrap();
        assert!(text.contains("Taverna Nikos"));
        assert!(!text.contains("The Small"));
        assert!(text.lines().all(|l| l.chars().count() <= 32), "{text}");
    }

    #[tokio::test]
    async fn test_queued_placement_schedules_upload() {
        let (ctx, backend) = context().await;
        let mut rx = ctx.events.subscribe();
        // Occupancy update fails, so the inline mirror leaves the order queued.
        backend.fail_writes_for(TABLE_FREE);

        let outcome = ctx
            .place_order(CheckoutRequest::dine_in(
                pasta_cart(&ctx.store),
                TABLE_FREE,
                Decimal::ZERO,
            ))
            .await
            .unwrap();
        assert!(!outcome.synced);

        let counts = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(SyncEvent::SyncCompleted { counts }) = rx.recv().await {
                    return counts;
                }
            }
        })
        .await
        .expect("background upload ran");
        assert_eq!(counts["failed"], 1);

        backend.clear_failures();
        let result = ctx.orchestrator.sync_after_create().await;
        assert_eq!(result.synced_count, 1);
        assert!(ctx.store.get::<Order>(&outcome.order_id).unwrap().is_none());
    }
}
