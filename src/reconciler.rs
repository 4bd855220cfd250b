//! Order upload and outbox drain.
//!
//! Unsynced orders are pushed to the backend with their client ids (upsert, so
//! a retry after a partial failure is harmless), then removed from the local
//! store. Outbox entries are replayed in creation order. Every order and every
//! outbox entry is isolated: one failure never blocks the rest of the pass.

use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::db::{delete_record, get_record, LocalStore};
use crate::error::{PosError, RemoteError, Result};
use crate::events::EventBus;
use crate::models::{
    Order, OrderItem, OrderStatus, OrderType, OutboxAction, OutboxEntry, OutboxRecord, Table,
};
use crate::orchestrator::SyncGuard;
use crate::remote::{fetch_one_typed, RemoteBackend};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UploadResult {
    /// The pass ran: backend reachable and no other sync in progress.
    pub success: bool,
    /// Orders plus outbox entries mirrored by this pass.
    pub synced_count: usize,
    pub failed_count: usize,
}

pub struct Reconciler {
    store: Arc<LocalStore>,
    backend: Arc<dyn RemoteBackend>,
    events: EventBus,
    guard: SyncGuard,
    max_outbox_retries: Option<u32>,
}

impl Reconciler {
    pub fn new(
        store: Arc<LocalStore>,
        backend: Arc<dyn RemoteBackend>,
        events: EventBus,
        guard: SyncGuard,
        max_outbox_retries: Option<u32>,
    ) -> Self {
        Self {
            store,
            backend,
            events,
            guard,
            max_outbox_retries,
        }
    }

    /// Push every unsynced order and drain the outbox.
    ///
    /// No-op (`success = false`) while another sync holds the guard or when
    /// the backend is unreachable.
    pub async fn upload_pending(&self) -> UploadResult {
        let Some(_permit) = self.guard.try_acquire() else {
            debug!("Upload skipped: sync already in progress");
            return UploadResult::default();
        };
        self.upload_held().await
    }

    /// Upload pass for a caller that already holds the sync guard.
    pub(crate) async fn upload_held(&self) -> UploadResult {
        if !self.backend.health().await {
            info!("Upload skipped: backend unreachable, orders stay queued");
            return UploadResult::default();
        }

        let mut result = UploadResult {
            success: true,
            ..Default::default()
        };

        match self.store.unsynced_orders() {
            Ok(orders) => {
                let total = orders.len();
                for (done, order) in orders.iter().enumerate() {
                    match self.reconcile(order).await {
                        Ok(()) => result.synced_count += 1,
                        Err(e) => {
                            warn!(order_id = %order.id, error = %e, "Order upload failed, keeping it queued");
                            result.failed_count += 1;
                        }
                    }
                    self.events
                        .progress((done + 1) as f32 / total as f32, "Uploading orders");
                }
            }
            Err(e) => {
                warn!(error = %e, "Could not read unsynced orders");
                result.failed_count += 1;
            }
        }

        let (drained, failed) = self.drain_outbox().await;
        result.synced_count += drained;
        result.failed_count += failed;

        if result.synced_count > 0 || result.failed_count > 0 {
            info!(
                synced = result.synced_count,
                failed = result.failed_count,
                "Upload pass complete"
            );
        }
        result
    }

    /// Upload a single unsynced order now. Returns `false` when the order is
    /// unknown or already mirrored, or when a sync pass is running.
    pub async fn reconcile_order(&self, order_id: &str) -> Result<bool> {
        let Some(_permit) = self.guard.try_acquire() else {
            return Ok(false);
        };
        let Some(order) = self.store.get::<Order>(order_id)? else {
            return Ok(false);
        };
        if order.synced {
            return Ok(false);
        }
        self.reconcile(&order).await?;
        Ok(true)
    }

    /// Mirror one order remotely, then drop the local copy.
    async fn reconcile(&self, order: &Order) -> Result<()> {
        let items = self.store.order_items_for(&order.id)?;
        mirror_order(self.backend.as_ref(), order, &items).await?;

        let order_id = order.id.clone();
        let removed = self.store.transaction(|tx| {
            // Items merged in while the upload ran are pushed next pass.
            let current = get_record::<Order>(tx, &order_id)?;
            if current.map(|c| c.updated_at) != Some(order.updated_at) {
                return Ok(false);
            }
            tx.execute(
                "DELETE FROM order_items WHERE order_id = ?1",
                rusqlite::params![order_id],
            )?;
            delete_record::<Order>(tx, &order_id)?;
            Ok(true)
        })?;
        if removed {
            debug!(order_id = %order.id, items = items.len(), "Order reconciled");
        } else {
            debug!(order_id = %order.id, "Order changed during upload, kept for next pass");
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Outbox
    // -----------------------------------------------------------------------

    /// Replay ready outbox entries. Returns `(succeeded, failed)`.
    async fn drain_outbox(&self) -> (usize, usize) {
        let entries = match self.store.outbox_ready(self.max_outbox_retries) {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "Could not read outbox");
                return (0, 1);
            }
        };

        let mut succeeded = 0;
        let mut failed = 0;
        for entry in entries {
            if let Err(e) = self.store.mark_outbox_syncing(&entry.id) {
                warn!(outbox_id = %entry.id, error = %e, "Could not mark outbox entry syncing");
                failed += 1;
                continue;
            }
            let outcome = match entry.validate() {
                Ok(()) => self.dispatch(&entry).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(()) => match self.store.delete::<OutboxEntry>(&entry.id) {
                    Ok(_) => succeeded += 1,
                    Err(e) => {
                        warn!(outbox_id = %entry.id, error = %e, "Replayed entry could not be removed");
                        failed += 1;
                    }
                },
                Err(e) => {
                    warn!(
                        outbox_id = %entry.id,
                        table = %entry.table(),
                        action = %entry.action,
                        retries = entry.retries + 1,
                        error = %e,
                        "Outbox replay failed"
                    );
                    if let Err(mark_err) = self.store.mark_outbox_failed(&entry.id, &e.to_string()) {
                        warn!(outbox_id = %entry.id, error = %mark_err, "Could not record outbox failure");
                    }
                    failed += 1;
                }
            }
        }
        (succeeded, failed)
    }

    async fn dispatch(&self, entry: &OutboxEntry) -> Result<()> {
        let backend = self.backend.as_ref();
        let table = entry.table();
        match (&entry.action, &entry.record) {
            (OutboxAction::Update, OutboxRecord::OrderTotals(delta)) => {
                let mut order: Order = fetch_one_typed(backend, Table::Orders, &delta.order_id)
                    .await?
                    .ok_or_else(|| RemoteError::NotFound {
                        collection: Table::Orders.to_string(),
                        id: delta.order_id.clone(),
                    })?;
                delta.apply(&mut order);
                backend
                    .update(Table::Orders, &order.id, &totals_patch(&order))
                    .await?;
            }
            (OutboxAction::Create, record) => {
                backend.upsert(table, &record.remote_row()?).await?;
            }
            (OutboxAction::Update, record) => {
                backend
                    .update(table, record.target_id(), &record.remote_row()?)
                    .await?;
            }
            (OutboxAction::Delete, record) => {
                backend.delete(table, record.target_id()).await?;
            }
        }
        Ok(())
    }
}

/// Amount columns (and `updated_at`) of an order, as a remote patch.
pub(crate) fn totals_patch(order: &Order) -> serde_json::Value {
    json!({
        "subtotal": order.subtotal,
        "tax": order.tax,
        "delivery_charges": order.delivery_charges,
        "total_amount": order.total_amount,
        "updated_at": order.updated_at,
    })
}

/// Push an order, its items and (dine-in) its table occupancy to the backend.
pub(crate) async fn mirror_order(
    backend: &dyn RemoteBackend,
    order: &Order,
    items: &[OrderItem],
) -> Result<()> {
    backend
        .upsert(Table::Orders, &serde_json::to_value(order)?)
        .await?;
    for item in items {
        backend
            .upsert(Table::OrderItems, &serde_json::to_value(item)?)
            .await?;
    }
    if order.order_type == OrderType::DineIn && order.status == OrderStatus::Pending {
        let table_id = order.table_id.as_deref().ok_or_else(|| {
            PosError::Validation(format!("dine-in order {} has no table", order.id))
        })?;
        backend
            .update(
                Table::RestaurantTables,
                table_id,
                &json!({ "status": "occupied", "current_order_id": order.id }),
            )
            .await?;
    }
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{round_money, OrderTotalsDelta, PaymentMethod};
    use crate::testing::{seed_reference, MockBackend, TABLE_FREE};
    use chrono::Utc;
    use rust_decimal::Decimal;
    use serde_json::Value;

    fn setup() -> (Arc<LocalStore>, Arc<MockBackend>, Reconciler) {
        let store = Arc::new(LocalStore::open_in_memory().unwrap());
        let backend = Arc::new(MockBackend::new());
        seed_reference(&backend);
        let reconciler = Reconciler::new(
            store.clone(),
            backend.clone(),
            EventBus::new(),
            SyncGuard::new(),
            None,
        );
        (store, backend, reconciler)
    }

    fn queue_order(store: &LocalStore, order_type: OrderType, table: Option<&str>) -> Order {
        let now = Utc::now();
        let id = uuid::Uuid::new_v4().to_string();
        let item = OrderItem::new(&id, "item-pasta", "Pasta", 2, Decimal::new(1250, 2));
        let subtotal = item.total_price;
        let tax = round_money(subtotal * Decimal::new(10, 2));
        let order = Order {
            id,
            status: if order_type == OrderType::DineIn {
                OrderStatus::Pending
            } else {
                OrderStatus::Completed
            },
            order_type,
            subtotal,
            tax,
            delivery_charges: None,
            total_amount: subtotal + tax,
            table_id: table.map(str::to_string),
            customer_name: None,
            customer_phone: None,
            customer_address: None,
            payment_method: Some(PaymentMethod::Cash),
            synced: false,
            created_at: now,
            updated_at: now,
        };
        store.put(&order).unwrap();
        store.put(&item).unwrap();
        order
    }

    fn seed_remote_order(backend: &MockBackend, id: &str) {
        backend.seed(
            Table::Orders,
            vec![json!({
                "id": id, "status": "pending", "order_type": "dine-in",
                "subtotal": "20.00", "tax": "2.00", "total_amount": "22.00",
                "table_id": TABLE_FREE,
                "created_at": Utc::now(), "updated_at": Utc::now()
            })],
        );
    }

    #[tokio::test]
    async fn test_offline_order_uploaded_with_same_id() {
        let (store, backend, reconciler) = setup();
        let order = queue_order(&store, OrderType::DineIn, Some(TABLE_FREE));

        let result = reconciler.upload_pending().await;

        assert_eq!(
            result,
            UploadResult {
                success: true,
                synced_count: 1,
                failed_count: 0
            }
        );
        let remote = backend.row(Table::Orders, &order.id).expect("mirrored");
        assert_eq!(remote["order_type"], "dine-in");
        assert!(remote.get("synced").is_none());
        let items: Vec<Value> = backend
            .rows(Table::OrderItems)
            .into_iter()
            .filter(|i| i["order_id"] == order.id.as_str())
            .collect();
        assert_eq!(items.len(), 1);
        let table = backend.row(Table::RestaurantTables, TABLE_FREE).unwrap();
        assert_eq!(table["status"], "occupied");
        assert_eq!(table["current_order_id"], order.id.as_str());

        assert!(store.get::<Order>(&order.id).unwrap().is_none());
        assert!(store.order_items_for(&order.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_offline_pass_is_noop() {
        let (store, backend, reconciler) = setup();
        let order = queue_order(&store, OrderType::Takeaway, None);
        backend.set_online(false);

        let result = reconciler.upload_pending().await;

        assert!(!result.success);
        assert_eq!(result.synced_count, 0);
        assert!(store.get::<Order>(&order.id).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failed_order_isolated_and_retried() {
        let (store, backend, reconciler) = setup();
        let good = queue_order(&store, OrderType::Takeaway, None);
        let bad = queue_order(&store, OrderType::Delivery, None);
        backend.fail_writes_for(&bad.id);

        let first = reconciler.upload_pending().await;

        assert_eq!(first.synced_count, 1);
        assert_eq!(first.failed_count, 1);
        assert!(store.get::<Order>(&good.id).unwrap().is_none());
        let kept: Order = store.get(&bad.id).unwrap().unwrap();
        assert!(!kept.synced);
        assert_eq!(store.order_items_for(&bad.id).unwrap().len(), 1);

        backend.clear_failures();
        let second = reconciler.upload_pending().await;
        assert_eq!(second.synced_count, 1);
        assert!(backend.row(Table::Orders, &bad.id).is_some());
    }

    #[tokio::test]
    async fn test_held_guard_makes_upload_noop() {
        let (store, backend, reconciler) = setup();
        queue_order(&store, OrderType::Takeaway, None);
        let _permit = reconciler.guard.try_acquire().unwrap();
        let calls = backend.calls();

        let result = reconciler.upload_pending().await;

        assert_eq!(result, UploadResult::default());
        assert_eq!(backend.calls(), calls);
    }

    #[tokio::test]
    async fn test_reconcile_single_order() {
        let (store, backend, reconciler) = setup();
        let order = queue_order(&store, OrderType::Takeaway, None);
        let other = queue_order(&store, OrderType::Takeaway, None);

        assert!(reconciler.reconcile_order(&order.id).await.unwrap());
        assert!(!reconciler.reconcile_order("missing").await.unwrap());

        assert!(backend.row(Table::Orders, &order.id).is_some());
        assert!(backend.row(Table::Orders, &other.id).is_none());
        assert!(store.get::<Order>(&other.id).unwrap().is_some());
    }

    fn item_entry(order_id: &str) -> OutboxEntry {
        OutboxEntry::new(
            OutboxAction::Create,
            OutboxRecord::OrderItems(OrderItem::new(
                order_id,
                "item-cola",
                "Cola",
                1,
                Decimal::new(250, 2),
            )),
        )
    }

    #[tokio::test]
    async fn test_outbox_drains_five_entries() {
        let (store, backend, reconciler) = setup();
        seed_remote_order(&backend, "remote-1");
        for _ in 0..5 {
            store.enqueue(&item_entry("remote-1")).unwrap();
        }

        let result = reconciler.upload_pending().await;

        assert_eq!(result.synced_count, 5);
        assert_eq!(result.failed_count, 0);
        assert_eq!(store.count::<OutboxEntry>().unwrap(), 0);
        assert_eq!(backend.rows(Table::OrderItems).len(), 5);
    }

    #[tokio::test]
    async fn test_outbox_failures_stay_with_incremented_retries() {
        let (store, backend, reconciler) = setup();
        seed_remote_order(&backend, "remote-1");
        for _ in 0..3 {
            store.enqueue(&item_entry("remote-1")).unwrap();
        }
        let failing: Vec<OutboxEntry> = (0..2).map(|_| item_entry("remote-dead")).collect();
        for entry in &failing {
            store.enqueue(entry).unwrap();
        }
        backend.fail_writes_for("remote-dead");

        let result = reconciler.upload_pending().await;

        assert_eq!(result.synced_count, 3);
        assert_eq!(result.failed_count, 2);
        let left: Vec<OutboxEntry> = store.get_all(None).unwrap();
        assert_eq!(left.len(), 2);
        for entry in left {
            assert!(failing.iter().any(|f| f.id == entry.id));
            assert_eq!(entry.retries, 1);
            assert_eq!(entry.status, crate::models::OutboxStatus::Failed);
            assert!(entry.last_error.is_some());
        }
    }

    #[tokio::test]
    async fn test_outbox_retry_cap_parks_entries() {
        let (store, backend, _) = setup();
        let reconciler = Reconciler::new(
            store.clone(),
            backend.clone(),
            EventBus::new(),
            SyncGuard::new(),
            Some(1),
        );
        store.enqueue(&item_entry("remote-dead")).unwrap();
        backend.fail_writes_for("remote-dead");

        let first = reconciler.upload_pending().await;
        let second = reconciler.upload_pending().await;

        assert_eq!(first.failed_count, 1);
        assert_eq!(second.failed_count, 0);
        assert_eq!(store.count::<OutboxEntry>().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_totals_delta_replayed_read_modify_write() {
        let (store, backend, reconciler) = setup();
        seed_remote_order(&backend, "remote-1");
        store
            .enqueue(&OutboxEntry::new(
                OutboxAction::Update,
                OutboxRecord::OrderTotals(OrderTotalsDelta {
                    order_id: "remote-1".into(),
                    subtotal: Decimal::new(500, 2),
                    tax: Decimal::new(50, 2),
                    delivery_charges: Decimal::ZERO,
                    total_amount: Decimal::new(550, 2),
                }),
            ))
            .unwrap();

        let result = reconciler.upload_pending().await;

        assert_eq!(result.synced_count, 1);
        let remote: Order =
            serde_json::from_value(backend.row(Table::Orders, "remote-1").unwrap()).unwrap();
        assert_eq!(remote.subtotal, Decimal::new(2500, 2));
        assert_eq!(remote.total_amount, Decimal::new(2750, 2));
        assert!(remote.amounts_consistent());
    }

    #[tokio::test]
    async fn test_delta_for_missing_remote_order_fails() {
        let (store, _backend, reconciler) = setup();
        store
            .enqueue(&OutboxEntry::new(
                OutboxAction::Update,
                OutboxRecord::OrderTotals(OrderTotalsDelta {
                    order_id: "ghost".into(),
                    subtotal: Decimal::ONE,
                    tax: Decimal::ZERO,
                    delivery_charges: Decimal::ZERO,
                    total_amount: Decimal::ONE,
                }),
            ))
            .unwrap();

        let result = reconciler.upload_pending().await;

        assert_eq!(result.failed_count, 1);
        let left: Vec<OutboxEntry> = store.get_all(None).unwrap();
        assert!(left[0].last_error.as_deref().unwrap().contains("ghost"));
    }
}
