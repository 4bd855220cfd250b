//! Order placement.
//!
//! Turns a cart into an order. A dine-in cart for a table that already has an
//! open order is merged into that order instead of creating a second one.
//! The local store is written first; the backend is mirrored inline when it
//! answers, and anything it does not accept stays queued for the reconciler.

use chrono::Utc;
use rusqlite::params;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::{put_record, LocalStore};
use crate::error::{PosError, RemoteError, Result};
use crate::events::{EventBus, SyncEvent};
use crate::models::{
    round_money, MenuCategory, MenuItem, Order, OrderItem, OrderStatus, OrderTotalsDelta, OrderType,
    OutboxAction, OutboxEntry, OutboxRecord, PaymentMethod, RestaurantTable, Table, TableStatus,
};
use crate::receipt::{
    format_receipt, LayoutConfig, PrintSink, Receipt, ReceiptGroup, ReceiptItem, TotalsLine,
};
use crate::reconciler::{mirror_order, totals_patch};
use crate::remote::{fetch_one_typed, RemoteBackend};

// ---------------------------------------------------------------------------
// Cart
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CartLine {
    pub menu_item_id: String,
    pub name: String,
    pub unit_price: Decimal,
    pub quantity: i64,
}

impl CartLine {
    pub fn total(&self) -> Decimal {
        round_money(self.unit_price * Decimal::from(self.quantity))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Cart {
    lines: Vec<CartLine>,
}

impl Cart {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `quantity` of a menu item. Adding an item already in the cart
    /// raises its quantity.
    pub fn add(&mut self, item: &MenuItem, quantity: i64) -> Result<()> {
        if quantity <= 0 {
            return Err(PosError::Validation(format!(
                "quantity for {} must be positive",
                item.name
            )));
        }
        if !item.available {
            return Err(PosError::Validation(format!("{} is not available", item.name)));
        }
        match self.lines.iter_mut().find(|l| l.menu_item_id == item.id) {
            Some(line) => line.quantity += quantity,
            None => self.lines.push(CartLine {
                menu_item_id: item.id.clone(),
                name: item.name.clone(),
                unit_price: item.price,
                quantity,
            }),
        }
        Ok(())
    }

    /// Set a line's quantity; zero or less removes it. Returns whether the
    /// item was in the cart.
    pub fn set_quantity(&mut self, menu_item_id: &str, quantity: i64) -> bool {
        if quantity <= 0 {
            return self.remove(menu_item_id);
        }
        match self.lines.iter_mut().find(|l| l.menu_item_id == menu_item_id) {
            Some(line) => {
                line.quantity = quantity;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, menu_item_id: &str) -> bool {
        let before = self.lines.len();
        self.lines.retain(|l| l.menu_item_id != menu_item_id);
        self.lines.len() != before
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    pub fn lines(&self) -> &[CartLine] {
        &self.lines
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn subtotal(&self) -> Decimal {
        round_money(self.lines.iter().map(CartLine::total).sum())
    }
}

// ---------------------------------------------------------------------------
// Request / amounts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CustomerInfo {
    pub name: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutRequest {
    pub cart: Cart,
    pub order_type: OrderType,
    pub table_id: Option<String>,
    /// Percentage of the subtotal, 0 to 100.
    pub tax_percent: Decimal,
    /// Flat charge, delivery orders only.
    pub delivery_charge: Decimal,
    pub customer: CustomerInfo,
    pub payment_method: Option<PaymentMethod>,
}

impl CheckoutRequest {
    pub fn dine_in(cart: Cart, table_id: &str, tax_percent: Decimal) -> Self {
        Self {
            cart,
            order_type: OrderType::DineIn,
            table_id: Some(table_id.to_string()),
            tax_percent,
            delivery_charge: Decimal::ZERO,
            customer: CustomerInfo::default(),
            payment_method: None,
        }
    }

    pub fn takeaway(cart: Cart, tax_percent: Decimal, payment_method: PaymentMethod) -> Self {
        Self {
            cart,
            order_type: OrderType::Takeaway,
            table_id: None,
            tax_percent,
            delivery_charge: Decimal::ZERO,
            customer: CustomerInfo::default(),
            payment_method: Some(payment_method),
        }
    }

    pub fn delivery(
        cart: Cart,
        tax_percent: Decimal,
        delivery_charge: Decimal,
        customer: CustomerInfo,
        payment_method: PaymentMethod,
    ) -> Self {
        Self {
            cart,
            order_type: OrderType::Delivery,
            table_id: None,
            tax_percent,
            delivery_charge,
            customer,
            payment_method: Some(payment_method),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.cart.is_empty() {
            return Err(PosError::Validation("cart is empty".into()));
        }
        if let Some(line) = self
            .cart
            .lines()
            .iter()
            .find(|l| l.quantity <= 0 || l.unit_price.is_sign_negative())
        {
            return Err(PosError::Validation(format!(
                "invalid cart line for {}",
                line.name
            )));
        }
        if self.tax_percent < Decimal::ZERO || self.tax_percent > Decimal::ONE_HUNDRED {
            return Err(PosError::Validation(format!(
                "tax percent {} outside 0-100",
                self.tax_percent
            )));
        }
        if self.delivery_charge.is_sign_negative() {
            return Err(PosError::Validation("delivery charge is negative".into()));
        }
        if self.order_type == OrderType::DineIn
            && self.table_id.as_deref().map_or(true, |t| t.trim().is_empty())
        {
            return Err(PosError::Validation("dine-in order needs a table".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Amounts {
    pub subtotal: Decimal,
    pub tax: Decimal,
    pub delivery_charges: Option<Decimal>,
    pub total: Decimal,
}

impl Amounts {
    fn delta(&self, order_id: &str) -> OrderTotalsDelta {
        OrderTotalsDelta {
            order_id: order_id.to_string(),
            subtotal: self.subtotal,
            tax: self.tax,
            delivery_charges: self.delivery_charges.unwrap_or_default(),
            total_amount: self.total,
        }
    }

    fn receipt_lines(&self) -> Vec<TotalsLine> {
        let mut lines = vec![
            TotalsLine {
                label: "Subtotal".into(),
                amount: self.subtotal,
                emphasize: false,
            },
            TotalsLine {
                label: "Tax".into(),
                amount: self.tax,
                emphasize: false,
            },
        ];
        if let Some(delivery) = self.delivery_charges {
            lines.push(TotalsLine {
                label: "Delivery".into(),
                amount: delivery,
                emphasize: false,
            });
        }
        lines.push(TotalsLine {
            label: "Total".into(),
            amount: self.total,
            emphasize: true,
        });
        lines
    }
}

/// Subtotal, tax and total for a cart, each rounded to the cent.
///
/// Tax is applied to the subtotal only. The delivery charge counts for
/// delivery orders and is ignored otherwise.
pub fn compute_amounts(
    cart: &Cart,
    order_type: OrderType,
    tax_percent: Decimal,
    delivery_charge: Decimal,
) -> Amounts {
    let subtotal = cart.subtotal();
    let tax = round_money(subtotal * tax_percent / Decimal::ONE_HUNDRED);
    let delivery_charges =
        (order_type == OrderType::Delivery).then(|| round_money(delivery_charge));
    let total = subtotal + tax + delivery_charges.unwrap_or_default();
    Amounts {
        subtotal,
        tax,
        delivery_charges,
        total,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlacementOutcome {
    pub order_id: String,
    /// Items were added to the table's open order.
    pub merged: bool,
    /// Everything written by this placement already reached the backend.
    pub synced: bool,
    pub receipt: Option<Receipt>,
}

// ---------------------------------------------------------------------------
// Placement
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum Resolution {
    /// New order. `replaces` is the stale order id a dine-in table still
    /// points at, if any.
    Create { replaces: Option<String> },
    /// Open order present in the local store.
    MergeLocal(Order),
    /// Open order only known to the backend. `order` is `None` when the
    /// backend could not be asked and the table's occupancy is trusted.
    MergeRemote {
        order_id: String,
        order: Option<Order>,
    },
}

struct Placed {
    order_id: String,
    merged: bool,
    synced: bool,
    items: Vec<OrderItem>,
    order_total: Option<Decimal>,
}

pub struct Checkout {
    store: Arc<LocalStore>,
    backend: Arc<dyn RemoteBackend>,
    events: EventBus,
    printer: Arc<dyn PrintSink>,
    layout: LayoutConfig,
}

impl Checkout {
    pub fn new(
        store: Arc<LocalStore>,
        backend: Arc<dyn RemoteBackend>,
        events: EventBus,
        printer: Arc<dyn PrintSink>,
    ) -> Self {
        Self {
            store,
            backend,
            events,
            printer,
            layout: LayoutConfig::default(),
        }
    }

    pub fn with_layout(mut self, layout: LayoutConfig) -> Self {
        self.layout = layout;
        self
    }

    pub async fn place_order(&self, request: CheckoutRequest) -> Result<PlacementOutcome> {
        request.validate()?;
        let amounts = compute_amounts(
            &request.cart,
            request.order_type,
            request.tax_percent,
            request.delivery_charge,
        );

        let mut lost_race = false;
        let (table, placed) = loop {
            let (table, resolution) = match request.table_id.as_deref() {
                Some(table_id) if request.order_type == OrderType::DineIn => {
                    let (table, resolution) = self.resolve(table_id).await?;
                    (Some(table), resolution)
                }
                _ => (None, Resolution::Create { replaces: None }),
            };
            debug!(?resolution, "Placement resolved");

            let placed = match resolution {
                Resolution::Create { replaces } => {
                    self.create(&request, &amounts, table.as_ref(), replaces.as_deref())
                        .await
                }
                Resolution::MergeLocal(order) => self.merge_local(order, &request, &amounts).await,
                Resolution::MergeRemote { order_id, order } => {
                    self.merge_remote(&order_id, order, &request, &amounts).await
                }
            };
            match placed {
                Err(PosError::TableOccupied(table_id)) if !lost_race => {
                    info!(table_id = %table_id, "Table taken while placing, merging instead");
                    lost_race = true;
                }
                other => break (table, other?),
            }
        };

        let receipt = table.map(|t| {
            let payment_method = request.payment_method.or_else(|| {
                self.store
                    .get::<Order>(&placed.order_id)
                    .ok()
                    .flatten()
                    .and_then(|o| o.payment_method)
            });
            let receipt = Receipt {
                order_id: placed.order_id.clone(),
                table_number: Some(t.table_number),
                groups: self.receipt_groups(&placed.items),
                totals: amounts.receipt_lines(),
                order_total: placed.order_total.filter(|_| placed.merged),
                payment_method,
                merged: placed.merged,
                created_at: Utc::now(),
            };
            let text = format_receipt(&receipt, &self.layout);
            if let Err(e) = self.printer.print(&placed.order_id, &text) {
                warn!(order_id = %placed.order_id, error = %e, "Receipt print failed");
            }
            receipt
        });

        info!(
            order_id = %placed.order_id,
            merged = placed.merged,
            synced = placed.synced,
            total = %amounts.total,
            "Order placed"
        );
        self.events.emit(SyncEvent::OrderPlaced {
            order_id: placed.order_id.clone(),
            merged: placed.merged,
            synced: placed.synced,
        });

        Ok(PlacementOutcome {
            order_id: placed.order_id,
            merged: placed.merged,
            synced: placed.synced,
            receipt,
        })
    }

    /// Group placed items by menu category, in menu order. Items whose
    /// category is not cached go last under "Other".
    fn receipt_groups(&self, items: &[OrderItem]) -> Vec<ReceiptGroup> {
        let categories: HashMap<String, MenuCategory> = self
            .store
            .get_all::<MenuCategory>(None)
            .unwrap_or_else(|e| {
                warn!(error = %e, "Could not read menu categories for receipt");
                Vec::new()
            })
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect();

        let mut groups: Vec<(i64, ReceiptGroup)> = Vec::new();
        for item in items {
            let category = self
                .store
                .get::<MenuItem>(&item.menu_item_id)
                .ok()
                .flatten()
                .and_then(|m| categories.get(&m.category_id));
            let (rank, name) = match category {
                Some(c) => (c.display_order, c.name.clone()),
                None => (i64::MAX, "Other".to_string()),
            };
            let line = ReceiptItem {
                menu_item_id: item.menu_item_id.clone(),
                name: item.name.clone(),
                quantity: item.quantity,
                unit_price: item.unit_price,
                total: item.total_price,
            };
            match groups.iter_mut().find(|(_, g)| g.category == name) {
                Some((_, group)) => group.push(line),
                None => {
                    let mut group = ReceiptGroup {
                        category: name,
                        items: Vec::new(),
                    };
                    group.push(line);
                    groups.push((rank, group));
                }
            }
        }
        groups.sort_by_key(|(rank, _)| *rank);
        groups.into_iter().map(|(_, g)| g).collect()
    }

    /// Decide between a new order and a merge for a dine-in table.
    async fn resolve(&self, table_id: &str) -> Result<(RestaurantTable, Resolution)> {
        let table = self
            .store
            .get::<RestaurantTable>(table_id)?
            .ok_or_else(|| PosError::NotFound(format!("table {table_id}")))?;

        if table.status != TableStatus::Occupied {
            return Ok((table, Resolution::Create { replaces: None }));
        }
        let Some(order_id) = table.current_order_id.clone() else {
            warn!(table_id, "Table occupied without an order, taking it over");
            return Ok((table, Resolution::Create { replaces: None }));
        };

        if let Some(local) = self.store.get::<Order>(&order_id)? {
            let resolution = if local.status == OrderStatus::Pending {
                Resolution::MergeLocal(local)
            } else {
                Resolution::Create {
                    replaces: Some(order_id),
                }
            };
            return Ok((table, resolution));
        }

        let resolution =
            match fetch_one_typed::<Order>(self.backend.as_ref(), Table::Orders, &order_id).await {
                Ok(Some(remote)) if remote.status == OrderStatus::Pending => {
                    Resolution::MergeRemote {
                        order_id,
                        order: Some(remote),
                    }
                }
                Ok(_) => {
                    debug!(table_id, order_id = %order_id, "Table points at a closed order");
                    Resolution::Create {
                        replaces: Some(order_id),
                    }
                }
                Err(e) => {
                    debug!(table_id, error = %e, "Backend unavailable, trusting table occupancy");
                    Resolution::MergeRemote {
                        order_id,
                        order: None,
                    }
                }
            };
        Ok((table, resolution))
    }

    async fn create(
        &self,
        request: &CheckoutRequest,
        amounts: &Amounts,
        table: Option<&RestaurantTable>,
        replaces: Option<&str>,
    ) -> Result<Placed> {
        let now = Utc::now();
        let order_id = Uuid::new_v4().to_string();
        let dine_in = request.order_type == OrderType::DineIn;
        let mut order = Order {
            id: order_id.clone(),
            status: if dine_in {
                OrderStatus::Pending
            } else {
                OrderStatus::Completed
            },
            order_type: request.order_type,
            subtotal: amounts.subtotal,
            tax: amounts.tax,
            delivery_charges: amounts.delivery_charges,
            total_amount: amounts.total,
            table_id: table.map(|t| t.id.clone()),
            customer_name: request.customer.name.clone(),
            customer_phone: request.customer.phone.clone(),
            customer_address: request.customer.address.clone(),
            payment_method: request.payment_method,
            synced: false,
            created_at: now,
            updated_at: now,
        };
        let items = order_items(&order_id, &request.cart);

        self.store.transaction(|tx| {
            put_record(tx, &order)?;
            for item in &items {
                put_record(tx, item)?;
            }
            if let Some(table) = table {
                let claimed = tx.execute(
                    "UPDATE restaurant_tables
                     SET status = 'occupied', current_order_id = ?1
                     WHERE id = ?2 AND (status != 'occupied' OR current_order_id IS ?3)",
                    params![order.id, table.id, replaces],
                )?;
                if claimed == 0 {
                    return Err(PosError::TableOccupied(table.id.clone()));
                }
            }
            Ok(())
        })?;

        let synced = match mirror_order(self.backend.as_ref(), &order, &items).await {
            Ok(()) => {
                order.synced = true;
                match self.store.put(&order) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(order_id = %order_id, error = %e, "Mirrored order could not be flagged");
                        false
                    }
                }
            }
            Err(e) => {
                info!(order_id = %order_id, error = %e, "Order queued for upload");
                false
            }
        };

        Ok(Placed {
            order_id,
            merged: false,
            synced,
            items,
            order_total: Some(order.total_amount),
        })
    }

    /// Merge into an open order held locally.
    async fn merge_local(
        &self,
        order: Order,
        request: &CheckoutRequest,
        amounts: &Amounts,
    ) -> Result<Placed> {
        let items = order_items(&order.id, &request.cart);
        let delta = amounts.delta(&order.id);
        let mut updated = order.clone();
        delta.apply(&mut updated);

        self.store.transaction(|tx| {
            put_record(tx, &updated)?;
            for item in &items {
                put_record(tx, item)?;
            }
            Ok(())
        })?;

        // An order that never reached the backend is uploaded whole later.
        let synced = if order.synced {
            self.mirror_merge(&delta, &items).await?
        } else {
            false
        };

        Ok(Placed {
            order_id: updated.id.clone(),
            merged: true,
            synced,
            items,
            order_total: Some(updated.total_amount),
        })
    }

    /// Merge into an open order the local store does not hold.
    async fn merge_remote(
        &self,
        order_id: &str,
        order: Option<Order>,
        request: &CheckoutRequest,
        amounts: &Amounts,
    ) -> Result<Placed> {
        let items = order_items(order_id, &request.cart);
        let delta = amounts.delta(order_id);

        let (synced, order_total) = match order {
            Some(mut remote) => {
                let synced = self.mirror_merge(&delta, &items).await?;
                delta.apply(&mut remote);
                (synced, Some(remote.total_amount))
            }
            None => {
                self.enqueue_merge(&delta, &items)?;
                (false, None)
            }
        };

        Ok(Placed {
            order_id: order_id.to_string(),
            merged: true,
            synced,
            items,
            order_total,
        })
    }

    /// Push merged items and the totals increase to the backend; queue them
    /// in the outbox if that fails.
    async fn mirror_merge(&self, delta: &OrderTotalsDelta, items: &[OrderItem]) -> Result<bool> {
        match self.push_merge(delta, items).await {
            Ok(()) => Ok(true),
            Err(e) => {
                info!(order_id = %delta.order_id, error = %e, "Merge queued in outbox");
                self.enqueue_merge(delta, items)?;
                Ok(false)
            }
        }
    }

    async fn push_merge(&self, delta: &OrderTotalsDelta, items: &[OrderItem]) -> Result<()> {
        let backend = self.backend.as_ref();
        for item in items {
            backend
                .upsert(Table::OrderItems, &serde_json::to_value(item)?)
                .await?;
        }
        let mut remote: Order = fetch_one_typed(backend, Table::Orders, &delta.order_id)
            .await?
            .ok_or_else(|| RemoteError::NotFound {
                collection: Table::Orders.to_string(),
                id: delta.order_id.clone(),
            })?;
        delta.apply(&mut remote);
        backend
            .update(Table::Orders, &remote.id, &totals_patch(&remote))
            .await?;
        Ok(())
    }

    fn enqueue_merge(&self, delta: &OrderTotalsDelta, items: &[OrderItem]) -> Result<()> {
        let mut entries: Vec<OutboxEntry> = items
            .iter()
            .map(|i| OutboxEntry::new(OutboxAction::Create, OutboxRecord::OrderItems(i.clone())))
            .collect();
        entries.push(OutboxEntry::new(
            OutboxAction::Update,
            OutboxRecord::OrderTotals(delta.clone()),
        ));
        for entry in &entries {
            entry.validate()?;
        }
        self.store.transaction(|tx| {
            for entry in &entries {
                put_record(tx, entry)?;
            }
            Ok(())
        })?;
        debug!(order_id = %delta.order_id, entries = entries.len(), "Merge queued");
        Ok(())
    }
}

fn order_items(order_id: &str, cart: &Cart) -> Vec<OrderItem> {
    cart.lines()
        .iter()
        .map(|l| OrderItem::new(order_id, &l.menu_item_id, &l.name, l.quantity, l.unit_price))
        .collect()
}

// ===========================================================================
// Tests
// ===========================================================================
