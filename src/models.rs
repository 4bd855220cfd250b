//! Domain records cached and produced by the POS terminal.
//!
//! Reference data (categories, items, tables, waiters) is downloaded from the
//! remote backend and replaced wholesale. Orders and order items are created
//! locally with client-generated UUIDs so they can be mirrored one-to-one to
//! the backend without id remapping.

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{PosError, Result};

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

/// Every table known to the local store. All but `Outbox` and `Settings` are
/// also collections on the remote backend under the same name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    MenuCategories,
    MenuItems,
    RestaurantTables,
    Waiters,
    Orders,
    OrderItems,
    Outbox,
    Settings,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::MenuCategories => "menu_categories",
            Table::MenuItems => "menu_items",
            Table::RestaurantTables => "restaurant_tables",
            Table::Waiters => "waiters",
            Table::Orders => "orders",
            Table::OrderItems => "order_items",
            Table::Outbox => "outbox",
            Table::Settings => "settings",
        }
    }

    /// Reference collections refreshed by the downloader.
    pub const REFERENCE: [Table; 4] = [
        Table::MenuCategories,
        Table::MenuItems,
        Table::RestaurantTables,
        Table::Waiters,
    ];
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Enums stored as TEXT
// ---------------------------------------------------------------------------

macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }

            pub fn parse(raw: &str) -> Option<Self> {
                match raw.trim() {
                    $($text => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TableStatus {
    #[default]
    Available,
    Occupied,
    Reserved,
}

text_enum!(TableStatus {
    Available => "available",
    Occupied => "occupied",
    Reserved => "reserved",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    #[default]
    Pending,
    Completed,
    Cancelled,
}

text_enum!(OrderStatus {
    Pending => "pending",
    Completed => "completed",
    Cancelled => "cancelled",
});

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderStatus::Pending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    #[serde(rename = "dine-in", alias = "dine_in")]
    DineIn,
    #[serde(rename = "delivery")]
    Delivery,
    #[serde(rename = "takeaway", alias = "pickup")]
    Takeaway,
}

text_enum!(OrderType {
    DineIn => "dine-in",
    Delivery => "delivery",
    Takeaway => "takeaway",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Cash,
    Card,
    Mixed,
}

text_enum!(PaymentMethod {
    Cash => "cash",
    Card => "card",
    Mixed => "mixed",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxAction {
    Create,
    Update,
    Delete,
}

text_enum!(OutboxAction {
    Create => "create",
    Update => "update",
    Delete => "delete",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    #[default]
    Pending,
    Syncing,
    Failed,
}

text_enum!(OutboxStatus {
    Pending => "pending",
    Syncing => "syncing",
    Failed => "failed",
});

// ---------------------------------------------------------------------------
// Money
// ---------------------------------------------------------------------------

/// Round an amount to cents, midpoint away from zero.
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Reference data
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MenuCategory {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub display_order: i64,
    #[serde(default = "default_true", alias = "is_active")]
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MenuItem {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub price: Decimal,
    pub category_id: String,
    #[serde(default)]
    pub image_url: Option<String>,
    /// Inline `data:` thumbnail for offline display. Local only.
    #[serde(default, skip_serializing)]
    pub compressed_image: Option<String>,
    #[serde(default = "default_true", alias = "is_available")]
    pub available: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestaurantTable {
    pub id: String,
    pub table_number: i64,
    #[serde(default)]
    pub capacity: i64,
    #[serde(default)]
    pub status: TableStatus,
    #[serde(default)]
    pub current_order_id: Option<String>,
    #[serde(default)]
    pub waiter_id: Option<String>,
}

impl RestaurantTable {
    pub fn occupy(&mut self, order_id: &str) {
        self.status = TableStatus::Occupied;
        self.current_order_id = Some(order_id.to_string());
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Waiter {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default = "default_true", alias = "is_active")]
    pub active: bool,
    #[serde(default, alias = "is_on_duty")]
    pub on_duty: bool,
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub status: OrderStatus,
    pub order_type: OrderType,
    pub subtotal: Decimal,
    pub tax: Decimal,
    #[serde(default)]
    pub delivery_charges: Option<Decimal>,
    pub total_amount: Decimal,
    #[serde(default)]
    pub table_id: Option<String>,
    #[serde(default)]
    pub customer_name: Option<String>,
    #[serde(default)]
    pub customer_phone: Option<String>,
    #[serde(default)]
    pub customer_address: Option<String>,
    #[serde(default)]
    pub payment_method: Option<PaymentMethod>,
    /// Mirrored to the remote backend. Local bookkeeping only.
    #[serde(default, skip_serializing)]
    pub synced: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// `total_amount == subtotal + tax + delivery_charges` to the cent.
    pub fn amounts_consistent(&self) -> bool {
        let expected =
            round_money(self.subtotal + self.tax + self.delivery_charges.unwrap_or_default());
        round_money(self.total_amount) == expected
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: String,
    pub order_id: String,
    pub menu_item_id: String,
    #[serde(default)]
    pub name: String,
    pub quantity: i64,
    pub unit_price: Decimal,
    pub total_price: Decimal,
}

impl OrderItem {
    pub fn new(
        order_id: &str,
        menu_item_id: &str,
        name: &str,
        quantity: i64,
        unit_price: Decimal,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            order_id: order_id.to_string(),
            menu_item_id: menu_item_id.to_string(),
            name: name.to_string(),
            quantity,
            unit_price,
            total_price: round_money(unit_price * Decimal::from(quantity)),
        }
    }
}

/// Amounts added to an existing order by a table merge.
///
/// Replayed against the remote row as read-modify-write, because the local
/// terminal may not hold the order's current totals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderTotalsDelta {
    pub order_id: String,
    pub subtotal: Decimal,
    pub tax: Decimal,
    #[serde(default)]
    pub delivery_charges: Decimal,
    pub total_amount: Decimal,
}

impl OrderTotalsDelta {
    pub fn apply(&self, order: &mut Order) {
        order.subtotal = round_money(order.subtotal + self.subtotal);
        order.tax = round_money(order.tax + self.tax);
        if !self.delivery_charges.is_zero() {
            order.delivery_charges = Some(round_money(
                order.delivery_charges.unwrap_or_default() + self.delivery_charges,
            ));
        }
        order.total_amount = round_money(order.total_amount + self.total_amount);
        order.updated_at = Utc::now();
    }
}

// ---------------------------------------------------------------------------
// Outbox
// ---------------------------------------------------------------------------

/// Payload of an outbox entry, tagged by the table it targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "table", content = "data", rename_all = "snake_case")]
pub enum OutboxRecord {
    MenuCategories(MenuCategory),
    MenuItems(MenuItem),
    RestaurantTables(RestaurantTable),
    Waiters(Waiter),
    Orders(Order),
    OrderItems(OrderItem),
    #[serde(rename = "order_totals")]
    OrderTotals(OrderTotalsDelta),
}

impl OutboxRecord {
    pub fn table(&self) -> Table {
        match self {
            OutboxRecord::MenuCategories(_) => Table::MenuCategories,
            OutboxRecord::MenuItems(_) => Table::MenuItems,
            OutboxRecord::RestaurantTables(_) => Table::RestaurantTables,
            OutboxRecord::Waiters(_) => Table::Waiters,
            OutboxRecord::Orders(_) | OutboxRecord::OrderTotals(_) => Table::Orders,
            OutboxRecord::OrderItems(_) => Table::OrderItems,
        }
    }

    pub fn target_id(&self) -> &str {
        match self {
            OutboxRecord::MenuCategories(r) => &r.id,
            OutboxRecord::MenuItems(r) => &r.id,
            OutboxRecord::RestaurantTables(r) => &r.id,
            OutboxRecord::Waiters(r) => &r.id,
            OutboxRecord::Orders(r) => &r.id,
            OutboxRecord::OrderItems(r) => &r.id,
            OutboxRecord::OrderTotals(r) => &r.order_id,
        }
    }

    /// Row body sent to the remote collection.
    pub fn remote_row(&self) -> Result<serde_json::Value> {
        let value = match self {
            OutboxRecord::MenuCategories(r) => serde_json::to_value(r)?,
            OutboxRecord::MenuItems(r) => serde_json::to_value(r)?,
            OutboxRecord::RestaurantTables(r) => serde_json::to_value(r)?,
            OutboxRecord::Waiters(r) => serde_json::to_value(r)?,
            OutboxRecord::Orders(r) => serde_json::to_value(r)?,
            OutboxRecord::OrderItems(r) => serde_json::to_value(r)?,
            OutboxRecord::OrderTotals(r) => serde_json::to_value(r)?,
        };
        Ok(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: String,
    pub action: OutboxAction,
    pub record: OutboxRecord,
    #[serde(default)]
    pub status: OutboxStatus,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl OutboxEntry {
    pub fn new(action: OutboxAction, record: OutboxRecord) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            action,
            record,
            status: OutboxStatus::Pending,
            retries: 0,
            last_error: None,
            created_at: Utc::now(),
        }
    }

    pub fn table(&self) -> Table {
        self.record.table()
    }

    /// Reject action/payload combinations that cannot be replayed.
    pub fn validate(&self) -> Result<()> {
        match (&self.action, &self.record) {
            (OutboxAction::Update, OutboxRecord::OrderTotals(delta)) => {
                if delta.order_id.trim().is_empty() {
                    return Err(PosError::Validation(
                        "order totals delta without order id".into(),
                    ));
                }
            }
            (_, OutboxRecord::OrderTotals(_)) => {
                return Err(PosError::Validation(format!(
                    "order totals delta cannot be replayed as {}",
                    self.action
                )));
            }
            (OutboxAction::Create | OutboxAction::Update, OutboxRecord::OrderItems(item))
                if item.quantity <= 0 =>
            {
                return Err(PosError::Validation(format!(
                    "order item {} has non-positive quantity",
                    item.id
                )));
            }
            _ => {}
        }
        if self.record.target_id().trim().is_empty() {
            return Err(PosError::Validation(format!(
                "{} outbox entry without target id",
                self.table()
            )));
        }
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
