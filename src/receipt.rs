//! Customer receipts for dine-in placements.
//!
//! A placement produces a [`Receipt`] document, which is laid out as plain
//! monospace text and handed to a [`PrintSink`]. Driving an actual printer is
//! the sink's business.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing::info;

use crate::error::Result;
use crate::models::PaymentMethod;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptItem {
    pub menu_item_id: String,
    pub name: String,
    pub quantity: i64,
    pub unit_price: Decimal,
    pub total: Decimal,
}

/// Items of one menu category, in the order they are printed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptGroup {
    pub category: String,
    pub items: Vec<ReceiptItem>,
}

impl ReceiptGroup {
    /// Add a line, folding it into an existing line for the same menu item.
    pub fn push(&mut self, item: ReceiptItem) {
        match self
            .items
            .iter_mut()
            .find(|i| i.menu_item_id == item.menu_item_id && i.unit_price == item.unit_price)
        {
            Some(line) => {
                line.quantity += item.quantity;
                line.total += item.total;
            }
            None => self.items.push(item),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TotalsLine {
    pub label: String,
    pub amount: Decimal,
    #[serde(default)]
    pub emphasize: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub order_id: String,
    #[serde(default)]
    pub table_number: Option<i64>,
    /// Items added by this placement only, grouped by menu category.
    pub groups: Vec<ReceiptGroup>,
    /// Amounts of this placement.
    pub totals: Vec<TotalsLine>,
    /// Running total of the whole order, set when items were added to an
    /// existing order whose total is known.
    #[serde(default)]
    pub order_total: Option<Decimal>,
    #[serde(default)]
    pub payment_method: Option<PaymentMethod>,
    pub merged: bool,
    pub created_at: DateTime<Utc>,
}

impl Receipt {
    pub fn items(&self) -> impl Iterator<Item = &ReceiptItem> {
        self.groups.iter().flat_map(|g| g.items.iter())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LayoutConfig {
    /// Characters per line (32 for 58 mm paper, 48 for 80 mm).
    pub width: usize,
    pub organization_name: String,
    pub footer_text: Option<String>,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            width: 48,
            organization_name: "The Small".to_string(),
            footer_text: Some("Thank you".to_string()),
        }
    }
}

fn money(value: Decimal) -> String {
    format!("{:.2}", value.round_dp(2))
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

fn wrap(text: &str, width: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut line = String::new();
    for token in text.split_whitespace() {
        if line.is_empty() {
            line.push_str(token);
            continue;
        }
        let next_len = line.chars().count() + 1 + token.chars().count();
        if next_len > width.max(8) {
            out.push(line);
            line = token.to_string();
        } else {
            line.push(' ');
            line.push_str(token);
        }
    }
    if !line.is_empty() {
        out.push(line);
    }
    if out.is_empty() {
        out.push(String::new());
    }
    out
}

/// Label on the left, value flush right. Long labels wrap above the value.
fn push_pair(out: &mut Vec<String>, label: &str, value: &str, width: usize) {
    let label_len = label.chars().count();
    let value_len = value.chars().count();
    if label_len + value_len < width {
        let pad = width - label_len - value_len;
        out.push(format!("{label}{}{value}", " ".repeat(pad)));
        return;
    }
    out.extend(wrap(label, width.saturating_sub(value_len + 1).max(8)));
    out.push(format!("{value:>width$}"));
}

fn push_centered(out: &mut Vec<String>, text: &str, width: usize) {
    for line in wrap(text, width) {
        let len = line.chars().count();
        let pad = width.saturating_sub(len) / 2;
        out.push(format!("{}{line}", " ".repeat(pad)));
    }
}

pub fn format_receipt(receipt: &Receipt, cfg: &LayoutConfig) -> String {
    let width = cfg.width.max(24);
    let rule = "-".repeat(width);
    let mut out = Vec::new();

    push_centered(&mut out, &cfg.organization_name, width);
    out.push(rule.clone());
    push_pair(&mut out, "Order", short_id(&receipt.order_id), width);
    if let Some(table) = receipt.table_number {
        push_pair(&mut out, "Table", &table.to_string(), width);
    }
    push_pair(
        &mut out,
        "Date",
        &receipt.created_at.format("%Y-%m-%d %H:%M").to_string(),
        width,
    );
    if receipt.merged {
        push_centered(&mut out, "** ADDED ITEMS **", width);
    }
    out.push(rule.clone());

    for (index, group) in receipt.groups.iter().enumerate() {
        if index > 0 {
            out.push(String::new());
        }
        out.push(group.category.to_uppercase());
        for item in &group.items {
            push_pair(
                &mut out,
                &format!("  {}x {}", item.quantity, item.name),
                &money(item.total),
                width,
            );
        }
    }
    out.push(rule.clone());

    for line in &receipt.totals {
        let label = if line.emphasize {
            line.label.to_uppercase()
        } else {
            line.label.clone()
        };
        push_pair(&mut out, &label, &money(line.amount), width);
    }
    if let Some(order_total) = receipt.order_total {
        push_pair(&mut out, "ORDER TOTAL", &money(order_total), width);
    }
    if let Some(method) = receipt.payment_method {
        push_pair(&mut out, "Payment", &method.as_str().to_uppercase(), width);
    }

    if let Some(footer) = cfg.footer_text.as_deref().filter(|f| !f.trim().is_empty()) {
        out.push(rule);
        push_centered(&mut out, footer, width);
    }

    let mut text = out.join("\n");
    text.push('\n');
    text
}

// ---------------------------------------------------------------------------
// Print boundary
// ---------------------------------------------------------------------------

/// Receives formatted receipt text.
pub trait PrintSink: Send + Sync {
    fn print(&self, receipt_id: &str, text: &str) -> Result<()>;
}

/// Writes each receipt as a text file into a spool directory for a print
/// spooler to pick up.
pub struct SpoolPrintSink {
    dir: PathBuf,
}

impl SpoolPrintSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl PrintSink for SpoolPrintSink {
    fn print(&self, receipt_id: &str, text: &str) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S%3f");
        let file_path = self.dir.join(format!("receipt_{receipt_id}_{timestamp}.txt"));
        fs::write(&file_path, text)?;
        info!(receipt_id, path = %file_path.display(), "Receipt spooled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, name: &str, quantity: i64, cents: i64) -> ReceiptItem {
        ReceiptItem {
            menu_item_id: id.into(),
            name: name.into(),
            quantity,
            unit_price: Decimal::new(cents, 2),
            total: Decimal::new(cents * quantity, 2),
        }
    }

    fn sample(merged: bool) -> Receipt {
        Receipt {
            order_id: "3f2a9c1e-0000-4000-8000-000000000000".into(),
            table_number: Some(7),
            groups: vec![
                ReceiptGroup {
                    category: "Mains".into(),
                    items: vec![item("item-pasta", "Pasta", 2, 1250)],
                },
                ReceiptGroup {
                    category: "Drinks".into(),
                    items: vec![item("item-cola", "Cola", 1, 250)],
                },
            ],
            totals: vec![
                TotalsLine {
                    label: "Subtotal".into(),
                    amount: Decimal::new(2750, 2),
                    emphasize: false,
                },
                TotalsLine {
                    label: "Total".into(),
                    amount: Decimal::new(3025, 2),
                    emphasize: true,
                },
            ],
            order_total: merged.then(|| Decimal::new(5525, 2)),
            payment_method: None,
            merged,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_lines_fit_paper_width() {
        let cfg = LayoutConfig {
            width: 32,
            ..LayoutConfig::default()
        };
        let text = format_receipt(&sample(false), &cfg);
        assert!(text.lines().all(|l| l.chars().count() <= 32), "{text}");
        assert!(text.contains("2x Pasta"));
        assert!(text.contains("25.00"));
        assert!(text.contains("TOTAL"));
        assert!(text.contains("3f2a9c1e"));
        assert!(!text.contains("ORDER TOTAL"));
    }

    #[test]
    fn test_merged_receipt_shows_running_total() {
        let text = format_receipt(&sample(true), &LayoutConfig::default());
        assert!(text.contains("ADDED ITEMS"));
        assert!(text.contains("ORDER TOTAL"));
        assert!(text.contains("55.25"));
    }

    #[test]
    fn test_long_item_names_wrap() {
        let mut receipt = sample(false);
        receipt.groups[0].items[0].name = "Slow roasted lamb shoulder with lemon potatoes".into();
        let cfg = LayoutConfig {
            width: 32,
            ..LayoutConfig::default()
        };
        let text = format_receipt(&receipt, &cfg);
        assert!(text.lines().all(|l| l.chars().count() <= 32));
    }

    #[test]
    fn test_groups_fold_repeated_items() {
        let mut group = ReceiptGroup {
            category: "Mains".into(),
            items: Vec::new(),
        };
        group.push(item("item-pasta", "Pasta", 2, 1250));
        group.push(item("item-salad", "Salad", 1, 800));
        group.push(item("item-pasta", "Pasta", 1, 1250));

        assert_eq!(group.items.len(), 2);
        assert_eq!(group.items[0].quantity, 3);
        assert_eq!(group.items[0].total, Decimal::new(3750, 2));
    }

    #[test]
    fn test_category_headers_and_payment_line() {
        let mut receipt = sample(false);
        receipt.payment_method = Some(PaymentMethod::Card);
        let text = format_receipt(&receipt, &LayoutConfig::default());

        let mains = text.find("MAINS").unwrap();
        let pasta = text.find("2x Pasta").unwrap();
        let drinks = text.find("DRINKS").unwrap();
        let cola = text.find("1x Cola").unwrap();
        assert!(mains < pasta && pasta < drinks && drinks < cola, "{text}");
        let payment = text.lines().find(|l| l.starts_with("Payment")).unwrap();
        assert!(payment.ends_with("CARD"));

        let unpaid = format_receipt(&sample(false), &LayoutConfig::default());
        assert!(!unpaid.contains("Payment"));
    }

    #[test]
    fn test_spool_sink_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let spool = dir.path().join("receipts");
        let sink = SpoolPrintSink::new(&spool);
        sink.print("order-1", "hello\n").unwrap();

        let files: Vec<_> = fs::read_dir(&spool)
            .unwrap()
            .flatten()
            .collect();
        assert_eq!(files.len(), 1);
        assert_eq!(fs::read_to_string(files[0].path()).unwrap(), "hello\n");
    }
}
