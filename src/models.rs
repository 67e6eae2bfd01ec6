//! Order and sync-queue data types.
//!
//! Monetary fields are computed once when a draft is priced and are stored
//! verbatim afterwards; nothing in the sync path recomputes them from items.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};

/// Prefix marking an id assigned on this device before the remote store
/// confirmed the order.
pub const LOCAL_ID_PREFIX: &str = "local-";

/// Collection name recorded on queue entries.
pub const ORDERS_TABLE: &str = "orders";

const GST_RATE: f64 = 0.05;
const LARGE_SIZE_SURCHARGE: f64 = 10.0;
const EXTRA_GINGER_PRICE: f64 = 5.0;
const EXTRA_ELAICHI_PRICE: f64 = 3.0;

/// True when `id` is a local-provisional id still awaiting its remote create.
pub fn is_provisional_id(id: &str) -> bool {
    id.starts_with(LOCAL_ID_PREFIX)
}

/// Build a provisional id: `local-<unix millis>-<9 random chars>`.
pub fn new_provisional_id(now: DateTime<Utc>) -> String {
    let suffix: String = Uuid::new_v4().simple().to_string().chars().take(9).collect();
    format!("{LOCAL_ID_PREFIX}{}-{suffix}", now.timestamp_millis())
}

/// Canonical text form for timestamps stored in SQLite. Fixed width, so
/// lexical order matches chronological order.
pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_timestamp(raw: &str) -> SyncResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SyncError::Corrupt(format!("invalid stored timestamp {raw:?}: {e}")))
}

// ---------------------------------------------------------------------------
// Order status
// ---------------------------------------------------------------------------

/// Kitchen workflow status. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    New,
    Preparing,
    Ready,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::New => "new",
            OrderStatus::Preparing => "preparing",
            OrderStatus::Ready => "ready",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Ready)
    }

    /// Whether moving from `self` to `next` is allowed. Staying put is
    /// allowed; going backwards is not.
    pub fn can_advance_to(&self, next: OrderStatus) -> bool {
        next >= *self
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "new" => Ok(OrderStatus::New),
            "preparing" => Ok(OrderStatus::Preparing),
            "ready" => Ok(OrderStatus::Ready),
            other => Err(SyncError::Corrupt(format!("unknown order status: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Line items
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Size {
    Small,
    #[default]
    Medium,
    Large,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SugarLevel {
    NoSugar,
    LessSugar,
    #[default]
    Regular,
    ExtraSugar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddOns {
    #[serde(default)]
    pub extra_ginger: bool,
    #[serde(default)]
    pub extra_elaichi: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderModifiers {
    #[serde(default)]
    pub sugar_level: SugarLevel,
    #[serde(default)]
    pub size: Size,
    #[serde(default)]
    pub add_ons: AddOns,
}

impl OrderModifiers {
    /// Unit price of a menu item once size and add-on surcharges apply.
    pub fn unit_price(&self, base_price: f64) -> f64 {
        let mut price = base_price;
        if self.size == Size::Large {
            price += LARGE_SIZE_SURCHARGE;
        }
        if self.add_ons.extra_ginger {
            price += EXTRA_GINGER_PRICE;
        }
        if self.add_ons.extra_elaichi {
            price += EXTRA_ELAICHI_PRICE;
        }
        price
    }
}

/// A menu entry as sold at checkout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MenuItem {
    pub id: i64,
    pub name: String,
    pub price: f64,
    #[serde(default)]
    pub category: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    #[serde(flatten)]
    pub menu_item: MenuItem,
    pub quantity: u32,
    #[serde(default)]
    pub modifiers: OrderModifiers,
    /// Line total, fixed when the line was added.
    pub item_total: f64,
}

impl OrderItem {
    pub fn new(menu_item: MenuItem, modifiers: OrderModifiers, quantity: u32) -> Self {
        let item_total = modifiers.unit_price(menu_item.price) * f64::from(quantity);
        Self {
            menu_item,
            quantity,
            modifiers,
            item_total,
        }
    }
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

/// Monetary breakdown computed once at checkout.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrderTotals {
    pub subtotal: f64,
    pub discount_percentage: f64,
    pub discount_amount: f64,
    pub gst: f64,
    pub total: f64,
}

impl OrderTotals {
    pub fn compute(subtotal: f64, discount_percentage: f64) -> Self {
        let discount_percentage = discount_percentage.clamp(0.0, 100.0);
        let discount_amount = subtotal * discount_percentage / 100.0;
        let gst = (subtotal - discount_amount) * GST_RATE;
        Self {
            subtotal,
            discount_percentage,
            discount_amount,
            gst,
            total: subtotal - discount_amount + gst,
        }
    }
}

/// A fully priced order that has not been given an identity yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderDraft {
    pub items: Vec<OrderItem>,
    pub subtotal: f64,
    pub discount_percentage: f64,
    pub discount_amount: f64,
    pub gst: f64,
    pub total: f64,
    #[serde(default)]
    pub payment_method: String,
}

impl OrderDraft {
    /// Price a cart of line items.
    pub fn from_items(
        items: Vec<OrderItem>,
        discount_percentage: f64,
        payment_method: impl Into<String>,
    ) -> Self {
        let subtotal = items.iter().map(|item| item.item_total).sum();
        Self::with_totals(items, OrderTotals::compute(subtotal, discount_percentage), payment_method)
    }

    /// Price an order from an already-known subtotal (no line breakdown).
    pub fn from_subtotal(
        subtotal: f64,
        discount_percentage: f64,
        payment_method: impl Into<String>,
    ) -> Self {
        Self::with_totals(
            Vec::new(),
            OrderTotals::compute(subtotal, discount_percentage),
            payment_method,
        )
    }

    fn with_totals(
        items: Vec<OrderItem>,
        totals: OrderTotals,
        payment_method: impl Into<String>,
    ) -> Self {
        Self {
            items,
            subtotal: totals.subtotal,
            discount_percentage: totals.discount_percentage,
            discount_amount: totals.discount_amount,
            gst: totals.gst,
            total: totals.total,
            payment_method: payment_method.into(),
        }
    }

    /// Attach identity, display number and creation time.
    pub fn into_order(self, id: String, order_number: i64, timestamp: DateTime<Utc>) -> Order {
        Order {
            id,
            order_number,
            items: self.items,
            subtotal: self.subtotal,
            discount_percentage: self.discount_percentage,
            discount_amount: self.discount_amount,
            gst: self.gst,
            total: self.total,
            status: OrderStatus::New,
            timestamp,
            payment_method: self.payment_method,
        }
    }
}

/// The unit of synchronized state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: String,
    pub order_number: i64,
    pub items: Vec<OrderItem>,
    pub subtotal: f64,
    pub discount_percentage: f64,
    pub discount_amount: f64,
    pub gst: f64,
    pub total: f64,
    pub status: OrderStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payment_method: String,
}

impl Order {
    pub fn is_provisional(&self) -> bool {
        is_provisional_id(&self.id)
    }

    /// Same content under another id.
    pub fn with_id(&self, id: impl Into<String>) -> Order {
        Order {
            id: id.into(),
            ..self.clone()
        }
    }
}

/// Body sent to the remote store on create: the order minus its id.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteOrderBody<'a> {
    pub order_number: i64,
    pub items: &'a [OrderItem],
    pub subtotal: f64,
    pub discount_percentage: f64,
    pub discount_amount: f64,
    pub gst: f64,
    pub total: f64,
    pub status: OrderStatus,
    pub timestamp: DateTime<Utc>,
    pub payment_method: &'a str,
}

impl<'a> From<&'a Order> for RemoteOrderBody<'a> {
    fn from(order: &'a Order) -> Self {
        Self {
            order_number: order.order_number,
            items: &order.items,
            subtotal: order.subtotal,
            discount_percentage: order.discount_percentage,
            discount_amount: order.discount_amount,
            gst: order.gst,
            total: order.total,
            status: order.status,
            timestamp: order.timestamp,
            payment_method: &order.payment_method,
        }
    }
}

// ---------------------------------------------------------------------------
// Sync queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(OperationKind::Create),
            "update" => Ok(OperationKind::Update),
            "delete" => Ok(OperationKind::Delete),
            other => Err(SyncError::Corrupt(format!("unknown queue operation: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub id: String,
    pub status: OrderStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRef {
    pub id: String,
}

/// Operation-specific data carried by a queue entry.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationPayload {
    Create(Order),
    Update(StatusChange),
    Delete(OrderRef),
}

impl OperationPayload {
    pub fn kind(&self) -> OperationKind {
        match self {
            OperationPayload::Create(_) => OperationKind::Create,
            OperationPayload::Update(_) => OperationKind::Update,
            OperationPayload::Delete(_) => OperationKind::Delete,
        }
    }

    /// Id of the order this operation targets.
    pub fn order_id(&self) -> &str {
        match self {
            OperationPayload::Create(order) => &order.id,
            OperationPayload::Update(change) => &change.id,
            OperationPayload::Delete(target) => &target.id,
        }
    }

    pub fn set_order_id(&mut self, id: &str) {
        match self {
            OperationPayload::Create(order) => order.id = id.to_string(),
            OperationPayload::Update(change) => change.id = id.to_string(),
            OperationPayload::Delete(target) => target.id = id.to_string(),
        }
    }

    pub fn to_json(&self) -> SyncResult<String> {
        let raw = match self {
            OperationPayload::Create(order) => serde_json::to_string(order)?,
            OperationPayload::Update(change) => serde_json::to_string(change)?,
            OperationPayload::Delete(target) => serde_json::to_string(target)?,
        };
        Ok(raw)
    }

    pub fn from_json(kind: OperationKind, raw: &str) -> SyncResult<Self> {
        let payload = match kind {
            OperationKind::Create => OperationPayload::Create(serde_json::from_str(raw)?),
            OperationKind::Update => OperationPayload::Update(serde_json::from_str(raw)?),
            OperationKind::Delete => OperationPayload::Delete(serde_json::from_str(raw)?),
        };
        Ok(payload)
    }
}

/// An intent not yet confirmed by the remote store.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedOperation {
    pub id: i64,
    pub table: String,
    pub payload: OperationPayload,
    pub timestamp: DateTime<Utc>,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

impl QueuedOperation {
    pub fn operation(&self) -> OperationKind {
        self.payload.kind()
    }
}

/// A queue entry dropped after exhausting its retries.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub id: i64,
    pub table: String,
    pub payload: OperationPayload,
    pub timestamp: DateTime<Utc>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub dropped_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    fn chai() -> MenuItem {
        MenuItem {
            id: 1,
            name: "Chai".into(),
            price: 20.0,
            category: "hot_drinks".into(),
        }
    }

    #[test]
    fn test_totals_with_discount_and_gst() {
        let totals = OrderTotals::compute(100.0, 10.0);
        assert!(approx(totals.discount_amount, 10.0));
        assert!(approx(totals.gst, 4.5));
        assert!(approx(totals.total, 94.5));
    }

    #[test]
    fn test_discount_is_clamped() {
        let over = OrderTotals::compute(50.0, 150.0);
        assert!(approx(over.discount_percentage, 100.0));
        assert!(approx(over.total, 0.0));

        let under = OrderTotals::compute(50.0, -5.0);
        assert!(approx(under.discount_amount, 0.0));
        assert!(approx(under.total, 52.5));
    }

    #[test]
    fn test_item_price_includes_modifiers() {
        let modifiers = OrderModifiers {
            sugar_level: SugarLevel::LessSugar,
            size: Size::Large,
            add_ons: AddOns {
                extra_ginger: true,
                extra_elaichi: true,
            },
        };
        let item = OrderItem::new(chai(), modifiers, 2);
        // (20 + 10 + 5 + 3) * 2
        assert!(approx(item.item_total, 76.0));
    }

    #[test]
    fn test_draft_from_items_sums_lines() {
        let plain = OrderItem::new(chai(), OrderModifiers::default(), 3);
        let large = OrderItem::new(
            chai(),
            OrderModifiers {
                size: Size::Large,
                ..OrderModifiers::default()
            },
            1,
        );
        let draft = OrderDraft::from_items(vec![plain, large], 0.0, "cash");
        assert!(approx(draft.subtotal, 90.0));
        assert!(approx(draft.gst, 4.5));
        assert!(approx(draft.total, 94.5));
        assert_eq!(draft.payment_method, "cash");
    }

    #[test]
    fn test_status_only_moves_forward() {
        assert!(OrderStatus::New.can_advance_to(OrderStatus::Preparing));
        assert!(OrderStatus::Preparing.can_advance_to(OrderStatus::Ready));
        assert!(OrderStatus::New.can_advance_to(OrderStatus::Ready));
        assert!(OrderStatus::Ready.can_advance_to(OrderStatus::Ready));
        assert!(!OrderStatus::Ready.can_advance_to(OrderStatus::Preparing));
        assert!(!OrderStatus::Preparing.can_advance_to(OrderStatus::New));
        assert!(OrderStatus::Ready.is_terminal());
    }

    #[test]
    fn test_provisional_id_format() {
        let now = Utc::now();
        let id = new_provisional_id(now);
        assert!(is_provisional_id(&id));
        let rest = id.strip_prefix(LOCAL_ID_PREFIX).unwrap();
        let (millis, suffix) = rest.split_once('-').unwrap();
        assert_eq!(millis.parse::<i64>().unwrap(), now.timestamp_millis());
        assert_eq!(suffix.len(), 9);
        assert_ne!(id, new_provisional_id(now));
        assert!(!is_provisional_id("-NxA9remote"));
    }

    #[test]
    fn test_order_json_uses_camel_case() {
        let order = OrderDraft::from_subtotal(10.0, 0.0, "card").into_order(
            "abc".into(),
            7,
            Utc::now(),
        );
        let json = serde_json::to_value(&order).unwrap();
        assert_eq!(json["orderNumber"], 7);
        assert_eq!(json["status"], "new");
        assert!(json.get("discountPercentage").is_some());

        let item = OrderItem::new(chai(), OrderModifiers::default(), 1);
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["id"], 1);
        assert_eq!(json["modifiers"]["sugarLevel"], "regular");
        assert_eq!(json["modifiers"]["addOns"]["extraGinger"], false);
    }

    #[test]
    fn test_remote_body_omits_id() {
        let order = OrderDraft::from_subtotal(10.0, 0.0, "card").into_order(
            "local-1-abc".into(),
            1,
            Utc::now(),
        );
        let json = serde_json::to_value(RemoteOrderBody::from(&order)).unwrap();
        assert!(json.get("id").is_none());
        assert_eq!(json["orderNumber"], 1);
    }

    #[test]
    fn test_payload_json_follows_operation_kind() {
        let update = OperationPayload::Update(StatusChange {
            id: "o1".into(),
            status: OrderStatus::Preparing,
        });
        let raw = update.to_json().unwrap();
        assert_eq!(raw, r#"{"id":"o1","status":"preparing"}"#);
        let decoded = OperationPayload::from_json(OperationKind::Update, &raw).unwrap();
        assert_eq!(decoded, update);
        assert!(OperationPayload::from_json(OperationKind::Create, &raw).is_err());
    }

    #[test]
    fn test_timestamp_text_sorts_chronologically() {
        let early = parse_timestamp("2026-01-02T03:04:05.006Z").unwrap();
        let late = early + chrono::Duration::milliseconds(994);
        assert!(format_timestamp(&early) < format_timestamp(&late));
        assert_eq!(parse_timestamp(&format_timestamp(&early)).unwrap(), early);
    }
}
