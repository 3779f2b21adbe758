//! Ledger event records, their typed payloads, and display categories.

use std::{collections::BTreeSet, fmt};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::types::{EventId, Money, ProductId, TimestampMs, UserId};

/// Ledger event type as stored by the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    /// Purchase at the till.
    Sale,
    /// Money added to a balance.
    Deposit,
    /// Balance overwritten by staff.
    BalanceEdit,
    /// Signed correction of an earlier sale.
    SaleAdjustment,
    /// Whole sale voided.
    SaleUndo,
}

impl EventKind {
    /// Every event kind.
    pub const ALL: [EventKind; 5] = [
        EventKind::Sale,
        EventKind::Deposit,
        EventKind::BalanceEdit,
        EventKind::SaleAdjustment,
        EventKind::SaleUndo,
    ];

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Sale => "SALE",
            EventKind::Deposit => "DEPOSIT",
            EventKind::BalanceEdit => "BALANCE_EDIT",
            EventKind::SaleAdjustment => "SALE_ADJUSTMENT",
            EventKind::SaleUndo => "SALE_UNDO",
        }
    }

    /// Display category the event is listed under.
    pub fn category(self) -> DisplayCategory {
        match self {
            EventKind::Sale => DisplayCategory::Sales,
            EventKind::Deposit => DisplayCategory::Deposits,
            EventKind::BalanceEdit => DisplayCategory::BalanceEdits,
            EventKind::SaleAdjustment => DisplayCategory::SaleEdits,
            EventKind::SaleUndo => DisplayCategory::Undos,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// History filter bucket shown to staff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayCategory {
    /// Sales.
    Sales,
    /// Deposits.
    Deposits,
    /// Manual balance edits.
    BalanceEdits,
    /// Sale adjustments ("sale edits" in the history filter).
    SaleEdits,
    /// Voided sales.
    Undos,
}

impl DisplayCategory {
    /// Every category.
    pub const ALL: [DisplayCategory; 5] = [
        DisplayCategory::Sales,
        DisplayCategory::Deposits,
        DisplayCategory::BalanceEdits,
        DisplayCategory::SaleEdits,
        DisplayCategory::Undos,
    ];

    /// Parses a history filter key.
    ///
    /// Accepts both the filter names (`SALE_EDIT`) and the event type names (`SALE_ADJUSTMENT`).
    pub fn from_filter_key(key: &str) -> Option<Self> {
        match key.trim().to_ascii_uppercase().as_str() {
            "SALE" | "SALES" => Some(DisplayCategory::Sales),
            "DEPOSIT" | "DEPOSITS" => Some(DisplayCategory::Deposits),
            "BALANCE_EDIT" | "BALANCE_EDITS" => Some(DisplayCategory::BalanceEdits),
            "SALE_EDIT" | "SALE_EDITS" | "SALE_ADJUSTMENT" => Some(DisplayCategory::SaleEdits),
            "SALE_UNDO" | "UNDO" | "UNDOS" => Some(DisplayCategory::Undos),
            _ => None,
        }
    }

    /// Event kinds listed under this category.
    pub fn event_kinds(self) -> impl Iterator<Item = EventKind> {
        EventKind::ALL.into_iter().filter(move |k| k.category() == self)
    }
}

/// Unknown history filter key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown event filter key {0:?}")]
pub struct UnknownFilterKey(pub String);

/// Event-type filter applied before aggregation. An unrestricted filter admits everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    categories: Option<BTreeSet<DisplayCategory>>,
}

impl EventFilter {
    /// Admits every category.
    pub fn all() -> Self {
        Self::default()
    }

    /// Admits only the given categories.
    pub fn only(categories: impl IntoIterator<Item = DisplayCategory>) -> Self {
        Self {
            categories: Some(categories.into_iter().collect()),
        }
    }

    /// Builds a filter from checkbox keys such as `SALE` or `SALE_EDIT`.
    pub fn from_keys<'a>(keys: impl IntoIterator<Item = &'a str>) -> Result<Self, UnknownFilterKey> {
        let categories = keys
            .into_iter()
            .map(|k| DisplayCategory::from_filter_key(k).ok_or_else(|| UnknownFilterKey(k.to_string())))
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(Self {
            categories: Some(categories),
        })
    }

    /// True when the filter narrows the window.
    pub fn is_restricted(&self) -> bool {
        self.categories.is_some()
    }

    /// True when events of `kind` pass.
    pub fn admits(&self, kind: EventKind) -> bool {
        self.admits_category(kind.category())
    }

    /// True when `category` passes.
    pub fn admits_category(&self, category: DisplayCategory) -> bool {
        self.categories
            .as_ref()
            .is_none_or(|set| set.contains(&category))
    }
}

/// Half-open time range `[start_ms, end_ms)` selecting ledger events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventWindow {
    /// Inclusive lower bound.
    pub start_ms: TimestampMs,
    /// Exclusive upper bound.
    pub end_ms: TimestampMs,
}

impl EventWindow {
    /// Creates a window; bounds are swapped if given backwards.
    pub fn new(start_ms: TimestampMs, end_ms: TimestampMs) -> Self {
        Self {
            start_ms: start_ms.min(end_ms),
            end_ms: start_ms.max(end_ms),
        }
    }

    /// True when `ts_ms` falls inside the window.
    pub fn contains(&self, ts_ms: TimestampMs) -> bool {
        ts_ms >= self.start_ms && ts_ms < self.end_ms
    }
}

/// One purchased line of a sale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    /// Purchased product.
    pub product_id: ProductId,
    /// Product name at purchase time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_name: Option<String>,
    /// Quantity purchased.
    pub quantity: u32,
    /// Unit price at purchase time.
    pub unit_price: Money,
}

impl LineItem {
    /// `quantity * unit_price`.
    pub fn total(&self) -> Money {
        Money::from_minor(self.unit_price.minor() * i64::from(self.quantity))
    }
}

/// `SALE` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaleDetails {
    /// Charged total as recorded by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<Money>,
    /// Purchased lines.
    #[serde(default)]
    pub items: Vec<LineItem>,
}

impl SaleDetails {
    /// Charged total; falls back to the line-item sum when the row carries no total.
    pub fn original_amount(&self) -> Money {
        self.total
            .unwrap_or_else(|| self.items.iter().map(LineItem::total).sum())
    }
}

/// `DEPOSIT` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositDetails {
    /// Credited amount.
    pub amount: Money,
    /// Balance after the deposit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_balance: Option<Money>,
}

/// `BALANCE_EDIT` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceEditDetails {
    /// Balance before the edit, when recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_balance: Option<Money>,
    /// Balance after the edit.
    pub new_balance: Money,
}

impl BalanceEditDetails {
    /// Signed change, when the previous balance is known.
    pub fn delta(&self) -> Option<Money> {
        self.old_balance.map(|old| self.new_balance - old)
    }
}

/// `SALE_ADJUSTMENT` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustmentDetails {
    /// Sale this adjustment corrects.
    pub adjusted_sale_id: EventId,
    /// Negative for refunds, positive for extra charges.
    pub adjustment_amount: Money,
    /// Set when the adjustment reverses the whole sale.
    #[serde(default, rename = "fullReversal", alias = "full_reversal")]
    pub full_reversal: bool,
    /// Free-text reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Buyer balance after the adjustment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_balance: Option<Money>,
}

/// `SALE_UNDO` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UndoDetails {
    /// Sale that was voided.
    pub undone_sale_id: EventId,
    /// Amount credited back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refunded_amount: Option<Money>,
    /// Buyer balance after the undo.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_balance: Option<Money>,
}

/// Typed payload per event kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventBody {
    /// `SALE`.
    Sale(SaleDetails),
    /// `DEPOSIT`.
    Deposit(DepositDetails),
    /// `BALANCE_EDIT`.
    BalanceEdit(BalanceEditDetails),
    /// `SALE_ADJUSTMENT`.
    SaleAdjustment(AdjustmentDetails),
    /// `SALE_UNDO`.
    SaleUndo(UndoDetails),
}

impl EventBody {
    /// Kind tag.
    pub fn kind(&self) -> EventKind {
        match self {
            EventBody::Sale(_) => EventKind::Sale,
            EventBody::Deposit(_) => EventKind::Deposit,
            EventBody::BalanceEdit(_) => EventKind::BalanceEdit,
            EventBody::SaleAdjustment(_) => EventKind::SaleAdjustment,
            EventBody::SaleUndo(_) => EventKind::SaleUndo,
        }
    }
}

/// Immutable ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawLedgerEvent", into = "RawLedgerEvent")]
pub struct LedgerEvent {
    /// Event id.
    pub id: EventId,
    /// Creation time.
    pub ts_ms: TimestampMs,
    /// Target user, when the event concerns one.
    pub user_id: Option<UserId>,
    /// Typed payload.
    pub body: EventBody,
}

impl LedgerEvent {
    /// Kind tag.
    pub fn kind(&self) -> EventKind {
        self.body.kind()
    }

    /// Sale id this event points at (adjustments and undos).
    pub fn target_sale_id(&self) -> Option<&str> {
        match &self.body {
            EventBody::SaleAdjustment(d) => Some(&d.adjusted_sale_id),
            EventBody::SaleUndo(d) => Some(&d.undone_sale_id),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct RawLedgerEvent {
    id: EventId,
    ts_ms: TimestampMs,
    #[serde(default)]
    user_id: Option<UserId>,
    event_type: EventKind,
    #[serde(default)]
    details: Value,
}

impl TryFrom<RawLedgerEvent> for LedgerEvent {
    type Error = serde_json::Error;

    fn try_from(raw: RawLedgerEvent) -> Result<Self, Self::Error> {
        let details = match raw.details {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };
        let body = match raw.event_type {
            EventKind::Sale => EventBody::Sale(serde_json::from_value(details)?),
            EventKind::Deposit => EventBody::Deposit(serde_json::from_value(details)?),
            EventKind::BalanceEdit => EventBody::BalanceEdit(serde_json::from_value(details)?),
            EventKind::SaleAdjustment => EventBody::SaleAdjustment(serde_json::from_value(details)?),
            EventKind::SaleUndo => EventBody::SaleUndo(serde_json::from_value(details)?),
        };
        Ok(Self {
            id: raw.id,
            ts_ms: raw.ts_ms,
            user_id: raw.user_id,
            body,
        })
    }
}

impl From<LedgerEvent> for RawLedgerEvent {
    fn from(ev: LedgerEvent) -> Self {
        let event_type = ev.kind();
        let details = match &ev.body {
            EventBody::Sale(d) => serde_json::to_value(d),
            EventBody::Deposit(d) => serde_json::to_value(d),
            EventBody::BalanceEdit(d) => serde_json::to_value(d),
            EventBody::SaleAdjustment(d) => serde_json::to_value(d),
            EventBody::SaleUndo(d) => serde_json::to_value(d),
        }
        .unwrap_or(Value::Null);
        Self {
            id: ev.id,
            ts_ms: ev.ts_ms,
            user_id: ev.user_id,
            event_type,
            details,
        }
    }
}
