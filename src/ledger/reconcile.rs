//! Per-sale reconciliation over a fetched event window, and the refund ceiling gate.

use hashbrown::HashMap;
use thiserror::Error;

use crate::types::{EventId, Money, TimestampMs, UserId};

use super::event::{AdjustmentDetails, EventBody, LedgerEvent, LineItem};

/// Adjustment reason code that marks a full reversal on its own.
pub const FULL_REVERSAL_REASON: &str = "FULL_REFUND";

/// Slack allowed on the refund ceiling. Zero because [`Money`] is exact.
pub const REFUND_TOLERANCE: Money = Money::ZERO;

/// One adjustment linked to a sale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdjustmentEntry {
    /// Adjustment event id.
    pub event_id: EventId,
    /// Adjustment time.
    pub ts_ms: TimestampMs,
    /// Signed amount; negative is a refund.
    pub amount: Money,
    /// Explicit full-reversal marker.
    pub full_reversal: bool,
    /// Free-form or coded reason.
    pub reason: Option<String>,
}

impl AdjustmentEntry {
    fn from_details(event: &LedgerEvent, details: &AdjustmentDetails) -> Self {
        Self {
            event_id: event.id.clone(),
            ts_ms: event.ts_ms,
            amount: details.adjustment_amount,
            full_reversal: details.full_reversal,
            reason: details.reason.clone(),
        }
    }

    /// True when this adjustment declares itself a full reversal.
    pub fn marks_full_reversal(&self) -> bool {
        self.full_reversal || self.reason.as_deref() == Some(FULL_REVERSAL_REASON)
    }
}

/// Effective state of one sale after its adjustments and undo are applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciledSaleView {
    /// Sale event id.
    pub sale_id: EventId,
    /// Buyer.
    pub user_id: Option<UserId>,
    /// Sale time.
    pub ts_ms: TimestampMs,
    /// Purchased lines.
    pub line_items: Vec<LineItem>,
    /// Amount charged by the sale itself.
    pub original_amount: Money,
    /// Linked adjustments in time order.
    pub adjustments: Vec<AdjustmentEntry>,
    /// Signed sum of linked adjustments.
    pub sum_of_adjustments: Money,
    /// What can still be refunded.
    pub remaining_refundable: Money,
    /// Either an adjustment marked it, or the adjustments cancel the whole amount.
    pub is_fully_refunded: bool,
    /// A `SALE_UNDO` targets this sale.
    pub is_voided: bool,
    /// The undo event, when voided.
    pub voided_by: Option<EventId>,
}

impl ReconciledSaleView {
    fn build(
        sale: &LedgerEvent,
        line_items: Vec<LineItem>,
        original_amount: Money,
        mut adjustments: Vec<AdjustmentEntry>,
        voided_by: Option<EventId>,
    ) -> Self {
        adjustments.sort_by(|a, b| a.ts_ms.cmp(&b.ts_ms).then_with(|| a.event_id.cmp(&b.event_id)));
        let sum_of_adjustments: Money = adjustments.iter().map(|a| a.amount).sum();

        let explicit = adjustments.iter().any(AdjustmentEntry::marks_full_reversal);
        let by_sum = !adjustments.is_empty() && original_amount + sum_of_adjustments <= REFUND_TOLERANCE;
        let is_fully_refunded = explicit || by_sum;
        let is_voided = voided_by.is_some();

        let already = already_refunded(sum_of_adjustments);
        let remaining_refundable = if is_fully_refunded || is_voided {
            Money::ZERO
        } else {
            original_amount.saturating_sub_floor_zero(already)
        };

        Self {
            sale_id: sale.id.clone(),
            user_id: sale.user_id.clone(),
            ts_ms: sale.ts_ms,
            line_items,
            original_amount,
            adjustments,
            sum_of_adjustments,
            remaining_refundable,
            is_fully_refunded,
            is_voided,
            voided_by,
        }
    }

    /// Magnitude already refunded (net of any extra charges, never negative).
    pub fn already_refunded(&self) -> Money {
        already_refunded(self.sum_of_adjustments)
    }

    /// Amount effectively charged after adjustments; zero once voided.
    pub fn net_amount(&self) -> Money {
        if self.is_voided {
            Money::ZERO
        } else {
            self.original_amount + self.sum_of_adjustments
        }
    }

    /// Counts toward active revenue.
    pub fn is_active(&self) -> bool {
        !self.is_voided
    }
}

fn already_refunded(sum_of_adjustments: Money) -> Money {
    if sum_of_adjustments.is_negative() {
        sum_of_adjustments.abs()
    } else {
        Money::ZERO
    }
}

/// Display row of a reconciled window, in time order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerRow {
    /// A sale with its adjustments nested and undo annotated.
    Sale(ReconciledSaleView),
    /// Adjustment whose sale is outside the window; shown standalone.
    OrphanAdjustment(LedgerEvent),
    /// Undo event; kept for audit even though its sale row carries the annotation.
    Undo {
        /// The undo event.
        event: LedgerEvent,
        /// True when the voided sale is part of this window.
        target_in_window: bool,
    },
    /// Deposit or balance edit.
    Entry(LedgerEvent),
}

impl LedgerRow {
    /// Row time.
    pub fn ts_ms(&self) -> TimestampMs {
        match self {
            LedgerRow::Sale(view) => view.ts_ms,
            LedgerRow::OrphanAdjustment(ev) | LedgerRow::Entry(ev) => ev.ts_ms,
            LedgerRow::Undo { event, .. } => event.ts_ms,
        }
    }
}

/// Reconciled view of one event window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    rows: Vec<LedgerRow>,
    sale_index: HashMap<EventId, usize>,
}

impl Reconciliation {
    /// All rows in time order.
    pub fn rows(&self) -> &[LedgerRow] {
        &self.rows
    }

    /// Looks up a reconciled sale.
    pub fn sale(&self, sale_id: &str) -> Option<&ReconciledSaleView> {
        match self.sale_index.get(sale_id).and_then(|idx| self.rows.get(*idx)) {
            Some(LedgerRow::Sale(view)) => Some(view),
            _ => None,
        }
    }

    /// Iterates reconciled sales.
    pub fn sales(&self) -> impl Iterator<Item = &ReconciledSaleView> {
        self.rows.iter().filter_map(|row| match row {
            LedgerRow::Sale(view) => Some(view),
            _ => None,
        })
    }

    /// Iterates standalone adjustments.
    pub fn orphan_adjustments(&self) -> impl Iterator<Item = &LedgerEvent> {
        self.rows.iter().filter_map(|row| match row {
            LedgerRow::OrphanAdjustment(ev) => Some(ev),
            _ => None,
        })
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True when the window held no events.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Reconciles a flat event window into display rows.
///
/// Adjustments are nested under their sale when the sale is in the window and emitted as
/// standalone rows otherwise. Undos annotate their sale and stay in the list. Input order does
/// not matter; rows come out sorted by time, ties broken by input order.
pub fn reconcile(events: &[LedgerEvent]) -> Reconciliation {
    let mut ordered: Vec<&LedgerEvent> = events.iter().collect();
    ordered.sort_by_key(|ev| ev.ts_ms);

    let sale_ids: hashbrown::HashSet<&str> = ordered
        .iter()
        .copied()
        .filter(|ev| matches!(ev.body, EventBody::Sale(_)))
        .map(|ev| ev.id.as_str())
        .collect();

    let mut linked: HashMap<&str, Vec<AdjustmentEntry>> = HashMap::new();
    let mut voids: HashMap<&str, EventId> = HashMap::new();
    for ev in ordered.iter().copied() {
        match &ev.body {
            EventBody::SaleAdjustment(d) if sale_ids.contains(d.adjusted_sale_id.as_str()) => {
                linked
                    .entry(d.adjusted_sale_id.as_str())
                    .or_default()
                    .push(AdjustmentEntry::from_details(ev, d));
            }
            EventBody::SaleUndo(d) => {
                voids
                    .entry(d.undone_sale_id.as_str())
                    .or_insert_with(|| ev.id.clone());
            }
            _ => {}
        }
    }

    let mut out = Reconciliation::default();
    for ev in ordered {
        let row = match &ev.body {
            EventBody::Sale(details) => {
                if out.sale_index.contains_key(&ev.id) {
                    log::warn!("sale {} appears twice in the window; keeping the first", ev.id);
                    continue;
                }
                let view = ReconciledSaleView::build(
                    ev,
                    details.items.clone(),
                    details.original_amount(),
                    linked.remove(ev.id.as_str()).unwrap_or_default(),
                    voids.get(ev.id.as_str()).cloned(),
                );
                out.sale_index.insert(ev.id.clone(), out.rows.len());
                LedgerRow::Sale(view)
            }
            EventBody::SaleAdjustment(d) => {
                if sale_ids.contains(d.adjusted_sale_id.as_str()) {
                    continue;
                }
                LedgerRow::OrphanAdjustment(ev.clone())
            }
            EventBody::SaleUndo(d) => LedgerRow::Undo {
                event: ev.clone(),
                target_in_window: sale_ids.contains(d.undone_sale_id.as_str()),
            },
            EventBody::Deposit(_) | EventBody::BalanceEdit(_) => LedgerRow::Entry(ev.clone()),
        };
        out.rows.push(row);
    }
    out
}

/// Why an adjustment was refused before reaching the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionReason {
    /// Refund would push cumulative refunds past the original amount.
    ExceedsCeiling,
    /// Sale is voided.
    SaleVoided,
    /// Sale is already fully refunded.
    AlreadyFullyRefunded,
    /// Zero-amount adjustment.
    ZeroAmount,
}

/// Structured refusal carrying what is still refundable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", self.message())]
pub struct RefundRejection {
    /// Refusal reason.
    pub reason: RejectionReason,
    /// Requested signed amount.
    pub requested: Money,
    /// Maximum that can still be refunded.
    pub remaining_refundable: Money,
}

impl RefundRejection {
    /// Human-readable message for the till.
    pub fn message(&self) -> String {
        match self.reason {
            RejectionReason::ExceedsCeiling => format!(
                "refund of {} exceeds what is left on the sale; at most {} can be refunded",
                self.requested.abs(),
                self.remaining_refundable
            ),
            RejectionReason::SaleVoided => "sale has been voided".to_string(),
            RejectionReason::AlreadyFullyRefunded => "sale is already fully refunded".to_string(),
            RejectionReason::ZeroAmount => "adjustment amount must not be zero".to_string(),
        }
    }
}

/// Accepted adjustment preview.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefundAllowance {
    /// Requested signed amount.
    pub requested: Money,
    /// Refundable amount left once this adjustment lands.
    pub remaining_after: Money,
    /// True when this adjustment refunds the rest of the sale.
    pub completes_reversal: bool,
}

/// Gates a new adjustment of signed `requested` against the sale's refund ceiling.
///
/// Positive adjustments (extra charges) are not capped.
pub fn check_adjustment(
    view: &ReconciledSaleView,
    requested: Money,
) -> Result<RefundAllowance, RefundRejection> {
    let reject = |reason, remaining_refundable| RefundRejection {
        reason,
        requested,
        remaining_refundable,
    };

    if view.is_voided {
        return Err(reject(RejectionReason::SaleVoided, Money::ZERO));
    }
    if view.is_fully_refunded && !requested.is_positive() {
        return Err(reject(RejectionReason::AlreadyFullyRefunded, Money::ZERO));
    }
    if requested.is_zero() {
        return Err(reject(RejectionReason::ZeroAmount, view.remaining_refundable));
    }
    if requested.is_positive() {
        let remaining_after = if view.is_fully_refunded {
            Money::ZERO
        } else {
            view.original_amount
                .saturating_sub_floor_zero(already_refunded(view.sum_of_adjustments + requested))
        };
        return Ok(RefundAllowance {
            requested,
            remaining_after,
            completes_reversal: false,
        });
    }

    let already = view.already_refunded();
    if already + requested.abs() > view.original_amount + REFUND_TOLERANCE {
        return Err(reject(
            RejectionReason::ExceedsCeiling,
            view.original_amount.saturating_sub_floor_zero(already),
        ));
    }

    let remaining_after = view
        .original_amount
        .saturating_sub_floor_zero(already + requested.abs());
    Ok(RefundAllowance {
        requested,
        remaining_after,
        completes_reversal: remaining_after.is_zero(),
    })
}
