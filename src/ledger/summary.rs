//! Window aggregation over a [`Reconciliation`].

use std::collections::BTreeMap;

use serde::Serialize;

use crate::types::{Money, ProductId, UserId};

use super::{
    event::{DisplayCategory, EventBody, EventFilter},
    reconcile::{LedgerRow, Reconciliation},
};

/// Per-product sales within a window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProductTally {
    /// Last seen product name.
    pub name: Option<String>,
    /// Units sold.
    pub quantity: u64,
    /// Sum of line totals at purchase price.
    pub total: Money,
}

/// Totals for one reconciled window.
///
/// Revenue counts only the original amount of sales that are not voided. Adjustments, undos
/// and deposits are reported beside it, never folded into it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WindowSummary {
    /// Original amounts of active sales.
    pub revenue: Money,
    /// Sales not voided.
    pub active_sales: usize,
    /// Sales voided by an undo.
    pub voided_sales: usize,
    /// Original amounts of voided sales.
    pub voided_total: Money,
    /// Tallies keyed by product id.
    pub per_product: BTreeMap<ProductId, ProductTally>,
    /// Signed net of nested and standalone adjustments.
    pub adjustments_net: Money,
    /// Adjustment events seen.
    pub adjustment_count: usize,
    /// Adjustments whose sale is outside the window.
    pub orphan_adjustments: usize,
    /// Undo events seen.
    pub undo_count: usize,
    /// Sum of deposits.
    pub deposits_total: Money,
    /// Deposit events seen.
    pub deposit_count: usize,
    /// Balance edits seen.
    pub balance_edit_count: usize,
}

impl WindowSummary {
    /// Revenue after adjustments are applied.
    pub fn net_revenue(&self) -> Money {
        self.revenue + self.adjustments_net
    }
}

/// Aggregates a reconciliation, counting only categories the filter admits.
pub fn summarize(reconciliation: &Reconciliation, filter: &EventFilter) -> WindowSummary {
    let sales = filter.admits_category(DisplayCategory::Sales);
    let edits = filter.admits_category(DisplayCategory::SaleEdits);
    let undos = filter.admits_category(DisplayCategory::Undos);
    let deposits = filter.admits_category(DisplayCategory::Deposits);
    let balance_edits = filter.admits_category(DisplayCategory::BalanceEdits);

    let mut out = WindowSummary::default();
    for row in reconciliation.rows() {
        match row {
            LedgerRow::Sale(view) => {
                if edits {
                    out.adjustment_count += view.adjustments.len();
                    if view.is_active() {
                        out.adjustments_net += view.sum_of_adjustments;
                    }
                }
                if !sales {
                    continue;
                }
                if !view.is_active() {
                    out.voided_sales += 1;
                    out.voided_total += view.original_amount;
                    continue;
                }
                out.active_sales += 1;
                out.revenue += view.original_amount;
                for item in &view.line_items {
                    let tally = out.per_product.entry(item.product_id.clone()).or_default();
                    tally.quantity += u64::from(item.quantity);
                    tally.total += item.total();
                    if item.product_name.is_some() {
                        tally.name = item.product_name.clone();
                    }
                }
            }
            LedgerRow::OrphanAdjustment(ev) => {
                if !edits {
                    continue;
                }
                if let EventBody::SaleAdjustment(d) = &ev.body {
                    out.adjustments_net += d.adjustment_amount;
                    out.adjustment_count += 1;
                    out.orphan_adjustments += 1;
                }
            }
            LedgerRow::Undo { .. } => {
                if undos {
                    out.undo_count += 1;
                }
            }
            LedgerRow::Entry(ev) => match &ev.body {
                EventBody::Deposit(d) if deposits => {
                    out.deposits_total += d.amount;
                    out.deposit_count += 1;
                }
                EventBody::BalanceEdit(_) if balance_edits => {
                    out.balance_edit_count += 1;
                }
                _ => {}
            },
        }
    }
    out
}

/// One user's money movement within a window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UserStatement {
    /// Account holder.
    pub user_id: UserId,
    /// Original amounts of active sales.
    pub spent: Money,
    /// Refund magnitude from adjustments (including standalone ones).
    pub refunded: Money,
    /// Extra charges from positive adjustments.
    pub surcharged: Money,
    /// Sum of deposits.
    pub deposited: Money,
    /// Original amounts of voided sales.
    pub voided: Money,
}

impl UserStatement {
    /// Net charged to the user after refunds and surcharges.
    pub fn net_spent(&self) -> Money {
        self.spent + self.surcharged - self.refunded
    }
}

/// Builds one user's statement from a reconciliation.
pub fn user_statement(reconciliation: &Reconciliation, user_id: &str) -> UserStatement {
    let mut out = UserStatement {
        user_id: user_id.to_string(),
        ..UserStatement::default()
    };
    let mut add_adjustment = |amount: Money| {
        if amount.is_negative() {
            out.refunded += amount.abs();
        } else {
            out.surcharged += amount;
        }
    };

    let mut spent = Money::ZERO;
    let mut voided = Money::ZERO;
    let mut deposited = Money::ZERO;
    for row in reconciliation.rows() {
        match row {
            LedgerRow::Sale(view) if view.user_id.as_deref() == Some(user_id) => {
                if view.is_active() {
                    spent += view.original_amount;
                    view.adjustments.iter().for_each(|a| add_adjustment(a.amount));
                } else {
                    voided += view.original_amount;
                }
            }
            LedgerRow::OrphanAdjustment(ev) if ev.user_id.as_deref() == Some(user_id) => {
                if let EventBody::SaleAdjustment(d) = &ev.body {
                    add_adjustment(d.adjustment_amount);
                }
            }
            LedgerRow::Entry(ev) if ev.user_id.as_deref() == Some(user_id) => {
                if let EventBody::Deposit(d) = &ev.body {
                    deposited += d.amount;
                }
            }
            _ => {}
        }
    }

    out.spent = spent;
    out.voided = voided;
    out.deposited = deposited;
    out
}
