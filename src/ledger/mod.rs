//! Ledger events, per-sale reconciliation, window aggregation and the refund desk.

pub mod desk;
pub mod event;
pub mod reconcile;
pub mod summary;

pub use desk::{AdjustmentError, AdjustmentReceipt, AdjustmentRequest, LedgerDesk};
pub use event::{DisplayCategory, EventBody, EventFilter, EventKind, EventWindow, LedgerEvent};
pub use reconcile::{
    ReconciledSaleView, Reconciliation, RefundAllowance, RefundRejection, RejectionReason,
    check_adjustment, reconcile,
};
pub use summary::{UserStatement, WindowSummary, summarize, user_statement};
