//! Refund desk: fetches event windows, gates adjustments locally, then submits them.

use std::sync::Arc;

use thiserror::Error;

use crate::{
    core::store::CacheStore,
    entity::{EntityPatch, User, UserPatch},
    remote::{
        FilterOp, ProcedureCall, ProcedureResponse, Query, RemoteError, RemoteResult, Resource,
        retry::RemoteGateway,
    },
    types::{EventId, Money},
};

use super::{
    event::{EventFilter, EventWindow, LedgerEvent},
    reconcile::{
        FULL_REVERSAL_REASON, ReconciledSaleView, Reconciliation, RefundAllowance, RefundRejection,
        RejectionReason, check_adjustment, reconcile,
    },
    summary::{WindowSummary, summarize},
};

/// Why an adjustment or undo did not go through.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdjustmentError {
    /// Refused locally; nothing was sent.
    #[error(transparent)]
    Rejected(#[from] RefundRejection),

    /// The sale id is not in the reconciled window.
    #[error("sale {0} is not part of the reconciled window")]
    UnknownSale(EventId),

    /// The remote call failed or the server refused it.
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl AdjustmentError {
    /// What the till can still refund, when the refusal carries it.
    pub fn remaining_refundable(&self) -> Option<Money> {
        match self {
            Self::Rejected(rej) => Some(rej.remaining_refundable),
            _ => None,
        }
    }
}

/// Signed adjustment against one sale; negative amounts are refunds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdjustmentRequest {
    /// Sale being adjusted.
    pub sale_id: EventId,
    /// Signed delta; negative refunds.
    pub amount: Money,
    /// Free-text reason stored with the event.
    pub reason: Option<String>,
    /// Marks the sale fully reversed.
    pub full_reversal: bool,
}

impl AdjustmentRequest {
    /// Partial refund of `magnitude`.
    pub fn refund(sale_id: impl Into<EventId>, magnitude: Money, reason: Option<String>) -> Self {
        Self {
            sale_id: sale_id.into(),
            amount: -magnitude.abs(),
            reason,
            full_reversal: false,
        }
    }

    /// Refunds whatever is left on the sale and marks it fully reversed.
    pub fn full_refund(view: &ReconciledSaleView) -> Self {
        Self {
            sale_id: view.sale_id.clone(),
            amount: -view.remaining_refundable,
            reason: Some(FULL_REVERSAL_REASON.to_string()),
            full_reversal: true,
        }
    }
}

/// What the remote side confirmed.
#[derive(Debug, Clone, PartialEq)]
pub struct AdjustmentReceipt {
    /// Ledger event appended by the server.
    pub event_id: Option<EventId>,
    /// Server-confirmed balance of the buyer.
    pub new_balance: Option<Money>,
    /// Full decoded response.
    pub response: ProcedureResponse,
}

impl From<ProcedureResponse> for AdjustmentReceipt {
    fn from(response: ProcedureResponse) -> Self {
        Self {
            event_id: response.event_id.clone(),
            new_balance: response.new_balance,
            response,
        }
    }
}

/// Ledger reads and refund/undo submission for one institution.
pub struct LedgerDesk {
    gateway: Arc<RemoteGateway>,
    store: Arc<CacheStore>,
}

impl LedgerDesk {
    /// Desk over `gateway`, writing confirmed balances into `store`.
    pub fn new(gateway: Arc<RemoteGateway>, store: Arc<CacheStore>) -> Self {
        Self { gateway, store }
    }

    /// Reads the raw events of `window`, scoped to the session's institution, oldest first.
    pub async fn fetch_window(&self, window: EventWindow) -> RemoteResult<Vec<LedgerEvent>> {
        let institution = self.gateway.institution_id().ok_or(RemoteError::MissingScope)?;
        let query = Query::new(Resource::LedgerEvents)
            .eq("institution_id", institution)
            .filter("ts_ms", FilterOp::Gte, window.start_ms)
            .filter("ts_ms", FilterOp::Lt, window.end_ms)
            .order_by("ts_ms", true);
        let events: Vec<LedgerEvent> = self.gateway.query_rows("ledger_window", &query).await?;
        log::debug!(
            "fetched {} ledger events for [{}, {})",
            events.len(),
            window.start_ms,
            window.end_ms
        );
        Ok(events)
    }

    /// Fetches and reconciles `window`.
    pub async fn reconcile_window(&self, window: EventWindow) -> RemoteResult<Reconciliation> {
        Ok(reconcile(&self.fetch_window(window).await?))
    }

    /// Fetches, reconciles and summarizes `window` under `filter`.
    pub async fn summarize_window(
        &self,
        window: EventWindow,
        filter: &EventFilter,
    ) -> RemoteResult<WindowSummary> {
        Ok(summarize(&self.reconcile_window(window).await?, filter))
    }

    /// Local ceiling check for `request` against the reconciled window.
    pub fn preflight(
        reconciliation: &Reconciliation,
        request: &AdjustmentRequest,
    ) -> Result<RefundAllowance, AdjustmentError> {
        let view = reconciliation
            .sale(&request.sale_id)
            .ok_or_else(|| AdjustmentError::UnknownSale(request.sale_id.clone()))?;
        Ok(check_adjustment(view, request.amount)?)
    }

    /// Gates `request` locally, then registers it remotely.
    ///
    /// The remote procedure re-checks the ceiling; its refusal surfaces as
    /// [`AdjustmentError::Remote`].
    pub async fn submit_adjustment(
        &self,
        reconciliation: &Reconciliation,
        request: AdjustmentRequest,
    ) -> Result<AdjustmentReceipt, AdjustmentError> {
        let allowance = match Self::preflight(reconciliation, &request) {
            Ok(allowance) => allowance,
            Err(err) => {
                log::info!("adjustment on sale {} refused locally: {err}", request.sale_id);
                return Err(err);
            }
        };
        let full_reversal = request.full_reversal || allowance.completes_reversal;
        let buyer = reconciliation
            .sale(&request.sale_id)
            .and_then(|view| view.user_id.clone());

        let call = ProcedureCall::RegisterAdjustment {
            sale_id: request.sale_id,
            amount: request.amount,
            reason: request.reason,
            full_reversal,
        };
        let response = self.gateway.invoke(&call).await.inspect_err(|err| {
            log::warn!("register_adjustment failed: {err}");
        })?;
        self.apply_confirmed_balance(buyer.as_deref(), response.new_balance);
        Ok(response.into())
    }

    /// Voids a sale. Refused locally when the window already shows it voided.
    pub async fn undo_sale(
        &self,
        reconciliation: &Reconciliation,
        sale_id: &str,
    ) -> Result<AdjustmentReceipt, AdjustmentError> {
        let view = reconciliation
            .sale(sale_id)
            .ok_or_else(|| AdjustmentError::UnknownSale(sale_id.to_string()))?;
        if view.is_voided {
            return Err(RefundRejection {
                reason: RejectionReason::SaleVoided,
                requested: -view.original_amount,
                remaining_refundable: Money::ZERO,
            }
            .into());
        }

        let call = ProcedureCall::UndoSale {
            sale_id: sale_id.to_string(),
        };
        let response = self.gateway.invoke(&call).await.inspect_err(|err| {
            log::warn!("undo_sale failed: {err}");
        })?;
        self.apply_confirmed_balance(view.user_id.as_deref(), response.new_balance);
        Ok(response.into())
    }

    fn apply_confirmed_balance(&self, user_id: Option<&str>, new_balance: Option<Money>) {
        let (Some(user_id), Some(balance)) = (user_id, new_balance) else {
            return;
        };
        let Some(current) = self.store.get::<User>(user_id) else {
            return;
        };
        let patch = UserPatch {
            balance: Some(balance),
            ..UserPatch::default()
        };
        if let Err(err) = self.store.replace_entity(patch.applied(&current)) {
            log::debug!("confirmed balance for {user_id} not applied: {err}");
        }
    }
}
