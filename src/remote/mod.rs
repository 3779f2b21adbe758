pub mod retry;
pub mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::types::{EventId, InstitutionId, Money, ProductId, UserId};

/// Retry policy class for remote failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Worth another attempt as-is.
    Retryable,
    /// Retrying cannot help.
    Permanent,
    /// Retry only after refreshing the session.
    ReauthRequired,
}

/// Failures reported by the remote data service or its local stand-in.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// Connection-level failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// No answer in time.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// Session expired or credentials refused.
    #[error("authorization error: {0}")]
    Auth(String),

    /// The service refused the request (validation, business rule, constraint).
    #[error("rejected ({code}): {message}")]
    Rejected {
        /// Machine-readable rejection code.
        code: String,
        /// Human-readable detail.
        message: String,
    },

    /// Response did not have the expected shape.
    #[error("decode error: {0}")]
    Decode(String),

    /// Local storage failure in the stand-in service.
    #[error("storage error: {0}")]
    Storage(String),

    /// The session has no institution to scope reads to.
    #[error("no institution scope is resolvable")]
    MissingScope,

    /// The call panicked before producing a result.
    #[error("call panicked: {0}")]
    Panicked(String),
}

impl RemoteError {
    /// Builds a [`RemoteError::Rejected`].
    pub fn rejected(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rejected {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Classifies a free-text error message from a transport or BaaS client.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_ascii_lowercase();
        if lower.contains("timeout") || lower.contains("timed out") {
            Self::Timeout(message)
        } else if lower.contains("connection reset")
            || lower.contains("failed to fetch")
            || lower.contains("network")
            || lower.contains("econnreset")
        {
            Self::Transport(message)
        } else if lower.contains("jwt")
            || lower.contains("unauthorized")
            || lower.contains("not authorized")
            || lower.contains("401")
        {
            Self::Auth(message)
        } else {
            Self::rejected("unknown", message)
        }
    }

    /// How a retry layer should treat this failure.
    pub fn retry_class(&self) -> RetryClass {
        match self {
            Self::Transport(_) | Self::Timeout(_) => RetryClass::Retryable,
            Self::Auth(_) => RetryClass::ReauthRequired,
            Self::Rejected { .. }
            | Self::Decode(_)
            | Self::Storage(_)
            | Self::MissingScope
            | Self::Panicked(_) => RetryClass::Permanent,
        }
    }

    /// Rejection code, when the service refused the request.
    pub fn rejection_code(&self) -> Option<&str> {
        match self {
            Self::Rejected { code, .. } => Some(code),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for RemoteError {
    fn from(value: serde_json::Error) -> Self {
        Self::Decode(value.to_string())
    }
}

impl From<rusqlite::Error> for RemoteError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Storage(value.to_string())
    }
}

/// Result of a remote call.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Remote table or view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    /// Account holders.
    Users,
    /// Sellable products.
    Products,
    /// Append-only audit trail.
    LedgerEvents,
}

impl Resource {
    /// Table name.
    pub fn as_str(self) -> &'static str {
        match self {
            Resource::Users => "users",
            Resource::Products => "products",
            Resource::LedgerEvents => "ledger_events",
        }
    }
}

/// Comparison applied by a [`Filter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    /// Equal to the value.
    Eq,
    /// Greater than or equal to the value.
    Gte,
    /// Strictly less than the value.
    Lt,
    /// Member of the value array.
    In,
}

/// One column predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    /// Column name.
    pub column: String,
    /// Comparison.
    pub op: FilterOp,
    /// Right-hand side.
    pub value: Value,
}

/// One sort key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    /// Column name.
    pub column: String,
    /// Ascending when true.
    pub ascending: bool,
}

/// Read request: `resource`, optional column projection, filters, ordering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Table read.
    pub resource: Resource,
    /// Columns to return; all when `None`.
    pub columns: Option<Vec<String>>,
    /// Predicates, all of which must hold.
    pub filters: Vec<Filter>,
    /// Sort keys, most significant first.
    pub ordering: Vec<OrderBy>,
}

impl Query {
    /// Unfiltered read of `resource`.
    pub fn new(resource: Resource) -> Self {
        Self {
            resource,
            columns: None,
            filters: Vec::new(),
            ordering: Vec::new(),
        }
    }

    /// Restricts the returned columns.
    pub fn select(mut self, columns: &[&str]) -> Self {
        self.columns = Some(columns.iter().map(|c| (*c).to_string()).collect());
        self
    }

    /// Adds a predicate.
    pub fn filter(mut self, column: &str, op: FilterOp, value: impl Into<Value>) -> Self {
        self.filters.push(Filter {
            column: column.to_string(),
            op,
            value: value.into(),
        });
        self
    }

    /// Adds an equality predicate.
    pub fn eq(self, column: &str, value: impl Into<Value>) -> Self {
        self.filter(column, FilterOp::Eq, value)
    }

    /// Appends a sort key.
    pub fn order_by(mut self, column: &str, ascending: bool) -> Self {
        self.ordering.push(OrderBy {
            column: column.to_string(),
            ascending,
        });
        self
    }
}

/// Money-affecting remote procedures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "procedure", content = "args", rename_all = "snake_case")]
pub enum ProcedureCall {
    /// Credits a user.
    Deposit {
        /// Account credited.
        user_id: UserId,
        /// Positive amount.
        amount: Money,
    },
    /// Overwrites a user's balance.
    SetBalance {
        /// Account edited.
        user_id: UserId,
        /// Balance to store.
        new_balance: Money,
    },
    /// Appends a signed adjustment to a sale.
    RegisterAdjustment {
        /// Sale adjusted.
        sale_id: EventId,
        /// Signed delta; negative refunds.
        amount: Money,
        /// Free-text reason.
        reason: Option<String>,
        /// Marks the sale fully reversed.
        full_reversal: bool,
    },
    /// Voids a sale and refunds what is left of it.
    UndoSale {
        /// Sale voided.
        sale_id: EventId,
    },
    /// Sets or clears a per-product daily limit.
    SetProductLimit {
        /// Account edited.
        user_id: UserId,
        /// Product limited.
        product_id: ProductId,
        /// Daily cap; `None` clears it.
        limit: Option<u32>,
    },
}

impl ProcedureCall {
    /// Procedure name on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            ProcedureCall::Deposit { .. } => "deposit",
            ProcedureCall::SetBalance { .. } => "set_balance",
            ProcedureCall::RegisterAdjustment { .. } => "register_adjustment",
            ProcedureCall::UndoSale { .. } => "undo_sale",
            ProcedureCall::SetProductLimit { .. } => "set_product_limit",
        }
    }
}

/// Known fields of a procedure result; the raw payload is kept alongside.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcedureResponse {
    /// Server-confirmed balance after the procedure ran.
    #[serde(default)]
    pub new_balance: Option<Money>,
    /// Ledger event appended by the procedure.
    #[serde(default)]
    pub event_id: Option<EventId>,
    /// Undecoded payload.
    #[serde(skip)]
    pub raw: Value,
}

impl ProcedureResponse {
    /// Decodes a procedure payload; non-object payloads yield an empty response.
    pub fn from_value(raw: Value) -> RemoteResult<Self> {
        let mut out = match &raw {
            Value::Object(_) => serde_json::from_value::<ProcedureResponse>(raw.clone())?,
            _ => ProcedureResponse::default(),
        };
        out.raw = raw;
        Ok(out)
    }
}

/// Query, procedure and row-update channel to the authoritative store.
#[async_trait]
pub trait RemoteDataService: Send + Sync {
    /// Eventually-consistent read.
    async fn query(&self, query: &Query) -> RemoteResult<Vec<Value>>;

    /// Money-affecting procedure; atomic and authoritative on the remote side.
    async fn invoke(&self, call: &ProcedureCall) -> RemoteResult<Value>;

    /// Updates non-money columns of one row and returns the updated row.
    async fn update(&self, resource: Resource, id: &str, fields: Value) -> RemoteResult<Value>;
}

/// Session/auth collaborator.
#[async_trait]
pub trait SessionContext: Send + Sync {
    /// Resource scope for every query, when signed in.
    fn institution_id(&self) -> Option<InstitutionId>;

    /// True when `err` should trigger a session refresh.
    fn is_auth_error(&self, err: &RemoteError) -> bool {
        err.retry_class() == RetryClass::ReauthRequired
    }

    /// Refreshes credentials before a single retry.
    async fn refresh_session(&self) -> RemoteResult<()>;
}

/// Session with a fixed scope and nothing to refresh.
#[derive(Debug, Clone)]
pub struct StaticSession {
    institution_id: Option<InstitutionId>,
}

impl StaticSession {
    /// Session scoped to `institution_id`.
    pub fn new(institution_id: impl Into<InstitutionId>) -> Self {
        Self {
            institution_id: Some(institution_id.into()),
        }
    }

    /// Session with no scope; scoped reads are skipped.
    pub fn signed_out() -> Self {
        Self {
            institution_id: None,
        }
    }
}

#[async_trait]
impl SessionContext for StaticSession {
    fn institution_id(&self) -> Option<InstitutionId> {
        self.institution_id.clone()
    }

    async fn refresh_session(&self) -> RemoteResult<()> {
        Ok(())
    }
}
