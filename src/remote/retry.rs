//! Transport retry and session-refresh wrappers, and the gateway that applies both.

use std::{future::Future, sync::Arc};

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::types::InstitutionId;

use super::{
    ProcedureCall, ProcedureResponse, Query, RemoteDataService, RemoteError, RemoteResult,
    Resource, RetryClass, SessionContext,
};

/// Retries `call` immediately on transient failures, at most `budget` extra times.
pub async fn with_transport_retry<T, F, Fut>(label: &str, budget: u32, mut call: F) -> RemoteResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = RemoteResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        match call().await {
            Err(err) if err.retry_class() == RetryClass::Retryable && attempt < budget => {
                attempt += 1;
                log::debug!("{label}: transient failure ({err}); retry {attempt}/{budget}");
            }
            other => return other,
        }
    }
}

/// Runs `call`; on an authorization failure refreshes the session and runs it once more.
pub async fn with_session_retry<T, F, Fut>(
    session: &dyn SessionContext,
    label: &str,
    mut call: F,
) -> RemoteResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = RemoteResult<T>>,
{
    match call().await {
        Err(err) if session.is_auth_error(&err) => {
            log::info!("{label}: authorization failed; refreshing session");
            if let Err(refresh_err) = session.refresh_session().await {
                log::warn!("{label}: session refresh failed: {refresh_err}");
                return Err(err);
            }
            call().await
        }
        other => other,
    }
}

/// Remote service plus session, with every call wrapped in both retry layers.
pub struct RemoteGateway {
    service: Arc<dyn RemoteDataService>,
    session: Arc<dyn SessionContext>,
    transport_retry_budget: u32,
}

impl RemoteGateway {
    /// Wraps `service`, allowing `transport_retry_budget` extra attempts on transient failures.
    pub fn new(
        service: Arc<dyn RemoteDataService>,
        session: Arc<dyn SessionContext>,
        transport_retry_budget: u32,
    ) -> Self {
        Self {
            service,
            session,
            transport_retry_budget,
        }
    }

    /// Scope of the current session.
    pub fn institution_id(&self) -> Option<InstitutionId> {
        self.session.institution_id()
    }

    /// Raw rows for `query`; `label` names the call in logs.
    pub async fn query(&self, label: &str, query: &Query) -> RemoteResult<Vec<Value>> {
        let service = &self.service;
        let budget = self.transport_retry_budget;
        with_session_retry(self.session.as_ref(), label, move || {
            with_transport_retry(label, budget, move || service.query(query))
        })
        .await
    }

    /// Queries and decodes every row into `T`.
    pub async fn query_rows<T: DeserializeOwned>(&self, label: &str, query: &Query) -> RemoteResult<Vec<T>> {
        self.query(label, query)
            .await?
            .into_iter()
            .map(|row| serde_json::from_value(row).map_err(RemoteError::from))
            .collect()
    }

    /// Runs a procedure and decodes its response.
    pub async fn invoke(&self, call: &ProcedureCall) -> RemoteResult<ProcedureResponse> {
        let service = &self.service;
        let budget = self.transport_retry_budget;
        let label = call.name();
        let raw = with_session_retry(self.session.as_ref(), label, move || {
            with_transport_retry(label, budget, move || service.invoke(call))
        })
        .await?;
        ProcedureResponse::from_value(raw)
    }

    /// Updates one row's non-money columns.
    pub async fn update(&self, label: &str, resource: Resource, id: &str, fields: &Value) -> RemoteResult<Value> {
        let service = &self.service;
        let budget = self.transport_retry_budget;
        with_session_retry(self.session.as_ref(), label, move || {
            with_transport_retry(label, budget, move || service.update(resource, id, fields.clone()))
        })
        .await
    }
}
