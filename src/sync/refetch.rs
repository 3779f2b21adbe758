//! Token-guarded collection refetches and the throttled balances-only refresh.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use serde::Deserialize;
use tokio::time::Instant;

use crate::{
    core::{collection::CachedCollection, store::CacheStore},
    entity::{CacheEntity, EntityPatch, Product, User, UserPatch},
    remote::{Query, Resource, retry::RemoteGateway},
    types::{CollectionKind, Money, UserId},
};

/// "Time since last success" gate.
#[derive(Debug)]
pub struct Throttle {
    cooldown: Duration,
    last_success: Mutex<Option<Instant>>,
}

impl Throttle {
    /// Open gate that closes for `cooldown` after each success.
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_success: Mutex::new(None),
        }
    }

    /// True when a run may go ahead.
    pub fn is_open(&self) -> bool {
        self.last_success
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none_or(|at| at.elapsed() >= self.cooldown)
    }

    /// Starts the cooldown.
    pub fn mark_success(&self) {
        *self.last_success.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
    }

    /// Opens the gate regardless of the cooldown.
    pub fn reset(&self) {
        *self.last_success.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

/// Outcome of [`RefetchCoordinator::refresh_all`]; `None` means not committed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshReport {
    /// Users committed.
    pub users: Option<usize>,
    /// Products committed.
    pub products: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct BalanceRow {
    id: UserId,
    balance: Money,
}

/// Issues re-reads of the cached collections.
///
/// Every refresh bumps the collection's token before the query goes out and commits only if
/// that token is still the newest when the rows arrive, so the store always reflects the most
/// recently started fetch. Failures are logged and reported as `None`.
pub struct RefetchCoordinator {
    store: Arc<CacheStore>,
    gateway: Arc<RemoteGateway>,
    balance_throttle: Throttle,
}

impl RefetchCoordinator {
    /// Coordinator writing into `store`; balances refreshes wait `balance_cooldown` between runs.
    pub fn new(store: Arc<CacheStore>, gateway: Arc<RemoteGateway>, balance_cooldown: Duration) -> Self {
        Self {
            store,
            gateway,
            balance_throttle: Throttle::new(balance_cooldown),
        }
    }

    /// Store the coordinator commits into.
    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    /// Gate for [`RefetchCoordinator::refresh_balances`].
    pub fn balance_throttle(&self) -> &Throttle {
        &self.balance_throttle
    }

    /// Re-reads `T`'s collection; `None` when the read failed or was superseded.
    pub async fn refresh<T: CacheEntity>(&self) -> Option<Arc<CachedCollection<T>>> {
        let Some(institution) = self.gateway.institution_id() else {
            log::debug!("{} refresh skipped: no institution scope", T::KIND);
            return None;
        };

        let token = self.store.begin_fetch(T::KIND);
        let label = format!("refresh_{}", T::KIND);
        let query = collection_query(T::KIND, institution);
        match self.gateway.query_rows::<T>(&label, &query).await {
            Ok(rows) => self.store.commit_fetch(token, rows),
            Err(err) => {
                log::warn!("{label} failed: {err}");
                None
            }
        }
    }

    /// [`refresh`](Self::refresh) for users.
    pub async fn refresh_users(&self) -> Option<Arc<CachedCollection<User>>> {
        self.refresh::<User>().await
    }

    /// [`refresh`](Self::refresh) for products.
    pub async fn refresh_products(&self) -> Option<Arc<CachedCollection<Product>>> {
        self.refresh::<Product>().await
    }

    /// Refreshes one collection by kind; true when the result was committed.
    pub async fn refresh_kind(&self, kind: CollectionKind) -> bool {
        match kind {
            CollectionKind::Users => self.refresh_users().await.is_some(),
            CollectionKind::Products => self.refresh_products().await.is_some(),
        }
    }

    /// Refreshes both collections concurrently.
    pub async fn refresh_all(&self) -> RefreshReport {
        let (users, products) = tokio::join!(self.refresh_users(), self.refresh_products());
        RefreshReport {
            users: users.map(|c| c.len()),
            products: products.map(|c| c.len()),
        }
    }

    /// Re-reads balances only and patches them into cached users.
    ///
    /// Skipped entirely while the cooldown since the last successful run has not elapsed.
    /// The read is dropped if a users fetch started while it was in flight, and a user edited
    /// meanwhile keeps its newer value. Returns the number of users whose balance changed.
    pub async fn refresh_balances(&self) -> Option<usize> {
        if !self.balance_throttle.is_open() {
            log::trace!("balance refresh throttled");
            return None;
        }
        let Some(institution) = self.gateway.institution_id() else {
            log::debug!("balance refresh skipped: no institution scope");
            return None;
        };

        let token = self.store.current_token(CollectionKind::Users);
        let baseline = self.store.users();
        let query = Query::new(Resource::Users)
            .select(&["id", "balance"])
            .eq("institution_id", institution);
        let rows: Vec<BalanceRow> = match self.gateway.query_rows("refresh_balances", &query).await {
            Ok(rows) => rows,
            Err(err) => {
                log::warn!("refresh_balances failed: {err}");
                return None;
            }
        };

        let changed: Vec<User> = rows
            .into_iter()
            .filter_map(|row| {
                let current = baseline.get(&row.id)?;
                (current.balance != row.balance).then(|| {
                    UserPatch {
                        balance: Some(row.balance),
                        ..UserPatch::default()
                    }
                    .applied(current)
                })
            })
            .collect();
        let replaced = self.store.replace_entities_since(token, &baseline, changed)?;
        self.balance_throttle.mark_success();
        Some(replaced)
    }
}

fn collection_query(kind: CollectionKind, institution: String) -> Query {
    match kind {
        CollectionKind::Users => Query::new(Resource::Users)
            .eq("institution_id", institution)
            .order_by("display_name", true),
        CollectionKind::Products => Query::new(Resource::Products)
            .eq("institution_id", institution)
            .order_by("sort_order", true)
            .order_by("name", true),
    }
}
