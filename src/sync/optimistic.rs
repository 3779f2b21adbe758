//! Apply locally, call remotely, commit or roll back.

use std::{
    any::Any,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, PoisonError},
};

use futures::FutureExt;
use hashbrown::HashMap;
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;

use crate::{
    core::store::{CacheStore, RestoreOutcome, StoreError},
    entity::{CacheEntity, EntityPatch, Product, ProductPatch, User, UserPatch},
    remote::{ProcedureCall, RemoteError, RemoteResult, Resource, retry::RemoteGateway},
    types::{CollectionKind, Money, ProductId},
};

use super::refetch::RefetchCoordinator;

/// How the cache was put right after a failed remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// The pre-edit snapshot was restored.
    RolledBack,
    /// The snapshot no longer applied; the collection was refetched instead.
    Refetched,
    /// The snapshot no longer applied and the refetch did not commit.
    RefetchFailed,
}

/// Why an optimistic edit did not commit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MutationError {
    /// The entity is not cached; nothing was sent.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The patch would not change anything; nothing was sent.
    #[error("edit changes nothing")]
    EmptyPatch,

    /// Amount refused before any call.
    #[error("invalid amount {0}")]
    InvalidAmount(Money),

    /// The remote call failed after the edit was applied locally.
    #[error("{label} failed: {source}")]
    Remote {
        /// Operation name.
        label: &'static str,
        /// Underlying failure.
        source: RemoteError,
        /// How the cache was put right.
        recovery: Recovery,
    },
}

impl MutationError {
    /// Remote failure, if the call got that far.
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            Self::Remote { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Recovery applied after a remote failure.
    pub fn recovery(&self) -> Option<Recovery> {
        match self {
            Self::Remote { recovery, .. } => Some(*recovery),
            _ => None,
        }
    }
}

/// Per-entity async locks, so edits to one entity run one at a time.
#[derive(Debug, Default)]
pub struct EntityLocks {
    inner: Mutex<HashMap<(CollectionKind, String), Arc<tokio::sync::Mutex<()>>>>,
}

impl EntityLocks {
    /// Waits for exclusive access to one entity.
    pub async fn acquire(&self, kind: CollectionKind, id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            map.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(map.entry((kind, id.to_string())).or_default())
        };
        lock.lock_owned().await
    }
}

/// Optimistic value published to the cache and not yet settled.
///
/// Dropping it while armed puts the snapshot back, so an edit whose future is cancelled
/// mid-flight does not leave its unconfirmed value behind.
struct PendingEdit<T: CacheEntity> {
    store: Arc<CacheStore>,
    coordinator: Arc<RefetchCoordinator>,
    label: &'static str,
    optimistic: T,
    previous: T,
    armed: bool,
}

impl<T: CacheEntity> PendingEdit<T> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<T: CacheEntity> Drop for PendingEdit<T> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let outcome = self.store.restore_entity(&self.optimistic, self.previous.clone());
        log::warn!(
            "{} on {} {} abandoned in flight; {outcome:?}",
            self.label,
            T::KIND,
            self.previous.id()
        );
        if outcome == RestoreOutcome::Restored {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let coordinator = Arc::clone(&self.coordinator);
                let kind = T::KIND;
                handle.spawn(async move {
                    coordinator.refresh_kind(kind).await;
                });
            }
            Err(_) => log::warn!("no runtime to refetch {}; cache may hold a stale edit", T::KIND),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Runs optimistic edits against the cache store.
///
/// Without [`EntityLocks`] overlapping edits to one entity are last-writer-wins: a second
/// edit may snapshot the first one's unconfirmed value.
pub struct OptimisticMutator {
    store: Arc<CacheStore>,
    gateway: Arc<RemoteGateway>,
    coordinator: Arc<RefetchCoordinator>,
    locks: Option<EntityLocks>,
}

impl OptimisticMutator {
    /// Mutator over `store`; `serialize_per_entity` enables [`EntityLocks`].
    pub fn new(
        store: Arc<CacheStore>,
        gateway: Arc<RemoteGateway>,
        coordinator: Arc<RefetchCoordinator>,
        serialize_per_entity: bool,
    ) -> Self {
        Self {
            store,
            gateway,
            coordinator,
            locks: serialize_per_entity.then(EntityLocks::default),
        }
    }

    /// Applies `make_patch(&current)` to the cached entity, then runs `call`.
    ///
    /// On success a patch returned by `call` carries server-confirmed values and wins over
    /// the optimistic ones. On failure the snapshot is restored if the cache still holds the
    /// optimistic value; otherwise the collection is refetched.
    pub async fn apply<T, F, C, Fut>(
        &self,
        label: &'static str,
        id: &str,
        make_patch: F,
        call: C,
    ) -> Result<T, MutationError>
    where
        T: CacheEntity,
        F: FnOnce(&T) -> T::Patch,
        C: FnOnce(T::Patch) -> Fut,
        Fut: Future<Output = RemoteResult<Option<T::Patch>>>,
    {
        let _guard = match &self.locks {
            Some(locks) => Some(locks.acquire(T::KIND, id).await),
            None => None,
        };

        let previous = self
            .store
            .get::<T>(id)
            .ok_or_else(|| StoreError::MissingEntity {
                kind: T::KIND,
                id: id.to_string(),
            })?;
        let patch = make_patch(&previous);
        if patch.is_empty() {
            return Err(MutationError::EmptyPatch);
        }
        let optimistic = patch.applied(&previous);
        self.store.replace_entity(optimistic.clone())?;
        let mut pending = PendingEdit {
            store: Arc::clone(&self.store),
            coordinator: Arc::clone(&self.coordinator),
            label,
            optimistic: optimistic.clone(),
            previous: previous.clone(),
            armed: true,
        };

        let settled = AssertUnwindSafe(call(patch))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(RemoteError::Panicked(panic_message(&*payload))));
        pending.disarm();

        match settled {
            Ok(confirmed) => Ok(self.confirm(optimistic, confirmed)),
            Err(source) => {
                let recovery = self.roll_back(&optimistic, previous).await;
                log::warn!("{label} on {} {id} failed ({source}); {recovery:?}", T::KIND);
                Err(MutationError::Remote {
                    label,
                    source,
                    recovery,
                })
            }
        }
    }

    fn confirm<T: CacheEntity>(&self, optimistic: T, confirmed: Option<T::Patch>) -> T {
        let Some(confirmed) = confirmed.filter(|p| !p.is_empty()) else {
            return optimistic;
        };
        let next = confirmed.applied(&optimistic);
        if next == optimistic {
            return next;
        }
        match self.store.get::<T>(next.id()) {
            Some(current) if current == optimistic => {
                if let Err(err) = self.store.replace_entity(next.clone()) {
                    log::debug!("confirmed value for {} {} dropped: {err}", T::KIND, next.id());
                }
            }
            _ => log::debug!(
                "{} {} changed while in flight; keeping the newer cache value",
                T::KIND,
                next.id()
            ),
        }
        next
    }

    async fn roll_back<T: CacheEntity>(&self, optimistic: &T, previous: T) -> Recovery {
        match self.store.restore_entity(optimistic, previous) {
            RestoreOutcome::Restored => Recovery::RolledBack,
            outcome => {
                log::warn!("{} snapshot not restorable ({outcome:?}); refetching", T::KIND);
                if self.coordinator.refresh_kind(T::KIND).await {
                    Recovery::Refetched
                } else {
                    Recovery::RefetchFailed
                }
            }
        }
    }

    /// Credits `amount` to a user's balance.
    pub async fn deposit(&self, user_id: &str, amount: Money) -> Result<User, MutationError> {
        if !amount.is_positive() {
            return Err(MutationError::InvalidAmount(amount));
        }
        let gateway = &self.gateway;
        let owner = user_id.to_string();
        self.apply::<User, _, _, _>(
            "deposit",
            user_id,
            |prev| balance_patch(prev.balance + amount),
            move |_| async move {
                let resp = gateway
                    .invoke(&ProcedureCall::Deposit {
                        user_id: owner,
                        amount,
                    })
                    .await?;
                Ok(resp.new_balance.map(balance_patch))
            },
        )
        .await
    }

    /// Overwrites a user's balance.
    pub async fn set_balance(&self, user_id: &str, new_balance: Money) -> Result<User, MutationError> {
        let gateway = &self.gateway;
        let owner = user_id.to_string();
        self.apply::<User, _, _, _>(
            "set_balance",
            user_id,
            |_| balance_patch(new_balance),
            move |_| async move {
                let resp = gateway
                    .invoke(&ProcedureCall::SetBalance {
                        user_id: owner,
                        new_balance,
                    })
                    .await?;
                Ok(resp.new_balance.map(balance_patch))
            },
        )
        .await
    }

    /// Edits a product's name, price, visibility or grid position.
    pub async fn update_product(&self, product_id: &str, patch: ProductPatch) -> Result<Product, MutationError> {
        if let Some(price) = patch.price.filter(|p| p.is_negative()) {
            return Err(MutationError::InvalidAmount(price));
        }
        let gateway = &self.gateway;
        let target = product_id.to_string();
        self.apply::<Product, _, _, _>(
            "update_product",
            product_id,
            |_| patch,
            move |patch| async move {
                let fields = serde_json::to_value(&patch).map_err(RemoteError::from)?;
                let row = gateway
                    .update("update_product", Resource::Products, &target, &fields)
                    .await?;
                let server: Product = serde_json::from_value(row).map_err(RemoteError::from)?;
                Ok(Some(ProductPatch {
                    name: Some(server.name),
                    price: Some(server.price),
                    visible: Some(server.visible),
                    sort_order: Some(server.sort_order),
                }))
            },
        )
        .await
    }

    /// Renumbers products so their grid order follows `ordered_ids`.
    ///
    /// Only products whose position changes are edited. Stops at the first failure; edits
    /// before it stay committed.
    pub async fn reorder_products(&self, ordered_ids: &[ProductId]) -> Result<Vec<Product>, MutationError> {
        let mut changed = Vec::new();
        for (position, id) in ordered_ids.iter().enumerate() {
            let sort_order = i32::try_from(position).unwrap_or(i32::MAX);
            let current = self
                .store
                .get::<Product>(id)
                .ok_or_else(|| StoreError::MissingEntity {
                    kind: CollectionKind::Products,
                    id: id.clone(),
                })?;
            if current.sort_order == sort_order {
                continue;
            }
            let patch = ProductPatch {
                sort_order: Some(sort_order),
                ..ProductPatch::default()
            };
            changed.push(self.update_product(id, patch).await?);
        }
        Ok(changed)
    }

    /// Sets or clears a user's daily limit for one product.
    pub async fn set_product_limit(
        &self,
        user_id: &str,
        product_id: &str,
        limit: Option<u32>,
    ) -> Result<User, MutationError> {
        let gateway = &self.gateway;
        let owner = user_id.to_string();
        let product = product_id.to_string();
        self.apply::<User, _, _, _>(
            "set_product_limit",
            user_id,
            |prev| {
                let mut limits = prev.product_limits.clone();
                match limit {
                    Some(limit) => limits.insert(product_id.to_string(), limit),
                    None => limits.remove(product_id),
                };
                UserPatch {
                    product_limits: (limits != prev.product_limits).then_some(limits),
                    ..UserPatch::default()
                }
            },
            move |_| async move {
                gateway
                    .invoke(&ProcedureCall::SetProductLimit {
                        user_id: owner,
                        product_id: product,
                        limit,
                    })
                    .await?;
                Ok(None)
            },
        )
        .await
    }
}

fn balance_patch(balance: Money) -> UserPatch {
    UserPatch {
        balance: Some(balance),
        ..UserPatch::default()
    }
}
