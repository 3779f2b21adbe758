use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock,
    atomic::{AtomicU64, Ordering},
};

use hashbrown::HashMap;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::{
    entity::{CacheEntity, Product, User},
    runtime::events::CacheEvent,
    types::{CollectionKind, RefetchToken},
};

use super::collection::{CacheSlots, CachedCollection};

/// Cache store failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// No entity with `id` is cached in `kind`.
    #[error("{kind} entry {id} is not cached")]
    MissingEntity {
        /// Collection that was searched.
        kind: CollectionKind,
        /// Id that was not found.
        id: String,
    },
}

/// Result of putting a pre-edit snapshot back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// The snapshot replaced the optimistic value.
    Restored,
    /// Something newer replaced the optimistic value meanwhile; left untouched.
    Diverged,
    /// The entity is no longer cached.
    Missing,
}

/// Receives a callback after every committed store change.
pub trait CacheListener: Send + Sync {
    /// Called after a change is committed, outside the store lock.
    fn on_commit(&self, event: &CacheEvent);
}

impl<F> CacheListener for F
where
    F: Fn(&CacheEvent) + Send + Sync,
{
    fn on_commit(&self, event: &CacheEvent) {
        self(event)
    }
}

/// Handle returned by [`CacheStore::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Debug, Default)]
struct StoreInner {
    slots: CacheSlots,
    tokens: HashMap<CollectionKind, RefetchToken>,
}

/// Shared users/products cache.
///
/// Reads hand out `Arc` snapshots. Writes swap whole collections or whole entities under a
/// short lock that is never held across an await, then notify listeners outside the lock.
pub struct CacheStore {
    inner: Mutex<StoreInner>,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn CacheListener>)>>,
    next_listener: AtomicU64,
    events_tx: broadcast::Sender<CacheEvent>,
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new(256)
    }
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("CacheStore")
            .field("users", &inner.slots.users.len())
            .field("products", &inner.slots.products.len())
            .field("tokens", &inner.tokens)
            .finish()
    }
}

impl CacheStore {
    /// Empty store whose broadcast channel holds `event_capacity` events.
    pub fn new(event_capacity: usize) -> Self {
        let (events_tx, _) = broadcast::channel(event_capacity.max(1));
        Self {
            inner: Mutex::new(StoreInner::default()),
            listeners: RwLock::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            events_tx,
        }
    }

    /// Broadcast receiver for every committed change.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events_tx.subscribe()
    }

    /// Registers a callback run after every committed change.
    pub fn add_listener(&self, listener: Arc<dyn CacheListener>) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        id
    }

    /// Unregisters a listener; false when it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Current snapshot of `T`'s collection.
    pub fn collection<T: CacheEntity>(&self) -> Arc<CachedCollection<T>> {
        Arc::clone(T::select(&self.lock().slots))
    }

    /// Current users snapshot.
    pub fn users(&self) -> Arc<CachedCollection<User>> {
        self.collection::<User>()
    }

    /// Current products snapshot.
    pub fn products(&self) -> Arc<CachedCollection<Product>> {
        self.collection::<Product>()
    }

    /// Cloned entity by id.
    pub fn get<T: CacheEntity>(&self, id: &str) -> Option<T> {
        self.collection::<T>().get(id).cloned()
    }

    /// Bumps and returns the collection's fetch token.
    pub fn begin_fetch(&self, kind: CollectionKind) -> RefetchToken {
        let mut inner = self.lock();
        let token = inner.tokens.entry(kind).or_default();
        *token = token.next();
        *token
    }

    /// Newest fetch token issued for `kind`.
    pub fn current_token(&self, kind: CollectionKind) -> RefetchToken {
        self.lock().tokens.get(&kind).copied().unwrap_or_default()
    }

    /// Replaces the collection only if `token` is still the newest fetch for it.
    ///
    /// Returns `None` when a later [`begin_fetch`](Self::begin_fetch) superseded `token`.
    pub fn commit_fetch<T: CacheEntity>(
        &self,
        token: RefetchToken,
        rows: Vec<T>,
    ) -> Option<Arc<CachedCollection<T>>> {
        let committed = {
            let mut inner = self.lock();
            let live = inner.tokens.get(&T::KIND).copied().unwrap_or_default();
            if live != token {
                log::trace!("dropping {} fetch {token:?}; live token is {live:?}", T::KIND);
                return None;
            }
            let next = Arc::new(CachedCollection::from_rows(rows));
            *T::select_mut(&mut inner.slots) = Arc::clone(&next);
            next
        };

        self.notify(CacheEvent::CollectionReplaced {
            kind: T::KIND,
            token: Some(token),
            len: committed.len(),
        });
        Some(committed)
    }

    /// Replaces a whole collection without a token check.
    pub fn replace_collection<T: CacheEntity>(&self, rows: Vec<T>) -> Arc<CachedCollection<T>> {
        let next = Arc::new(CachedCollection::from_rows(rows));
        *T::select_mut(&mut self.lock().slots) = Arc::clone(&next);
        self.notify(CacheEvent::CollectionReplaced {
            kind: T::KIND,
            token: None,
            len: next.len(),
        });
        next
    }

    /// Swaps in a whole entity, returning the entity it replaced.
    pub fn replace_entity<T: CacheEntity>(&self, entity: T) -> Result<T, StoreError> {
        let id = entity.id().to_string();
        let previous = {
            let mut inner = self.lock();
            let slot = T::select_mut(&mut inner.slots);
            let previous = slot.get(&id).cloned().ok_or_else(|| StoreError::MissingEntity {
                kind: T::KIND,
                id: id.clone(),
            })?;
            *slot = Arc::new(slot.with_replaced(entity)?);
            previous
        };

        self.notify(CacheEvent::EntityReplaced { kind: T::KIND, id });
        Ok(previous)
    }

    /// Patches entities read since `token` was current.
    ///
    /// Nothing is written when a fetch of `T` began after `token`. Otherwise each entity is
    /// swapped in only where the cached value still equals its value in `baseline`. Returns
    /// `None` when superseded, else the number of entities replaced.
    pub fn replace_entities_since<T: CacheEntity>(
        &self,
        token: RefetchToken,
        baseline: &CachedCollection<T>,
        entities: Vec<T>,
    ) -> Option<usize> {
        let replaced = {
            let mut inner = self.lock();
            let live = inner.tokens.get(&T::KIND).copied().unwrap_or_default();
            if live != token {
                log::trace!("dropping {} patch read at {token:?}; live token is {live:?}", T::KIND);
                return None;
            }
            let slot = T::select_mut(&mut inner.slots);
            let untouched: Vec<T> = entities
                .into_iter()
                .filter(|e| slot.get(e.id()).is_some_and(|cur| baseline.get(e.id()) == Some(cur)))
                .collect();
            let (next, replaced) = slot.with_replaced_many(untouched);
            if replaced > 0 {
                *slot = Arc::new(next);
            }
            replaced
        };

        if replaced > 0 {
            self.notify(CacheEvent::EntitiesReplaced {
                kind: T::KIND,
                count: replaced,
            });
        }
        Some(replaced)
    }

    /// Puts `previous` back if the cached entity still equals `expected`.
    pub fn restore_entity<T: CacheEntity>(&self, expected: &T, previous: T) -> RestoreOutcome {
        let id = previous.id().to_string();
        {
            let mut inner = self.lock();
            let slot = T::select_mut(&mut inner.slots);
            match slot.get(&id) {
                None => return RestoreOutcome::Missing,
                Some(current) if current != expected => return RestoreOutcome::Diverged,
                Some(_) => {}
            }
            match slot.with_replaced(previous) {
                Ok(next) => *slot = Arc::new(next),
                Err(_) => return RestoreOutcome::Missing,
            }
        }

        self.notify(CacheEvent::EntityRestored { kind: T::KIND, id });
        RestoreOutcome::Restored
    }

    fn notify(&self, event: CacheEvent) {
        let listeners: Vec<Arc<dyn CacheListener>> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener.on_commit(&event);
        }
        let _ = self.events_tx.send(event);
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
