//! Constructor-injected bundle of the cache, remote gateway and sync components.

use std::sync::Arc;

use crate::{
    config::ClientConfig,
    core::store::CacheStore,
    ledger::desk::LedgerDesk,
    remote::{RemoteDataService, SessionContext, retry::RemoteGateway},
    runtime::handle::{RefreshLoopHandle, spawn_refresh_loop},
    sync::{optimistic::OptimisticMutator, refetch::RefetchCoordinator},
};

/// One till session: every component shares the same store and gateway.
pub struct CafeClient {
    config: ClientConfig,
    store: Arc<CacheStore>,
    gateway: Arc<RemoteGateway>,
    coordinator: Arc<RefetchCoordinator>,
    mutator: OptimisticMutator,
    desk: LedgerDesk,
}

impl CafeClient {
    /// Wires store, gateway, coordinator, mutator and desk around one remote service.
    pub fn new(
        service: Arc<dyn RemoteDataService>,
        session: Arc<dyn SessionContext>,
        config: ClientConfig,
    ) -> Self {
        let store = Arc::new(CacheStore::new(config.event_channel_capacity));
        let gateway = Arc::new(RemoteGateway::new(service, session, config.transport_retry_budget));
        let coordinator = Arc::new(RefetchCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&gateway),
            config.balance_refresh_cooldown(),
        ));
        let mutator = OptimisticMutator::new(
            Arc::clone(&store),
            Arc::clone(&gateway),
            Arc::clone(&coordinator),
            config.serialize_entity_mutations,
        );
        let desk = LedgerDesk::new(Arc::clone(&gateway), Arc::clone(&store));
        Self {
            config,
            store,
            gateway,
            coordinator,
            mutator,
            desk,
        }
    }

    /// Settings this client was built with.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Shared cache store.
    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    /// Retrying, session-aware remote gateway.
    pub fn gateway(&self) -> &Arc<RemoteGateway> {
        &self.gateway
    }

    /// Refetch coordinator.
    pub fn coordinator(&self) -> &Arc<RefetchCoordinator> {
        &self.coordinator
    }

    /// Optimistic mutator.
    pub fn mutator(&self) -> &OptimisticMutator {
        &self.mutator
    }

    /// Ledger desk for windows, refunds and undos.
    pub fn desk(&self) -> &LedgerDesk {
        &self.desk
    }

    /// Starts the periodic refresh task for this client's collections.
    pub fn spawn_refresh_loop(&self) -> RefreshLoopHandle {
        spawn_refresh_loop(Arc::clone(&self.coordinator), &self.config)
    }
}
