//! Remote-to-cache synchronization.

pub mod optimistic;
pub mod refetch;

pub use optimistic::{EntityLocks, MutationError, OptimisticMutator, Recovery};
pub use refetch::{RefetchCoordinator, RefreshReport, Throttle};
