//! Shared cache store and its copy-on-write collections.

/// Immutable, id-indexed entity collections.
pub mod collection;
/// Helper index aliases.
pub mod indices;
/// Cache store with refetch tokens and commit notifications.
pub mod store;
