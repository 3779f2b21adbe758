//! Cache event stream and the background refresh loop.

/// Events broadcast by the cache store.
pub mod events;
/// Refresh loop handle and command loop.
pub mod handle;
