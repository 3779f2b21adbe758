//! Cache commit notifications.

use crate::types::{CollectionKind, RefetchToken};

/// Emitted by the cache store after every committed change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// A whole collection was replaced.
    CollectionReplaced {
        /// Replaced collection.
        kind: CollectionKind,
        /// Fetch token that won, `None` for unconditional replacement.
        token: Option<RefetchToken>,
        /// Entity count after replacement.
        len: usize,
    },
    /// One entity was replaced (optimistic apply or server confirmation).
    EntityReplaced {
        /// Owning collection.
        kind: CollectionKind,
        /// Entity id.
        id: String,
    },
    /// Several entities were replaced in one commit (partial refresh).
    EntitiesReplaced {
        /// Owning collection.
        kind: CollectionKind,
        /// Number of replaced entities.
        count: usize,
    },
    /// A failed optimistic edit was rolled back.
    EntityRestored {
        /// Owning collection.
        kind: CollectionKind,
        /// Entity id.
        id: String,
    },
}

impl CacheEvent {
    /// Collection the event concerns.
    pub fn kind(&self) -> CollectionKind {
        match self {
            CacheEvent::CollectionReplaced { kind, .. }
            | CacheEvent::EntityReplaced { kind, .. }
            | CacheEvent::EntitiesReplaced { kind, .. }
            | CacheEvent::EntityRestored { kind, .. } => *kind,
        }
    }
}
