use std::sync::Arc;

use crate::{
    entity::{CacheEntity, Product, User},
    types::CollectionKind,
};

use super::{indices::PosIndex, store::StoreError};

/// Ordered, id-unique snapshot of one entity collection.
///
/// Never mutated once built: writers construct a new collection and swap the `Arc`, so a
/// reader holding an older snapshot keeps seeing exactly what it was handed.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedCollection<T> {
    items: Vec<T>,
    pos: PosIndex,
}

impl<T> Default for CachedCollection<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            pos: PosIndex::new(),
        }
    }
}

impl<T: CacheEntity> CachedCollection<T> {
    /// Builds a collection from fetched rows, keeping one entry per id.
    ///
    /// A repeated id keeps the position of its first occurrence and the contents of its last.
    pub fn from_rows(rows: Vec<T>) -> Self {
        let mut items: Vec<T> = Vec::with_capacity(rows.len());
        let mut pos = PosIndex::with_capacity(rows.len());
        let mut duplicates = 0usize;

        for row in rows {
            match pos.get(row.id()) {
                Some(&idx) => {
                    items[idx] = row;
                    duplicates += 1;
                }
                None => {
                    pos.insert(row.id().to_string(), items.len());
                    items.push(row);
                }
            }
        }

        if duplicates > 0 {
            log::warn!(
                "{} rows contained {duplicates} duplicate id(s); kept the latest copy",
                T::KIND
            );
        }

        Self { items, pos }
    }

    /// Collection kind.
    pub fn kind(&self) -> CollectionKind {
        T::KIND
    }

    /// Looks up an entity by id.
    pub fn get(&self, id: &str) -> Option<&T> {
        self.pos.get(id).and_then(|idx| self.items.get(*idx))
    }

    /// True when an entity with `id` is present.
    pub fn contains(&self, id: &str) -> bool {
        self.pos.contains_key(id)
    }

    /// Entities in fetch order.
    pub fn items(&self) -> &[T] {
        &self.items
    }

    /// Iterates entities in fetch order.
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    /// Number of entities.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Returns a new collection with `entity` replacing the entry that shares its id.
    pub fn with_replaced(&self, entity: T) -> Result<Self, StoreError> {
        let idx = *self.pos.get(entity.id()).ok_or_else(|| StoreError::MissingEntity {
            kind: T::KIND,
            id: entity.id().to_string(),
        })?;
        let mut next = self.clone();
        next.items[idx] = entity;
        Ok(next)
    }

    /// Returns a new collection with every entity in `entities` swapped in by id.
    ///
    /// Ids that are not present are skipped; the count of replaced entries is returned.
    pub fn with_replaced_many(&self, entities: Vec<T>) -> (Self, usize) {
        let mut next = self.clone();
        let mut replaced = 0usize;
        for entity in entities {
            if let Some(&idx) = next.pos.get(entity.id()) {
                next.items[idx] = entity;
                replaced += 1;
            }
        }
        (next, replaced)
    }
}

impl<'a, T> IntoIterator for &'a CachedCollection<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

/// Current snapshot of every cached collection.
#[derive(Debug, Clone, Default)]
pub struct CacheSlots {
    /// Users snapshot.
    pub users: Arc<CachedCollection<User>>,
    /// Products snapshot.
    pub products: Arc<CachedCollection<Product>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Money;

    fn product(id: &str, name: &str) -> Product {
        Product {
            id: id.to_string(),
            institution_id: "inst".to_string(),
            name: name.to_string(),
            price: Money::from_major_units(1),
            visible: true,
            sort_order: 0,
        }
    }

    #[test]
    fn duplicate_ids_keep_first_position_and_last_contents() {
        let coll = CachedCollection::from_rows(vec![
            product("a", "first"),
            product("b", "bee"),
            product("a", "second"),
        ]);
        assert_eq!(coll.len(), 2);
        assert_eq!(coll.items()[0].name, "second");
        assert_eq!(coll.items()[1].id, "b");
    }

    #[test]
    fn replacing_builds_a_new_collection_and_leaves_the_old_one() {
        let coll = CachedCollection::from_rows(vec![product("a", "old")]);
        let next = coll.with_replaced(product("a", "new")).expect("replace");
        assert_eq!(coll.get("a").map(|p| p.name.as_str()), Some("old"));
        assert_eq!(next.get("a").map(|p| p.name.as_str()), Some("new"));

        let err = coll.with_replaced(product("zz", "x")).unwrap_err();
        assert!(matches!(err, StoreError::MissingEntity { .. }));
    }
}
