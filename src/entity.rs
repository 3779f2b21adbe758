//! Cached entity records (users, products) and their sparse patches.

use std::{collections::BTreeMap, sync::Arc};

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    core::collection::{CacheSlots, CachedCollection},
    types::{CollectionKind, InstitutionId, Money, ProductId, UserId},
};

/// An entity that lives in a [`CachedCollection`] inside the cache store.
pub trait CacheEntity:
    Clone + PartialEq + std::fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Sparse patch type used by optimistic edits.
    type Patch: EntityPatch<Self>;

    /// Collection this entity belongs to.
    const KIND: CollectionKind;

    /// Stable identifier.
    fn id(&self) -> &str;

    /// Selects this entity's collection from the store slots.
    fn select(slots: &CacheSlots) -> &Arc<CachedCollection<Self>>;

    /// Selects this entity's collection mutably from the store slots.
    fn select_mut(slots: &mut CacheSlots) -> &mut Arc<CachedCollection<Self>>;
}

/// Sparse patch where each `Some` field overwrites the record value.
pub trait EntityPatch<T>: Clone + std::fmt::Debug + Send + Sync + 'static {
    /// Returns true when no fields are set.
    fn is_empty(&self) -> bool;

    /// Applies this patch in place to `rec`.
    fn apply_to(&self, rec: &mut T);

    /// Builds a whole new entity from a full copy of `prev` with this patch merged in.
    fn applied(&self, prev: &T) -> T
    where
        T: Clone,
    {
        let mut next = prev.clone();
        self.apply_to(&mut next);
        next
    }
}

/// Prepaid account holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Stable user identifier.
    pub id: UserId,
    /// Owning institution.
    pub institution_id: InstitutionId,
    /// Name shown at the till.
    pub display_name: String,
    /// Current prepaid balance.
    pub balance: Money,
    /// Adult (staff) accounts may run negative at some institutions.
    #[serde(default)]
    pub is_adult: bool,
    /// Inactive users are hidden from the till.
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// Per-product purchase limits.
    #[serde(default)]
    pub product_limits: BTreeMap<ProductId, u32>,
}

/// Sellable product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    /// Stable product identifier.
    pub id: ProductId,
    /// Owning institution.
    pub institution_id: InstitutionId,
    /// Product name.
    pub name: String,
    /// Current unit price.
    pub price: Money,
    /// Hidden products stay in history but are not offered for sale.
    #[serde(default = "default_true")]
    pub visible: bool,
    /// Position in the till grid.
    #[serde(default)]
    pub sort_order: i32,
}

fn default_true() -> bool {
    true
}

/// Sparse user patch.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UserPatch {
    /// Optional replacement for the display name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Optional replacement for the balance.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balance: Option<Money>,
    /// Optional replacement for the active flag.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
    /// Optional replacement for the whole limit table.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_limits: Option<BTreeMap<ProductId, u32>>,
}

impl EntityPatch<User> for UserPatch {
    fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    fn apply_to(&self, rec: &mut User) {
        if let Some(v) = &self.display_name {
            rec.display_name = v.clone();
        }
        if let Some(v) = self.balance {
            rec.balance = v;
        }
        if let Some(v) = self.is_active {
            rec.is_active = v;
        }
        if let Some(v) = &self.product_limits {
            rec.product_limits = v.clone();
        }
    }
}

/// Sparse product patch covering visibility, price and ordering edits.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProductPatch {
    /// Optional replacement for the name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Optional replacement for the unit price.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<Money>,
    /// Optional replacement for visibility.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visible: Option<bool>,
    /// Optional replacement for the grid position.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort_order: Option<i32>,
}

impl EntityPatch<Product> for ProductPatch {
    fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    fn apply_to(&self, rec: &mut Product) {
        if let Some(v) = &self.name {
            rec.name = v.clone();
        }
        if let Some(v) = self.price {
            rec.price = v;
        }
        if let Some(v) = self.visible {
            rec.visible = v;
        }
        if let Some(v) = self.sort_order {
            rec.sort_order = v;
        }
    }
}

impl CacheEntity for User {
    type Patch = UserPatch;

    const KIND: CollectionKind = CollectionKind::Users;

    fn id(&self) -> &str {
        &self.id
    }

    fn select(slots: &CacheSlots) -> &Arc<CachedCollection<Self>> {
        &slots.users
    }

    fn select_mut(slots: &mut CacheSlots) -> &mut Arc<CachedCollection<Self>> {
        &mut slots.users
    }
}

impl CacheEntity for Product {
    type Patch = ProductPatch;

    const KIND: CollectionKind = CollectionKind::Products;

    fn id(&self) -> &str {
        &self.id
    }

    fn select(slots: &CacheSlots) -> &Arc<CachedCollection<Self>> {
        &slots.products
    }

    fn select_mut(slots: &mut CacheSlots) -> &mut Arc<CachedCollection<Self>> {
        &mut slots.products
    }
}
