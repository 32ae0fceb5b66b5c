//! Mirror collection
//!
//! Id-keyed container used by the mirror store for nodes and connections.
//! Ordered by id so snapshots and iteration are deterministic. Selection is
//! deliberately not stored here; it lives next to the collections in
//! [`MirrorStore`](crate::mirror::MirrorStore).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Ordered collection of mirrored entities keyed by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(
    serialize = "Id: Ord + Serialize, Item: Serialize",
    deserialize = "Id: Ord + Deserialize<'de>, Item: Deserialize<'de>"
))]
pub struct MirrorCollection<Id, Item>
where
    Id: Ord,
{
    items: BTreeMap<Id, Item>,
}

impl<Id: Ord, Item> Default for MirrorCollection<Id, Item> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Id: Ord, Item> MirrorCollection<Id, Item> {
    /// Create an empty collection.
    pub fn new() -> Self {
        Self {
            items: BTreeMap::new(),
        }
    }

    /// Create a collection from (id, item) pairs. Later duplicates win.
    pub fn from_pairs(iter: impl IntoIterator<Item = (Id, Item)>) -> Self {
        Self {
            items: iter.into_iter().collect(),
        }
    }

    // ─── Queries ─────────────────────────────────────────────

    /// Get an item by id.
    pub fn get(&self, id: &Id) -> Option<&Item> {
        self.items.get(id)
    }

    /// Whether the id is present.
    pub fn contains(&self, id: &Id) -> bool {
        self.items.contains_key(id)
    }

    /// All items in id order.
    pub fn all(&self) -> impl Iterator<Item = &Item> {
        self.items.values()
    }

    /// All (id, item) pairs in id order.
    pub fn iter(&self) -> impl Iterator<Item = (&Id, &Item)> {
        self.items.iter()
    }

    /// All ids in order.
    pub fn ids(&self) -> impl Iterator<Item = &Id> {
        self.items.keys()
    }

    /// Number of items.
    pub fn count(&self) -> usize {
        self.items.len()
    }

    /// Whether the collection is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    // ─── Mutations ───────────────────────────────────────────

    /// Insert or replace an item. Returns the previous item if it existed.
    pub fn apply(&mut self, id: Id, item: Item) -> Option<Item> {
        self.items.insert(id, item)
    }

    /// Remove an item, returning it if it existed.
    pub fn remove(&mut self, id: &Id) -> Option<Item> {
        self.items.remove(id)
    }

    /// Remove everything.
    pub fn clear(&mut self) {
        self.items.clear();
    }
}

impl<Id: Ord, Item> FromIterator<(Id, Item)> for MirrorCollection<Id, Item> {
    fn from_iter<T: IntoIterator<Item = (Id, Item)>>(iter: T) -> Self {
        Self::from_pairs(iter)
    }
}
