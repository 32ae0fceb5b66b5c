//! Selection validator
//!
//! The selection is a set of node ids that may outlive the nodes they name: a
//! click selection can be carried forward while a peer deletes the node. Ids
//! that are no longer in the mirror are ghosts. They are rejected when a user
//! adds them, and stripped from both the operative set and the stored
//! selection before any destructive operation.

use std::collections::BTreeSet;

use canvas_core::{NodeId, Rect};

use crate::mirror::MirrorStore;

/// Filters selections against the mirror's node set.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectionValidator;

impl SelectionValidator {
    /// Subset of `selection` present in `mirror.nodes`.
    pub fn validate(selection: &BTreeSet<NodeId>, mirror: &MirrorStore) -> BTreeSet<NodeId> {
        selection
            .iter()
            .filter(|id| mirror.nodes.contains(id))
            .copied()
            .collect()
    }

    /// Subset of `selection` missing from `mirror.nodes`.
    pub fn ghosts(selection: &BTreeSet<NodeId>, mirror: &MirrorStore) -> BTreeSet<NodeId> {
        selection
            .iter()
            .filter(|id| !mirror.nodes.contains(id))
            .copied()
            .collect()
    }

    /// Whether a user may add `id` to the selection right now.
    pub fn admit(id: &NodeId, mirror: &MirrorStore) -> bool {
        mirror.nodes.contains(id)
    }

    /// Remove ghosts from the stored selection and return them.
    pub fn prune_stored(mirror: &mut MirrorStore) -> BTreeSet<NodeId> {
        let ghosts = Self::ghosts(&mirror.selected, mirror);
        if !ghosts.is_empty() {
            mirror.selected.retain(|id| !ghosts.contains(id));
            tracing::debug!(count = ghosts.len(), "ghost ids pruned from selection");
        }
        ghosts
    }
}

impl MirrorStore {
    /// Add a node to the selection. Ghost ids are rejected.
    pub fn select(&mut self, id: NodeId) -> bool {
        if !SelectionValidator::admit(&id, self) {
            tracing::debug!(node_id = %id, "refusing to select missing node");
            return false;
        }
        self.selected.insert(id);
        true
    }

    /// Flip a node's selection. Returns whether it ends up selected.
    pub fn toggle_selection(&mut self, id: NodeId) -> bool {
        if self.selected.remove(&id) {
            false
        } else {
            self.select(id)
        }
    }

    /// Remove a node from the selection. Returns whether it was selected.
    pub fn deselect(&mut self, id: &NodeId) -> bool {
        self.selected.remove(id)
    }

    /// Empty the selection.
    pub fn clear_selection(&mut self) {
        self.selected.clear();
    }

    /// Replace the selection with every node whose bounds intersect `area`.
    ///
    /// Reads the live node set, so the result never contains ghosts.
    pub fn select_area(&mut self, area: Rect) -> BTreeSet<NodeId> {
        let hits: BTreeSet<NodeId> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.bounds().intersects(&area))
            .map(|(id, _)| *id)
            .collect();
        self.selected.clone_from(&hits);
        hits
    }

    /// Restore a selection saved by the UI, without validation.
    ///
    /// Stale ids are cleaned before any destructive use.
    pub fn restore_selection(&mut self, ids: impl IntoIterator<Item = NodeId>) {
        self.selected = ids.into_iter().collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canvas_core::{Node, Position, Size};
    use proptest::prelude::*;

    fn store_with(ids: impl IntoIterator<Item = u128>) -> MirrorStore {
        let mut store = MirrorStore::default();
        for (i, n) in ids.into_iter().enumerate() {
            let x = f64::from(u32::try_from(i).unwrap_or(u32::MAX)) * 100.0;
            store.nodes.apply(
                NodeId::from_u128(n),
                Node::new(NodeId::from_u128(n), Position::new(x, 0.0), Size::new(50.0, 50.0)),
            );
        }
        store
    }

    #[test]
    fn click_selection_rejects_ghosts() {
        let mut store = store_with([1, 2]);
        assert!(store.select(NodeId::from_u128(1)));
        assert!(!store.select(NodeId::from_u128(9)));
        assert_eq!(store.selected.len(), 1);
    }

    #[test]
    fn toggle_adds_then_removes() {
        let mut store = store_with([1]);
        assert!(store.toggle_selection(NodeId::from_u128(1)));
        assert!(!store.toggle_selection(NodeId::from_u128(1)));
        assert!(store.selected.is_empty());
    }

    #[test]
    fn area_selection_reads_live_geometry() {
        let mut store = store_with([1, 2, 3]);
        let hits = store.select_area(Rect::from_corners(
            Position::new(-10.0, -10.0),
            Position::new(160.0, 10.0),
        ));
        assert_eq!(
            hits,
            [NodeId::from_u128(1), NodeId::from_u128(2)].into_iter().collect()
        );
        assert_eq!(store.selected, hits);
    }

    #[test]
    fn prune_removes_restored_ghosts() {
        let mut store = store_with([1]);
        store.restore_selection([NodeId::from_u128(1), NodeId::from_u128(7)]);
        let ghosts = SelectionValidator::prune_stored(&mut store);
        assert_eq!(ghosts, [NodeId::from_u128(7)].into_iter().collect());
        assert_eq!(store.selected, [NodeId::from_u128(1)].into_iter().collect());
    }

    proptest! {
        #[test]
        fn validate_partitions_selection(
            present in proptest::collection::btree_set(0u128..32, 0..16),
            selection in proptest::collection::btree_set(0u128..32, 0..16),
        ) {
            let store = store_with(present.iter().copied());
            let selection: BTreeSet<NodeId> = selection.into_iter().map(NodeId::from_u128).collect();
            let valid = SelectionValidator::validate(&selection, &store);
            let ghosts = SelectionValidator::ghosts(&selection, &store);

            prop_assert!(valid.is_subset(&selection));
            prop_assert!(valid.iter().all(|id| store.nodes.contains(id)));
            prop_assert!(valid.is_disjoint(&ghosts));
            prop_assert_eq!(valid.len() + ghosts.len(), selection.len());
        }
    }
}
