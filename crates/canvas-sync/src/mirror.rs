//! Mirror store
//!
//! Synchronous, UI-readable copy of the shared document plus the current
//! selection. Written only by change observers (document-driven) and by
//! explicit selection actions. Every write bumps a revision that is published
//! on a `watch` channel so UI code can await changes.
//!
//! Removing a node always evicts it from the selection in the same write.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::watch;

use canvas_core::{Connection, ConnectionId, Node, NodeId};

use crate::collection::MirrorCollection;
use crate::metrics::SyncMetrics;

/// Snapshot state read by the UI.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MirrorStore {
    /// Mirrored nodes
    pub nodes: MirrorCollection<NodeId, Node>,
    /// Mirrored connections, possibly dangling
    pub connections: MirrorCollection<ConnectionId, Connection>,
    /// Selected node ids
    pub selected: BTreeSet<NodeId>,
    /// Incremented on every write
    pub revision: u64,
}

impl MirrorStore {
    /// Connections whose two endpoints are both present.
    pub fn resolved_connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.all().filter(|connection| {
            self.nodes.contains(&connection.source_node_id)
                && self.nodes.contains(&connection.target_node_id)
        })
    }

    /// Connections referencing at least one missing node.
    pub fn dangling_connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.all().filter(|connection| {
            !self.nodes.contains(&connection.source_node_id)
                || !self.nodes.contains(&connection.target_node_id)
        })
    }

    /// Selected nodes that are present, in id order.
    pub fn selected_nodes(&self) -> impl Iterator<Item = &Node> {
        self.selected.iter().filter_map(|id| self.nodes.get(id))
    }

    /// Whether `id` is selected.
    pub fn is_selected(&self, id: &NodeId) -> bool {
        self.selected.contains(id)
    }

    fn apply_write(&mut self, write: MirrorWrite) {
        match write {
            MirrorWrite::UpsertNode(node) => {
                self.nodes.apply(node.id, node);
            }
            MirrorWrite::RemoveNode(id) => {
                self.nodes.remove(&id);
                if self.selected.remove(&id) {
                    tracing::trace!(node_id = %id, "removed node evicted from selection");
                }
            }
            MirrorWrite::UpsertConnection(connection) => {
                self.connections.apply(connection.id, connection);
            }
            MirrorWrite::RemoveConnection(id) => {
                self.connections.remove(&id);
            }
        }
    }
}

/// One document-driven change to the mirror.
#[derive(Debug, Clone, PartialEq)]
pub enum MirrorWrite {
    /// Insert or replace a node
    UpsertNode(Node),
    /// Remove a node and deselect it
    RemoveNode(NodeId),
    /// Insert or replace a connection
    UpsertConnection(Connection),
    /// Remove a connection
    RemoveConnection(ConnectionId),
}

/// Shared handle to the mirror store.
#[derive(Clone)]
pub struct MirrorHandle {
    store: Arc<RwLock<MirrorStore>>,
    revisions: Arc<watch::Sender<u64>>,
    metrics: Arc<SyncMetrics>,
}

impl MirrorHandle {
    /// Create an empty mirror.
    pub fn new(metrics: Arc<SyncMetrics>) -> Self {
        let (revisions, _) = watch::channel(0);
        Self {
            store: Arc::new(RwLock::new(MirrorStore::default())),
            revisions: Arc::new(revisions),
            metrics,
        }
    }

    /// Clone of the current state.
    pub fn snapshot(&self) -> MirrorStore {
        self.store.read().clone()
    }

    /// Read without cloning.
    pub fn read<R>(&self, f: impl FnOnce(&MirrorStore) -> R) -> R {
        f(&self.store.read())
    }

    /// Current revision.
    pub fn revision(&self) -> u64 {
        self.store.read().revision
    }

    /// Receiver that observes every revision bump.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revisions.subscribe()
    }

    /// Apply document-driven writes as one update. Empty input is a no-op.
    pub fn apply(&self, writes: Vec<MirrorWrite>) {
        if writes.is_empty() {
            return;
        }
        self.update(|store| {
            for write in writes {
                store.apply_write(write);
            }
        });
    }

    /// Replace nodes and connections wholesale and clear the selection.
    pub fn replace_all(&self, nodes: Vec<Node>, connections: Vec<Connection>) {
        self.update(|store| {
            store.nodes = nodes.into_iter().map(|n| (n.id, n)).collect();
            store.connections = connections.into_iter().map(|c| (c.id, c)).collect();
            store.selected.clear();
        });
    }

    /// Drop everything, e.g. at teardown.
    pub fn reset(&self) {
        self.update(|store| {
            store.nodes.clear();
            store.connections.clear();
            store.selected.clear();
        });
    }

    /// Run a mutation under the write lock and publish the new revision.
    pub fn update<R>(&self, f: impl FnOnce(&mut MirrorStore) -> R) -> R {
        let (result, revision) = {
            let mut store = self.store.write();
            let result = f(&mut store);
            store.revision += 1;
            (result, store.revision)
        };
        self.metrics.record_mirror_write();
        self.revisions.send_replace(revision);
        result
    }
}

impl std::fmt::Debug for MirrorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let store = self.store.read();
        f.debug_struct("MirrorHandle")
            .field("nodes", &store.nodes.count())
            .field("connections", &store.connections.count())
            .field("selected", &store.selected.len())
            .field("revision", &store.revision)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canvas_core::{Position, Size};

    fn node(n: u128) -> Node {
        Node::new(NodeId::from_u128(n), Position::default(), Size::new(1.0, 1.0))
    }

    #[test]
    fn removing_a_node_deselects_it_in_the_same_revision() {
        let mirror = MirrorHandle::new(Arc::new(SyncMetrics::new()));
        mirror.replace_all(vec![node(1), node(2)], Vec::new());
        mirror.update(|store| {
            store.selected.insert(NodeId::from_u128(1));
            store.selected.insert(NodeId::from_u128(2));
        });
        let before = mirror.revision();

        mirror.apply(vec![MirrorWrite::RemoveNode(NodeId::from_u128(1))]);

        let snapshot = mirror.snapshot();
        assert_eq!(snapshot.revision, before + 1);
        assert!(!snapshot.nodes.contains(&NodeId::from_u128(1)));
        assert_eq!(
            snapshot.selected.iter().copied().collect::<Vec<_>>(),
            vec![NodeId::from_u128(2)]
        );
    }

    #[test]
    fn reset_drops_everything_in_one_revision() {
        let mirror = MirrorHandle::new(Arc::new(SyncMetrics::new()));
        mirror.replace_all(
            vec![node(1), node(2)],
            vec![Connection::new(
                ConnectionId::from_u128(10),
                NodeId::from_u128(1),
                NodeId::from_u128(2),
            )],
        );
        mirror.update(|store| store.selected.insert(NodeId::from_u128(1)));
        let before = mirror.revision();

        mirror.reset();

        let snapshot = mirror.snapshot();
        assert_eq!(snapshot.revision, before + 1);
        assert!(snapshot.nodes.is_empty());
        assert!(snapshot.connections.is_empty());
        assert!(snapshot.selected.is_empty());
    }

    #[test]
    fn dangling_connections_are_not_resolved() {
        let mirror = MirrorHandle::new(Arc::new(SyncMetrics::new()));
        let a = NodeId::from_u128(1);
        let b = NodeId::from_u128(2);
        let ghost = NodeId::from_u128(3);
        mirror.replace_all(
            vec![node(1), node(2)],
            vec![
                Connection::new(ConnectionId::from_u128(10), a, b),
                Connection::new(ConnectionId::from_u128(11), a, ghost),
            ],
        );
        mirror.read(|store| {
            let resolved: Vec<_> = store.resolved_connections().map(|c| c.id).collect();
            let dangling: Vec<_> = store.dangling_connections().map(|c| c.id).collect();
            assert_eq!(resolved, vec![ConnectionId::from_u128(10)]);
            assert_eq!(dangling, vec![ConnectionId::from_u128(11)]);
        });
    }

    #[tokio::test]
    async fn subscribers_see_revision_bumps() {
        let metrics = Arc::new(SyncMetrics::new());
        let mirror = MirrorHandle::new(Arc::clone(&metrics));
        let mut revisions = mirror.subscribe();
        mirror.apply(vec![MirrorWrite::UpsertNode(node(1))]);
        assert!(revisions.has_changed().unwrap_or(false));
        assert_eq!(*revisions.borrow_and_update(), 1);
        mirror.apply(Vec::new());
        assert!(!revisions.has_changed().unwrap_or(true));
        assert_eq!(metrics.snapshot().mirror_writes, 1);
    }
}
