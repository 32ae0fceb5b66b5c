//! Simulated remote peer
//!
//! Forks the local document from exported bytes, edits its own replica with a
//! distinct actor, and hands back bytes for `apply_remote_changes`. This is
//! the transport's job in production.

use automerge::{transaction::Transactable, ActorId, AutoCommit, ObjId, ReadDoc, ROOT};

use canvas_core::{Connection, ConnectionId, Node, NodeId};
use canvas_sync::{CONNECTIONS_KEY, NODES_KEY};

/// Replica of a workspace document owned by another participant.
pub struct RemotePeer {
    doc: AutoCommit,
    nodes: ObjId,
    connections: ObjId,
}

impl RemotePeer {
    /// Fork from bytes produced by `export_document`.
    pub fn fork_from(bytes: &[u8]) -> Self {
        let mut doc = AutoCommit::load(bytes).expect("exported document loads");
        doc.set_actor(ActorId::random());
        let nodes = Self::map(&doc, NODES_KEY);
        let connections = Self::map(&doc, CONNECTIONS_KEY);
        Self {
            doc,
            nodes,
            connections,
        }
    }

    fn map(doc: &AutoCommit, key: &str) -> ObjId {
        match doc.get(ROOT, key).expect("root readable") {
            Some((_, id)) => id,
            None => panic!("document has no {key} map"),
        }
    }

    /// Pull in newer local state.
    pub fn sync_from(&mut self, bytes: &[u8]) {
        self.doc.load_incremental(bytes).expect("local bytes merge");
    }

    /// Create or replace a node.
    pub fn put_node(&mut self, node: &Node) -> &mut Self {
        let json = serde_json::to_string(node).expect("node serializes");
        self.doc
            .put(&self.nodes, node.id.to_string(), json)
            .expect("peer put node");
        self
    }

    /// Store arbitrary text under a node key.
    pub fn put_raw_node(&mut self, key: &str, text: &str) -> &mut Self {
        self.doc
            .put(&self.nodes, key, text.to_string())
            .expect("peer put raw");
        self
    }

    /// Delete a node. Absent ids are left alone.
    pub fn delete_node(&mut self, id: NodeId) -> &mut Self {
        let key = id.to_string();
        if self.doc.get(&self.nodes, key.as_str()).expect("peer read node").is_some() {
            self.doc.delete(&self.nodes, key).expect("peer delete node");
        }
        self
    }

    /// Create or replace a connection.
    pub fn put_connection(&mut self, connection: &Connection) -> &mut Self {
        let json = serde_json::to_string(connection).expect("connection serializes");
        self.doc
            .put(&self.connections, connection.id.to_string(), json)
            .expect("peer put connection");
        self
    }

    /// Delete a connection. Absent ids are left alone.
    pub fn delete_connection(&mut self, id: ConnectionId) -> &mut Self {
        let key = id.to_string();
        if self
            .doc
            .get(&self.connections, key.as_str())
            .expect("peer read connection")
            .is_some()
        {
            self.doc
                .delete(&self.connections, key)
                .expect("peer delete connection");
        }
        self
    }

    /// Node ids in the peer's replica.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.doc
            .keys(&self.nodes)
            .filter_map(|key| key.parse().ok())
            .collect()
    }

    /// Full save, for `apply_remote_changes`.
    pub fn save(&mut self) -> Vec<u8> {
        self.doc.save()
    }
}
