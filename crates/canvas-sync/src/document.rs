//! Shared document adapter
//!
//! Owns the automerge document for one workspace and its two root maps,
//! `nodes` and `connections`. Entities are stored as JSON strings keyed by id.
//!
//! Every mutation, local or merged from a peer, is reported to observers as a
//! key-level [`MutationBatch`]. Local edits produce a one-key batch; a remote
//! merge is diffed against the pre-merge state and produces at most one batch
//! per collection, keys in order. Observers never learn where a change came
//! from.
//!
//! [`SharedDocument`] is the owning handle and is not `Clone`. Collection
//! handles share the document but fail with [`CanvasError::Document`] once the
//! owner has called [`SharedDocument::free`].

use async_trait::async_trait;
use automerge::{
    transaction::{CommitOptions, Transactable},
    ActorId, AutoCommit, ObjId, ObjType, ReadDoc, ScalarValue, Value, ROOT,
};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use canvas_core::{CanvasError, CanvasResult, Connection, Node, WorkspaceId};

/// Root key of the nodes map.
pub const NODES_KEY: &str = "nodes";

/// Root key of the connections map.
pub const CONNECTIONS_KEY: &str = "connections";

/// Actor of the genesis change that creates both root maps. Every replica
/// builds the same genesis change, so root maps never conflict on merge.
const GENESIS_ACTOR: [u8; 16] = *b"canvas-genesis-0";

// =============================================================================
// Mutation events
// =============================================================================

/// The two top-level collections of a shared document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CollectionKind {
    /// `nodes` map
    Nodes,
    /// `connections` map
    Connections,
}

impl CollectionKind {
    /// Root key of the map.
    pub const fn root_key(self) -> &'static str {
        match self {
            Self::Nodes => NODES_KEY,
            Self::Connections => CONNECTIONS_KEY,
        }
    }
}

impl fmt::Display for CollectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.root_key())
    }
}

/// What happened to a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    /// Key did not exist before
    Add,
    /// Key existed and its value changed
    Update,
    /// Key was removed
    Delete,
}

/// One changed key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyChange {
    /// Map key, the entity id
    pub key: String,
    /// Kind of change
    pub kind: ChangeKind,
}

/// Mutation event for one collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationBatch {
    /// Collection that changed
    pub collection: CollectionKind,
    /// Changed keys in emission order
    pub changes: Vec<KeyChange>,
}

impl MutationBatch {
    fn single(collection: CollectionKind, key: impl Into<String>, kind: ChangeKind) -> Self {
        Self {
            collection,
            changes: vec![KeyChange {
                key: key.into(),
                kind,
            }],
        }
    }
}

/// Observer callback. Called synchronously after the mutation is committed.
pub type ObserverFn = Arc<dyn Fn(&MutationBatch) + Send + Sync>;

/// Identifies one observer registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

// =============================================================================
// Collaborators
// =============================================================================

/// Supplies the initial state of a workspace document.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// Saved automerge document for the workspace, or `None` to start empty.
    async fn load_snapshot(&self, workspace_id: WorkspaceId) -> CanvasResult<Option<Vec<u8>>>;
}

/// Source that always starts with an empty document.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyDocumentSource;

#[async_trait]
impl DocumentSource for EmptyDocumentSource {
    async fn load_snapshot(&self, _workspace_id: WorkspaceId) -> CanvasResult<Option<Vec<u8>>> {
        Ok(None)
    }
}

/// Entity types stored in a collection.
pub trait DocumentEntity: Serialize + DeserializeOwned {
    /// Collection the entity lives in
    const KIND: CollectionKind;

    /// Map key of this entity.
    fn document_key(&self) -> String;
}

impl DocumentEntity for Node {
    const KIND: CollectionKind = CollectionKind::Nodes;

    fn document_key(&self) -> String {
        self.id.to_string()
    }
}

impl DocumentEntity for Connection {
    const KIND: CollectionKind = CollectionKind::Connections;

    fn document_key(&self) -> String {
        self.id.to_string()
    }
}

// =============================================================================
// Shared state
// =============================================================================

struct DocumentInner {
    doc: AutoCommit,
    nodes: ObjId,
    connections: ObjId,
}

impl DocumentInner {
    fn map(&self, kind: CollectionKind) -> &ObjId {
        match kind {
            CollectionKind::Nodes => &self.nodes,
            CollectionKind::Connections => &self.connections,
        }
    }

    fn read(&self, kind: CollectionKind, key: &str) -> CanvasResult<Option<String>> {
        match self.doc.get(self.map(kind), key).map_err(automerge_error)? {
            Some((Value::Scalar(scalar), _)) => match scalar.as_ref() {
                ScalarValue::Str(text) => Ok(Some(text.to_string())),
                other => Err(CanvasError::serialization(format!(
                    "{kind}/{key}: expected JSON text, found {other}"
                ))),
            },
            Some((Value::Object(_), _)) => Err(CanvasError::serialization(format!(
                "{kind}/{key}: expected JSON text, found nested object"
            ))),
            None => Ok(None),
        }
    }

    fn snapshot(&self, kind: CollectionKind) -> BTreeMap<String, Option<String>> {
        self.doc
            .keys(self.map(kind))
            .map(|key| {
                let value = self.read(kind, &key).ok().flatten();
                (key, value)
            })
            .collect()
    }

    /// Wrap a merged document, refusing it unless both root maps exist.
    fn from_merged(doc: AutoCommit) -> CanvasResult<Self> {
        let nodes = existing_map(&doc, NODES_KEY)?;
        let connections = existing_map(&doc, CONNECTIONS_KEY)?;
        Ok(Self {
            doc,
            nodes,
            connections,
        })
    }
}

struct DocumentShared {
    workspace_id: WorkspaceId,
    generation: u64,
    inner: Mutex<Option<DocumentInner>>,
    observers: Mutex<BTreeMap<SubscriptionId, (CollectionKind, ObserverFn)>>,
    next_subscription: AtomicU64,
}

impl DocumentShared {
    fn with_inner<R>(
        &self,
        f: impl FnOnce(&mut DocumentInner) -> CanvasResult<R>,
    ) -> CanvasResult<R> {
        let mut guard = self.inner.lock();
        match guard.as_mut() {
            Some(inner) => f(inner),
            None => Err(CanvasError::document(format!(
                "document for workspace {} (generation {}) has been freed",
                self.workspace_id, self.generation
            ))),
        }
    }

    fn dispatch(&self, batch: &MutationBatch) {
        if batch.changes.is_empty() {
            return;
        }
        let targets: Vec<ObserverFn> = self
            .observers
            .lock()
            .values()
            .filter(|(kind, _)| *kind == batch.collection)
            .map(|(_, observer)| Arc::clone(observer))
            .collect();
        tracing::trace!(
            collection = %batch.collection,
            keys = batch.changes.len(),
            observers = targets.len(),
            "document mutation dispatched"
        );
        for observer in targets {
            observer(batch);
        }
    }
}

// =============================================================================
// Owning handle
// =============================================================================

/// Owning handle to a workspace document.
pub struct SharedDocument {
    shared: Arc<DocumentShared>,
}

impl SharedDocument {
    /// Allocate a document from an optional saved snapshot.
    pub fn from_snapshot(
        workspace_id: WorkspaceId,
        generation: u64,
        snapshot: Option<&[u8]>,
    ) -> CanvasResult<Self> {
        let mut doc = match snapshot {
            Some(bytes) => {
                let mut doc = AutoCommit::load(bytes).map_err(automerge_error)?;
                let has_roots = doc.get(ROOT, NODES_KEY).map_err(automerge_error)?.is_some()
                    || doc.get(ROOT, CONNECTIONS_KEY).map_err(automerge_error)?.is_some();
                if !has_roots {
                    doc.merge(&mut genesis()?).map_err(automerge_error)?;
                }
                doc
            }
            None => genesis()?,
        };
        doc.set_actor(ActorId::random());
        let nodes = ensure_map(&mut doc, NODES_KEY)?;
        let connections = ensure_map(&mut doc, CONNECTIONS_KEY)?;

        tracing::debug!(
            %workspace_id,
            generation,
            from_snapshot = snapshot.is_some(),
            "shared document created"
        );

        Ok(Self {
            shared: Arc::new(DocumentShared {
                workspace_id,
                generation,
                inner: Mutex::new(Some(DocumentInner {
                    doc,
                    nodes,
                    connections,
                })),
                observers: Mutex::new(BTreeMap::new()),
                next_subscription: AtomicU64::new(1),
            }),
        })
    }

    /// Workspace this document belongs to.
    pub fn workspace_id(&self) -> WorkspaceId {
        self.shared.workspace_id
    }

    /// Generation of the session that created this document.
    pub fn generation(&self) -> u64 {
        self.shared.generation
    }

    /// Handle to the `nodes` map.
    pub fn nodes(&self) -> CollectionHandle {
        self.collection(CollectionKind::Nodes)
    }

    /// Handle to the `connections` map.
    pub fn connections(&self) -> CollectionHandle {
        self.collection(CollectionKind::Connections)
    }

    fn collection(&self, kind: CollectionKind) -> CollectionHandle {
        CollectionHandle {
            shared: Arc::clone(&self.shared),
            kind,
        }
    }

    /// Merge a saved document or change set from a peer.
    ///
    /// The merge runs on a fork that replaces the document only if both root
    /// maps survive it; otherwise the document is left exactly as it was.
    /// Observers receive the resulting key changes, nodes before connections.
    pub fn merge_remote(&self, bytes: &[u8]) -> CanvasResult<()> {
        let batches = self.shared.with_inner(|inner| {
            let nodes_before = inner.snapshot(CollectionKind::Nodes);
            let connections_before = inner.snapshot(CollectionKind::Connections);

            let mut merged = inner.doc.fork();
            merged.set_actor(inner.doc.get_actor().clone());
            let applied = merged.load_incremental(bytes).map_err(automerge_error)?;
            let candidate = DocumentInner::from_merged(merged).map_err(|error| {
                tracing::warn!(
                    workspace_id = %self.shared.workspace_id,
                    error = %error,
                    "remote changes rejected"
                );
                error
            })?;
            *inner = candidate;

            let nodes_after = inner.snapshot(CollectionKind::Nodes);
            let connections_after = inner.snapshot(CollectionKind::Connections);
            tracing::debug!(
                workspace_id = %self.shared.workspace_id,
                applied,
                "remote changes merged"
            );

            Ok([
                diff(CollectionKind::Nodes, &nodes_before, &nodes_after),
                diff(
                    CollectionKind::Connections,
                    &connections_before,
                    &connections_after,
                ),
            ])
        })?;

        for batch in &batches {
            self.shared.dispatch(batch);
        }
        Ok(())
    }

    /// Save the full document for the transport.
    pub fn save(&self) -> CanvasResult<Vec<u8>> {
        self.shared.with_inner(|inner| Ok(inner.doc.save()))
    }

    /// Whether [`free`](Self::free) has run.
    pub fn is_freed(&self) -> bool {
        self.shared.inner.lock().is_none()
    }

    /// Release the automerge document and drop every observer.
    ///
    /// Idempotent. Collection handles that outlive this call fail closed.
    pub fn free(&self) {
        let released = self.shared.inner.lock().take().is_some();
        let dropped = {
            let mut observers = self.shared.observers.lock();
            let count = observers.len();
            observers.clear();
            count
        };
        if released {
            tracing::debug!(
                workspace_id = %self.shared.workspace_id,
                generation = self.shared.generation,
                leftover_observers = dropped,
                "shared document freed"
            );
        }
    }
}

impl Drop for SharedDocument {
    fn drop(&mut self) {
        self.free();
    }
}

impl fmt::Debug for SharedDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedDocument")
            .field("workspace_id", &self.shared.workspace_id)
            .field("generation", &self.shared.generation)
            .field("freed", &self.is_freed())
            .finish()
    }
}

// =============================================================================
// Collection handles
// =============================================================================

/// Handle to one collection of a shared document.
#[derive(Clone)]
pub struct CollectionHandle {
    shared: Arc<DocumentShared>,
    kind: CollectionKind,
}

impl CollectionHandle {
    /// Which collection this handle addresses.
    pub fn kind(&self) -> CollectionKind {
        self.kind
    }

    /// Raw JSON text stored under `key`.
    pub fn get_raw(&self, key: &str) -> CanvasResult<Option<String>> {
        self.shared.with_inner(|inner| inner.read(self.kind, key))
    }

    /// All keys, in map order.
    pub fn keys(&self) -> CanvasResult<Vec<String>> {
        self.shared
            .with_inner(|inner| Ok(inner.doc.keys(inner.map(self.kind)).collect()))
    }

    /// Whether `key` is present.
    pub fn contains(&self, key: &str) -> CanvasResult<bool> {
        self.shared.with_inner(|inner| {
            Ok(inner
                .doc
                .get(inner.map(self.kind), key)
                .map_err(automerge_error)?
                .is_some())
        })
    }

    /// Store raw JSON text under `key` and notify observers.
    pub fn put_raw(&self, key: &str, json: String) -> CanvasResult<ChangeKind> {
        let kind = self.shared.with_inner(|inner| {
            let map = inner.map(self.kind).clone();
            let existed = inner.doc.get(&map, key).map_err(automerge_error)?.is_some();
            inner.doc.put(&map, key, json).map_err(automerge_error)?;
            Ok(if existed {
                ChangeKind::Update
            } else {
                ChangeKind::Add
            })
        })?;
        self.shared
            .dispatch(&MutationBatch::single(self.kind, key, kind));
        Ok(kind)
    }

    /// Remove `key` and notify observers. Returns false if it was absent.
    pub fn delete(&self, key: &str) -> CanvasResult<bool> {
        let existed = self.shared.with_inner(|inner| {
            let map = inner.map(self.kind).clone();
            if inner.doc.get(&map, key).map_err(automerge_error)?.is_none() {
                return Ok(false);
            }
            inner.doc.delete(&map, key).map_err(automerge_error)?;
            Ok(true)
        })?;
        if existed {
            self.shared
                .dispatch(&MutationBatch::single(self.kind, key, ChangeKind::Delete));
        }
        Ok(existed)
    }

    /// Typed read. Fails with a serialization error on malformed JSON.
    pub fn get<T: DocumentEntity>(&self, key: &str) -> CanvasResult<Option<T>> {
        self.check_kind::<T>()?;
        match self.get_raw(key)? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Typed write keyed by the entity's own id.
    pub fn put<T: DocumentEntity>(&self, entity: &T) -> CanvasResult<ChangeKind> {
        self.check_kind::<T>()?;
        let json = serde_json::to_string(entity)?;
        self.put_raw(&entity.document_key(), json)
    }

    /// Every well-formed entity in the collection. Malformed entries are
    /// skipped with a warning.
    pub fn entries<T: DocumentEntity>(&self) -> CanvasResult<Vec<T>> {
        self.check_kind::<T>()?;
        self.shared.with_inner(|inner| {
            let map = inner.map(self.kind);
            let mut entries = Vec::new();
            for key in inner.doc.keys(map) {
                let parsed = inner
                    .read(self.kind, &key)
                    .and_then(|raw| match raw {
                        Some(json) => Ok(Some(serde_json::from_str::<T>(&json)?)),
                        None => Ok(None),
                    });
                match parsed {
                    Ok(Some(entity)) if entity.document_key() == key => entries.push(entity),
                    Ok(Some(_)) => tracing::warn!(
                        collection = %self.kind,
                        key = %key,
                        "skipping entry stored under a foreign key"
                    ),
                    Ok(None) => {}
                    Err(error) => tracing::warn!(
                        collection = %self.kind,
                        key = %key,
                        error = %error,
                        "skipping malformed document entry"
                    ),
                }
            }
            Ok(entries)
        })
    }

    /// Register an observer for this collection.
    pub fn observe(&self, observer: ObserverFn) -> SubscriptionId {
        let id = SubscriptionId(self.shared.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.shared
            .observers
            .lock()
            .insert(id, (self.kind, observer));
        id
    }

    /// Remove an observer. Returns false if it was not registered.
    pub fn unobserve(&self, subscription: SubscriptionId) -> bool {
        self.shared.observers.lock().remove(&subscription).is_some()
    }

    /// Observers registered on this collection.
    pub fn observer_count(&self) -> usize {
        self.shared
            .observers
            .lock()
            .values()
            .filter(|(kind, _)| *kind == self.kind)
            .count()
    }

    fn check_kind<T: DocumentEntity>(&self) -> CanvasResult<()> {
        if T::KIND == self.kind {
            Ok(())
        } else {
            Err(CanvasError::invalid(format!(
                "{} entities do not belong in the {} collection",
                T::KIND,
                self.kind
            )))
        }
    }
}

impl fmt::Debug for CollectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionHandle")
            .field("workspace_id", &self.shared.workspace_id)
            .field("generation", &self.shared.generation)
            .field("kind", &self.kind)
            .finish()
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Empty document whose only change creates both root maps. The change is
/// byte-identical on every replica: fixed actor, fixed timestamp, no deps.
fn genesis() -> CanvasResult<AutoCommit> {
    let mut doc = AutoCommit::new().with_actor(ActorId::from(GENESIS_ACTOR.as_slice()));
    doc.put_object(ROOT, NODES_KEY, ObjType::Map)
        .map_err(automerge_error)?;
    doc.put_object(ROOT, CONNECTIONS_KEY, ObjType::Map)
        .map_err(automerge_error)?;
    let _ = doc.commit_with(CommitOptions::default().with_time(0));
    Ok(doc)
}

fn existing_map(doc: &AutoCommit, key: &str) -> CanvasResult<ObjId> {
    match doc.get(ROOT, key).map_err(automerge_error)? {
        Some((Value::Object(ObjType::Map), id)) => Ok(id),
        Some(_) => Err(CanvasError::document(format!(
            "root key {key} is not a map"
        ))),
        None => Err(CanvasError::document(format!("root key {key} is missing"))),
    }
}

fn ensure_map(doc: &mut AutoCommit, key: &str) -> CanvasResult<ObjId> {
    match doc.get(ROOT, key).map_err(automerge_error)? {
        None => doc
            .put_object(ROOT, key, ObjType::Map)
            .map_err(automerge_error),
        Some(_) => existing_map(doc, key),
    }
}

fn diff(
    collection: CollectionKind,
    before: &BTreeMap<String, Option<String>>,
    after: &BTreeMap<String, Option<String>>,
) -> MutationBatch {
    let mut keys: Vec<&String> = before.keys().chain(after.keys()).collect();
    keys.sort();
    keys.dedup();

    let changes = keys
        .into_iter()
        .filter_map(|key| {
            let kind = match (before.get(key), after.get(key)) {
                (None, Some(_)) => ChangeKind::Add,
                (Some(_), None) => ChangeKind::Delete,
                (Some(old), Some(new)) if old != new => ChangeKind::Update,
                _ => return None,
            };
            Some(KeyChange {
                key: key.clone(),
                kind,
            })
        })
        .collect();

    MutationBatch {
        collection,
        changes,
    }
}

fn automerge_error(error: automerge::AutomergeError) -> CanvasError {
    CanvasError::document(error.to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use canvas_core::{ConnectionId, NodeId, Position, Size};

    fn node(n: u128) -> Node {
        Node::new(NodeId::from_u128(n), Position::new(n as f64, 0.0), Size::new(10.0, 10.0))
    }

    fn recording(handle: &CollectionHandle) -> Arc<Mutex<Vec<MutationBatch>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        handle.observe(Arc::new(move |batch: &MutationBatch| sink.lock().push(batch.clone())));
        seen
    }

    fn fresh() -> SharedDocument {
        SharedDocument::from_snapshot(WorkspaceId::from_u128(1), 1, None).unwrap()
    }

    #[test]
    fn local_edits_emit_single_key_batches() {
        let doc = fresh();
        let nodes = doc.nodes();
        let seen = recording(&nodes);

        let n1 = node(1);
        assert_eq!(nodes.put(&n1).unwrap(), ChangeKind::Add);
        assert_eq!(nodes.put(&n1.clone().with_content("hi")).unwrap(), ChangeKind::Update);
        assert!(nodes.delete(&n1.id.to_string()).unwrap());
        assert!(!nodes.delete(&n1.id.to_string()).unwrap());

        let kinds: Vec<_> = seen.lock().iter().map(|b| b.changes[0].kind).collect();
        assert_eq!(kinds, vec![ChangeKind::Add, ChangeKind::Update, ChangeKind::Delete]);
    }

    #[test]
    fn observers_only_see_their_collection() {
        let doc = fresh();
        let node_events = recording(&doc.nodes());
        let a = NodeId::from_u128(1);
        let b = NodeId::from_u128(2);
        doc.connections()
            .put(&Connection::new(ConnectionId::from_u128(3), a, b))
            .unwrap();
        assert!(node_events.lock().is_empty());
        assert_eq!(doc.connections().entries::<Connection>().unwrap().len(), 1);
    }

    #[test]
    fn wrong_entity_type_is_rejected() {
        let doc = fresh();
        let err = doc.connections().put(&node(1)).unwrap_err();
        assert!(matches!(err, CanvasError::Invalid { .. }));
    }

    #[test]
    fn merge_reports_diff_in_key_order() {
        let doc = fresh();
        let n1 = node(1);
        let n2 = node(2);
        doc.nodes().put(&n1).unwrap();
        doc.nodes().put(&n2).unwrap();

        let mut peer = AutoCommit::load(&doc.save().unwrap()).unwrap();
        peer.set_actor(automerge::ActorId::random());
        let peer_nodes = match peer.get(ROOT, NODES_KEY).unwrap() {
            Some((_, id)) => id,
            None => panic!("peer lost the nodes map"),
        };
        peer.delete(&peer_nodes, n1.id.to_string()).unwrap();
        let n3 = node(3);
        peer.put(&peer_nodes, n3.id.to_string(), serde_json::to_string(&n3).unwrap())
            .unwrap();
        let moved = Node { position: Position::new(99.0, 99.0), ..n2.clone() };
        peer.put(&peer_nodes, n2.id.to_string(), serde_json::to_string(&moved).unwrap())
            .unwrap();

        let seen = recording(&doc.nodes());
        doc.merge_remote(&peer.save()).unwrap();

        let batches = seen.lock().clone();
        assert_eq!(batches.len(), 1);
        let changes: Vec<_> = batches[0]
            .changes
            .iter()
            .map(|c| (c.key.clone(), c.kind))
            .collect();
        assert_eq!(
            changes,
            vec![
                (n1.id.to_string(), ChangeKind::Delete),
                (n2.id.to_string(), ChangeKind::Update),
                (n3.id.to_string(), ChangeKind::Add),
            ]
        );
        assert_eq!(doc.nodes().get::<Node>(&n2.id.to_string()).unwrap(), Some(moved));
    }

    #[test]
    fn malformed_entries_are_skipped() {
        let doc = fresh();
        doc.nodes().put(&node(1)).unwrap();
        doc.nodes().put_raw("garbage", "{not json".to_string()).unwrap();
        assert_eq!(doc.nodes().entries::<Node>().unwrap().len(), 1);
        assert!(matches!(
            doc.nodes().get::<Node>("garbage"),
            Err(CanvasError::Serialization { .. })
        ));
    }

    #[test]
    fn handles_fail_closed_after_free() {
        let doc = fresh();
        let nodes = doc.nodes();
        nodes.observe(Arc::new(|_: &MutationBatch| {}));
        doc.free();
        doc.free();
        assert!(doc.is_freed());
        assert_eq!(nodes.observer_count(), 0);
        assert!(matches!(nodes.put(&node(1)), Err(CanvasError::Document { .. })));
        assert!(matches!(nodes.keys(), Err(CanvasError::Document { .. })));
    }

    #[test]
    fn snapshot_round_trip_keeps_entities() {
        let doc = fresh();
        doc.nodes().put(&node(5)).unwrap();
        let copy =
            SharedDocument::from_snapshot(WorkspaceId::from_u128(1), 2, Some(&doc.save().unwrap()))
                .unwrap();
        assert_eq!(copy.nodes().keys().unwrap(), vec![NodeId::from_u128(5).to_string()]);
    }

    #[test]
    fn independently_created_documents_merge_without_loss() {
        let left = fresh();
        let right = SharedDocument::from_snapshot(WorkspaceId::from_u128(1), 7, None).unwrap();
        left.nodes().put(&node(1)).unwrap();
        right.nodes().put(&node(2)).unwrap();
        left.connections()
            .put(&Connection::new(ConnectionId::from_u128(3), NodeId::from_u128(1), NodeId::from_u128(2)))
            .unwrap();

        let left_bytes = left.save().unwrap();
        left.merge_remote(&right.save().unwrap()).unwrap();
        right.merge_remote(&left_bytes).unwrap();

        let expected = vec![NodeId::from_u128(1).to_string(), NodeId::from_u128(2).to_string()];
        assert_eq!(left.nodes().keys().unwrap(), expected);
        assert_eq!(right.nodes().keys().unwrap(), expected);
        assert_eq!(right.connections().keys().unwrap().len(), 1);
    }

    #[test]
    fn merge_that_breaks_a_root_map_leaves_the_document_untouched() {
        let doc = fresh();
        doc.nodes().put(&node(1)).unwrap();

        let mut peer = AutoCommit::load(&doc.save().unwrap()).unwrap();
        peer.set_actor(automerge::ActorId::random());
        peer.put(ROOT, NODES_KEY, "x").unwrap();

        let seen = recording(&doc.nodes());
        let err = doc.merge_remote(&peer.save()).unwrap_err();
        assert!(matches!(err, CanvasError::Document { .. }));
        assert!(seen.lock().is_empty());

        assert_eq!(doc.nodes().keys().unwrap(), vec![NodeId::from_u128(1).to_string()]);
        doc.nodes().put(&node(2)).unwrap();
        let reloaded = AutoCommit::load(&doc.save().unwrap()).unwrap();
        assert!(matches!(
            reloaded.get(ROOT, NODES_KEY).unwrap(),
            Some((Value::Object(ObjType::Map), _))
        ));
        assert_eq!(doc.nodes().entries::<Node>().unwrap().len(), 2);
    }
}
