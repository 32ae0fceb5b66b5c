//! Canvas session
//!
//! Boundary facade for a mounted canvas. The component layer calls
//! `initialize` on mount and `begin_destroy`/`complete_destroy` (or
//! `destroy`) on unmount; everything in between goes through here. No entry
//! point panics: document operations return `CanvasResult`, deletes return a
//! [`DeleteReport`] and teardown returns a [`TeardownReport`].

use std::collections::BTreeSet;
use std::sync::Arc;

use canvas_core::{
    CanvasError, CanvasResult, Connection, ConnectionId, Node, NodeId, Rect, SyncConfig, UserId,
    WorkspaceId,
};

use crate::cleanup::{CleanupError, CleanupToken};
use crate::delete::{ConfirmedDeleteCoordinator, DeleteReport, RemoteDeleteEffects};
use crate::document::{CollectionKind, DocumentSource, SharedDocument};
use crate::lifecycle::{
    ActiveSession, InitOutcome, InitRejected, Lifecycle, LifecyclePhase, TeardownReport,
};
use crate::metrics::{SyncMetrics, SyncMetricsSnapshot};
use crate::mirror::{MirrorHandle, MirrorStore};
use crate::observers::ChangeObserver;

/// One mounted canvas.
pub struct CanvasSession {
    config: SyncConfig,
    lifecycle: Lifecycle,
    mirror: MirrorHandle,
    metrics: Arc<SyncMetrics>,
    source: Arc<dyn DocumentSource>,
    deletes: ConfirmedDeleteCoordinator,
}

impl CanvasSession {
    /// Create an uninitialized session.
    pub fn new(
        config: SyncConfig,
        source: Arc<dyn DocumentSource>,
        remote: Arc<dyn RemoteDeleteEffects>,
    ) -> CanvasResult<Self> {
        config.validate()?;
        let metrics = Arc::new(SyncMetrics::new());
        Ok(Self {
            lifecycle: Lifecycle::new(Arc::clone(&metrics)),
            mirror: MirrorHandle::new(Arc::clone(&metrics)),
            deletes: ConfirmedDeleteCoordinator::new(remote, &config),
            metrics,
            source,
            config,
        })
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Mount: create a new document, seed the mirror and attach observers.
    pub async fn initialize(&self, workspace_id: WorkspaceId, user_id: UserId) -> InitOutcome {
        if let Some(rejected) = self.lifecycle.check_initialize() {
            tracing::warn!(%workspace_id, reason = %rejected, "initialize rejected");
            return InitOutcome::Rejected(rejected);
        }

        let snapshot = match self.source.load_snapshot(workspace_id).await {
            Ok(snapshot) => snapshot,
            Err(error) => {
                tracing::warn!(%workspace_id, error = %error, "document snapshot unavailable");
                return InitOutcome::Rejected(InitRejected::Failed(error));
            }
        };

        let weak = self.lifecycle.downgrade();
        self.lifecycle.initialize(workspace_id, user_id, |generation| {
            let document = SharedDocument::from_snapshot(workspace_id, generation, snapshot.as_deref())?;
            let mut session = ActiveSession::new(workspace_id, user_id, generation, document);

            let nodes = session.nodes().entries::<Node>()?;
            let connections = session.connections().entries::<Connection>()?;
            self.mirror.replace_all(nodes, connections);

            for kind in [CollectionKind::Nodes, CollectionKind::Connections] {
                let observer = ChangeObserver::attach(
                    session.collection(kind),
                    generation,
                    weak.clone(),
                    self.mirror.clone(),
                    &self.config,
                    Arc::clone(&self.metrics),
                );
                session.add_observer(observer);
            }

            let mirror = self.mirror.clone();
            session.cleanup_mut().register("reset mirror store", move || {
                mirror.reset();
                Ok(())
            });
            Ok(session)
        })
    }

    /// Unmount, first half: cancel debounces and unsubscribe observers.
    pub fn begin_destroy(&self) -> bool {
        self.lifecycle.begin_destroy()
    }

    /// Unmount, second half: run cleanup and free the document.
    pub fn complete_destroy(&self) -> Option<TeardownReport> {
        self.lifecycle.complete_destroy()
    }

    /// Full unmount.
    pub fn destroy(&self) -> Option<TeardownReport> {
        self.lifecycle.destroy()
    }

    /// Current phase.
    pub fn phase(&self) -> LifecyclePhase {
        self.lifecycle.phase()
    }

    /// Generation of the active session.
    pub fn generation(&self) -> Option<u64> {
        self.lifecycle.generation()
    }

    /// Register a teardown callback on the active session.
    pub fn register_cleanup<F>(&self, description: impl Into<String>, callback: F) -> CanvasResult<CleanupToken>
    where
        F: FnOnce() -> Result<(), CleanupError> + Send + 'static,
    {
        let description = description.into();
        self.lifecycle.with_active("register_cleanup", move |session| {
            session.cleanup_mut().register(description, callback)
        })
    }

    /// Drop a teardown callback that has not run yet.
    pub fn unregister_cleanup(&self, token: CleanupToken) -> CanvasResult<bool> {
        self.lifecycle
            .with_active("unregister_cleanup", |session| session.cleanup_mut().unregister(token))
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// The mirror store handle.
    pub fn mirror(&self) -> &MirrorHandle {
        &self.mirror
    }

    /// Clone of the mirror state.
    pub fn snapshot(&self) -> MirrorStore {
        self.mirror.snapshot()
    }

    /// Session counters.
    pub fn metrics(&self) -> SyncMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Active configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    // =========================================================================
    // Local edits
    // =========================================================================

    /// Add a new node. Fails if the id is taken.
    pub fn create_node(&self, node: Node) -> CanvasResult<()> {
        self.lifecycle.with_active("create_node", |session| {
            let key = node.id.to_string();
            if session.nodes().contains(&key)? {
                return Err(CanvasError::invalid(format!("node {key} already exists")));
            }
            session.nodes().put(&node).map(|_| ())
        })?
    }

    /// Edit a node in place (move, resize, content, metadata).
    pub fn update_node(&self, id: NodeId, edit: impl FnOnce(&mut Node)) -> CanvasResult<Node> {
        self.lifecycle.with_active("update_node", |session| {
            let key = id.to_string();
            let mut node = session
                .nodes()
                .get::<Node>(&key)?
                .ok_or_else(|| CanvasError::not_found(format!("node {key}")))?;
            edit(&mut node);
            node.id = id;
            session.nodes().put(&node)?;
            Ok(node)
        })?
    }

    /// Connect two existing nodes.
    pub fn add_connection(&self, connection: Connection) -> CanvasResult<()> {
        self.lifecycle.with_active("add_connection", |session| {
            for endpoint in [connection.source_node_id, connection.target_node_id] {
                if !session.nodes().contains(&endpoint.to_string())? {
                    return Err(CanvasError::invalid(format!(
                        "connection {} references missing node {endpoint}",
                        connection.id
                    )));
                }
            }
            session.connections().put(&connection).map(|_| ())
        })?
    }

    /// Remove a connection. Returns false if it did not exist.
    pub fn remove_connection(&self, id: ConnectionId) -> CanvasResult<bool> {
        self.lifecycle.with_active("remove_connection", |session| {
            session.connections().delete(&id.to_string())
        })?
    }

    // =========================================================================
    // Transport
    // =========================================================================

    /// Merge bytes delivered by the transport.
    pub fn apply_remote_changes(&self, bytes: &[u8]) -> CanvasResult<()> {
        self.lifecycle.with_active("apply_remote_changes", |session| {
            session.document().merge_remote(bytes)
        })?
    }

    /// Save the document for the transport.
    pub fn export_document(&self) -> CanvasResult<Vec<u8>> {
        self.lifecycle
            .with_active("export_document", |session| session.document().save())?
    }

    // =========================================================================
    // Selection
    // =========================================================================

    /// Click-select a node. Returns false for ids not in the mirror.
    pub fn select(&self, id: NodeId) -> bool {
        self.mirror.update(|store| store.select(id))
    }

    /// Flip a node's selection.
    pub fn toggle_selection(&self, id: NodeId) -> bool {
        self.mirror.update(|store| store.toggle_selection(id))
    }

    /// Deselect a node.
    pub fn deselect(&self, id: NodeId) -> bool {
        self.mirror.update(|store| store.deselect(&id))
    }

    /// Clear the selection.
    pub fn clear_selection(&self) {
        self.mirror.update(MirrorStore::clear_selection);
    }

    /// Area-select against live mirror geometry.
    pub fn select_area(&self, area: Rect) -> BTreeSet<NodeId> {
        self.mirror.update(|store| store.select_area(area))
    }

    /// Restore a persisted selection without validation.
    pub fn restore_selection(&self, ids: impl IntoIterator<Item = NodeId>) {
        self.mirror.update(|store| store.restore_selection(ids));
    }

    /// Currently selected ids.
    pub fn selected(&self) -> BTreeSet<NodeId> {
        self.mirror.read(|store| store.selected.clone())
    }

    // =========================================================================
    // Deletes
    // =========================================================================

    /// Confirmed delete of the current selection.
    pub async fn delete_selected(&self) -> DeleteReport {
        let ids = self.selected();
        self.delete_many(ids).await
    }

    /// Confirmed delete of `ids`.
    pub async fn delete_many(&self, ids: impl IntoIterator<Item = NodeId>) -> DeleteReport {
        let ids: BTreeSet<NodeId> = ids.into_iter().collect();
        self.deletes
            .delete_many(&self.lifecycle, &self.mirror, ids)
            .await
    }

    // =========================================================================
    // Observer control
    // =========================================================================

    /// Apply pending observer batches now. Returns how many ran.
    pub fn flush_pending(&self) -> usize {
        self.lifecycle
            .observers()
            .iter()
            .filter(|observer| observer.flush())
            .count()
    }

    /// Whether any observer batch is waiting for its debounce window.
    pub fn has_pending_updates(&self) -> bool {
        self.lifecycle
            .observers()
            .iter()
            .any(ChangeObserver::is_pending)
    }
}

impl std::fmt::Debug for CanvasSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CanvasSession")
            .field("phase", &self.lifecycle.phase())
            .field("config", &self.config)
            .field("mirror", &self.mirror)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::delete::RemoteDeleteError;
    use crate::document::EmptyDocumentSource;
    use async_trait::async_trait;
    use canvas_core::{Position, Size};

    struct AlwaysOk;

    #[async_trait]
    impl RemoteDeleteEffects for AlwaysOk {
        async fn delete_node(&self, _: WorkspaceId, _: NodeId) -> Result<(), RemoteDeleteError> {
            Ok(())
        }
    }

    fn session() -> CanvasSession {
        CanvasSession::new(
            SyncConfig::default(),
            Arc::new(EmptyDocumentSource),
            Arc::new(AlwaysOk),
        )
        .unwrap()
    }

    fn node(n: u128) -> Node {
        Node::new(NodeId::from_u128(n), Position::default(), Size::new(5.0, 5.0))
    }

    #[tokio::test(start_paused = true)]
    async fn edits_outside_active_are_rejected() {
        let session = session();
        let err = session.create_node(node(1)).unwrap_err();
        assert!(err.is_lifecycle());
        assert!(session.export_document().is_err());
        assert_eq!(session.metrics().stale_access_rejections, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_create_is_invalid() {
        let session = session();
        session
            .initialize(WorkspaceId::from_u128(1), UserId::from_u128(1))
            .await;
        session.create_node(node(1)).unwrap();
        let err = session.create_node(node(1)).unwrap_err();
        assert!(matches!(err, CanvasError::Invalid { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn connection_endpoints_must_exist() {
        let session = session();
        session
            .initialize(WorkspaceId::from_u128(1), UserId::from_u128(1))
            .await;
        session.create_node(node(1)).unwrap();
        let dangling = Connection::new(ConnectionId::from_u128(5), NodeId::from_u128(1), NodeId::from_u128(2));
        assert!(session.add_connection(dangling).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn update_keeps_the_node_id() {
        let session = session();
        session
            .initialize(WorkspaceId::from_u128(1), UserId::from_u128(1))
            .await;
        session.create_node(node(1)).unwrap();
        let updated = session
            .update_node(NodeId::from_u128(1), |n| {
                n.id = NodeId::from_u128(99);
                n.position = Position::new(4.0, 2.0);
            })
            .unwrap();
        assert_eq!(updated.id, NodeId::from_u128(1));
        assert_eq!(session.flush_pending(), 1);
        let mirrored = session.snapshot().nodes.get(&NodeId::from_u128(1)).cloned().unwrap();
        assert_eq!(mirrored.position, Position::new(4.0, 2.0));
    }

    #[test]
    fn invalid_config_is_refused() {
        let config = SyncConfig {
            max_concurrent_deletes: 0,
            ..SyncConfig::default()
        };
        assert!(CanvasSession::new(config, Arc::new(EmptyDocumentSource), Arc::new(AlwaysOk)).is_err());
    }
}
