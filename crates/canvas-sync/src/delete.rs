//! Confirmed-delete coordinator
//!
//! User-initiated deletes are authoritative on the server first. For each id
//! that survives selection validation the coordinator awaits the remote
//! delete, and only on confirmation removes the node from the shared document.
//! The mirror is never touched directly; it follows through the node
//! observer like any other document change.
//!
//! Outcomes are independent per id: one failure never stops the rest.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

use canvas_core::{NodeId, SyncConfig, WorkspaceId};

use crate::lifecycle::Lifecycle;
use crate::mirror::MirrorHandle;
use crate::selection::SelectionValidator;

/// Failure reported by the remote delete endpoint.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteDeleteError {
    /// The entity does not exist server-side
    #[error("node {0} not found")]
    NotFound(NodeId),
    /// The request did not complete
    #[error("network error: {0}")]
    Network(String),
    /// The server refused or failed the request
    #[error("server error: {0}")]
    Server(String),
}

/// Authoritative delete endpoint.
#[async_trait]
pub trait RemoteDeleteEffects: Send + Sync {
    /// Delete one node in one workspace.
    async fn delete_node(
        &self,
        workspace_id: WorkspaceId,
        node_id: NodeId,
    ) -> Result<(), RemoteDeleteError>;
}

/// Per-id result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeleteOutcome {
    /// Deleted remotely, then locally
    Succeeded,
    /// Already gone remotely; removed locally as well
    NotFound,
    /// Remote delete failed; nothing changed locally
    Failed(String),
}

/// One line of a [`DeleteReport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteEntry {
    /// Node the request was for
    pub id: NodeId,
    /// What happened
    pub outcome: DeleteOutcome,
}

/// Result of a delete batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteReport {
    /// One entry per validated id, in id order
    pub entries: Vec<DeleteEntry>,
    /// Ids dropped because they were no longer in the mirror, including
    /// stale ids pruned from the stored selection
    pub ghosts: BTreeSet<NodeId>,
    /// No session was active, so nothing was attempted
    pub session_inactive: bool,
}

impl DeleteReport {
    /// Whether no entity was processed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Outcome for `id`, if it was processed.
    pub fn outcome(&self, id: &NodeId) -> Option<&DeleteOutcome> {
        self.entries
            .iter()
            .find(|entry| &entry.id == id)
            .map(|entry| &entry.outcome)
    }

    /// Ids deleted remotely.
    pub fn succeeded(&self) -> Vec<NodeId> {
        self.ids_where(|outcome| matches!(outcome, DeleteOutcome::Succeeded))
    }

    /// Ids the server no longer knew.
    pub fn not_found(&self) -> Vec<NodeId> {
        self.ids_where(|outcome| matches!(outcome, DeleteOutcome::NotFound))
    }

    /// Ids whose delete failed and should be surfaced to the user.
    pub fn failed(&self) -> Vec<NodeId> {
        self.ids_where(|outcome| matches!(outcome, DeleteOutcome::Failed(_)))
    }

    /// Whether every processed id is gone.
    pub fn all_removed(&self) -> bool {
        self.entries
            .iter()
            .all(|entry| !matches!(entry.outcome, DeleteOutcome::Failed(_)))
    }

    fn ids_where(&self, predicate: impl Fn(&DeleteOutcome) -> bool) -> Vec<NodeId> {
        self.entries
            .iter()
            .filter(|entry| predicate(&entry.outcome))
            .map(|entry| entry.id)
            .collect()
    }
}

/// Runs confirmed deletes for one session.
#[derive(Clone)]
pub struct ConfirmedDeleteCoordinator {
    remote: Arc<dyn RemoteDeleteEffects>,
    max_concurrent: usize,
    restore_failed_selection: bool,
}

impl ConfirmedDeleteCoordinator {
    /// Create a coordinator using `config` limits.
    pub fn new(remote: Arc<dyn RemoteDeleteEffects>, config: &SyncConfig) -> Self {
        Self {
            remote,
            max_concurrent: config.max_concurrent_deletes.max(1),
            restore_failed_selection: config.restore_failed_selection,
        }
    }

    /// Delete `ids` with server confirmation.
    ///
    /// Ghost ids are dropped (and pruned from the stored selection), the
    /// selection is cleared, and each remaining id is deleted remotely then
    /// locally. Ids that failed remotely are re-selected when configured.
    pub async fn delete_many(
        &self,
        lifecycle: &Lifecycle,
        mirror: &MirrorHandle,
        ids: BTreeSet<NodeId>,
    ) -> DeleteReport {
        let Some((workspace_id, generation)) = lifecycle.active_context() else {
            lifecycle.reject_stale("delete_many");
            return DeleteReport {
                session_inactive: true,
                ..DeleteReport::default()
            };
        };

        let (operative, ghosts) = mirror.update(|store| {
            let operative = SelectionValidator::validate(&ids, store);
            let mut ghosts = SelectionValidator::ghosts(&ids, store);
            ghosts.extend(SelectionValidator::prune_stored(store));
            store.clear_selection();
            (operative, ghosts)
        });
        if !ghosts.is_empty() {
            tracing::debug!(count = ghosts.len(), "ghost ids skipped for delete");
        }

        let remote = &self.remote;
        let mut results = stream::iter(operative)
            .map(|id| async move { (id, remote.delete_node(workspace_id, id).await) })
            .buffered(self.max_concurrent);

        let mut entries = Vec::new();
        while let Some((id, result)) = results.next().await {
            let outcome = match result {
                Ok(()) => {
                    remove_locally(lifecycle, generation, id);
                    DeleteOutcome::Succeeded
                }
                Err(RemoteDeleteError::NotFound(_)) => {
                    tracing::info!(node_id = %id, "node already deleted remotely");
                    remove_locally(lifecycle, generation, id);
                    DeleteOutcome::NotFound
                }
                Err(error) => {
                    tracing::warn!(node_id = %id, error = %error, "remote delete failed");
                    DeleteOutcome::Failed(error.to_string())
                }
            };
            entries.push(DeleteEntry { id, outcome });
        }

        let report = DeleteReport {
            entries,
            ghosts,
            session_inactive: false,
        };

        let failed = report.failed();
        if self.restore_failed_selection && !failed.is_empty() {
            mirror.update(|store| {
                for id in failed {
                    store.select(id);
                }
            });
        }

        tracing::debug!(
            %workspace_id,
            succeeded = report.succeeded().len(),
            not_found = report.not_found().len(),
            failed = report.failed().len(),
            ghosts = report.ghosts.len(),
            "delete batch finished"
        );
        report
    }
}

impl std::fmt::Debug for ConfirmedDeleteCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfirmedDeleteCoordinator")
            .field("max_concurrent", &self.max_concurrent)
            .field("restore_failed_selection", &self.restore_failed_selection)
            .finish_non_exhaustive()
    }
}

fn remove_locally(lifecycle: &Lifecycle, generation: u64, id: NodeId) {
    let key = id.to_string();
    match lifecycle.try_active(generation, |session| session.nodes().delete(&key)) {
        Some(Ok(true)) => tracing::trace!(node_id = %id, "node removed from document"),
        Some(Ok(false)) => tracing::debug!(node_id = %id, "node already absent from document"),
        Some(Err(error)) => {
            tracing::warn!(node_id = %id, error = %error, "document delete failed after remote confirmation");
        }
        None => {
            tracing::warn!(node_id = %id, generation, "remote delete confirmed after session ended");
        }
    }
}
