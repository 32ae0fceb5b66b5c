//! Scripted collaborators
//!
//! Uses `parking_lot::Mutex`; every test drives these from one runtime.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use canvas_core::{CanvasError, CanvasResult, NodeId, WorkspaceId};
use canvas_sync::{DocumentSource, RemoteDeleteEffects, RemoteDeleteError};

// =============================================================================
// Remote delete endpoint
// =============================================================================

/// Remote delete endpoint with per-id scripted results.
///
/// Unscripted ids succeed. Every call is logged, including failed ones.
#[derive(Debug, Clone, Default)]
pub struct ScriptedDeleteEndpoint {
    state: Arc<Mutex<EndpointState>>,
}

#[derive(Debug, Default)]
struct EndpointState {
    scripted: HashMap<NodeId, RemoteDeleteError>,
    calls: Vec<(WorkspaceId, NodeId)>,
    latency: Option<Duration>,
    in_flight: usize,
    max_in_flight: usize,
}

impl ScriptedDeleteEndpoint {
    /// Endpoint where every delete succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make deletes of `id` fail with a network error.
    pub fn fail_network(self, id: NodeId, reason: impl Into<String>) -> Self {
        self.script(id, RemoteDeleteError::Network(reason.into()))
    }

    /// Make deletes of `id` fail with a server error.
    pub fn fail_server(self, id: NodeId, reason: impl Into<String>) -> Self {
        self.script(id, RemoteDeleteError::Server(reason.into()))
    }

    /// Make deletes of `id` report not-found.
    pub fn not_found(self, id: NodeId) -> Self {
        self.script(id, RemoteDeleteError::NotFound(id))
    }

    /// Delay every call by `latency` (tokio time).
    pub fn with_latency(self, latency: Duration) -> Self {
        self.state.lock().latency = Some(latency);
        self
    }

    /// Make the next deletes of `id` fail with `error`.
    pub fn script(self, id: NodeId, error: RemoteDeleteError) -> Self {
        self.state.lock().scripted.insert(id, error);
        self
    }

    /// Remove a scripted failure so `id` succeeds from now on.
    pub fn heal(&self, id: &NodeId) {
        self.state.lock().scripted.remove(id);
    }

    /// Ids requested so far, in call order.
    pub fn calls(&self) -> Vec<NodeId> {
        self.state.lock().calls.iter().map(|(_, id)| *id).collect()
    }

    /// Number of calls so far.
    pub fn call_count(&self) -> usize {
        self.state.lock().calls.len()
    }

    /// Highest number of calls observed in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.state.lock().max_in_flight
    }
}

#[async_trait]
impl RemoteDeleteEffects for ScriptedDeleteEndpoint {
    async fn delete_node(
        &self,
        workspace_id: WorkspaceId,
        node_id: NodeId,
    ) -> Result<(), RemoteDeleteError> {
        let latency = {
            let mut state = self.state.lock();
            state.calls.push((workspace_id, node_id));
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            state.latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.state.lock();
        state.in_flight -= 1;
        match state.scripted.get(&node_id) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

// =============================================================================
// Document source
// =============================================================================

/// In-memory snapshots keyed by workspace.
#[derive(Debug, Clone, Default)]
pub struct MemoryDocumentSource {
    snapshots: Arc<Mutex<HashMap<WorkspaceId, Vec<u8>>>>,
    failure: Arc<Mutex<Option<CanvasError>>>,
}

impl MemoryDocumentSource {
    /// Source with no snapshots.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `bytes` for `workspace_id`.
    pub fn with_snapshot(self, workspace_id: WorkspaceId, bytes: Vec<u8>) -> Self {
        self.snapshots.lock().insert(workspace_id, bytes);
        self
    }

    /// Fail every load with `error` until cleared.
    pub fn fail_with(&self, error: CanvasError) {
        *self.failure.lock() = Some(error);
    }

    /// Stop failing.
    pub fn clear_failure(&self) {
        *self.failure.lock() = None;
    }
}

#[async_trait]
impl DocumentSource for MemoryDocumentSource {
    async fn load_snapshot(&self, workspace_id: WorkspaceId) -> CanvasResult<Option<Vec<u8>>> {
        if let Some(error) = self.failure.lock().clone() {
            return Err(error);
        }
        Ok(self.snapshots.lock().get(&workspace_id).cloned())
    }
}
