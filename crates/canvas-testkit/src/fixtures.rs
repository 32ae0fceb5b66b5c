//! Fixtures
//!
//! Deterministic ids and entities, session constructors and time helpers.

use std::sync::Arc;
use std::time::Duration;

use canvas_core::{
    Connection, ConnectionId, Node, NodeId, Position, Size, SyncConfig, UserId, WorkspaceId,
};
use canvas_sync::{CanvasSession, DocumentSource, InitOutcome, RemoteDeleteEffects};

use crate::mocks::{MemoryDocumentSource, ScriptedDeleteEndpoint};

/// Long enough for every default debounce window to fire.
pub const SETTLE: Duration = Duration::from_millis(50);

/// Workspace used by fixtures.
pub fn workspace() -> WorkspaceId {
    WorkspaceId::from_u128(0xC0FFEE)
}

/// User used by fixtures.
pub fn user() -> UserId {
    UserId::from_u128(0xBEEF)
}

/// Deterministic node id.
pub fn node_id(n: u128) -> NodeId {
    NodeId::from_u128(n)
}

/// 50x50 node laid out on a row, `n * 100` from the origin.
pub fn node(n: u128) -> Node {
    let x = f64::from(u32::try_from(n).unwrap_or(u32::MAX)) * 100.0;
    node_at(n, x, 0.0)
}

/// 50x50 node at a position.
pub fn node_at(n: u128, x: f64, y: f64) -> Node {
    Node::new(node_id(n), Position::new(x, y), Size::new(50.0, 50.0))
        .with_content(format!("node {n}"))
}

/// Connection between two fixture nodes.
pub fn connection(n: u128, source: u128, target: u128) -> Connection {
    Connection::new(ConnectionId::from_u128(n), node_id(source), node_id(target))
}

/// Uninitialized session with default config.
pub fn session_with(endpoint: ScriptedDeleteEndpoint) -> CanvasSession {
    session_with_parts(SyncConfig::default(), MemoryDocumentSource::new(), endpoint)
}

/// Uninitialized session from explicit parts.
pub fn session_with_parts(
    config: SyncConfig,
    source: impl DocumentSource + 'static,
    endpoint: impl RemoteDeleteEffects + 'static,
) -> CanvasSession {
    CanvasSession::new(config, Arc::new(source), Arc::new(endpoint)).expect("valid config")
}

/// Active session holding `nodes`, with the mirror settled.
pub async fn active_session(
    endpoint: ScriptedDeleteEndpoint,
    nodes: impl IntoIterator<Item = u128>,
) -> CanvasSession {
    let session = session_with(endpoint);
    let outcome = session.initialize(workspace(), user()).await;
    assert!(matches!(outcome, InitOutcome::Active { .. }), "initialize: {outcome:?}");
    for n in nodes {
        session.create_node(node(n)).expect("create fixture node");
    }
    settle().await;
    session
}

/// Let pending debounce windows fire.
pub async fn settle() {
    tokio::time::sleep(SETTLE).await;
}
