//! Property test strategies
//!
//! Operation scripts for fuzzing the session lifecycle against concurrent
//! document access.

use proptest::prelude::*;

pub use proptest;

use canvas_core::NodeId;

/// One step of a lifecycle fuzz script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleOp {
    /// Mount
    Initialize,
    /// Start unmounting
    BeginDestroy,
    /// Finish unmounting
    CompleteDestroy,
    /// Both halves
    Destroy,
    /// Local create of a small-id node
    CreateNode(u8),
    /// Local move of a small-id node
    MoveNode(u8),
    /// Peer deletes a node and the merge is applied
    RemoteDelete(u8),
    /// Peer creates or edits a node and the merge is applied
    RemoteUpsert(u8),
    /// Click-select
    Select(u8),
    /// Restore a possibly stale selection
    RestoreSelection(Vec<u8>),
    /// Confirmed delete of the selection
    DeleteSelected,
    /// Flush observers immediately
    Flush,
    /// Let tokio time pass
    Advance(u8),
}

/// Node id for a small fixture index.
pub fn small_node_id(n: u8) -> NodeId {
    NodeId::from_u128(u128::from(n))
}

/// Strategy over single operations, weighted toward lifecycle edges.
pub fn arb_lifecycle_op() -> impl Strategy<Value = LifecycleOp> {
    let id = 0u8..6;
    prop_oneof![
        3 => Just(LifecycleOp::Initialize),
        2 => Just(LifecycleOp::BeginDestroy),
        2 => Just(LifecycleOp::CompleteDestroy),
        1 => Just(LifecycleOp::Destroy),
        3 => id.clone().prop_map(LifecycleOp::CreateNode),
        2 => id.clone().prop_map(LifecycleOp::MoveNode),
        2 => id.clone().prop_map(LifecycleOp::RemoteDelete),
        2 => id.clone().prop_map(LifecycleOp::RemoteUpsert),
        2 => id.clone().prop_map(LifecycleOp::Select),
        1 => proptest::collection::vec(id, 0..4).prop_map(LifecycleOp::RestoreSelection),
        2 => Just(LifecycleOp::DeleteSelected),
        1 => Just(LifecycleOp::Flush),
        2 => (0u8..40).prop_map(LifecycleOp::Advance),
    ]
}

/// Strategy over operation scripts.
pub fn arb_lifecycle_script(max_len: usize) -> impl Strategy<Value = Vec<LifecycleOp>> {
    proptest::collection::vec(arb_lifecycle_op(), 1..max_len)
}
