//! Canvas Core: shared vocabulary for the collaborative canvas
//!
//! Foundation types used by the synchronization core and its collaborators:
//! **identifiers** (node, connection, workspace and user ids), the **model**
//! (`Node`, `Connection` and the geometry they are placed with), the unified
//! **errors** type, and **config** for tuning the synchronization core.
//!
//! Nothing in this crate touches the shared document or the runtime. It is
//! plain data, so frontends and transports can depend on it without pulling
//! in the synchronization machinery.

#![forbid(unsafe_code)]

pub mod config;
pub mod errors;
pub mod identifiers;
pub mod model;

pub use config::{SyncConfig, SyncConfigBuilder};
pub use errors::{CanvasError, CanvasResult};
pub use identifiers::{ConnectionId, NodeId, UserId, WorkspaceId};
pub use model::{Connection, ConnectionStyle, LineKind, Node, Position, Rect, Size};
