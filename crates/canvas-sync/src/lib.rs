//! Canvas Sync: lifecycle-safe synchronization for the collaborative canvas
//!
//! Keeps an automerge shared document and a UI-readable mirror store
//! consistent across local edits, merged peer updates and repeated
//! mount/unmount cycles.
//!
//! Data flows one way:
//!
//! ```text
//! local edit / remote merge
//!     → document mutation batch
//!     → change observer (safe debounce, lifecycle-validated)
//!     → mirror store
//!     → UI selection → selection validator → confirmed delete
//!     → document mutation batch ...
//! ```
//!
//! # Components
//!
//! - [`cleanup`]: teardown callbacks, run once each and verified
//! - [`debounce`]: coalescing timer that re-validates liveness before firing
//! - [`lifecycle`]: `Uninitialized → Active → Destroying → Destroyed`, the sole
//!   owner of the document
//! - [`document`]: automerge document with `nodes` and `connections` maps
//! - [`observers`]: document events to mirror writes
//! - [`mirror`]: synchronous snapshot read by the UI
//! - [`selection`]: ghost-id filtering
//! - [`delete`]: server-confirmed deletes
//! - [`session`]: the facade the component layer talks to

#![forbid(unsafe_code)]

pub mod cleanup;
pub mod collection;
pub mod debounce;
pub mod delete;
pub mod document;
pub mod lifecycle;
pub mod metrics;
pub mod mirror;
pub mod observers;
pub mod selection;
pub mod session;

pub use cleanup::{CleanupError, CleanupOutcome, CleanupRegistry, CleanupToken};
pub use collection::MirrorCollection;
pub use debounce::{SafeDebounce, SafeDebounceBuilder};
pub use delete::{
    ConfirmedDeleteCoordinator, DeleteEntry, DeleteOutcome, DeleteReport, RemoteDeleteEffects,
    RemoteDeleteError,
};
pub use document::{
    ChangeKind, CollectionHandle, CollectionKind, DocumentEntity, DocumentSource,
    EmptyDocumentSource, KeyChange, MutationBatch, SharedDocument, CONNECTIONS_KEY, NODES_KEY,
};
pub use lifecycle::{
    ActiveSession, InitOutcome, InitRejected, Lifecycle, LifecyclePhase, TeardownReport,
    TeardownStep, WeakLifecycle,
};
pub use metrics::{SyncMetrics, SyncMetricsSnapshot};
pub use mirror::{MirrorHandle, MirrorStore, MirrorWrite};
pub use observers::ChangeObserver;
pub use selection::SelectionValidator;
pub use session::CanvasSession;
