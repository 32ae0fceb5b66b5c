//! Canvas testing infrastructure
//!
//! Shared fixtures for the canvas crates' integration tests: a scripted remote
//! delete endpoint, an in-memory document source, a simulated remote peer that
//! edits a forked copy of the shared document, tracing helpers and proptest
//! strategies.
//!
//! Add it as a dev-dependency and import what the test needs:
//!
//! ```toml
//! [dev-dependencies]
//! canvas-testkit = { workspace = true }
//! ```

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

pub mod fixtures;
pub mod logging;
pub mod mocks;
pub mod peer;
pub mod strategies;

pub use fixtures::*;
pub use logging::{capture_errors, init_test_tracing, ErrorCounter};
pub use mocks::{MemoryDocumentSource, ScriptedDeleteEndpoint};
pub use peer::RemotePeer;
