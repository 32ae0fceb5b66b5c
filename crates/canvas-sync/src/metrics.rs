//! Session counters
//!
//! Cheap atomic counters shared by every component of one session. They exist
//! so that the quiet recovery paths (stale-handle no-ops, dropped debounced
//! calls) stay observable.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one session.
#[derive(Debug, Default)]
pub struct SyncMetrics {
    stale_access_rejections: AtomicU64,
    debounce_drops: AtomicU64,
    observer_batches: AtomicU64,
    mirror_writes: AtomicU64,
}

impl SyncMetrics {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_stale_access(&self) {
        self.stale_access_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_debounce_drop(&self) {
        self.debounce_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_observer_batch(&self) {
        self.observer_batches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_mirror_write(&self) {
        self.mirror_writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> SyncMetricsSnapshot {
        SyncMetricsSnapshot {
            stale_access_rejections: self.stale_access_rejections.load(Ordering::Relaxed),
            debounce_drops: self.debounce_drops.load(Ordering::Relaxed),
            observer_batches: self.observer_batches.load(Ordering::Relaxed),
            mirror_writes: self.mirror_writes.load(Ordering::Relaxed),
        }
    }
}

/// Plain copy of [`SyncMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMetricsSnapshot {
    /// Accesses to the shared document refused because the session was not active
    pub stale_access_rejections: u64,
    /// Debounced invocations dropped by cancellation or a failing validator
    pub debounce_drops: u64,
    /// Observer batches that reached the mirror-store apply step
    pub observer_batches: u64,
    /// Mirror store writes that changed the revision
    pub mirror_writes: u64,
}
