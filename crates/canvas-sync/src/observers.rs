//! Change observers
//!
//! One observer per collection turns document mutation events into mirror
//! writes. Events only record which keys changed; the debounced apply step
//! re-reads every key from the live collection handle, so nothing read before
//! the debounce window is trusted after it.
//!
//! The apply step re-checks the session for every key. If the session stops
//! being active part-way through a batch, the whole batch is dropped.

use indexmap::IndexMap;
use parking_lot::Mutex;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use canvas_core::{Connection, ConnectionId, Node, NodeId, SyncConfig};

use crate::debounce::SafeDebounce;
use crate::document::{ChangeKind, CollectionHandle, CollectionKind, MutationBatch, SubscriptionId};
use crate::lifecycle::{ActiveSession, WeakLifecycle};
use crate::metrics::SyncMetrics;
use crate::mirror::{MirrorHandle, MirrorWrite};

type PendingKeys = Arc<Mutex<IndexMap<String, ChangeKind>>>;

/// Observer bound to one collection of one session generation.
#[derive(Clone)]
pub struct ChangeObserver {
    kind: CollectionKind,
    generation: u64,
    subscription: SubscriptionId,
    pending: PendingKeys,
    debounce: SafeDebounce<()>,
}

impl ChangeObserver {
    /// Subscribe to `handle` and route its events into `mirror`.
    pub fn attach(
        handle: &CollectionHandle,
        generation: u64,
        lifecycle: WeakLifecycle,
        mirror: MirrorHandle,
        config: &SyncConfig,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        let kind = handle.kind();
        let pending: PendingKeys = Arc::new(Mutex::new(IndexMap::new()));

        let liveness = lifecycle.clone();
        let apply_pending = Arc::clone(&pending);
        let apply_metrics = Arc::clone(&metrics);
        let debounce = SafeDebounce::builder(config.debounce_interval())
            .label(format!("{kind} observer"))
            .validator(move || liveness.is_active_generation(generation))
            .metrics(metrics)
            .build(move |()| {
                apply_batch(
                    kind,
                    generation,
                    &apply_pending,
                    &lifecycle,
                    &mirror,
                    &apply_metrics,
                );
            });

        let event_pending = Arc::clone(&pending);
        let event_debounce = debounce.clone();
        let subscription = handle.observe(Arc::new(move |batch: &MutationBatch| {
            {
                let mut keys = event_pending.lock();
                for change in &batch.changes {
                    keys.shift_remove(&change.key);
                    keys.insert(change.key.clone(), change.kind);
                }
            }
            event_debounce.call(());
        }));

        tracing::debug!(collection = %kind, generation, "change observer attached");
        Self {
            kind,
            generation,
            subscription,
            pending,
            debounce,
        }
    }

    /// Collection observed.
    pub fn kind(&self) -> CollectionKind {
        self.kind
    }

    /// Generation the observer was attached under.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Cancel the pending apply and refuse future ones.
    pub fn cancel(&self) {
        self.debounce.cancel();
        self.pending.lock().clear();
    }

    /// Unsubscribe from the collection.
    pub fn detach(&self, handle: &CollectionHandle) -> bool {
        handle.unobserve(self.subscription)
    }

    /// Apply pending keys now. Returns whether the apply step ran.
    pub fn flush(&self) -> bool {
        self.debounce.flush()
    }

    /// Whether keys are waiting for the debounce window.
    pub fn is_pending(&self) -> bool {
        self.debounce.is_pending()
    }
}

impl fmt::Debug for ChangeObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeObserver")
            .field("kind", &self.kind)
            .field("generation", &self.generation)
            .field("subscription", &self.subscription)
            .field("pending_keys", &self.pending.lock().len())
            .finish()
    }
}

fn apply_batch(
    kind: CollectionKind,
    generation: u64,
    pending: &Mutex<IndexMap<String, ChangeKind>>,
    lifecycle: &WeakLifecycle,
    mirror: &MirrorHandle,
    metrics: &SyncMetrics,
) {
    let batch: Vec<(String, ChangeKind)> = pending.lock().drain(..).collect();
    if batch.is_empty() {
        return;
    }

    let total = batch.len();
    let mut writes = Vec::with_capacity(total);
    for (key, change) in batch {
        let fetched = lifecycle.try_active(generation, |session| read_write(session, kind, &key, change));
        match fetched {
            Some(Some(write)) => writes.push(write),
            Some(None) => {}
            None => {
                tracing::debug!(
                    collection = %kind,
                    generation,
                    applied = writes.len(),
                    total,
                    "session left active mid-batch, observer batch dropped"
                );
                return;
            }
        }
    }

    // Commit under the session lock so a teardown cannot slip in between the
    // last read and the mirror write.
    let committed = lifecycle.try_active(generation, |_| {
        let count = writes.len();
        mirror.apply(writes);
        count
    });
    match committed {
        Some(count) => {
            metrics.record_observer_batch();
            tracing::debug!(collection = %kind, generation, writes = count, "observer batch applied");
        }
        None => {
            tracing::debug!(collection = %kind, generation, "session ended before observer commit");
        }
    }
}

fn read_write(
    session: &ActiveSession,
    kind: CollectionKind,
    key: &str,
    change: ChangeKind,
) -> Option<MirrorWrite> {
    tracing::trace!(collection = %kind, key, ?change, "observer re-reading key");
    let handle = session.collection(kind);
    match kind {
        CollectionKind::Nodes => {
            let id = parse_key::<NodeId>(kind, key)?;
            Some(match handle.get::<Node>(key) {
                Ok(Some(node)) if node.id == id => MirrorWrite::UpsertNode(node),
                Ok(None) => MirrorWrite::RemoveNode(id),
                Ok(Some(node)) => {
                    tracing::warn!(key, stored_id = %node.id, "node stored under a foreign key");
                    MirrorWrite::RemoveNode(id)
                }
                Err(error) => {
                    tracing::warn!(key, error = %error, "unreadable node hidden from mirror");
                    MirrorWrite::RemoveNode(id)
                }
            })
        }
        CollectionKind::Connections => {
            let id = parse_key::<ConnectionId>(kind, key)?;
            Some(match handle.get::<Connection>(key) {
                Ok(Some(connection)) if connection.id == id => {
                    MirrorWrite::UpsertConnection(connection)
                }
                Ok(None) => MirrorWrite::RemoveConnection(id),
                Ok(Some(connection)) => {
                    tracing::warn!(key, stored_id = %connection.id, "connection stored under a foreign key");
                    MirrorWrite::RemoveConnection(id)
                }
                Err(error) => {
                    tracing::warn!(key, error = %error, "unreadable connection hidden from mirror");
                    MirrorWrite::RemoveConnection(id)
                }
            })
        }
    }
}

fn parse_key<T: FromStr>(kind: CollectionKind, key: &str) -> Option<T> {
    match key.parse() {
        Ok(id) => Some(id),
        Err(_) => {
            tracing::warn!(collection = %kind, key, "ignoring entry with non-id key");
            None
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::document::SharedDocument;
    use crate::lifecycle::{InitOutcome, Lifecycle};
    use canvas_core::{Position, Size, UserId, WorkspaceId};
    use std::time::Duration;

    struct Harness {
        lifecycle: Lifecycle,
        mirror: MirrorHandle,
        metrics: Arc<SyncMetrics>,
    }

    fn harness() -> Harness {
        let metrics = Arc::new(SyncMetrics::new());
        let lifecycle = Lifecycle::new(Arc::clone(&metrics));
        let mirror = MirrorHandle::new(Arc::clone(&metrics));
        let weak = lifecycle.downgrade();
        let config = SyncConfig::default();
        let workspace_id = WorkspaceId::from_u128(1);
        let observer_mirror = mirror.clone();
        let observer_metrics = Arc::clone(&metrics);
        let outcome = lifecycle.initialize(workspace_id, UserId::from_u128(2), |generation| {
            let document = SharedDocument::from_snapshot(workspace_id, generation, None)?;
            let mut session = ActiveSession::new(workspace_id, UserId::from_u128(2), generation, document);
            for kind in [CollectionKind::Nodes, CollectionKind::Connections] {
                let observer = ChangeObserver::attach(
                    session.collection(kind),
                    generation,
                    weak.clone(),
                    observer_mirror.clone(),
                    &config,
                    Arc::clone(&observer_metrics),
                );
                session.add_observer(observer);
            }
            Ok(session)
        });
        assert!(matches!(outcome, InitOutcome::Active { .. }));
        Harness {
            lifecycle,
            mirror,
            metrics,
        }
    }

    fn node(n: u128, x: f64) -> Node {
        Node::new(NodeId::from_u128(n), Position::new(x, 0.0), Size::new(10.0, 10.0))
    }

    fn put(h: &Harness, node: &Node) {
        h.lifecycle
            .with_active("put", |s| s.nodes().put(node))
            .unwrap()
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn drag_burst_produces_one_mirror_write() {
        let h = harness();
        for step in 0..20 {
            put(&h, &node(1, f64::from(step)));
        }
        assert!(h.mirror.read(|m| m.nodes.is_empty()));

        tokio::time::sleep(Duration::from_millis(50)).await;

        let snapshot = h.mirror.snapshot();
        assert_eq!(snapshot.nodes.get(&NodeId::from_u128(1)).unwrap().position.x, 19.0);
        assert_eq!(h.metrics.snapshot().observer_batches, 1);
        assert_eq!(h.metrics.snapshot().mirror_writes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn delete_event_evicts_selection() {
        let h = harness();
        put(&h, &node(1, 0.0));
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.mirror.update(|m| m.select(NodeId::from_u128(1)));

        h.lifecycle
            .with_active("delete", |s| s.nodes().delete(&NodeId::from_u128(1).to_string()))
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let snapshot = h.mirror.snapshot();
        assert!(snapshot.nodes.is_empty());
        assert!(snapshot.selected.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn pending_apply_is_dropped_after_teardown() {
        let h = harness();
        put(&h, &node(1, 0.0));
        let report = h.lifecycle.destroy().unwrap();
        assert!(report.clean);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.mirror.read(|m| m.nodes.is_empty()));
        assert_eq!(h.metrics.snapshot().observer_batches, 0);
    }

    #[test]
    fn flush_applies_without_a_runtime() {
        let h = harness();
        put(&h, &node(1, 0.0));
        let flushed: usize = h
            .lifecycle
            .observers()
            .iter()
            .filter(|o| o.flush())
            .count();
        assert_eq!(flushed, 1);
        assert_eq!(h.mirror.read(|m| m.nodes.count()), 1);
    }
}
