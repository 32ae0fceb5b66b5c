//! Lifecycle state machine
//!
//! The single owner of the shared document. State is one tagged union:
//!
//! ```text
//! Uninitialized ──initialize──▶ Active ──begin_destroy──▶ Destroying ──complete_destroy──▶ Destroyed
//!                                 ▲                                                           │
//!                                 └───────────────────── initialize (new generation) ◀────────┘
//! ```
//!
//! The document and its collection handles exist only inside
//! [`ActiveSession`]; every accessor goes through [`Lifecycle::with_active`]
//! or [`Lifecycle::try_active`], which fail closed outside `Active`.
//!
//! Teardown order is fixed: cancel debounces, unsubscribe observers, run the
//! cleanup registry, free the document. The first two happen in
//! [`Lifecycle::begin_destroy`], the last two in
//! [`Lifecycle::complete_destroy`].

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use canvas_core::{CanvasError, CanvasResult, UserId, WorkspaceId};

use crate::cleanup::{CleanupOutcome, CleanupRegistry};
use crate::document::{CollectionHandle, CollectionKind, SharedDocument};
use crate::metrics::SyncMetrics;
use crate::observers::ChangeObserver;

// =============================================================================
// States
// =============================================================================

/// Discriminant of [`LifecycleState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecyclePhase {
    /// No document, no observers
    Uninitialized,
    /// Document and handles live
    Active,
    /// Handles gone, cleanup pending or running
    Destroying,
    /// Terminal for this generation; document freed
    Destroyed,
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Active => "active",
            Self::Destroying => "destroying",
            Self::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

/// Everything a live session owns.
pub struct ActiveSession {
    workspace_id: WorkspaceId,
    user_id: UserId,
    generation: u64,
    document: SharedDocument,
    nodes: CollectionHandle,
    connections: CollectionHandle,
    cleanup: CleanupRegistry,
    observers: Vec<ChangeObserver>,
}

impl ActiveSession {
    /// Wrap a freshly created document.
    pub fn new(
        workspace_id: WorkspaceId,
        user_id: UserId,
        generation: u64,
        document: SharedDocument,
    ) -> Self {
        let nodes = document.nodes();
        let connections = document.connections();
        Self {
            workspace_id,
            user_id,
            generation,
            document,
            nodes,
            connections,
            cleanup: CleanupRegistry::new(),
            observers: Vec::new(),
        }
    }

    /// Workspace of the session.
    pub fn workspace_id(&self) -> WorkspaceId {
        self.workspace_id
    }

    /// User owning the session.
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Generation assigned at initialize.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The shared document.
    pub fn document(&self) -> &SharedDocument {
        &self.document
    }

    /// Handle to the nodes collection.
    pub fn nodes(&self) -> &CollectionHandle {
        &self.nodes
    }

    /// Handle to the connections collection.
    pub fn connections(&self) -> &CollectionHandle {
        &self.connections
    }

    /// Handle to either collection.
    pub fn collection(&self, kind: CollectionKind) -> &CollectionHandle {
        match kind {
            CollectionKind::Nodes => &self.nodes,
            CollectionKind::Connections => &self.connections,
        }
    }

    /// Teardown callbacks for this session.
    pub fn cleanup_mut(&mut self) -> &mut CleanupRegistry {
        &mut self.cleanup
    }

    /// Take ownership of an attached observer.
    pub fn add_observer(&mut self, observer: ChangeObserver) {
        self.observers.push(observer);
    }

    /// Attached observers.
    pub fn observers(&self) -> &[ChangeObserver] {
        &self.observers
    }
}

impl fmt::Debug for ActiveSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveSession")
            .field("workspace_id", &self.workspace_id)
            .field("user_id", &self.user_id)
            .field("generation", &self.generation)
            .field("observers", &self.observers.len())
            .field("cleanup", &self.cleanup)
            .finish_non_exhaustive()
    }
}

/// A session between `begin_destroy` and `complete_destroy`. The document is
/// held only so it can be freed last; nothing can reach it.
pub struct DestroyingSession {
    workspace_id: WorkspaceId,
    generation: u64,
    cleanup: Option<CleanupRegistry>,
    retired: SharedDocument,
    steps: Vec<TeardownStep>,
    completing: bool,
}

impl fmt::Debug for DestroyingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DestroyingSession")
            .field("workspace_id", &self.workspace_id)
            .field("generation", &self.generation)
            .field("steps", &self.steps)
            .field("completing", &self.completing)
            .finish_non_exhaustive()
    }
}

/// Lifecycle of the shared document.
#[derive(Debug, Default)]
pub enum LifecycleState {
    /// Never initialized
    #[default]
    Uninitialized,
    /// Live session
    Active(Box<ActiveSession>),
    /// Teardown in progress
    Destroying(DestroyingSession),
    /// Torn down
    Destroyed,
}

impl LifecycleState {
    /// Discriminant.
    pub fn phase(&self) -> LifecyclePhase {
        match self {
            Self::Uninitialized => LifecyclePhase::Uninitialized,
            Self::Active(_) => LifecyclePhase::Active,
            Self::Destroying(_) => LifecyclePhase::Destroying,
            Self::Destroyed => LifecyclePhase::Destroyed,
        }
    }
}

// =============================================================================
// Outcomes
// =============================================================================

/// Why `initialize` did not produce an active session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InitRejected {
    /// A session is already active
    #[error("session already active (generation {generation})")]
    AlreadyActive {
        /// Generation of the live session
        generation: u64,
    },
    /// Teardown has begun but not finished
    #[error("teardown in progress")]
    TeardownInProgress,
    /// Building the session failed; state is unchanged
    #[error("initialization failed: {0}")]
    Failed(CanvasError),
}

/// Result of `initialize`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitOutcome {
    /// A new session is active
    Active {
        /// Generation of the new session
        generation: u64,
    },
    /// Nothing changed
    Rejected(InitRejected),
}

impl InitOutcome {
    /// Whether a session was started.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active { .. })
    }

    /// Generation of the started session.
    pub fn generation(&self) -> Option<u64> {
        match self {
            Self::Active { generation } => Some(*generation),
            Self::Rejected(_) => None,
        }
    }
}

/// Teardown steps, in the only order they may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TeardownStep {
    /// Every observer debounce cancelled
    CancelDebounces,
    /// Every observer removed from its collection
    UnsubscribeObservers,
    /// Cleanup registry executed and verified
    RunCleanup,
    /// Document released
    FreeDocument,
}

/// What a completed teardown did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    /// Workspace of the torn-down session
    pub workspace_id: WorkspaceId,
    /// Generation of the torn-down session
    pub generation: u64,
    /// Steps in execution order
    pub steps: Vec<TeardownStep>,
    /// One entry per cleanup callback, newest registration first
    pub cleanup: Vec<CleanupOutcome>,
    /// Whether every cleanup callback ran and succeeded
    pub clean: bool,
}

impl TeardownReport {
    /// Turn an unclean teardown into an error.
    pub fn ensure_clean(&self) -> CanvasResult<()> {
        if self.clean {
            return Ok(());
        }
        let failures: Vec<String> = self
            .cleanup
            .iter()
            .filter(|outcome| !outcome.success)
            .map(|outcome| {
                format!(
                    "{} ({}): {}",
                    outcome.description,
                    outcome.token,
                    outcome.error.as_deref().unwrap_or("not executed")
                )
            })
            .collect();
        Err(CanvasError::lifecycle(format!(
            "unclean teardown of workspace {} generation {}: {}",
            self.workspace_id,
            self.generation,
            failures.join("; ")
        )))
    }
}

// =============================================================================
// State machine
// =============================================================================

struct LifecycleInner {
    state: Mutex<LifecycleState>,
    generations: AtomicU64,
    metrics: Arc<SyncMetrics>,
}

/// Shared handle to the lifecycle state machine.
#[derive(Clone)]
pub struct Lifecycle {
    inner: Arc<LifecycleInner>,
}

/// Non-owning handle, held by timers and observers.
#[derive(Clone)]
pub struct WeakLifecycle {
    inner: Weak<LifecycleInner>,
}

impl Lifecycle {
    /// Create an uninitialized lifecycle.
    pub fn new(metrics: Arc<SyncMetrics>) -> Self {
        Self {
            inner: Arc::new(LifecycleInner {
                state: Mutex::new(LifecycleState::Uninitialized),
                generations: AtomicU64::new(0),
                metrics,
            }),
        }
    }

    /// Non-owning handle.
    pub fn downgrade(&self) -> WeakLifecycle {
        WeakLifecycle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Current phase.
    pub fn phase(&self) -> LifecyclePhase {
        self.inner.state.lock().phase()
    }

    /// Whether a session is active.
    pub fn is_active(&self) -> bool {
        self.phase() == LifecyclePhase::Active
    }

    /// Generation of the active session.
    pub fn generation(&self) -> Option<u64> {
        match &*self.inner.state.lock() {
            LifecycleState::Active(session) => Some(session.generation),
            _ => None,
        }
    }

    /// Workspace and generation of the active session.
    pub fn active_context(&self) -> Option<(WorkspaceId, u64)> {
        match &*self.inner.state.lock() {
            LifecycleState::Active(session) => Some((session.workspace_id, session.generation)),
            _ => None,
        }
    }

    /// Rejection `initialize` would return right now, if any.
    pub fn check_initialize(&self) -> Option<InitRejected> {
        Self::initialize_blocker(&self.inner.state.lock())
    }

    fn initialize_blocker(state: &LifecycleState) -> Option<InitRejected> {
        match state {
            LifecycleState::Uninitialized | LifecycleState::Destroyed => None,
            LifecycleState::Active(session) => Some(InitRejected::AlreadyActive {
                generation: session.generation,
            }),
            LifecycleState::Destroying(_) => Some(InitRejected::TeardownInProgress),
        }
    }

    /// Start a session.
    ///
    /// Only legal from `Uninitialized` or `Destroyed`. `build` receives the
    /// new generation and must create a fresh document; on error the state is
    /// left as it was.
    pub fn initialize<F>(&self, workspace_id: WorkspaceId, user_id: UserId, build: F) -> InitOutcome
    where
        F: FnOnce(u64) -> CanvasResult<ActiveSession>,
    {
        let mut state = self.inner.state.lock();
        if let Some(rejected) = Self::initialize_blocker(&state) {
            tracing::warn!(
                %workspace_id,
                phase = %state.phase(),
                reason = %rejected,
                "initialize rejected"
            );
            return InitOutcome::Rejected(rejected);
        }

        let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed) + 1;
        match build(generation) {
            Ok(session) => {
                tracing::info!(%workspace_id, %user_id, generation, "canvas session active");
                *state = LifecycleState::Active(Box::new(session));
                InitOutcome::Active { generation }
            }
            Err(error) => {
                tracing::warn!(%workspace_id, generation, error = %error, "initialize failed");
                InitOutcome::Rejected(InitRejected::Failed(error))
            }
        }
    }

    /// Move `Active` to `Destroying`: cancel every debounce, then unsubscribe
    /// every observer. Returns false (and does nothing) from any other phase.
    pub fn begin_destroy(&self) -> bool {
        let mut state = self.inner.state.lock();
        let session = match std::mem::take(&mut *state) {
            LifecycleState::Active(session) => session,
            other => {
                tracing::debug!(phase = %other.phase(), "begin_destroy ignored");
                *state = other;
                return false;
            }
        };

        let ActiveSession {
            workspace_id,
            generation,
            document,
            nodes,
            connections,
            cleanup,
            observers,
            ..
        } = *session;

        let mut steps = Vec::with_capacity(4);

        for observer in &observers {
            observer.cancel();
        }
        steps.push(TeardownStep::CancelDebounces);

        for observer in &observers {
            let handle = match observer.kind() {
                CollectionKind::Nodes => &nodes,
                CollectionKind::Connections => &connections,
            };
            if !observer.detach(handle) {
                tracing::warn!(collection = %observer.kind(), "observer was not subscribed");
            }
        }
        steps.push(TeardownStep::UnsubscribeObservers);

        tracing::debug!(%workspace_id, generation, "canvas session destroying");
        *state = LifecycleState::Destroying(DestroyingSession {
            workspace_id,
            generation,
            cleanup: Some(cleanup),
            retired: document,
            steps,
            completing: false,
        });
        true
    }

    /// Run the cleanup registry, free the document and move to `Destroyed`.
    ///
    /// Cleanup callbacks run without the state lock held, so they may call
    /// back into the session (and be rejected). Returns `None` unless the
    /// state is `Destroying` and no other completion is running.
    pub fn complete_destroy(&self) -> Option<TeardownReport> {
        let (mut cleanup, workspace_id, generation) = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                LifecycleState::Destroying(destroying) if !destroying.completing => {
                    destroying.completing = true;
                    (
                        destroying.cleanup.take().unwrap_or_default(),
                        destroying.workspace_id,
                        destroying.generation,
                    )
                }
                other => {
                    tracing::debug!(phase = %other.phase(), "complete_destroy ignored");
                    return None;
                }
            }
        };

        let outcomes = cleanup.execute_all();
        let clean = cleanup.verify();
        if !clean {
            let failed = outcomes.iter().filter(|o| !o.success).count();
            tracing::error!(
                %workspace_id,
                generation,
                registered = cleanup.len(),
                failed,
                "unclean teardown"
            );
        }

        let mut state = self.inner.state.lock();
        let mut steps = match std::mem::replace(&mut *state, LifecycleState::Destroyed) {
            LifecycleState::Destroying(destroying) => {
                let DestroyingSession { retired, mut steps, .. } = destroying;
                steps.push(TeardownStep::RunCleanup);
                retired.free();
                steps
            }
            other => {
                // Destroying cannot be left except through this path.
                tracing::error!(phase = %other.phase(), "teardown state changed during cleanup");
                *state = other;
                vec![TeardownStep::RunCleanup]
            }
        };
        steps.push(TeardownStep::FreeDocument);
        drop(state);

        tracing::info!(%workspace_id, generation, clean, "canvas session destroyed");
        Some(TeardownReport {
            workspace_id,
            generation,
            steps,
            cleanup: outcomes,
            clean,
        })
    }

    /// `begin_destroy` followed by `complete_destroy`.
    pub fn destroy(&self) -> Option<TeardownReport> {
        self.begin_destroy();
        self.complete_destroy()
    }

    /// Run `f` against the active session, or reject with a warning.
    pub fn with_active<R>(
        &self,
        operation: &str,
        f: impl FnOnce(&mut ActiveSession) -> R,
    ) -> CanvasResult<R> {
        let mut state = self.inner.state.lock();
        match &mut *state {
            LifecycleState::Active(session) => Ok(f(session)),
            other => {
                let phase = other.phase();
                drop(state);
                self.record_stale(operation, phase);
                Err(CanvasError::lifecycle(format!(
                    "{operation} requires an active session (current phase: {phase})"
                )))
            }
        }
    }

    /// Log and count an `operation` that found no active session.
    ///
    /// For callers that already know the session is gone and have no closure
    /// to hand to [`with_active`](Self::with_active).
    pub fn reject_stale(&self, operation: &str) {
        self.record_stale(operation, self.phase());
    }

    fn record_stale(&self, operation: &str, phase: LifecyclePhase) {
        self.inner.metrics.record_stale_access();
        tracing::warn!(operation, %phase, "stale document access rejected");
    }

    /// Run `f` if the session of `generation` is still active. Quiet variant
    /// for timers and completions that may legitimately outlive their session.
    pub fn try_active<R>(&self, generation: u64, f: impl FnOnce(&mut ActiveSession) -> R) -> Option<R> {
        self.inner.try_active(generation, f)
    }

    /// Whether the session of `generation` is the active one.
    pub fn is_active_generation(&self, generation: u64) -> bool {
        self.inner.is_active_generation(generation)
    }

    /// Observers of the active session.
    pub fn observers(&self) -> Vec<ChangeObserver> {
        match &*self.inner.state.lock() {
            LifecycleState::Active(session) => session.observers.clone(),
            _ => Vec::new(),
        }
    }
}

impl LifecycleInner {
    fn try_active<R>(&self, generation: u64, f: impl FnOnce(&mut ActiveSession) -> R) -> Option<R> {
        let mut state = self.state.lock();
        match &mut *state {
            LifecycleState::Active(session) if session.generation == generation => Some(f(session)),
            other => {
                tracing::debug!(generation, phase = %other.phase(), "access for inactive generation skipped");
                None
            }
        }
    }

    fn is_active_generation(&self, generation: u64) -> bool {
        matches!(
            &*self.state.lock(),
            LifecycleState::Active(session) if session.generation == generation
        )
    }
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle")
            .field("phase", &self.phase())
            .finish()
    }
}

impl WeakLifecycle {
    /// See [`Lifecycle::try_active`]. `None` once the lifecycle is dropped.
    pub fn try_active<R>(&self, generation: u64, f: impl FnOnce(&mut ActiveSession) -> R) -> Option<R> {
        self.inner.upgrade()?.try_active(generation, f)
    }

    /// See [`Lifecycle::is_active_generation`].
    pub fn is_active_generation(&self, generation: u64) -> bool {
        self.inner
            .upgrade()
            .is_some_and(|inner| inner.is_active_generation(generation))
    }
}

impl fmt::Debug for WeakLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakLifecycle")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::cleanup::CleanupError;
    use canvas_core::{Node, NodeId, Position, Size};

    fn ids() -> (WorkspaceId, UserId) {
        (WorkspaceId::from_u128(1), UserId::from_u128(2))
    }

    fn lifecycle() -> Lifecycle {
        Lifecycle::new(Arc::new(SyncMetrics::new()))
    }

    fn start(lifecycle: &Lifecycle) -> InitOutcome {
        let (workspace_id, user_id) = ids();
        lifecycle.initialize(workspace_id, user_id, |generation| {
            let document = SharedDocument::from_snapshot(workspace_id, generation, None)?;
            Ok(ActiveSession::new(workspace_id, user_id, generation, document))
        })
    }

    #[test]
    fn full_cycle_reports_steps_in_order() {
        let lifecycle = lifecycle();
        assert_eq!(start(&lifecycle), InitOutcome::Active { generation: 1 });
        assert!(lifecycle.begin_destroy());
        assert_eq!(lifecycle.phase(), LifecyclePhase::Destroying);
        let report = lifecycle.complete_destroy().unwrap();
        assert_eq!(
            report.steps,
            vec![
                TeardownStep::CancelDebounces,
                TeardownStep::UnsubscribeObservers,
                TeardownStep::RunCleanup,
                TeardownStep::FreeDocument,
            ]
        );
        assert!(report.clean);
        assert_eq!(lifecycle.phase(), LifecyclePhase::Destroyed);
    }

    #[test]
    fn initialize_is_rejected_while_active_or_destroying() {
        let lifecycle = lifecycle();
        start(&lifecycle);
        assert_eq!(
            start(&lifecycle),
            InitOutcome::Rejected(InitRejected::AlreadyActive { generation: 1 })
        );
        lifecycle.begin_destroy();
        assert_eq!(
            start(&lifecycle),
            InitOutcome::Rejected(InitRejected::TeardownInProgress)
        );
        lifecycle.complete_destroy();
        assert_eq!(start(&lifecycle), InitOutcome::Active { generation: 2 });
    }

    #[test]
    fn failed_build_leaves_state_untouched() {
        let lifecycle = lifecycle();
        let (workspace_id, user_id) = ids();
        let outcome = lifecycle.initialize(workspace_id, user_id, |_| {
            Err(CanvasError::network("snapshot unavailable"))
        });
        assert!(matches!(outcome, InitOutcome::Rejected(InitRejected::Failed(_))));
        assert_eq!(lifecycle.phase(), LifecyclePhase::Uninitialized);
    }

    #[test]
    fn teardown_runs_once() {
        let lifecycle = lifecycle();
        start(&lifecycle);
        assert!(lifecycle.begin_destroy());
        assert!(!lifecycle.begin_destroy());
        assert!(lifecycle.complete_destroy().is_some());
        assert!(lifecycle.complete_destroy().is_none());
        assert!(lifecycle.destroy().is_none());
    }

    #[test]
    fn access_outside_active_fails_closed() {
        let metrics = Arc::new(SyncMetrics::new());
        let lifecycle = Lifecycle::new(Arc::clone(&metrics));
        let err = lifecycle
            .with_active("read nodes", |session| session.nodes().keys())
            .unwrap_err();
        assert!(err.is_lifecycle());

        start(&lifecycle);
        let handle = lifecycle
            .with_active("grab handle", |session| session.nodes().clone())
            .unwrap();
        lifecycle.destroy();

        assert!(lifecycle.try_active(1, |_| ()).is_none());
        let node = Node::new(NodeId::from_u128(1), Position::default(), Size::default());
        assert!(handle.put(&node).is_err());
        assert_eq!(metrics.snapshot().stale_access_rejections, 1);
    }

    #[test]
    fn reject_stale_counts_without_touching_state() {
        let metrics = Arc::new(SyncMetrics::new());
        let lifecycle = Lifecycle::new(Arc::clone(&metrics));
        start(&lifecycle);
        lifecycle.destroy();

        lifecycle.reject_stale("delete_many");
        lifecycle.reject_stale("delete_many");
        assert_eq!(metrics.snapshot().stale_access_rejections, 2);
        assert_eq!(lifecycle.phase(), LifecyclePhase::Destroyed);
        assert_eq!(start(&lifecycle), InitOutcome::Active { generation: 2 });
    }

    #[test]
    fn unclean_cleanup_still_frees_document() {
        let lifecycle = lifecycle();
        start(&lifecycle);
        let handle = lifecycle
            .with_active("register", |session| {
                session
                    .cleanup_mut()
                    .register("flaky", || Err(CleanupError::failed("disk full")));
                session.nodes().clone()
            })
            .unwrap();

        let report = lifecycle.destroy().unwrap();
        assert!(!report.clean);
        assert!(report.ensure_clean().is_err());
        assert!(handle.keys().is_err());
        assert_eq!(lifecycle.phase(), LifecyclePhase::Destroyed);
    }

    #[test]
    fn cleanup_callbacks_cannot_reach_the_document() {
        let lifecycle = lifecycle();
        start(&lifecycle);
        let inner = lifecycle.clone();
        lifecycle
            .with_active("register", move |session| {
                session.cleanup_mut().register("late access", move || {
                    match inner.with_active("late_access", |_| ()) {
                        Err(_) => Ok(()),
                        Ok(()) => Err(CleanupError::failed("document reachable during teardown")),
                    }
                });
            })
            .unwrap();
        assert!(lifecycle.destroy().unwrap().clean);
    }
}
