//! Safe debounce
//!
//! Coalesces a burst of calls into one delayed invocation. Unlike a plain
//! debounce, the optional validator is evaluated immediately before the
//! callback runs, after the timer fired. Cancellation aborts the timer task and
//! sets a permanent flag, but the validator is what keeps a callback that has
//! already been dispatched from touching torn-down state.
//!
//! Timers run on the ambient tokio runtime. Without one, calls stay pending
//! until [`SafeDebounce::flush`].

use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::metrics::SyncMetrics;

type DebounceCallback<A> = Box<dyn Fn(A) + Send + Sync>;
type DebounceValidator = Box<dyn Fn() -> bool + Send + Sync>;

/// Handle to a debounced callback. Clones share the same timer.
pub struct SafeDebounce<A: Send + 'static> {
    shared: Arc<DebounceShared<A>>,
}

impl<A: Send + 'static> Clone for SafeDebounce<A> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

struct DebounceShared<A> {
    callback: DebounceCallback<A>,
    validator: Option<DebounceValidator>,
    delay: Duration,
    label: String,
    metrics: Option<Arc<SyncMetrics>>,
    state: Mutex<DebounceState<A>>,
}

struct DebounceState<A> {
    pending: Option<A>,
    timer: Option<JoinHandle<()>>,
    /// Bumped on every call; a timer only fires for the epoch it was armed with
    epoch: u64,
    cancelled: bool,
}

/// Builder for [`SafeDebounce`].
pub struct SafeDebounceBuilder {
    delay: Duration,
    label: String,
    validator: Option<DebounceValidator>,
    metrics: Option<Arc<SyncMetrics>>,
}

impl SafeDebounceBuilder {
    /// Name used in log fields.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Predicate checked right before every invocation.
    pub fn validator<V>(mut self, validator: V) -> Self
    where
        V: Fn() -> bool + Send + Sync + 'static,
    {
        self.validator = Some(Box::new(validator));
        self
    }

    /// Count dropped invocations.
    pub fn metrics(mut self, metrics: Arc<SyncMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Finish with the callback to debounce.
    pub fn build<A, F>(self, callback: F) -> SafeDebounce<A>
    where
        A: Send + 'static,
        F: Fn(A) + Send + Sync + 'static,
    {
        SafeDebounce {
            shared: Arc::new(DebounceShared {
                callback: Box::new(callback),
                validator: self.validator,
                delay: self.delay,
                label: self.label,
                metrics: self.metrics,
                state: Mutex::new(DebounceState {
                    pending: None,
                    timer: None,
                    epoch: 0,
                    cancelled: false,
                }),
            }),
        }
    }
}

impl SafeDebounce<()> {
    /// Start a builder.
    pub fn builder(delay: Duration) -> SafeDebounceBuilder {
        SafeDebounceBuilder {
            delay,
            label: "debounce".to_string(),
            validator: None,
            metrics: None,
        }
    }
}

impl<A: Send + 'static> SafeDebounce<A> {
    /// Debounce `callback` by `delay`, with no validator.
    pub fn new<F>(delay: Duration, callback: F) -> Self
    where
        F: Fn(A) + Send + Sync + 'static,
    {
        SafeDebounce::builder(delay).build(callback)
    }

    /// Replace any pending invocation with `args` and restart the timer.
    ///
    /// Ignored once the debounce has been cancelled.
    pub fn call(&self, args: A) {
        let mut state = self.shared.state.lock();
        if state.cancelled {
            tracing::trace!(label = %self.shared.label, "debounce call after cancel ignored");
            self.shared.record_drop();
            return;
        }

        state.pending = Some(args);
        state.epoch = state.epoch.wrapping_add(1);
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }

        match Handle::try_current() {
            Ok(runtime) => {
                let weak: Weak<DebounceShared<A>> = Arc::downgrade(&self.shared);
                let epoch = state.epoch;
                let delay = self.shared.delay;
                state.timer = Some(runtime.spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(shared) = weak.upgrade() {
                        DebounceShared::fire(&shared, epoch);
                    }
                }));
            }
            Err(_) => {
                tracing::debug!(
                    label = %self.shared.label,
                    "no async runtime, debounced call waits for flush"
                );
            }
        }
    }

    /// Stop the pending timer and refuse all future calls.
    ///
    /// A callback that is already running is not interrupted; it relies on
    /// the validator instead.
    pub fn cancel(&self) {
        let mut state = self.shared.state.lock();
        if state.cancelled {
            return;
        }
        state.cancelled = true;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        if state.pending.take().is_some() {
            tracing::debug!(label = %self.shared.label, "pending debounced call cancelled");
            self.shared.record_drop();
        }
    }

    /// Run the pending invocation now, still subject to the validator.
    ///
    /// Returns true if the callback ran.
    pub fn flush(&self) -> bool {
        let args = {
            let mut state = self.shared.state.lock();
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            if state.cancelled {
                return false;
            }
            state.pending.take()
        };
        match args {
            Some(args) => self.shared.invoke(args),
            None => false,
        }
    }

    /// Whether an invocation is waiting to run.
    pub fn is_pending(&self) -> bool {
        let state = self.shared.state.lock();
        !state.cancelled && state.pending.is_some()
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.shared.state.lock().cancelled
    }
}

impl<A> DebounceShared<A> {
    fn fire(self: &Arc<Self>, epoch: u64) {
        let args = {
            let mut state = self.state.lock();
            if state.epoch != epoch || state.cancelled {
                return;
            }
            state.timer = None;
            state.pending.take()
        };
        if let Some(args) = args {
            self.invoke(args);
        }
    }

    fn invoke(&self, args: A) -> bool {
        if let Some(validator) = &self.validator {
            if !validator() {
                tracing::debug!(label = %self.label, "debounced call dropped by validator");
                self.record_drop();
                return false;
            }
        }
        if self.state.lock().cancelled {
            tracing::debug!(label = %self.label, "debounced call dropped after cancel");
            self.record_drop();
            return false;
        }
        tracing::trace!(label = %self.label, "debounced call firing");
        (self.callback)(args);
        true
    }

    fn record_drop(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.record_debounce_drop();
        }
    }
}

impl<A: Send + 'static> fmt::Debug for SafeDebounce<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("SafeDebounce")
            .field("label", &self.shared.label)
            .field("delay", &self.shared.delay)
            .field("pending", &state.pending.is_some())
            .field("cancelled", &state.cancelled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const DELAY: Duration = Duration::from_millis(16);

    fn recorder() -> (Arc<Mutex<Vec<u32>>>, impl Fn(u32) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |v| sink.lock().push(v))
    }

    #[tokio::test(start_paused = true)]
    async fn burst_coalesces_to_last_call() {
        let (seen, callback) = recorder();
        let debounce = SafeDebounce::new(DELAY, callback);
        for v in 0..5 {
            debounce.call(v);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(debounce.is_pending());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*seen.lock(), vec![4]);
        assert!(!debounce.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_runs() {
        let (seen, callback) = recorder();
        let metrics = Arc::new(SyncMetrics::new());
        let debounce = SafeDebounce::builder(DELAY)
            .metrics(Arc::clone(&metrics))
            .build(callback);
        debounce.call(1);
        tokio::time::sleep(DELAY - Duration::from_millis(1)).await;
        debounce.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        debounce.call(2);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(seen.lock().is_empty());
        assert!(debounce.is_cancelled());
        assert!(!debounce.flush());
        assert!(metrics.snapshot().debounce_drops >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_after_deadline_passed_never_runs() {
        let (seen, callback) = recorder();
        let debounce = SafeDebounce::new(DELAY, callback);
        debounce.call(1);
        tokio::time::advance(DELAY * 3).await;
        debounce.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(seen.lock().is_empty());
        assert!(!debounce.is_pending());
    }

    #[test]
    fn timer_dispatched_before_cancel_is_discarded() {
        let (seen, callback) = recorder();
        let debounce = SafeDebounce::new(DELAY, callback);
        debounce.call(1);
        let armed = debounce.shared.state.lock().epoch;

        // The timer task woke and is about to fire when cancel lands.
        debounce.cancel();
        DebounceShared::fire(&debounce.shared, armed);
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn stale_epoch_fire_is_ignored() {
        let (seen, callback) = recorder();
        let debounce = SafeDebounce::new(DELAY, callback);
        debounce.call(1);
        let first = debounce.shared.state.lock().epoch;
        debounce.call(2);

        DebounceShared::fire(&debounce.shared, first);
        assert!(seen.lock().is_empty());
        assert!(debounce.is_pending());
        assert!(debounce.flush());
        assert_eq!(*seen.lock(), vec![2]);
    }

    #[tokio::test(start_paused = true)]
    async fn validator_is_checked_at_fire_time() {
        let (seen, callback) = recorder();
        let alive = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&alive);
        let debounce = SafeDebounce::builder(DELAY)
            .validator(move || flag.load(Ordering::SeqCst))
            .build(callback);

        debounce.call(1);
        alive.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(seen.lock().is_empty());

        alive.store(true, Ordering::SeqCst);
        debounce.call(2);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*seen.lock(), vec![2]);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_runs_immediately_and_disarms_timer() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let debounce = SafeDebounce::new(DELAY, move |()| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        debounce.call(());
        assert!(debounce.flush());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!debounce.flush());
    }

    #[test]
    fn without_runtime_calls_wait_for_flush() {
        let (seen, callback) = recorder();
        let debounce = SafeDebounce::new(DELAY, callback);
        debounce.call(7);
        assert!(debounce.is_pending());
        assert!(debounce.flush());
        assert_eq!(*seen.lock(), vec![7]);
    }
}
