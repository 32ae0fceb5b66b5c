//! Cleanup registry
//!
//! Teardown callbacks are registered against a session while it is active and
//! run exactly once, in reverse registration order, by [`CleanupRegistry::execute_all`].
//! Each callback is isolated: an error or a panic is recorded against its
//! token and the remaining callbacks still run. [`CleanupRegistry::verify`]
//! turns any missed or failed callback into a logged, observable result.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Boxed teardown callback.
pub type CleanupFn = Box<dyn FnOnce() -> Result<(), CleanupError> + Send>;

/// Token identifying one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CleanupToken(u64);

impl CleanupToken {
    /// Raw token value, unique within one registry.
    pub const fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CleanupToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cleanup#{}", self.0)
    }
}

/// Failure reported by, or on behalf of, a cleanup callback.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CleanupError {
    /// The callback returned an error
    #[error("{0}")]
    Failed(String),
    /// The callback panicked
    #[error("cleanup callback panicked: {0}")]
    Panicked(String),
}

impl CleanupError {
    /// Create a failure from a message.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Result of running one callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupOutcome {
    /// Registration token
    pub token: CleanupToken,
    /// Description given at registration
    pub description: String,
    /// Whether the callback completed without error
    pub success: bool,
    /// Failure message when `success` is false
    pub error: Option<String>,
}

struct CleanupRegistration {
    token: CleanupToken,
    description: String,
    callback: Option<CleanupFn>,
    executed: bool,
    error: Option<String>,
}

/// Registry of teardown callbacks for one session.
#[derive(Default)]
pub struct CleanupRegistry {
    registrations: Vec<CleanupRegistration>,
    next_token: u64,
}

impl CleanupRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a teardown callback.
    pub fn register<F>(&mut self, description: impl Into<String>, callback: F) -> CleanupToken
    where
        F: FnOnce() -> Result<(), CleanupError> + Send + 'static,
    {
        self.next_token += 1;
        let token = CleanupToken(self.next_token);
        let description = description.into();
        tracing::trace!(%token, description = %description, "cleanup.register");
        self.registrations.push(CleanupRegistration {
            token,
            description,
            callback: Some(Box::new(callback)),
            executed: false,
            error: None,
        });
        token
    }

    /// Drop a registration that has not run yet, e.g. when the resource it
    /// guards was released early. Returns false for unknown or executed tokens.
    pub fn unregister(&mut self, token: CleanupToken) -> bool {
        let Some(index) = self
            .registrations
            .iter()
            .position(|r| r.token == token && !r.executed)
        else {
            return false;
        };
        self.registrations.remove(index);
        true
    }

    /// Number of registrations, executed or not.
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Registrations that have not run yet.
    pub fn pending_count(&self) -> usize {
        self.registrations.iter().filter(|r| !r.executed).count()
    }

    /// Run every callback that has not run yet, newest first.
    ///
    /// Returns one outcome per callback run by this call. A second call only
    /// runs callbacks registered since the first.
    pub fn execute_all(&mut self) -> Vec<CleanupOutcome> {
        let mut outcomes = Vec::new();
        for registration in self.registrations.iter_mut().rev() {
            let Some(callback) = registration.callback.take() else {
                continue;
            };

            let result = match catch_unwind(AssertUnwindSafe(callback)) {
                Ok(result) => result,
                Err(payload) => Err(CleanupError::Panicked(panic_message(payload.as_ref()))),
            };

            registration.executed = true;
            registration.error = result.err().map(|e| e.to_string());

            match &registration.error {
                None => tracing::debug!(
                    token = %registration.token,
                    description = %registration.description,
                    "cleanup callback completed"
                ),
                Some(error) => tracing::warn!(
                    token = %registration.token,
                    description = %registration.description,
                    error = %error,
                    "cleanup callback failed"
                ),
            }

            outcomes.push(CleanupOutcome {
                token: registration.token,
                description: registration.description.clone(),
                success: registration.error.is_none(),
                error: registration.error.clone(),
            });
        }
        outcomes
    }

    /// Check that every registered callback ran and none failed.
    ///
    /// Every mismatch is logged at error level.
    pub fn verify(&self) -> bool {
        let mut clean = true;
        for registration in &self.registrations {
            if !registration.executed {
                clean = false;
                tracing::error!(
                    token = %registration.token,
                    description = %registration.description,
                    "cleanup callback was never executed"
                );
            } else if let Some(error) = &registration.error {
                clean = false;
                tracing::error!(
                    token = %registration.token,
                    description = %registration.description,
                    error = %error,
                    "cleanup callback failed"
                );
            }
        }
        clean
    }

    /// Outcomes for every registration that has run, in registration order.
    pub fn outcomes(&self) -> Vec<CleanupOutcome> {
        self.registrations
            .iter()
            .filter(|r| r.executed)
            .map(|r| CleanupOutcome {
                token: r.token,
                description: r.description.clone(),
                success: r.error.is_none(),
                error: r.error.clone(),
            })
            .collect()
    }
}

impl fmt::Debug for CleanupRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CleanupRegistry")
            .field("registered", &self.registrations.len())
            .field("pending", &self.pending_count())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
