//! Unified error type for canvas operations
//!
//! One flat enum for everything the synchronization core can report. Callers
//! at the session boundary match on the variant; nothing here is meant to be
//! fatal to the UI.

use serde::{Deserialize, Serialize};

/// Unified error type for all canvas operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum CanvasError {
    /// Invalid input or configuration
    #[error("Invalid: {message}")]
    Invalid {
        /// Error message describing the invalid input
        message: String,
    },

    /// Entity not found
    #[error("Not found: {message}")]
    NotFound {
        /// Error message describing what was not found
        message: String,
    },

    /// Serialization/deserialization error
    #[error("Serialization error: {message}")]
    Serialization {
        /// Error message describing the serialization failure
        message: String,
    },

    /// Shared document operation failed, or the document has been freed
    #[error("Document error: {message}")]
    Document {
        /// Error message describing the document failure
        message: String,
    },

    /// Operation attempted outside the lifecycle phase that permits it
    #[error("Lifecycle error: {message}")]
    Lifecycle {
        /// Error message describing the lifecycle violation
        message: String,
    },

    /// Network or remote endpoint error
    #[error("Network error: {message}")]
    Network {
        /// Error message describing the network issue
        message: String,
    },

    /// Internal system error
    #[error("Internal error: {message}")]
    Internal {
        /// Error message describing the internal error
        message: String,
    },
}

impl CanvasError {
    /// Create an invalid input error
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create a document error
    pub fn document(message: impl Into<String>) -> Self {
        Self::Document {
            message: message.into(),
        }
    }

    /// Create a lifecycle error
    pub fn lifecycle(message: impl Into<String>) -> Self {
        Self::Lifecycle {
            message: message.into(),
        }
    }

    /// Create a network error
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether this error came from touching the document outside its active phase.
    pub fn is_lifecycle(&self) -> bool {
        matches!(self, Self::Lifecycle { .. })
    }
}

/// Standard Result type for canvas operations
pub type CanvasResult<T> = std::result::Result<T, CanvasError>;

impl From<serde_json::Error> for CanvasError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

impl From<uuid::Error> for CanvasError {
    fn from(err: uuid::Error) -> Self {
        Self::invalid(format!("malformed identifier: {err}"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_category() {
        let err = CanvasError::lifecycle("document is not active");
        assert_eq!(err.to_string(), "Lifecycle error: document is not active");
        assert!(err.is_lifecycle());
        assert!(!CanvasError::network("offline").is_lifecycle());

        let err = CanvasError::internal("observer table poisoned");
        assert_eq!(err.to_string(), "Internal error: observer table poisoned");
        assert!(!err.is_lifecycle());
    }

    #[test]
    fn json_errors_become_serialization_errors() {
        let err: CanvasError = serde_json::from_str::<u32>("not json").unwrap_err().into();
        assert!(matches!(err, CanvasError::Serialization { .. }));
    }
}
