//! Synchronization core configuration
//!
//! Loaded from TOML (or built in code) and validated once; the session copies
//! what it needs at construction time.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::{CanvasError, CanvasResult};

/// Tuning knobs for the synchronization core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Coalescing window for observer writes into the mirror store, in milliseconds
    pub debounce_ms: u64,

    /// Maximum remote delete requests in flight for one batch
    pub max_concurrent_deletes: usize,

    /// Re-select entities whose remote delete hard-failed, so the user can retry
    pub restore_failed_selection: bool,
}

impl SyncConfig {
    /// One frame at 60Hz.
    pub const DEFAULT_DEBOUNCE_MS: u64 = 16;

    /// Upper bound on the debounce window; anything longer makes the mirror
    /// visibly lag behind the document.
    pub const MAX_DEBOUNCE_MS: u64 = 10_000;

    /// Start a builder from the defaults.
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::default()
    }

    /// Debounce window as a `Duration`.
    pub fn debounce_interval(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Check that the configuration is usable.
    pub fn validate(&self) -> CanvasResult<()> {
        if self.debounce_ms > Self::MAX_DEBOUNCE_MS {
            return Err(CanvasError::invalid(format!(
                "debounce_ms must be at most {}, got {}",
                Self::MAX_DEBOUNCE_MS,
                self.debounce_ms
            )));
        }
        if self.max_concurrent_deletes == 0 {
            return Err(CanvasError::invalid(
                "max_concurrent_deletes must be at least 1",
            ));
        }
        Ok(())
    }

    /// Parse and validate a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(source: &str) -> CanvasResult<Self> {
        let config: Self = toml::from_str(source)
            .map_err(|e| CanvasError::invalid(format!("Invalid sync config: {e}")))?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: Self::DEFAULT_DEBOUNCE_MS,
            max_concurrent_deletes: 4,
            restore_failed_selection: true,
        }
    }
}

/// Builder for [`SyncConfig`].
#[derive(Debug, Clone, Default)]
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    /// Set the debounce window.
    pub fn debounce_ms(mut self, debounce_ms: u64) -> Self {
        self.config.debounce_ms = debounce_ms;
        self
    }

    /// Set the remote delete concurrency.
    pub fn max_concurrent_deletes(mut self, max: usize) -> Self {
        self.config.max_concurrent_deletes = max;
        self
    }

    /// Enable or disable re-selecting failed deletes.
    pub fn restore_failed_selection(mut self, restore: bool) -> Self {
        self.config.restore_failed_selection = restore;
        self
    }

    /// Validate and build.
    pub fn build(self) -> CanvasResult<SyncConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = SyncConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.debounce_interval(), Duration::from_millis(16));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = SyncConfig::from_toml_str("max_concurrent_deletes = 8\n").unwrap();
        assert_eq!(config.max_concurrent_deletes, 8);
        assert_eq!(config.debounce_ms, SyncConfig::DEFAULT_DEBOUNCE_MS);
        assert!(config.restore_failed_selection);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let err = SyncConfig::builder().max_concurrent_deletes(0).build().unwrap_err();
        assert!(matches!(err, CanvasError::Invalid { .. }));
    }

    #[test]
    fn malformed_toml_is_invalid() {
        let err = SyncConfig::from_toml_str("debounce_ms = \"soon\"").unwrap_err();
        assert!(matches!(err, CanvasError::Invalid { .. }));
    }
}
