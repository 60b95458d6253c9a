//! Engine configuration.

use std::env;

/// Default sync target tag when none is configured.
pub const DEFAULT_SYNC_TARGET: &str = "twoway";

/// Configuration for a [`SyncEngine`](crate::SyncEngine).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Tag naming this integration in the local record store
    pub sync_target: String,
    /// Overrides the sync target in default side-store keys
    pub oob_scope_prefix: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new(DEFAULT_SYNC_TARGET)
    }
}

impl EngineConfig {
    /// Create a configuration for the given sync target.
    pub fn new(sync_target: impl Into<String>) -> Self {
        Self {
            sync_target: sync_target.into(),
            oob_scope_prefix: None,
        }
    }

    /// Use `prefix` instead of the sync target when naming side-store scopes.
    pub fn with_oob_scope_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.oob_scope_prefix = Some(prefix.into());
        self
    }

    /// Load configuration from environment variables.
    ///
    /// `TWOWAY_SYNC_TARGET` defaults to [`DEFAULT_SYNC_TARGET`];
    /// `TWOWAY_OOB_PREFIX` is optional.
    pub fn from_env() -> Result<Self, ConfigError> {
        let sync_target =
            env::var("TWOWAY_SYNC_TARGET").unwrap_or_else(|_| DEFAULT_SYNC_TARGET.to_string());
        if sync_target.trim().is_empty() {
            return Err(ConfigError::EmptySyncTarget);
        }

        let oob_scope_prefix = env::var("TWOWAY_OOB_PREFIX")
            .ok()
            .filter(|p| !p.trim().is_empty());

        Ok(Self {
            sync_target,
            oob_scope_prefix,
        })
    }

    /// Side-store scope for an account: `"<prefix>-<accountId>"`.
    pub fn default_oob_scope(&self, account: &str) -> String {
        let prefix = self
            .oob_scope_prefix
            .as_deref()
            .unwrap_or(&self.sync_target);
        format!("{}-{}", prefix, account)
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("TWOWAY_SYNC_TARGET must not be empty")]
    EmptySyncTarget,
}
