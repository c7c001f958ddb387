//! Configuration management for the counter application
//!
//! Settings come from environment variables, with defaults for local runs:
//!
//! | Variable | Default |
//! |----------|---------|
//! | `COUNTER_RESOURCE_KEY` | `counters/shared` |
//! | `COUNTER_SHUTDOWN_TIMEOUT_SECS` | `5` |

use composable_epics_core::{ParseResourceKeyError, ResourceKey};
use std::time::Duration;
use thiserror::Error;

/// Environment variable naming the counter document
pub const RESOURCE_KEY_VAR: &str = "COUNTER_RESOURCE_KEY";

/// Environment variable holding the shutdown timeout in seconds
pub const SHUTDOWN_TIMEOUT_VAR: &str = "COUNTER_SHUTDOWN_TIMEOUT_SECS";

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The resource key is not usable
    #[error("Invalid COUNTER_RESOURCE_KEY: {0}")]
    InvalidResourceKey(#[from] ParseResourceKeyError),

    /// The shutdown timeout is not a whole number of seconds
    #[error("Invalid COUNTER_SHUTDOWN_TIMEOUT_SECS: '{0}' is not a number of seconds")]
    InvalidShutdownTimeout(String),
}

/// Counter application configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterConfig {
    /// Document holding the shared counter
    pub resource_key: ResourceKey,
    /// How long to wait for the store to stop
    pub shutdown_timeout: Duration,
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self {
            resource_key: ResourceKey::new("counters/shared"),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl CounterConfig {
    /// Load configuration from the process environment
    ///
    /// # Errors
    ///
    /// Returns error if a variable is set but invalid
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to
    /// its value
    ///
    /// # Errors
    ///
    /// Returns error if a variable is set but invalid
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(key) = lookup(RESOURCE_KEY_VAR) {
            config.resource_key = key.parse()?;
        }

        if let Some(secs) = lookup(SHUTDOWN_TIMEOUT_VAR) {
            let secs: u64 = secs
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidShutdownTimeout(secs.clone()))?;
            config.shutdown_timeout = Duration::from_secs(secs);
        }

        Ok(config)
    }

    /// Use a different counter document
    #[must_use]
    pub fn with_resource_key(mut self, key: ResourceKey) -> Self {
        self.resource_key = key;
        self
    }

    /// Use a different shutdown timeout
    #[must_use]
    pub const fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}
