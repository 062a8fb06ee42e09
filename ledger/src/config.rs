//! Ledger configuration.
//!
//! Loaded from TOML. Every section and field is optional; missing values take
//! the defaults below. Durations use humantime notation (`"250ms"`, `"2s"`).
//!
//! ```toml
//! default_height = 20
//!
//! [retry]
//! max_retries = 3
//! base_delay = "100ms"
//! max_delay = "5s"
//! strategy = "exponential"
//!
//! [cache]
//! max_age = "30s"
//!
//! [coordinator]
//! conflict_policy = "queue"
//! call_timeout = "10s"
//! ```

use std::{path::Path, time::Duration};

use donation_ledger_merkle::MAX_HEIGHT;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound on `retry.max_retries`.
pub const MAX_RETRIES_LIMIT: u32 = 16;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LedgerConfig {
    /// Height of newly opened campaign trees.
    #[serde(default = "default_height")]
    pub default_height: u8,

    /// Retry policy for transient failures.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Snapshot and proof cache.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Update coordination.
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
}

const fn default_height() -> u8 {
    20
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            default_height: default_height(),
            retry: RetryConfig::default(),
            cache: CacheConfig::default(),
            coordinator: CoordinatorConfig::default(),
        }
    }
}

impl LedgerConfig {
    /// Load and validate configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails [`validate`].
    ///
    /// [`validate`]: LedgerConfig::validate
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check values serde cannot.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] for a tree height outside
    /// `1..=MAX_HEIGHT`, more than [`MAX_RETRIES_LIMIT`] retries, a zero call
    /// timeout, or a `max_delay` shorter than `base_delay`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_height == 0 || self.default_height > MAX_HEIGHT {
            return Err(ConfigError::Validation(format!(
                "default_height must be between 1 and {}, got {}",
                MAX_HEIGHT, self.default_height
            )));
        }
        if self.retry.max_retries > MAX_RETRIES_LIMIT {
            return Err(ConfigError::Validation(format!(
                "retry.max_retries must be at most {}, got {}",
                MAX_RETRIES_LIMIT, self.retry.max_retries
            )));
        }
        if self.retry.max_delay < self.retry.base_delay {
            return Err(ConfigError::Validation(
                "retry.max_delay must not be shorter than retry.base_delay".to_string(),
            ));
        }
        if self.coordinator.call_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "coordinator.call_timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Retry configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay unit for backoff.
    #[serde(default = "default_base_delay")]
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,

    /// Cap on any single delay.
    #[serde(default = "default_max_delay")]
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// How the delay grows between attempts.
    #[serde(default)]
    pub strategy: BackoffStrategy,
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_base_delay() -> Duration {
    Duration::from_millis(100)
}

const fn default_max_delay() -> Duration {
    Duration::from_secs(5)
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            strategy: BackoffStrategy::default(),
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based), capped at `max_delay`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let delay = match self.strategy {
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
            BackoffStrategy::Exponential => {
                let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        };
        delay.min(self.max_delay)
    }
}

/// Backoff growth.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `attempt * base_delay`.
    Linear,
    /// `2^(attempt - 1) * base_delay`.
    #[default]
    Exponential,
}

/// Cache configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Entries older than this are treated as absent.
    #[serde(default = "default_max_age")]
    #[serde(with = "humantime_serde")]
    pub max_age: Duration,
}

const fn default_max_age() -> Duration {
    Duration::from_secs(30)
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_age: default_max_age(),
        }
    }
}

/// Update coordinator configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoordinatorConfig {
    /// What a second append on a busy tree does.
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,

    /// Default deadline for each external call.
    #[serde(default = "default_call_timeout")]
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,
}

const fn default_call_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            conflict_policy: ConflictPolicy::default(),
            call_timeout: default_call_timeout(),
        }
    }
}

/// Behavior when an append arrives while another is in flight on the same
/// tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Wait for the in-flight append to finish.
    #[default]
    Queue,
    /// Fail immediately with `ConcurrentUpdateInProgress`.
    Reject,
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error reading configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}
