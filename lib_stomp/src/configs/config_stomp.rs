//! # Stomp Tunables
//!
//! Timing and retry knobs for the handshake fetcher, the connection and the
//! manager's reconnect/recheck scheduler. Every field has a default, so a JSON
//! file only needs to name what it changes.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error occurred: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StompConfig {
    /// Network retries for one handshake request.
    pub max_retry: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Per-attempt HTTP timeout for the handshake request.
    pub request_timeout_secs: u64,
    /// Lower bound on a credential's lifetime, also used when the server omits `expiresIn`.
    pub min_credential_ttl_secs: u64,

    pub connect_timeout_secs: u64,
    pub keepalive: bool,

    /// First wait of the reconnect loop, and the value it resets to after a successful connect.
    pub base_delay_secs: u64,
    /// Added to the wait after every failed attempt.
    pub step_secs: u64,
    pub max_delay_secs: u64,
    /// Delay before the loop restarts after the transport drops.
    pub disconnect_retry_delay_secs: u64,

    pub recheck_first_delay_secs: u64,
    pub recheck_interval_secs: u64,
}

impl Default for StompConfig {
    fn default() -> Self {
        Self {
            max_retry: 3,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 5_000,
            request_timeout_secs: 30,
            min_credential_ttl_secs: 20,
            connect_timeout_secs: 30,
            keepalive: true,
            base_delay_secs: 5,
            step_secs: 1,
            max_delay_secs: 15,
            disconnect_retry_delay_secs: 1,
            recheck_first_delay_secs: 5,
            recheck_interval_secs: 10,
        }
    }
}

/// Partial overlay used by [`StompConfig::merge`]; unset fields keep the base value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StompConfigOverlay {
    pub max_retry: Option<u32>,
    pub request_timeout_secs: Option<u64>,
    pub connect_timeout_secs: Option<u64>,
    pub base_delay_secs: Option<u64>,
    pub max_delay_secs: Option<u64>,
}

impl StompConfig {
    /// Reads a JSON file and overlays it on the defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        let config: StompConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        log::debug!("Loaded stomp configuration from {}", path.display());
        Ok(config)
    }

    // Later layers win for every field they set.
    pub fn merge(self, other: StompConfigOverlay) -> StompConfig {
        StompConfig {
            max_retry: other.max_retry.unwrap_or(self.max_retry),
            request_timeout_secs: other.request_timeout_secs.unwrap_or(self.request_timeout_secs),
            connect_timeout_secs: other.connect_timeout_secs.unwrap_or(self.connect_timeout_secs),
            base_delay_secs: other.base_delay_secs.unwrap_or(self.base_delay_secs),
            max_delay_secs: other.max_delay_secs.unwrap_or(self.max_delay_secs),
            ..self
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_delay_secs < self.base_delay_secs {
            return Err(ConfigError::Invalid(format!(
                "maxDelaySecs ({}) is below baseDelaySecs ({})",
                self.max_delay_secs, self.base_delay_secs
            )));
        }
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "retryMaxDelayMs ({}) is below retryBaseDelayMs ({})",
                self.retry_max_delay_ms, self.retry_base_delay_ms
            )));
        }
        if self.connect_timeout_secs == 0 || self.recheck_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "connectTimeoutSecs and recheckIntervalSecs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn retry_bounds(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.retry_base_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn min_credential_ttl(&self) -> Duration {
        Duration::from_secs(self.min_credential_ttl_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_secs(self.base_delay_secs)
    }

    pub fn reconnect_step(&self) -> Duration {
        Duration::from_secs(self.step_secs)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_secs)
    }

    pub fn disconnect_retry_delay(&self) -> Duration {
        Duration::from_secs(self.disconnect_retry_delay_secs)
    }

    pub fn recheck_first_delay(&self) -> Duration {
        Duration::from_secs(self.recheck_first_delay_secs)
    }

    pub fn recheck_interval(&self) -> Duration {
        Duration::from_secs(self.recheck_interval_secs)
    }
}
