//! # Configuration Modules
//!
//! Tunables for the orchestration layer and a data-driven channel.

/// Retry, timeout, backoff and recheck tunables.
pub mod config_stomp;

/// A `StompChannel` loaded from JSON.
pub mod config_channel;

pub use config_channel::ChannelConfig;
pub use config_stomp::{ConfigError, StompConfig, StompConfigOverlay};
