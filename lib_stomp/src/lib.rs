//! # lib_stomp
//!
//! Client-side STOMP connection and subscription orchestration: handshake
//! credentials, a reconnecting connection, and many logical subscribers
//! multiplexed onto few wire subscriptions.

// Declare the modules to re-export
pub mod configs;
pub mod core;
#[cfg(feature = "loggers")]
pub mod loggers;
pub mod retrieve;

// Re-export the everyday surface
pub use crate::configs::{ChannelConfig, StompConfig};
pub use crate::core::{
    CallbackQueue, DeliveryStrategy, DestinationSpec, StompManager, SubscribeOptions,
    SubscribeResult, SubscriptionHandle,
};
pub use crate::retrieve::ky_http::ApiClient;
