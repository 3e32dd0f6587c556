//! # Core Orchestration Module
//!
//! The connection/subscription layer. Leaf-first:
//!
//! - **`credential`**: fetches and caches the short-lived handshake id over
//!   HTTP, retrying transient failures and coalescing concurrent callers.
//! - **`connection`**: owns the single transport session and its state machine.
//! - **`publisher`**: one per destination identity; shares one wire
//!   subscription between many subscribers and routes their frames.
//! - **`dispatcher`**: one per subscriber; decodes frames and delivers them
//!   with the chosen strategy on the subscriber's `CallbackQueue`.
//! - **`manager`**: the facade and its actor task, including the reconnect
//!   loop and the pending-subscription recheck.
//!
//! The transport engine and the HTTP client are collaborators described by
//! the traits in `transport` and `credential`.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Linear reconnect backoff.
pub mod backoff;
/// Serial executors for subscriber callbacks.
pub mod callback_queue;
/// The channel boundary: handshake endpoint, STOMP URL and headers.
pub mod channel;
/// The connection state machine.
pub mod connection;
/// Handshake credential acquisition and caching.
pub mod credential;
/// Per-subscriber decode and delivery.
pub mod dispatcher;
/// Typed errors of every layer.
pub mod error;
/// The manager facade and its actor task.
pub mod manager;
/// Per-identity wire subscription and frame routing.
pub mod publisher;
/// Publisher map and pending set.
pub mod registry;
/// Destination specs, identities and handles.
pub mod subscription;
/// Transport engine collaborator traits.
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

// --- Public API Re-exports ---
pub use backoff::ReconnectBackoff;
pub use callback_queue::CallbackQueue;
pub use channel::{HandshakeResponse, StompChannel};
pub use connection::{Connection, ConnectionSignal, ConnectionStatus};
pub use credential::{Credential, CredentialFetcher, HttpPoster};
pub use dispatcher::{DecodedMessage, DeliveryStrategy, MessageCallback, UndecodedMessage};
pub use error::{ConnectionError, FetchError, HttpError, SendError, SubscriptionError, TransportError};
pub use manager::{ManagerSnapshot, StompManager, SubscribeOptions, SubscribeResult};
pub use publisher::WireState;
pub use registry::{PendingSet, PublisherSnapshot};
pub use subscription::{DestinationIdentity, DestinationSpec, SubscriptionHandle};
pub use transport::{
    FramePayload, InboundFrame, SessionFactory, SessionOptions, SessionRef, StompSession,
    TransportEvent,
};
