//! # Transport Collaborator Boundary
//!
//! The wire-level STOMP engine (frame codec, socket, heart-beating) lives
//! outside this crate. This module fixes the interface the orchestration layer
//! drives: a factory that opens sessions, and sessions that expose
//! connect/disconnect/subscribe/unsubscribe/send plus two broadcast feeds,
//! one for lifecycle events and one for inbound MESSAGE frames.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use url::Url;

use crate::core::error::TransportError;

/// Name of the STOMP header that carries the subscription id on MESSAGE frames.
pub const SUBSCRIPTION_HEADER: &str = "subscription";

/// Header used to tag SUBSCRIBE/UNSUBSCRIBE frames with the wire id.
pub const ID_HEADER: &str = "id";

/// Lifecycle notifications emitted by a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The websocket is open; the STOMP CONNECT has not been answered yet.
    ConnectedToSocket,
    /// The broker answered CONNECTED; the session is usable.
    ConnectedToProtocol,
    /// The session ended.
    Disconnected(String),
    /// A socket or broker error.
    Error(TransportError),
}

/// Body of an inbound MESSAGE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramePayload {
    /// UTF-8 body.
    Text(String),
    /// Opaque binary body.
    Binary(Vec<u8>),
}

/// One inbound MESSAGE frame, shared by `Arc` between every interested dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    /// Frame body.
    pub payload: FramePayload,
    /// Broker-assigned `message-id`.
    pub message_id: String,
    /// `destination` header.
    pub destination: String,
    /// All frame headers, including `subscription`.
    pub headers: HashMap<String, String>,
}

impl InboundFrame {
    /// The `subscription` header, which the broker copies from our SUBSCRIBE `id`.
    pub fn subscription_id(&self) -> Option<&str> {
        self.headers.get(SUBSCRIPTION_HEADER).map(String::as_str)
    }

    /// Raw body bytes regardless of payload kind.
    pub fn body(&self) -> &[u8] {
        match &self.payload {
            FramePayload::Text(text) => text.as_bytes(),
            FramePayload::Binary(bytes) => bytes,
        }
    }

    /// Text body, if the frame carried one.
    pub fn text(&self) -> Option<&str> {
        match &self.payload {
            FramePayload::Text(text) => Some(text),
            FramePayload::Binary(_) => None,
        }
    }
}

/// Options applied when a session is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// Protocol-level heart-beating.
    pub keepalive: bool,
}

/// A single transport session. Owned by [`crate::core::Connection`].
#[async_trait]
pub trait StompSession: Send + Sync {
    /// Starts the socket + STOMP CONNECT sequence. Progress is reported on [`Self::events`].
    fn connect(&self, timeout: Duration);

    /// Closes the session. `force` skips the DISCONNECT receipt.
    fn disconnect(&self, force: bool);

    /// Sends SUBSCRIBE and resolves once the transport accepted it.
    async fn subscribe(
        &self,
        destination: &str,
        headers: HashMap<String, String>,
    ) -> Result<(), TransportError>;

    /// Sends UNSUBSCRIBE and resolves once the transport accepted it.
    async fn unsubscribe(
        &self,
        destination: &str,
        headers: HashMap<String, String>,
    ) -> Result<(), TransportError>;

    /// Fire-and-forget SEND. With `receipt_id` the broker is asked to
    /// acknowledge the frame with a RECEIPT.
    fn send(
        &self,
        body: Vec<u8>,
        destination: &str,
        receipt_id: Option<String>,
        headers: HashMap<String, String>,
    );

    /// Whether the protocol session is currently established.
    fn is_connected(&self) -> bool;

    /// Lifecycle feed. Subscribe before calling [`Self::connect`].
    fn events(&self) -> broadcast::Receiver<TransportEvent>;

    /// Inbound MESSAGE feed.
    fn messages(&self) -> broadcast::Receiver<Arc<InboundFrame>>;
}

/// Opens sessions. The embedding application supplies the concrete engine.
pub trait SessionFactory: Send + Sync {
    /// Creates an unconnected session for `url`.
    fn open(
        &self,
        url: &Url,
        headers: &HashMap<String, String>,
        options: SessionOptions,
    ) -> Arc<dyn StompSession>;
}

/// Non-owning reference to the active session.
#[derive(Clone)]
pub struct SessionRef(Weak<dyn StompSession>);

impl SessionRef {
    /// Downgrades a session handle.
    pub fn new(session: &Arc<dyn StompSession>) -> Self {
        Self(Arc::downgrade(session))
    }

    /// The session, if the connection still owns it.
    pub fn upgrade(&self) -> Option<Arc<dyn StompSession>> {
        self.0.upgrade()
    }
}

impl fmt::Debug for SessionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let alive = self.0.strong_count() > 0;
        f.debug_struct("SessionRef").field("alive", &alive).finish()
    }
}
