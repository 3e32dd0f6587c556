//! # Error Taxonomy
//!
//! Every failure in the orchestration layer is a typed value. Errors that are
//! fanned out to several waiters (a handshake result shared by every queued
//! caller, a wire-subscribe result shared by every parked completion) are
//! `Clone`, so inner causes are carried as rendered strings.

use thiserror::Error;

/// Failure reported by the HTTP collaborator before any response was read.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HttpError {
    /// The request could not be built (bad URL, unserializable body).
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Connect, TLS, timeout or read failure.
    #[error("transport failure: {0}")]
    Transport(String),
    /// The server answered with a non-2xx status.
    #[error("HTTP status {0}")]
    Status(u16),
}

/// Why a handshake credential could not be obtained.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// The HTTP call failed even after the configured retries.
    #[error("handshake request failed: {0}")]
    Network(String),
    /// The server answered without a body.
    #[error("handshake response has no body")]
    NoResponseBody,
    /// The body could not be decoded into a handshake response.
    #[error("handshake response could not be decoded: {0}")]
    DecodeFailure(String),
    /// The body decoded but `code` was not 200.
    #[error("handshake rejected by server: {0}")]
    NonSuccessCode(String),
    /// The body decoded with code 200 but without a usable handshake id.
    #[error("handshake id is missing or empty")]
    InvalidHandshakeId,
    /// The fetcher went away while the caller was queued.
    #[error("handshake request was abandoned")]
    Abandoned,
}

impl FetchError {
    /// Only transport failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Network(_))
    }
}

/// Failure reported by the transport/protocol engine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// An ERROR frame from the broker.
    #[error("broker error (receipt {receipt_id:?}): {description}")]
    Protocol {
        /// Error text sent by the broker.
        description: String,
        /// Receipt the error refers to, if any.
        receipt_id: Option<String>,
    },
    /// The underlying socket failed.
    #[error("socket error: {0}")]
    Socket(String),
    /// The session was closed before the operation completed.
    #[error("session closed")]
    Closed,
}

/// Why a connect attempt ended in `Failed`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    /// The handshake credential could not be obtained.
    #[error("handshake failed: {0}")]
    HandshakeInit(FetchError),
    /// The channel could not derive a valid STOMP URL from the credential.
    #[error("could not build the STOMP URL")]
    UrlInit,
    /// The transport reported an error while connecting.
    #[error("protocol connect failed: {0}")]
    Protocol(TransportError),
    /// No protocol-level CONNECTED arrived within the connect timeout.
    #[error("protocol connect timed out")]
    Timeout,
}

/// Wire subscribe/unsubscribe failure. Never fatal: the destination is requeued.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubscriptionError {
    /// There is no live protocol session to carry the frame.
    #[error("STOMP session is not connected")]
    NotConnected,
    /// The transport rejected the frame.
    #[error("transport rejected the request: {0}")]
    Transport(TransportError),
    /// The manager was torn down before the request completed.
    #[error("subscription manager is gone")]
    ManagerGone,
}

/// Failure to publish an outbound frame.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    /// There is no live protocol session.
    #[error("STOMP session is not connected")]
    NotConnected,
    /// The destination was empty.
    #[error("destination must not be empty")]
    EmptyDestination,
}
