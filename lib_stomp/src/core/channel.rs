//! # Channel Configuration Boundary
//!
//! A channel tells the core where to fetch handshake credentials, how to turn
//! a credential into the STOMP endpoint, and which headers to send. The
//! embedding application implements [`StompChannel`] once per broker family;
//! [`crate::configs::ChannelConfig`] is a data-driven implementation.

use std::collections::HashMap;

use serde::Deserialize;

use crate::core::credential::Credential;

/// Decoded handshake response body: `{ code, handshakeId, expiresIn, msg }`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeResponse {
    /// Application status code; 200 means success.
    pub code: Option<i64>,
    /// Id that authorizes the STOMP session.
    pub handshake_id: Option<String>,
    /// Credential lifetime in seconds.
    pub expires_in: Option<u64>,
    /// Server message, surfaced on non-success codes.
    pub msg: Option<String>,
}

/// Connection parameters for one user on one broker.
pub trait StompChannel: Send + Sync + 'static {
    /// Token identifying the authenticated user. Part of every destination identity.
    fn user_token(&self) -> &str;

    /// Endpoint that issues handshake credentials.
    fn handshake_url(&self) -> &str;

    /// JSON body POSTed to [`Self::handshake_url`].
    fn handshake_params(&self) -> serde_json::Value;

    /// Extra headers for the handshake POST.
    fn handshake_headers(&self) -> HashMap<String, String> {
        HashMap::new()
    }

    /// STOMP endpoint for a credential; `None` if it cannot be derived.
    fn stomp_url(&self, credential: &Credential) -> Option<String>;

    /// Headers sent with the STOMP CONNECT frame.
    fn stomp_headers(&self) -> HashMap<String, String> {
        HashMap::new()
    }

    /// Decodes the handshake body. Override for servers with a different envelope.
    fn decode_handshake(&self, body: &[u8]) -> Result<HandshakeResponse, serde_json::Error> {
        serde_json::from_slice(body)
    }
}
