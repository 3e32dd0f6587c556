//! # Subscription Descriptors and Handles
//!
//! A [`DestinationSpec`] names what one logical subscriber wants. Specs that
//! share user, destination and headers share a [`DestinationIdentity`], and
//! therefore one publisher and one wire subscription. A
//! [`SubscriptionHandle`] is the scope-bound token returned to the caller.

use std::collections::BTreeMap;
use std::fmt;

use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use crate::core::manager::Command;

/// What a single logical subscriber listens to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationSpec {
    /// Caller-chosen key; unique per subscriber within one destination identity.
    pub identifier: String,
    /// Broker destination, e.g. `/topic/quotes`.
    pub destination: String,
    /// Extra SUBSCRIBE headers. Part of the identity.
    pub headers: BTreeMap<String, String>,
}

impl DestinationSpec {
    pub fn new(identifier: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            destination: destination.into(),
            headers: BTreeMap::new(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Both destination and identifier must be non-empty.
    pub fn is_valid(&self) -> bool {
        !self.destination.is_empty() && !self.identifier.is_empty()
    }

    pub fn identity(&self, user_token: &str) -> DestinationIdentity {
        DestinationIdentity::new(user_token, &self.destination, &self.headers)
    }
}

/// Stable fingerprint of `(user token, destination, subscribe headers)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DestinationIdentity(String);

impl DestinationIdentity {
    pub fn new(user_token: &str, destination: &str, headers: &BTreeMap<String, String>) -> Self {
        let mut fingerprint = format!("user: {}, destination: {}", user_token, destination);
        if !headers.is_empty() {
            // BTreeMap iteration is sorted, so equal header sets fingerprint equally.
            let params: Vec<String> = headers.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
            fingerprint.push_str(", headers: ");
            fingerprint.push_str(&params.join("&"));
        }
        Self(fingerprint)
    }

    /// SUBSCRIBE `id` header value: optional prefix, then `rs_` and the SHA-256 of the fingerprint.
    pub fn wire_id(&self, prefix: Option<&str>) -> String {
        let digest = hex::encode(Sha256::digest(self.0.as_bytes()));
        match prefix {
            Some(prefix) if !prefix.is_empty() => format!("{}_rs_{}", prefix, digest),
            _ => format!("rs_{}", digest),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DestinationIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Scope-bound registration of one subscriber.
///
/// Releasing it (explicitly or by drop) removes the subscriber's dispatcher
/// and, if it was the last one, tears down the wire subscription. Release is
/// idempotent and a no-op once the manager is gone. The handle never owns the
/// publisher; it only names it.
pub struct SubscriptionHandle {
    identity: DestinationIdentity,
    identifier: String,
    token: u64,
    commands: Option<mpsc::WeakUnboundedSender<Command>>,
}

impl SubscriptionHandle {
    pub(crate) fn new(
        identity: DestinationIdentity,
        identifier: String,
        token: u64,
        commands: mpsc::WeakUnboundedSender<Command>,
    ) -> Self {
        Self {
            identity,
            identifier,
            token,
            commands: Some(commands),
        }
    }

    pub fn identity(&self) -> &DestinationIdentity {
        &self.identity
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn is_released(&self) -> bool {
        self.commands.is_none()
    }

    /// Deregisters the subscriber. Only the first call has an effect.
    pub fn release(&mut self) {
        let Some(commands) = self.commands.take() else {
            return;
        };
        let Some(commands) = commands.upgrade() else {
            log::debug!("Manager already gone, nothing to release for {}", self.identifier);
            return;
        };
        let _ = commands.send(Command::Release {
            identity: self.identity.clone(),
            identifier: self.identifier.clone(),
            token: self.token,
        });
    }

    /// Consumes the handle, releasing it.
    pub fn close(mut self) {
        self.release();
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("identifier", &self.identifier)
            .field("identity", &self.identity.as_str())
            .field("released", &self.is_released())
            .finish()
    }
}
