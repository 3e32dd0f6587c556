//! # Channel Configuration
//!
//! A [`StompChannel`] described entirely by data, for brokers whose STOMP
//! endpoint is a URL template with the handshake id substituted in.
//!
//! ```json
//! {
//!   "userToken": "u-123",
//!   "handshakeUrl": "https://broker.example.com/api/handshake",
//!   "handshakeParams": { "token": "u-123" },
//!   "stompUrlTemplate": "wss://broker.example.com/stomp?handshakeId={handshakeId}",
//!   "stompHeaders": { "accept-version": "1.2" }
//! }
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::configs::config_stomp::ConfigError;
use crate::core::channel::StompChannel;
use crate::core::credential::Credential;

/// Placeholder replaced with the percent-encoded handshake id.
pub const HANDSHAKE_ID_PLACEHOLDER: &str = "{handshakeId}";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelConfig {
    pub user_token: String,
    pub handshake_url: String,
    #[serde(default = "empty_object")]
    pub handshake_params: serde_json::Value,
    #[serde(default)]
    pub handshake_headers: HashMap<String, String>,
    pub stomp_url_template: String,
    #[serde(default)]
    pub stomp_headers: HashMap<String, String>,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl ChannelConfig {
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        let channel: ChannelConfig = serde_json::from_str(&raw)?;
        channel.validate()?;
        Ok(channel)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.user_token.is_empty() || self.handshake_url.is_empty() {
            return Err(ConfigError::Invalid(
                "userToken and handshakeUrl must not be empty".to_string(),
            ));
        }
        if !self.stomp_url_template.contains(HANDSHAKE_ID_PLACEHOLDER) {
            return Err(ConfigError::Invalid(format!(
                "stompUrlTemplate must contain {}",
                HANDSHAKE_ID_PLACEHOLDER
            )));
        }
        Ok(())
    }
}

impl StompChannel for ChannelConfig {
    fn user_token(&self) -> &str {
        &self.user_token
    }

    fn handshake_url(&self) -> &str {
        &self.handshake_url
    }

    fn handshake_params(&self) -> serde_json::Value {
        self.handshake_params.clone()
    }

    fn handshake_headers(&self) -> HashMap<String, String> {
        self.handshake_headers.clone()
    }

    fn stomp_url(&self, credential: &Credential) -> Option<String> {
        if !self.stomp_url_template.contains(HANDSHAKE_ID_PLACEHOLDER) {
            return None;
        }
        let encoded: String =
            url::form_urlencoded::byte_serialize(credential.handshake_id.as_bytes()).collect();
        Some(self.stomp_url_template.replace(HANDSHAKE_ID_PLACEHOLDER, &encoded))
    }

    fn stomp_headers(&self) -> HashMap<String, String> {
        self.stomp_headers.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tokio::time::Instant;

    fn credential(id: &str) -> Credential {
        Credential {
            handshake_id: id.to_string(),
            expires_at: Instant::now(),
            code: 200,
            message: None,
        }
    }

    #[test]
    fn loads_and_substitutes_encoded_handshake_id() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "userToken": "u-1",
                "handshakeUrl": "https://broker.test/handshake",
                "stompUrlTemplate": "wss://broker.test/ws?id={{handshakeId}}"
            }}"#
        )
        .unwrap();

        let channel = ChannelConfig::from_json_file(file.path()).unwrap();
        assert_eq!(channel.handshake_params(), serde_json::json!({}));
        assert_eq!(
            channel.stomp_url(&credential("a b/c")).as_deref(),
            Some("wss://broker.test/ws?id=a+b%2Fc")
        );
    }

    #[test]
    fn template_without_placeholder_is_rejected() {
        let channel = ChannelConfig {
            user_token: "u".into(),
            handshake_url: "https://broker.test".into(),
            handshake_params: empty_object(),
            handshake_headers: HashMap::new(),
            stomp_url_template: "wss://broker.test/ws".into(),
            stomp_headers: HashMap::new(),
        };
        assert!(matches!(channel.validate(), Err(ConfigError::Invalid(_))));
        assert!(channel.stomp_url(&credential("abc")).is_none());
    }
}
