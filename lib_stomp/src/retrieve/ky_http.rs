//! # HTTP Retrieval Utilities
//!
//! An asynchronous client wrapper around `reqwest` that POSTs JSON handshake
//! requests. It is the production [`HttpPoster`]; the credential fetcher
//! decides what is retried, so no retry middleware is stacked here.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Url;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};

use crate::configs::StompConfig;
use crate::core::credential::HttpPoster;
use crate::core::error::HttpError;

/// A thin asynchronous HTTP client.
pub struct ApiClient {
    /// The underlying middleware-enabled client.
    inner: ClientWithMiddleware,
    /// An optional Bearer token used for authorization.
    auth_token: Option<String>,
}

impl ApiClient {
    /// Creates a client whose every request is bounded by `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, HttpError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HttpError::InvalidRequest(e.to_string()))?;

        Ok(Self {
            inner: ClientBuilder::new(client).build(),
            auth_token: None,
        })
    }

    pub fn from_config(config: &StompConfig) -> Result<Self, HttpError> {
        Self::new(config.request_timeout())
    }

    /// Sends `Authorization: Bearer <token>` with every request.
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    fn header_map(&self, headers: &HashMap<String, String>) -> Result<HeaderMap, HttpError> {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| HttpError::InvalidRequest(format!("header {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| HttpError::InvalidRequest(format!("header {}: {}", name, e)))?;
            map.insert(name, value);
        }
        if let Some(token) = &self.auth_token {
            let bearer = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| HttpError::InvalidRequest(e.to_string()))?;
            map.insert(AUTHORIZATION, bearer);
        }
        map.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(map)
    }
}

#[async_trait]
impl HttpPoster for ApiClient {
    async fn post_json(
        &self,
        url: &str,
        body: &serde_json::Value,
        headers: &HashMap<String, String>,
    ) -> Result<Option<Vec<u8>>, HttpError> {
        let url = Url::parse(url).map_err(|e| HttpError::InvalidRequest(format!("{}: {}", url, e)))?;
        let payload = serde_json::to_vec(body).map_err(|e| HttpError::InvalidRequest(e.to_string()))?;

        let response = self
            .inner
            .post(url.clone())
            .headers(self.header_map(headers)?)
            .body(payload)
            .send()
            .await
            .map_err(|e| HttpError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            log::warn!("POST {} answered {}", url, status);
            return Err(HttpError::Status(status.as_u16()));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| HttpError::Transport(e.to_string()))?;
        Ok(if bytes.is_empty() { None } else { Some(bytes.to_vec()) })
    }
}
