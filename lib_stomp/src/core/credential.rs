//! # Handshake Credential Fetcher
//!
//! Acquires the short-lived handshake id that authorizes a STOMP session.
//!
//! - A valid cached credential is returned without network I/O.
//! - At most one request is in flight per fetcher; callers arriving while it
//!   runs are queued and receive the same result.
//! - Transport failures are retried up to `max_retry` times with exponential
//!   backoff; every other failure is terminal for the attempt.
//!
//! The request itself runs on a spawned task, so a caller that gives up (its
//! future is dropped, e.g. by a timeout) never strands the queued waiters.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use reqwest_retry::policies::ExponentialBackoff;
use reqwest_retry::{RetryDecision, RetryPolicy};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::configs::StompConfig;
use crate::core::channel::{HandshakeResponse, StompChannel};
use crate::core::error::{FetchError, HttpError};

/// A handshake credential. Immutable; superseded rather than refreshed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    /// Id presented when opening the STOMP session.
    pub handshake_id: String,
    /// The credential is usable strictly before this instant.
    pub expires_at: Instant,
    /// Application status code returned with the credential.
    pub code: i64,
    /// Server message, if any.
    pub message: Option<String>,
}

impl Credential {
    /// Whether the credential can still be used at `now`.
    pub fn is_valid_at(&self, now: Instant) -> bool {
        now < self.expires_at
    }

    /// Time left before expiry.
    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

/// HTTP collaborator used for the handshake POST.
#[async_trait]
pub trait HttpPoster: Send + Sync {
    /// POSTs `body` as JSON. `Ok(None)` means the response carried no body.
    async fn post_json(
        &self,
        url: &str,
        body: &serde_json::Value,
        headers: &HashMap<String, String>,
    ) -> Result<Option<Vec<u8>>, HttpError>;
}

#[derive(Debug, Clone)]
enum FetchStatus {
    Unstarted,
    Fetching { retry_count: u32 },
    Error(FetchError),
    Success(Credential),
}

struct FetcherState {
    status: FetchStatus,
    waiters: Vec<oneshot::Sender<Result<Credential, FetchError>>>,
}

/// Caches and coalesces handshake credential requests for one channel.
pub struct CredentialFetcher<C: StompChannel> {
    channel: Arc<C>,
    http: Arc<dyn HttpPoster>,
    max_retry: u32,
    retry_policy: ExponentialBackoff,
    min_ttl: Duration,
    state: Mutex<FetcherState>,
}

impl<C: StompChannel> CredentialFetcher<C> {
    /// Creates a fetcher with retry and TTL settings taken from `config`.
    pub fn new(channel: Arc<C>, http: Arc<dyn HttpPoster>, config: &StompConfig) -> Self {
        let (min_delay, max_delay) = config.retry_bounds();
        let retry_policy = ExponentialBackoff::builder()
            .retry_bounds(min_delay, max_delay.max(min_delay))
            .build_with_max_retries(config.max_retry);

        Self {
            channel,
            http,
            max_retry: config.max_retry,
            retry_policy,
            min_ttl: config.min_credential_ttl(),
            state: Mutex::new(FetcherState {
                status: FetchStatus::Unstarted,
                waiters: Vec::new(),
            }),
        }
    }

    /// Returns a valid credential, from cache or from a (shared) network request.
    pub async fn fetch(self: &Arc<Self>) -> Result<Credential, FetchError> {
        let receiver = {
            let mut state = self.lock_state();
            if let FetchStatus::Success(credential) = &state.status {
                if credential.is_valid_at(Instant::now()) {
                    log::debug!("Reusing cached handshake id {}", credential.handshake_id);
                    return Ok(credential.clone());
                }
                log::info!("Cached handshake id expired, fetching a new one");
            }

            let (tx, rx) = oneshot::channel();
            state.waiters.push(tx);

            if let FetchStatus::Fetching { retry_count } = state.status {
                log::debug!(
                    "Handshake request in flight (retry {}), queueing caller ({} waiting)",
                    retry_count,
                    state.waiters.len()
                );
            } else {
                state.status = FetchStatus::Fetching { retry_count: 0 };
                let fetcher = Arc::clone(self);
                tokio::spawn(async move { fetcher.run_request().await });
            }
            rx
        };

        receiver.await.unwrap_or(Err(FetchError::Abandoned))
    }

    /// Drops a cached credential so the next [`Self::fetch`] goes to the network.
    pub fn invalidate(&self) {
        let mut state = self.lock_state();
        if matches!(state.status, FetchStatus::Success(_)) {
            state.status = FetchStatus::Unstarted;
        }
    }

    /// The cached credential, valid or not.
    pub fn cached(&self) -> Option<Credential> {
        match &self.lock_state().status {
            FetchStatus::Success(credential) => Some(credential.clone()),
            _ => None,
        }
    }

    /// The last terminal error, if the most recent request failed.
    pub fn last_error(&self) -> Option<FetchError> {
        match &self.lock_state().status {
            FetchStatus::Error(err) => Some(err.clone()),
            _ => None,
        }
    }

    async fn run_request(self: Arc<Self>) {
        let started = SystemTime::now();
        let mut retry_count = 0;

        let result = loop {
            match self.request_once().await {
                Err(err) if err.is_retryable() && retry_count < self.max_retry => {
                    let wait = match self.retry_policy.should_retry(started, retry_count) {
                        RetryDecision::Retry { execute_after } => execute_after
                            .duration_since(SystemTime::now())
                            .unwrap_or_default(),
                        RetryDecision::DoNotRetry => break Err(err),
                    };
                    retry_count += 1;
                    self.lock_state().status = FetchStatus::Fetching { retry_count };
                    log::warn!(
                        "Handshake request failed: {}. Retry {}/{} in {}ms",
                        err,
                        retry_count,
                        self.max_retry,
                        wait.as_millis()
                    );
                    tokio::time::sleep(wait).await;
                }
                other => break other,
            }
        };

        let waiters = {
            let mut state = self.lock_state();
            state.status = match &result {
                Ok(credential) => FetchStatus::Success(credential.clone()),
                Err(err) => FetchStatus::Error(err.clone()),
            };
            std::mem::take(&mut state.waiters)
        };

        match &result {
            Ok(credential) => log::info!(
                "Handshake id fetched: {} (valid for {}s)",
                credential.handshake_id,
                credential.remaining().as_secs()
            ),
            Err(err) => log::error!("Handshake failed: {}", err),
        }

        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }

    async fn request_once(&self) -> Result<Credential, FetchError> {
        let url = self.channel.handshake_url();
        log::info!("Fetching new handshake id from {}", url);

        let body = self
            .http
            .post_json(url, &self.channel.handshake_params(), &self.channel.handshake_headers())
            .await
            .map_err(|e| match e {
                // 4xx is terminal, 5xx is retried.
                HttpError::Status(status) if (400..500).contains(&status) => {
                    FetchError::NonSuccessCode(format!("HTTP {}", status))
                }
                other => FetchError::Network(other.to_string()),
            })?;

        let body = match body {
            Some(body) if !body.is_empty() => body,
            _ => return Err(FetchError::NoResponseBody),
        };

        let response = self
            .channel
            .decode_handshake(&body)
            .map_err(|e| FetchError::DecodeFailure(e.to_string()))?;

        self.validate(response)
    }

    fn validate(&self, response: HandshakeResponse) -> Result<Credential, FetchError> {
        let code = response.code.unwrap_or_default();
        if code != 200 {
            return Err(FetchError::NonSuccessCode(response.msg.unwrap_or_default()));
        }

        let handshake_id = match response.handshake_id {
            Some(id) if !id.is_empty() => id,
            _ => return Err(FetchError::InvalidHandshakeId),
        };

        let ttl = response
            .expires_in
            .map(Duration::from_secs)
            .map_or(self.min_ttl, |ttl| ttl.max(self.min_ttl));

        Ok(Credential {
            handshake_id,
            expires_at: Instant::now() + ttl,
            code,
            message: response.msg,
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, FetcherState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
