//! Bearer token providers
//!
//! Each datacenter owns one [`TokenProvider`]. Cloud deployments use a fixed
//! application token ([`StaticTokenProvider`]); self-hosted deployments trade
//! credentials for a short-lived token ([`CredentialsTokenProvider`]).
//!
//! Renewal is serialized behind an async mutex: callers arriving while a
//! renewal is in flight wait for it and reuse its result, so one expiry
//! window costs one round trip. Failed renewals leave the previous state in
//! place and are retried by the next caller.

use crate::error::{Error, Result};
use crate::executor::RetryPolicy;
use crate::metrics;
use crate::transport::{HttpMethod, HttpRequest, HttpTransport, TransportError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Default lifetime of a renewed token
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(30 * 60);

/// Produces the bearer token for one datacenter
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Current token, renewing it first when expired
    async fn token(&self) -> Result<String>;

    /// Forget a token the server rejected.
    ///
    /// Only clears the cache while `stale` is still the cached value, so a
    /// token renewed by another caller in the meantime survives.
    async fn invalidate(&self, _stale: &str) {}
}

/// Fixed token that never expires
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn token(&self) -> Result<String> {
        Ok(self.token.clone())
    }
}

/// Cached bearer credential
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    value: String,
    created_at: Instant,
    ttl: Duration,
}

impl Token {
    pub fn new(value: impl Into<String>, ttl: Duration) -> Self {
        Self {
            value: value.into(),
            created_at: Instant::now(),
            ttl,
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn is_valid_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) < self.ttl
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Instant::now())
    }
}

#[derive(Serialize)]
struct AuthRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct AuthResponse {
    #[serde(rename = "authToken")]
    auth_token: Option<String>,
}

/// Exchanges username/password for a token at `<auth_url>/v1/auth`
pub struct CredentialsTokenProvider {
    auth_url: String,
    username: String,
    password: String,
    datacenter: String,
    ttl: Duration,
    retry: RetryPolicy,
    request_timeout: Duration,
    transport: Arc<dyn HttpTransport>,
    state: Mutex<Option<Token>>,
    renewals: AtomicU64,
}

impl CredentialsTokenProvider {
    /// Create a provider. `auth_base_url` is the auth service root, without `/v1/auth`.
    pub fn new(
        auth_base_url: &str,
        username: impl Into<String>,
        password: impl Into<String>,
        transport: Arc<dyn HttpTransport>,
    ) -> Result<Self> {
        let base = reqwest::Url::parse(auth_base_url).map_err(|e| {
            Error::InvalidArgument(format!("Invalid auth URL '{}': {}", auth_base_url, e))
        })?;

        Ok(Self {
            auth_url: format!("{}/v1/auth", base.as_str().trim_end_matches('/')),
            username: username.into(),
            password: password.into(),
            datacenter: String::new(),
            ttl: DEFAULT_TOKEN_TTL,
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(10),
            transport,
            state: Mutex::new(None),
            renewals: AtomicU64::new(0),
        })
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Label used in logs and metrics
    pub fn for_datacenter(mut self, datacenter: &str) -> Self {
        self.datacenter = datacenter.to_string();
        self
    }

    pub fn auth_url(&self) -> &str {
        &self.auth_url
    }

    /// Number of renewal round trips started so far
    pub fn renewals(&self) -> u64 {
        self.renewals.load(Ordering::Relaxed)
    }

    /// Cached token, expired or not
    pub async fn current(&self) -> Option<Token> {
        self.state.lock().await.clone()
    }

    async fn renew(&self) -> Result<Token> {
        self.renewals.fetch_add(1, Ordering::Relaxed);
        debug!(datacenter = %self.datacenter, url = %self.auth_url, "Renewing token");

        let body = serde_json::to_string(&AuthRequest {
            username: &self.username,
            password: &self.password,
        })
        .map_err(|e| Error::Auth(format!("Failed to encode credentials: {}", e)))?;

        let mut last_error = String::new();
        for attempt in 1..=self.retry.max_attempts {
            let request = HttpRequest::new(HttpMethod::Post, &self.auth_url, self.request_timeout)
                .header("Content-Type", "application/json")
                .header("Accept", "application/json")
                .body(body.clone());

            let reply = match tokio::time::timeout(self.request_timeout, self.transport.send(request)).await {
                Ok(reply) => reply,
                Err(_) => Err(TransportError::Timeout(format!(
                    "no response within {:?}",
                    self.request_timeout
                ))),
            };
            match reply {
                Ok(response) if response.is_success() => {
                    let parsed: AuthResponse = serde_json::from_str(&response.body).map_err(|e| {
                        metrics::record_token_renewal(&self.datacenter, false);
                        Error::Auth(format!("Unreadable auth response: {}", e))
                    })?;
                    let Some(value) = parsed.auth_token.filter(|t| !t.is_empty()) else {
                        metrics::record_token_renewal(&self.datacenter, false);
                        return Err(Error::Auth(
                            "Auth response has no 'authToken' field".to_string(),
                        ));
                    };
                    metrics::record_token_renewal(&self.datacenter, true);
                    info!(datacenter = %self.datacenter, "Token renewed");
                    return Ok(Token::new(value, self.ttl));
                }
                Ok(response) => {
                    metrics::record_token_renewal(&self.datacenter, false);
                    return Err(Error::Auth(format!(
                        "Auth endpoint {} returned HTTP {}",
                        self.auth_url, response.status
                    )));
                }
                Err(TransportError::InvalidRequest(msg)) => {
                    metrics::record_token_renewal(&self.datacenter, false);
                    return Err(Error::Auth(msg));
                }
                Err(e) => {
                    warn!(
                        datacenter = %self.datacenter,
                        attempt,
                        error = %e,
                        "Token renewal attempt failed"
                    );
                    last_error = e.to_string();
                    if attempt < self.retry.max_attempts {
                        tokio::time::sleep(self.retry.backoff_for(attempt)).await;
                    }
                }
            }
        }

        metrics::record_token_renewal(&self.datacenter, false);
        Err(Error::Auth(format!(
            "Auth endpoint {} unreachable after {} attempts: {}",
            self.auth_url, self.retry.max_attempts, last_error
        )))
    }
}

#[async_trait]
impl TokenProvider for CredentialsTokenProvider {
    async fn token(&self) -> Result<String> {
        let mut state = self.state.lock().await;
        if let Some(token) = state.as_ref().filter(|t| t.is_valid()) {
            return Ok(token.value.clone());
        }

        let token = self.renew().await?;
        let value = token.value.clone();
        *state = Some(token);
        Ok(value)
    }

    async fn invalidate(&self, stale: &str) {
        let mut state = self.state.lock().await;
        if state.as_ref().is_some_and(|t| t.value == stale) {
            debug!(datacenter = %self.datacenter, "Dropping rejected token");
            *state = None;
        }
    }
}
