//! Retrying HTTP client used by the registry transport.
//!
//! Retries stay short and in-process: they smooth over a dropped connection
//! or a brief 5xx burst. Longer outages surface as transport errors and are
//! retried by the operation scheduler instead.

use std::time::Duration;

use regsync_domain::{RegSyncError, RegistryConfig};
use reqwest::header::RETRY_AFTER;
use reqwest::{Client as ReqwestClient, Method, RequestBuilder, Response, StatusCode};
use tracing::{debug, warn};

use crate::errors::InfraError;

/// Attempt budget and backoff for one logical request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, initial try included.
    pub max_attempts: usize,
    pub base_backoff: Duration,
    /// Upper bound for any single wait, including a server `Retry-After`.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Wait before retry number `retry` (1-based): doubling from the base,
    /// capped at `max_backoff`.
    pub fn delay(&self, retry: usize) -> Duration {
        let shift = u32::try_from(retry.saturating_sub(1).min(16)).unwrap_or(16);
        self.base_backoff.saturating_mul(1u32 << shift).min(self.max_backoff)
    }
}

/// Why an attempt is repeated.
enum Retry {
    Status(StatusCode, Option<Duration>),
    Error(reqwest::Error),
}

/// HTTP client with bounded retries for idempotent-safe registry calls.
///
/// Server errors, `429 Too Many Requests` and connection-level failures are
/// retried; any other response is handed back to the caller untouched.
#[derive(Clone)]
pub struct HttpClient {
    client: ReqwestClient,
    policy: RetryPolicy,
}

impl HttpClient {
    pub fn builder() -> HttpClientBuilder {
        HttpClientBuilder::default()
    }

    pub fn new() -> Result<Self, RegSyncError> {
        Self::builder().build()
    }

    /// Client configured from the `registry` config section.
    pub fn from_config(config: &RegistryConfig) -> Result<Self, RegSyncError> {
        Self::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .max_attempts(usize::try_from(config.max_attempts).unwrap_or(1))
            .user_agent(concat!("regsync/", env!("CARGO_PKG_VERSION")))
            .build()
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn request<U>(&self, method: Method, url: U) -> RequestBuilder
    where
        U: reqwest::IntoUrl,
    {
        self.client.request(method, url)
    }

    /// Execute `builder`, repeating it within the retry policy.
    ///
    /// The request body must be clonable (buffered); streaming bodies fail
    /// with an internal error before anything is sent. Once attempts run
    /// out the last response is returned as-is.
    pub async fn send(&self, builder: RequestBuilder) -> Result<Response, RegSyncError> {
        let attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let request = builder
                .try_clone()
                .ok_or_else(|| {
                    RegSyncError::Internal("request body must be buffered to allow retries".into())
                })?
                .build()
                .map_err(to_domain)?;
            let method = request.method().clone();
            let url = request.url().clone();
            let last = attempt >= attempts;

            let retry = match self.client.execute(request).await {
                Ok(response) if !last && is_retryable_status(response.status()) => {
                    Retry::Status(response.status(), retry_after(&response))
                }
                Ok(response) => {
                    debug!(attempt, %method, %url, status = %response.status(), "HTTP response");
                    return Ok(response);
                }
                Err(err) if !last && is_retryable_error(&err) => Retry::Error(err),
                Err(err) => return Err(to_domain(err)),
            };

            let delay = match retry {
                Retry::Status(status, server_delay) => {
                    let delay = server_delay.unwrap_or_else(|| self.policy.delay(attempt));
                    warn!(attempt, %method, %url, %status, "Retrying HTTP request");
                    delay
                }
                Retry::Error(err) => {
                    warn!(attempt, %method, %url, error = %err, "Retrying HTTP request");
                    self.policy.delay(attempt)
                }
            };

            let delay = delay.min(self.policy.max_backoff);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            attempt += 1;
        }
    }
}

/// Builder for [`HttpClient`].
#[derive(Debug, Default)]
pub struct HttpClientBuilder {
    timeout: Option<Duration>,
    policy: RetryPolicy,
    user_agent: Option<String>,
    default_headers: Option<reqwest::header::HeaderMap>,
}

impl HttpClientBuilder {
    /// Per-attempt timeout (default 30s).
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.policy.max_attempts = attempts.max(1);
        self
    }

    pub fn base_backoff(mut self, backoff: Duration) -> Self {
        self.policy.base_backoff = backoff;
        self
    }

    pub fn max_backoff(mut self, backoff: Duration) -> Self {
        self.policy.max_backoff = backoff;
        self
    }

    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = Some(agent.into());
        self
    }

    pub fn default_headers(mut self, headers: reqwest::header::HeaderMap) -> Self {
        self.default_headers = Some(headers);
        self
    }

    pub fn build(self) -> Result<HttpClient, RegSyncError> {
        let mut builder = ReqwestClient::builder()
            .timeout(self.timeout.unwrap_or(Duration::from_secs(30)))
            .no_proxy();
        if let Some(agent) = self.user_agent {
            builder = builder.user_agent(agent);
        }
        if let Some(headers) = self.default_headers {
            builder = builder.default_headers(headers);
        }

        Ok(HttpClient { client: builder.build().map_err(to_domain)?, policy: self.policy })
    }
}

fn to_domain(err: reqwest::Error) -> RegSyncError {
    InfraError::from(err).into()
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}
