//! Classification of registry HTTP failures
//!
//! Maps status codes and bodies onto the [`RegistryError`] taxonomy: what
//! may be repeated becomes a transport error, what the registry rejected
//! with a structured fault becomes a business error, and everything we
//! cannot interpret becomes a process error.

use std::time::Duration;

use regsync_domain::{ItemError, RegSyncError, RegistryError};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;

/// Fallback wait when a rate-limited response carries no `Retry-After`.
pub const DEFAULT_RATE_LIMIT_DELAY: Duration = Duration::from_secs(60);

/// Categories of registry failures for retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryErrorCategory {
    /// 401/403; credentials must be fixed, not retried
    Authentication,
    /// 429
    RateLimit,
    /// 5xx
    Server,
    /// 4xx other than the above
    Client,
    /// Connection failures and timeouts
    Network,
}

impl RegistryErrorCategory {
    pub fn from_status(status: StatusCode) -> Self {
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            Self::Authentication
        } else if status == StatusCode::TOO_MANY_REQUESTS {
            Self::RateLimit
        } else if status.is_server_error() {
            Self::Server
        } else {
            Self::Client
        }
    }

    pub fn is_retryable(self) -> bool {
        matches!(self, Self::RateLimit | Self::Server | Self::Network)
    }
}

/// Turn a non-success response into a registry error.
pub fn classify_status(
    status: StatusCode,
    headers: &HeaderMap,
    url: &str,
    body: &str,
) -> RegistryError {
    let message = if body.is_empty() {
        format!("{url} returned status {status}")
    } else {
        format!("{url} returned status {status}: {}", truncate_body(body))
    };

    match RegistryErrorCategory::from_status(status) {
        RegistryErrorCategory::RateLimit => RegistryError::Transport {
            message,
            retry_after: Some(retry_after(headers).unwrap_or(DEFAULT_RATE_LIMIT_DELAY)),
        },
        RegistryErrorCategory::Server | RegistryErrorCategory::Network => {
            RegistryError::Transport { message, retry_after: retry_after(headers) }
        }
        RegistryErrorCategory::Authentication => {
            RegistryError::process(format!("registry authentication rejected: {message}"))
        }
        RegistryErrorCategory::Client => match parse_fault(body) {
            Some(fault) => RegistryError::Business(fault.into()),
            None => RegistryError::process(message),
        },
    }
}

/// Client-side failures reported by [`crate::http::HttpClient`].
pub fn from_client_error(err: RegSyncError) -> RegistryError {
    match err {
        RegSyncError::Network(message) => RegistryError::transport(message),
        RegSyncError::Registry(message) => RegistryError::process(message),
        RegSyncError::Config(message) | RegSyncError::Internal(message) => {
            RegistryError::internal(message)
        }
        other => RegistryError::process(other.to_string()),
    }
}

/// A response body that could not be decoded.
pub fn undecodable(what: &str, err: &serde_json::Error) -> RegistryError {
    RegistryError::process(format!("undecodable {what} from registry: {err}"))
}

/// Structured fault body: `{"fault": {...}}` or a bare `{"code", "description"}`.
pub fn parse_fault(body: &str) -> Option<ItemError> {
    #[derive(serde::Deserialize)]
    struct Envelope {
        fault: ItemError,
    }

    if body.trim().is_empty() {
        return None;
    }
    serde_json::from_str::<Envelope>(body)
        .map(|e| e.fault)
        .or_else(|_| serde_json::from_str::<ItemError>(body))
        .ok()
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn truncate_body(body: &str) -> String {
    const MAX: usize = 200;
    if body.chars().count() <= MAX {
        body.to_string()
    } else {
        let cut: String = body.chars().take(MAX).collect();
        format!("{cut}...")
    }
}
