//! Error vocabulary shared by every regsync crate.
//!
//! [`ErrorClassification`] is how the operation engine decides between a
//! scheduled retry and escalation; module errors (storage, registry) implement
//! it so that policy lives in one place. [`CommonError`] covers the few
//! failure shapes that appear in more than one layer. Module errors wrap it
//! rather than repeating its variants:
//!
//! ```rust,ignore
//! #[derive(Debug, thiserror::Error)]
//! pub enum QueueError {
//!     #[error("entry {0} is malformed")]
//!     Malformed(String),
//!
//!     #[error(transparent)]
//!     Common(#[from] CommonError),
//! }
//! ```

use std::fmt;
use std::time::Duration;

use thiserror::Error;

pub type CommonResult<T> = Result<T, CommonError>;

/// Failure shapes shared across layers.
#[derive(Debug, Clone, Error)]
pub enum CommonError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{format} error: {message}")]
    Serialization { format: &'static str, message: String },

    #[error("'{operation}' timed out after {duration:?}")]
    Timeout { operation: String, duration: Duration },

    #[error("'{resource}' is locked: {message}")]
    Lock { resource: String, message: String },

    #[error("Storage error: {message}")]
    Storage { message: String, operation: Option<String> },

    /// Invariant violation; never expected in a healthy system.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CommonError {
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout { operation: operation.into(), duration }
    }

    pub fn lock(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Lock { resource: resource.into(), message: message.into() }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage { message: message.into(), operation: None }
    }
}

impl ErrorClassification for CommonError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Lock { .. })
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Timeout { .. } | Self::Lock { .. } => ErrorSeverity::Warning,
            Self::Internal(_) => ErrorSeverity::Critical,
            _ => ErrorSeverity::Error,
        }
    }

    fn is_critical(&self) -> bool {
        matches!(self, Self::Internal(_))
    }

    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Retryability and severity of a failure.
///
/// `retry_after` lets an error suggest its own delay (a registry
/// `Retry-After`, for instance); `severity` drives the log level.
pub trait ErrorClassification {
    /// Transient failures that may succeed on a later attempt.
    fn is_retryable(&self) -> bool;

    fn severity(&self) -> ErrorSeverity;

    /// Failures that need a human (corruption, invariant violations).
    fn is_critical(&self) -> bool;

    fn retry_after(&self) -> Option<Duration>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Info => "INFO",
            Self::Warning => "WARN",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        })
    }
}

impl From<serde_json::Error> for CommonError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization { format: "JSON", message: err.to_string() }
    }
}

impl From<toml::de::Error> for CommonError {
    fn from(err: toml::de::Error) -> Self {
        Self::Serialization { format: "TOML", message: err.to_string() }
    }
}
