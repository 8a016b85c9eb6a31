//! Registry error taxonomy and control signals
//!
//! [`RegistryError`] is what stage code fails with; its classification
//! decides between bounded retry, giving up, or answering the caller
//! directly. [`ControlSignal`] is not an error: it redirects the state
//! machine (cancel, defer, rebuild).

use std::time::Duration;

use regsync_common::{ErrorClassification, ErrorSeverity};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::errors::RegSyncError;
use crate::types::correlation::ObjectType;
use crate::types::registry::ItemError;

/// Error reported by the registry for a request or item.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("registry rejected request: [{code}] {description}")]
pub struct ExternalBusinessError {
    pub code: String,
    pub description: String,
    pub detail: Option<String>,
}

impl ExternalBusinessError {
    /// Whether `warning_codes` downgrades this error to a warning.
    pub fn is_warning<S: AsRef<str>>(&self, warning_codes: &[S]) -> bool {
        warning_codes.iter().any(|c| c.as_ref() == self.code)
    }
}

impl From<ItemError> for ExternalBusinessError {
    fn from(err: ItemError) -> Self {
        Self { code: err.code, description: err.description, detail: err.detail }
    }
}

/// User-facing precondition failures. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum PublicError {
    #[error("{object_type} {object_id} has no identifier required by the registry")]
    NoIdentifier { object_type: ObjectType, object_id: String },

    #[error("no data found for {object_type} {object_id}")]
    NoData { object_type: ObjectType, object_id: String },

    #[error("{object_type} {object_id}: {message}")]
    Object { object_type: ObjectType, object_id: String, message: String },
}

/// Failure of an operation stage
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Business(ExternalBusinessError),

    /// Network or HTTP-level failure; the request may be repeated.
    #[error("transport error: {message}")]
    Transport { message: String, retry_after: Option<Duration> },

    /// The registry answered with something we cannot interpret.
    #[error("process error: {0}")]
    Process(String),

    #[error(transparent)]
    Public(PublicError),

    /// Local persistence failed mid-stage.
    #[error("storage error: {0}")]
    Storage(String),

    /// Programming or configuration fault.
    #[error("internal error: {0}")]
    Internal(String),
}

impl RegistryError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport { message: message.into(), retry_after: None }
    }

    pub fn process(message: impl Into<String>) -> Self {
        Self::Process(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Registry business code, when there is one.
    pub fn business_code(&self) -> Option<&str> {
        match self {
            Self::Business(err) => Some(&err.code),
            _ => None,
        }
    }
}

impl ErrorClassification for RegistryError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Storage(_))
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Public(_) => ErrorSeverity::Info,
            Self::Transport { .. } | Self::Business(_) => ErrorSeverity::Warning,
            Self::Process(_) | Self::Storage(_) => ErrorSeverity::Error,
            Self::Internal(_) => ErrorSeverity::Critical,
        }
    }

    fn is_critical(&self) -> bool {
        matches!(self, Self::Internal(_))
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Transport { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<ExternalBusinessError> for RegistryError {
    fn from(err: ExternalBusinessError) -> Self {
        Self::Business(err)
    }
}

impl From<PublicError> for RegistryError {
    fn from(err: PublicError) -> Self {
        Self::Public(err)
    }
}

impl From<RegSyncError> for RegistryError {
    fn from(err: RegSyncError) -> Self {
        match err {
            RegSyncError::Database(msg) => Self::Storage(msg),
            RegSyncError::Network(msg) => Self::transport(msg),
            RegSyncError::Registry(msg) => Self::Process(msg),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<RegistryError> for RegSyncError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Public(public) => Self::InvalidInput(public.to_string()),
            RegistryError::Transport { message, .. } => Self::Network(message),
            RegistryError::Storage(msg) => Self::Database(msg),
            RegistryError::Internal(msg) => Self::Internal(msg),
            other => Self::Registry(other.to_string()),
        }
    }
}

/// Non-error redirection of the operation state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlSignal {
    /// Abort deliberately; nothing more is stored.
    Cancel,
    /// Another operation holds the object; try again later from scratch.
    Pending { reason: String },
    /// Rebuild and resend the request.
    Restart { reason: String },
    /// A result arrived for a submission that is no longer current.
    /// Treated as a restart once, then as a failure.
    Consistency { reason: String },
}

impl std::fmt::Display for ControlSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancel => f.write_str("cancel"),
            Self::Pending { reason } => write!(f, "pending: {reason}"),
            Self::Restart { reason } => write!(f, "restart: {reason}"),
            Self::Consistency { reason } => write!(f, "consistency: {reason}"),
        }
    }
}
