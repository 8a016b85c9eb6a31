//! Failures of the encrypted store.
//!
//! Raised by the SQLCipher pool and by the synchronous SQL helpers that the
//! repositories run on blocking threads.

use thiserror::Error;

use crate::error::{ErrorClassification, ErrorSeverity};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("cannot reach database: {0}")]
    Connection(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("cipher setup failed: {0}")]
    Encryption(String),

    #[error("migration failed: {0}")]
    Migration(String),

    /// The key does not open the file, or the file is plain SQLite.
    #[error("encryption key rejected or database not encrypted")]
    WrongKeyOrNotEncrypted,

    /// No pooled connection became free in time.
    #[error("no connection available within {0}s")]
    Timeout(u64),

    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),

    /// The file was migrated by a newer build.
    #[error("database schema is at version {found}, this build supports up to {expected}")]
    SchemaVersionMismatch { expected: i32, found: i32 },

    #[error(transparent)]
    Common(#[from] crate::CommonError),

    #[error(transparent)]
    Rusqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    R2d2(#[from] r2d2::Error),

    /// A JSON column failed to decode.
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

impl ErrorClassification for StorageError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Connection(_) => true,
            // BUSY and LOCKED clear once the competing writer commits
            Self::Rusqlite(err) => matches!(
                err.sqlite_error_code(),
                Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
            ),
            Self::Common(common_err) => common_err.is_retryable(),
            _ => false,
        }
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Encryption(_)
            | Self::Migration(_)
            | Self::WrongKeyOrNotEncrypted
            | Self::SchemaVersionMismatch { .. } => ErrorSeverity::Critical,
            Self::Timeout(_) => ErrorSeverity::Warning,
            Self::Common(common_err) => common_err.severity(),
            _ => ErrorSeverity::Error,
        }
    }

    fn is_critical(&self) -> bool {
        matches!(
            self,
            Self::Encryption(_)
                | Self::Migration(_)
                | Self::WrongKeyOrNotEncrypted
                | Self::SchemaVersionMismatch { .. }
        ) || matches!(self, Self::Common(err) if err.is_critical())
    }

    fn retry_after(&self) -> Option<std::time::Duration> {
        match self {
            Self::Common(common_err) => common_err.retry_after(),
            _ => None,
        }
    }
}

impl From<StorageError> for crate::CommonError {
    fn from(err: StorageError) -> Self {
        if let StorageError::Common(common_err) = err {
            return common_err;
        }

        crate::CommonError::storage(err.to_string())
    }
}
