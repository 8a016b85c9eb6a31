//! Conversions from external infrastructure errors into domain errors.

use regsync_common::storage::StorageError;
use regsync_domain::RegSyncError;
use reqwest::Error as HttpError;
use rusqlite::Error as SqlError;
use tokio::task::JoinError;

/// Error newtype that keeps conversions on the infrastructure side and can be
/// converted back into the domain error.
#[derive(Debug)]
pub struct InfraError(pub RegSyncError);

impl std::fmt::Display for InfraError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for InfraError {}

impl From<InfraError> for RegSyncError {
    fn from(value: InfraError) -> Self {
        value.0
    }
}

impl From<RegSyncError> for InfraError {
    fn from(value: RegSyncError) -> Self {
        InfraError(value)
    }
}

trait IntoRegSyncError {
    fn into_regsync(self) -> RegSyncError;
}

/* -------------------------------------------------------------------------- */
/* rusqlite::Error → RegSyncError */
/* -------------------------------------------------------------------------- */

impl IntoRegSyncError for SqlError {
    fn into_regsync(self) -> RegSyncError {
        use rusqlite::ffi::ErrorCode;
        use rusqlite::Error as RE;

        fn looks_like_wrong_key(message: &str) -> bool {
            let lower = message.to_ascii_lowercase();
            lower.contains("not a database") || lower.contains("encrypted")
        }

        match self {
            RE::SqliteFailure(err, maybe_message) => {
                let message = maybe_message.unwrap_or_default();
                match (err.code, err.extended_code) {
                    (ErrorCode::DatabaseBusy, _) => {
                        RegSyncError::Database("database is busy".into())
                    }
                    (ErrorCode::DatabaseLocked, _) => {
                        RegSyncError::Database("database is locked".into())
                    }
                    (ErrorCode::ConstraintViolation, 2067) => {
                        RegSyncError::Database("unique constraint violation".into())
                    }
                    (ErrorCode::ConstraintViolation, 787) => {
                        RegSyncError::Database("foreign key constraint violation".into())
                    }
                    (_, _) if looks_like_wrong_key(&message) => RegSyncError::Security(
                        "SQLCipher key rejected or database not encrypted".into(),
                    ),
                    _ => RegSyncError::Database(format!(
                        "sqlite failure {:?} (code {}): {}",
                        err.code, err.extended_code, message
                    )),
                }
            }
            RE::QueryReturnedNoRows => RegSyncError::NotFound("no rows returned by query".into()),
            RE::FromSqlConversionFailure(_, _, cause) => {
                RegSyncError::Database(format!("failed to convert sqlite value: {cause}"))
            }
            RE::InvalidColumnType(_, name, ty) => {
                RegSyncError::Database(format!("invalid column type for {name}: {ty}"))
            }
            RE::InvalidPath(path) => RegSyncError::Database(format!(
                "invalid database path: {}",
                path.to_string_lossy()
            )),
            other => RegSyncError::Database(other.to_string()),
        }
    }
}

impl From<SqlError> for InfraError {
    fn from(value: SqlError) -> Self {
        InfraError(value.into_regsync())
    }
}

/* -------------------------------------------------------------------------- */
/* StorageError → RegSyncError */
/* -------------------------------------------------------------------------- */

impl IntoRegSyncError for StorageError {
    fn into_regsync(self) -> RegSyncError {
        match self {
            StorageError::WrongKeyOrNotEncrypted => {
                RegSyncError::Security("sqlcipher key rejected or database not encrypted".into())
            }
            StorageError::Timeout(seconds) => {
                RegSyncError::Database(format!("database timeout after {seconds}s"))
            }
            StorageError::Connection(message)
            | StorageError::Query(message)
            | StorageError::Encryption(message)
            | StorageError::Migration(message)
            | StorageError::InvalidConfig(message) => RegSyncError::Database(message),
            StorageError::SchemaVersionMismatch { expected, found } => RegSyncError::Database(
                format!("schema version mismatch (expected {expected}, found {found})"),
            ),
            StorageError::Common(common_err) => RegSyncError::Database(common_err.to_string()),
            StorageError::Rusqlite(sql_err) => sql_err.into_regsync(),
            StorageError::R2d2(r2d2_err) => RegSyncError::Database(r2d2_err.to_string()),
            StorageError::SerdeJson(json_err) => {
                RegSyncError::Database(format!("stored JSON is invalid: {json_err}"))
            }
        }
    }
}

impl From<StorageError> for InfraError {
    fn from(value: StorageError) -> Self {
        InfraError(value.into_regsync())
    }
}

/// Storage failures as domain errors; used by every repository.
pub fn map_storage_error(err: StorageError) -> RegSyncError {
    err.into_regsync()
}

/// `spawn_blocking` join failures as domain errors.
pub fn map_join_error(err: JoinError) -> RegSyncError {
    if err.is_cancelled() {
        RegSyncError::Internal("blocking task cancelled".into())
    } else {
        RegSyncError::Internal(format!("blocking task failed: {err}"))
    }
}

/* -------------------------------------------------------------------------- */
/* reqwest::Error → RegSyncError */
/* -------------------------------------------------------------------------- */

impl IntoRegSyncError for HttpError {
    fn into_regsync(self) -> RegSyncError {
        if self.is_timeout() {
            return RegSyncError::Network("HTTP request timed out".into());
        }

        if self.is_connect() {
            return RegSyncError::Network("HTTP connection failure".into());
        }

        if self.is_decode() {
            return RegSyncError::Registry(format!("undecodable registry response: {self}"));
        }

        if let Some(status) = self.status() {
            let code = status.as_u16();
            let message =
                format!("HTTP {} {}", code, status.canonical_reason().unwrap_or("unknown status"));

            return match code {
                401 | 403 => RegSyncError::Security(message),
                404 => RegSyncError::NotFound(message),
                429 => RegSyncError::Network(message),
                400..=499 => RegSyncError::InvalidInput(message),
                _ => RegSyncError::Network(message),
            };
        }

        RegSyncError::Network(self.to_string())
    }
}

impl From<HttpError> for InfraError {
    fn from(value: HttpError) -> Self {
        InfraError(value.into_regsync())
    }
}

/* -------------------------------------------------------------------------- */
/* Tests */
/* -------------------------------------------------------------------------- */
