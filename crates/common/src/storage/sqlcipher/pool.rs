//! SQLCipher connection pool
//!
//! r2d2 pool whose connections are keyed and configured on creation.

use std::path::Path;
use std::time::Instant;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use tracing::{debug, instrument, warn};

use super::cipher::{classify_message, configure_sqlcipher, verify_encryption, SqlCipherConfig};
use super::config::SqlCipherPoolConfig;
use super::connection::SqlCipherConnection;
use crate::storage::error::{StorageError, StorageResult};

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolHealth {
    pub healthy: bool,
    pub connections: u32,
    pub idle_connections: u32,
    pub max_connections: u32,
    pub message: Option<String>,
}

/// Keyed r2d2 pool; every connection is unlocked and tuned before use.
#[derive(Debug)]
pub struct SqlCipherPool {
    pool: Pool<SqliteConnectionManager>,
    config: SqlCipherPoolConfig,
}

impl SqlCipherPool {
    /// Open (or create) the encrypted database at `path`.
    ///
    /// One connection is checked out and read immediately, so a wrong key
    /// fails here with [`StorageError::WrongKeyOrNotEncrypted`].
    #[instrument(
        skip(encryption_key, config),
        fields(db_path = ?path, pool_size = config.max_size)
    )]
    pub fn new(
        path: &Path,
        encryption_key: String,
        config: SqlCipherPoolConfig,
    ) -> StorageResult<Self> {
        config.validate()?;

        let cipher = SqlCipherConfig::new(encryption_key);
        let tuning = config.clone();
        let manager = SqliteConnectionManager::file(path).with_init(move |conn| {
            configure_sqlcipher(conn, &cipher)
                .and_then(|()| tuning.apply(conn))
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
        });

        let pool = Pool::builder()
            .max_size(config.max_size)
            .connection_timeout(config.connection_timeout)
            .build(manager)
            .map_err(|e| checkout_error(&e, &config))?;

        let probe = pool.get().map_err(|e| checkout_error(&e, &config))?;
        verify_encryption(&probe)?;
        drop(probe);

        debug!(max_size = config.max_size, "SQLCipher pool ready");
        Ok(Self { pool, config })
    }

    /// Check out a connection, waiting up to the configured timeout.
    pub fn get_sqlcipher_connection(&self) -> StorageResult<SqlCipherConnection> {
        let start = Instant::now();
        let conn = self.pool.get().map_err(|e| checkout_error(&e, &self.config))?;
        let waited_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        if waited_ms > 100 {
            debug!(waited_ms, "Slow connection checkout");
        }
        Ok(SqlCipherConnection::new(conn))
    }

    pub fn max_size(&self) -> u32 {
        self.config.max_size
    }

    /// Report occupancy and whether a connection can be checked out.
    pub fn health_check(&self) -> PoolHealth {
        let state = self.pool.state();
        let message = self.pool.get().err().map(|e| format!("Pool unhealthy: {e}"));

        PoolHealth {
            healthy: message.is_none(),
            connections: state.connections,
            idle_connections: state.idle_connections,
            max_connections: self.config.max_size,
            message,
        }
    }
}

/// r2d2 only hands back a message; recover the wrong-key and timeout cases
/// from it.
fn checkout_error(err: &r2d2::Error, config: &SqlCipherPoolConfig) -> StorageError {
    let message = err.to_string();
    if let Some(classified) = classify_message(&message) {
        return classified;
    }
    if message.to_lowercase().contains("timed out") {
        warn!(timeout = ?config.connection_timeout, "Connection checkout timed out");
        return StorageError::Timeout(config.connection_timeout.as_secs());
    }
    warn!(error = %message, "Connection checkout failed");
    StorageError::Connection(message)
}
