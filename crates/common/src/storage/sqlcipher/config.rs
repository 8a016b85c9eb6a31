//! Pool sizing and the per-connection pragmas applied on checkout.

use std::time::Duration;

use rusqlite::Connection;

use crate::storage::error::{StorageError, StorageResult};

/// SQLCipher pool configuration
#[derive(Debug, Clone)]
pub struct SqlCipherPoolConfig {
    pub max_size: u32,

    /// How long a caller waits for a free connection.
    pub connection_timeout: Duration,

    /// How long a statement waits on a competing writer's lock.
    pub busy_timeout: Duration,

    pub enable_wal: bool,
    pub enable_foreign_keys: bool,
}

impl Default for SqlCipherPoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            connection_timeout: Duration::from_secs(5),
            busy_timeout: Duration::from_secs(5),
            enable_wal: true,
            enable_foreign_keys: true,
        }
    }
}

impl SqlCipherPoolConfig {
    pub fn with_max_size(mut self, max_size: u32) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn validate(&self) -> StorageResult<()> {
        if self.max_size == 0 {
            return Err(StorageError::InvalidConfig("pool needs at least one connection".into()));
        }
        if self.connection_timeout.is_zero() {
            return Err(StorageError::InvalidConfig("connection timeout must be positive".into()));
        }
        Ok(())
    }

    fn pragma_script(&self) -> String {
        let mut script = String::new();
        if self.enable_wal {
            script.push_str("PRAGMA journal_mode=WAL;\nPRAGMA wal_autocheckpoint=1000;\n");
        }
        script.push_str("PRAGMA synchronous=NORMAL;\n");
        if self.enable_foreign_keys {
            script.push_str("PRAGMA foreign_keys=ON;\n");
        }
        script
    }

    /// Apply journal, durability and lock-wait settings to a keyed connection.
    pub fn apply(&self, conn: &Connection) -> StorageResult<()> {
        conn.execute_batch(&self.pragma_script())
            .map_err(|e| StorageError::Query(format!("Failed to apply pragmas: {e}")))?;
        conn.busy_timeout(self.busy_timeout)
            .map_err(|e| StorageError::Query(format!("Failed to set busy timeout: {e}")))
    }
}
