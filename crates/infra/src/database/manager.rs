//! Encrypted database handle and schema migrations.
//!
//! Migrations are numbered SQL scripts. Each one runs at most once, inside a
//! transaction that also records its version in `schema_version`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use regsync_common::storage::sqlcipher::{
    PoolHealth, SqlCipherConnection, SqlCipherPool, SqlCipherPoolConfig,
};
use regsync_common::storage::StorageError;
use regsync_domain::{DatabaseConfig, RegSyncError, Result};
use rusqlite::params;
use tracing::{debug, info};

use crate::errors::{map_storage_error, InfraError};

/// Ordered `(version, script)` pairs.
const MIGRATIONS: &[(i32, &str)] = &[(1, include_str!("schema.sql"))];

/// Version the database reaches once every migration has run.
pub const SCHEMA_VERSION: i32 = 1;

/// Pooled access to the SQLCipher database.
pub struct DbManager {
    pool: Arc<SqlCipherPool>,
    path: PathBuf,
}

impl DbManager {
    /// Open (or create) the database. Fails with `Security` without a key.
    pub fn new<P: AsRef<Path>>(
        db_path: P,
        pool_size: u32,
        encryption_key: Option<&str>,
    ) -> Result<Self> {
        let key = encryption_key
            .filter(|key| !key.is_empty())
            .ok_or_else(|| RegSyncError::Security("database encryption key not provided".into()))?;

        let path = db_path.as_ref().to_path_buf();
        let config = SqlCipherPoolConfig::default().with_max_size(pool_size.max(1));
        let pool = SqlCipherPool::new(&path, key.to_string(), config)
            .map(Arc::new)
            .map_err(map_storage_error)?;

        info!(db_path = %path.display(), max_connections = pool.max_size(), "Database opened");
        Ok(Self { pool, path })
    }

    /// Open the database described by the `database` section and bring the
    /// schema up to date.
    pub fn from_config(config: &DatabaseConfig) -> Result<Self> {
        let manager = Self::new(&config.path, config.pool_size, config.encryption_key.as_deref())?;
        manager.run_migrations()?;
        Ok(manager)
    }

    pub fn pool(&self) -> &Arc<SqlCipherPool> {
        &self.pool
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get_connection(&self) -> Result<SqlCipherConnection> {
        self.pool.get_sqlcipher_connection().map_err(map_storage_error)
    }

    /// Apply every migration newer than the recorded schema version.
    ///
    /// Returns the number of migrations applied; `0` when up to date. A
    /// database written by a newer build is refused.
    pub fn run_migrations(&self) -> Result<usize> {
        let mut conn = self.get_connection()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (
                 version INTEGER PRIMARY KEY,
                 applied_at INTEGER NOT NULL
             );",
        )
        .map_err(map_sql_error)?;

        let current = current_version(&conn)?;
        if current > SCHEMA_VERSION {
            return Err(map_storage_error(StorageError::SchemaVersionMismatch {
                expected: SCHEMA_VERSION,
                found: current,
            }));
        }

        let mut applied = 0;
        for (version, script) in MIGRATIONS.iter().filter(|(version, _)| *version > current) {
            let tx = conn.transaction().map_err(map_storage_error)?;
            tx.execute_batch(script).map_err(|e| {
                map_storage_error(StorageError::Migration(format!("migration {version}: {e}")))
            })?;
            tx.execute(
                "INSERT INTO schema_version (version, applied_at)
                 VALUES (?1, CAST(strftime('%s','now') AS INTEGER))",
                params![version],
            )
            .map_err(map_sql_error)?;
            tx.commit().map_err(map_sql_error)?;

            debug!(version, "Migration applied");
            applied += 1;
        }

        if applied > 0 {
            info!(applied, version = SCHEMA_VERSION, "Schema migrated");
        }
        Ok(applied)
    }

    /// Highest applied migration, `0` for a fresh database.
    pub fn schema_version(&self) -> Result<i32> {
        current_version(&self.get_connection()?)
    }

    /// Verify the database answers a trivial query.
    pub fn health_check(&self) -> Result<()> {
        let conn = self.get_connection()?;
        conn.query_row("SELECT 1", params![], |row| row.get::<_, i32>(0))
            .map_err(map_storage_error)?;
        Ok(())
    }

    pub fn pool_health(&self) -> PoolHealth {
        self.pool.health_check()
    }
}

fn current_version(conn: &SqlCipherConnection) -> Result<i32> {
    let tracked: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'schema_version'",
            params![],
            |row| row.get(0),
        )
        .map_err(map_storage_error)?;
    if tracked == 0 {
        return Ok(0);
    }

    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", params![], |row| {
        row.get(0)
    })
    .map_err(map_storage_error)
}

fn map_sql_error(err: rusqlite::Error) -> RegSyncError {
    RegSyncError::from(InfraError::from(err))
}
