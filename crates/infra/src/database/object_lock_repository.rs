//! Object-scoped locks with expiry
//!
//! A lock row names its owner and an absolute expiry. Acquisition is
//! all-or-nothing inside one IMMEDIATE transaction; rows past their expiry
//! are taken over.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regsync_common::storage::{SqlCipherConnection, StorageError, StorageResult};
use regsync_core::operation::ObjectLock;
use regsync_core::unix_now;
use regsync_domain::Result as DomainResult;
use rusqlite::{params, TransactionBehavior};
use tokio::task;
use tracing::debug;

use super::manager::DbManager;
use crate::errors::{map_join_error, map_storage_error};

/// SqlCipher-based object lock table
pub struct SqlCipherObjectLock {
    db: Arc<DbManager>,
}

impl SqlCipherObjectLock {
    pub fn new(db: Arc<DbManager>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ObjectLock for SqlCipherObjectLock {
    async fn try_acquire(&self, keys: &[String], owner: &str, ttl: Duration) -> DomainResult<bool> {
        if keys.is_empty() {
            return Ok(true);
        }
        let db = Arc::clone(&self.db);
        let keys = keys.to_vec();
        let owner = owner.to_string();
        let now = unix_now();
        let expires_at = now.saturating_add(i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX));

        task::spawn_blocking(move || -> DomainResult<bool> {
            let mut conn = db.get_connection()?;
            acquire_all(&mut conn, &keys, &owner, now, expires_at).map_err(map_storage_error)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn release(&self, keys: &[String], owner: &str) -> DomainResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let db = Arc::clone(&self.db);
        let keys = keys.to_vec();
        let owner = owner.to_string();

        task::spawn_blocking(move || -> DomainResult<()> {
            let mut conn = db.get_connection()?;
            release_all(&mut conn, &keys, &owner).map_err(map_storage_error)
        })
        .await
        .map_err(map_join_error)?
    }
}

// ============================================================================
// SQL Operations (synchronous)
// ============================================================================

fn acquire_all(
    conn: &mut SqlCipherConnection,
    keys: &[String],
    owner: &str,
    now: i64,
    expires_at: i64,
) -> StorageResult<bool> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    for key in keys {
        let holder = tx.query_row(
            "SELECT owner, expires_at FROM object_locks WHERE lock_key = ?1",
            params![key],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
        );
        match holder {
            Ok((holder, until)) if holder != owner && until > now => {
                debug!(lock_key = %key, holder = %holder, "Object lock held elsewhere");
                return Ok(false);
            }
            Ok(_) | Err(rusqlite::Error::QueryReturnedNoRows) => {}
            Err(err) => return Err(StorageError::from(err)),
        }
    }

    for key in keys {
        tx.execute(
            "INSERT INTO object_locks (lock_key, owner, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT (lock_key) DO UPDATE SET owner = excluded.owner, expires_at = excluded.expires_at",
            params![key, owner, expires_at],
        )?;
    }

    tx.commit()?;
    Ok(true)
}

fn release_all(conn: &mut SqlCipherConnection, keys: &[String], owner: &str) -> StorageResult<()> {
    let tx = conn.transaction()?;
    for key in keys {
        tx.execute(
            "DELETE FROM object_locks WHERE lock_key = ?1 AND owner = ?2",
            params![key, owner],
        )?;
    }
    tx.commit()?;
    Ok(())
}
