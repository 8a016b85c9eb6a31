//! Correlation record repository
//!
//! One row per `(object_type, object_id, provider_id)`. Guarded writes
//! compare the stored transport id inside the UPDATE itself, so a
//! superseded submission can never overwrite a newer one.

use std::sync::Arc;

use async_trait::async_trait;
use regsync_common::storage::{SqlCipherConnection, StorageError, StorageResult};
use regsync_core::correlation::CorrelationRepository;
use regsync_domain::{CorrelationKey, CorrelationRecord, ObjectType, Result as DomainResult};
use rusqlite::{params, Row};
use tokio::task;

use super::columns::{optional_provider, parse_column, provider_column};
use super::manager::DbManager;
use crate::errors::{map_join_error, map_storage_error};

const COLUMNS: &str = "object_type, object_id, provider_id, house_id, external_id, code, status,
     deleted, transport_id, batch_id, submitted_at, last_error, saved_at, created_at, updated_at";

/// SqlCipher-based correlation repository
pub struct SqlCipherCorrelationRepository {
    db: Arc<DbManager>,
}

impl SqlCipherCorrelationRepository {
    pub fn new(db: Arc<DbManager>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CorrelationRepository for SqlCipherCorrelationRepository {
    async fn get_or_create(
        &self,
        key: &CorrelationKey,
        house_id: Option<&str>,
        now: i64,
    ) -> DomainResult<CorrelationRecord> {
        let db = Arc::clone(&self.db);
        let fresh = CorrelationRecord::new(key.clone(), house_id.map(str::to_string), now);

        task::spawn_blocking(move || -> DomainResult<CorrelationRecord> {
            let conn = db.get_connection()?;
            insert_if_absent(&conn, &fresh).map_err(map_storage_error)?;
            query_by_key(&conn, &fresh.key())
                .map_err(map_storage_error)?
                .ok_or_else(|| {
                    regsync_domain::RegSyncError::Database(format!(
                        "correlation {} vanished after insert",
                        fresh.key()
                    ))
                })
        })
        .await
        .map_err(map_join_error)?
    }

    async fn find(&self, key: &CorrelationKey) -> DomainResult<Option<CorrelationRecord>> {
        let db = Arc::clone(&self.db);
        let key = key.clone();

        task::spawn_blocking(move || -> DomainResult<Option<CorrelationRecord>> {
            let conn = db.get_connection()?;
            query_by_key(&conn, &key).map_err(map_storage_error)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn find_by_transport_id(
        &self,
        transport_id: &str,
    ) -> DomainResult<Option<CorrelationRecord>> {
        let db = Arc::clone(&self.db);
        let transport_id = transport_id.to_string();

        task::spawn_blocking(move || -> DomainResult<Option<CorrelationRecord>> {
            let conn = db.get_connection()?;
            query_by_transport_id(&conn, &transport_id).map_err(map_storage_error)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn find_by_batch(&self, batch_id: &str) -> DomainResult<Vec<CorrelationRecord>> {
        let db = Arc::clone(&self.db);
        let batch_id = batch_id.to_string();

        task::spawn_blocking(move || -> DomainResult<Vec<CorrelationRecord>> {
            let conn = db.get_connection()?;
            query_by_batch(&conn, &batch_id).map_err(map_storage_error)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn upsert(&self, record: &CorrelationRecord) -> DomainResult<()> {
        let db = Arc::clone(&self.db);
        let record = record.clone();

        task::spawn_blocking(move || -> DomainResult<()> {
            let conn = db.get_connection()?;
            upsert_record(&conn, &record).map_err(map_storage_error)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn upsert_if_current(
        &self,
        record: &CorrelationRecord,
        expected_transport_id: &str,
    ) -> DomainResult<bool> {
        let db = Arc::clone(&self.db);
        let record = record.clone();
        let expected = expected_transport_id.to_string();

        task::spawn_blocking(move || -> DomainResult<bool> {
            let conn = db.get_connection()?;
            update_if_current(&conn, &record, &expected).map_err(map_storage_error)
        })
        .await
        .map_err(map_join_error)?
    }
}

// ============================================================================
// SQL Operations (synchronous)
// ============================================================================

fn insert_if_absent(conn: &SqlCipherConnection, record: &CorrelationRecord) -> StorageResult<()> {
    conn.execute(
        "INSERT OR IGNORE INTO correlation_records
            (object_type, object_id, provider_id, house_id, status, deleted, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7)",
        params![
            record.object_type.as_str(),
            &record.object_id,
            provider_column(record.provider_id.as_deref()),
            &record.house_id,
            record.status.as_str(),
            record.created_at,
            record.updated_at,
        ],
    )?;
    Ok(())
}

fn upsert_record(conn: &SqlCipherConnection, record: &CorrelationRecord) -> StorageResult<()> {
    conn.execute(
        "INSERT INTO correlation_records
            (object_type, object_id, provider_id, house_id, external_id, code, status, deleted,
             transport_id, batch_id, submitted_at, last_error, saved_at, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
         ON CONFLICT (object_type, object_id, provider_id) DO UPDATE SET
            house_id = excluded.house_id,
            external_id = excluded.external_id,
            code = excluded.code,
            status = excluded.status,
            deleted = excluded.deleted,
            transport_id = excluded.transport_id,
            batch_id = excluded.batch_id,
            submitted_at = excluded.submitted_at,
            last_error = excluded.last_error,
            saved_at = excluded.saved_at,
            updated_at = excluded.updated_at",
        params![
            record.object_type.as_str(),
            &record.object_id,
            provider_column(record.provider_id.as_deref()),
            &record.house_id,
            &record.external_id,
            &record.code,
            record.status.as_str(),
            record.deleted,
            &record.transport_id,
            &record.batch_id,
            record.submitted_at,
            &record.last_error,
            record.saved_at,
            record.created_at,
            record.updated_at,
        ],
    )?;
    Ok(())
}

fn update_if_current(
    conn: &SqlCipherConnection,
    record: &CorrelationRecord,
    expected_transport_id: &str,
) -> StorageResult<bool> {
    let changed = conn.execute(
        "UPDATE correlation_records SET
            house_id = ?4, external_id = ?5, code = ?6, status = ?7, deleted = ?8,
            transport_id = ?9, batch_id = ?10, submitted_at = ?11, last_error = ?12,
            saved_at = ?13, updated_at = ?14
         WHERE object_type = ?1 AND object_id = ?2 AND provider_id = ?3
           AND transport_id = ?15",
        params![
            record.object_type.as_str(),
            &record.object_id,
            provider_column(record.provider_id.as_deref()),
            &record.house_id,
            &record.external_id,
            &record.code,
            record.status.as_str(),
            record.deleted,
            &record.transport_id,
            &record.batch_id,
            record.submitted_at,
            &record.last_error,
            record.saved_at,
            record.updated_at,
            expected_transport_id,
        ],
    )?;
    Ok(changed > 0)
}

fn query_by_key(
    conn: &SqlCipherConnection,
    key: &CorrelationKey,
) -> StorageResult<Option<CorrelationRecord>> {
    let sql = format!(
        "SELECT {COLUMNS} FROM correlation_records
         WHERE object_type = ?1 AND object_id = ?2 AND provider_id = ?3"
    );

    match conn.query_row(
        &sql,
        params![
            key.object_type.as_str(),
            &key.object_id,
            provider_column(key.provider_id.as_deref())
        ],
        map_correlation_row,
    ) {
        Ok(record) => Ok(Some(record)),
        Err(StorageError::Rusqlite(rusqlite::Error::QueryReturnedNoRows)) => Ok(None),
        Err(err) => Err(err),
    }
}

fn query_by_transport_id(
    conn: &SqlCipherConnection,
    transport_id: &str,
) -> StorageResult<Option<CorrelationRecord>> {
    let sql = format!(
        "SELECT {COLUMNS} FROM correlation_records WHERE transport_id = ?1
         ORDER BY updated_at DESC LIMIT 1"
    );

    match conn.query_row(&sql, params![transport_id], map_correlation_row) {
        Ok(record) => Ok(Some(record)),
        Err(StorageError::Rusqlite(rusqlite::Error::QueryReturnedNoRows)) => Ok(None),
        Err(err) => Err(err),
    }
}

fn query_by_batch(
    conn: &SqlCipherConnection,
    batch_id: &str,
) -> StorageResult<Vec<CorrelationRecord>> {
    let sql = format!(
        "SELECT {COLUMNS} FROM correlation_records WHERE batch_id = ?1
         ORDER BY object_type, object_id"
    );

    let mut stmt = conn.prepare(&sql)?;
    stmt.query_map(params![batch_id], map_correlation_row)
}

fn map_correlation_row(row: &Row<'_>) -> rusqlite::Result<CorrelationRecord> {
    let object_type: String = row.get(0)?;
    let provider_id: String = row.get(2)?;

    Ok(CorrelationRecord {
        object_type: ObjectType::from(object_type),
        object_id: row.get(1)?,
        provider_id: optional_provider(provider_id),
        house_id: row.get(3)?,
        external_id: row.get(4)?,
        code: row.get(5)?,
        status: parse_column(row, 6)?,
        deleted: row.get(7)?,
        transport_id: row.get(8)?,
        batch_id: row.get(9)?,
        submitted_at: row.get(10)?,
        last_error: row.get(11)?,
        saved_at: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

// ============================================================================
// Tests
// ============================================================================
