//! Operation record repository
//!
//! List fields are stored as JSON text. The cancel flag is written only by
//! [`OperationRepository::request_cancel`] so a running operation saving its
//! progress can never clear a concurrent cancel request.

use std::sync::Arc;

use async_trait::async_trait;
use regsync_common::storage::{SqlCipherConnection, StorageError, StorageResult};
use regsync_core::operation::OperationRepository;
use regsync_domain::{ObjectType, OperationRecord, Result as DomainResult};
use rusqlite::{params, Row, TransactionBehavior};
use tokio::task;

use super::columns::{json_column, parse_column};
use super::manager::DbManager;
use crate::errors::{map_join_error, map_storage_error};

const COLUMNS: &str = "id, name, direction, object_type, object_ids, provider_id, force_update,
     unattended, status, stage, ack, backoff_index, attempts, restarts, warnings, errors,
     missing_ids, last_failure, cancel_requested, needs_attention, next_run_at, created_at,
     updated_at, object_houses";

/// Statuses a worker never picks up again.
const FINAL_STATUSES: &str = "('done', 'warning', 'canceled')";

/// SqlCipher-based operation repository
pub struct SqlCipherOperationRepository {
    db: Arc<DbManager>,
}

impl SqlCipherOperationRepository {
    pub fn new(db: Arc<DbManager>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl OperationRepository for SqlCipherOperationRepository {
    async fn insert(&self, record: &OperationRecord) -> DomainResult<()> {
        let db = Arc::clone(&self.db);
        let record = record.clone();

        task::spawn_blocking(move || -> DomainResult<()> {
            let conn = db.get_connection()?;
            insert_operation(&conn, &record).map_err(map_storage_error)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn save(&self, record: &OperationRecord) -> DomainResult<()> {
        let db = Arc::clone(&self.db);
        let record = record.clone();

        task::spawn_blocking(move || -> DomainResult<()> {
            let conn = db.get_connection()?;
            update_operation(&conn, &record).map_err(map_storage_error)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn get(&self, id: &str) -> DomainResult<Option<OperationRecord>> {
        let db = Arc::clone(&self.db);
        let id = id.to_string();

        task::spawn_blocking(move || -> DomainResult<Option<OperationRecord>> {
            let conn = db.get_connection()?;
            query_operation(&conn, &id).map_err(map_storage_error)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn claim_due(
        &self,
        now: i64,
        lease_until: i64,
        limit: usize,
    ) -> DomainResult<Vec<OperationRecord>> {
        let db = Arc::clone(&self.db);

        task::spawn_blocking(move || -> DomainResult<Vec<OperationRecord>> {
            let mut conn = db.get_connection()?;
            claim_due_operations(&mut conn, now, lease_until, limit).map_err(map_storage_error)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn request_cancel(&self, id: &str) -> DomainResult<bool> {
        let db = Arc::clone(&self.db);
        let id = id.to_string();

        task::spawn_blocking(move || -> DomainResult<bool> {
            let conn = db.get_connection()?;
            set_cancel_flag(&conn, &id).map_err(map_storage_error)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn is_cancel_requested(&self, id: &str) -> DomainResult<bool> {
        let db = Arc::clone(&self.db);
        let id = id.to_string();

        task::spawn_blocking(move || -> DomainResult<bool> {
            let conn = db.get_connection()?;
            query_cancel_flag(&conn, &id).map_err(map_storage_error)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn needing_attention(&self) -> DomainResult<Vec<OperationRecord>> {
        let db = Arc::clone(&self.db);

        task::spawn_blocking(move || -> DomainResult<Vec<OperationRecord>> {
            let conn = db.get_connection()?;
            query_needing_attention(&conn).map_err(map_storage_error)
        })
        .await
        .map_err(map_join_error)?
    }
}

// ============================================================================
// SQL Operations (synchronous)
// ============================================================================

fn insert_operation(conn: &SqlCipherConnection, record: &OperationRecord) -> StorageResult<()> {
    conn.execute(
        &format!(
            "INSERT INTO operations ({COLUMNS}) VALUES
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18,
              ?19, ?20, ?21, ?22, ?23, ?24)"
        ),
        params![
            &record.id,
            &record.name,
            record.direction.as_str(),
            record.object_type.as_str(),
            serde_json::to_string(&record.object_ids)?,
            &record.provider_id,
            record.force_update,
            record.unattended,
            record.status.as_str(),
            record.stage.as_str(),
            &record.ack,
            record.backoff_index,
            record.attempts,
            record.restarts,
            serde_json::to_string(&record.warnings)?,
            serde_json::to_string(&record.errors)?,
            serde_json::to_string(&record.missing_ids)?,
            &record.last_failure,
            record.cancel_requested,
            record.needs_attention,
            record.next_run_at,
            record.created_at,
            record.updated_at,
            serde_json::to_string(&record.object_houses)?,
        ],
    )?;
    Ok(())
}

fn update_operation(conn: &SqlCipherConnection, record: &OperationRecord) -> StorageResult<()> {
    let changed = conn.execute(
        "UPDATE operations SET
            status = ?2, stage = ?3, ack = ?4, backoff_index = ?5, attempts = ?6, restarts = ?7,
            warnings = ?8, errors = ?9, missing_ids = ?10, last_failure = ?11,
            needs_attention = ?12, next_run_at = ?13, updated_at = ?14,
            object_ids = ?15, force_update = ?16, unattended = ?17, object_houses = ?18
         WHERE id = ?1",
        params![
            &record.id,
            record.status.as_str(),
            record.stage.as_str(),
            &record.ack,
            record.backoff_index,
            record.attempts,
            record.restarts,
            serde_json::to_string(&record.warnings)?,
            serde_json::to_string(&record.errors)?,
            serde_json::to_string(&record.missing_ids)?,
            &record.last_failure,
            record.needs_attention,
            record.next_run_at,
            record.updated_at,
            serde_json::to_string(&record.object_ids)?,
            record.force_update,
            record.unattended,
            serde_json::to_string(&record.object_houses)?,
        ],
    )?;

    if changed == 0 {
        return Err(StorageError::Query(format!("operation {} does not exist", record.id)));
    }
    Ok(())
}

fn query_operation(conn: &SqlCipherConnection, id: &str) -> StorageResult<Option<OperationRecord>> {
    let sql = format!("SELECT {COLUMNS} FROM operations WHERE id = ?1");

    match conn.query_row(&sql, params![id], map_operation_row) {
        Ok(record) => Ok(Some(record)),
        Err(StorageError::Rusqlite(rusqlite::Error::QueryReturnedNoRows)) => Ok(None),
        Err(err) => Err(err),
    }
}

fn claim_due_operations(
    conn: &mut SqlCipherConnection,
    now: i64,
    lease_until: i64,
    limit: usize,
) -> StorageResult<Vec<OperationRecord>> {
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    // IMMEDIATE takes the write lock up front so two workers cannot select
    // the same rows.
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let mut claimed = {
        let mut stmt = tx.prepare(&format!(
            "SELECT {COLUMNS} FROM operations
             WHERE next_run_at IS NOT NULL AND next_run_at <= ?1
               AND needs_attention = 0 AND status NOT IN {FINAL_STATUSES}
             ORDER BY next_run_at ASC, created_at ASC
             LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![now, limit], map_operation_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
    };

    for record in &mut claimed {
        tx.execute(
            "UPDATE operations SET next_run_at = ?2 WHERE id = ?1",
            params![&record.id, lease_until],
        )?;
        record.next_run_at = Some(lease_until);
    }

    tx.commit()?;
    Ok(claimed)
}

fn set_cancel_flag(conn: &SqlCipherConnection, id: &str) -> StorageResult<bool> {
    let changed =
        conn.execute("UPDATE operations SET cancel_requested = 1 WHERE id = ?1", params![id])?;
    Ok(changed > 0)
}

fn query_cancel_flag(conn: &SqlCipherConnection, id: &str) -> StorageResult<bool> {
    match conn.query_row(
        "SELECT cancel_requested FROM operations WHERE id = ?1",
        params![id],
        |row| row.get(0),
    ) {
        Ok(flag) => Ok(flag),
        Err(StorageError::Rusqlite(rusqlite::Error::QueryReturnedNoRows)) => Ok(false),
        Err(err) => Err(err),
    }
}

fn query_needing_attention(conn: &SqlCipherConnection) -> StorageResult<Vec<OperationRecord>> {
    let sql = format!(
        "SELECT {COLUMNS} FROM operations WHERE needs_attention = 1 ORDER BY updated_at DESC"
    );

    let mut stmt = conn.prepare(&sql)?;
    stmt.query_map(params![], map_operation_row)
}

fn map_operation_row(row: &Row<'_>) -> rusqlite::Result<OperationRecord> {
    let object_type: String = row.get(3)?;

    Ok(OperationRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        direction: parse_column(row, 2)?,
        object_type: ObjectType::from(object_type),
        object_ids: json_column(row, 4)?,
        provider_id: row.get(5)?,
        force_update: row.get(6)?,
        unattended: row.get(7)?,
        status: parse_column(row, 8)?,
        stage: parse_column(row, 9)?,
        ack: row.get(10)?,
        backoff_index: row.get(11)?,
        attempts: row.get(12)?,
        restarts: row.get(13)?,
        warnings: json_column(row, 14)?,
        errors: json_column(row, 15)?,
        missing_ids: json_column(row, 16)?,
        last_failure: row.get(17)?,
        cancel_requested: row.get(18)?,
        needs_attention: row.get(19)?,
        next_run_at: row.get(20)?,
        created_at: row.get(21)?,
        updated_at: row.get(22)?,
        object_houses: json_column(row, 23)?,
    })
}
