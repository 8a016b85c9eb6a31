//! Export queue repository
//!
//! `(object_id, house_id)` is unique; re-enqueueing refreshes the row in
//! place and clears `consumed_at`. Consumption is keyed on `enqueued_at` so
//! an entry refreshed while a distribution pass ran survives it.

use std::sync::Arc;

use async_trait::async_trait;
use regsync_common::storage::{SqlCipherConnection, StorageError, StorageResult};
use regsync_core::queue::ExportQueueRepository;
use regsync_domain::{ObjectType, QueueConsumeKey, QueueEntry, Result as DomainResult};
use rusqlite::{params, Row, ToSql};
use tokio::task;

use super::manager::DbManager;
use crate::errors::{map_join_error, map_storage_error};

/// SqlCipher-based export queue repository
pub struct SqlCipherExportQueueRepository {
    db: Arc<DbManager>,
}

impl SqlCipherExportQueueRepository {
    pub fn new(db: Arc<DbManager>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ExportQueueRepository for SqlCipherExportQueueRepository {
    async fn upsert(&self, entry: &QueueEntry) -> DomainResult<()> {
        let db = Arc::clone(&self.db);
        let entry = entry.clone();

        task::spawn_blocking(move || -> DomainResult<()> {
            let conn = db.get_connection()?;
            upsert_entry(&conn, &entry).map_err(map_storage_error)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn find(&self, object_id: &str, house_id: &str) -> DomainResult<Option<QueueEntry>> {
        let db = Arc::clone(&self.db);
        let object_id = object_id.to_string();
        let house_id = house_id.to_string();

        task::spawn_blocking(move || -> DomainResult<Option<QueueEntry>> {
            let conn = db.get_connection()?;
            query_entry(&conn, &object_id, &house_id).map_err(map_storage_error)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn eligible(&self, types: &[ObjectType], now: i64) -> DomainResult<Vec<QueueEntry>> {
        if types.is_empty() {
            return Ok(Vec::new());
        }
        let db = Arc::clone(&self.db);
        let types: Vec<String> = types.iter().map(|t| t.as_str().to_string()).collect();

        task::spawn_blocking(move || -> DomainResult<Vec<QueueEntry>> {
            let conn = db.get_connection()?;
            query_eligible(&conn, &types, now).map_err(map_storage_error)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn delete_consumed(&self, keys: &[QueueConsumeKey]) -> DomainResult<usize> {
        let db = Arc::clone(&self.db);
        let keys = keys.to_vec();

        task::spawn_blocking(move || -> DomainResult<usize> {
            let mut conn = db.get_connection()?;
            delete_entries(&mut conn, &keys).map_err(map_storage_error)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn mark_consumed(
        &self,
        keys: &[QueueConsumeKey],
        consumed_at: i64,
    ) -> DomainResult<usize> {
        let db = Arc::clone(&self.db);
        let keys = keys.to_vec();

        task::spawn_blocking(move || -> DomainResult<usize> {
            let mut conn = db.get_connection()?;
            mark_entries_consumed(&mut conn, &keys, consumed_at).map_err(map_storage_error)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn purge_consumed(&self, older_than: i64) -> DomainResult<usize> {
        let db = Arc::clone(&self.db);

        task::spawn_blocking(move || -> DomainResult<usize> {
            let conn = db.get_connection()?;
            delete_consumed_before(&conn, older_than).map_err(map_storage_error)
        })
        .await
        .map_err(map_join_error)?
    }
}

// ============================================================================
// SQL Operations (synchronous)
// ============================================================================

fn upsert_entry(conn: &SqlCipherConnection, entry: &QueueEntry) -> StorageResult<()> {
    conn.execute(
        "INSERT INTO export_queue (object_type, object_id, house_id, enqueued_at, eligible_at, consumed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, NULL)
         ON CONFLICT (object_id, house_id) DO UPDATE SET
            object_type = excluded.object_type,
            enqueued_at = excluded.enqueued_at,
            eligible_at = excluded.eligible_at,
            consumed_at = NULL",
        params![
            entry.object_type.as_str(),
            &entry.object_id,
            &entry.house_id,
            entry.enqueued_at,
            entry.eligible_at,
        ],
    )?;
    Ok(())
}

fn query_entry(
    conn: &SqlCipherConnection,
    object_id: &str,
    house_id: &str,
) -> StorageResult<Option<QueueEntry>> {
    let sql = "SELECT object_type, object_id, house_id, enqueued_at, eligible_at, consumed_at
               FROM export_queue WHERE object_id = ?1 AND house_id = ?2";

    match conn.query_row(sql, params![object_id, house_id], map_queue_row) {
        Ok(entry) => Ok(Some(entry)),
        Err(StorageError::Rusqlite(rusqlite::Error::QueryReturnedNoRows)) => Ok(None),
        Err(err) => Err(err),
    }
}

fn query_eligible(
    conn: &SqlCipherConnection,
    types: &[String],
    now: i64,
) -> StorageResult<Vec<QueueEntry>> {
    let placeholders: Vec<String> = (0..types.len()).map(|i| format!("?{}", i + 2)).collect();
    let sql = format!(
        "SELECT object_type, object_id, house_id, enqueued_at, eligible_at, consumed_at
         FROM export_queue
         WHERE consumed_at IS NULL AND eligible_at <= ?1 AND object_type IN ({})
         ORDER BY enqueued_at ASC, object_id ASC",
        placeholders.join(", ")
    );

    let mut values: Vec<&dyn ToSql> = Vec::with_capacity(types.len() + 1);
    values.push(&now);
    values.extend(types.iter().map(|t| t as &dyn ToSql));

    let mut stmt = conn.prepare(&sql)?;
    stmt.query_map(&values, map_queue_row)
}

fn delete_entries(
    conn: &mut SqlCipherConnection,
    keys: &[QueueConsumeKey],
) -> StorageResult<usize> {
    let tx = conn.transaction()?;
    let mut removed = 0;
    for key in keys {
        removed += tx.execute(
            "DELETE FROM export_queue WHERE object_id = ?1 AND house_id = ?2 AND enqueued_at = ?3",
            params![&key.object_id, &key.house_id, key.enqueued_at],
        )?;
    }
    tx.commit()?;
    Ok(removed)
}

fn mark_entries_consumed(
    conn: &mut SqlCipherConnection,
    keys: &[QueueConsumeKey],
    consumed_at: i64,
) -> StorageResult<usize> {
    let tx = conn.transaction()?;
    let mut marked = 0;
    for key in keys {
        marked += tx.execute(
            "UPDATE export_queue SET consumed_at = ?4
             WHERE object_id = ?1 AND house_id = ?2 AND enqueued_at = ?3",
            params![&key.object_id, &key.house_id, key.enqueued_at, consumed_at],
        )?;
    }
    tx.commit()?;
    Ok(marked)
}

fn delete_consumed_before(conn: &SqlCipherConnection, older_than: i64) -> StorageResult<usize> {
    let deleted = conn.execute(
        "DELETE FROM export_queue WHERE consumed_at IS NOT NULL AND consumed_at <= ?1",
        params![older_than],
    )?;
    Ok(deleted)
}

fn map_queue_row(row: &Row<'_>) -> rusqlite::Result<QueueEntry> {
    let object_type: String = row.get(0)?;

    Ok(QueueEntry {
        object_type: ObjectType::from(object_type),
        object_id: row.get(1)?,
        house_id: row.get(2)?,
        enqueued_at: row.get(3)?,
        eligible_at: row.get(4)?,
        consumed_at: row.get(5)?,
    })
}
