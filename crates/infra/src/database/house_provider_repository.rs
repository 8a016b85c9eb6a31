//! House → provider assignments backing queue distribution.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use regsync_common::storage::{SqlCipherConnection, StorageResult};
use regsync_core::queue::HouseProviderResolver;
use regsync_domain::Result as DomainResult;
use rusqlite::{params, ToSql};
use tokio::task;

use super::manager::DbManager;
use crate::errors::{map_join_error, map_storage_error};

/// SqlCipher-based house/provider table
pub struct SqlCipherHouseProviderRepository {
    db: Arc<DbManager>,
}

impl SqlCipherHouseProviderRepository {
    pub fn new(db: Arc<DbManager>) -> Self {
        Self { db }
    }

    /// Record that `provider_id` manages `house_id`.
    pub async fn assign(&self, house_id: &str, provider_id: &str) -> DomainResult<()> {
        let db = Arc::clone(&self.db);
        let house_id = house_id.to_string();
        let provider_id = provider_id.to_string();

        task::spawn_blocking(move || -> DomainResult<()> {
            let conn = db.get_connection()?;
            insert_assignment(&conn, &house_id, &provider_id).map_err(map_storage_error)
        })
        .await
        .map_err(map_join_error)?
    }

    pub async fn unassign(&self, house_id: &str, provider_id: &str) -> DomainResult<bool> {
        let db = Arc::clone(&self.db);
        let house_id = house_id.to_string();
        let provider_id = provider_id.to_string();

        task::spawn_blocking(move || -> DomainResult<bool> {
            let conn = db.get_connection()?;
            delete_assignment(&conn, &house_id, &provider_id).map_err(map_storage_error)
        })
        .await
        .map_err(map_join_error)?
    }
}

#[async_trait]
impl HouseProviderResolver for SqlCipherHouseProviderRepository {
    async fn resolve_providers_for_houses(
        &self,
        house_ids: &[String],
    ) -> DomainResult<HashMap<String, Vec<String>>> {
        if house_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let db = Arc::clone(&self.db);
        let house_ids = house_ids.to_vec();

        task::spawn_blocking(move || -> DomainResult<HashMap<String, Vec<String>>> {
            let conn = db.get_connection()?;
            query_providers(&conn, &house_ids).map_err(map_storage_error)
        })
        .await
        .map_err(map_join_error)?
    }
}

// ============================================================================
// SQL Operations (synchronous)
// ============================================================================

fn insert_assignment(
    conn: &SqlCipherConnection,
    house_id: &str,
    provider_id: &str,
) -> StorageResult<()> {
    conn.execute(
        "INSERT OR IGNORE INTO house_providers (house_id, provider_id) VALUES (?1, ?2)",
        params![house_id, provider_id],
    )?;
    Ok(())
}

fn delete_assignment(
    conn: &SqlCipherConnection,
    house_id: &str,
    provider_id: &str,
) -> StorageResult<bool> {
    let deleted = conn.execute(
        "DELETE FROM house_providers WHERE house_id = ?1 AND provider_id = ?2",
        params![house_id, provider_id],
    )?;
    Ok(deleted > 0)
}

fn query_providers(
    conn: &SqlCipherConnection,
    house_ids: &[String],
) -> StorageResult<HashMap<String, Vec<String>>> {
    let placeholders: Vec<String> = (1..=house_ids.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "SELECT provider_id, house_id FROM house_providers
         WHERE house_id IN ({}) ORDER BY provider_id, house_id",
        placeholders.join(", ")
    );
    let values: Vec<&dyn ToSql> = house_ids.iter().map(|h| h as &dyn ToSql).collect();

    let mut stmt = conn.prepare(&sql)?;
    let rows: Vec<(String, String)> =
        stmt.query_map(&values, |row| Ok((row.get(0)?, row.get(1)?)))?;

    let mut providers: HashMap<String, Vec<String>> = HashMap::new();
    for (provider_id, house_id) in rows {
        providers.entry(provider_id).or_default().push(house_id);
    }
    Ok(providers)
}
