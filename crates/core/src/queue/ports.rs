//! Port interfaces for the export queue

use std::collections::HashMap;

use async_trait::async_trait;
use regsync_domain::{ObjectType, QueueConsumeKey, QueueEntry, Result};

/// Durable backlog of re-sync signals.
#[async_trait]
pub trait ExportQueueRepository: Send + Sync {
    /// Insert, or refresh type and timestamps of the entry stored under
    /// `(object_id, house_id)`. Refreshing revives a consumed entry.
    async fn upsert(&self, entry: &QueueEntry) -> Result<()>;

    async fn find(&self, object_id: &str, house_id: &str) -> Result<Option<QueueEntry>>;

    /// Unconsumed entries of `types` with `eligible_at <= now`, oldest first.
    async fn eligible(&self, types: &[ObjectType], now: i64) -> Result<Vec<QueueEntry>>;

    /// Delete entries whose `enqueued_at` still matches the key.
    async fn delete_consumed(&self, keys: &[QueueConsumeKey]) -> Result<usize>;

    /// Flag entries whose `enqueued_at` still matches the key as consumed.
    async fn mark_consumed(&self, keys: &[QueueConsumeKey], consumed_at: i64) -> Result<usize>;

    /// Delete entries consumed before `older_than`.
    async fn purge_consumed(&self, older_than: i64) -> Result<usize>;
}

/// Resolves which providers manage which houses.
#[async_trait]
pub trait HouseProviderResolver: Send + Sync {
    /// `provider_id -> [house_id, ...]`; houses without a provider are absent.
    async fn resolve_providers_for_houses(
        &self,
        house_ids: &[String],
    ) -> Result<HashMap<String, Vec<String>>>;
}
