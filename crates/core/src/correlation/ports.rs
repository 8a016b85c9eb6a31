//! Port interfaces for correlation persistence

use async_trait::async_trait;
use regsync_domain::{CorrelationKey, CorrelationRecord, Result};

/// Durable storage of correlation records.
#[async_trait]
pub trait CorrelationRepository: Send + Sync {
    /// Return the record for `key`, inserting a new one if none exists.
    ///
    /// Must be atomic: concurrent callers for one key observe one record.
    async fn get_or_create(
        &self,
        key: &CorrelationKey,
        house_id: Option<&str>,
        now: i64,
    ) -> Result<CorrelationRecord>;

    /// Look up a record without creating it
    async fn find(&self, key: &CorrelationKey) -> Result<Option<CorrelationRecord>>;

    /// Record currently holding `transport_id`, if any
    async fn find_by_transport_id(&self, transport_id: &str) -> Result<Option<CorrelationRecord>>;

    /// Records tagged with `batch_id`
    async fn find_by_batch(&self, batch_id: &str) -> Result<Vec<CorrelationRecord>>;

    /// Insert or overwrite the record stored under its key
    async fn upsert(&self, record: &CorrelationRecord) -> Result<()>;

    /// Overwrite the stored record only while it still carries
    /// `expected_transport_id`. Returns `false` when it was superseded.
    async fn upsert_if_current(
        &self,
        record: &CorrelationRecord,
        expected_transport_id: &str,
    ) -> Result<bool>;
}
