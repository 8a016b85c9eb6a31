//! Correlation store service - race-safe record transitions

use std::collections::HashMap;
use std::sync::Arc;

use regsync_domain::{CorrelationKey, CorrelationRecord, ObjectType, Result};
use tracing::{debug, warn};
use uuid::Uuid;

use super::ports::CorrelationRepository;
use crate::unix_now;

/// Maps local objects to registry identities.
///
/// Every mutator applies a [`CorrelationRecord`] transition and writes the
/// result through the repository before returning. Writes tied to a
/// submission are conditional on the record still carrying that
/// submission's transport id, so results for superseded submissions never
/// change state.
pub struct CorrelationStore {
    repository: Arc<dyn CorrelationRepository>,
}

impl CorrelationStore {
    pub fn new(repository: Arc<dyn CorrelationRepository>) -> Self {
        Self { repository }
    }

    /// Fresh transport correlation id.
    pub fn new_transport_id() -> String {
        Uuid::now_v7().to_string()
    }

    /// `provider_id` is ignored for types that are not provider-scoped.
    pub async fn get_or_create(
        &self,
        object_type: ObjectType,
        object_id: &str,
        provider_id: Option<&str>,
    ) -> Result<CorrelationRecord> {
        let key = CorrelationKey::scoped(object_type, object_id, provider_id);
        self.get_or_create_in_house(&key, None).await
    }

    /// Like [`Self::get_or_create`], recording the owning house on creation.
    pub async fn get_or_create_in_house(
        &self,
        key: &CorrelationKey,
        house_id: Option<&str>,
    ) -> Result<CorrelationRecord> {
        self.repository.get_or_create(key, house_id, unix_now()).await
    }

    pub async fn find(&self, key: &CorrelationKey) -> Result<Option<CorrelationRecord>> {
        self.repository.find(key).await
    }

    pub async fn find_by_transport_id(
        &self,
        transport_id: &str,
    ) -> Result<Option<CorrelationRecord>> {
        self.repository.find_by_transport_id(transport_id).await
    }

    /// Records of `batch_id` keyed by their live transport id.
    ///
    /// Records resubmitted under another batch, or already resolved, are not
    /// included. An unknown batch yields an empty map.
    pub async fn assemble(&self, batch_id: &str) -> Result<HashMap<String, CorrelationRecord>> {
        let records = self.repository.find_by_batch(batch_id).await?;
        let assembled: HashMap<_, _> = records
            .into_iter()
            .filter(|record| record.batch_id.as_deref() == Some(batch_id))
            .filter_map(|record| record.transport_id.clone().map(|tid| (tid, record)))
            .collect();

        debug!(batch_id, count = assembled.len(), "Assembled correlation batch");
        Ok(assembled)
    }

    /// Tag the record with a new submission. Any previous transport id is
    /// superseded.
    pub async fn mark_submitted(
        &self,
        record: &mut CorrelationRecord,
        batch_id: &str,
        transport_id: &str,
    ) -> Result<()> {
        record.submit(batch_id, transport_id, unix_now());
        self.repository.upsert(record).await
    }

    /// Store the registry identity. Returns `false` (and leaves `record`
    /// untouched) when the submission was superseded.
    pub async fn mark_saved(
        &self,
        record: &mut CorrelationRecord,
        external_id: Option<String>,
        code: Option<String>,
        saved_at: i64,
    ) -> Result<bool> {
        let mut updated = record.clone();
        updated.save(external_id, code, saved_at, unix_now());
        self.write_guarded(record, updated).await
    }

    /// Record a failure; the external identity is kept.
    pub async fn mark_error(&self, record: &mut CorrelationRecord, message: &str) -> Result<bool> {
        let mut updated = record.clone();
        updated.fail(message, unix_now());
        self.write_guarded(record, updated).await
    }

    /// Drop the transport id so the record is not picked up by `assemble`.
    pub async fn unmap(&self, record: &mut CorrelationRecord) -> Result<()> {
        record.unmap(unix_now());
        self.repository.upsert(record).await
    }

    /// Sever the link to the registry object.
    pub async fn reset(&self, record: &mut CorrelationRecord) -> Result<()> {
        record.reset(unix_now());
        self.repository.upsert(record).await
    }

    /// The submission's outcome will never be processed.
    pub async fn abandon(&self, record: &mut CorrelationRecord) -> Result<bool> {
        let mut updated = record.clone();
        updated.abandon(unix_now());
        self.write_guarded(record, updated).await
    }

    /// Flag a saved object as modified locally.
    pub async fn mark_changed(&self, key: &CorrelationKey) -> Result<Option<CorrelationRecord>> {
        let Some(mut record) = self.repository.find(key).await? else {
            return Ok(None);
        };
        record.touch(unix_now());
        self.repository.upsert(&record).await?;
        Ok(Some(record))
    }

    /// Soft-delete: the record stays, flagged so the next export sends a
    /// removal.
    pub async fn mark_deleted(&self, key: &CorrelationKey) -> Result<CorrelationRecord> {
        let mut record = self.get_or_create_in_house(key, None).await?;
        record.deleted = true;
        record.touch(unix_now());
        self.repository.upsert(&record).await?;
        Ok(record)
    }

    async fn write_guarded(
        &self,
        record: &mut CorrelationRecord,
        updated: CorrelationRecord,
    ) -> Result<bool> {
        let written = match record.transport_id.as_deref() {
            Some(expected) => self.repository.upsert_if_current(&updated, expected).await?,
            None => {
                self.repository.upsert(&updated).await?;
                true
            }
        };

        if written {
            *record = updated;
        } else {
            warn!(
                key = %record.key(),
                transport_id = ?record.transport_id,
                "Ignoring update for superseded submission"
            );
        }
        Ok(written)
    }
}
