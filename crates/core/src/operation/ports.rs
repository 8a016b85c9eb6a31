//! Port interfaces for the operation state machine

use std::time::Duration;

use async_trait::async_trait;
use regsync_domain::{
    AckToken, CorrelationRecord, FetchOutcome, ItemSuccess, ObjectType, OperationRecord, PollState,
    RegistryError, RegistryPayload, Result,
};

/// Asynchronous registry endpoint.
#[async_trait]
pub trait RegistryTransport: Send + Sync {
    /// Submit a request; the registry answers with an acknowledgment only.
    async fn submit(
        &self,
        operation: &str,
        payload: &RegistryPayload,
    ) -> std::result::Result<AckToken, RegistryError>;

    /// Processing state of an acknowledged request.
    async fn poll(&self, ack: &AckToken) -> std::result::Result<PollState, RegistryError>;

    /// Result of a request that reached [`PollState::Successful`].
    async fn fetch_result(
        &self,
        ack: &AckToken,
    ) -> std::result::Result<FetchOutcome, RegistryError>;
}

/// Persistence of operation records.
#[async_trait]
pub trait OperationRepository: Send + Sync {
    async fn insert(&self, record: &OperationRecord) -> Result<()>;

    /// Overwrite everything except the cancel flag.
    async fn save(&self, record: &OperationRecord) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<OperationRecord>>;

    /// Take up to `limit` operations due at `now`, leasing them until
    /// `lease_until` so a crashed worker's claim expires.
    async fn claim_due(
        &self,
        now: i64,
        lease_until: i64,
        limit: usize,
    ) -> Result<Vec<OperationRecord>>;

    /// Set the external cancel flag. Returns `false` for unknown ids.
    async fn request_cancel(&self, id: &str) -> Result<bool>;

    async fn is_cancel_requested(&self, id: &str) -> Result<bool>;

    /// Operations that exhausted their retries or failed fatally.
    async fn needing_attention(&self) -> Result<Vec<OperationRecord>>;
}

/// "Run later, retry on failure" capability.
#[async_trait]
pub trait OperationScheduler: Send + Sync {
    /// Run as soon as a worker is free.
    async fn schedule(&self, record: &mut OperationRecord) -> Result<()>;

    /// Bounded retry after a failure. Returns `false` once attempts are
    /// exhausted; the operation is then flagged as needing attention.
    async fn retry(&self, record: &mut OperationRecord, delay: Duration) -> Result<bool>;

    /// Resume at the persisted stage after `delay`.
    async fn delay_then_resume(&self, record: &mut OperationRecord, delay: Duration)
        -> Result<()>;
}

/// Short-lived object-scoped locks.
#[async_trait]
pub trait ObjectLock: Send + Sync {
    /// Take every key or none. Re-entrant for the same owner; expired locks
    /// held by others are taken over.
    async fn try_acquire(&self, keys: &[String], owner: &str, ttl: Duration) -> Result<bool>;

    async fn release(&self, keys: &[String], owner: &str) -> Result<()>;
}

/// Business data for payload building.
#[async_trait]
pub trait PayloadSource: Send + Sync {
    /// Serializable body of a local object, `None` when it does not exist.
    async fn load_object(
        &self,
        object_type: &ObjectType,
        object_id: &str,
    ) -> Result<Option<serde_json::Value>>;

    /// Provider-level reference data attached to every request.
    async fn provider_context(&self, provider_id: &str) -> Result<serde_json::Value>;
}

/// Receives imported registry data.
#[async_trait]
pub trait ImportSink: Send + Sync {
    /// Persist the denormalized fields of one imported item.
    async fn store_item(
        &self,
        record: &CorrelationRecord,
        item: &ItemSuccess,
        group_id: Option<&str>,
    ) -> Result<()>;

    /// Best-effort follow-up import for objects the registry did not know.
    /// Returns `false` when no such import exists.
    async fn import_missing(
        &self,
        _object_type: &ObjectType,
        _object_ids: &[String],
    ) -> Result<bool> {
        Ok(false)
    }
}
