//! Database-backed "run later" for operations
//!
//! Scheduling only stamps `next_run_at` on the operation row; the
//! [`crate::sync::OperationWorker`] picks rows up once they are due.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regsync_core::operation::{OperationRepository, OperationScheduler};
use regsync_core::unix_now;
use regsync_domain::{OperationRecord, Result};
use tracing::debug;

/// [`OperationScheduler`] writing due times through the operation repository.
pub struct DbOperationScheduler {
    operations: Arc<dyn OperationRepository>,
    max_attempts: u32,
}

impl DbOperationScheduler {
    /// `max_attempts` bounds the retries after a retryable failure.
    pub fn new(operations: Arc<dyn OperationRepository>, max_attempts: u32) -> Self {
        Self { operations, max_attempts }
    }

    async fn run_at(&self, record: &mut OperationRecord, delay: Duration) -> Result<()> {
        let delay = i64::try_from(delay.as_secs()).unwrap_or(i64::MAX);
        record.next_run_at = Some(unix_now().saturating_add(delay));
        self.operations.save(record).await
    }
}

#[async_trait]
impl OperationScheduler for DbOperationScheduler {
    async fn schedule(&self, record: &mut OperationRecord) -> Result<()> {
        debug!(operation_id = %record.id, "Operation scheduled");
        self.run_at(record, Duration::ZERO).await
    }

    async fn retry(&self, record: &mut OperationRecord, delay: Duration) -> Result<bool> {
        record.attempts += 1;
        if record.attempts > self.max_attempts {
            debug!(
                operation_id = %record.id,
                attempts = record.attempts,
                max_attempts = self.max_attempts,
                "Retry budget exhausted"
            );
            return Ok(false);
        }

        debug!(
            operation_id = %record.id,
            attempts = record.attempts,
            delay_secs = delay.as_secs(),
            "Operation retry scheduled"
        );
        self.run_at(record, delay).await?;
        Ok(true)
    }

    async fn delay_then_resume(&self, record: &mut OperationRecord, delay: Duration) -> Result<()> {
        debug!(
            operation_id = %record.id,
            stage = %record.stage,
            delay_secs = delay.as_secs(),
            "Operation resume scheduled"
        );
        self.run_at(record, delay).await
    }
}
