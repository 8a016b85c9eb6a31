//! Operation service - creates, schedules and runs operations

use std::sync::Arc;

use regsync_domain::{
    OperationRecord, OperationRequest, PublicError, RegSyncError, Result,
};
use tracing::{debug, info};

use super::descriptor::ServiceDescriptor;
use super::engine::{Operation, OperationDeps};
use super::outcome::RunOutcome;
use crate::unix_now;

/// Entry point for starting and driving registry operations.
pub struct OperationService {
    descriptor: Arc<ServiceDescriptor>,
    deps: OperationDeps,
}

impl OperationService {
    pub fn new(descriptor: Arc<ServiceDescriptor>, deps: OperationDeps) -> Self {
        Self { descriptor, deps }
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    pub fn deps(&self) -> &OperationDeps {
        &self.deps
    }

    /// Persist a new operation and hand it to the scheduler.
    pub async fn submit(&self, request: OperationRequest) -> Result<OperationRecord> {
        let binding = self.descriptor.resolve(&request.name)?;
        if binding.object_type != request.object_type {
            return Err(RegSyncError::InvalidInput(format!(
                "operation '{}' handles {}, not {}",
                request.name, binding.object_type, request.object_type
            )));
        }
        if request.object_ids.iter().all(|id| id.trim().is_empty()) {
            return Err(RegSyncError::InvalidInput(
                PublicError::NoIdentifier {
                    object_type: request.object_type.clone(),
                    object_id: String::new(),
                }
                .to_string(),
            ));
        }

        let mut record = OperationRecord::new(request, binding.kind.direction(), unix_now());
        self.deps.operations.insert(&record).await?;
        self.deps.scheduler.schedule(&mut record).await?;

        info!(
            operation_id = %record.id,
            operation = %record.name,
            objects = record.object_ids.len(),
            "Operation submitted"
        );
        Ok(record)
    }

    /// Rebuild the runnable operation for a persisted record.
    pub fn build(&self, record: OperationRecord) -> Result<Operation> {
        let binding = self.descriptor.resolve(&record.name)?;
        Ok(Operation::new(record, binding.kind, self.deps.clone()))
    }

    /// Run a persisted record in the current task.
    pub async fn run_now(&self, record: OperationRecord) -> Result<(RunOutcome, OperationRecord)> {
        let mut operation = self.build(record)?;
        let outcome = operation.run().await?;
        debug!(outcome = outcome.label(), "Operation run returned");
        Ok((outcome, operation.into_record()))
    }

    /// Flag an operation for cancellation; it stops before its next stage.
    pub async fn request_cancel(&self, id: &str) -> Result<bool> {
        let flagged = self.deps.operations.request_cancel(id).await?;
        if flagged {
            info!(operation_id = id, "Cancellation requested");
        }
        Ok(flagged)
    }

    pub async fn get(&self, id: &str) -> Result<Option<OperationRecord>> {
        self.deps.operations.get(id).await
    }

    pub async fn needing_attention(&self) -> Result<Vec<OperationRecord>> {
        self.deps.operations.needing_attention().await
    }
}
