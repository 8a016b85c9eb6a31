//! Operation lifecycle records.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::correlation::ObjectType;
use crate::constants::MAX_REASON_LENGTH;
use crate::errors::{RegSyncError, Result};
use crate::impl_domain_status_conversions;

/// Whether an operation pushes to or pulls from the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationDirection {
    Export,
    Import,
}

impl_domain_status_conversions!(OperationDirection {
    Export => "export",
    Import => "import",
});

/// Lifecycle status of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Created,
    Prepared,
    RequestBuilt,
    Executing,
    ProcessingResult,
    Done,
    Warning,
    Error,
    Pending,
    Canceled,
}

impl_domain_status_conversions!(OperationStatus {
    Created => "created",
    Prepared => "prepared",
    RequestBuilt => "request_built",
    Executing => "executing",
    ProcessingResult => "processing_result",
    Done => "done",
    Warning => "warning",
    Error => "error",
    Pending => "pending",
    Canceled => "canceled",
});

impl OperationStatus {
    /// No further stage runs without an explicit restart.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Warning | Self::Error | Self::Canceled)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Created | Self::Pending => 0,
            Self::Prepared => 1,
            Self::RequestBuilt => 2,
            Self::Executing => 3,
            Self::ProcessingResult => 4,
            Self::Done | Self::Warning | Self::Error | Self::Canceled => 5,
        }
    }

    /// Forward-only transitions. `pending` and `canceled` are reachable from
    /// any live status; a pending operation resumes from scratch.
    pub fn can_transition_to(self, next: Self) -> bool {
        if self == next {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        match next {
            Self::Pending | Self::Canceled | Self::Error => true,
            _ if self == Self::Pending => true,
            _ => next.rank() >= self.rank(),
        }
    }
}

/// Pipeline stage an operation is in (or resumes at).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Init,
    Load,
    Prepare,
    Request,
    Ack,
    State,
    Parse,
    Store,
    Conclude,
}

impl_domain_status_conversions!(Stage {
    Init => "init",
    Load => "load",
    Prepare => "prepare",
    Request => "request",
    Ack => "ack",
    State => "state",
    Parse => "parse",
    Store => "store",
    Conclude => "conclude",
});

/// What a caller asks for when starting an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRequest {
    /// Name registered in the service descriptor.
    pub name: String,
    pub object_type: ObjectType,
    pub object_ids: Vec<String>,
    pub provider_id: Option<String>,
    /// Owning house per object id, when the caller knows it.
    #[serde(default)]
    pub object_houses: BTreeMap<String, String>,
    /// Resubmit objects that already carry a registry identity.
    pub force_update: bool,
    /// Started by a scheduled job rather than a person.
    pub unattended: bool,
}

impl OperationRequest {
    pub fn new(name: impl Into<String>, object_type: ObjectType, object_ids: Vec<String>) -> Self {
        Self {
            name: name.into(),
            object_type,
            object_ids,
            provider_id: None,
            object_houses: BTreeMap::new(),
            force_update: false,
            unattended: false,
        }
    }

    pub fn for_provider(mut self, provider_id: impl Into<String>) -> Self {
        self.provider_id = Some(provider_id.into());
        self
    }

    /// Build a request from `object id -> house id` pairs.
    pub fn in_houses(
        name: impl Into<String>,
        object_type: ObjectType,
        object_houses: BTreeMap<String, String>,
    ) -> Self {
        let object_ids = object_houses.keys().cloned().collect();
        Self { object_houses, ..Self::new(name, object_type, object_ids) }
    }

    pub fn forced(mut self) -> Self {
        self.force_update = true;
        self
    }

    pub fn unattended(mut self) -> Self {
        self.unattended = true;
        self
    }
}

/// Persisted per-cycle state of one operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub id: String,
    pub name: String,
    pub direction: OperationDirection,
    pub object_type: ObjectType,
    pub object_ids: Vec<String>,
    pub provider_id: Option<String>,
    pub object_houses: BTreeMap<String, String>,
    pub force_update: bool,
    pub unattended: bool,
    pub status: OperationStatus,
    pub stage: Stage,
    pub ack: Option<String>,
    pub backoff_index: u32,
    pub attempts: u32,
    pub restarts: u32,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub missing_ids: Vec<String>,
    /// Reason of the last operation-level failure.
    pub last_failure: Option<String>,
    pub cancel_requested: bool,
    pub needs_attention: bool,
    pub next_run_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl OperationRecord {
    pub fn new(request: OperationRequest, direction: OperationDirection, now: i64) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            name: request.name,
            direction,
            object_type: request.object_type,
            object_ids: request.object_ids,
            provider_id: request.provider_id,
            object_houses: request.object_houses,
            force_update: request.force_update,
            unattended: request.unattended,
            status: OperationStatus::Created,
            stage: Stage::Init,
            ack: None,
            backoff_index: 0,
            attempts: 0,
            restarts: 0,
            warnings: Vec::new(),
            errors: Vec::new(),
            missing_ids: Vec::new(),
            last_failure: None,
            cancel_requested: false,
            needs_attention: false,
            next_run_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Objects with a registry identity are resubmitted.
    pub fn is_updating(&self) -> bool {
        self.force_update || self.unattended
    }

    /// House owning `object_id`. A house owns itself.
    pub fn house_of<'a>(&'a self, object_id: &'a str) -> Option<&'a str> {
        if self.object_type.is_house_level() {
            return Some(object_id);
        }
        self.object_houses.get(object_id).map(String::as_str)
    }

    /// Correlation batch id; stable across retries of the same operation.
    pub fn batch_id(&self) -> &str {
        &self.id
    }

    pub fn transition(&mut self, next: OperationStatus, now: i64) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(RegSyncError::InvalidInput(format!(
                "operation {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Discard progress and start over from INIT.
    pub fn restart(&mut self, now: i64) -> Result<()> {
        if self.status == OperationStatus::Canceled {
            return Err(RegSyncError::InvalidInput(format!(
                "operation {} is canceled and cannot restart",
                self.id
            )));
        }
        self.status = OperationStatus::Created;
        self.stage = Stage::Init;
        self.ack = None;
        self.backoff_index = 0;
        self.restarts += 1;
        self.updated_at = now;
        Ok(())
    }

    /// Reopen a failed operation for a scheduled retry. Polling resumes when
    /// the registry already acknowledged the request.
    pub fn reopen(&mut self, now: i64) -> Result<()> {
        if self.status != OperationStatus::Error {
            return Err(RegSyncError::InvalidInput(format!(
                "operation {} is {} and cannot be reopened",
                self.id, self.status
            )));
        }
        self.status =
            if self.ack.is_some() { OperationStatus::Executing } else { OperationStatus::Created };
        self.updated_at = now;
        Ok(())
    }

    pub fn push_warning(&mut self, message: impl Into<String>) {
        self.warnings.push(truncate_reason(&message.into()));
    }

    pub fn push_error(&mut self, message: impl Into<String>) {
        self.errors.push(truncate_reason(&message.into()));
    }

    /// Forget item-level findings before a fresh pass.
    pub fn clear_findings(&mut self) {
        self.warnings.clear();
        self.errors.clear();
        self.missing_ids.clear();
    }

    /// Status earned by a run that reached CONCLUDE.
    pub fn concluded_status(&self) -> OperationStatus {
        if self.warnings.is_empty() && self.errors.is_empty() && self.missing_ids.is_empty() {
            OperationStatus::Done
        } else {
            OperationStatus::Warning
        }
    }
}

/// Cut a reason to [`MAX_REASON_LENGTH`] characters.
pub fn truncate_reason(reason: &str) -> String {
    if reason.chars().count() <= MAX_REASON_LENGTH {
        return reason.to_string();
    }
    let mut cut: String = reason.chars().take(MAX_REASON_LENGTH - 3).collect();
    cut.push_str("...");
    cut
}
