//! Stage and run outcomes.

use std::time::Duration;

use regsync_domain::{ControlSignal, OperationStatus, Stage};

/// Result of a single pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Next(Stage),
    /// Wait, then resume at STATE.
    Suspend(Duration),
    Finish(OperationStatus),
    Signal(ControlSignal),
}

/// Result of [`super::Operation::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Reached a terminal status.
    Finished(OperationStatus),
    /// Polling will resume after `resume_after`.
    Suspended { resume_after: Duration },
    /// Pending or restarted; runs again after `retry_after`.
    Deferred { retry_after: Duration },
    /// Failed; `retryable` tells whether a retry was scheduled.
    Failed { retryable: bool },
}

impl RunOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Finished(_) => "finished",
            Self::Suspended { .. } => "suspended",
            Self::Deferred { .. } => "deferred",
            Self::Failed { .. } => "failed",
        }
    }
}
