//! Lifecycle errors of the distribution scheduler and the operation worker.

use regsync_domain::RegSyncError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Scheduler already running")]
    AlreadyRunning,

    #[error("Scheduler not running")]
    NotRunning,

    #[error("Failed to create scheduler: {0}")]
    CreationFailed(String),

    #[error("Failed to start scheduler: {0}")]
    StartFailed(String),

    #[error("Failed to stop scheduler: {0}")]
    StopFailed(String),

    /// Usually an invalid cron expression
    #[error("Failed to register job: {0}")]
    JobRegistrationFailed(String),

    #[error("Operation timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Task join failed: {0}")]
    TaskJoinFailed(String),
}

impl From<SchedulerError> for RegSyncError {
    /// Lifecycle misuse is the caller's fault; a job that cannot be
    /// registered points at its cron expression.
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::AlreadyRunning | SchedulerError::NotRunning => {
                Self::InvalidInput(err.to_string())
            }
            SchedulerError::JobRegistrationFailed(_) => Self::Config(err.to_string()),
            _ => Self::Internal(err.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for SchedulerError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskJoinFailed(err.to_string())
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
