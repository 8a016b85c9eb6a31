//! Scheduling infrastructure for background execution
//!
//! - Operation scheduling: stamps `next_run_at` on persisted operations
//! - Queue distribution: interval-driven distribution plus a cron purge job
//!
//! Schedulers have explicit start/stop lifecycles, tracked join handles,
//! cancellation tokens and timeouts around every job run.

pub mod distribution_scheduler;
pub mod error;
pub mod operation_scheduler;

pub use distribution_scheduler::{
    DistributionJob, DistributionReport, DistributionScheduler, DistributionSchedulerConfig,
};
pub use error::{SchedulerError, SchedulerResult};
pub use operation_scheduler::DbOperationScheduler;
