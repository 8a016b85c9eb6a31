//! Background execution of registry operations
//!
//! - OperationWorker: claims due operations and runs them
//!
//! Lifecycles are explicit (start/stop) with tracked join handles and
//! cancellation support.

pub mod operation_worker;

pub use operation_worker::{BatchReport, OperationWorker, OperationWorkerConfig};
