//! # Regsync Core
//!
//! Business logic for registry synchronisation - no infrastructure
//! dependencies.
//!
//! This crate contains:
//! - The correlation store (local object to registry identity)
//! - The export scheduling queue
//! - The operation state machine and its ports
//!
//! ## Architecture Principles
//! - Only depends on `regsync-common` and `regsync-domain`
//! - No database, HTTP, or platform code
//! - All external dependencies via traits

pub mod correlation;
pub mod operation;
pub mod queue;

pub use correlation::{CorrelationRepository, CorrelationStore};
pub use operation::{
    ImportSink, ObjectLock, Operation, OperationDeps, OperationKind, OperationRepository,
    OperationScheduler, OperationService, PayloadSource, RegistryTransport, RunOutcome,
    ServiceDescriptor,
};
pub use queue::{ExportQueue, ExportQueueRepository, HouseProviderResolver};

/// Current Unix time in seconds.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
