//! Registry operations: the staged request/response state machine

pub mod backoff;
pub mod cache;
pub mod descriptor;
pub mod engine;
pub mod kinds;
pub mod outcome;
pub mod ports;
pub mod service;

pub use descriptor::{OperationBinding, ServiceDescriptor};
pub use engine::{Operation, OperationDeps};
pub use kinds::{OperationKind, SuccessItem};
pub use outcome::{RunOutcome, StageOutcome};
pub use ports::{
    ImportSink, ObjectLock, OperationRepository, OperationScheduler, PayloadSource,
    RegistryTransport,
};
pub use service::OperationService;
