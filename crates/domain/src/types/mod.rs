//! Domain types and models

pub mod correlation;
pub mod operation;
pub mod queue;
pub mod registry;

pub use correlation::{CorrelationKey, CorrelationRecord, CorrelationStatus, ObjectType};
pub use operation::{
    truncate_reason, OperationDirection, OperationRecord, OperationRequest, OperationStatus, Stage,
};
pub use queue::{Distribution, HouseBuckets, QueueConsumeKey, QueueEntry};
pub use registry::{
    AckToken, FetchOutcome, ItemError, ItemSuccess, PayloadItem, PollState, RegistryPayload,
    RegistryResult, ResultItem,
};
