//! # Regsync Infrastructure
//!
//! Infrastructure implementations of core ports.
//!
//! This crate contains:
//! - SQLCipher repositories for correlations, the export queue, operations,
//!   object locks and house/provider assignments
//! - The retrying HTTP client and the JSON registry transport
//! - The operation scheduler, operation worker and queue distribution jobs
//! - Configuration loading, tracing setup and sync metrics
//!
//! ## Architecture
//! - Implements traits defined in `regsync-core`
//! - Depends on `regsync-common` and `regsync-domain`
//! - Contains all "impure" code (I/O, timers)

pub mod config;
pub mod database;
pub mod errors;
pub mod http;
pub mod observability;
pub mod registry;
pub mod scheduling;
pub mod sync;

// Re-export commonly used items
pub use database::*;
pub use errors::InfraError;
pub use http::*;
pub use registry::HttpRegistryTransport;
pub use scheduling::{DbOperationScheduler, DistributionJob, DistributionScheduler};
pub use sync::{OperationWorker, OperationWorkerConfig};
