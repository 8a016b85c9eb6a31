//! Metrics collection modules
//!
//! Thread-safe metrics for the sync subsystems.

pub mod sync;

pub use sync::{SyncMetrics, SyncStats};
