//! Observability infrastructure for metrics and logging
//!
//! - [`logging`]: tracing subscriber installation
//! - [`metrics`]: thread-safe sync counters and batch timings
//!
//! Every record method returns `MetricsResult<()>` and callers log failures
//! through `log_metric` helpers instead of propagating them. All mutex locks
//! recover from poisoning:
//!
//! ```rust
//! use regsync_infra::observability::metrics::SyncMetrics;
//!
//! let metrics = SyncMetrics::new();
//! if let Err(e) = metrics.record_operation_started() {
//!     tracing::warn!("Failed to record metric: {}", e);
//! }
//! ```

pub mod logging;
pub mod metrics;

pub use logging::init_tracing;

/// Metrics error type
///
/// Recording currently always succeeds; the result type leaves room for
/// quotas without breaking callers.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// Empty data set - cannot calculate aggregate metric
    #[error("Empty data: cannot calculate {metric}")]
    EmptyData {
        /// Metric name that failed (e.g., "P95", "average")
        metric: &'static str,
    },

    /// Counter overflowed its storage type
    #[error("Counter overflow for metric '{metric}'")]
    Overflow {
        /// Metric name
        metric: &'static str,
    },
}

/// Result type for metrics operations
pub type MetricsResult<T> = Result<T, MetricsError>;

/// Log a failed metric recording; never propagates.
pub(crate) fn log_metric(result: MetricsResult<()>, metric: &'static str) {
    if let Err(err) = result {
        tracing::warn!(metric = metric, error = ?err, "Failed to record metric");
    }
}
