//! Counters for the operation worker and queue distribution
//!
//! ## Design
//! - **Atomic counters** with SeqCst ordering so snapshots are consistent
//! - **VecDeque ring buffer** (max 1000) of batch durations for percentiles
//! - **Poison-safe locking** with explicit match (no .expect())

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use regsync_core::RunOutcome;

use crate::observability::{MetricsError, MetricsResult};

const MAX_BATCH_SAMPLES: usize = 1000;

/// Point-in-time copy of [`SyncMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub operations_started: u64,
    pub operations_completed: u64,
    pub operations_failed: u64,
    pub operations_deferred: u64,
    /// Suspensions while the registry was still processing.
    pub polls: u64,
    pub items_warned: u64,
    pub items_failed: u64,
    pub entries_distributed: u64,
    pub operations_distributed: u64,
    pub batch_errors: u64,
    pub batch_timeouts: u64,
}

/// Thread-safe sync counters shared by the worker and the schedulers.
#[derive(Debug)]
pub struct SyncMetrics {
    operations_started: AtomicU64,
    operations_completed: AtomicU64,
    operations_failed: AtomicU64,
    operations_deferred: AtomicU64,
    polls: AtomicU64,
    items_warned: AtomicU64,
    items_failed: AtomicU64,
    entries_distributed: AtomicU64,
    operations_distributed: AtomicU64,
    batch_errors: AtomicU64,
    batch_timeouts: AtomicU64,
    batch_times: Mutex<VecDeque<u64>>,
}

impl Default for SyncMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self {
            operations_started: AtomicU64::new(0),
            operations_completed: AtomicU64::new(0),
            operations_failed: AtomicU64::new(0),
            operations_deferred: AtomicU64::new(0),
            polls: AtomicU64::new(0),
            items_warned: AtomicU64::new(0),
            items_failed: AtomicU64::new(0),
            entries_distributed: AtomicU64::new(0),
            operations_distributed: AtomicU64::new(0),
            batch_errors: AtomicU64::new(0),
            batch_timeouts: AtomicU64::new(0),
            batch_times: Mutex::new(VecDeque::with_capacity(MAX_BATCH_SAMPLES)),
        }
    }

    pub fn record_operation_started(&self) -> MetricsResult<()> {
        self.operations_started.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Count one run by how it ended.
    pub fn record_outcome(&self, outcome: &RunOutcome) -> MetricsResult<()> {
        let counter = match outcome {
            RunOutcome::Finished(_) => &self.operations_completed,
            RunOutcome::Failed { .. } => &self.operations_failed,
            RunOutcome::Suspended { .. } => &self.polls,
            RunOutcome::Deferred { .. } => &self.operations_deferred,
        };
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Item-level warnings and errors of a finished run.
    pub fn record_items(&self, warned: usize, failed: usize) -> MetricsResult<()> {
        self.items_warned.fetch_add(to_u64(warned, "items_warned")?, Ordering::SeqCst);
        self.items_failed.fetch_add(to_u64(failed, "items_failed")?, Ordering::SeqCst);
        Ok(())
    }

    pub fn record_distribution(&self, entries: usize, operations: usize) -> MetricsResult<()> {
        let entries = to_u64(entries, "entries_distributed")?;
        self.entries_distributed.fetch_add(entries, Ordering::SeqCst);
        self.operations_distributed
            .fetch_add(to_u64(operations, "operations_distributed")?, Ordering::SeqCst);
        Ok(())
    }

    pub fn record_batch_error(&self) -> MetricsResult<()> {
        self.batch_errors.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub fn record_batch_timeout(&self) -> MetricsResult<()> {
        self.batch_timeouts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Keeps the last 1000 samples.
    pub fn record_batch_time(&self, duration: Duration) -> MetricsResult<()> {
        let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);

        let mut times = match self.batch_times.lock() {
            Ok(guard) => guard,
            Err(poison_err) => {
                tracing::warn!(
                    metric = "SyncMetrics::batch_times",
                    "Mutex poisoned during batch_time recording, recovering data"
                );
                poison_err.into_inner()
            }
        };

        times.push_back(ms);
        if times.len() > MAX_BATCH_SAMPLES {
            times.pop_front();
        }
        Ok(())
    }

    /// Returns `MetricsError::EmptyData` if no batch was timed yet.
    pub fn p95_batch_time_ms(&self) -> MetricsResult<u64> {
        let times = match self.batch_times.lock() {
            Ok(guard) => guard,
            Err(poison_err) => {
                tracing::warn!(
                    metric = "SyncMetrics::batch_times",
                    "Mutex poisoned during percentile read, recovering"
                );
                poison_err.into_inner()
            }
        };

        if times.is_empty() {
            return Err(MetricsError::EmptyData { metric: "P95" });
        }

        let mut sorted: Vec<u64> = times.iter().copied().collect();
        sorted.sort_unstable();
        let index = (sorted.len() * 95 / 100).min(sorted.len() - 1);
        Ok(sorted[index])
    }

    pub fn snapshot(&self) -> SyncStats {
        SyncStats {
            operations_started: self.operations_started.load(Ordering::SeqCst),
            operations_completed: self.operations_completed.load(Ordering::SeqCst),
            operations_failed: self.operations_failed.load(Ordering::SeqCst),
            operations_deferred: self.operations_deferred.load(Ordering::SeqCst),
            polls: self.polls.load(Ordering::SeqCst),
            items_warned: self.items_warned.load(Ordering::SeqCst),
            items_failed: self.items_failed.load(Ordering::SeqCst),
            entries_distributed: self.entries_distributed.load(Ordering::SeqCst),
            operations_distributed: self.operations_distributed.load(Ordering::SeqCst),
            batch_errors: self.batch_errors.load(Ordering::SeqCst),
            batch_timeouts: self.batch_timeouts.load(Ordering::SeqCst),
        }
    }
}

fn to_u64(value: usize, metric: &'static str) -> MetricsResult<u64> {
    u64::try_from(value).map_err(|_| MetricsError::Overflow { metric })
}
