//! Operation worker for periodic execution of due operations.
//!
//! Claims operations whose `next_run_at` has passed, leases them for the
//! processing timeout, and drives each one through
//! [`OperationService::run_now`]. Suspension, retries and restarts are
//! written back by the operation itself, so the worker only needs to keep
//! polling. Join handles are tracked, cancellation is explicit, and every
//! batch is wrapped in a timeout.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use regsync_infra::observability::metrics::SyncMetrics;
//! use regsync_infra::sync::{OperationWorker, OperationWorkerConfig};
//!
//! # async fn example() -> Result<(), regsync_infra::scheduling::SchedulerError> {
//! # let service = todo!(); // Arc<OperationService>
//! let metrics = Arc::new(SyncMetrics::new());
//! let mut worker = OperationWorker::new(service, OperationWorkerConfig::default(), metrics);
//!
//! worker.start().await?;
//! // ... application runs ...
//! worker.stop().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use regsync_core::{unix_now, OperationService, RunOutcome};
use regsync_domain::{RegSyncError, WorkerConfig};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::observability::log_metric;
use crate::observability::metrics::SyncMetrics;
use crate::scheduling::error::{SchedulerError, SchedulerResult};

/// Configuration for the operation worker.
#[derive(Debug, Clone)]
pub struct OperationWorkerConfig {
    /// Maximum number of operations claimed per batch
    pub batch_size: usize,
    /// Interval between polling attempts
    pub poll_interval: Duration,
    /// Timeout for processing a single batch; also the claim lease
    pub processing_timeout: Duration,
    /// Join timeout when stopping
    pub join_timeout: Duration,
}

impl Default for OperationWorkerConfig {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

impl From<&WorkerConfig> for OperationWorkerConfig {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            poll_interval: Duration::from_secs(config.poll_interval_secs.max(1)),
            processing_timeout: Duration::from_secs(config.processing_timeout_secs.max(1)),
            join_timeout: Duration::from_secs(5),
        }
    }
}

/// Counts of one processed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub claimed: usize,
    pub finished: usize,
    pub suspended: usize,
    pub deferred: usize,
    pub failed: usize,
    /// Runs that returned an error before reaching an outcome; their lease
    /// expires and they are claimed again.
    pub errored: usize,
}

/// Operation worker with explicit lifecycle management.
pub struct OperationWorker {
    service: Arc<OperationService>,
    config: OperationWorkerConfig,
    cancellation: CancellationToken,
    task_handle: Option<JoinHandle<()>>,
    metrics: Arc<SyncMetrics>,
}

impl OperationWorker {
    pub fn new(
        service: Arc<OperationService>,
        config: OperationWorkerConfig,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        Self {
            service,
            config,
            cancellation: CancellationToken::new(),
            task_handle: None,
            metrics,
        }
    }

    /// Start the worker, spawning the background processing task.
    #[instrument(skip(self))]
    pub async fn start(&mut self) -> SchedulerResult<()> {
        if self.is_running() {
            return Err(SchedulerError::AlreadyRunning);
        }

        info!("Starting operation worker");
        self.cancellation = CancellationToken::new();

        let service = Arc::clone(&self.service);
        let config = self.config.clone();
        let cancel = self.cancellation.clone();
        let metrics = Arc::clone(&self.metrics);

        let handle = tokio::spawn(async move {
            Self::process_loop(service, config, cancel, metrics).await;
        });

        self.task_handle = Some(handle);
        info!("Operation worker started");
        Ok(())
    }

    /// Stop the worker and wait for the processing task to finish.
    #[instrument(skip(self))]
    pub async fn stop(&mut self) -> SchedulerResult<()> {
        if !self.is_running() {
            return Err(SchedulerError::NotRunning);
        }

        info!("Stopping operation worker");
        self.cancellation.cancel();

        if let Some(handle) = self.task_handle.take() {
            let join_timeout = self.config.join_timeout;
            match tokio::time::timeout(join_timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("Worker task panicked: {}", e);
                    return Err(SchedulerError::from(e));
                }
                Err(_) => {
                    warn!("Worker task did not complete within timeout");
                    return Err(SchedulerError::Timeout { seconds: join_timeout.as_secs() });
                }
            }
        }

        info!("Operation worker stopped");
        self.cancellation = CancellationToken::new();
        Ok(())
    }

    /// Returns true when a worker task is active.
    pub fn is_running(&self) -> bool {
        self.task_handle.as_ref().map_or(false, |handle| !handle.is_finished())
    }

    /// Claim and run one batch in the current task.
    pub async fn run_once(&self) -> Result<BatchReport, RegSyncError> {
        Self::process_batch(&self.service, &self.config, &self.metrics).await
    }

    async fn process_loop(
        service: Arc<OperationService>,
        config: OperationWorkerConfig,
        cancel: CancellationToken,
        metrics: Arc<SyncMetrics>,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Operation worker process loop cancelled");
                    break;
                }
                _ = tokio::time::sleep(config.poll_interval) => {
                    let started = Instant::now();

                    match tokio::time::timeout(
                        config.processing_timeout,
                        Self::process_batch(&service, &config, &metrics),
                    )
                    .await
                    {
                        Ok(Ok(report)) => {
                            if report.claimed > 0 {
                                log_metric(
                                    metrics.record_batch_time(started.elapsed()),
                                    "operation_worker.batch.duration",
                                );
                            }
                        }
                        Ok(Err(e)) => {
                            error!(error = %e, "Operation batch failed");
                            log_metric(
                                metrics.record_batch_error(),
                                "operation_worker.batch.error",
                            );
                        }
                        Err(_) => {
                            warn!(
                                timeout_secs = config.processing_timeout.as_secs(),
                                "Operation batch timed out"
                            );
                            log_metric(
                                metrics.record_batch_timeout(),
                                "operation_worker.batch.timeout",
                            );
                        }
                    }
                }
            }
        }
    }

    async fn process_batch(
        service: &Arc<OperationService>,
        config: &OperationWorkerConfig,
        metrics: &Arc<SyncMetrics>,
    ) -> Result<BatchReport, RegSyncError> {
        let now = unix_now();
        let lease = i64::try_from(config.processing_timeout.as_secs()).unwrap_or(i64::MAX);
        let records = service
            .deps()
            .operations
            .claim_due(now, now.saturating_add(lease), config.batch_size)
            .await?;

        let mut report = BatchReport { claimed: records.len(), ..BatchReport::default() };
        if records.is_empty() {
            debug!("No due operations");
            return Ok(report);
        }

        info!(count = records.len(), "Processing due operations");

        for record in records {
            let operation_id = record.id.clone();
            log_metric(metrics.record_operation_started(), "operation_worker.operation.started");

            match service.run_now(record).await {
                Ok((outcome, record)) => {
                    log_metric(
                        metrics.record_outcome(&outcome),
                        "operation_worker.operation.outcome",
                    );
                    match outcome {
                        RunOutcome::Finished(status) => {
                            log_metric(
                                metrics.record_items(record.warnings.len(), record.errors.len()),
                                "operation_worker.operation.items",
                            );
                            debug!(
                                operation_id = %operation_id,
                                status = %status,
                                "Operation finished"
                            );
                            report.finished += 1;
                        }
                        RunOutcome::Suspended { resume_after } => {
                            debug!(
                                operation_id = %operation_id,
                                resume_secs = resume_after.as_secs(),
                                "Operation suspended"
                            );
                            report.suspended += 1;
                        }
                        RunOutcome::Deferred { retry_after } => {
                            debug!(
                                operation_id = %operation_id,
                                retry_secs = retry_after.as_secs(),
                                "Operation deferred"
                            );
                            report.deferred += 1;
                        }
                        RunOutcome::Failed { retryable } => {
                            warn!(
                                operation_id = %operation_id,
                                retryable,
                                needs_attention = record.needs_attention,
                                "Operation failed"
                            );
                            report.failed += 1;
                        }
                    }
                }
                Err(err) => {
                    error!(operation_id = %operation_id, error = %err, "Operation run aborted");
                    report.errored += 1;
                }
            }
        }

        info!(
            claimed = report.claimed,
            finished = report.finished,
            suspended = report.suspended,
            deferred = report.deferred,
            failed = report.failed,
            errored = report.errored,
            "Operation batch processed"
        );
        Ok(report)
    }
}

impl Drop for OperationWorker {
    fn drop(&mut self) {
        if self.is_running() {
            warn!("OperationWorker dropped while running; cancelling tasks");
            self.cancellation.cancel();
        }
    }
}
