//! Queue distribution scheduler.
//!
//! Runs [`ExportQueue::distribute`] on a fixed interval and turns every
//! `type -> provider` bucket into one unattended export operation. A
//! second cron job purges retained queue entries. Join handles are
//! tracked, cancellation is explicit, and every job run is wrapped in a
//! timeout.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use regsync_infra::observability::metrics::SyncMetrics;
//! use regsync_infra::scheduling::{
//!     DistributionJob, DistributionScheduler, DistributionSchedulerConfig, SchedulerResult,
//! };
//!
//! # async fn example() -> SchedulerResult<()> {
//! # let queue = todo!(); // Arc<ExportQueue>
//! # let service = todo!(); // Arc<OperationService>
//! let metrics = Arc::new(SyncMetrics::new());
//! let job = Arc::new(DistributionJob::new(queue, service, metrics.clone()));
//! let mut scheduler =
//!     DistributionScheduler::with_config(DistributionSchedulerConfig::default(), job, metrics)
//!         .await?;
//!
//! scheduler.start().await?;
//! // ... application runs ...
//! scheduler.stop().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use regsync_core::{ExportQueue, OperationService};
use regsync_domain::{Distribution, ObjectType, OperationRequest, QueueConfig, Result};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::observability::log_metric;
use crate::observability::metrics::SyncMetrics;
use crate::scheduling::error::{SchedulerError, SchedulerResult};

/// Outcome of one distribution pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DistributionReport {
    /// Objects taken off the queue.
    pub distributed: usize,
    /// Export operations submitted.
    pub submitted: usize,
    /// Objects of a type without an export operation.
    pub skipped: usize,
    /// Objects put back because their submission failed.
    pub requeued: usize,
}

/// Distribution and purge logic, independent of the cron plumbing.
pub struct DistributionJob {
    queue: Arc<ExportQueue>,
    service: Arc<OperationService>,
    metrics: Arc<SyncMetrics>,
}

impl DistributionJob {
    pub fn new(
        queue: Arc<ExportQueue>,
        service: Arc<OperationService>,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        Self { queue, service, metrics }
    }

    /// Distribute the priority types and submit one operation per bucket.
    ///
    /// A bucket whose submission fails is enqueued again so the objects are
    /// picked up by a later pass.
    pub async fn run(&self) -> Result<DistributionReport> {
        let distribution = self.queue.distribute(&[]).await?;
        let mut report =
            DistributionReport { distributed: distribution.object_count(), ..Default::default() };
        if distribution.is_empty() {
            return Ok(report);
        }

        for (object_type, provider_id, objects) in distribution.provider_batches() {
            let Some(operation) = self.service.descriptor().export_operation_for(&object_type)
            else {
                warn!(
                    object_type = %object_type,
                    count = objects.len(),
                    "No export operation registered for type; objects dropped"
                );
                report.skipped += objects.len();
                continue;
            };

            let request = OperationRequest::in_houses(operation, object_type.clone(), objects)
                .for_provider(provider_id.clone())
                .unattended();
            match self.service.submit(request).await {
                Ok(record) => {
                    debug!(
                        operation_id = %record.id,
                        object_type = %object_type,
                        provider_id = %provider_id,
                        count = record.object_ids.len(),
                        "Export operation submitted"
                    );
                    report.submitted += 1;
                }
                Err(err) => {
                    error!(
                        object_type = %object_type,
                        provider_id = %provider_id,
                        error = %err,
                        "Export submission failed; re-queueing bucket"
                    );
                    report.requeued +=
                        self.requeue(&distribution, &object_type, &provider_id).await?;
                }
            }
        }

        log_metric(
            self.metrics.record_distribution(report.distributed, report.submitted),
            "scheduler.distribution.objects",
        );
        info!(
            distributed = report.distributed,
            submitted = report.submitted,
            skipped = report.skipped,
            requeued = report.requeued,
            "Distribution pass finished"
        );
        Ok(report)
    }

    pub async fn purge(&self) -> Result<usize> {
        self.queue.purge().await
    }

    async fn requeue(
        &self,
        distribution: &Distribution,
        object_type: &ObjectType,
        provider_id: &str,
    ) -> Result<usize> {
        let Some(houses) =
            distribution.buckets.get(object_type).and_then(|providers| providers.get(provider_id))
        else {
            return Ok(0);
        };

        let mut count = 0;
        for (house_id, objects) in houses {
            for object_id in objects.keys() {
                self.queue
                    .enqueue(object_type.clone(), object_id, Some(house_id.as_str()), None)
                    .await?;
                count += 1;
            }
        }
        Ok(count)
    }
}

/// Configuration for the distribution scheduler.
#[derive(Debug, Clone)]
pub struct DistributionSchedulerConfig {
    /// Interval between distribution passes.
    pub distribute_interval: Duration,
    /// Cron expression of the retention purge.
    pub purge_cron: String,
    /// Timeout applied to a single job execution.
    pub job_timeout: Duration,
    /// Timeout for starting the underlying scheduler.
    pub start_timeout: Duration,
    /// Timeout for stopping the scheduler.
    pub stop_timeout: Duration,
    /// Timeout for awaiting the monitor task join handle.
    pub join_timeout: Duration,
}

impl Default for DistributionSchedulerConfig {
    fn default() -> Self {
        Self::from(&QueueConfig::default())
    }
}

impl From<&QueueConfig> for DistributionSchedulerConfig {
    fn from(config: &QueueConfig) -> Self {
        Self {
            distribute_interval: Duration::from_secs(config.distribute_interval_secs.max(1)),
            purge_cron: config.purge_cron.clone(),
            job_timeout: Duration::from_secs(300),
            start_timeout: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(5),
            join_timeout: Duration::from_secs(5),
        }
    }
}

/// Distribution scheduler with explicit lifecycle management.
pub struct DistributionScheduler {
    scheduler: Arc<RwLock<JobScheduler>>,
    config: DistributionSchedulerConfig,
    job_ids: Vec<Uuid>,
    monitor_handle: Option<JoinHandle<()>>,
    cancellation: CancellationToken,
    metrics: Arc<SyncMetrics>,
    job: Arc<DistributionJob>,
}

impl DistributionScheduler {
    /// Create a scheduler and register both jobs.
    ///
    /// An invalid purge cron expression fails here, not at start.
    pub async fn with_config(
        config: DistributionSchedulerConfig,
        job: Arc<DistributionJob>,
        metrics: Arc<SyncMetrics>,
    ) -> SchedulerResult<Self> {
        let raw_scheduler =
            JobScheduler::new().await.map_err(|e| SchedulerError::CreationFailed(e.to_string()))?;

        let mut scheduler = Self {
            scheduler: Arc::new(RwLock::new(raw_scheduler)),
            config,
            job_ids: Vec::new(),
            monitor_handle: None,
            cancellation: CancellationToken::new(),
            metrics,
            job,
        };

        scheduler.register_jobs().await?;
        Ok(scheduler)
    }

    /// Start the scheduler, spawning the monitoring task.
    #[instrument(skip(self))]
    pub async fn start(&mut self) -> SchedulerResult<()> {
        if self.is_running() {
            return Err(SchedulerError::AlreadyRunning);
        }

        self.cancellation = CancellationToken::new();

        let scheduler = self.scheduler.clone();
        let start_timeout = self.config.start_timeout;
        tokio::time::timeout(start_timeout, async move {
            let guard = scheduler.write().await;
            guard.start().await
        })
        .await
        .map_err(|_| SchedulerError::Timeout { seconds: start_timeout.as_secs() })?
        .map_err(|e| SchedulerError::StartFailed(e.to_string()))?;

        let cancel = self.cancellation.clone();
        let handle = tokio::spawn(async move {
            cancel.cancelled().await;
            debug!("Distribution scheduler monitor cancelled");
        });

        self.monitor_handle = Some(handle);
        info!(
            interval_secs = self.config.distribute_interval.as_secs(),
            purge_cron = %self.config.purge_cron,
            "Distribution scheduler started"
        );
        Ok(())
    }

    /// Stop the scheduler and wait for the monitor task to finish.
    #[instrument(skip(self))]
    pub async fn stop(&mut self) -> SchedulerResult<()> {
        if !self.is_running() {
            return Err(SchedulerError::NotRunning);
        }

        self.cancellation.cancel();

        let scheduler = self.scheduler.clone();
        let stop_timeout = self.config.stop_timeout;
        tokio::time::timeout(stop_timeout, async move {
            let mut guard = scheduler.write().await;
            guard.shutdown().await
        })
        .await
        .map_err(|_| SchedulerError::Timeout { seconds: stop_timeout.as_secs() })?
        .map_err(|e| SchedulerError::StopFailed(e.to_string()))?;

        if let Some(handle) = self.monitor_handle.take() {
            let join_timeout = self.config.join_timeout;
            tokio::time::timeout(join_timeout, handle)
                .await
                .map_err(|_| SchedulerError::Timeout { seconds: join_timeout.as_secs() })??;
        }

        info!("Distribution scheduler stopped");
        self.cancellation = CancellationToken::new();
        Ok(())
    }

    /// Returns true when the monitor task is active.
    pub fn is_running(&self) -> bool {
        self.monitor_handle.as_ref().map_or(false, |handle| !handle.is_finished())
    }

    pub fn job_ids(&self) -> &[Uuid] {
        &self.job_ids
    }

    async fn register_jobs(&mut self) -> SchedulerResult<()> {
        if !self.job_ids.is_empty() {
            return Ok(());
        }

        let job_timeout = self.config.job_timeout;

        let job = self.job.clone();
        let metrics = self.metrics.clone();
        let interval = self.config.distribute_interval;
        let distribute = Job::new_repeated_async(interval, move |_id, _lock| {
            let job = job.clone();
            let metrics = metrics.clone();

            Box::pin(async move {
                let started = Instant::now();
                match tokio::time::timeout(job_timeout, job.run()).await {
                    Ok(Ok(report)) => {
                        if report.distributed > 0 {
                            log_metric(
                                metrics.record_batch_time(started.elapsed()),
                                "scheduler.distribution.duration",
                            );
                        }
                    }
                    Ok(Err(err)) => {
                        log_metric(metrics.record_batch_error(), "scheduler.distribution.error");
                        error!(error = %err, "Queue distribution failed");
                    }
                    Err(_) => {
                        log_metric(
                            metrics.record_batch_timeout(),
                            "scheduler.distribution.timeout",
                        );
                        warn!(timeout_secs = job_timeout.as_secs(), "Queue distribution timed out");
                    }
                }
            })
        })
        .map_err(|e| SchedulerError::JobRegistrationFailed(e.to_string()))?;

        let job = self.job.clone();
        let purge = Job::new_async(self.config.purge_cron.as_str(), move |_id, _lock| {
            let job = job.clone();

            Box::pin(async move {
                match tokio::time::timeout(job_timeout, job.purge()).await {
                    Ok(Ok(purged)) => debug!(purged, "Queue purge finished"),
                    Ok(Err(err)) => error!(error = %err, "Queue purge failed"),
                    Err(_) => warn!(timeout_secs = job_timeout.as_secs(), "Queue purge timed out"),
                }
            })
        })
        .map_err(|e| {
            SchedulerError::JobRegistrationFailed(format!(
                "purge cron '{}': {e}",
                self.config.purge_cron
            ))
        })?;

        let scheduler = self.scheduler.write().await;
        for definition in [distribute, purge] {
            let job_id = definition.guid();
            scheduler
                .add(definition)
                .await
                .map_err(|e| SchedulerError::JobRegistrationFailed(e.to_string()))?;
            self.job_ids.push(job_id);
        }

        debug!(job_ids = ?self.job_ids, "Registered distribution jobs");
        Ok(())
    }
}

impl Drop for DistributionScheduler {
    fn drop(&mut self) {
        if self.is_running() {
            warn!("DistributionScheduler dropped while running; cancelling tasks");
            self.cancellation.cancel();
        }
    }
}
