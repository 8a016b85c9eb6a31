//! Operation state machine
//!
//! INIT → LOAD → PREPARE → REQUEST → ACK → STATE (looped) → PARSE → STORE →
//! CONCLUDE. Every stage returns a [`StageOutcome`]; the run loop persists
//! the record between stages and turns suspensions, signals and failures
//! into scheduler calls.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use regsync_common::ErrorClassification;
use regsync_domain::{
    AckToken, ControlSignal, CorrelationKey, CorrelationRecord, FetchOutcome, OperationConfig,
    OperationRecord, OperationStatus, PayloadItem, PublicError, RegSyncError, RegistryError,
    RegistryPayload, Result, Stage,
};
use tracing::{debug, error, info, instrument, warn};

use super::backoff;
use super::cache::RequestCache;
use super::kinds::{OperationKind, SuccessItem};
use super::outcome::{RunOutcome, StageOutcome};
use super::ports::{
    ImportSink, ObjectLock, OperationRepository, OperationScheduler, PayloadSource,
    RegistryTransport,
};
use crate::correlation::CorrelationStore;
use crate::queue::ExportQueue;
use crate::unix_now;

type StageResult = std::result::Result<StageOutcome, RegistryError>;

/// Collaborators shared by every operation.
#[derive(Clone)]
pub struct OperationDeps {
    pub correlations: Arc<CorrelationStore>,
    pub queue: Arc<ExportQueue>,
    pub transport: Arc<dyn RegistryTransport>,
    pub payloads: Arc<dyn PayloadSource>,
    pub imports: Arc<dyn ImportSink>,
    pub locks: Arc<dyn ObjectLock>,
    pub operations: Arc<dyn OperationRepository>,
    pub scheduler: Arc<dyn OperationScheduler>,
    pub config: OperationConfig,
}

/// A correlation record selected for submission.
#[derive(Debug, Clone)]
pub(crate) struct Target {
    pub(crate) record: CorrelationRecord,
    pub(crate) transport_id: String,
}

/// One request/response cycle against the registry.
///
/// Transient state (targets, payload, parsed items, the missing-object
/// dedup set) lives only for the current run; everything needed to resume
/// is in the [`OperationRecord`].
pub struct Operation {
    pub(crate) kind: OperationKind,
    pub(crate) record: OperationRecord,
    pub(crate) deps: OperationDeps,
    pub(crate) cache: RequestCache,
    pub(crate) missing_seen: HashSet<String>,
    held_locks: Vec<String>,
    targets: Vec<Target>,
    payload: Option<RegistryPayload>,
    success: Vec<SuccessItem>,
}

impl Operation {
    pub fn new(record: OperationRecord, kind: OperationKind, deps: OperationDeps) -> Self {
        Self {
            kind,
            record,
            deps,
            cache: RequestCache::default(),
            missing_seen: HashSet::new(),
            held_locks: Vec::new(),
            targets: Vec::new(),
            payload: None,
            success: Vec::new(),
        }
    }

    pub fn record(&self) -> &OperationRecord {
        &self.record
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn into_record(self) -> OperationRecord {
        self.record
    }

    /// Run stages from where the record left off until the operation
    /// finishes, suspends or fails.
    ///
    /// Only user-facing precondition failures and persistence failures of
    /// the operation record itself surface as `Err`.
    #[instrument(skip(self), fields(operation_id = %self.record.id, operation = %self.record.name))]
    pub async fn run(&mut self) -> Result<RunOutcome> {
        match self.record.status {
            OperationStatus::Error if self.record.needs_attention => {
                return Ok(RunOutcome::Failed { retryable: false });
            }
            OperationStatus::Error => self.record.reopen(unix_now())?,
            status if status.is_terminal() => return Ok(RunOutcome::Finished(status)),
            _ => {}
        }

        let mut stage = self.resume_stage();
        loop {
            if self.cancel_requested().await? {
                return self.cancel().await;
            }

            self.record.stage = stage;
            debug!(stage = %stage, status = %self.record.status, "Running stage");

            let outcome = match self.run_stage(stage).await {
                Ok(outcome) => outcome,
                Err(err) => return self.fail(err).await,
            };

            match outcome {
                StageOutcome::Next(next) => {
                    stage = next;
                    self.record.stage = next;
                    self.persist().await?;
                }
                StageOutcome::Suspend(delay) => return self.suspend(delay).await,
                StageOutcome::Finish(status) => return self.finish(status).await,
                StageOutcome::Signal(signal) => return self.handle_signal(signal).await,
            }
        }
    }

    /// Transient state is lost between runs: anything before the registry
    /// accepted the request starts over, anything after never resubmits.
    fn resume_stage(&self) -> Stage {
        match (self.record.stage, &self.record.ack) {
            (Stage::Ack, Some(_)) => Stage::Ack,
            (stage, Some(_)) if stage > Stage::Ack => Stage::State,
            _ => Stage::Init,
        }
    }

    async fn run_stage(&mut self, stage: Stage) -> StageResult {
        match stage {
            Stage::Init => self.init(),
            Stage::Load => self.load().await,
            Stage::Prepare => self.prepare().await,
            Stage::Request => self.request().await,
            Stage::Ack => self.acknowledge().await,
            Stage::State => self.poll_state().await,
            Stage::Parse => self.parse_stage().await,
            Stage::Store => self.store_stage().await,
            Stage::Conclude => {
                let status = self.conclude().await?;
                Ok(StageOutcome::Finish(status))
            }
        }
    }

    // ===== Stages =====

    fn init(&mut self) -> StageResult {
        self.cache.clear();
        self.missing_seen.clear();
        self.targets.clear();
        self.payload = None;
        self.success.clear();
        self.record.clear_findings();
        self.record.last_failure = None;
        // A cycle interrupted before ACK starts over from CREATED.
        self.record.status = OperationStatus::Created;
        self.record.updated_at = unix_now();
        Ok(StageOutcome::Next(Stage::Load))
    }

    async fn load(&mut self) -> StageResult {
        let ids = self.candidate_ids()?;

        let lock_keys: Vec<String> = ids.iter().map(|id| self.key_for(id).lock_key()).collect();
        if !self.acquire_locks(lock_keys).await? {
            return Ok(StageOutcome::Signal(ControlSignal::Pending {
                reason: "objects locked by another operation".to_string(),
            }));
        }

        let ids = self.filter(ids).await?;
        let now = unix_now();
        let window = self.deps.config.live_transport_window_secs;

        self.targets.clear();
        for id in ids {
            let key = self.key_for(&id);
            let house_id = self.record.house_of(&id).map(str::to_string);
            let mut record =
                self.deps.correlations.get_or_create_in_house(&key, house_id.as_deref()).await?;
            if record.house_id.is_none() {
                record.house_id = house_id;
            }

            let ours = record.batch_id.as_deref() == Some(self.record.batch_id());
            if record.is_in_flight(now, window) && !ours {
                self.release_locks().await;
                return Ok(StageOutcome::Signal(ControlSignal::Pending {
                    reason: format!("{key} is awaiting the result of another submission"),
                }));
            }

            if self.is_skippable(Some(&mut record)).await? {
                continue;
            }
            let transport_id = CorrelationStore::new_transport_id();
            self.targets.push(Target { record, transport_id });
        }

        self.record.transition(OperationStatus::Prepared, unix_now())?;
        if self.targets.is_empty() {
            info!("Nothing to submit");
            return Ok(StageOutcome::Next(Stage::Conclude));
        }

        debug!(count = self.targets.len(), "Loaded submission targets");
        Ok(StageOutcome::Next(Stage::Prepare))
    }

    async fn prepare(&mut self) -> StageResult {
        let context = match self.record.provider_id.clone() {
            Some(provider_id) => Some(self.provider_context(&provider_id).await?),
            None => None,
        };

        let mut items = Vec::with_capacity(self.targets.len());
        for target in &self.targets {
            let body = if self.kind.is_import() {
                serde_json::Value::Null
            } else {
                self.deps
                    .payloads
                    .load_object(&target.record.object_type, &target.record.object_id)
                    .await?
                    .ok_or_else(|| PublicError::NoData {
                        object_type: target.record.object_type.clone(),
                        object_id: target.record.object_id.clone(),
                    })?
            };

            items.push(PayloadItem {
                transport_id: target.transport_id.clone(),
                object_id: target.record.object_id.clone(),
                external_id: target.record.external_id.clone(),
                deleted: target.record.deleted,
                body,
            });
        }

        self.payload = Some(RegistryPayload {
            operation: self.record.name.clone(),
            object_type: self.record.object_type.clone(),
            provider_id: self.record.provider_id.clone(),
            context,
            items,
        });
        self.record.transition(OperationStatus::RequestBuilt, unix_now())?;
        Ok(StageOutcome::Next(Stage::Request))
    }

    async fn request(&mut self) -> StageResult {
        let payload = self
            .payload
            .take()
            .ok_or_else(|| RegistryError::internal("request stage reached without a payload"))?;

        let batch_id = self.record.batch_id().to_string();
        for target in &mut self.targets {
            self.deps
                .correlations
                .mark_submitted(&mut target.record, &batch_id, &target.transport_id)
                .await?;
        }

        let ack = with_timeout(
            self.transport_timeout(),
            "submit",
            self.deps.transport.submit(&self.record.name, &payload),
        )
        .await?;
        if ack.as_str().trim().is_empty() {
            return Err(RegistryError::process("registry returned an empty acknowledgment"));
        }

        info!(items = payload.items.len(), ack = %ack, "Request submitted");
        // Persisted with the move to ACK, so a resume never resubmits.
        self.record.ack = Some(ack.0);
        Ok(StageOutcome::Next(Stage::Ack))
    }

    async fn acknowledge(&mut self) -> StageResult {
        let ack = self.current_ack()?;
        debug!(ack = %ack, "Request acknowledged");

        self.record.backoff_index = 0;
        self.record.transition(OperationStatus::Executing, unix_now())?;
        // The local portion of the cycle ends here.
        self.release_locks().await;
        Ok(StageOutcome::Next(Stage::State))
    }

    async fn poll_state(&mut self) -> StageResult {
        let ack = self.current_ack()?;
        let state =
            with_timeout(self.transport_timeout(), "poll", self.deps.transport.poll(&ack)).await?;

        if state.is_complete() {
            return Ok(StageOutcome::Next(Stage::Parse));
        }

        match backoff::poll_delay(self.record.backoff_index) {
            Some(delay) => {
                self.record.backoff_index += 1;
                debug!(
                    ack = %ack,
                    state = ?state,
                    delay_secs = delay.as_secs(),
                    "Registry still working"
                );
                Ok(StageOutcome::Suspend(delay))
            }
            None => Err(RegistryError::process(format!(
                "registry did not complete request {ack} within {}s of polling",
                backoff::total_poll_window().as_secs()
            ))),
        }
    }

    async fn parse_stage(&mut self) -> StageResult {
        let ack = self.current_ack()?;
        let outcome =
            with_timeout(self.transport_timeout(), "fetch", self.deps.transport.fetch_result(&ack))
                .await?;

        let result = match outcome {
            FetchOutcome::Response(result) => result,
            FetchOutcome::Fault(fault) => return Err(RegistryError::Business(fault.into())),
        };
        self.record.transition(OperationStatus::ProcessingResult, unix_now())?;
        // A result parsed again after a deferred store reports each item once.
        self.record.clear_findings();
        self.missing_seen.clear();

        let mut known = self.deps.correlations.assemble(self.record.batch_id()).await?;
        if known.is_empty() && result.error.is_none() && !result.items.is_empty() {
            return Ok(StageOutcome::Signal(ControlSignal::Consistency {
                reason: format!("no record of batch {} awaits this result", self.record.batch_id()),
            }));
        }

        self.success = self.parse(result, &mut known).await?;
        Ok(StageOutcome::Next(Stage::Store))
    }

    async fn store_stage(&mut self) -> StageResult {
        let items = std::mem::take(&mut self.success);
        let keys: Vec<String> = items.iter().map(|item| item.record.key().lock_key()).collect();

        if !keys.is_empty() && !self.acquire_locks(keys).await? {
            return Ok(StageOutcome::Signal(ControlSignal::Pending {
                reason: "objects locked while storing results".to_string(),
            }));
        }

        let stored = self.store(items).await;
        self.release_locks().await;
        let stored = stored?;

        debug!(stored, "Stored registry results");
        Ok(StageOutcome::Next(Stage::Conclude))
    }

    // ===== Outcome handling =====

    async fn finish(&mut self, status: OperationStatus) -> Result<RunOutcome> {
        self.release_locks().await;
        self.record.transition(status, unix_now())?;
        self.record.next_run_at = None;
        self.persist().await?;

        info!(
            status = %status,
            warnings = self.record.warnings.len(),
            errors = self.record.errors.len(),
            missing = self.record.missing_ids.len(),
            "Operation finished"
        );
        Ok(RunOutcome::Finished(status))
    }

    async fn suspend(&mut self, delay: Duration) -> Result<RunOutcome> {
        self.record.stage = Stage::State;
        self.persist().await?;
        self.deps.scheduler.delay_then_resume(&mut self.record, delay).await?;
        Ok(RunOutcome::Suspended { resume_after: delay })
    }

    async fn handle_signal(&mut self, signal: ControlSignal) -> Result<RunOutcome> {
        match signal {
            ControlSignal::Cancel => self.cancel().await,
            ControlSignal::Pending { reason } => {
                self.release_locks().await;
                info!(reason = %reason, "Operation pending");
                self.record.transition(OperationStatus::Pending, unix_now())?;
                if self.record.ack.is_none() {
                    self.record.stage = Stage::Init;
                }
                self.persist().await?;

                let delay = Duration::from_secs(self.deps.config.pending_delay_secs);
                self.deps.scheduler.delay_then_resume(&mut self.record, delay).await?;
                Ok(RunOutcome::Deferred { retry_after: delay })
            }
            ControlSignal::Restart { reason } => self.restart(&reason).await,
            ControlSignal::Consistency { reason } if self.record.restarts > 0 => {
                let reason = format!("result still stale after restart: {reason}");
                self.fail(RegistryError::process(reason)).await
            }
            ControlSignal::Consistency { reason } => self.restart(&reason).await,
        }
    }

    async fn restart(&mut self, reason: &str) -> Result<RunOutcome> {
        self.release_locks().await;
        warn!(reason, restarts = self.record.restarts, "Restarting operation");
        self.record.restart(unix_now())?;
        self.persist().await?;
        self.deps.scheduler.schedule(&mut self.record).await?;
        Ok(RunOutcome::Deferred { retry_after: Duration::ZERO })
    }

    async fn cancel(&mut self) -> Result<RunOutcome> {
        self.release_locks().await;

        if self.record.stage >= Stage::Ack || self.record.ack.is_some() {
            let mut submitted = self.deps.correlations.assemble(self.record.batch_id()).await?;
            for record in submitted.values_mut() {
                self.deps.correlations.abandon(record).await?;
            }
        }

        self.record.transition(OperationStatus::Canceled, unix_now())?;
        self.record.next_run_at = None;
        self.persist().await?;
        info!("Operation canceled");
        Ok(RunOutcome::Finished(OperationStatus::Canceled))
    }

    async fn fail(&mut self, err: RegistryError) -> Result<RunOutcome> {
        self.release_locks().await;

        // A restart code gets one fresh attempt; the same code again is final.
        let restart_code =
            err.business_code().is_some_and(|code| self.deps.config.is_restart_code(code));
        if restart_code && self.record.restarts == 0 {
            return self.restart(&err.to_string()).await;
        }

        let now = unix_now();
        self.record.last_failure = Some(regsync_domain::truncate_reason(&err.to_string()));
        if let Err(transition_err) = self.record.transition(OperationStatus::Error, now) {
            warn!(error = %transition_err, "Failure after terminal status");
        }

        if let RegistryError::Public(public) = &err {
            self.record.next_run_at = None;
            self.persist().await?;
            info!(error = %public, "Operation rejected");
            return Err(RegSyncError::InvalidInput(public.to_string()));
        }

        if err.is_retryable() {
            let delay =
                err.retry_after().unwrap_or_else(|| backoff::retry_delay(self.record.attempts));
            if self.deps.scheduler.retry(&mut self.record, delay).await? {
                warn!(
                    error = %err,
                    attempts = self.record.attempts,
                    delay_secs = delay.as_secs(),
                    "Operation failed, retry scheduled"
                );
                self.persist().await?;
                return Ok(RunOutcome::Failed { retryable: true });
            }
            warn!(attempts = self.record.attempts, "Retries exhausted");
        }

        error!(error = %err, "Operation failed");
        self.record.needs_attention = true;
        self.record.next_run_at = None;
        self.persist().await?;
        Ok(RunOutcome::Failed { retryable: false })
    }

    // ===== Helpers =====

    pub(crate) fn key_for(&self, object_id: &str) -> CorrelationKey {
        CorrelationKey::scoped(
            self.record.object_type.clone(),
            object_id,
            self.record.provider_id.as_deref(),
        )
    }

    fn candidate_ids(&self) -> std::result::Result<Vec<String>, RegistryError> {
        let mut seen = HashSet::new();
        let mut ids = Vec::with_capacity(self.record.object_ids.len());
        for id in &self.record.object_ids {
            let id = id.trim();
            if id.is_empty() {
                return Err(PublicError::NoIdentifier {
                    object_type: self.record.object_type.clone(),
                    object_id: String::new(),
                }
                .into());
            }
            if seen.insert(id.to_string()) {
                ids.push(id.to_string());
            }
        }

        if ids.is_empty() {
            return Err(PublicError::NoIdentifier {
                object_type: self.record.object_type.clone(),
                object_id: String::new(),
            }
            .into());
        }
        Ok(ids)
    }

    async fn provider_context(
        &mut self,
        provider_id: &str,
    ) -> std::result::Result<serde_json::Value, RegistryError> {
        if let Some(context) = self.cache.provider_context(provider_id) {
            return Ok(context.clone());
        }
        let context = self.deps.payloads.provider_context(provider_id).await?;
        self.cache.insert_provider_context(provider_id, context.clone());
        Ok(context)
    }

    fn current_ack(&self) -> std::result::Result<AckToken, RegistryError> {
        self.record
            .ack
            .clone()
            .map(AckToken)
            .ok_or_else(|| RegistryError::internal("polling without an acknowledgment"))
    }

    fn transport_timeout(&self) -> Duration {
        Duration::from_secs(self.deps.config.transport_timeout_secs)
    }

    async fn acquire_locks(
        &mut self,
        keys: Vec<String>,
    ) -> std::result::Result<bool, RegistryError> {
        let ttl = Duration::from_secs(self.deps.config.lock_ttl_secs);
        let acquired = self.deps.locks.try_acquire(&keys, &self.record.id, ttl).await?;
        if acquired {
            for key in keys {
                if !self.held_locks.contains(&key) {
                    self.held_locks.push(key);
                }
            }
        }
        Ok(acquired)
    }

    pub(crate) async fn release_locks(&mut self) {
        if self.held_locks.is_empty() {
            return;
        }
        let keys = std::mem::take(&mut self.held_locks);
        if let Err(err) = self.deps.locks.release(&keys, &self.record.id).await {
            warn!(error = %err, count = keys.len(), "Failed to release object locks");
        }
    }

    async fn cancel_requested(&self) -> Result<bool> {
        if self.record.cancel_requested {
            return Ok(true);
        }
        self.deps.operations.is_cancel_requested(&self.record.id).await
    }

    async fn persist(&mut self) -> Result<()> {
        self.record.updated_at = unix_now();
        self.deps.operations.save(&self.record).await
    }
}

/// Bound an awaited registry call; elapsing counts as a transport failure.
async fn with_timeout<T, F>(
    timeout: Duration,
    call: &str,
    fut: F,
) -> std::result::Result<T, RegistryError>
where
    F: Future<Output = std::result::Result<T, RegistryError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(RegistryError::transport(format!(
            "registry {call} timed out after {}s",
            timeout.as_secs()
        ))),
    }
}
