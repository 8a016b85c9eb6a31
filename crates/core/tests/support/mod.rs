//! Shared test helpers for `regsync-core` integration tests.
//!
//! In-memory implementations of every core port plus a scripted registry
//! transport, so operation tests can drive the full state machine without a
//! database or network.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regsync_core::correlation::{CorrelationRepository, CorrelationStore};
use regsync_core::operation::{
    ImportSink, ObjectLock, OperationDeps, OperationKind, OperationRepository, OperationScheduler,
    OperationService, PayloadSource, RegistryTransport, RunOutcome, ServiceDescriptor,
};
use regsync_core::queue::{ExportQueue, ExportQueueRepository, HouseProviderResolver};
use regsync_domain::{
    AckToken, CorrelationKey, CorrelationRecord, FetchOutcome, ItemSuccess, ObjectType,
    OperationConfig, OperationRecord, PollState, QueueConfig, QueueConsumeKey, QueueEntry,
    RegistryError, RegistryPayload, RegistryResult, Result as DomainResult, ResultItem,
};
use tokio::sync::Mutex;

// ===== Correlation repository =====

#[derive(Default)]
pub struct MemoryCorrelationRepository {
    records: Mutex<HashMap<CorrelationKey, CorrelationRecord>>,
}

impl MemoryCorrelationRepository {
    pub async fn get(&self, key: &CorrelationKey) -> Option<CorrelationRecord> {
        self.records.lock().await.get(key).cloned()
    }

    pub async fn put(&self, record: CorrelationRecord) {
        self.records.lock().await.insert(record.key(), record);
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }
}

#[async_trait]
impl CorrelationRepository for MemoryCorrelationRepository {
    async fn get_or_create(
        &self,
        key: &CorrelationKey,
        house_id: Option<&str>,
        now: i64,
    ) -> DomainResult<CorrelationRecord> {
        let mut records = self.records.lock().await;
        let record = records
            .entry(key.clone())
            .or_insert_with(|| CorrelationRecord::new(key.clone(), house_id.map(str::to_string), now));
        Ok(record.clone())
    }

    async fn find(&self, key: &CorrelationKey) -> DomainResult<Option<CorrelationRecord>> {
        Ok(self.records.lock().await.get(key).cloned())
    }

    async fn find_by_transport_id(
        &self,
        transport_id: &str,
    ) -> DomainResult<Option<CorrelationRecord>> {
        Ok(self
            .records
            .lock()
            .await
            .values()
            .find(|r| r.transport_id.as_deref() == Some(transport_id))
            .cloned())
    }

    async fn find_by_batch(&self, batch_id: &str) -> DomainResult<Vec<CorrelationRecord>> {
        Ok(self
            .records
            .lock()
            .await
            .values()
            .filter(|r| r.batch_id.as_deref() == Some(batch_id))
            .cloned()
            .collect())
    }

    async fn upsert(&self, record: &CorrelationRecord) -> DomainResult<()> {
        self.records.lock().await.insert(record.key(), record.clone());
        Ok(())
    }

    async fn upsert_if_current(
        &self,
        record: &CorrelationRecord,
        expected_transport_id: &str,
    ) -> DomainResult<bool> {
        let mut records = self.records.lock().await;
        let current = records.get(&record.key()).and_then(|r| r.transport_id.as_deref());
        if current != Some(expected_transport_id) {
            return Ok(false);
        }
        records.insert(record.key(), record.clone());
        Ok(true)
    }
}

// ===== Export queue repository =====

#[derive(Default)]
pub struct MemoryQueueRepository {
    entries: Mutex<BTreeMap<(String, String), QueueEntry>>,
    upserts: Mutex<usize>,
}

impl MemoryQueueRepository {
    pub async fn entries(&self) -> Vec<QueueEntry> {
        self.entries.lock().await.values().cloned().collect()
    }

    pub async fn upsert_count(&self) -> usize {
        *self.upserts.lock().await
    }

    /// Move consumption times `secs` into the past.
    pub async fn age_consumed(&self, secs: i64) {
        for entry in self.entries.lock().await.values_mut() {
            if let Some(at) = entry.consumed_at.as_mut() {
                *at -= secs;
            }
        }
    }
}

#[async_trait]
impl ExportQueueRepository for MemoryQueueRepository {
    async fn upsert(&self, entry: &QueueEntry) -> DomainResult<()> {
        *self.upserts.lock().await += 1;
        let mut entries = self.entries.lock().await;
        let key = (entry.object_id.clone(), entry.house_id.clone());
        match entries.get_mut(&key) {
            Some(existing) => {
                existing.object_type = entry.object_type.clone();
                existing.enqueued_at = entry.enqueued_at;
                existing.eligible_at = entry.eligible_at;
                existing.consumed_at = None;
            }
            None => {
                entries.insert(key, entry.clone());
            }
        }
        Ok(())
    }

    async fn find(&self, object_id: &str, house_id: &str) -> DomainResult<Option<QueueEntry>> {
        let key = (object_id.to_string(), house_id.to_string());
        Ok(self.entries.lock().await.get(&key).cloned())
    }

    async fn eligible(&self, types: &[ObjectType], now: i64) -> DomainResult<Vec<QueueEntry>> {
        Ok(self
            .entries
            .lock()
            .await
            .values()
            .filter(|e| e.consumed_at.is_none() && e.eligible_at <= now)
            .filter(|e| types.contains(&e.object_type))
            .cloned()
            .collect())
    }

    async fn delete_consumed(&self, keys: &[QueueConsumeKey]) -> DomainResult<usize> {
        let mut entries = self.entries.lock().await;
        let mut removed = 0;
        for key in keys {
            let map_key = (key.object_id.clone(), key.house_id.clone());
            if entries.get(&map_key).is_some_and(|e| e.enqueued_at == key.enqueued_at) {
                entries.remove(&map_key);
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn mark_consumed(&self, keys: &[QueueConsumeKey], consumed_at: i64) -> DomainResult<usize> {
        let mut entries = self.entries.lock().await;
        let mut marked = 0;
        for key in keys {
            let map_key = (key.object_id.clone(), key.house_id.clone());
            if let Some(entry) = entries.get_mut(&map_key) {
                if entry.enqueued_at == key.enqueued_at {
                    entry.consumed_at = Some(consumed_at);
                    marked += 1;
                }
            }
        }
        Ok(marked)
    }

    async fn purge_consumed(&self, older_than: i64) -> DomainResult<usize> {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, e| e.consumed_at.map_or(true, |at| at > older_than));
        Ok(before - entries.len())
    }
}

/// Resolver backed by a fixed `provider -> houses` table.
#[derive(Default)]
pub struct StaticResolver {
    providers: HashMap<String, Vec<String>>,
}

impl StaticResolver {
    pub fn with(mut self, provider_id: &str, houses: &[&str]) -> Self {
        self.providers
            .entry(provider_id.to_string())
            .or_default()
            .extend(houses.iter().map(|h| (*h).to_string()));
        self
    }
}

#[async_trait]
impl HouseProviderResolver for StaticResolver {
    async fn resolve_providers_for_houses(
        &self,
        house_ids: &[String],
    ) -> DomainResult<HashMap<String, Vec<String>>> {
        let mut resolved = HashMap::new();
        for (provider, houses) in &self.providers {
            let matching: Vec<String> =
                houses.iter().filter(|h| house_ids.contains(h)).cloned().collect();
            if !matching.is_empty() {
                resolved.insert(provider.clone(), matching);
            }
        }
        Ok(resolved)
    }
}

// ===== Operation repository and scheduler =====

#[derive(Default)]
pub struct MemoryOperationRepository {
    records: Mutex<HashMap<String, OperationRecord>>,
    history: Mutex<Vec<OperationRecord>>,
}

impl MemoryOperationRepository {
    /// Every saved version of operation `id`, oldest first.
    pub async fn history(&self, id: &str) -> Vec<OperationRecord> {
        self.history.lock().await.iter().filter(|r| r.id == id).cloned().collect()
    }
}

#[async_trait]
impl OperationRepository for MemoryOperationRepository {
    async fn insert(&self, record: &OperationRecord) -> DomainResult<()> {
        self.records.lock().await.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn save(&self, record: &OperationRecord) -> DomainResult<()> {
        self.history.lock().await.push(record.clone());
        let mut records = self.records.lock().await;
        let cancel_requested = records.get(&record.id).is_some_and(|r| r.cancel_requested);
        let mut stored = record.clone();
        stored.cancel_requested = cancel_requested || record.cancel_requested;
        records.insert(record.id.clone(), stored);
        Ok(())
    }

    async fn get(&self, id: &str) -> DomainResult<Option<OperationRecord>> {
        Ok(self.records.lock().await.get(id).cloned())
    }

    async fn claim_due(
        &self,
        now: i64,
        lease_until: i64,
        limit: usize,
    ) -> DomainResult<Vec<OperationRecord>> {
        let mut records = self.records.lock().await;
        let mut claimed = Vec::new();
        for record in records.values_mut() {
            if claimed.len() >= limit {
                break;
            }
            if record.next_run_at.is_some_and(|at| at <= now) {
                record.next_run_at = Some(lease_until);
                claimed.push(record.clone());
            }
        }
        Ok(claimed)
    }

    async fn request_cancel(&self, id: &str) -> DomainResult<bool> {
        match self.records.lock().await.get_mut(id) {
            Some(record) => {
                record.cancel_requested = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn is_cancel_requested(&self, id: &str) -> DomainResult<bool> {
        Ok(self.records.lock().await.get(id).is_some_and(|r| r.cancel_requested))
    }

    async fn needing_attention(&self) -> DomainResult<Vec<OperationRecord>> {
        Ok(self.records.lock().await.values().filter(|r| r.needs_attention).cloned().collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerCall {
    Schedule(String),
    Retry(String, Duration),
    Resume(String, Duration),
}

/// Records scheduling requests instead of acting on them.
pub struct RecordingScheduler {
    pub max_attempts: u32,
    calls: Mutex<Vec<SchedulerCall>>,
}

impl Default for RecordingScheduler {
    fn default() -> Self {
        Self { max_attempts: 3, calls: Mutex::new(Vec::new()) }
    }
}

impl RecordingScheduler {
    pub async fn calls(&self) -> Vec<SchedulerCall> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl OperationScheduler for RecordingScheduler {
    async fn schedule(&self, record: &mut OperationRecord) -> DomainResult<()> {
        record.next_run_at = Some(regsync_core::unix_now());
        self.calls.lock().await.push(SchedulerCall::Schedule(record.id.clone()));
        Ok(())
    }

    async fn retry(&self, record: &mut OperationRecord, delay: Duration) -> DomainResult<bool> {
        self.calls.lock().await.push(SchedulerCall::Retry(record.id.clone(), delay));
        record.attempts += 1;
        Ok(record.attempts <= self.max_attempts)
    }

    async fn delay_then_resume(
        &self,
        record: &mut OperationRecord,
        delay: Duration,
    ) -> DomainResult<()> {
        self.calls.lock().await.push(SchedulerCall::Resume(record.id.clone(), delay));
        Ok(())
    }
}

// ===== Locks, payloads, imports =====

#[derive(Default)]
pub struct MemoryLocks {
    held: Mutex<HashMap<String, String>>,
}

impl MemoryLocks {
    pub async fn hold(&self, key: &str, owner: &str) {
        self.held.lock().await.insert(key.to_string(), owner.to_string());
    }

    pub async fn held_count(&self) -> usize {
        self.held.lock().await.len()
    }
}

#[async_trait]
impl ObjectLock for MemoryLocks {
    async fn try_acquire(&self, keys: &[String], owner: &str, _ttl: Duration) -> DomainResult<bool> {
        let mut held = self.held.lock().await;
        if keys.iter().any(|k| held.get(k).is_some_and(|o| o != owner)) {
            return Ok(false);
        }
        for key in keys {
            held.insert(key.clone(), owner.to_string());
        }
        Ok(true)
    }

    async fn release(&self, keys: &[String], owner: &str) -> DomainResult<()> {
        let mut held = self.held.lock().await;
        for key in keys {
            if held.get(key).is_some_and(|o| o == owner) {
                held.remove(key);
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct StaticPayloads {
    objects: Mutex<HashMap<(ObjectType, String), serde_json::Value>>,
    context_loads: Mutex<usize>,
}

impl StaticPayloads {
    pub async fn add(&self, object_type: ObjectType, object_id: &str, body: serde_json::Value) {
        self.objects.lock().await.insert((object_type, object_id.to_string()), body);
    }

    pub async fn context_loads(&self) -> usize {
        *self.context_loads.lock().await
    }
}

#[async_trait]
impl PayloadSource for StaticPayloads {
    async fn load_object(
        &self,
        object_type: &ObjectType,
        object_id: &str,
    ) -> DomainResult<Option<serde_json::Value>> {
        Ok(self.objects.lock().await.get(&(object_type.clone(), object_id.to_string())).cloned())
    }

    async fn provider_context(&self, provider_id: &str) -> DomainResult<serde_json::Value> {
        *self.context_loads.lock().await += 1;
        Ok(serde_json::json!({ "provider": provider_id }))
    }
}

#[derive(Default)]
pub struct RecordingImports {
    pub has_missing_import: bool,
    stored: Mutex<Vec<(String, Option<String>)>>,
    missing_requests: Mutex<Vec<Vec<String>>>,
}

impl RecordingImports {
    pub fn with_missing_import() -> Self {
        Self { has_missing_import: true, ..Self::default() }
    }

    /// `(object_id, group_id)` of every stored item.
    pub async fn stored(&self) -> Vec<(String, Option<String>)> {
        self.stored.lock().await.clone()
    }

    pub async fn missing_requests(&self) -> Vec<Vec<String>> {
        self.missing_requests.lock().await.clone()
    }
}

#[async_trait]
impl ImportSink for RecordingImports {
    async fn store_item(
        &self,
        record: &CorrelationRecord,
        _item: &ItemSuccess,
        group_id: Option<&str>,
    ) -> DomainResult<()> {
        self.stored.lock().await.push((record.object_id.clone(), group_id.map(str::to_string)));
        Ok(())
    }

    async fn import_missing(
        &self,
        _object_type: &ObjectType,
        object_ids: &[String],
    ) -> DomainResult<bool> {
        self.missing_requests.lock().await.push(object_ids.to_vec());
        Ok(self.has_missing_import)
    }
}

// ===== Scripted registry =====

pub type Responder = Box<dyn Fn(&RegistryPayload) -> FetchOutcome + Send + Sync>;

/// Registry double: every submission is acknowledged, polls follow a script
/// and results are built from the submitted payload.
pub struct ScriptedTransport {
    responder: Responder,
    poll_script: Mutex<VecDeque<PollState>>,
    always_processing: bool,
    submit_failures: Mutex<u32>,
    submissions: Mutex<HashMap<String, RegistryPayload>>,
    order: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    pub fn new(responder: Responder) -> Self {
        Self {
            responder,
            poll_script: Mutex::new(VecDeque::new()),
            always_processing: false,
            submit_failures: Mutex::new(0),
            submissions: Mutex::new(HashMap::new()),
            order: Mutex::new(Vec::new()),
        }
    }

    /// Every item succeeds with external id `ext-<object id>`.
    pub fn succeeding() -> Self {
        Self::new(Box::new(|payload: &RegistryPayload| {
            respond_each(payload, |item| {
                ResultItem::success(item.transport_id.clone(), success_for(&item.object_id))
            })
        }))
    }

    pub fn with_polls(self, states: &[PollState]) -> Self {
        Self { poll_script: Mutex::new(states.iter().copied().collect()), ..self }
    }

    pub fn never_completing(self) -> Self {
        Self { always_processing: true, ..self }
    }

    pub fn failing_submits(self, count: u32) -> Self {
        Self { submit_failures: Mutex::new(count), ..self }
    }

    pub async fn submissions(&self) -> Vec<RegistryPayload> {
        let submissions = self.submissions.lock().await;
        self.order.lock().await.iter().filter_map(|ack| submissions.get(ack).cloned()).collect()
    }

    pub async fn last_payload(&self) -> Option<RegistryPayload> {
        self.submissions().await.pop()
    }
}

#[async_trait]
impl RegistryTransport for ScriptedTransport {
    async fn submit(
        &self,
        _operation: &str,
        payload: &RegistryPayload,
    ) -> Result<AckToken, RegistryError> {
        {
            let mut failures = self.submit_failures.lock().await;
            if *failures > 0 {
                *failures -= 1;
                return Err(RegistryError::transport("connection reset"));
            }
        }
        let ack = format!("ack-{}", self.order.lock().await.len() + 1);
        self.submissions.lock().await.insert(ack.clone(), payload.clone());
        self.order.lock().await.push(ack.clone());
        Ok(AckToken(ack))
    }

    async fn poll(&self, _ack: &AckToken) -> Result<PollState, RegistryError> {
        if self.always_processing {
            return Ok(PollState::Processing);
        }
        Ok(self.poll_script.lock().await.pop_front().unwrap_or(PollState::Successful))
    }

    async fn fetch_result(&self, ack: &AckToken) -> Result<FetchOutcome, RegistryError> {
        let submissions = self.submissions.lock().await;
        let payload = submissions
            .get(ack.as_str())
            .ok_or_else(|| RegistryError::process(format!("unknown ack {ack}")))?;
        Ok((self.responder)(payload))
    }
}

pub fn success_for(object_id: &str) -> ItemSuccess {
    ItemSuccess {
        external_id: Some(format!("ext-{object_id}")),
        code: Some(format!("code-{object_id}")),
        modified_at: None,
        attributes: serde_json::Value::Null,
    }
}

/// Build a response with one result item per submitted item.
pub fn respond_each(
    payload: &RegistryPayload,
    f: impl Fn(&regsync_domain::PayloadItem) -> ResultItem,
) -> FetchOutcome {
    FetchOutcome::Response(RegistryResult { error: None, items: payload.items.iter().map(f).collect() })
}

// ===== Harness =====

pub struct Harness {
    pub correlations_repo: Arc<MemoryCorrelationRepository>,
    pub queue_repo: Arc<MemoryQueueRepository>,
    pub operations: Arc<MemoryOperationRepository>,
    pub scheduler: Arc<RecordingScheduler>,
    pub locks: Arc<MemoryLocks>,
    pub payloads: Arc<StaticPayloads>,
    pub imports: Arc<RecordingImports>,
    pub transport: Arc<ScriptedTransport>,
    pub service: OperationService,
}

pub fn descriptor() -> ServiceDescriptor {
    ServiceDescriptor::new("house-management")
        .register("export_meters", OperationKind::GenericExport, ObjectType::Meter)
        .register("export_houses", OperationKind::GenericExport, ObjectType::House)
        .register("import_meters", OperationKind::GenericImport, ObjectType::Meter)
        .register("import_premises", OperationKind::NestedImport, ObjectType::Premises)
}

pub fn test_config() -> OperationConfig {
    OperationConfig { pending_delay_secs: 30, ..OperationConfig::default() }
}

pub fn harness(transport: ScriptedTransport) -> Harness {
    harness_with(transport, test_config(), RecordingImports::default())
}

pub fn harness_with(
    transport: ScriptedTransport,
    config: OperationConfig,
    imports: RecordingImports,
) -> Harness {
    let correlations_repo = Arc::new(MemoryCorrelationRepository::default());
    let queue_repo = Arc::new(MemoryQueueRepository::default());
    let operations = Arc::new(MemoryOperationRepository::default());
    let scheduler = Arc::new(RecordingScheduler::default());
    let locks = Arc::new(MemoryLocks::default());
    let payloads = Arc::new(StaticPayloads::default());
    let imports = Arc::new(imports);
    let transport = Arc::new(transport);

    let queue_config = QueueConfig { default_delay_secs: 0, ..QueueConfig::default() };
    let deps = OperationDeps {
        correlations: Arc::new(CorrelationStore::new(correlations_repo.clone())),
        queue: Arc::new(ExportQueue::new(
            queue_repo.clone(),
            Arc::new(StaticResolver::default()),
            queue_config,
        )),
        transport: transport.clone(),
        payloads: payloads.clone(),
        imports: imports.clone(),
        locks: locks.clone(),
        operations: operations.clone(),
        scheduler: scheduler.clone(),
        config,
    };

    Harness {
        correlations_repo,
        queue_repo,
        operations,
        scheduler,
        locks,
        payloads,
        imports,
        transport,
        service: OperationService::new(Arc::new(descriptor()), deps),
    }
}

impl Harness {
    pub async fn record(&self, id: &str) -> OperationRecord {
        self.operations.get(id).await.unwrap().expect("operation persisted")
    }

    /// Run the persisted record once.
    pub async fn step(&self, id: &str) -> regsync_domain::Result<RunOutcome> {
        let record = self.record(id).await;
        self.service.run_now(record).await.map(|(outcome, _)| outcome)
    }

    /// Keep running until the operation settles or `max_steps` is reached.
    pub async fn drive(&self, id: &str, max_steps: usize) -> regsync_domain::Result<RunOutcome> {
        let mut last = self.step(id).await?;
        for _ in 1..max_steps {
            match last {
                RunOutcome::Finished(_) | RunOutcome::Failed { retryable: false } => break,
                _ => last = self.step(id).await?,
            }
        }
        Ok(last)
    }

    pub async fn correlation(&self, object_type: ObjectType, object_id: &str) -> CorrelationRecord {
        self.correlations_repo
            .get(&CorrelationKey::new(object_type, object_id))
            .await
            .expect("correlation record exists")
    }

    pub async fn seed_meters(&self, ids: &[&str]) {
        for id in ids {
            self.payloads.add(ObjectType::Meter, id, serde_json::json!({ "serial": id })).await;
        }
    }
}

/// Ids referenced by a payload, for assertions.
pub fn payload_ids(payload: &RegistryPayload) -> HashSet<String> {
    payload.items.iter().map(|i| i.object_id.clone()).collect()
}
