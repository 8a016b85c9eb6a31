//! Shared helpers for `regsync-infra` integration tests.
//!
//! Wires the SQLCipher repositories, the HTTP registry transport and the
//! operation service together against a temporary database and a wiremock
//! registry.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use regsync_core::correlation::CorrelationStore;
use regsync_core::operation::{
    ImportSink, OperationDeps, OperationKind, OperationService, PayloadSource, ServiceDescriptor,
};
use regsync_core::queue::ExportQueue;
use regsync_domain::{
    CorrelationRecord, ItemSuccess, ObjectType, OperationConfig, QueueConfig, RegistryPayload,
    Result as DomainResult,
};
use regsync_infra::database::{
    DbManager, SqlCipherCorrelationRepository, SqlCipherExportQueueRepository,
    SqlCipherHouseProviderRepository, SqlCipherObjectLock, SqlCipherOperationRepository,
};
use regsync_infra::http::HttpClient;
use regsync_infra::observability::metrics::SyncMetrics;
use regsync_infra::registry::HttpRegistryTransport;
use regsync_infra::scheduling::DbOperationScheduler;
use serde_json::{json, Value};
use tempfile::TempDir;
use wiremock::matchers::{method, path_regex};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

pub const TEST_DB_KEY: &str = "test_key_64_chars_long_aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

/// Temporary database wrapper that keeps the underlying file alive for the
/// duration of a test run.
pub struct TestDatabase {
    pub manager: Arc<DbManager>,
    _temp_dir: TempDir,
}

impl TestDatabase {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("temp dir should be created");
        let db_path = temp_dir.path().join("regsync.db");

        let manager =
            DbManager::new(&db_path, 4, Some(TEST_DB_KEY)).expect("db manager should be created");
        manager.run_migrations().expect("schema migrations should apply");

        Self { manager: Arc::new(manager), _temp_dir: temp_dir }
    }
}

impl Default for TestDatabase {
    fn default() -> Self {
        Self::new()
    }
}

/// Serves every object as `{"serial": <id>}`.
#[derive(Default)]
pub struct EchoPayloads;

#[async_trait]
impl PayloadSource for EchoPayloads {
    async fn load_object(
        &self,
        _object_type: &ObjectType,
        object_id: &str,
    ) -> DomainResult<Option<Value>> {
        Ok(Some(json!({ "serial": object_id })))
    }

    async fn provider_context(&self, provider_id: &str) -> DomainResult<Value> {
        Ok(json!({ "provider": provider_id }))
    }
}

#[derive(Default)]
pub struct NoopImports;

#[async_trait]
impl ImportSink for NoopImports {
    async fn store_item(
        &self,
        _record: &CorrelationRecord,
        _item: &ItemSuccess,
        _group_id: Option<&str>,
    ) -> DomainResult<()> {
        Ok(())
    }
}

pub fn descriptor() -> ServiceDescriptor {
    ServiceDescriptor::new("house-management")
        .register("export_meters", OperationKind::GenericExport, ObjectType::Meter)
        .register("export_houses", OperationKind::GenericExport, ObjectType::House)
}

/// Everything an integration test needs, backed by one temp database.
pub struct Stack {
    pub db: TestDatabase,
    pub correlations: Arc<SqlCipherCorrelationRepository>,
    pub operations: Arc<SqlCipherOperationRepository>,
    pub houses: Arc<SqlCipherHouseProviderRepository>,
    pub queue: Arc<ExportQueue>,
    pub service: Arc<OperationService>,
    pub metrics: Arc<SyncMetrics>,
}

impl Stack {
    pub fn new(registry_url: &str, max_attempts: u32) -> Self {
        let db = TestDatabase::new();
        let manager = Arc::clone(&db.manager);

        let correlations = Arc::new(SqlCipherCorrelationRepository::new(Arc::clone(&manager)));
        let operations = Arc::new(SqlCipherOperationRepository::new(Arc::clone(&manager)));
        let houses = Arc::new(SqlCipherHouseProviderRepository::new(Arc::clone(&manager)));
        let queue = Arc::new(ExportQueue::new(
            Arc::new(SqlCipherExportQueueRepository::new(Arc::clone(&manager))),
            houses.clone(),
            QueueConfig { default_delay_secs: 0, ..QueueConfig::default() },
        ));

        let client = HttpClient::builder()
            .max_attempts(1)
            .base_backoff(Duration::from_millis(5))
            .timeout(Duration::from_secs(5))
            .build()
            .expect("http client");
        let transport = HttpRegistryTransport::new(client, registry_url).expect("transport");

        let deps = OperationDeps {
            correlations: Arc::new(CorrelationStore::new(correlations.clone())),
            queue: Arc::clone(&queue),
            transport: Arc::new(transport),
            payloads: Arc::new(EchoPayloads),
            imports: Arc::new(NoopImports),
            locks: Arc::new(SqlCipherObjectLock::new(Arc::clone(&manager))),
            operations: operations.clone(),
            scheduler: Arc::new(DbOperationScheduler::new(operations.clone(), max_attempts)),
            config: OperationConfig { max_attempts, ..OperationConfig::default() },
        };

        Self {
            db,
            correlations,
            operations,
            houses,
            queue,
            service: Arc::new(OperationService::new(Arc::new(descriptor()), deps)),
            metrics: Arc::new(SyncMetrics::new()),
        }
    }
}

/// Registry double: acknowledges every submission, reports `state` for
/// every poll and answers each submitted item with `ext-<object id>`.
pub struct RegistryDouble {
    pub server: MockServer,
    submissions: Arc<Mutex<HashMap<String, RegistryPayload>>>,
}

impl RegistryDouble {
    pub async fn start(state: &'static str) -> Self {
        let server = MockServer::start().await;
        let submissions: Arc<Mutex<HashMap<String, RegistryPayload>>> = Arc::default();

        let store = Arc::clone(&submissions);
        Mock::given(method("POST"))
            .and(path_regex(r"^/api/requests/[a-z_]+$"))
            .respond_with(move |request: &Request| {
                let payload: RegistryPayload =
                    serde_json::from_slice(&request.body).expect("payload json");
                let mut submissions = store.lock().expect("submissions lock");
                let ack = format!("ack-{}", submissions.len() + 1);
                submissions.insert(ack.clone(), payload);
                ResponseTemplate::new(202).set_body_json(json!({ "ack": ack }))
            })
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path_regex(r"^/api/requests/[^/]+/state$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "state": state })))
            .mount(&server)
            .await;

        let store = Arc::clone(&submissions);
        Mock::given(method("GET"))
            .and(path_regex(r"^/api/requests/[^/]+/result$"))
            .respond_with(move |request: &Request| {
                let ack = request
                    .url
                    .path_segments()
                    .and_then(|segments| segments.rev().nth(1))
                    .unwrap_or_default()
                    .to_string();
                let submissions = store.lock().expect("submissions lock");
                let Some(payload) = submissions.get(&ack) else {
                    return ResponseTemplate::new(404);
                };
                let items: Vec<Value> = payload
                    .items
                    .iter()
                    .map(|item| {
                        json!({
                            "transport_id": item.transport_id,
                            "success": { "external_id": format!("ext-{}", item.object_id) }
                        })
                    })
                    .collect();
                ResponseTemplate::new(200).set_body_json(json!({ "items": items }))
            })
            .mount(&server)
            .await;

        Self { server, submissions }
    }

    /// Registry answering every call with `status`.
    pub async fn failing(status: u16) -> Self {
        let server = MockServer::start().await;
        Mock::given(path_regex(r"^/api/.*"))
            .respond_with(ResponseTemplate::new(status))
            .mount(&server)
            .await;
        Self { server, submissions: Arc::default() }
    }

    pub fn url(&self) -> String {
        format!("{}/api", self.server.uri())
    }

    pub fn submissions(&self) -> Vec<RegistryPayload> {
        self.submissions.lock().expect("submissions lock").values().cloned().collect()
    }
}
