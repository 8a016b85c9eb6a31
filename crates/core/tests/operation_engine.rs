//! End-to-end runs of the operation state machine against in-memory ports.

mod support;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use regsync_core::operation::{ObjectLock, OperationRepository, RunOutcome};
use regsync_core::queue::ExportQueue;
use regsync_domain::{
    CorrelationKey, CorrelationRecord, CorrelationStatus, FetchOutcome, ItemError, ObjectType,
    OperationRequest, OperationStatus, PollState, QueueConfig, RegSyncError, RegistryPayload,
    RegistryResult, ResultItem, Stage,
};
use support::{
    harness, harness_with, payload_ids, respond_each, success_for, test_config, RecordingImports,
    SchedulerCall, ScriptedTransport, StaticResolver,
};

fn export_meters(ids: &[&str]) -> OperationRequest {
    OperationRequest::new(
        "export_meters",
        ObjectType::Meter,
        ids.iter().map(|id| (*id).to_string()).collect(),
    )
}

/// `m-2` gets the given errors, everything else succeeds.
fn failing_second(errors: Vec<ItemError>) -> ScriptedTransport {
    ScriptedTransport::new(Box::new(move |payload: &RegistryPayload| {
        respond_each(payload, |item| {
            if item.object_id == "m-2" {
                ResultItem::failure(item.transport_id.clone(), errors.clone())
            } else {
                ResultItem::success(item.transport_id.clone(), success_for(&item.object_id))
            }
        })
    }))
}

#[tokio::test(flavor = "multi_thread")]
async fn export_saves_registry_identities() {
    let h = harness(ScriptedTransport::succeeding());
    h.seed_meters(&["m-1", "m-2"]).await;

    let record = h.service.submit(export_meters(&["m-1", "m-2", "m-1"])).await.unwrap();
    assert_eq!(h.scheduler.calls().await, vec![SchedulerCall::Schedule(record.id.clone())]);

    let outcome = h.step(&record.id).await.unwrap();
    assert_eq!(outcome, RunOutcome::Finished(OperationStatus::Done));

    let payload = h.transport.last_payload().await.unwrap();
    assert_eq!(payload.items.len(), 2);
    assert_eq!(payload.operation, "export_meters");

    for id in ["m-1", "m-2"] {
        let corr = h.correlation(ObjectType::Meter, id).await;
        assert_eq!(corr.status, CorrelationStatus::Saved);
        assert_eq!(corr.external_id, Some(format!("ext-{id}")));
        assert_eq!(corr.code, Some(format!("code-{id}")));
        assert!(corr.transport_id.is_none());
        assert_eq!(corr.batch_id.as_deref(), Some(record.id.as_str()));
    }

    let stored = h.record(&record.id).await;
    assert_eq!(stored.status, OperationStatus::Done);
    assert_eq!(stored.stage, Stage::Conclude);
    assert!(stored.next_run_at.is_none());
    assert_eq!(h.locks.held_count().await, 0);

    // Finished operations do not run again.
    assert_eq!(h.step(&record.id).await.unwrap(), RunOutcome::Finished(OperationStatus::Done));
    assert_eq!(h.transport.submissions().await.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn registered_objects_are_only_resubmitted_when_forced() {
    let h = harness(ScriptedTransport::succeeding());
    h.seed_meters(&["m-1", "m-2"]).await;

    let mut existing = CorrelationRecord::new(CorrelationKey::new(ObjectType::Meter, "m-1"), None, 0);
    existing.external_id = Some("ext-old".into());
    existing.status = CorrelationStatus::Saved;
    h.correlations_repo.put(existing).await;

    let plain = h.service.submit(export_meters(&["m-1", "m-2"])).await.unwrap();
    h.step(&plain.id).await.unwrap();
    let payload = h.transport.last_payload().await.unwrap();
    assert_eq!(payload_ids(&payload), HashSet::from(["m-2".to_string()]));

    let forced = h.service.submit(export_meters(&["m-1", "m-2"]).forced()).await.unwrap();
    h.step(&forced.id).await.unwrap();
    let payload = h.transport.last_payload().await.unwrap();
    assert_eq!(payload.items.len(), 2);
    let resent = payload.items.iter().find(|i| i.object_id == "m-1").unwrap();
    assert_eq!(resent.external_id.as_deref(), Some("ext-old"));

    assert_eq!(h.correlation(ObjectType::Meter, "m-1").await.external_id.as_deref(), Some("ext-m-1"));
}

#[tokio::test(flavor = "multi_thread")]
async fn nothing_to_submit_concludes_without_a_request() {
    let h = harness(ScriptedTransport::succeeding());
    let mut existing = CorrelationRecord::new(CorrelationKey::new(ObjectType::Meter, "m-1"), None, 0);
    existing.external_id = Some("ext-1".into());
    existing.status = CorrelationStatus::Saved;
    h.correlations_repo.put(existing).await;

    let record = h.service.submit(export_meters(&["m-1"])).await.unwrap();
    assert_eq!(h.step(&record.id).await.unwrap(), RunOutcome::Finished(OperationStatus::Done));
    assert!(h.transport.submissions().await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn warning_codes_downgrade_item_errors() {
    let transport = ScriptedTransport::new(Box::new(|payload: &RegistryPayload| {
        respond_each(payload, |item| ResultItem {
            transport_id: Some(item.transport_id.clone()),
            errors: vec![ItemError::new("INT002000", "address normalized")],
            success: Some(success_for(&item.object_id)),
            children: Vec::new(),
        })
    }));
    let h = harness(transport);
    h.seed_meters(&["m-1"]).await;

    let record = h.service.submit(export_meters(&["m-1"])).await.unwrap();
    assert_eq!(h.step(&record.id).await.unwrap(), RunOutcome::Finished(OperationStatus::Warning));

    let stored = h.record(&record.id).await;
    assert_eq!(stored.warnings.len(), 1);
    assert!(stored.warnings[0].contains("INT002000"));
    assert!(stored.errors.is_empty());
    assert_eq!(h.correlation(ObjectType::Meter, "m-1").await.status, CorrelationStatus::Saved);
}

#[tokio::test(flavor = "multi_thread")]
async fn item_errors_mark_records_and_keep_identity() {
    let h = harness(failing_second(vec![ItemError::new("INT001000", "invalid serial")]));
    h.seed_meters(&["m-1", "m-2", "m-3"]).await;

    let mut known = CorrelationRecord::new(CorrelationKey::new(ObjectType::Meter, "m-2"), None, 0);
    known.external_id = Some("ext-2".into());
    known.status = CorrelationStatus::Changed;
    h.correlations_repo.put(known).await;

    let record = h.service.submit(export_meters(&["m-1", "m-2", "m-3"]).forced()).await.unwrap();
    assert_eq!(h.step(&record.id).await.unwrap(), RunOutcome::Finished(OperationStatus::Warning));

    let failed = h.correlation(ObjectType::Meter, "m-2").await;
    assert_eq!(failed.status, CorrelationStatus::Error);
    assert_eq!(failed.external_id.as_deref(), Some("ext-2"));
    assert!(failed.last_error.unwrap().contains("invalid serial"));

    let stored = h.record(&record.id).await;
    assert_eq!(stored.errors.len(), 1);
    assert!(stored.errors[0].contains("m-2"));
    for id in ["m-1", "m-3"] {
        let saved = h.correlation(ObjectType::Meter, id).await;
        assert_eq!(saved.status, CorrelationStatus::Saved);
        assert_eq!(saved.external_id, Some(format!("ext-{id}")));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn results_for_unknown_transport_ids_change_nothing() {
    let transport = ScriptedTransport::new(Box::new(|_: &RegistryPayload| {
        FetchOutcome::Response(RegistryResult {
            error: None,
            items: vec![
                ResultItem::success("tid-elsewhere".to_string(), success_for("m-9")),
                ResultItem::failure(
                    "tid-nowhere".to_string(),
                    vec![ItemError::new("INT001000", "invalid serial")],
                ),
            ],
        })
    }));
    let h = harness(transport);
    h.seed_meters(&["m-1"]).await;

    // A record of another batch that happens to carry one of the ids.
    let mut bystander =
        CorrelationRecord::new(CorrelationKey::new(ObjectType::Meter, "m-9"), None, 0);
    bystander.submit("other-batch", "tid-elsewhere", regsync_core::unix_now());
    h.correlations_repo.put(bystander.clone()).await;

    let record = h.service.submit(export_meters(&["m-1"])).await.unwrap();
    assert_eq!(h.step(&record.id).await.unwrap(), RunOutcome::Finished(OperationStatus::Done));

    assert_eq!(h.correlation(ObjectType::Meter, "m-9").await, bystander);
    let submitted = h.correlation(ObjectType::Meter, "m-1").await;
    assert_eq!(submitted.status, CorrelationStatus::Wip);
    assert!(submitted.external_id.is_none());
    assert!(submitted.last_error.is_none());
    assert_eq!(h.correlations_repo.len().await, 2);

    let stored = h.record(&record.id).await;
    assert!(stored.errors.is_empty());
    assert!(stored.warnings.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn skippable_records_are_registered_live_objects_of_plain_exports() {
    let h = harness(ScriptedTransport::succeeding());
    let plain = h.service.submit(export_meters(&["m-1"])).await.unwrap();
    let forced = h.service.submit(export_meters(&["m-1"]).forced()).await.unwrap();
    let import = OperationRequest::new("import_meters", ObjectType::Meter, vec!["m-1".into()]);
    let import = h.service.submit(import).await.unwrap();

    let registered = |id: &str| {
        let mut record = CorrelationRecord::new(CorrelationKey::new(ObjectType::Meter, id), None, 0);
        record.external_id = Some(format!("ext-{id}"));
        record.status = CorrelationStatus::Saved;
        record.transport_id = Some(format!("tid-{id}"));
        record
    };

    let mut operation = h.service.build(plain).unwrap();
    let mut live = registered("m-1");
    assert!(operation.is_skippable(Some(&mut live)).await.unwrap());
    assert!(live.transport_id.is_none());
    assert!(h.correlation(ObjectType::Meter, "m-1").await.transport_id.is_none());

    let mut deleted = registered("m-2");
    deleted.deleted = true;
    assert!(!operation.is_skippable(Some(&mut deleted)).await.unwrap());
    assert_eq!(deleted.transport_id.as_deref(), Some("tid-m-2"));

    let mut unregistered = registered("m-3");
    unregistered.external_id = None;
    assert!(!operation.is_skippable(Some(&mut unregistered)).await.unwrap());
    assert!(!operation.is_skippable(None).await.unwrap());

    let mut forced = h.service.build(forced).unwrap();
    assert!(!forced.is_skippable(Some(&mut registered("m-4"))).await.unwrap());

    let mut import = h.service.build(import).unwrap();
    assert!(!import.is_skippable(Some(&mut registered("m-5"))).await.unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_objects_are_reset_and_requeued() {
    let imports = RecordingImports::with_missing_import();
    let h = harness_with(
        failing_second(vec![ItemError::new("SRV006000", "object not found")]),
        test_config(),
        imports,
    );
    h.seed_meters(&["m-1", "m-2"]).await;

    let mut stale = CorrelationRecord::new(CorrelationKey::new(ObjectType::Meter, "m-2"), None, 0);
    stale.external_id = Some("ext-gone".into());
    stale.code = Some("code-gone".into());
    stale.status = CorrelationStatus::Changed;
    h.correlations_repo.put(stale).await;

    let houses = BTreeMap::from([
        ("m-1".to_string(), "h-1".to_string()),
        ("m-2".to_string(), "h-1".to_string()),
    ]);
    let request = OperationRequest::in_houses("export_meters", ObjectType::Meter, houses)
        .for_provider("p-1")
        .unattended();
    let record = h.service.submit(request).await.unwrap();
    assert_eq!(h.step(&record.id).await.unwrap(), RunOutcome::Finished(OperationStatus::Warning));

    let missing = h.correlation(ObjectType::Meter, "m-2").await;
    assert!(missing.external_id.is_none());
    assert!(missing.code.is_none());

    let stored = h.record(&record.id).await;
    assert_eq!(stored.missing_ids, vec!["m-2".to_string()]);

    let queued = h.queue_repo.entries().await;
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].object_id, "m-2");
    assert_eq!(queued[0].house_id, "h-1");
    assert_eq!(missing.house_id.as_deref(), Some("h-1"));

    assert_eq!(h.imports.missing_requests().await, vec![vec!["m-2".to_string()]]);

    // The re-export reaches the provider of the object's house.
    let queue = ExportQueue::new(
        h.queue_repo.clone(),
        Arc::new(StaticResolver::default().with("p-1", &["h-1"])),
        QueueConfig { default_delay_secs: 0, ..QueueConfig::default() },
    );
    let distribution = queue.distribute(&[ObjectType::Meter]).await.unwrap();
    assert_eq!(distribution.provider_batches(), vec![(
        ObjectType::Meter,
        "p-1".to_string(),
        BTreeMap::from([("m-2".to_string(), "h-1".to_string())]),
    )]);
}

#[tokio::test(flavor = "multi_thread")]
async fn provider_runs_share_records_of_unscoped_types() {
    let h = harness(ScriptedTransport::succeeding());
    h.seed_meters(&["m-1"]).await;

    let manual = h.service.submit(export_meters(&["m-1"])).await.unwrap();
    assert_eq!(h.step(&manual.id).await.unwrap(), RunOutcome::Finished(OperationStatus::Done));

    let scoped = h.service.submit(export_meters(&["m-1"]).for_provider("p-1")).await.unwrap();
    assert_eq!(h.step(&scoped.id).await.unwrap(), RunOutcome::Finished(OperationStatus::Done));

    assert_eq!(h.transport.submissions().await.len(), 1);
    assert_eq!(h.correlations_repo.len().await, 1);
    let key = CorrelationKey::new(ObjectType::Meter, "m-1").with_provider("p-1");
    assert!(h.correlations_repo.get(&key).await.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn plain_export_leaves_records_owned_by_another_submission() {
    let h = harness(ScriptedTransport::succeeding().with_polls(&[PollState::Processing]));
    h.seed_meters(&["m-1"]).await;

    let mut registered =
        CorrelationRecord::new(CorrelationKey::new(ObjectType::Meter, "m-1"), None, 0);
    registered.external_id = Some("ext-old".into());
    registered.status = CorrelationStatus::Saved;
    h.correlations_repo.put(registered).await;

    let scheduled = h.service.submit(export_meters(&["m-1"]).unattended()).await.unwrap();
    assert!(matches!(h.step(&scheduled.id).await.unwrap(), RunOutcome::Suspended { .. }));
    let in_flight = h.correlation(ObjectType::Meter, "m-1").await;
    assert_eq!(in_flight.status, CorrelationStatus::Wip);

    let manual = h.service.submit(export_meters(&["m-1"])).await.unwrap();
    assert!(matches!(h.step(&manual.id).await.unwrap(), RunOutcome::Deferred { .. }));
    assert_eq!(h.correlation(ObjectType::Meter, "m-1").await, in_flight);

    assert_eq!(h.step(&scheduled.id).await.unwrap(), RunOutcome::Finished(OperationStatus::Done));
    let saved = h.correlation(ObjectType::Meter, "m-1").await;
    assert_eq!(saved.status, CorrelationStatus::Saved);
    assert_eq!(saved.external_id.as_deref(), Some("ext-m-1"));

    assert_eq!(h.step(&manual.id).await.unwrap(), RunOutcome::Finished(OperationStatus::Done));
    assert_eq!(h.transport.submissions().await.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_requeues_once_per_run() {
    let h = harness(ScriptedTransport::succeeding());
    let record = h.service.submit(export_meters(&["m-1"])).await.unwrap();
    let mut operation = h.service.build(record).unwrap();

    let store = h.service.deps().correlations.clone();
    let mut corr = store.get_or_create(ObjectType::Meter, "m-1", None).await.unwrap();
    operation.missing(&mut corr, "not found").await.unwrap();
    operation.missing(&mut corr, "not found again").await.unwrap();

    assert_eq!(h.queue_repo.upsert_count().await, 1);
    assert_eq!(operation.record().missing_ids, vec!["m-1".to_string()]);
    assert_eq!(operation.record().errors.len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn polling_suspends_on_the_backoff_schedule() {
    let transport = ScriptedTransport::succeeding()
        .with_polls(&[PollState::Received, PollState::Processing]);
    let h = harness(transport);
    h.seed_meters(&["m-1"]).await;
    let record = h.service.submit(export_meters(&["m-1"])).await.unwrap();

    assert_eq!(
        h.step(&record.id).await.unwrap(),
        RunOutcome::Suspended { resume_after: Duration::from_secs(5) }
    );
    let suspended = h.record(&record.id).await;
    assert_eq!(suspended.status, OperationStatus::Executing);
    assert_eq!(suspended.stage, Stage::State);
    assert_eq!(suspended.ack.as_deref(), Some("ack-1"));
    // Locks end with the local portion of the cycle.
    assert_eq!(h.locks.held_count().await, 0);

    assert_eq!(
        h.step(&record.id).await.unwrap(),
        RunOutcome::Suspended { resume_after: Duration::from_secs(10) }
    );
    assert_eq!(h.step(&record.id).await.unwrap(), RunOutcome::Finished(OperationStatus::Done));

    // Resumes never resubmit.
    assert_eq!(h.transport.submissions().await.len(), 1);
    let resumes = h
        .scheduler
        .calls()
        .await
        .into_iter()
        .filter(|c| matches!(c, SchedulerCall::Resume(..)))
        .count();
    assert_eq!(resumes, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn accepted_request_is_never_resubmitted_after_a_crash() {
    let h = harness(ScriptedTransport::succeeding().with_polls(&[PollState::Processing]));
    h.seed_meters(&["m-1"]).await;
    let record = h.service.submit(export_meters(&["m-1"])).await.unwrap();
    assert!(matches!(h.step(&record.id).await.unwrap(), RunOutcome::Suspended { .. }));

    // The last state written before the ACK stage ran.
    let at_ack = h
        .operations
        .history(&record.id)
        .await
        .into_iter()
        .find(|saved| saved.stage == Stage::Ack)
        .expect("saved on the way to ACK");
    assert_eq!(at_ack.ack.as_deref(), Some("ack-1"));
    assert_eq!(at_ack.status, OperationStatus::RequestBuilt);

    h.operations.save(&at_ack).await.unwrap();
    assert_eq!(h.step(&record.id).await.unwrap(), RunOutcome::Finished(OperationStatus::Done));
    assert_eq!(h.transport.submissions().await.len(), 1);
    assert_eq!(h.correlation(ObjectType::Meter, "m-1").await.status, CorrelationStatus::Saved);
}

#[tokio::test(flavor = "multi_thread")]
async fn deferred_store_reports_each_finding_once() {
    let transport = ScriptedTransport::new(Box::new(|payload: &RegistryPayload| {
        respond_each(payload, |item| {
            if item.object_id == "m-2" {
                ResultItem::failure(
                    item.transport_id.clone(),
                    vec![ItemError::new("INT001000", "invalid serial")],
                )
            } else {
                ResultItem {
                    transport_id: Some(item.transport_id.clone()),
                    errors: vec![ItemError::new("INT002000", "address normalized")],
                    success: Some(success_for(&item.object_id)),
                    children: Vec::new(),
                }
            }
        })
    }))
    .with_polls(&[PollState::Processing]);
    let h = harness(transport);
    h.seed_meters(&["m-1", "m-2"]).await;
    let record = h.service.submit(export_meters(&["m-1", "m-2"])).await.unwrap();
    assert!(matches!(h.step(&record.id).await.unwrap(), RunOutcome::Suspended { .. }));

    h.locks.hold("meter:m-1", "other-operation").await;
    assert!(matches!(h.step(&record.id).await.unwrap(), RunOutcome::Deferred { .. }));
    assert_eq!(h.record(&record.id).await.stage, Stage::Store);

    h.locks.release(&["meter:m-1".to_string()], "other-operation").await.unwrap();
    assert_eq!(h.step(&record.id).await.unwrap(), RunOutcome::Finished(OperationStatus::Warning));

    let stored = h.record(&record.id).await;
    assert_eq!(stored.warnings.len(), 1);
    assert_eq!(stored.errors.len(), 1);
    assert_eq!(h.correlation(ObjectType::Meter, "m-1").await.status, CorrelationStatus::Saved);
    assert_eq!(h.transport.submissions().await.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn exhausted_polling_needs_attention() {
    let h = harness(ScriptedTransport::succeeding().never_completing());
    h.seed_meters(&["m-1"]).await;
    let record = h.service.submit(export_meters(&["m-1"])).await.unwrap();

    let outcome = h.drive(&record.id, 20).await.unwrap();
    assert_eq!(outcome, RunOutcome::Failed { retryable: false });

    let stored = h.record(&record.id).await;
    assert_eq!(stored.status, OperationStatus::Error);
    assert!(stored.needs_attention);
    assert!(stored.last_failure.unwrap().contains("polling"));
    assert_eq!(h.service.needing_attention().await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn locked_objects_defer_the_operation() {
    let h = harness(ScriptedTransport::succeeding());
    h.seed_meters(&["m-1"]).await;
    h.locks.hold("meter:m-1", "other-operation").await;

    let record = h.service.submit(export_meters(&["m-1"])).await.unwrap();
    assert_eq!(
        h.step(&record.id).await.unwrap(),
        RunOutcome::Deferred { retry_after: Duration::from_secs(30) }
    );

    let pending = h.record(&record.id).await;
    assert_eq!(pending.status, OperationStatus::Pending);
    assert_eq!(pending.stage, Stage::Init);
    assert!(h.transport.submissions().await.is_empty());
    assert!(h
        .scheduler
        .calls()
        .await
        .contains(&SchedulerCall::Resume(record.id.clone(), Duration::from_secs(30))));

    h.locks.release(&["meter:m-1".to_string()], "other-operation").await.unwrap();
    assert_eq!(h.step(&record.id).await.unwrap(), RunOutcome::Finished(OperationStatus::Done));
}

#[tokio::test(flavor = "multi_thread")]
async fn objects_awaiting_another_result_defer_the_operation() {
    let h = harness(ScriptedTransport::succeeding());
    h.seed_meters(&["m-1"]).await;

    let mut busy = CorrelationRecord::new(CorrelationKey::new(ObjectType::Meter, "m-1"), None, 0);
    busy.submit("other-batch", "tid-other", regsync_core::unix_now());
    h.correlations_repo.put(busy).await;

    let record = h.service.submit(export_meters(&["m-1"])).await.unwrap();
    assert!(matches!(h.step(&record.id).await.unwrap(), RunOutcome::Deferred { .. }));
    assert_eq!(h.record(&record.id).await.status, OperationStatus::Pending);
    assert_eq!(h.locks.held_count().await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_before_start_sends_nothing() {
    let h = harness(ScriptedTransport::succeeding());
    h.seed_meters(&["m-1"]).await;
    let record = h.service.submit(export_meters(&["m-1"])).await.unwrap();

    assert!(h.service.request_cancel(&record.id).await.unwrap());
    assert!(!h.service.request_cancel("no-such-operation").await.unwrap());

    assert_eq!(h.step(&record.id).await.unwrap(), RunOutcome::Finished(OperationStatus::Canceled));
    assert!(h.transport.submissions().await.is_empty());
    assert_eq!(h.record(&record.id).await.status, OperationStatus::Canceled);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_after_ack_abandons_submitted_records() {
    let h = harness(ScriptedTransport::succeeding().with_polls(&[PollState::Processing]));
    h.seed_meters(&["m-1", "m-2"]).await;
    let record = h.service.submit(export_meters(&["m-1", "m-2"])).await.unwrap();

    assert!(matches!(h.step(&record.id).await.unwrap(), RunOutcome::Suspended { .. }));
    h.service.request_cancel(&record.id).await.unwrap();

    assert_eq!(h.step(&record.id).await.unwrap(), RunOutcome::Finished(OperationStatus::Canceled));
    for id in ["m-1", "m-2"] {
        let corr = h.correlation(ObjectType::Meter, id).await;
        assert_eq!(corr.status, CorrelationStatus::Unknown);
        assert!(corr.transport_id.is_none());
    }

    // Canceled is final.
    assert_eq!(h.step(&record.id).await.unwrap(), RunOutcome::Finished(OperationStatus::Canceled));
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_business_data_is_a_user_error() {
    let h = harness(ScriptedTransport::succeeding());
    let record = h.service.submit(export_meters(&["m-1"])).await.unwrap();

    let err = h.step(&record.id).await.unwrap_err();
    assert!(matches!(err, RegSyncError::InvalidInput(msg) if msg.contains("m-1")));

    let stored = h.record(&record.id).await;
    assert_eq!(stored.status, OperationStatus::Error);
    assert!(stored.next_run_at.is_none());
    assert!(!stored.needs_attention);
    assert!(!h.scheduler.calls().await.iter().any(|c| matches!(c, SchedulerCall::Retry(..))));
    assert_eq!(h.locks.held_count().await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn transport_failures_are_retried() {
    let h = harness(ScriptedTransport::succeeding().failing_submits(1));
    h.seed_meters(&["m-1"]).await;
    let record = h.service.submit(export_meters(&["m-1"])).await.unwrap();

    assert_eq!(h.step(&record.id).await.unwrap(), RunOutcome::Failed { retryable: true });
    let failed = h.record(&record.id).await;
    assert_eq!(failed.status, OperationStatus::Error);
    assert_eq!(failed.attempts, 1);
    assert!(failed.last_failure.unwrap().contains("connection reset"));
    assert!(h
        .scheduler
        .calls()
        .await
        .contains(&SchedulerCall::Retry(record.id.clone(), Duration::from_secs(5))));

    assert_eq!(h.step(&record.id).await.unwrap(), RunOutcome::Finished(OperationStatus::Done));
    assert_eq!(h.correlation(ObjectType::Meter, "m-1").await.status, CorrelationStatus::Saved);
    assert!(h.record(&record.id).await.last_failure.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn retries_are_bounded() {
    let h = harness(ScriptedTransport::succeeding().failing_submits(10));
    h.seed_meters(&["m-1"]).await;
    let record = h.service.submit(export_meters(&["m-1"])).await.unwrap();

    assert_eq!(h.drive(&record.id, 10).await.unwrap(), RunOutcome::Failed { retryable: false });
    let stored = h.record(&record.id).await;
    assert!(stored.needs_attention);
    assert_eq!(stored.attempts, h.scheduler.max_attempts + 1);

    // Flagged operations stay put until someone looks at them.
    assert_eq!(h.step(&record.id).await.unwrap(), RunOutcome::Failed { retryable: false });
}

#[tokio::test(flavor = "multi_thread")]
async fn stale_results_restart_the_operation_once() {
    let h = harness(ScriptedTransport::succeeding().with_polls(&[PollState::Processing]));
    h.seed_meters(&["m-1"]).await;
    let record = h.service.submit(export_meters(&["m-1"])).await.unwrap();
    assert!(matches!(h.step(&record.id).await.unwrap(), RunOutcome::Suspended { .. }));

    // Another operation resubmitted the object meanwhile.
    let mut corr = h.correlation(ObjectType::Meter, "m-1").await;
    corr.submit("other-batch", "tid-other", regsync_core::unix_now());
    h.correlations_repo.put(corr).await;

    assert_eq!(
        h.step(&record.id).await.unwrap(),
        RunOutcome::Deferred { retry_after: Duration::ZERO }
    );
    let restarted = h.record(&record.id).await;
    assert_eq!(restarted.restarts, 1);
    assert_eq!(restarted.stage, Stage::Init);
    assert_eq!(restarted.status, OperationStatus::Created);
    assert!(restarted.ack.is_none());

    // The other submission's record was not touched.
    let corr = h.correlation(ObjectType::Meter, "m-1").await;
    assert_eq!(corr.transport_id.as_deref(), Some("tid-other"));
}

#[tokio::test(flavor = "multi_thread")]
async fn restart_codes_restart_instead_of_failing() {
    let transport = ScriptedTransport::new(Box::new(|_: &RegistryPayload| {
        FetchOutcome::Response(RegistryResult {
            error: Some(ItemError::new("EXP001000", "request expired")),
            items: Vec::new(),
        })
    }));
    let h = harness(transport);
    h.seed_meters(&["m-1"]).await;
    let record = h.service.submit(export_meters(&["m-1"])).await.unwrap();

    assert_eq!(
        h.step(&record.id).await.unwrap(),
        RunOutcome::Deferred { retry_after: Duration::ZERO }
    );
    assert_eq!(h.record(&record.id).await.restarts, 1);

    // The same code after the restart is final.
    assert_eq!(h.step(&record.id).await.unwrap(), RunOutcome::Failed { retryable: false });
    let failed = h.record(&record.id).await;
    assert_eq!(failed.status, OperationStatus::Error);
    assert!(failed.needs_attention);
}

#[tokio::test(flavor = "multi_thread")]
async fn registry_faults_are_not_retried() {
    let transport = ScriptedTransport::new(Box::new(|_: &RegistryPayload| {
        FetchOutcome::Fault(ItemError::new("INT009999", "internal registry failure"))
    }));
    let h = harness(transport);
    h.seed_meters(&["m-1"]).await;
    let record = h.service.submit(export_meters(&["m-1"])).await.unwrap();

    assert_eq!(h.step(&record.id).await.unwrap(), RunOutcome::Failed { retryable: false });
    let stored = h.record(&record.id).await;
    assert!(stored.needs_attention);
    assert!(stored.last_failure.unwrap().contains("INT009999"));
}

#[tokio::test(flavor = "multi_thread")]
async fn provider_context_is_attached_once_per_run() {
    let h = harness(ScriptedTransport::succeeding());
    h.seed_meters(&["m-1"]).await;
    let record = h.service.submit(export_meters(&["m-1"]).for_provider("prov-1")).await.unwrap();

    h.step(&record.id).await.unwrap();
    let payload = h.transport.last_payload().await.unwrap();
    assert_eq!(payload.provider_id.as_deref(), Some("prov-1"));
    assert_eq!(payload.context, Some(serde_json::json!({ "provider": "prov-1" })));
    assert_eq!(h.payloads.context_loads().await, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn nested_import_stores_children_with_their_group() {
    let transport = ScriptedTransport::new(Box::new(|payload: &RegistryPayload| {
        let children = payload
            .items
            .iter()
            .map(|item| ResultItem::success(item.transport_id.clone(), success_for(&item.object_id)))
            .collect();
        FetchOutcome::Response(RegistryResult {
            error: None,
            items: vec![ResultItem {
                transport_id: Some("group-1".into()),
                errors: Vec::new(),
                success: None,
                children,
            }],
        })
    }));
    let h = harness(transport);

    let request = OperationRequest::new(
        "import_premises",
        ObjectType::Premises,
        vec!["p-1".into(), "p-2".into()],
    );
    let record = h.service.submit(request).await.unwrap();
    assert_eq!(h.step(&record.id).await.unwrap(), RunOutcome::Finished(OperationStatus::Done));

    let mut stored = h.imports.stored().await;
    stored.sort();
    assert_eq!(stored, vec![
        ("p-1".to_string(), Some("group-1".to_string())),
        ("p-2".to_string(), Some("group-1".to_string())),
    ]);
    let corr = h.correlation(ObjectType::Premises, "p-2").await;
    assert_eq!(corr.external_id.as_deref(), Some("ext-p-2"));

    let payload = h.transport.last_payload().await.unwrap();
    assert!(payload.items.iter().all(|i| i.body.is_null()));
}

#[tokio::test(flavor = "multi_thread")]
async fn submit_validates_requests() {
    let h = harness(ScriptedTransport::succeeding());

    let wrong_type = OperationRequest::new("export_meters", ObjectType::House, vec!["h-1".into()]);
    assert!(matches!(h.service.submit(wrong_type).await, Err(RegSyncError::InvalidInput(_))));

    let no_ids = OperationRequest::new("export_meters", ObjectType::Meter, vec![" ".into()]);
    assert!(matches!(h.service.submit(no_ids).await, Err(RegSyncError::InvalidInput(_))));

    let unknown = OperationRequest::new("export_rooms", ObjectType::Room, vec!["r-1".into()]);
    assert!(matches!(h.service.submit(unknown).await, Err(RegSyncError::NotFound(_))));

    assert!(h.scheduler.calls().await.is_empty());
}
