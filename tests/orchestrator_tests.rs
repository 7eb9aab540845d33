mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::*;
use orbit_orchestrator::bridge::{
    AdapterCall, EmbedRequest, EmbeddingService, FaultInjector, InMemoryStorage,
    MockEmbeddingService, RelationalStore,
};
use orbit_orchestrator::engine::{parse_report, ReportedInvocation, Severity, TodoStatus};
use orbit_orchestrator::prelude::*;
use orbit_orchestrator::workflow::model::{AnalysisStatus, BatchStatus, ProcessingStage, WorkItemRef};

/// Embedder that stalls on sources matching `slow_for`
struct SlowEmbedding {
    inner: MockEmbeddingService,
    slow_for: &'static str,
    delay: Duration,
}

impl SlowEmbedding {
    fn new(storage: InMemoryStorage, slow_for: &'static str, delay: Duration) -> Self {
        Self {
            inner: MockEmbeddingService::new().with_output(storage, BUCKET),
            slow_for,
            delay,
        }
    }
}

#[async_trait]
impl EmbeddingService for SlowEmbedding {
    async fn embed(&self, request: EmbedRequest) -> ResultEnvelope {
        if request.source_path.contains(self.slow_for) {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.embed(request).await
    }

    async fn ping(&self) -> ResultEnvelope {
        self.inner.ping().await
    }
}

fn slow_harness(slow_for: &'static str, delay: Duration) -> HarnessBuilder {
    let builder = HarnessBuilder::new();
    let storage = builder.storage();
    builder.embedding(Arc::new(SlowEmbedding::new(storage, slow_for, delay)))
}

#[tokio::test]
async fn test_no_pending_work_skips_engine() {
    let h = harness();
    h.storage.create_container(BUCKET).await;

    let outcome = h.orchestrator.run_once(None).await;

    assert!(outcome.is_success(), "{:?}", outcome.envelope.error());
    assert_eq!(
        outcome.envelope.metadata_value("no_work"),
        Some(&serde_json::json!(true))
    );
    assert!(outcome.stats.phases_completed.is_empty());
    assert_eq!(outcome.stats.items_processed, 0);
    assert_eq!(h.store.count_calls("list_pending").await, 0);
    assert_eq!(h.store.count_calls("claim_item").await, 0);
}

#[tokio::test]
async fn test_end_to_end_single_item() {
    let h = harness();
    h.seed(1, 2).await;

    let outcome = h.orchestrator.run_once(None).await;

    assert!(outcome.is_success(), "{:?}", outcome.envelope.error());
    assert_eq!(outcome.stats.items_processed, 1);
    assert_eq!(outcome.stats.sub_items_processed, 2);
    assert_eq!(outcome.stats.errors, 0);
    assert_eq!(outcome.stats.success_rate(), Some(100.0));
    assert!(outcome.stats.is_finalized());

    let item = h.store.item("order-1").await.unwrap();
    assert_eq!(item.processing_stage, ProcessingStage::Completed);
    assert_eq!(h.store.batch_status("batch-1").await, Some(BatchStatus::Completed));

    let notifications = h.store.notifications().await;
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].item_id, "order-1");
    assert_eq!(notifications[0].user_id, "user-1");

    for sub_item in h.store.sub_items_of("order-1").await {
        assert_eq!(sub_item.analysis_status, AnalysisStatus::Completed);
        assert!(sub_item.analysis.is_some());
        let processed = sub_item.processed_path.expect("processed path recorded");
        assert!(h.storage.contains(BUCKET, &processed).await);
    }
}

#[tokio::test]
async fn test_multiple_items_processed_oldest_first() {
    let h = harness();
    h.seed(3, 1).await;

    let outcome = h.orchestrator.run_once(None).await;

    assert!(outcome.is_success());
    assert_eq!(outcome.stats.items_processed, 3);
    assert_eq!(outcome.context.pending_count, 0);
    for id in ["order-1", "order-2", "order-3"] {
        assert_eq!(
            h.store.item(id).await.unwrap().processing_stage,
            ProcessingStage::Completed
        );
    }
    assert_eq!(h.store.notifications().await.len(), 3);
}

#[tokio::test]
async fn test_persistent_embedding_failure_fails_item() {
    let faults = FaultInjector::new();
    faults.fail_matching(
        "embed",
        "image-2.jpg",
        "Metadata embedding failed: 503 Service Unavailable",
    );
    let h = HarnessBuilder::new().faults(faults).build();
    h.seed(1, 2).await;

    let outcome = h.orchestrator.run_once(None).await;

    // one bad item does not fail the run
    assert!(outcome.is_success(), "{:?}", outcome.envelope.error());
    assert!(outcome.stats.errors >= 1);
    assert_eq!(outcome.stats.items_processed, 0);
    assert_eq!(outcome.stats.sub_items_processed, 1);

    let item = h.store.item("order-1").await.unwrap();
    assert_eq!(item.processing_stage, ProcessingStage::Failed);
    assert!(h.store.failure_reason("order-1").await.is_some());
    assert_eq!(h.store.batch_status("batch-1").await, Some(BatchStatus::Failed));
    assert!(h.store.notifications().await.is_empty());

    let first = h.store.sub_item("order-1-image-1").await.unwrap();
    let second = h.store.sub_item("order-1-image-2").await.unwrap();
    assert_eq!(first.analysis_status, AnalysisStatus::Completed);
    assert_eq!(second.analysis_status, AnalysisStatus::Failed);
    assert!(h.faults.hits("embed") >= 2);
}

#[tokio::test]
async fn test_failed_item_does_not_block_others() {
    let faults = FaultInjector::new();
    faults.fail_matching("embed", "order-1/", "Metadata embedding failed: 503 Service Unavailable");
    let h = HarnessBuilder::new().faults(faults).build();
    h.seed(2, 1).await;

    let outcome = h.orchestrator.run_once(None).await;

    assert!(outcome.is_success());
    assert_eq!(
        h.store.item("order-1").await.unwrap().processing_stage,
        ProcessingStage::Failed
    );
    assert_eq!(
        h.store.item("order-2").await.unwrap().processing_stage,
        ProcessingStage::Completed
    );
    assert_eq!(outcome.stats.items_processed, 1);
}

#[tokio::test]
async fn test_allow_partial_completes_item() {
    let faults = FaultInjector::new();
    faults.fail_matching(
        "embed",
        "image-2.jpg",
        "Metadata embedding failed: 503 Service Unavailable",
    );
    let h = HarnessBuilder::new()
        .faults(faults)
        .policy(SubItemFailurePolicy::AllowPartial)
        .build();
    h.seed(1, 3).await;

    let outcome = h.orchestrator.run_once(None).await;

    assert!(outcome.is_success());
    assert_eq!(outcome.stats.items_processed, 1);
    assert_eq!(outcome.stats.sub_items_processed, 2);
    assert_eq!(
        h.store.item("order-1").await.unwrap().processing_stage,
        ProcessingStage::Completed
    );
    assert_eq!(
        h.store.sub_item("order-1-image-2").await.unwrap().analysis_status,
        AnalysisStatus::Failed
    );
    assert_eq!(
        h.store.sub_item("order-1-image-3").await.unwrap().analysis_status,
        AnalysisStatus::Completed
    );
}

#[tokio::test]
async fn test_transient_failure_is_retried() {
    let faults = FaultInjector::new();
    faults.fail_times("analyze", 1, "Analysis failed: 503 Service Unavailable");
    let h = HarnessBuilder::new().faults(faults).build();
    h.seed(1, 1).await;

    let outcome = h.orchestrator.run_once(None).await;

    assert!(outcome.is_success());
    assert_eq!(outcome.stats.items_processed, 1);
    assert_eq!(outcome.stats.errors, 0);
    assert_eq!(h.faults.hits("analyze"), 1);
}

#[tokio::test]
async fn test_store_outage_while_starting_item_is_recovered() {
    for operation in ["list_sub_items", "set_batch_status"] {
        let faults = FaultInjector::new();
        faults.fail_times(operation, 3, "Database error: 503 Service Unavailable");
        let h = HarnessBuilder::new().faults(faults).build();
        h.seed(1, 1).await;

        let outcome = h.orchestrator.run_once(None).await;

        assert!(outcome.is_success());
        assert_eq!(outcome.stats.items_processed, 1, "{}", operation);
        assert_eq!(outcome.stats.errors, 0);
        assert_eq!(h.faults.hits(operation), 3);
        assert_eq!(
            h.store.item("order-1").await.unwrap().processing_stage,
            ProcessingStage::Completed
        );
        assert_eq!(h.store.batch_status("batch-1").await, Some(BatchStatus::Completed));
    }
}

#[tokio::test]
async fn test_unhealthy_system_aborts_run() {
    let faults = FaultInjector::new();
    for operation in ["ping", "list_objects", "analysis_ping", "embedding_ping"] {
        faults.fail_always(operation, "connection refused");
    }
    let h = HarnessBuilder::new().faults(faults).build();
    h.seed(1, 1).await;

    let outcome = h.orchestrator.run_once(None).await;

    assert!(!outcome.is_success());
    assert_eq!(
        outcome.envelope.metadata_value("error_kind"),
        Some(&serde_json::json!("system_unhealthy"))
    );
    assert_eq!(outcome.health.map(|h| h.status), Some(HealthStatus::Unhealthy));
    assert_eq!(h.store.count_calls("count_pending").await, 0);
    assert_eq!(h.store.count_calls("claim_item").await, 0);

    let alerts = h.orchestrator.monitor().alerts().await;
    assert!(alerts.iter().any(|a| a.severity == Severity::Critical));
}

#[tokio::test]
async fn test_degraded_system_still_runs() {
    let faults = FaultInjector::new();
    faults.fail_always("analysis_ping", "connection refused");
    let h = HarnessBuilder::new().faults(faults).build();
    h.seed(1, 1).await;

    let outcome = h.orchestrator.run_once(None).await;

    assert!(outcome.is_success());
    assert_eq!(outcome.health.map(|h| h.status), Some(HealthStatus::Degraded));
    assert_eq!(outcome.stats.items_processed, 1);
}

#[tokio::test]
async fn test_concurrent_run_is_rejected() {
    let h = slow_harness("image-1", Duration::from_millis(300)).build();
    h.seed(1, 1).await;

    let (first, second) = tokio::join!(h.orchestrator.run_once(None), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.orchestrator.run_once(None).await
    });

    assert!(first.is_success(), "{:?}", first.envelope.error());
    assert!(!second.is_success());
    assert_eq!(second.envelope.error(), Some("run already in progress"));
    assert_eq!(h.store.count_calls("claim_item").await, 1);
}

#[tokio::test]
async fn test_timeout_preserves_partial_stats() {
    let h = slow_harness("image-2", Duration::from_secs(5))
        .run_timeout(Duration::from_millis(200))
        .build();
    h.seed(1, 2).await;

    let outcome = h.orchestrator.run_once(None).await;

    assert!(!outcome.is_success());
    assert_eq!(
        outcome.envelope.metadata_value("error_kind"),
        Some(&serde_json::json!("timeout"))
    );
    assert_eq!(outcome.stats.sub_items_processed, 1);
    assert_eq!(outcome.stats.items_processed, 0);
    assert!(outcome.stats.is_finalized());
    assert!(outcome
        .context
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("timed out")));
}

#[tokio::test]
async fn test_run_targets_single_item() {
    let h = harness();
    h.seed(2, 1).await;

    let outcome = h.orchestrator.run_once(Some("order-2")).await;

    assert!(outcome.is_success());
    assert_eq!(outcome.stats.items_processed, 1);
    assert_eq!(
        h.store.item("order-1").await.unwrap().processing_stage,
        ProcessingStage::Pending
    );
    assert_eq!(
        h.store.item("order-2").await.unwrap().processing_stage,
        ProcessingStage::Completed
    );
}

#[tokio::test]
async fn test_resume_with_claimed_item() {
    let h = harness();
    h.seed(1, 2).await;
    h.store
        .execute(orbit_orchestrator::bridge::DatabaseOp::ClaimItem {
            item_id: "order-1".to_string(),
        })
        .await;

    let mut context = WorkflowContext::new(0, true, chrono::Utc::now()).resume_at(PhaseId::Processing);
    context.active_item = Some(WorkItemRef {
        id: "order-1".to_string(),
        user_id: "user-1".to_string(),
        batch_id: Some("batch-1".to_string()),
    });

    let outcome = h.orchestrator.resume(context).await;

    assert!(outcome.is_success(), "{:?}", outcome.envelope.error());
    assert_eq!(outcome.stats.items_processed, 1);
    assert_eq!(outcome.stats.sub_items_processed, 2);
    assert_eq!(h.store.count_calls("claim_item").await, 1);
    assert_eq!(
        h.store.item("order-1").await.unwrap().processing_stage,
        ProcessingStage::Completed
    );
}

#[tokio::test]
async fn test_execute_recovery() {
    let h = harness();
    h.storage.create_container(BUCKET).await;

    let result = h
        .orchestrator
        .execute_recovery(RecoveryCategory::Storage, "listing timed out")
        .await;
    assert!(result.is_success());
    assert_eq!(result.data().unwrap()["category"], "storage");

    h.faults.fail_always("ping", "connection refused");
    let result = h
        .orchestrator
        .execute_recovery(RecoveryCategory::Database, "connection reset")
        .await;
    assert!(!result.is_success());
    assert!(result.error_or_empty().contains("connection reset"));
}

#[tokio::test]
async fn test_generate_report_after_run() {
    let h = harness();
    h.seed(1, 2).await;

    h.orchestrator.run_once(None).await;
    let report = h.orchestrator.generate_report().await;

    assert_eq!(report.session_id, h.orchestrator.session_id());
    assert_eq!(report.execution_stats.items_processed, 1);
    assert_eq!(report.progress.counters.sub_items_processed, 2);
    assert!(report.progress.completed >= 3);
    assert_eq!(report.config.bucket, BUCKET);
    assert!(report.health.is_some());
    assert!(report.monitor.metrics.contains_key("item.duration_ms"));

    let json = serde_json::to_value(&report).unwrap();
    assert!(json["execution_stats"]["derived"]["success_rate"].is_number());
}

#[tokio::test]
async fn test_ledger_tracks_items() {
    let h = harness();
    h.seed(1, 1).await;

    h.orchestrator.run_once(None).await;

    let ledger = h.orchestrator.ledger();
    let todos = ledger.lock().await.list_todos();
    assert!(!todos.todos.is_empty());
    assert!(todos
        .todos
        .iter()
        .all(|t| t.status == TodoStatus::Completed));
}

#[tokio::test]
async fn test_apply_agent_report() {
    let h = harness();
    h.storage.create_container(BUCKET).await;
    h.orchestrator.run_once(None).await;

    let report = r#"[
        {"tool": "database", "call": {"op": "set_sub_item_status", "sub_item_id": "a", "status": "completed"}, "success": true},
        {"tool": "database", "call": {"op": "set_sub_item_status", "sub_item_id": "b", "status": "completed"}, "success": true},
        {"tool": "database", "call": {"op": "complete_item", "item_id": "order-9"}, "success": true},
        {"tool": "storage", "call": {"op": "verify_exists", "container": "orbit-images", "path": "x.jpg"}, "success": false}
    ]"#;
    let invocations: Vec<ReportedInvocation> = parse_report(report).unwrap();
    assert!(matches!(invocations[3].call, AdapterCall::Storage(_)));

    let delta = h.orchestrator.apply_agent_report(&invocations).await;

    assert_eq!(delta.items_processed, 1);
    assert_eq!(delta.sub_items_processed, 2);
    assert_eq!(delta.errors, 1);

    let report = h.orchestrator.generate_report().await;
    assert_eq!(report.execution_stats.items_processed, 1);
    assert_eq!(report.execution_stats.sub_items_processed, 2);
    assert_eq!(report.execution_stats.errors, 1);
    assert_eq!(report.progress.counters.errors, 1);
}

#[tokio::test]
async fn test_brief_reflects_pending_work() {
    let h = harness();
    h.seed(2, 1).await;

    let brief = h.orchestrator.brief(None).await.unwrap();
    assert!(brief.contains("Pending work items: 2"));

    let brief = h.orchestrator.brief(Some(PhaseId::Finalization)).await.unwrap();
    assert!(brief.contains("Phase 3"));
}
