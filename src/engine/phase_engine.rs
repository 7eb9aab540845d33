//! Phase engine
//!
//! Drives one run through the workflow phases against the collaborators,
//! starting at whatever phase the run state names. Step failures inside a
//! work item are classified; recoverable ones get one category recovery
//! and one re-attempt. A step that still fails costs only its work item:
//! the item is marked failed and the run moves on to `continuation`. Only
//! failures that make further progress impossible abort the run.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use super::clock::Clock;
use super::monitor::{Monitor, Severity};
use super::phase::{transition, PhaseId};
use super::progress::{CounterUpdate, ProgressLedger, TodoStatus};
use super::recovery::{
    classify, ErrorKind, RecoveryCategory, RecoveryManager, StepAdjustments, ERROR_KIND_KEY,
};
use super::result::ResultEnvelope;
use super::retry::RetryingOperationExecutor;
use super::stats::ExecutionStats;
use super::transaction::TransactionCoordinator;
use crate::bridge::{AnalysisRequest, DatabaseOp, EmbedRequest, Services, StorageOp};
use crate::workflow::config::{OrchestratorConfig, SubItemFailurePolicy};
use crate::workflow::model::{
    AnalysisKind, AnalysisStatus, BatchStatus, SubItem, WorkItem, WorkItemRef,
};
use crate::workflow::WorkflowContext;

/// Candidates fetched per discovery pass
const DISCOVERY_BATCH: usize = 10;

/// Progress ledger shared between the engine and its orchestrator
pub type SharedLedger = Arc<Mutex<ProgressLedger>>;

/// Knobs the engine reads from the configuration
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub bucket: String,
    pub link_ttl_secs: u64,
    pub analysis_kind: AnalysisKind,
    pub quality_level: u8,
    pub failure_policy: SubItemFailurePolicy,
    pub verify_outputs: bool,
    pub max_items_per_run: usize,
}

impl EngineSettings {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            bucket: config.storage.bucket.clone(),
            link_ttl_secs: config.storage.link_ttl_secs,
            analysis_kind: config.analysis_kind,
            quality_level: config.quality_level,
            failure_policy: config.sub_item_failure_policy,
            verify_outputs: config.verify_outputs,
            max_items_per_run: config.max_items_per_run,
        }
    }
}

/// Mutable state of one run
///
/// Lives behind a lock owned by the orchestrator, so that whatever the
/// engine recorded survives a run timeout.
#[derive(Debug, Clone)]
pub struct RunState {
    pub context: WorkflowContext,
    pub stats: ExecutionStats,
    /// Process only this work item, then stop
    pub target_item: Option<String>,
    /// Work items claimed so far
    pub items_attempted: usize,
    /// Pending sub-items of the active item, once loaded
    sub_items: Option<Vec<SubItem>>,
    item_todo: Option<u64>,
    item_started: Option<DateTime<Utc>>,
}

impl RunState {
    pub fn new(context: WorkflowContext, started_at: DateTime<Utc>) -> Self {
        Self {
            context,
            stats: ExecutionStats::new(started_at),
            target_item: None,
            items_attempted: 0,
            sub_items: None,
            item_todo: None,
            item_started: None,
        }
    }

    pub fn with_target(mut self, item_id: impl Into<String>) -> Self {
        self.target_item = Some(item_id.into());
        self
    }
}

#[derive(Debug)]
enum PhaseOutcome {
    /// Success criterion met, follow the transition function
    Advance,
    /// The active item was marked failed, continue at `continuation`
    ItemAbandoned,
    /// Nothing left to do
    Finish,
    /// The run cannot continue
    Abort(ResultEnvelope),
}

/// A step that failed for good
#[derive(Debug, Clone)]
struct StepFailure {
    step: &'static str,
    kind: ErrorKind,
    error: String,
}

impl StepFailure {
    fn new(step: &'static str, kind: ErrorKind, error: impl Into<String>) -> Self {
        Self {
            step,
            kind,
            error: error.into(),
        }
    }

    fn from_envelope(step: &'static str, envelope: &ResultEnvelope) -> Self {
        Self::new(step, classify(envelope), envelope.error_or_empty())
    }

    fn describe(&self) -> String {
        format!("{} failed ({}): {}", self.step, self.kind.as_str(), self.error)
    }
}

/// Pending count carried by a `count_pending` result
pub fn pending_count(envelope: &ResultEnvelope) -> Option<u64> {
    let count = envelope.rows().first()?.get("count")?;
    count
        .as_u64()
        .or_else(|| count.as_str().and_then(|s| s.parse().ok()))
}

fn parse_rows<T: DeserializeOwned>(step: &'static str, envelope: &ResultEnvelope) -> Result<Vec<T>, StepFailure> {
    envelope
        .rows()
        .iter()
        .map(|row| serde_json::from_value(row.clone()))
        .collect::<Result<Vec<T>, _>>()
        .map_err(|e| StepFailure::new(step, ErrorKind::DataIntegrity, format!("Malformed row: {}", e)))
}

/// Turn a successful `verify_exists` result reporting a missing object into
/// a failure of `kind`
fn require_object(result: ResultEnvelope, missing: String, kind: ErrorKind) -> ResultEnvelope {
    if !result.is_success() {
        return result;
    }
    let exists = result
        .data()
        .and_then(|d| d.get("exists"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if exists {
        result
    } else {
        ResultEnvelope::failure(missing).with_metadata(ERROR_KIND_KEY, kind.as_str())
    }
}

fn string_field(envelope: &ResultEnvelope, field: &str) -> Option<String> {
    envelope
        .data()
        .and_then(|d| d.get(field))
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[derive(Debug, Clone)]
pub struct PhaseEngine {
    services: Services,
    executor: RetryingOperationExecutor,
    transactions: TransactionCoordinator,
    recovery: RecoveryManager,
    ledger: SharedLedger,
    monitor: Monitor,
    clock: Arc<dyn Clock>,
    settings: EngineSettings,
}

impl PhaseEngine {
    pub fn new(
        services: Services,
        executor: RetryingOperationExecutor,
        recovery: RecoveryManager,
        ledger: SharedLedger,
        monitor: Monitor,
        clock: Arc<dyn Clock>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            transactions: TransactionCoordinator::new(executor.clone()),
            services,
            executor,
            recovery,
            ledger,
            monitor,
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Run phases from `context.current_phase` until the chain ends or the
    /// run aborts
    #[instrument(skip(self, state))]
    pub async fn drive(&self, state: &RwLock<RunState>) -> ResultEnvelope {
        let mut phase = {
            let run = state.read().await;
            let phase = run.context.current_phase;
            let needs_item = matches!(phase, PhaseId::Processing | PhaseId::Finalization);
            if needs_item && run.context.active_item.is_none() {
                warn!(phase = %phase, "No active work item to resume with, starting at discovery");
                PhaseId::Discovery
            } else {
                phase
            }
        };

        loop {
            state.write().await.context.current_phase = phase;
            debug!(phase = %phase, "Entering phase");

            let next = match self.run_phase(phase, state).await {
                PhaseOutcome::Advance => {
                    self.complete_phase(state, phase).await;
                    let run = state.read().await;
                    self.successor(phase, &run)
                }
                PhaseOutcome::ItemAbandoned => Some(PhaseId::Continuation),
                PhaseOutcome::Finish => {
                    self.complete_phase(state, phase).await;
                    None
                }
                PhaseOutcome::Abort(failure) => {
                    state
                        .write()
                        .await
                        .context
                        .record_error(failure.error_or_empty());
                    return failure.with_metadata("phase", phase.as_str());
                }
            };

            match next {
                Some(next) => phase = next,
                None => break,
            }
        }

        let run = state.read().await;
        info!(
            items = run.stats.items_processed,
            sub_items = run.stats.sub_items_processed,
            errors = run.stats.errors,
            "Workflow phases finished"
        );
        ResultEnvelope::ok(json!({
            "items_processed": run.stats.items_processed,
            "sub_items_processed": run.stats.sub_items_processed,
            "errors": run.stats.errors,
            "phases_completed": run.context.completed_phases,
        }))
    }

    async fn run_phase(&self, phase: PhaseId, state: &RwLock<RunState>) -> PhaseOutcome {
        match phase {
            PhaseId::Initialization => self.initialize(state).await,
            PhaseId::Discovery => self.discover(state).await,
            PhaseId::Processing => self.process(state).await,
            PhaseId::Finalization => self.finalize(state).await,
            PhaseId::Continuation => self.reevaluate(state).await,
        }
    }

    fn successor(&self, phase: PhaseId, run: &RunState) -> Option<PhaseId> {
        if phase == PhaseId::Continuation {
            if run.target_item.is_some() {
                return None;
            }
            if run.items_attempted >= self.settings.max_items_per_run {
                info!(
                    limit = self.settings.max_items_per_run,
                    pending = run.context.pending_count,
                    "Item limit reached, ending run"
                );
                return None;
            }
        }
        transition(phase, &run.context)
    }

    async fn complete_phase(&self, state: &RwLock<RunState>, phase: PhaseId) {
        let mut run = state.write().await;
        run.context.record_completed(phase);
        run.stats.record_phase(phase);
    }

    async fn initialize(&self, state: &RwLock<RunState>) -> PhaseOutcome {
        let started_at = state.read().await.stats.started_at;
        let todo = {
            let mut ledger = self.ledger.lock().await;
            ledger.update_stats(CounterUpdate {
                started_at: Some(started_at),
                ..Default::default()
            });
            ledger
                .add_todo("Pre-flight validation", TodoStatus::InProgress)
                .id
        };

        let ping = self
            .executor
            .database(self.services.store.as_ref(), DatabaseOp::Ping)
            .await;
        if !ping.is_success() {
            let message = format!("Relational store unreachable: {}", ping.error_or_empty());
            return self.abort_preflight(todo, message).await;
        }

        let listing = self
            .executor
            .storage(
                self.services.storage.as_ref(),
                StorageOp::ListObjects {
                    container: self.settings.bucket.clone(),
                    prefix: String::new(),
                    extension: None,
                },
            )
            .await;
        if !listing.is_success() {
            let message = format!(
                "Storage container {} unreachable: {}",
                self.settings.bucket,
                listing.error_or_empty()
            );
            return self.abort_preflight(todo, message).await;
        }

        state.write().await.context.storage_accessible = true;
        self.set_todo(todo, TodoStatus::Completed).await;
        PhaseOutcome::Advance
    }

    async fn abort_preflight(&self, todo: u64, message: String) -> PhaseOutcome {
        self.set_todo(todo, TodoStatus::Failed).await;
        self.monitor.alert(Severity::Critical, message.clone()).await;
        PhaseOutcome::Abort(
            ResultEnvelope::failure(message).with_metadata(ERROR_KIND_KEY, "system_unhealthy"),
        )
    }

    async fn discover(&self, state: &RwLock<RunState>) -> PhaseOutcome {
        let target = state.read().await.target_item.clone();
        let store = self.services.store.as_ref();

        let lookup = match &target {
            Some(item_id) => {
                self.executor
                    .database(
                        store,
                        DatabaseOp::FetchItem {
                            item_id: item_id.clone(),
                        },
                    )
                    .await
            }
            None => {
                self.executor
                    .database(
                        store,
                        DatabaseOp::ListPending {
                            limit: DISCOVERY_BATCH,
                        },
                    )
                    .await
            }
        };
        if !lookup.is_success() {
            return PhaseOutcome::Abort(ResultEnvelope::failure(format!(
                "Failed to look up pending work items: {}",
                lookup.error_or_empty()
            )));
        }
        let candidates: Vec<WorkItem> = match parse_rows("discover", &lookup) {
            Ok(candidates) => candidates,
            Err(failure) => return PhaseOutcome::Abort(ResultEnvelope::failure(failure.describe())),
        };

        for candidate in candidates {
            if !candidate.is_claimable() {
                debug!(item_id = %candidate.id, "Skipping unclaimable work item");
                continue;
            }
            let claim = self
                .executor
                .database(
                    store,
                    DatabaseOp::ClaimItem {
                        item_id: candidate.id.clone(),
                    },
                )
                .await;
            if !claim.is_success() {
                return PhaseOutcome::Abort(ResultEnvelope::failure(format!(
                    "Failed to claim work item {}: {}",
                    candidate.id,
                    claim.error_or_empty()
                )));
            }
            if claim.rows().is_empty() {
                debug!(item_id = %candidate.id, "Work item already taken, skipping");
                continue;
            }
            return self.begin_item(state, candidate).await;
        }

        match target {
            Some(item_id) => PhaseOutcome::Abort(
                ResultEnvelope::failure(format!(
                    "Work item {} is not pending or was claimed by another run",
                    item_id
                ))
                .with_metadata(ERROR_KIND_KEY, "permanent_remote"),
            ),
            None => {
                info!("No claimable work items left");
                state.write().await.context.pending_count = 0;
                PhaseOutcome::Finish
            }
        }
    }

    async fn begin_item(&self, state: &RwLock<RunState>, item: WorkItem) -> PhaseOutcome {
        info!(item_id = %item.id, user_id = %item.user_id, "Claimed work item");
        let started = self.clock.now().await;
        let todo = self
            .ledger
            .lock()
            .await
            .add_todo(format!("Process work item {}", item.id), TodoStatus::InProgress)
            .id;
        let reference = item.reference();
        {
            let mut run = state.write().await;
            run.context.active_item = Some(reference.clone());
            run.items_attempted += 1;
            run.sub_items = None;
            run.item_todo = Some(todo);
            run.item_started = Some(started);
        }

        if let Some(batch_id) = &item.batch_id {
            let mut adjustments = self.initial_adjustments();
            let marked = self
                .attempt("mark_batch_processing", RecoveryCategory::Database, &mut adjustments, move |_| {
                    self.set_batch_status(batch_id, BatchStatus::Processing)
                })
                .await;
            if let Err(failure) = marked {
                return self.abandon_item(state, &reference, failure).await;
            }
        }

        match self.pending_sub_items(&item.id).await {
            Ok(sub_items) => {
                info!(item_id = %item.id, count = sub_items.len(), "Discovered pending sub-items");
                state.write().await.sub_items = Some(sub_items);
                PhaseOutcome::Advance
            }
            Err(failure) => self.abandon_item(state, &reference, failure).await,
        }
    }

    async fn list_sub_items(&self, item_id: &str) -> ResultEnvelope {
        self.executor
            .database(
                self.services.store.as_ref(),
                DatabaseOp::ListSubItems {
                    item_id: item_id.to_string(),
                },
            )
            .await
    }

    async fn pending_sub_items(&self, item_id: &str) -> Result<Vec<SubItem>, StepFailure> {
        let mut adjustments = self.initial_adjustments();
        let listed = self
            .attempt("list_sub_items", RecoveryCategory::Database, &mut adjustments, move |_| {
                self.list_sub_items(item_id)
            })
            .await?;
        let mut sub_items: Vec<SubItem> = parse_rows("list_sub_items", &listed)?;
        sub_items.retain(|s| s.analysis_status == AnalysisStatus::Pending);
        Ok(sub_items)
    }

    async fn process(&self, state: &RwLock<RunState>) -> PhaseOutcome {
        let (active, loaded) = {
            let run = state.read().await;
            (run.context.active_item.clone(), run.sub_items.clone())
        };
        let Some(item) = active else {
            return PhaseOutcome::Abort(ResultEnvelope::failure(
                "No active work item to process",
            ));
        };
        let sub_items = match loaded {
            Some(sub_items) => sub_items,
            None => match self.pending_sub_items(&item.id).await {
                Ok(sub_items) => sub_items,
                Err(failure) => return self.abandon_item(state, &item, failure).await,
            },
        };

        for sub_item in sub_items {
            let todo = self
                .ledger
                .lock()
                .await
                .add_todo(format!("Process sub-item {}", sub_item.id), TodoStatus::InProgress)
                .id;

            match self.process_sub_item(&sub_item).await {
                Ok(()) => {
                    self.set_todo(todo, TodoStatus::Completed).await;
                    state.write().await.stats.sub_items_processed += 1;
                    self.sync_counters(state).await;
                    debug!(sub_item_id = %sub_item.id, "Sub-item completed");
                }
                Err(failure) => {
                    self.set_todo(todo, TodoStatus::Failed).await;
                    self.record_failure(state, &failure).await;
                    self.mark_sub_item(&sub_item.id, AnalysisStatus::Failed).await;
                    match self.settings.failure_policy {
                        SubItemFailurePolicy::FailItem => {
                            return self.fail_item(state, &item, failure.describe()).await;
                        }
                        SubItemFailurePolicy::AllowPartial => {
                            warn!(
                                sub_item_id = %sub_item.id,
                                "Sub-item failed, continuing with the others: {}",
                                failure.describe()
                            );
                        }
                    }
                }
            }
        }

        state.write().await.sub_items = Some(Vec::new());
        PhaseOutcome::Advance
    }

    /// verify original → access link → analyze → store analysis →
    /// embed (and verify output) → record result
    async fn process_sub_item(&self, sub_item: &SubItem) -> Result<(), StepFailure> {
        let store = self.services.store.as_ref();
        let storage = self.services.storage.as_ref();
        let analysis = self.services.analysis.as_ref();
        let embedding = self.services.embedding.as_ref();
        let executor = &self.executor;
        let bucket = self.settings.bucket.as_str();
        let ttl_secs = self.settings.link_ttl_secs;
        let verify_outputs = self.settings.verify_outputs;
        let source = sub_item.original_path.as_str();
        let sub_item_id = sub_item.id.as_str();
        let output = sub_item.output_path();
        let output = output.as_str();
        let mut adjustments = self.initial_adjustments();

        self.attempt("verify_original", RecoveryCategory::Storage, &mut adjustments, move |_| async move {
            let result = executor
                .storage(
                    storage,
                    StorageOp::VerifyExists {
                        container: bucket.to_string(),
                        path: source.to_string(),
                    },
                )
                .await;
            require_object(
                result,
                format!("Original object {} not found", source),
                ErrorKind::PermanentRemote,
            )
        })
        .await?;

        let link = self
            .attempt("create_access_link", RecoveryCategory::Storage, &mut adjustments, move |_| {
                executor.storage(
                    storage,
                    StorageOp::CreateAccessLink {
                        container: bucket.to_string(),
                        path: source.to_string(),
                        ttl_secs,
                    },
                )
            })
            .await?;
        let url = string_field(&link, "signed_url").ok_or_else(|| {
            StepFailure::new(
                "create_access_link",
                ErrorKind::DataIntegrity,
                "Access link response carried no signed_url",
            )
        })?;
        let url = url.as_str();

        let kind = sub_item.analysis_kind.unwrap_or(self.settings.analysis_kind);
        let analyzed = self
            .attempt("analyze", RecoveryCategory::Analysis, &mut adjustments, move |_| {
                analysis.analyze(AnalysisRequest {
                    url: url.to_string(),
                    kind,
                })
            })
            .await?;
        let payload = analyzed.into_data().unwrap_or(Value::Null);
        let payload = &payload;

        self.attempt("store_analysis", RecoveryCategory::Database, &mut adjustments, move |_| {
            executor.database(
                store,
                DatabaseOp::StoreAnalysis {
                    sub_item_id: sub_item_id.to_string(),
                    analysis: payload.clone(),
                },
            )
        })
        .await?;

        let metadata: Map<String, Value> = payload
            .get("metadata")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let metadata = &metadata;

        let embedded = self
            .attempt("embed", RecoveryCategory::Embedding, &mut adjustments, move |adjust: StepAdjustments| async move {
                let result = embedding
                    .embed(EmbedRequest {
                        source_path: source.to_string(),
                        output_path: output.to_string(),
                        metadata: metadata.clone(),
                        quality_level: adjust.quality_level,
                    })
                    .await;
                if !result.is_success() || !verify_outputs {
                    return result;
                }
                let check = executor
                    .storage(
                        storage,
                        StorageOp::VerifyExists {
                            container: bucket.to_string(),
                            path: output.to_string(),
                        },
                    )
                    .await;
                let check = require_object(
                    check,
                    format!("Processed file missing after embedding: {}", output),
                    ErrorKind::DataIntegrity,
                );
                if check.is_success() {
                    result
                } else {
                    check
                }
            })
            .await?;
        let processed_path = string_field(&embedded, "processed_path").unwrap_or_else(|| output.to_string());
        let processed_path = processed_path.as_str();

        self.attempt("record_result", RecoveryCategory::Database, &mut adjustments, move |_| async move {
            let recorded = executor
                .database(
                    store,
                    DatabaseOp::SetProcessedPath {
                        sub_item_id: sub_item_id.to_string(),
                        processed_path: processed_path.to_string(),
                    },
                )
                .await;
            if !recorded.is_success() {
                return recorded;
            }
            executor
                .database(
                    store,
                    DatabaseOp::SetSubItemStatus {
                        sub_item_id: sub_item_id.to_string(),
                        status: AnalysisStatus::Completed,
                    },
                )
                .await
        })
        .await?;

        Ok(())
    }

    /// Run one step; on a recoverable failure run the category recovery
    /// and re-attempt the step once with the adjusted parameters
    async fn attempt<F, Fut>(
        &self,
        step: &'static str,
        category: RecoveryCategory,
        adjustments: &mut StepAdjustments,
        mut operation: F,
    ) -> Result<ResultEnvelope, StepFailure>
    where
        F: FnMut(StepAdjustments) -> Fut,
        Fut: Future<Output = ResultEnvelope>,
    {
        let first = self.timed(step, operation(*adjustments)).await;
        if first.is_success() {
            return Ok(first);
        }

        let kind = classify(&first);
        if !kind.is_recoverable() {
            return Err(StepFailure::new(step, kind, first.error_or_empty()));
        }

        warn!(
            step,
            category = %category,
            kind = kind.as_str(),
            "Step failed, running recovery: {}",
            first.error_or_empty()
        );
        let recovery = self
            .recovery
            .recover(category, first.error_or_empty(), *adjustments)
            .await;
        if !recovery.is_success() {
            return Err(StepFailure::new(
                step,
                kind,
                format!(
                    "{} (recovery failed: {})",
                    first.error_or_empty(),
                    recovery.envelope.error_or_empty()
                ),
            ));
        }
        *adjustments = recovery.adjustments;

        let second = self.timed(step, operation(*adjustments)).await;
        if second.is_success() {
            info!(step, "Step succeeded after recovery");
            Ok(second)
        } else {
            Err(StepFailure::from_envelope(step, &second))
        }
    }

    async fn timed<Fut>(&self, step: &str, future: Fut) -> ResultEnvelope
    where
        Fut: Future<Output = ResultEnvelope>,
    {
        let started = self.clock.now().await;
        let result = future.await;
        let elapsed = self.clock.now().await - started;
        self.monitor
            .record_metric(
                format!("step.{}.duration_ms", step),
                elapsed.num_milliseconds().max(0) as f64,
                "ms",
            )
            .await;
        result
    }

    async fn finalize(&self, state: &RwLock<RunState>) -> PhaseOutcome {
        let active = state.read().await.context.active_item.clone();
        let Some(item) = active else {
            return PhaseOutcome::Abort(ResultEnvelope::failure(
                "No active work item to finalize",
            ));
        };

        let item_id = item.id.as_str();
        let mut adjustments = self.initial_adjustments();
        let verified = self
            .attempt("verify_sub_items", RecoveryCategory::Database, &mut adjustments, move |_| {
                self.verify_sub_items(item_id)
            })
            .await;
        if let Err(failure) = verified {
            return self.abandon_item(state, &item, failure).await;
        }

        let mut ops = vec![DatabaseOp::CompleteItem {
            item_id: item.id.clone(),
        }];
        if let Some(batch_id) = &item.batch_id {
            ops.push(DatabaseOp::SetBatchStatus {
                batch_id: batch_id.clone(),
                status: BatchStatus::Completed,
            });
        }
        ops.push(DatabaseOp::EnqueueNotification {
            item_id: item.id.clone(),
            user_id: item.user_id.clone(),
        });

        let store = self.services.store.as_ref();
        let transactions = &self.transactions;
        let ops = &ops;
        let committed = self
            .attempt("complete_item", RecoveryCategory::Database, &mut adjustments, move |_| {
                transactions.execute(store, ops.clone())
            })
            .await;
        if let Err(failure) = committed {
            return self.abandon_item(state, &item, failure).await;
        }

        state.write().await.stats.items_processed += 1;
        self.sync_counters(state).await;
        self.finish_item(state, TodoStatus::Completed).await;
        info!(item_id = %item.id, "Work item completed, notification enqueued");
        PhaseOutcome::Advance
    }

    /// Every sub-item of the item must be settled under the failure policy
    async fn verify_sub_items(&self, item_id: &str) -> ResultEnvelope {
        let listed = self.list_sub_items(item_id).await;
        if !listed.is_success() {
            return listed;
        }
        let sub_items: Vec<SubItem> = match parse_rows("verify_sub_items", &listed) {
            Ok(sub_items) => sub_items,
            Err(failure) => {
                return ResultEnvelope::failure(failure.error)
                    .with_metadata(ERROR_KIND_KEY, failure.kind.as_str())
            }
        };
        let unsettled: Vec<&str> = sub_items
            .iter()
            .filter(|s| !self.is_settled(s))
            .map(|s| s.id.as_str())
            .collect();
        if unsettled.is_empty() {
            return listed;
        }
        ResultEnvelope::failure(format!("Sub-items not completed: {}", unsettled.join(", ")))
            .with_metadata(ERROR_KIND_KEY, ErrorKind::DataIntegrity.as_str())
    }

    fn is_settled(&self, sub_item: &SubItem) -> bool {
        match self.settings.failure_policy {
            SubItemFailurePolicy::FailItem => sub_item.analysis_status == AnalysisStatus::Completed,
            SubItemFailurePolicy::AllowPartial => sub_item.analysis_status != AnalysisStatus::Pending,
        }
    }

    async fn reevaluate(&self, state: &RwLock<RunState>) -> PhaseOutcome {
        let counted = self
            .executor
            .database(self.services.store.as_ref(), DatabaseOp::CountPending)
            .await;
        if !counted.is_success() {
            return PhaseOutcome::Abort(ResultEnvelope::failure(format!(
                "Failed to count pending work items: {}",
                counted.error_or_empty()
            )));
        }
        let pending = pending_count(&counted).unwrap_or(0);
        state.write().await.context.pending_count = pending;
        info!(pending, "Pending work items re-counted");
        PhaseOutcome::Advance
    }

    async fn abandon_item(
        &self,
        state: &RwLock<RunState>,
        item: &WorkItemRef,
        failure: StepFailure,
    ) -> PhaseOutcome {
        self.record_failure(state, &failure).await;
        self.fail_item(state, item, failure.describe()).await
    }

    /// Mark the item (and its batch) failed and release it
    async fn fail_item(&self, state: &RwLock<RunState>, item: &WorkItemRef, reason: String) -> PhaseOutcome {
        let failed = self
            .executor
            .database(
                self.services.store.as_ref(),
                DatabaseOp::FailItem {
                    item_id: item.id.clone(),
                    reason: reason.clone(),
                },
            )
            .await;
        if !failed.is_success() {
            warn!(item_id = %item.id, "Could not mark work item failed: {}", failed.error_or_empty());
        }
        if let Some(batch_id) = &item.batch_id {
            let marked = self.set_batch_status(batch_id, BatchStatus::Failed).await;
            if !marked.is_success() {
                warn!(batch_id = %batch_id, "Could not mark batch failed: {}", marked.error_or_empty());
            }
        }

        self.monitor
            .alert(
                Severity::Warning,
                format!("Work item {} failed: {}", item.id, reason),
            )
            .await;
        self.finish_item(state, TodoStatus::Failed).await;
        PhaseOutcome::ItemAbandoned
    }

    async fn finish_item(&self, state: &RwLock<RunState>, status: TodoStatus) {
        let now = self.clock.now().await;
        let (todo, started) = {
            let mut run = state.write().await;
            run.context.active_item = None;
            run.sub_items = None;
            (run.item_todo.take(), run.item_started.take())
        };
        if let Some(todo) = todo {
            self.set_todo(todo, status).await;
        }
        if let Some(started) = started {
            let elapsed = (now - started).num_milliseconds().max(0) as f64;
            self.monitor.record_metric("item.duration_ms", elapsed, "ms").await;
        }
    }

    async fn record_failure(&self, state: &RwLock<RunState>, failure: &StepFailure) {
        let description = failure.describe();
        warn!("{}", description);
        {
            let mut run = state.write().await;
            run.stats.errors += 1;
            run.context.record_error(description);
        }
        self.sync_counters(state).await;
    }

    async fn mark_sub_item(&self, sub_item_id: &str, status: AnalysisStatus) {
        let marked = self
            .executor
            .database(
                self.services.store.as_ref(),
                DatabaseOp::SetSubItemStatus {
                    sub_item_id: sub_item_id.to_string(),
                    status,
                },
            )
            .await;
        if !marked.is_success() {
            warn!(sub_item_id, "Could not update sub-item status: {}", marked.error_or_empty());
        }
    }

    async fn set_batch_status(&self, batch_id: &str, status: BatchStatus) -> ResultEnvelope {
        self.executor
            .database(
                self.services.store.as_ref(),
                DatabaseOp::SetBatchStatus {
                    batch_id: batch_id.to_string(),
                    status,
                },
            )
            .await
    }

    fn initial_adjustments(&self) -> StepAdjustments {
        StepAdjustments {
            quality_level: self.settings.quality_level,
        }
    }

    async fn set_todo(&self, id: u64, status: TodoStatus) {
        if let Err(e) = self.ledger.lock().await.update_todo(id, status) {
            warn!("Progress ledger update failed: {}", e);
        }
    }

    async fn sync_counters(&self, state: &RwLock<RunState>) {
        let update = {
            let run = state.read().await;
            CounterUpdate {
                started_at: None,
                items_processed: Some(run.stats.items_processed),
                sub_items_processed: Some(run.stats.sub_items_processed),
                errors: Some(run.stats.errors),
            }
        };
        self.ledger.lock().await.update_stats(update);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::memory::seed;
    use crate::bridge::{
        FaultInjector, InMemoryStorage, InMemoryStore, MockAnalysisService, MockEmbeddingService,
        RelationalStore,
    };
    use crate::engine::clock::MockClock;
    use crate::workflow::config::RetryConfig;
    use crate::workflow::model::ProcessingStage;

    const BUCKET: &str = "orbit-images";

    struct Fixture {
        store: InMemoryStore,
        storage: InMemoryStorage,
        ledger: SharedLedger,
        engine: PhaseEngine,
    }

    fn fixture(max_items: usize) -> Fixture {
        let store = InMemoryStore::new();
        let storage = InMemoryStorage::new();
        let services = Services::new(
            Arc::new(store.clone()),
            Arc::new(storage.clone()),
            Arc::new(MockAnalysisService::new()),
            Arc::new(MockEmbeddingService::new().with_output(storage.clone(), BUCKET)),
        );
        let clock: Arc<dyn Clock> = Arc::new(MockClock::new());
        let executor = RetryingOperationExecutor::new(clock.clone(), RetryConfig::default());
        let monitor = Monitor::new();
        let recovery = RecoveryManager::new(
            services.clone(),
            executor.clone(),
            clock.clone(),
            monitor.clone(),
            BUCKET,
        );
        let ledger: SharedLedger = Arc::new(Mutex::new(ProgressLedger::new()));
        let mut config = OrchestratorConfig::default();
        config.max_items_per_run = max_items;
        let engine = PhaseEngine::new(
            services,
            executor,
            recovery,
            ledger.clone(),
            monitor,
            clock,
            EngineSettings::from_config(&config),
        );
        Fixture {
            store,
            storage,
            ledger,
            engine,
        }
    }

    #[tokio::test]
    async fn test_claimed_items_are_skipped() {
        let fx = fixture(10);
        seed(&fx.store, &fx.storage, BUCKET, 2, 1).await;
        // another run holds order-1
        fx.store
            .execute(DatabaseOp::ClaimItem {
                item_id: "order-1".to_string(),
            })
            .await;

        let state = RwLock::new(RunState::new(WorkflowContext::new(1, true, Utc::now()), Utc::now()));
        let result = fx.engine.drive(&state).await;
        assert!(result.is_success(), "{:?}", result.error());

        let order1 = fx.store.item("order-1").await.unwrap();
        let order2 = fx.store.item("order-2").await.unwrap();
        assert_eq!(order1.processing_stage, ProcessingStage::Processing);
        assert_eq!(order2.processing_stage, ProcessingStage::Completed);
        assert_eq!(state.read().await.stats.items_processed, 1);
    }

    #[tokio::test]
    async fn test_resume_at_continuation() {
        let fx = fixture(10);
        let state = RwLock::new(RunState::new(
            WorkflowContext::new(0, true, Utc::now()).resume_at(PhaseId::Continuation),
            Utc::now(),
        ));

        let result = fx.engine.drive(&state).await;
        assert!(result.is_success());

        let run = state.read().await;
        assert_eq!(run.context.completed_phases, vec![PhaseId::Continuation]);
        assert_eq!(fx.store.count_calls("ping").await, 0);
        assert_eq!(fx.store.count_calls("count_pending").await, 1);
    }

    #[tokio::test]
    async fn test_resume_without_active_item_starts_at_discovery() {
        let fx = fixture(10);
        seed(&fx.store, &fx.storage, BUCKET, 1, 1).await;

        for phase in [PhaseId::Processing, PhaseId::Finalization] {
            let state = RwLock::new(RunState::new(
                WorkflowContext::new(1, true, Utc::now()).resume_at(phase),
                Utc::now(),
            ));
            let result = fx.engine.drive(&state).await;
            assert!(result.is_success(), "{}: {:?}", phase, result.error());
            assert_eq!(
                state.read().await.context.completed_phases.first(),
                Some(&PhaseId::Discovery)
            );
        }

        let order = fx.store.item("order-1").await.unwrap();
        assert_eq!(order.processing_stage, ProcessingStage::Completed);
        assert_eq!(fx.store.count_calls("claim_item").await, 1);
    }

    #[tokio::test]
    async fn test_store_errors_outside_sub_items_are_recovered() {
        for operation in ["set_batch_status", "list_sub_items"] {
            let fx = fixture(10);
            seed(&fx.store, &fx.storage, BUCKET, 1, 1).await;
            let faults = FaultInjector::new();
            // outlasts the executor's three attempts
            faults.fail_times(operation, 3, "Database error: 503 Service Unavailable");
            let store = fx.store.clone().with_faults(faults.clone());
            let engine = PhaseEngine {
                services: Services {
                    store: Arc::new(store),
                    ..fx.engine.services.clone()
                },
                ..fx.engine.clone()
            };

            let state = RwLock::new(RunState::new(WorkflowContext::new(1, true, Utc::now()), Utc::now()));
            assert!(engine.drive(&state).await.is_success());

            let order = fx.store.item("order-1").await.unwrap();
            assert_eq!(order.processing_stage, ProcessingStage::Completed, "{}", operation);
            assert_eq!(faults.hits(operation), 3);
            assert_eq!(state.read().await.stats.errors, 0);
            assert_eq!(state.read().await.stats.items_processed, 1);
        }
    }

    #[tokio::test]
    async fn test_unsettled_sub_items_fail_item_after_recovery() {
        let fx = fixture(10);
        seed(&fx.store, &fx.storage, BUCKET, 1, 2).await;
        fx.store
            .execute(DatabaseOp::ClaimItem {
                item_id: "order-1".to_string(),
            })
            .await;
        let item = fx.store.item("order-1").await.unwrap();

        let mut context = WorkflowContext::new(1, true, Utc::now()).resume_at(PhaseId::Finalization);
        context.active_item = Some(item.reference());
        let state = RwLock::new(RunState::new(context, Utc::now()).with_target("order-1"));
        assert!(fx.engine.drive(&state).await.is_success());

        let order = fx.store.item("order-1").await.unwrap();
        assert_eq!(order.processing_stage, ProcessingStage::Failed);
        let reason = fx.store.failure_reason("order-1").await.unwrap();
        assert!(reason.contains("verify_sub_items failed (data_integrity)"), "{}", reason);
        // verification ran, then once more after the store recovery
        assert_eq!(fx.store.count_calls("list_sub_items").await, 2);
        assert_eq!(fx.store.count_calls("ping").await, 1);
    }

    #[tokio::test]
    async fn test_item_limit_ends_run() {
        let fx = fixture(1);
        seed(&fx.store, &fx.storage, BUCKET, 3, 1).await;

        let state = RwLock::new(RunState::new(WorkflowContext::new(3, true, Utc::now()), Utc::now()));
        assert!(fx.engine.drive(&state).await.is_success());

        let run = state.read().await;
        assert_eq!(run.items_attempted, 1);
        assert_eq!(run.context.pending_count, 2);
        assert_eq!(fx.store.count_calls("claim_item").await, 1);
    }

    #[tokio::test]
    async fn test_missing_original_fails_item_without_recovery() {
        let fx = fixture(10);
        seed(&fx.store, &fx.storage, BUCKET, 1, 1).await;
        fx.storage
            .remove_object(BUCKET, "user-1/order-1/image-1.jpg")
            .await;

        let state = RwLock::new(RunState::new(WorkflowContext::new(1, true, Utc::now()), Utc::now()));
        assert!(fx.engine.drive(&state).await.is_success());

        let order = fx.store.item("order-1").await.unwrap();
        assert_eq!(order.processing_stage, ProcessingStage::Failed);
        let reason = fx.store.failure_reason("order-1").await.unwrap();
        assert!(reason.contains("verify_original failed (permanent_remote)"));
        // permanent failures skip recovery, so storage was never re-listed
        let listings = fx
            .storage
            .calls()
            .await
            .into_iter()
            .filter(|op| op.name() == "list_objects")
            .count();
        assert_eq!(listings, 1);
        assert_eq!(state.read().await.stats.errors, 1);
    }

    #[tokio::test]
    async fn test_ledger_tracks_items_and_sub_items() {
        let fx = fixture(10);
        seed(&fx.store, &fx.storage, BUCKET, 1, 2).await;

        let state = RwLock::new(RunState::new(WorkflowContext::new(1, true, Utc::now()), Utc::now()));
        assert!(fx.engine.drive(&state).await.is_success());

        let ledger = fx.ledger.lock().await;
        let progress = ledger.get_progress();
        // pre-flight + item + 2 sub-items
        assert_eq!(progress.total, 4);
        assert_eq!(progress.completed, 4);
        assert_eq!(progress.counters.items_processed, 1);
        assert_eq!(progress.counters.sub_items_processed, 2);
    }

    #[tokio::test]
    async fn test_store_outage_aborts_run() {
        let fx = fixture(10);
        let faults = FaultInjector::new();
        faults.fail_always("ping", "Database error: 503 Service Unavailable");
        let store = fx.store.clone().with_faults(faults);
        let engine = PhaseEngine {
            services: Services {
                store: Arc::new(store),
                ..fx.engine.services.clone()
            },
            ..fx.engine.clone()
        };

        let state = RwLock::new(RunState::new(WorkflowContext::new(1, true, Utc::now()), Utc::now()));
        let result = engine.drive(&state).await;

        assert!(!result.is_success());
        assert_eq!(
            result.metadata_value(ERROR_KIND_KEY),
            Some(&json!("system_unhealthy"))
        );
        assert!(state.read().await.context.last_error.is_some());
    }
}
