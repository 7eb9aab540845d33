//! Workflow orchestrator
//!
//! Composes the health gate, the context builder and the phase engine into
//! one run, and exposes the administrative entry points (standalone
//! recovery, health, agent brief, reporting).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::agent::{AgentBrief, ReportDelta, ReportedInvocation};
use super::error::OrchestratorError;
use super::health::{HealthAggregator, HealthReport, HealthStatus};
use super::clock::{Clock, SystemClock};
use super::monitor::{Monitor, MonitorSummary, Severity};
use super::phase::PhaseId;
use super::phase_engine::{pending_count, EngineSettings, PhaseEngine, RunState, SharedLedger};
use super::progress::{CounterUpdate, Progress, ProgressLedger};
use super::recovery::{RecoveryCategory, RecoveryManager, StepAdjustments, ERROR_KIND_KEY};
use super::result::ResultEnvelope;
use super::retry::RetryingOperationExecutor;
use super::stats::ExecutionStats;
use crate::bridge::{DatabaseOp, Services, StorageOp};
use crate::workflow::config::{ConfigSummary, OrchestratorConfig};
use crate::workflow::WorkflowContext;

/// What one `run_once` produced
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub envelope: ResultEnvelope,
    pub stats: ExecutionStats,
    pub context: WorkflowContext,
    pub health: Option<HealthReport>,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.envelope.is_success()
    }
}

/// Structured summary combining stats, context and health
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub config: ConfigSummary,
    pub execution_stats: ExecutionStats,
    pub context: WorkflowContext,
    pub health: Option<HealthReport>,
    pub progress: Progress,
    pub monitor: MonitorSummary,
}

#[derive(Debug)]
pub struct WorkflowOrchestrator {
    session_id: String,
    config: OrchestratorConfig,
    services: Services,
    clock: Arc<dyn Clock>,
    executor: RetryingOperationExecutor,
    recovery: RecoveryManager,
    health: HealthAggregator,
    ledger: SharedLedger,
    monitor: Monitor,
    engine: PhaseEngine,
    run_timeout: Duration,
    run_guard: Mutex<()>,
    state: Arc<RwLock<RunState>>,
}

impl WorkflowOrchestrator {
    pub fn new(config: OrchestratorConfig, services: Services, clock: Arc<dyn Clock>) -> Self {
        let executor = RetryingOperationExecutor::new(clock.clone(), config.retry.clone());
        let monitor = Monitor::new();
        let recovery = RecoveryManager::new(
            services.clone(),
            executor.clone(),
            clock.clone(),
            monitor.clone(),
            config.storage.bucket.clone(),
        )
        .with_analysis_cooldown(config.analysis_cooldown())
        .with_min_quality_level(config.min_quality_level);
        let ledger: SharedLedger = Arc::new(Mutex::new(ProgressLedger::new()));
        let engine = PhaseEngine::new(
            services.clone(),
            executor.clone(),
            recovery.clone(),
            ledger.clone(),
            monitor.clone(),
            clock.clone(),
            EngineSettings::from_config(&config),
        );

        Self {
            session_id: Uuid::new_v4().to_string(),
            health: HealthAggregator::new(config.probe_timeout()),
            run_timeout: config.run_timeout(),
            run_guard: Mutex::new(()),
            state: Arc::new(RwLock::new(RunState::new(
                WorkflowContext::default(),
                Utc::now(),
            ))),
            config,
            services,
            clock,
            executor,
            recovery,
            ledger,
            monitor,
            engine,
        }
    }

    /// Orchestrator over the HTTP adapters described by `config`
    pub fn from_config(mut config: OrchestratorConfig) -> Result<Self, OrchestratorError> {
        let services = Services::from_config(&config)?;
        if config.mock_mode {
            // the mock embedder writes nothing to the real storage
            config.verify_outputs = false;
        }
        Ok(Self::new(config, services, Arc::new(SystemClock)))
    }

    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = timeout;
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    pub fn ledger(&self) -> SharedLedger {
        self.ledger.clone()
    }

    /// One orchestration run, optionally restricted to a single work item
    #[instrument(skip(self), fields(session_id = %self.session_id))]
    pub async fn run_once(&self, item_id: Option<&str>) -> RunOutcome {
        let Ok(_guard) = self.run_guard.try_lock() else {
            warn!("Run requested while another run is in progress");
            return self.rejected().await;
        };
        self.execute_run(None, item_id).await
    }

    /// Run starting at `context.current_phase` instead of initialization
    #[instrument(skip(self, context), fields(session_id = %self.session_id, phase = %context.current_phase))]
    pub async fn resume(&self, context: WorkflowContext) -> RunOutcome {
        let Ok(_guard) = self.run_guard.try_lock() else {
            warn!("Resume requested while another run is in progress");
            return self.rejected().await;
        };
        self.execute_run(Some(context), None).await
    }

    async fn rejected(&self) -> RunOutcome {
        let now = self.clock.now().await;
        let mut stats = ExecutionStats::new(now);
        stats.finalize(now);
        RunOutcome {
            envelope: ResultEnvelope::failure("run already in progress"),
            stats,
            context: WorkflowContext::new(0, false, now),
            health: None,
        }
    }

    async fn execute_run(&self, resume: Option<WorkflowContext>, item_id: Option<&str>) -> RunOutcome {
        let started_at = self.clock.now().await;
        info!("Starting orchestration run");
        *self.state.write().await =
            RunState::new(WorkflowContext::new(0, false, started_at), started_at);

        let health = self.health_check().await;
        match health.status {
            HealthStatus::Unhealthy => {
                let message = format!(
                    "System unhealthy, run aborted: {}",
                    health.unhealthy_components().join(", ")
                );
                self.monitor.alert(Severity::Critical, message.clone()).await;
                let failure =
                    ResultEnvelope::failure(message).with_metadata(ERROR_KIND_KEY, "system_unhealthy");
                return self.finish(failure, Some(health)).await;
            }
            HealthStatus::Degraded => {
                warn!(
                    components = ?health.unhealthy_components(),
                    "System degraded, continuing"
                );
            }
            HealthStatus::Healthy => {}
        }

        let fresh = match self.build_context().await {
            Ok(context) => context,
            Err(failure) => return self.finish(failure, Some(health)).await,
        };
        let context = match resume {
            Some(resumed) => WorkflowContext {
                pending_count: fresh.pending_count,
                storage_accessible: fresh.storage_accessible,
                timestamp: fresh.timestamp,
                ..resumed
            },
            None => fresh,
        };

        if context.pending_count == 0 && context.active_item.is_none() {
            info!("No pending work items");
            self.state.write().await.context = context;
            let idle = ResultEnvelope::ok(json!({ "message": "No pending work items" }))
                .with_metadata("no_work", true);
            return self.finish(idle, Some(health)).await;
        }

        info!(
            pending = context.pending_count,
            phase = %context.current_phase,
            "Driving workflow phases"
        );
        {
            let mut run = RunState::new(context, started_at);
            if let Some(item_id) = item_id {
                run = run.with_target(item_id);
            }
            *self.state.write().await = run;
        }

        let envelope = match tokio::time::timeout(self.run_timeout, self.engine.drive(&self.state)).await {
            Ok(envelope) => envelope,
            Err(_) => {
                let message = format!("Run timed out after {:?}", self.run_timeout);
                self.monitor.alert(Severity::Critical, message.clone()).await;
                self.state.write().await.context.record_error(message.clone());
                ResultEnvelope::failure(message).with_metadata(ERROR_KIND_KEY, "timeout")
            }
        };
        self.finish(envelope, Some(health)).await
    }

    /// Finalize the run's stats and package the outcome
    async fn finish(&self, envelope: ResultEnvelope, health: Option<HealthReport>) -> RunOutcome {
        let ended_at = self.clock.now().await;
        let (stats, context) = {
            let mut run = self.state.write().await;
            run.stats.finalize(ended_at);
            (run.stats.clone(), run.context.clone())
        };
        self.ledger.lock().await.update_stats(CounterUpdate {
            started_at: Some(stats.started_at),
            items_processed: Some(stats.items_processed),
            sub_items_processed: Some(stats.sub_items_processed),
            errors: Some(stats.errors),
        });

        if envelope.is_success() {
            info!(
                items = stats.items_processed,
                sub_items = stats.sub_items_processed,
                errors = stats.errors,
                success_rate = stats.success_rate().unwrap_or(0.0),
                "Run finished"
            );
        } else {
            error!(errors = stats.errors, "Run failed: {}", envelope.error_or_empty());
        }

        RunOutcome {
            envelope: envelope.with_metadata("session_id", self.session_id.clone()),
            stats,
            context,
            health,
        }
    }

    /// Pending count and storage reachability from the collaborators
    pub async fn build_context(&self) -> Result<WorkflowContext, ResultEnvelope> {
        let counted = self
            .executor
            .database(self.services.store.as_ref(), DatabaseOp::CountPending)
            .await;
        if !counted.is_success() {
            return Err(ResultEnvelope::failure(format!(
                "Failed to count pending work items: {}",
                counted.error_or_empty()
            )));
        }

        let listing = self
            .executor
            .storage(
                self.services.storage.as_ref(),
                StorageOp::ListObjects {
                    container: self.config.storage.bucket.clone(),
                    prefix: String::new(),
                    extension: None,
                },
            )
            .await;
        let now = self.clock.now().await;
        Ok(WorkflowContext::new(
            pending_count(&counted).unwrap_or(0),
            listing.is_success(),
            now,
        ))
    }

    /// Standalone health diagnostic
    pub async fn health_check(&self) -> HealthReport {
        self.health
            .check_services(&self.services, &self.config.storage.bucket)
            .await
    }

    /// Run a category recovery procedure outside of any run
    #[instrument(skip(self, details))]
    pub async fn execute_recovery(&self, category: RecoveryCategory, details: &str) -> ResultEnvelope {
        let adjustments = StepAdjustments {
            quality_level: self.config.quality_level,
        };
        self.recovery.recover(category, details, adjustments).await.envelope
    }

    /// Agent brief for the current collaborator state
    pub async fn brief(&self, phase: Option<PhaseId>) -> Result<String, OrchestratorError> {
        let context = match self.build_context().await {
            Ok(context) => context,
            Err(failure) => {
                let mut context = self.state.read().await.context.clone();
                context.record_error(failure.error_or_empty());
                context
            }
        };
        AgentBrief::new()?.render(&context, phase)
    }

    /// Fold invocations reported by an external agent into the stats
    pub async fn apply_agent_report(&self, invocations: &[ReportedInvocation]) -> ReportDelta {
        let delta = ReportDelta::from_invocations(invocations);
        let update = {
            let mut run = self.state.write().await;
            run.stats.items_processed += delta.items_processed;
            run.stats.sub_items_processed += delta.sub_items_processed;
            run.stats.errors += delta.errors;
            if let Some(ended_at) = run.stats.ended_at {
                run.stats.finalize(ended_at);
            }
            CounterUpdate {
                started_at: None,
                items_processed: Some(run.stats.items_processed),
                sub_items_processed: Some(run.stats.sub_items_processed),
                errors: Some(run.stats.errors),
            }
        };
        self.ledger.lock().await.update_stats(update);
        info!(
            items = delta.items_processed,
            sub_items = delta.sub_items_processed,
            errors = delta.errors,
            "Applied agent report"
        );
        delta
    }

    pub async fn generate_report(&self) -> ExecutionReport {
        let (stats, context) = {
            let run = self.state.read().await;
            (run.stats.clone(), run.context.clone())
        };
        ExecutionReport {
            session_id: self.session_id.clone(),
            timestamp: self.clock.now().await,
            config: self.config.summary(),
            execution_stats: stats,
            context,
            health: self.health.last_report().await,
            progress: self.ledger.lock().await.get_progress(),
            monitor: self.monitor.summary().await,
        }
    }
}
