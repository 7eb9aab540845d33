//! Orchestration engine module
//!
//! This module contains:
//! - `orchestrator` - WorkflowOrchestrator, the top-level run driver
//! - `phase_engine` - PhaseEngine, which drives a run through the phases
//! - `phase` - Phase descriptors and the transition function
//! - `retry` - RetryingOperationExecutor (bounded retry with backoff)
//! - `transaction` - TransactionCoordinator (begin / ops / commit or rollback)
//! - `progress` - ProgressLedger (todos and workflow counters)
//! - `health` - HealthAggregator (collaborator probes)
//! - `recovery` - Error classification and category recovery
//! - `monitor` - Alerts and metric samples
//! - `stats` - ExecutionStats for one run
//! - `agent` - Agent brief and reported invocations
//! - `result` - ResultEnvelope, the uniform outcome type
//! - `error` - Orchestrator error types
//! - `clock` - Clock abstraction with a virtual clock for tests

pub mod agent;
pub mod clock;
pub mod error;
pub mod health;
pub mod monitor;
pub mod orchestrator;
pub mod phase;
pub mod phase_engine;
pub mod progress;
pub mod recovery;
pub mod result;
pub mod retry;
pub mod stats;
pub mod transaction;

pub use agent::{parse_report, AgentBrief, ReportDelta, ReportedInvocation};
pub use clock::{parse_duration, Clock, ClockError, MockClock, SystemClock};
pub use error::{LedgerError, OrchestratorError};
pub use health::{ComponentHealth, HealthAggregator, HealthReport, HealthStatus, Probe};
pub use monitor::{Alert, Monitor, MonitorSummary, Severity};
pub use orchestrator::{ExecutionReport, RunOutcome, WorkflowOrchestrator};
pub use phase::{transition, Phase, PhaseId};
pub use phase_engine::{EngineSettings, PhaseEngine, RunState, SharedLedger};
pub use progress::{CounterUpdate, Progress, ProgressLedger, TodoEntry, TodoList, TodoStatus};
pub use recovery::{classify, ErrorKind, RecoveryCategory, RecoveryManager, StepAdjustments};
pub use result::ResultEnvelope;
pub use retry::RetryingOperationExecutor;
pub use stats::{DerivedMetrics, ExecutionStats};
pub use transaction::TransactionCoordinator;
