//! # ORBIT Orchestrator
//!
//! Phase-driven orchestration core for an image-processing pipeline:
//! discover pending work items, claim one exclusively, drive each of its
//! images through analysis and metadata embedding, record completion and
//! repeat until no work remains.
//!
//! ## Features
//!
//! - **Phase state machine** - initialization, discovery, processing,
//!   finalization and continuation, resumable at any phase
//! - **Bounded retry** - exponential backoff for transient failures only
//! - **Logical transactions** - begin / ops / commit, rollback on first failure
//! - **Health gate** - runs refuse to start while collaborators are down
//! - **Per-item isolation** - one bad work item never blocks the others
//!
//! ## Collaborators
//!
//! - **Relational store**: work items, sub-items, batches, notifications
//! - **Object storage**: originals and processed copies
//! - **Analysis service**: structured analysis of each image
//! - **Embedding service**: writes analysis metadata into a processed copy
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use orbit_orchestrator::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = OrchestratorConfig::resolve(None)?;
//!     let orchestrator = WorkflowOrchestrator::from_config(config)?;
//!
//!     let outcome = orchestrator.run_once(None).await;
//!     println!(
//!         "success={} items={}",
//!         outcome.is_success(),
//!         outcome.stats.items_processed
//!     );
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod engine;
pub mod workflow;

// Re-export main types
pub use bridge::{
    AdapterCall, AnalysisService, BridgeError, DatabaseOp, EmbeddingService, ObjectStorage,
    RelationalStore, Services, StorageOp,
};
pub use engine::{
    ExecutionReport, ExecutionStats, OrchestratorError, ResultEnvelope, RunOutcome,
    WorkflowOrchestrator,
};
pub use workflow::{ConfigError, OrchestratorConfig, WorkflowContext};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::bridge::{
        AnalysisService, DatabaseOp, EmbeddingService, ObjectStorage, RelationalStore, Services,
        StorageOp,
    };
    pub use crate::engine::{
        Clock, ExecutionReport, ExecutionStats, HealthStatus, MockClock, PhaseId,
        RecoveryCategory, ResultEnvelope, RunOutcome, SystemClock, WorkflowOrchestrator,
    };
    pub use crate::workflow::{OrchestratorConfig, SubItemFailurePolicy, WorkflowContext};
}
