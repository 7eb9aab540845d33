//! Workflow domain types
//!
//! - `model` - work items, sub-items and their lifecycle stages
//! - `context` - WorkflowContext snapshot for one run
//! - `config` - OrchestratorConfig, loaded from YAML and the environment

pub mod config;
pub mod context;
pub mod model;

// Re-export all public types for convenience
pub use config::{
    ConfigError, ConfigSummary, OrchestratorConfig, RetryConfig, ServiceConfig, StorageConfig,
    StoreConfig, SubItemFailurePolicy,
};
pub use context::WorkflowContext;
pub use model::{
    AnalysisKind, AnalysisStatus, BatchStatus, ProcessingStage, SubItem, WorkItem, WorkItemRef,
};
