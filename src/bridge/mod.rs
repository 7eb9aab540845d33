//! Collaborator adapters
//!
//! The orchestration core talks to four collaborators, each behind a trait
//! and a closed set of strongly typed operations:
//! - [`RelationalStore`] executes [`DatabaseOp`]s (work items, sub-items,
//!   transaction markers)
//! - [`ObjectStorage`] executes [`StorageOp`]s (list, access links, existence)
//! - [`AnalysisService`] analyzes a sub-item reachable at a URL
//! - [`EmbeddingService`] embeds analysis metadata into a processed copy
//!
//! Every call returns a [`ResultEnvelope`]; adapters never surface failures
//! as Rust errors. Implementations:
//! - `rest`: HTTP adapters built on reqwest
//! - `mock`: deterministic analysis/embedding services for mock mode
//! - `memory`: in-memory store and storage with scripted faults

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::engine::result::ResultEnvelope;
use crate::workflow::model::{AnalysisKind, AnalysisStatus, BatchStatus};
use crate::workflow::OrchestratorConfig;

pub mod memory;
pub mod mock;
pub mod rest;

pub use memory::{FaultInjector, InMemoryStorage, InMemoryStore};
pub use mock::{MockAnalysisService, MockEmbeddingService};
pub use rest::{HttpAnalysisService, HttpEmbeddingService, RestStorage, RestStore};

/// Errors raised while constructing adapters
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Failed to start client: {0}")]
    StartupFailed(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Operations understood by the relational store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DatabaseOp {
    /// Connectivity check
    Ping,
    /// Count of pending, paid work items
    CountPending,
    /// Pending, paid work items, oldest first
    ListPending { limit: usize },
    /// One work item by id, whatever its stage
    FetchItem { item_id: String },
    /// Conditional pending → processing update; an empty row set means
    /// another run already holds the item
    ClaimItem { item_id: String },
    SetBatchStatus { batch_id: String, status: BatchStatus },
    ListSubItems { item_id: String },
    StoreAnalysis { sub_item_id: String, analysis: Value },
    SetProcessedPath { sub_item_id: String, processed_path: String },
    SetSubItemStatus { sub_item_id: String, status: AnalysisStatus },
    /// processing → completed
    CompleteItem { item_id: String },
    /// processing → failed
    FailItem { item_id: String, reason: String },
    EnqueueNotification { item_id: String, user_id: String },
    Begin,
    Commit,
    Rollback,
}

impl DatabaseOp {
    pub fn name(&self) -> &'static str {
        match self {
            DatabaseOp::Ping => "ping",
            DatabaseOp::CountPending => "count_pending",
            DatabaseOp::ListPending { .. } => "list_pending",
            DatabaseOp::FetchItem { .. } => "fetch_item",
            DatabaseOp::ClaimItem { .. } => "claim_item",
            DatabaseOp::SetBatchStatus { .. } => "set_batch_status",
            DatabaseOp::ListSubItems { .. } => "list_sub_items",
            DatabaseOp::StoreAnalysis { .. } => "store_analysis",
            DatabaseOp::SetProcessedPath { .. } => "set_processed_path",
            DatabaseOp::SetSubItemStatus { .. } => "set_sub_item_status",
            DatabaseOp::CompleteItem { .. } => "complete_item",
            DatabaseOp::FailItem { .. } => "fail_item",
            DatabaseOp::EnqueueNotification { .. } => "enqueue_notification",
            DatabaseOp::Begin => "begin",
            DatabaseOp::Commit => "commit",
            DatabaseOp::Rollback => "rollback",
        }
    }

    pub fn is_transaction_marker(&self) -> bool {
        matches!(self, DatabaseOp::Begin | DatabaseOp::Commit | DatabaseOp::Rollback)
    }
}

/// Operations understood by the object storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StorageOp {
    ListObjects {
        container: String,
        prefix: String,
        extension: Option<String>,
    },
    CreateAccessLink {
        container: String,
        path: String,
        ttl_secs: u64,
    },
    VerifyExists { container: String, path: String },
}

impl StorageOp {
    pub fn name(&self) -> &'static str {
        match self {
            StorageOp::ListObjects { .. } => "list_objects",
            StorageOp::CreateAccessLink { .. } => "create_access_link",
            StorageOp::VerifyExists { .. } => "verify_exists",
        }
    }
}

/// Analysis request for one sub-item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub url: String,
    pub kind: AnalysisKind,
}

/// Metadata embedding request for one sub-item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbedRequest {
    pub source_path: String,
    pub output_path: String,
    pub metadata: Map<String, Value>,
    pub quality_level: u8,
}

/// Any adapter call, as reported by an external agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tool", content = "call", rename_all = "snake_case")]
pub enum AdapterCall {
    Database(DatabaseOp),
    Storage(StorageOp),
    Analysis(AnalysisRequest),
    Embedding(EmbedRequest),
}

#[async_trait]
pub trait RelationalStore: Send + Sync {
    async fn execute(&self, op: DatabaseOp) -> ResultEnvelope;
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn execute(&self, op: StorageOp) -> ResultEnvelope;

    async fn list_objects(
        &self,
        container: &str,
        prefix: &str,
        extension: Option<&str>,
    ) -> ResultEnvelope {
        self.execute(StorageOp::ListObjects {
            container: container.to_string(),
            prefix: prefix.to_string(),
            extension: extension.map(str::to_string),
        })
        .await
    }

    async fn create_access_link(&self, container: &str, path: &str, ttl_secs: u64) -> ResultEnvelope {
        self.execute(StorageOp::CreateAccessLink {
            container: container.to_string(),
            path: path.to_string(),
            ttl_secs,
        })
        .await
    }

    /// Succeeds with `{"exists": bool, ...}`; a missing object is not a
    /// failed call
    async fn verify_exists(&self, container: &str, path: &str) -> ResultEnvelope {
        self.execute(StorageOp::VerifyExists {
            container: container.to_string(),
            path: path.to_string(),
        })
        .await
    }
}

#[async_trait]
pub trait AnalysisService: Send + Sync {
    async fn analyze(&self, request: AnalysisRequest) -> ResultEnvelope;

    /// Connectivity check used by health probes and recovery
    async fn ping(&self) -> ResultEnvelope;
}

#[async_trait]
pub trait EmbeddingService: Send + Sync {
    async fn embed(&self, request: EmbedRequest) -> ResultEnvelope;

    /// Connectivity check used by health probes and recovery
    async fn ping(&self) -> ResultEnvelope;
}

/// The collaborators one orchestrator works against
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn RelationalStore>,
    pub storage: Arc<dyn ObjectStorage>,
    pub analysis: Arc<dyn AnalysisService>,
    pub embedding: Arc<dyn EmbeddingService>,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services").finish_non_exhaustive()
    }
}

impl Services {
    pub fn new(
        store: Arc<dyn RelationalStore>,
        storage: Arc<dyn ObjectStorage>,
        analysis: Arc<dyn AnalysisService>,
        embedding: Arc<dyn EmbeddingService>,
    ) -> Self {
        Self {
            store,
            storage,
            analysis,
            embedding,
        }
    }

    /// Build HTTP adapters (mock analysis/embedding in mock mode)
    pub fn from_config(config: &OrchestratorConfig) -> Result<Self, BridgeError> {
        let store = Arc::new(RestStore::from_config(&config.store)?);
        let storage = Arc::new(RestStorage::from_config(&config.store, &config.storage)?);

        let (analysis, embedding): (Arc<dyn AnalysisService>, Arc<dyn EmbeddingService>) =
            if config.mock_mode {
                (
                    Arc::new(MockAnalysisService::new()),
                    Arc::new(MockEmbeddingService::new()),
                )
            } else {
                (
                    Arc::new(HttpAnalysisService::from_config(&config.analysis)?),
                    Arc::new(HttpEmbeddingService::from_config(&config.embedding)?),
                )
            };

        Ok(Self::new(store, storage, analysis, embedding))
    }

    /// Dispatch any adapter call to its collaborator
    pub async fn dispatch(&self, call: AdapterCall) -> ResultEnvelope {
        match call {
            AdapterCall::Database(op) => self.store.execute(op).await,
            AdapterCall::Storage(op) => self.storage.execute(op).await,
            AdapterCall::Analysis(request) => self.analysis.analyze(request).await,
            AdapterCall::Embedding(request) => self.embedding.embed(request).await,
        }
    }
}
