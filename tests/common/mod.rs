#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use orbit_orchestrator::bridge::memory::seed;
use orbit_orchestrator::bridge::{
    EmbeddingService, FaultInjector, InMemoryStorage, InMemoryStore, MockAnalysisService,
    MockEmbeddingService,
};
use orbit_orchestrator::prelude::*;
use tempfile::TempDir;

pub const BUCKET: &str = "orbit-images";

pub fn create_test_dir() -> TempDir {
    tempfile::tempdir().expect("Failed to create temp directory")
}

pub fn write_config(dir: &Path, content: &str) -> PathBuf {
    let path = dir.join("orbit.yaml");
    fs::write(&path, content).expect("Failed to write orbit.yaml");
    path
}

pub fn valid_config() -> &'static str {
    r#"
store:
  base_url: https://project.supabase.co
  api_key: service-role-key
storage:
  bucket: orbit-images
mock_mode: true
retry:
  max_attempts: 2
  backoff_unit_ms: 10
"#
}

/// Orchestrator wired to in-memory collaborators sharing one fault script
pub struct TestHarness {
    pub store: InMemoryStore,
    pub storage: InMemoryStorage,
    pub faults: FaultInjector,
    pub orchestrator: WorkflowOrchestrator,
}

pub struct HarnessBuilder {
    config: OrchestratorConfig,
    faults: FaultInjector,
    storage: InMemoryStorage,
    embedding: Option<Arc<dyn EmbeddingService>>,
    run_timeout: Option<Duration>,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        let mut config = OrchestratorConfig::default();
        config.storage.bucket = BUCKET.to_string();
        config.mock_mode = true;
        Self {
            config,
            faults: FaultInjector::new(),
            storage: InMemoryStorage::new(),
            embedding: None,
            run_timeout: None,
        }
    }

    /// Storage the harness will use, for wiring custom collaborators
    pub fn storage(&self) -> InMemoryStorage {
        self.storage.clone()
    }

    pub fn run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = Some(timeout);
        self
    }

    pub fn policy(mut self, policy: SubItemFailurePolicy) -> Self {
        self.config.sub_item_failure_policy = policy;
        self
    }

    pub fn max_items(mut self, max_items: usize) -> Self {
        self.config.max_items_per_run = max_items;
        self
    }

    pub fn faults(mut self, faults: FaultInjector) -> Self {
        self.faults = faults;
        self
    }

    pub fn embedding(mut self, embedding: Arc<dyn EmbeddingService>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn build(self) -> TestHarness {
        let store = InMemoryStore::new().with_faults(self.faults.clone());
        let storage = self.storage.with_faults(self.faults.clone());
        let embedding = self.embedding.unwrap_or_else(|| {
            Arc::new(
                MockEmbeddingService::new()
                    .with_faults(self.faults.clone())
                    .with_output(storage.clone(), BUCKET),
            )
        });

        let services = Services::new(
            Arc::new(store.clone()),
            Arc::new(storage.clone()),
            Arc::new(MockAnalysisService::new().with_faults(self.faults.clone())),
            embedding,
        );
        let mut orchestrator =
            WorkflowOrchestrator::new(self.config, services, Arc::new(MockClock::new()));
        if let Some(timeout) = self.run_timeout {
            orchestrator = orchestrator.with_run_timeout(timeout);
        }

        TestHarness {
            store,
            storage,
            faults: self.faults,
            orchestrator,
        }
    }
}

impl TestHarness {
    pub async fn seed(&self, orders: usize, images: usize) -> Vec<String> {
        seed(&self.store, &self.storage, BUCKET, orders, images).await
    }
}

pub fn harness() -> TestHarness {
    HarnessBuilder::new().build()
}
