//! Deterministic analysis and embedding services for mock mode

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use super::memory::{FaultInjector, InMemoryStorage};
use super::{AnalysisRequest, AnalysisService, EmbedRequest, EmbeddingService};
use crate::engine::result::ResultEnvelope;
use crate::workflow::model::AnalysisKind;

pub const MOCK_MODEL_VERSION: &str = "mock-v1.0";

/// Analysis payload for `kind`, identical for every call apart from the
/// timestamp
pub fn mock_analysis(url: &str, kind: AnalysisKind) -> Value {
    let (objects, setting) = match kind {
        AnalysisKind::Product => (json!(["product", "packaging", "label", "brand"]), "studio"),
        AnalysisKind::Lifestyle => (
            json!(["person", "environment", "activity", "lifestyle"]),
            "outdoor",
        ),
    };
    let name = kind.as_str();
    let mut title = name.to_string();
    if let Some(first) = title.get_mut(0..1) {
        first.make_ascii_uppercase();
    }

    json!({
        "analysis_type": name,
        "metadata": {
            "title": format!("{} Image Analysis", title),
            "description": format!("Mock analysis for {} image from {}", name, url),
            "tags": ["mock", "test", name, "ai-generated"],
            "colors": ["#FF5733", "#33FF57", "#3357FF", "#FFD700"],
            "objects": objects,
            "scene": {
                "setting": setting,
                "lighting": "professional",
                "mood": "positive",
                "composition": "centered"
            },
            "technical": {
                "resolution": "1920x1080",
                "quality": "high",
                "format": "JPEG"
            }
        },
        "confidence": 0.94,
        "model_version": MOCK_MODEL_VERSION,
        "timestamp": Utc::now().to_rfc3339(),
    })
}

#[derive(Debug, Clone, Default)]
pub struct MockAnalysisService {
    faults: FaultInjector,
}

impl MockAnalysisService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share a fault script (operation names `analyze` and `analysis_ping`)
    pub fn with_faults(mut self, faults: FaultInjector) -> Self {
        self.faults = faults;
        self
    }
}

#[async_trait]
impl AnalysisService for MockAnalysisService {
    async fn analyze(&self, request: AnalysisRequest) -> ResultEnvelope {
        if let Some(failure) = self.faults.check("analyze", &request.url) {
            return failure;
        }
        ResultEnvelope::ok(mock_analysis(&request.url, request.kind))
            .with_metadata("analysis_type", request.kind.as_str())
            .with_metadata("mock_mode", true)
    }

    async fn ping(&self) -> ResultEnvelope {
        if let Some(failure) = self.faults.check("analysis_ping", "") {
            return failure;
        }
        ResultEnvelope::ok(json!({"service": "analysis", "mock_mode": true}))
    }
}

/// Mock embedder. With an output storage attached, each successful embed
/// writes the processed copy so that output verification finds it.
#[derive(Debug, Clone, Default)]
pub struct MockEmbeddingService {
    faults: FaultInjector,
    output: Option<(InMemoryStorage, String)>,
}

impl MockEmbeddingService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share a fault script (operation names `embed` and `embedding_ping`)
    pub fn with_faults(mut self, faults: FaultInjector) -> Self {
        self.faults = faults;
        self
    }

    pub fn with_output(mut self, storage: InMemoryStorage, container: impl Into<String>) -> Self {
        self.output = Some((storage, container.into()));
        self
    }
}

#[async_trait]
impl EmbeddingService for MockEmbeddingService {
    async fn embed(&self, request: EmbedRequest) -> ResultEnvelope {
        if let Some(failure) = self.faults.check("embed", &request.source_path) {
            return failure;
        }

        if let Some((storage, container)) = &self.output {
            storage
                .put_object(container, &request.output_path, 1_124_000)
                .await;
        }

        let fields: Vec<&String> = request.metadata.keys().collect();
        ResultEnvelope::ok(json!({
            "processed_path": request.output_path,
            "original_size": 1_024_000,
            "processed_size": 1_124_000,
            "compression_quality": request.quality_level,
            "format": "JPEG",
            "embedded_fields": fields,
            "timestamp": Utc::now().to_rfc3339(),
        }))
        .with_metadata("mock_mode", true)
    }

    async fn ping(&self) -> ResultEnvelope {
        if let Some(failure) = self.faults.check("embedding_ping", "") {
            return failure;
        }
        ResultEnvelope::ok(json!({"service": "embedding", "mock_mode": true}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    #[tokio::test]
    async fn test_mock_analysis_by_kind() {
        let service = MockAnalysisService::new();
        let result = service
            .analyze(AnalysisRequest {
                url: "memory://orbit-images/a.jpg".to_string(),
                kind: AnalysisKind::Product,
            })
            .await;
        assert!(result.is_success());

        let data = result.data().unwrap();
        assert_eq!(data["analysis_type"], json!("product"));
        assert_eq!(data["metadata"]["title"], json!("Product Image Analysis"));
        assert_eq!(data["metadata"]["scene"]["setting"], json!("studio"));
    }

    #[tokio::test]
    async fn test_embed_writes_output() {
        let storage = InMemoryStorage::new();
        let service = MockEmbeddingService::new().with_output(storage.clone(), "orbit-images");

        let mut metadata = Map::new();
        metadata.insert("title".to_string(), json!("Lifestyle Image Analysis"));
        let result = service
            .embed(EmbedRequest {
                source_path: "u/o/a.jpg".to_string(),
                output_path: "u/o/processed/a.jpg".to_string(),
                metadata,
                quality_level: 85,
            })
            .await;

        assert!(result.is_success());
        assert_eq!(result.data().unwrap()["compression_quality"], json!(85));
        assert!(storage.contains("orbit-images", "u/o/processed/a.jpg").await);
    }

    #[tokio::test]
    async fn test_embed_fault() {
        let faults = FaultInjector::new();
        faults.fail_matching("embed", "b.jpg", "Metadata embedding failed: 503");
        let service = MockEmbeddingService::new().with_faults(faults.clone());

        let request = |path: &str| EmbedRequest {
            source_path: path.to_string(),
            output_path: format!("processed/{}", path),
            metadata: Map::new(),
            quality_level: 95,
        };
        assert!(service.embed(request("a.jpg")).await.is_success());
        assert!(!service.embed(request("b.jpg")).await.is_success());
        assert_eq!(faults.hits("embed"), 1);
    }
}
