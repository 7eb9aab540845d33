//! HTTP adapters
//!
//! Requests go out once; retry and backoff belong to the engine's
//! executor. Every outcome becomes an envelope: non-2xx responses carry a
//! `status_code` metadata entry so failures can be classified, transport
//! errors carry the reqwest error text.
//!
//! - [`RestStore`] renders each [`DatabaseOp`] to SQL and posts it to the
//!   `execute_sql` RPC endpoint
//! - [`RestStorage`] talks to the storage object API
//! - [`HttpAnalysisService`] / [`HttpEmbeddingService`] post JSON to their
//!   configured endpoints

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{
    AnalysisRequest, AnalysisService, BridgeError, DatabaseOp, EmbedRequest, EmbeddingService,
    ObjectStorage, RelationalStore, StorageOp,
};
use crate::engine::recovery::ERROR_KIND_KEY;
use crate::engine::result::ResultEnvelope;
use crate::workflow::config::{ServiceConfig, StorageConfig, StoreConfig};

const LIST_LIMIT: u32 = 1000;

/// Response of one HTTP exchange
#[derive(Debug, Clone)]
struct HttpResponse {
    status: u16,
    headers: reqwest::header::HeaderMap,
    body: Value,
    elapsed_ms: u64,
}

impl HttpResponse {
    fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    fn header(&self, name: &str) -> Option<String> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    /// Failure envelope for a non-2xx response
    fn into_failure(self, context: &str) -> ResultEnvelope {
        let body = match &self.body {
            Value::String(text) => text.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        };
        ResultEnvelope::failure(format!("{}: {} - {}", context, self.status, body))
            .with_metadata("status_code", self.status)
            .with_metadata("duration_ms", self.elapsed_ms)
    }
}

/// Thin reqwest wrapper shared by the adapters
#[derive(Debug, Clone)]
struct HttpClient {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpClient {
    fn new(base_url: &str, api_key: Option<&str>, timeout_ms: u64) -> Result<Self, BridgeError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|e| BridgeError::StartupFailed(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.is_empty()).map(str::to_string),
            client,
        })
    }

    fn build_url(&self, path: &str) -> String {
        if path.is_empty() {
            return self.base_url.clone();
        }
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        format!("{}{}", self.base_url, path)
    }

    fn apply_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request
                .header("Authorization", format!("Bearer {}", key))
                .header("apikey", key),
            None => request,
        }
    }

    async fn send(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&Value>,
        query: &[(&str, String)],
    ) -> Result<HttpResponse, ResultEnvelope> {
        let url = self.build_url(path);
        let start = Instant::now();

        let mut request = self.apply_auth(self.client.request(method.clone(), &url));
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        debug!("Executing {} {}", method, url);

        let response = request.send().await.map_err(|e| {
            warn!("Request failed: {}", e);
            let message = if e.is_timeout() {
                format!("{} {} timeout: {}", method, url, e)
            } else if e.is_connect() {
                format!("{} {} connection error: {}", method, url, e)
            } else {
                format!("{} {} failed: {}", method, url, e)
            };
            ResultEnvelope::failure(message)
        })?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let text = response
            .text()
            .await
            .map_err(|e| ResultEnvelope::failure(format!("Failed to read response: {}", e)))?;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let body = if text.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        debug!("{} {} -> {} ({}ms)", method, url, status, elapsed_ms);

        Ok(HttpResponse {
            status,
            headers,
            body,
            elapsed_ms,
        })
    }
}

/// SQL statement and positional parameters for an operation
pub fn render_sql(op: &DatabaseOp) -> (String, Vec<Value>) {
    const ITEM_COLUMNS: &str = "id, user_id, batch_id, processing_stage, payment_status";
    const SUB_ITEM_COLUMNS: &str = "id, order_id, original_storage_path AS original_path, \
         analysis_status, analysis_type AS analysis_kind, gemini_analysis_raw AS analysis, \
         processed_storage_path AS processed_path";

    match op {
        DatabaseOp::Ping => ("SELECT 1 AS health_check".to_string(), vec![]),
        DatabaseOp::CountPending => (
            "SELECT COUNT(*) AS count FROM orders \
             WHERE processing_stage = 'pending' AND payment_status = 'completed'"
                .to_string(),
            vec![],
        ),
        DatabaseOp::ListPending { limit } => (
            format!(
                "SELECT {} FROM orders \
                 WHERE processing_stage = 'pending' AND payment_status = 'completed' \
                 ORDER BY created_at ASC LIMIT $1",
                ITEM_COLUMNS
            ),
            vec![json!(limit)],
        ),
        DatabaseOp::FetchItem { item_id } => (
            format!("SELECT {} FROM orders WHERE id = $1", ITEM_COLUMNS),
            vec![json!(item_id)],
        ),
        DatabaseOp::ClaimItem { item_id } => (
            "UPDATE orders SET processing_stage = 'processing', processing_started_at = NOW() \
             WHERE id = $1 AND processing_stage = 'pending' RETURNING id"
                .to_string(),
            vec![json!(item_id)],
        ),
        DatabaseOp::SetBatchStatus { batch_id, status } => (
            "UPDATE batches SET status = $2, updated_at = NOW() WHERE id = $1 RETURNING id"
                .to_string(),
            vec![json!(batch_id), json!(status.as_str())],
        ),
        DatabaseOp::ListSubItems { item_id } => (
            format!(
                "SELECT {} FROM images WHERE order_id = $1 ORDER BY created_at ASC",
                SUB_ITEM_COLUMNS
            ),
            vec![json!(item_id)],
        ),
        DatabaseOp::StoreAnalysis {
            sub_item_id,
            analysis,
        } => (
            "UPDATE images SET gemini_analysis_raw = $2, processed_at = NOW() \
             WHERE id = $1 RETURNING id"
                .to_string(),
            vec![json!(sub_item_id), analysis.clone()],
        ),
        DatabaseOp::SetProcessedPath {
            sub_item_id,
            processed_path,
        } => (
            "UPDATE images SET processed_storage_path = $2 WHERE id = $1 RETURNING id".to_string(),
            vec![json!(sub_item_id), json!(processed_path)],
        ),
        DatabaseOp::SetSubItemStatus {
            sub_item_id,
            status,
        } => (
            "UPDATE images SET analysis_status = $2 WHERE id = $1 RETURNING id".to_string(),
            vec![json!(sub_item_id), json!(status.as_str())],
        ),
        DatabaseOp::CompleteItem { item_id } => (
            "UPDATE orders SET processing_stage = 'completed', completed_at = NOW() \
             WHERE id = $1 AND processing_stage = 'processing' RETURNING id"
                .to_string(),
            vec![json!(item_id)],
        ),
        DatabaseOp::FailItem { item_id, reason } => (
            "UPDATE orders SET processing_stage = 'failed', error_message = $2 \
             WHERE id = $1 AND processing_stage = 'processing' RETURNING id"
                .to_string(),
            vec![json!(item_id), json!(reason)],
        ),
        DatabaseOp::EnqueueNotification { item_id, user_id } => (
            "INSERT INTO email_queue (order_id, user_id, template, status) \
             VALUES ($1, $2, 'order_completed', 'pending') RETURNING id"
                .to_string(),
            vec![json!(item_id), json!(user_id)],
        ),
        DatabaseOp::Begin => ("BEGIN".to_string(), vec![]),
        DatabaseOp::Commit => ("COMMIT".to_string(), vec![]),
        DatabaseOp::Rollback => ("ROLLBACK".to_string(), vec![]),
    }
}

/// Conditional updates that must match a row to count as success.
/// Claiming is excluded: an empty claim means "already taken".
pub(crate) fn requires_match(op: &DatabaseOp) -> bool {
    matches!(
        op,
        DatabaseOp::CompleteItem { .. } | DatabaseOp::FailItem { .. }
    )
}

/// Relational store reached through the `execute_sql` RPC endpoint
#[derive(Debug, Clone)]
pub struct RestStore {
    http: HttpClient,
}

impl RestStore {
    pub fn new(config: &StoreConfig) -> Result<Self, BridgeError> {
        if config.base_url.trim().is_empty() {
            return Err(BridgeError::ConfigError(
                "store.base_url is not set".to_string(),
            ));
        }
        Ok(Self {
            http: HttpClient::new(&config.base_url, Some(&config.api_key), config.timeout_ms)?,
        })
    }

    pub fn from_config(config: &StoreConfig) -> Result<Self, BridgeError> {
        Self::new(config)
    }
}

#[async_trait]
impl RelationalStore for RestStore {
    async fn execute(&self, op: DatabaseOp) -> ResultEnvelope {
        let (query, params) = render_sql(&op);
        let body = json!({"query": query, "params": params});

        let response = match self
            .http
            .send(reqwest::Method::POST, "/rest/v1/rpc/execute_sql", Some(&body), &[])
            .await
        {
            Ok(response) => response,
            Err(failure) => return failure.with_metadata("operation", op.name()),
        };

        if !response.is_success() {
            return response
                .into_failure("Database error")
                .with_metadata("operation", op.name());
        }

        let rows = match response.body {
            Value::Array(rows) => rows,
            Value::Null => Vec::new(),
            other => vec![other],
        };

        if requires_match(&op) && rows.is_empty() {
            return ResultEnvelope::failure(format!(
                "{} matched no rows in the expected stage",
                op.name()
            ))
            .with_metadata(ERROR_KIND_KEY, "data_integrity")
            .with_metadata("operation", op.name());
        }

        let row_count = rows.len();
        ResultEnvelope::ok(Value::Array(rows))
            .with_metadata("operation", op.name())
            .with_metadata("row_count", row_count)
            .with_metadata("duration_ms", response.elapsed_ms)
    }
}

/// Object storage reached through the storage object API
#[derive(Debug, Clone)]
pub struct RestStorage {
    http: HttpClient,
    link_ttl_secs: u64,
}

impl RestStorage {
    pub fn new(store: &StoreConfig, storage: &StorageConfig) -> Result<Self, BridgeError> {
        if store.base_url.trim().is_empty() {
            return Err(BridgeError::ConfigError(
                "store.base_url is not set".to_string(),
            ));
        }
        Ok(Self {
            http: HttpClient::new(&store.base_url, Some(&store.api_key), storage.timeout_ms)?,
            link_ttl_secs: storage.link_ttl_secs,
        })
    }

    pub fn from_config(store: &StoreConfig, storage: &StorageConfig) -> Result<Self, BridgeError> {
        Self::new(store, storage)
    }

    pub fn default_link_ttl(&self) -> u64 {
        self.link_ttl_secs
    }

    async fn list(&self, container: &str, prefix: &str, extension: Option<&str>) -> ResultEnvelope {
        let path = format!("/storage/v1/object/list/{}", container);
        let query = [
            ("prefix", prefix.to_string()),
            ("limit", LIST_LIMIT.to_string()),
            ("offset", "0".to_string()),
        ];

        let response = match self.http.send(reqwest::Method::GET, &path, None, &query).await {
            Ok(response) => response,
            Err(failure) => return failure,
        };
        if !response.is_success() {
            return response.into_failure("Storage list error");
        }

        let entries = match response.body {
            Value::Array(entries) => entries,
            _ => Vec::new(),
        };
        let objects = shape_listing(&entries, prefix, extension);
        let count = objects.len();

        ResultEnvelope::ok(Value::Array(objects))
            .with_metadata("bucket", container)
            .with_metadata("prefix", prefix)
            .with_metadata("file_count", count)
    }

    async fn sign(&self, container: &str, object_path: &str, ttl_secs: u64) -> ResultEnvelope {
        let path = format!("/storage/v1/object/sign/{}/{}", container, object_path);
        let body = json!({"expiresIn": ttl_secs});

        let response = match self.http.send(reqwest::Method::POST, &path, Some(&body), &[]).await {
            Ok(response) => response,
            Err(failure) => return failure,
        };
        if !response.is_success() {
            return response.into_failure("Failed to create access link");
        }

        let Some(signed) = response.body.get("signedURL").and_then(Value::as_str) else {
            return ResultEnvelope::failure("Access link response missing signedURL")
                .with_metadata(ERROR_KIND_KEY, "data_integrity");
        };

        let expires_at = Utc::now() + chrono::Duration::seconds(ttl_secs as i64);
        ResultEnvelope::ok(json!({
            "path": object_path,
            "signed_url": self.absolute_link(signed),
            "expires_at": expires_at.to_rfc3339(),
        }))
        .with_metadata("bucket", container)
        .with_metadata("expires_in_seconds", ttl_secs)
    }

    async fn head(&self, container: &str, object_path: &str) -> ResultEnvelope {
        let path = format!("/storage/v1/object/{}/{}", container, object_path);

        let response = match self.http.send(reqwest::Method::HEAD, &path, None, &[]).await {
            Ok(response) => response,
            Err(failure) => return failure,
        };
        if response.status >= 500 {
            return response.into_failure("Storage verify error");
        }

        let exists = response.status == 200;
        let header = |name: &str| response.header(name).filter(|_| exists);
        let size = header("content-length").and_then(|v| v.parse::<u64>().ok());

        ResultEnvelope::ok(json!({
            "exists": exists,
            "path": object_path,
            "size": size,
            "content_type": header("content-type"),
            "last_modified": header("last-modified"),
        }))
        .with_metadata("bucket", container)
    }

    fn absolute_link(&self, signed: &str) -> String {
        if signed.starts_with("http://") || signed.starts_with("https://") {
            signed.to_string()
        } else {
            self.http.build_url(&format!("/storage/v1{}", signed))
        }
    }
}

/// Normalize a storage listing: filter by extension and attach full paths
pub fn shape_listing(entries: &[Value], prefix: &str, extension: Option<&str>) -> Vec<Value> {
    let prefix = prefix.trim_end_matches('/');
    entries
        .iter()
        .filter_map(|entry| {
            let name = entry.get("name").and_then(Value::as_str)?;
            if let Some(ext) = extension {
                if !name.ends_with(ext) {
                    return None;
                }
            }
            let path = if prefix.is_empty() {
                name.to_string()
            } else {
                format!("{}/{}", prefix, name)
            };
            let metadata = entry.get("metadata");
            Some(json!({
                "name": name,
                "path": path,
                "size": metadata.and_then(|m| m.get("size")).cloned().unwrap_or(Value::Null),
                "mime_type": metadata.and_then(|m| m.get("mimetype")).cloned().unwrap_or(Value::Null),
                "last_modified": entry.get("updated_at").cloned().unwrap_or(Value::Null),
            }))
        })
        .collect()
}

#[async_trait]
impl ObjectStorage for RestStorage {
    async fn execute(&self, op: StorageOp) -> ResultEnvelope {
        let name = op.name();
        let result = match op {
            StorageOp::ListObjects {
                container,
                prefix,
                extension,
            } => self.list(&container, &prefix, extension.as_deref()).await,
            StorageOp::CreateAccessLink {
                container,
                path,
                ttl_secs,
            } => self.sign(&container, &path, ttl_secs).await,
            StorageOp::VerifyExists { container, path } => self.head(&container, &path).await,
        };
        result.with_metadata("operation", name)
    }
}

fn endpoint_client(config: &ServiceConfig, service: &str) -> Result<HttpClient, BridgeError> {
    let endpoint = config
        .endpoint
        .as_deref()
        .filter(|e| !e.trim().is_empty())
        .ok_or_else(|| BridgeError::ConfigError(format!("{} endpoint is not set", service)))?;
    HttpClient::new(endpoint, None, config.timeout_ms)
}

/// Reachability check: any answer below 500 means the service is up
async fn ping_endpoint(http: &HttpClient, service: &str) -> ResultEnvelope {
    match http.send(reqwest::Method::GET, "", None, &[]).await {
        Ok(response) if response.status < 500 => ResultEnvelope::ok(json!({
            "service": service,
            "status": response.status,
            "response_ms": response.elapsed_ms,
        })),
        Ok(response) => response.into_failure(&format!("{} unavailable", service)),
        Err(failure) => failure,
    }
}

/// Analysis service behind a JSON endpoint
#[derive(Debug, Clone)]
pub struct HttpAnalysisService {
    http: HttpClient,
}

impl HttpAnalysisService {
    pub fn from_config(config: &ServiceConfig) -> Result<Self, BridgeError> {
        Ok(Self {
            http: endpoint_client(config, "analysis")?,
        })
    }
}

#[async_trait]
impl AnalysisService for HttpAnalysisService {
    async fn analyze(&self, request: AnalysisRequest) -> ResultEnvelope {
        let body = json!({
            "image_url": request.url,
            "analysis_type": request.kind.as_str(),
        });

        let response = match self.http.send(reqwest::Method::POST, "", Some(&body), &[]).await {
            Ok(response) => response,
            Err(failure) => return failure,
        };
        if !response.is_success() {
            return response.into_failure("AI analysis failed");
        }

        let size = response.body.to_string().len();
        ResultEnvelope::ok(response.body)
            .with_metadata("analysis_type", request.kind.as_str())
            .with_metadata("duration_ms", response.elapsed_ms)
            .with_metadata("analysis_size_bytes", size)
    }

    async fn ping(&self) -> ResultEnvelope {
        ping_endpoint(&self.http, "analysis").await
    }
}

/// Metadata embedding service behind a JSON endpoint
#[derive(Debug, Clone)]
pub struct HttpEmbeddingService {
    http: HttpClient,
}

impl HttpEmbeddingService {
    pub fn from_config(config: &ServiceConfig) -> Result<Self, BridgeError> {
        Ok(Self {
            http: endpoint_client(config, "embedding")?,
        })
    }
}

#[async_trait]
impl EmbeddingService for HttpEmbeddingService {
    async fn embed(&self, request: EmbedRequest) -> ResultEnvelope {
        let body = json!({
            "source_path": request.source_path,
            "output_path": request.output_path,
            "metadata": request.metadata,
            "compression_quality": request.quality_level,
        });

        let response = match self.http.send(reqwest::Method::POST, "", Some(&body), &[]).await {
            Ok(response) => response,
            Err(failure) => return failure,
        };
        if !response.is_success() {
            return response.into_failure("Metadata embedding failed");
        }

        ResultEnvelope::ok(response.body)
            .with_metadata("output_path", request.output_path)
            .with_metadata("compression_quality", request.quality_level)
            .with_metadata("duration_ms", response.elapsed_ms)
    }

    async fn ping(&self) -> ResultEnvelope {
        ping_endpoint(&self.http, "embedding").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_config() -> StoreConfig {
        StoreConfig {
            base_url: "https://project.supabase.co/".to_string(),
            api_key: "key".to_string(),
            timeout_ms: 1000,
        }
    }

    #[test]
    fn test_build_url() {
        let http = HttpClient::new("https://api.example.com/", None, 1000).unwrap();
        assert_eq!(http.build_url("/users"), "https://api.example.com/users");
        assert_eq!(http.build_url("users"), "https://api.example.com/users");
        assert_eq!(http.build_url(""), "https://api.example.com");
    }

    #[test]
    fn test_claim_is_conditional() {
        let (query, params) = render_sql(&DatabaseOp::ClaimItem {
            item_id: "order-1".to_string(),
        });
        assert!(query.contains("processing_stage = 'pending'"));
        assert!(query.contains("RETURNING id"));
        assert_eq!(params, vec![json!("order-1")]);
        assert!(!requires_match(&DatabaseOp::ClaimItem {
            item_id: "order-1".to_string()
        }));
        assert!(requires_match(&DatabaseOp::CompleteItem {
            item_id: "order-1".to_string()
        }));
    }

    #[test]
    fn test_transaction_markers() {
        assert_eq!(render_sql(&DatabaseOp::Begin).0, "BEGIN");
        assert_eq!(render_sql(&DatabaseOp::Rollback).0, "ROLLBACK");
    }

    #[test]
    fn test_shape_listing_filters_extension() {
        let entries = vec![
            json!({"name": "a.jpg", "metadata": {"size": 10, "mimetype": "image/jpeg"}}),
            json!({"name": "b.png", "metadata": {"size": 20}}),
        ];
        let objects = shape_listing(&entries, "user-1/order-1/", Some(".jpg"));
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0]["path"], json!("user-1/order-1/a.jpg"));
        assert_eq!(objects[0]["size"], json!(10));

        let objects = shape_listing(&entries, "", None);
        assert_eq!(objects[1]["path"], json!("b.png"));
    }

    #[test]
    fn test_absolute_link() {
        let storage = RestStorage::new(&store_config(), &StorageConfig::default()).unwrap();
        assert_eq!(
            storage.absolute_link("/object/sign/orbit-images/a.jpg?token=t"),
            "https://project.supabase.co/storage/v1/object/sign/orbit-images/a.jpg?token=t"
        );
        assert_eq!(storage.default_link_ttl(), 3600);
    }

    #[test]
    fn test_missing_configuration() {
        assert!(RestStore::new(&StoreConfig::default()).is_err());
        assert!(HttpAnalysisService::from_config(&ServiceConfig::default()).is_err());
    }
}
