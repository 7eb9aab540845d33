//! Orchestrator configuration
//!
//! Loaded from an optional YAML file, then overlaid by environment
//! variables. Every field has a default, so an empty file (or no file)
//! is a valid starting point:
//!
//! ```yaml
//! store:
//!   base_url: https://project.supabase.co
//!   api_key: service-role-key
//! storage:
//!   bucket: orbit-images
//! retry:
//!   max_attempts: 3
//!   backoff_unit_ms: 1000
//! run_timeout_secs: 300
//! sub_item_failure_policy: fail_item
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::model::AnalysisKind;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error in {file}: {error}")]
    Yaml {
        file: String,
        error: serde_yaml::Error,
    },

    #[error("Invalid value for {var}: '{value}'")]
    InvalidEnv { var: String, value: String },
}

/// Relational store / storage service connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreConfig {
    #[serde(default)]
    pub base_url: String,

    #[serde(default)]
    pub api_key: String,

    /// Request timeout in milliseconds
    #[serde(default = "default_store_timeout")]
    pub timeout_ms: u64,
}

fn default_store_timeout() -> u64 {
    30_000
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            timeout_ms: default_store_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    #[serde(default = "default_bucket")]
    pub bucket: String,

    /// Lifetime of temporary access links
    #[serde(default = "default_link_ttl")]
    pub link_ttl_secs: u64,

    #[serde(default = "default_storage_timeout")]
    pub timeout_ms: u64,
}

fn default_bucket() -> String {
    "orbit-images".to_string()
}

fn default_link_ttl() -> u64 {
    3600
}

fn default_storage_timeout() -> u64 {
    60_000
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bucket: default_bucket(),
            link_ttl_secs: default_link_ttl(),
            timeout_ms: default_storage_timeout(),
        }
    }
}

/// Remote analysis or embedding service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceConfig {
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default = "default_service_timeout")]
    pub timeout_ms: u64,
}

fn default_service_timeout() -> u64 {
    60_000
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_ms: default_service_timeout(),
        }
    }
}

impl ServiceConfig {
    fn with_timeout(timeout_ms: u64) -> Self {
        Self {
            endpoint: None,
            timeout_ms,
        }
    }
}

fn default_analysis() -> ServiceConfig {
    ServiceConfig::with_timeout(120_000)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff time unit; attempt `n` waits `unit * 2^n`
    #[serde(default = "default_backoff_unit")]
    pub backoff_unit_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_unit() -> u64 {
    1000
}

fn default_max_backoff() -> u64 {
    60_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_unit_ms: default_backoff_unit(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

/// What a sub-item failure (after recovery) means for its work item
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SubItemFailurePolicy {
    /// The work item is marked failed; completed sub-items stay completed
    #[default]
    FailItem,
    /// The sub-item is marked failed and the work item still completes
    AllowPartial,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default = "default_analysis")]
    pub analysis: ServiceConfig,

    #[serde(default)]
    pub embedding: ServiceConfig,

    /// Use deterministic mock analysis/embedding services
    #[serde(default)]
    pub mock_mode: bool,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Wall-clock budget for one run
    #[serde(default = "default_run_timeout")]
    pub run_timeout_secs: u64,

    /// Upper bound on work items handled by one run
    #[serde(default = "default_max_items")]
    pub max_items_per_run: usize,

    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    #[serde(default)]
    pub analysis_kind: AnalysisKind,

    #[serde(default = "default_quality")]
    pub quality_level: u8,

    /// Floor for quality reductions during embedding recovery
    #[serde(default = "default_min_quality")]
    pub min_quality_level: u8,

    /// Wait before re-checking the analysis service during recovery
    #[serde(default = "default_analysis_cooldown")]
    pub analysis_cooldown_ms: u64,

    #[serde(default)]
    pub sub_item_failure_policy: SubItemFailurePolicy,

    /// Check processed copies exist after embedding
    #[serde(default = "default_true")]
    pub verify_outputs: bool,
}

fn default_run_timeout() -> u64 {
    300
}

fn default_max_items() -> usize {
    1000
}

fn default_probe_timeout() -> u64 {
    10_000
}

fn default_quality() -> u8 {
    95
}

fn default_min_quality() -> u8 {
    60
}

fn default_analysis_cooldown() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            storage: StorageConfig::default(),
            analysis: default_analysis(),
            embedding: ServiceConfig::default(),
            mock_mode: false,
            retry: RetryConfig::default(),
            run_timeout_secs: default_run_timeout(),
            max_items_per_run: default_max_items(),
            probe_timeout_ms: default_probe_timeout(),
            analysis_kind: AnalysisKind::default(),
            quality_level: default_quality(),
            min_quality_level: default_min_quality(),
            analysis_cooldown_ms: default_analysis_cooldown(),
            sub_item_failure_policy: SubItemFailurePolicy::default(),
            verify_outputs: true,
        }
    }
}

/// Non-secret view of the configuration, embedded in reports
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfigSummary {
    pub store_configured: bool,
    pub bucket: String,
    pub mock_mode: bool,
    pub max_attempts: u32,
    pub run_timeout_secs: u64,
    pub max_items_per_run: usize,
    pub quality_level: u8,
    pub sub_item_failure_policy: SubItemFailurePolicy,
}

impl OrchestratorConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content).map_err(|error| ConfigError::Yaml {
            file: path.display().to_string(),
            error,
        })
    }

    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
    }

    /// Load `path` when given, then apply process environment overrides
    pub fn resolve(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    /// Overlay values from `lookup` (normally the process environment)
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("SUPABASE_URL") {
            self.store.base_url = url;
        }
        if let Some(key) = lookup("SUPABASE_SERVICE_ROLE_KEY") {
            self.store.api_key = key;
        }
        if let Some(bucket) = lookup("STORAGE_BUCKET") {
            self.storage.bucket = bucket;
        }
        if let Some(endpoint) = lookup("GEMINI_ENDPOINT") {
            self.analysis.endpoint = Some(endpoint);
        }
        if let Some(endpoint) = lookup("METADATA_ENDPOINT") {
            self.embedding.endpoint = Some(endpoint);
        }
        if let Some(value) = lookup("MOCK_MODE") {
            self.mock_mode = parse_bool("MOCK_MODE", &value)?;
        }
        if let Some(value) = lookup("MAX_RETRIES") {
            self.retry.max_attempts = parse_number("MAX_RETRIES", &value)?;
        }
        if let Some(value) = lookup("TIMEOUT_SECONDS") {
            self.run_timeout_secs = parse_number("TIMEOUT_SECONDS", &value)?;
        }
        if let Some(value) = lookup("MAX_ITERATIONS") {
            self.max_items_per_run = parse_number("MAX_ITERATIONS", &value)?;
        }
        Ok(())
    }

    /// Problems that would stop a run; empty when the config is usable
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.store.base_url.trim().is_empty() {
            problems.push("store.base_url is required (SUPABASE_URL)".to_string());
        }
        if self.store.api_key.trim().is_empty() {
            problems.push("store.api_key is required (SUPABASE_SERVICE_ROLE_KEY)".to_string());
        }
        if !self.mock_mode {
            if self.analysis.endpoint.is_none() {
                problems.push(
                    "analysis.endpoint is required unless mock_mode is set (GEMINI_ENDPOINT)"
                        .to_string(),
                );
            }
            if self.embedding.endpoint.is_none() {
                problems.push(
                    "embedding.endpoint is required unless mock_mode is set (METADATA_ENDPOINT)"
                        .to_string(),
                );
            }
        }
        if self.retry.max_attempts == 0 {
            problems.push("retry.max_attempts must be at least 1".to_string());
        }
        if self.min_quality_level > self.quality_level {
            problems.push(format!(
                "min_quality_level ({}) exceeds quality_level ({})",
                self.min_quality_level, self.quality_level
            ));
        }

        problems
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn analysis_cooldown(&self) -> Duration {
        Duration::from_millis(self.analysis_cooldown_ms)
    }

    pub fn summary(&self) -> ConfigSummary {
        ConfigSummary {
            store_configured: !self.store.base_url.is_empty() && !self.store.api_key.is_empty(),
            bucket: self.storage.bucket.clone(),
            mock_mode: self.mock_mode,
            max_attempts: self.retry.max_attempts,
            run_timeout_secs: self.run_timeout_secs,
            max_items_per_run: self.max_items_per_run,
            quality_level: self.quality_level,
            sub_item_failure_policy: self.sub_item_failure_policy,
        }
    }
}

fn parse_bool(var: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            var: var.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_number<T: std::str::FromStr>(var: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var: var.to_string(),
        value: value.to_string(),
    })
}
