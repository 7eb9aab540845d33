//! Error classification and category recovery
//!
//! Every failure envelope is classified into an [`ErrorKind`]. Transient
//! failures are retried by the executor; transient and data-integrity
//! failures that survive retry get one category-specific recovery
//! procedure before the failed step is re-attempted.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, instrument};

use super::error::OrchestratorError;
use super::clock::Clock;
use super::monitor::{Monitor, Severity};
use super::result::ResultEnvelope;
use super::retry::RetryingOperationExecutor;
use crate::bridge::{DatabaseOp, Services, StorageOp};

static STATUS_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([45]\d{2})\b").expect("valid regex"));

/// Metadata key an adapter or step may use to pin the classification
pub const ERROR_KIND_KEY: &str = "error_kind";

/// Quality reduction applied by embedding recovery
const QUALITY_STEP: u8 = 10;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Timeouts, 5xx, rate limits, lock conflicts
    TransientRemote,
    /// Validation errors, not-found
    PermanentRemote,
    /// A step's postcondition did not hold
    DataIntegrity,
    /// Pre-flight health gate failed
    SystemUnhealthy,
    /// Run wall-clock budget exceeded
    Timeout,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::TransientRemote => "transient_remote",
            ErrorKind::PermanentRemote => "permanent_remote",
            ErrorKind::DataIntegrity => "data_integrity",
            ErrorKind::SystemUnhealthy => "system_unhealthy",
            ErrorKind::Timeout => "timeout",
        }
    }

    /// Worth another attempt with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::TransientRemote)
    }

    /// Worth one category recovery followed by a re-attempt
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ErrorKind::TransientRemote | ErrorKind::DataIntegrity)
    }
}

fn classify_status(status: u64) -> ErrorKind {
    match status {
        408 | 429 => ErrorKind::TransientRemote,
        400..=499 => ErrorKind::PermanentRemote,
        _ => ErrorKind::TransientRemote,
    }
}

/// Classify a failure envelope. Successful envelopes classify as transient
/// and are never looked at by callers.
pub fn classify(envelope: &ResultEnvelope) -> ErrorKind {
    if let Some(kind) = envelope
        .metadata_value(ERROR_KIND_KEY)
        .and_then(|v| serde_json::from_value::<ErrorKind>(v.clone()).ok())
    {
        return kind;
    }

    if let Some(status) = envelope.metadata_value("status_code").and_then(|v| v.as_u64()) {
        return classify_status(status);
    }

    let text = envelope.error_or_empty().to_lowercase();
    if let Some(status) = STATUS_CODE
        .captures(&text)
        .and_then(|c| c[1].parse::<u64>().ok())
    {
        return classify_status(status);
    }

    if text.contains("not found") || text.contains("invalid") {
        return ErrorKind::PermanentRemote;
    }

    // timeout, connection and lock failures land here too
    ErrorKind::TransientRemote
}

/// Collaborator a failed step belongs to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryCategory {
    Database,
    Storage,
    Analysis,
    Embedding,
}

impl RecoveryCategory {
    pub const ALL: [RecoveryCategory; 4] = [
        RecoveryCategory::Database,
        RecoveryCategory::Storage,
        RecoveryCategory::Analysis,
        RecoveryCategory::Embedding,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryCategory::Database => "database",
            RecoveryCategory::Storage => "storage",
            RecoveryCategory::Analysis => "analysis",
            RecoveryCategory::Embedding => "embedding",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            RecoveryCategory::Database => "Database Error",
            RecoveryCategory::Storage => "Storage Error",
            RecoveryCategory::Analysis => "AI Analysis Error",
            RecoveryCategory::Embedding => "Metadata Embed Error",
        }
    }

    /// Human-readable procedure, used in the agent brief
    pub fn procedure(&self) -> &'static [&'static str] {
        match self {
            RecoveryCategory::Database => &[
                "Check whether the error is transient (connection timeout, lock conflict)",
                "If transient, retry up to the configured attempts with exponential backoff",
                "If persistent, record the error and continue with the next operation",
                "For transaction failures, make sure the rollback was issued",
                "Record the failure in the progress ledger",
            ],
            RecoveryCategory::Storage => &[
                "Verify the storage container exists and is accessible",
                "Check object paths for correctness",
                "Check the object exists before creating access links",
                "Retry the operation once",
                "If persistent, mark the item failed and continue",
            ],
            RecoveryCategory::Analysis => &[
                "Check the access link for the sub-item is reachable",
                "If the service is down, wait for the cooldown and retry once",
                "Record the failure for manual review",
            ],
            RecoveryCategory::Embedding => &[
                "Verify the source object exists",
                "Validate the metadata payload",
                "Retry once with a lower quality level",
                "If persistent, mark the sub-item failed and continue with the others",
            ],
        }
    }
}

impl fmt::Display for RecoveryCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecoveryCategory {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        let stem = normalized.strip_suffix("_error").unwrap_or(&normalized);
        match stem {
            "database" | "db" => Ok(RecoveryCategory::Database),
            "storage" => Ok(RecoveryCategory::Storage),
            "analysis" | "ai_analysis" => Ok(RecoveryCategory::Analysis),
            "embedding" | "metadata_embed" => Ok(RecoveryCategory::Embedding),
            _ => Err(OrchestratorError::UnknownRecoveryCategory(s.to_string())),
        }
    }
}

/// Parameters a recovery may change for the re-attempted step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepAdjustments {
    pub quality_level: u8,
}

/// Result of one recovery procedure
#[derive(Debug, Clone)]
pub struct RecoveryOutcome {
    pub envelope: ResultEnvelope,
    pub adjustments: StepAdjustments,
}

impl RecoveryOutcome {
    pub fn is_success(&self) -> bool {
        self.envelope.is_success()
    }
}

/// Runs category recovery procedures against the collaborators
#[derive(Debug, Clone)]
pub struct RecoveryManager {
    services: Services,
    executor: RetryingOperationExecutor,
    clock: Arc<dyn Clock>,
    monitor: Monitor,
    bucket: String,
    analysis_cooldown: Duration,
    min_quality_level: u8,
}

impl RecoveryManager {
    pub fn new(
        services: Services,
        executor: RetryingOperationExecutor,
        clock: Arc<dyn Clock>,
        monitor: Monitor,
        bucket: impl Into<String>,
    ) -> Self {
        Self {
            services,
            executor,
            clock,
            monitor,
            bucket: bucket.into(),
            analysis_cooldown: Duration::from_secs(30),
            min_quality_level: 60,
        }
    }

    pub fn with_analysis_cooldown(mut self, cooldown: Duration) -> Self {
        self.analysis_cooldown = cooldown;
        self
    }

    pub fn with_min_quality_level(mut self, level: u8) -> Self {
        self.min_quality_level = level;
        self
    }

    /// Run the recovery procedure for `category`
    #[instrument(skip(self, adjustments), fields(category = %category))]
    pub async fn recover(
        &self,
        category: RecoveryCategory,
        details: &str,
        adjustments: StepAdjustments,
    ) -> RecoveryOutcome {
        info!("Running recovery: {}", details);

        let mut next = adjustments;
        let (probe, action) = match category {
            RecoveryCategory::Database => (
                self.executor
                    .database(self.services.store.as_ref(), DatabaseOp::Ping)
                    .await,
                "store connectivity re-checked",
            ),
            RecoveryCategory::Storage => (
                self.executor
                    .storage(
                        self.services.storage.as_ref(),
                        StorageOp::ListObjects {
                            container: self.bucket.clone(),
                            prefix: String::new(),
                            extension: None,
                        },
                    )
                    .await,
                "storage container access re-checked",
            ),
            RecoveryCategory::Analysis => {
                self.clock.sleep(self.analysis_cooldown).await;
                let analysis = self.services.analysis.clone();
                (
                    self.executor
                        .run("analysis.ping", true, || analysis.ping())
                        .await,
                    "analysis service re-checked after cooldown",
                )
            }
            RecoveryCategory::Embedding => {
                next.quality_level = adjustments
                    .quality_level
                    .saturating_sub(QUALITY_STEP)
                    .max(self.min_quality_level);
                let embedding = self.services.embedding.clone();
                (
                    self.executor
                        .run("embedding.ping", true, || embedding.ping())
                        .await,
                    "embedding service re-checked, quality lowered",
                )
            }
        };

        let envelope = if probe.is_success() {
            ResultEnvelope::ok(json!({
                "category": category.as_str(),
                "details": details,
                "action": action,
                "quality_level": next.quality_level,
            }))
        } else {
            let message = format!(
                "{} recovery failed: {} (original error: {})",
                category.as_str(),
                probe.error_or_empty(),
                details
            );
            self.monitor.alert(Severity::Critical, message.clone()).await;
            ResultEnvelope::failure(message)
        };

        RecoveryOutcome {
            envelope: envelope.with_metadata("category", category.as_str()),
            adjustments: next,
        }
    }
}
