//! Health aggregation
//!
//! Each probe runs in its own task under a timeout, so one probe that
//! hangs or panics cannot stop the others. Component results reduce to
//! `healthy` (all healthy), `unhealthy` (none healthy) or `degraded`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::result::ResultEnvelope;
use crate::bridge::{DatabaseOp, Services, StorageOp};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }

    /// Reduce per-component results
    pub fn aggregate<I>(components: I) -> Self
    where
        I: IntoIterator<Item = bool>,
    {
        let (mut total, mut healthy) = (0usize, 0usize);
        for is_healthy in components {
            total += 1;
            if is_healthy {
                healthy += 1;
            }
        }
        if total > 0 && healthy == total {
            HealthStatus::Healthy
        } else if healthy == 0 {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Degraded
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComponentHealth {
    pub healthy: bool,
    pub details: Option<String>,
    pub response_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub components: BTreeMap<String, ComponentHealth>,
    pub timestamp: DateTime<Utc>,
}

impl HealthReport {
    pub fn is_unhealthy(&self) -> bool {
        self.status == HealthStatus::Unhealthy
    }

    pub fn unhealthy_components(&self) -> Vec<&str> {
        self.components
            .iter()
            .filter(|(_, c)| !c.healthy)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// A named health probe
pub struct Probe {
    pub name: String,
    pub check: BoxFuture<'static, ResultEnvelope>,
}

impl Probe {
    pub fn new(name: impl Into<String>, check: BoxFuture<'static, ResultEnvelope>) -> Self {
        Self {
            name: name.into(),
            check,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthAggregator {
    probe_timeout: Duration,
    last_report: Arc<RwLock<Option<HealthReport>>>,
}

impl Default for HealthAggregator {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl HealthAggregator {
    pub fn new(probe_timeout: Duration) -> Self {
        Self {
            probe_timeout,
            last_report: Arc::new(RwLock::new(None)),
        }
    }

    /// Run every probe and reduce the results
    pub async fn check(&self, probes: Vec<Probe>) -> HealthReport {
        let timeout = self.probe_timeout;
        let handles: Vec<_> = probes
            .into_iter()
            .map(|probe| {
                let name = probe.name;
                let handle = tokio::spawn(async move {
                    let started = Instant::now();
                    let outcome = tokio::time::timeout(timeout, probe.check).await;
                    (outcome, started.elapsed())
                });
                (name, handle)
            })
            .collect();

        let (names, handles): (Vec<_>, Vec<_>) = handles.into_iter().unzip();
        let results = join_all(handles).await;

        let mut components = BTreeMap::new();
        for (name, joined) in names.into_iter().zip(results) {
            let component = match joined {
                Ok((Ok(envelope), elapsed)) => ComponentHealth {
                    healthy: envelope.is_success(),
                    details: envelope.error().map(str::to_string),
                    response_ms: elapsed.as_millis() as u64,
                },
                Ok((Err(_), elapsed)) => ComponentHealth {
                    healthy: false,
                    details: Some(format!("probe timed out after {:?}", timeout)),
                    response_ms: elapsed.as_millis() as u64,
                },
                Err(e) => ComponentHealth {
                    healthy: false,
                    details: Some(format!("probe failed: {}", e)),
                    response_ms: 0,
                },
            };
            if !component.healthy {
                warn!(component = %name, "Health probe failed: {:?}", component.details);
            }
            components.insert(name, component);
        }

        let status = HealthStatus::aggregate(components.values().map(|c| c.healthy));
        debug!(status = status.as_str(), "Health check complete");

        let report = HealthReport {
            status,
            components,
            timestamp: Utc::now(),
        };
        *self.last_report.write().await = Some(report.clone());
        report
    }

    /// Probe the four collaborators
    pub async fn check_services(&self, services: &Services, bucket: &str) -> HealthReport {
        let store = services.store.clone();
        let storage = services.storage.clone();
        let analysis = services.analysis.clone();
        let embedding = services.embedding.clone();
        let bucket = bucket.to_string();

        self.check(vec![
            Probe::new(
                "database",
                Box::pin(async move { store.execute(DatabaseOp::Ping).await }),
            ),
            Probe::new(
                "storage",
                Box::pin(async move {
                    storage
                        .execute(StorageOp::ListObjects {
                            container: bucket,
                            prefix: String::new(),
                            extension: None,
                        })
                        .await
                }),
            ),
            Probe::new("analysis", Box::pin(async move { analysis.ping().await })),
            Probe::new("embedding", Box::pin(async move { embedding.ping().await })),
        ])
        .await
    }

    pub async fn last_report(&self) -> Option<HealthReport> {
        self.last_report.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(name: &str, healthy: bool) -> Probe {
        Probe::new(
            name,
            Box::pin(async move {
                if healthy {
                    ResultEnvelope::ok_empty()
                } else {
                    ResultEnvelope::failure("connection refused")
                }
            }),
        )
    }

    #[tokio::test]
    async fn test_mixed_probes_are_degraded() {
        let report = HealthAggregator::default()
            .check(vec![probe("db", true), probe("storage", false)])
            .await;
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.unhealthy_components(), vec!["storage"]);
        assert_eq!(
            report.components["storage"].details.as_deref(),
            Some("connection refused")
        );
    }

    #[tokio::test]
    async fn test_all_healthy_and_all_unhealthy() {
        let aggregator = HealthAggregator::default();
        let report = aggregator
            .check(vec![probe("db", true), probe("storage", true)])
            .await;
        assert_eq!(report.status, HealthStatus::Healthy);

        let report = aggregator
            .check(vec![probe("db", false), probe("storage", false)])
            .await;
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert_eq!(aggregator.last_report().await, Some(report));
    }

    #[tokio::test]
    async fn test_panicking_probe_is_unhealthy() {
        let report = HealthAggregator::default()
            .check(vec![
                probe("db", true),
                Probe::new(
                    "storage",
                    Box::pin(async {
                        let explode = true;
                        if explode {
                            panic!("probe exploded");
                        }
                        ResultEnvelope::ok_empty()
                    }),
                ),
            ])
            .await;
        assert_eq!(report.status, HealthStatus::Degraded);
        assert!(!report.components["storage"].healthy);
        assert!(report.components["storage"].details.is_some());
    }

    #[tokio::test]
    async fn test_hanging_probe_times_out() {
        let report = HealthAggregator::new(Duration::from_millis(20))
            .check(vec![
                probe("db", true),
                Probe::new(
                    "analysis",
                    Box::pin(async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        ResultEnvelope::ok_empty()
                    }),
                ),
            ])
            .await;
        assert_eq!(report.status, HealthStatus::Degraded);
        assert!(report.components["analysis"]
            .details
            .as_deref()
            .unwrap()
            .contains("timed out"));
    }

    #[test]
    fn test_aggregate_empty_is_unhealthy() {
        assert_eq!(HealthStatus::aggregate(Vec::new()), HealthStatus::Unhealthy);
    }
}
