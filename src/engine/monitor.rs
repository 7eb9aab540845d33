//! Alerts and metric samples
//!
//! Process-wide record of what went wrong (alerts) and how long things
//! took (metrics). Cloning a [`Monitor`] shares the same state.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// Alerts kept in the summary's "recent" list
const RECENT_ALERTS: usize = 5;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Alert {
    pub id: String,
    pub severity: Severity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricSample {
    pub value: f64,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricSummary {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub latest: f64,
    pub unit: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MonitorSummary {
    pub metrics: BTreeMap<String, MetricSummary>,
    pub alerts_by_severity: BTreeMap<Severity, usize>,
    pub total_alerts: usize,
    pub recent_alerts: Vec<Alert>,
}

#[derive(Debug, Default)]
struct MonitorState {
    alerts: Vec<Alert>,
    metrics: BTreeMap<String, Vec<MetricSample>>,
}

#[derive(Debug, Clone, Default)]
pub struct Monitor {
    inner: Arc<RwLock<MonitorState>>,
}

impl Monitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an alert and emit it through tracing
    pub async fn alert(&self, severity: Severity, message: impl Into<String>) -> Alert {
        let message = message.into();
        match severity {
            Severity::Info => info!(severity = severity.as_str(), "{}", message),
            Severity::Warning => warn!(severity = severity.as_str(), "{}", message),
            Severity::Critical => error!(severity = severity.as_str(), "{}", message),
        }

        let alert = Alert {
            id: uuid::Uuid::new_v4().to_string(),
            severity,
            message,
            timestamp: Utc::now(),
        };
        self.inner.write().await.alerts.push(alert.clone());
        alert
    }

    pub async fn record_metric(&self, name: impl Into<String>, value: f64, unit: impl Into<String>) {
        let sample = MetricSample {
            value,
            unit: unit.into(),
            timestamp: Utc::now(),
        };
        self.inner
            .write()
            .await
            .metrics
            .entry(name.into())
            .or_default()
            .push(sample);
    }

    pub async fn alerts(&self) -> Vec<Alert> {
        self.inner.read().await.alerts.clone()
    }

    pub async fn samples(&self, name: &str) -> Vec<MetricSample> {
        self.inner
            .read()
            .await
            .metrics
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn summary(&self) -> MonitorSummary {
        let state = self.inner.read().await;

        let metrics = state
            .metrics
            .iter()
            .filter(|(_, samples)| !samples.is_empty())
            .map(|(name, samples)| {
                let values = samples.iter().map(|s| s.value);
                let min = values.clone().fold(f64::INFINITY, f64::min);
                let max = values.clone().fold(f64::NEG_INFINITY, f64::max);
                let sum: f64 = values.sum();
                let latest = &samples[samples.len() - 1];
                let summary = MetricSummary {
                    count: samples.len(),
                    min,
                    max,
                    avg: sum / samples.len() as f64,
                    latest: latest.value,
                    unit: latest.unit.clone(),
                };
                (name.clone(), summary)
            })
            .collect();

        let mut alerts_by_severity = BTreeMap::new();
        for alert in &state.alerts {
            *alerts_by_severity.entry(alert.severity).or_insert(0) += 1;
        }

        let skip = state.alerts.len().saturating_sub(RECENT_ALERTS);
        MonitorSummary {
            metrics,
            alerts_by_severity,
            total_alerts: state.alerts.len(),
            recent_alerts: state.alerts[skip..].to_vec(),
        }
    }

    pub async fn clear(&self) {
        let mut state = self.inner.write().await;
        state.alerts.clear();
        state.metrics.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_metric_summary() {
        let monitor = Monitor::new();
        monitor.record_metric("item.duration_ms", 120.0, "ms").await;
        monitor.record_metric("item.duration_ms", 80.0, "ms").await;
        monitor.record_metric("item.duration_ms", 100.0, "ms").await;

        let summary = monitor.summary().await;
        let item = &summary.metrics["item.duration_ms"];
        assert_eq!(item.count, 3);
        assert_eq!(item.min, 80.0);
        assert_eq!(item.max, 120.0);
        assert_eq!(item.avg, 100.0);
        assert_eq!(item.latest, 100.0);
    }

    #[tokio::test]
    async fn test_alert_counts_and_recent_window() {
        let monitor = Monitor::new();
        for i in 0..6 {
            monitor.alert(Severity::Warning, format!("warning {}", i)).await;
        }
        monitor.alert(Severity::Critical, "storage unreachable").await;

        let summary = monitor.summary().await;
        assert_eq!(summary.total_alerts, 7);
        assert_eq!(summary.alerts_by_severity[&Severity::Warning], 6);
        assert_eq!(summary.alerts_by_severity[&Severity::Critical], 1);
        assert_eq!(summary.recent_alerts.len(), RECENT_ALERTS);
        assert_eq!(summary.recent_alerts[4].message, "storage unreachable");
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let monitor = Monitor::new();
        let other = monitor.clone();
        other.alert(Severity::Info, "run started").await;
        assert_eq!(monitor.alerts().await.len(), 1);

        monitor.clear().await;
        assert!(other.alerts().await.is_empty());
    }
}
