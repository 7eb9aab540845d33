//! Execution statistics for one orchestration run

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::phase::PhaseId;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionStats {
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub items_processed: u64,
    pub sub_items_processed: u64,
    pub errors: u64,
    pub phases_completed: Vec<PhaseId>,
    /// Derived metrics, present once the run has ended
    pub derived: Option<DerivedMetrics>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DerivedMetrics {
    pub total_duration_seconds: f64,
    pub duration_minutes: f64,
    pub average_item_seconds: f64,
    pub average_sub_item_seconds: f64,
    pub success_rate: f64,
}

impl ExecutionStats {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            ended_at: None,
            items_processed: 0,
            sub_items_processed: 0,
            errors: 0,
            phases_completed: Vec::new(),
            derived: None,
        }
    }

    pub fn total_operations(&self) -> u64 {
        self.items_processed + self.sub_items_processed
    }

    pub fn record_phase(&mut self, phase: PhaseId) {
        self.phases_completed.push(phase);
    }

    /// Set `ended_at` and compute the derived metrics
    pub fn finalize(&mut self, ended_at: DateTime<Utc>) {
        self.ended_at = Some(ended_at);

        let seconds = (ended_at - self.started_at).num_milliseconds().max(0) as f64 / 1000.0;
        let per = |count: u64| if count > 0 { seconds / count as f64 } else { 0.0 };

        self.derived = Some(DerivedMetrics {
            total_duration_seconds: seconds,
            duration_minutes: round2(seconds / 60.0),
            average_item_seconds: per(self.items_processed),
            average_sub_item_seconds: per(self.sub_items_processed),
            success_rate: self.compute_success_rate(),
        });
    }

    /// Percentage of operations that did not error, clamped to 0..=100
    pub fn compute_success_rate(&self) -> f64 {
        let total = self.total_operations();
        if total == 0 {
            return 0.0;
        }
        let rate = (total as f64 - self.errors as f64) / total as f64 * 100.0;
        round2(rate.clamp(0.0, 100.0))
    }

    /// Success rate, available once the run has ended
    pub fn success_rate(&self) -> Option<f64> {
        self.derived.as_ref().map(|d| d.success_rate)
    }

    pub fn is_finalized(&self) -> bool {
        self.ended_at.is_some()
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_metrics_only_after_finalize() {
        let start = Utc::now();
        let mut stats = ExecutionStats::new(start);
        stats.items_processed = 1;
        stats.sub_items_processed = 2;
        assert!(stats.success_rate().is_none());

        stats.finalize(start + Duration::seconds(90));
        let derived = stats.derived.as_ref().unwrap();
        assert_eq!(derived.total_duration_seconds, 90.0);
        assert_eq!(derived.duration_minutes, 1.5);
        assert_eq!(derived.average_item_seconds, 90.0);
        assert_eq!(derived.average_sub_item_seconds, 45.0);
        assert_eq!(stats.success_rate(), Some(100.0));
    }

    #[test]
    fn test_success_rate_edges() {
        let mut stats = ExecutionStats::new(Utc::now());
        assert_eq!(stats.compute_success_rate(), 0.0);

        stats.sub_items_processed = 3;
        stats.errors = 1;
        assert_eq!(stats.compute_success_rate(), 66.67);

        stats.errors = 10;
        assert_eq!(stats.compute_success_rate(), 0.0);
    }
}
