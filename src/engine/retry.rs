//! Retrying operation executor
//!
//! Runs one unit of remote work with bounded attempts and exponential
//! backoff. Attempt `n` (starting at 1) that fails with a transient error
//! is followed by a sleep of `backoff_unit * 2^n`, capped at `max_backoff`.
//! Permanent failures and non-retryable calls are attempted exactly once.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::clock::Clock;
use super::recovery::classify;
use super::result::ResultEnvelope;
use crate::bridge::{DatabaseOp, ObjectStorage, RelationalStore, StorageOp};
use crate::workflow::config::RetryConfig;

#[derive(Debug, Clone)]
pub struct RetryingOperationExecutor {
    clock: Arc<dyn Clock>,
    config: RetryConfig,
}

impl RetryingOperationExecutor {
    pub fn new(clock: Arc<dyn Clock>, config: RetryConfig) -> Self {
        Self { clock, config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Sleep before the attempt following attempt `attempt` (1-based)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let unit = self.config.backoff_unit_ms;
        let delay = unit.saturating_mul(2u64.saturating_pow(attempt));
        Duration::from_millis(delay.min(self.config.max_backoff_ms))
    }

    /// Run `operation` until it succeeds, fails permanently, or attempts run
    /// out. The returned envelope carries `attempts`, `duration_ms` and
    /// `operation` metadata.
    pub async fn run<F, Fut>(&self, label: &str, retryable: bool, mut operation: F) -> ResultEnvelope
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ResultEnvelope>,
    {
        let max_attempts = if retryable {
            self.config.max_attempts.max(1)
        } else {
            1
        };
        let started = self.clock.now().await;
        let mut attempt = 0;

        let outcome = loop {
            attempt += 1;
            let result = operation().await;

            if result.is_success() {
                if attempt > 1 {
                    debug!(operation = label, attempt, "Operation succeeded after retry");
                }
                break result;
            }

            let kind = classify(&result);
            if attempt >= max_attempts || !kind.is_retryable() {
                warn!(
                    operation = label,
                    attempt,
                    kind = kind.as_str(),
                    "Operation failed: {}",
                    result.error_or_empty()
                );
                break result;
            }

            let delay = self.backoff_delay(attempt);
            warn!(
                "Retrying {} (attempt {}/{}) after {:?}: {}",
                label,
                attempt + 1,
                max_attempts,
                delay,
                result.error_or_empty()
            );
            self.clock.sleep(delay).await;
        };

        let elapsed = self.clock.now().await - started;
        outcome
            .with_metadata("operation", label)
            .with_metadata("attempts", attempt)
            .with_metadata("duration_ms", elapsed.num_milliseconds().max(0))
    }

    /// Relational store call with retry
    pub async fn database(&self, store: &dyn RelationalStore, op: DatabaseOp) -> ResultEnvelope {
        let label = format!("database.{}", op.name());
        self.run(&label, true, || store.execute(op.clone())).await
    }

    /// Object storage call with retry
    pub async fn storage(&self, storage: &dyn ObjectStorage, op: StorageOp) -> ResultEnvelope {
        let label = format!("storage.{}", op.name());
        self.run(&label, true, || storage.execute(op.clone())).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::clock::MockClock;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn executor(clock: &MockClock) -> RetryingOperationExecutor {
        RetryingOperationExecutor::new(
            Arc::new(clock.clone()),
            RetryConfig {
                max_attempts: 3,
                backoff_unit_ms: 1000,
                max_backoff_ms: 60_000,
            },
        )
    }

    #[tokio::test]
    async fn test_succeeds_after_two_failures() {
        let clock = MockClock::new();
        let calls = &AtomicU32::new(0);

        let result = executor(&clock)
            .run("flaky", true, move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    ResultEnvelope::failure("connection reset")
                } else {
                    ResultEnvelope::ok(json!({"ok": true}))
                }
            })
            .await;

        assert!(result.is_success());
        assert_eq!(result.metadata_value("attempts"), Some(&json!(3)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausts_attempts_with_exponential_backoff() {
        let clock = MockClock::new();

        let result = executor(&clock)
            .run("down", true, || async { ResultEnvelope::failure("HTTP 503") })
            .await;

        assert!(!result.is_success());
        assert_eq!(result.error(), Some("HTTP 503"));
        assert_eq!(result.metadata_value("attempts"), Some(&json!(3)));
        assert_eq!(
            clock.sleeps().await,
            vec![Duration::from_secs(2), Duration::from_secs(4)]
        );
    }

    #[tokio::test]
    async fn test_non_retryable_runs_once() {
        let clock = MockClock::new();
        let calls = &AtomicU32::new(0);

        let result = executor(&clock)
            .run("insert", false, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                ResultEnvelope::failure("timeout")
            })
            .await;

        assert!(!result.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(clock.sleeps().await.is_empty());
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let clock = MockClock::new();
        let calls = &AtomicU32::new(0);

        let result = executor(&clock)
            .run("lookup", true, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                ResultEnvelope::failure("row not found").with_metadata("status_code", 404)
            })
            .await;

        assert!(!result.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.metadata_value("attempts"), Some(&json!(1)));
    }

    #[test]
    fn test_backoff_is_capped() {
        let executor = RetryingOperationExecutor::new(
            Arc::new(MockClock::new()),
            RetryConfig {
                max_attempts: 10,
                backoff_unit_ms: 1000,
                max_backoff_ms: 10_000,
            },
        );
        assert_eq!(executor.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(executor.backoff_delay(3), Duration::from_secs(8));
        assert_eq!(executor.backoff_delay(4), Duration::from_secs(10));
        assert_eq!(executor.backoff_delay(40), Duration::from_secs(10));
    }
}
