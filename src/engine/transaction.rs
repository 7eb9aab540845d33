//! Logical transactions over the relational store
//!
//! `begin`, each operation once in order, then `commit`. The first failing
//! operation triggers a single `rollback` and the whole transaction fails;
//! a failing rollback is logged but never replaces the original error.

use serde_json::{json, Value};
use tracing::{debug, error, warn};

use super::recovery::ERROR_KIND_KEY;
use super::result::ResultEnvelope;
use super::retry::RetryingOperationExecutor;
use crate::bridge::{DatabaseOp, RelationalStore};

const CLASSIFICATION_KEYS: [&str; 2] = [ERROR_KIND_KEY, "status_code"];

#[derive(Debug, Clone)]
pub struct TransactionCoordinator {
    executor: RetryingOperationExecutor,
}

impl TransactionCoordinator {
    pub fn new(executor: RetryingOperationExecutor) -> Self {
        Self { executor }
    }

    /// Execute `ops` as one transaction. On success the data is the ordered
    /// list of each operation's data.
    pub async fn execute(&self, store: &dyn RelationalStore, ops: Vec<DatabaseOp>) -> ResultEnvelope {
        let operation_count = ops.len();

        let begin = self.step(store, "transaction.begin", DatabaseOp::Begin).await;
        if !begin.is_success() {
            return ResultEnvelope::failure(format!(
                "Transaction failed to begin: {}",
                begin.error_or_empty()
            ))
            .with_metadata("operations", operation_count);
        }

        let mut results: Vec<Value> = Vec::with_capacity(operation_count);
        for (index, op) in ops.into_iter().enumerate() {
            let label = format!("transaction.{}", op.name());
            let result = self.step(store, &label, op).await;

            if !result.is_success() {
                warn!(
                    step = index,
                    "Transaction step failed, rolling back: {}",
                    result.error_or_empty()
                );
                let rollback = self.step(store, "transaction.rollback", DatabaseOp::Rollback).await;
                if !rollback.is_success() {
                    error!("Rollback failed: {}", rollback.error_or_empty());
                }

                let mut failure = ResultEnvelope::failure(format!(
                    "Transaction failed at step {}: {}",
                    index,
                    result.error_or_empty()
                ))
                .with_data(json!({"completed": results}))
                .with_metadata("failed_step", index)
                .with_metadata("rolled_back", rollback.is_success())
                .with_metadata("operations", operation_count);
                // keep the failing step's classification
                for key in CLASSIFICATION_KEYS {
                    if let Some(value) = result.metadata_value(key) {
                        failure = failure.with_metadata(key, value.clone());
                    }
                }
                return failure;
            }

            results.push(result.into_data().unwrap_or(Value::Null));
        }

        let commit = self.step(store, "transaction.commit", DatabaseOp::Commit).await;
        if !commit.is_success() {
            return ResultEnvelope::failure(format!(
                "Transaction commit failed: {}",
                commit.error_or_empty()
            ))
            .with_metadata("operations", operation_count);
        }

        debug!(operations = operation_count, "Transaction committed");
        ResultEnvelope::ok(Value::Array(results)).with_metadata("operations", operation_count)
    }

    async fn step(&self, store: &dyn RelationalStore, label: &str, op: DatabaseOp) -> ResultEnvelope {
        self.executor
            .run(label, false, || store.execute(op.clone()))
            .await
    }
}
