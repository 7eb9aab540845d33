//! Orchestrator error types

use crate::bridge::BridgeError;
use crate::workflow::config::ConfigError;

/// Errors raised while building or driving an orchestrator.
///
/// Failures of individual steps never use this type; they travel as
/// failure envelopes. These are the faults that prevent an orchestrator
/// from being constructed or a command from running at all.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("Unknown recovery category: {0}")]
    UnknownRecoveryCategory(String),

    #[error("Unknown phase: {0}")]
    UnknownPhase(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Invalid agent report: {0}")]
    InvalidAgentReport(#[from] serde_json::Error),
}

/// Errors raised by the progress ledger
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("Todo {0} not found")]
    NotFound(u64),
}
