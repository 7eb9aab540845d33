//! Uniform outcome envelope
//!
//! Every collaborator call and every orchestration step produces exactly one
//! [`ResultEnvelope`]. Failures never cross a component boundary as Rust
//! errors; they are folded into `success = false` envelopes carrying a
//! human-readable message.

use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const UNKNOWN_ERROR: &str = "unknown error";

/// Result of a collaborator call or orchestration step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    success: bool,
    data: Option<Value>,
    error: Option<String>,
    metadata: Map<String, Value>,
    timestamp: DateTime<Utc>,
}

impl ResultEnvelope {
    /// Successful outcome carrying `data`
    pub fn ok(data: impl Into<Value>) -> Self {
        Self {
            success: true,
            data: Some(data.into()),
            error: None,
            metadata: Map::new(),
            timestamp: Utc::now(),
        }
    }

    /// Successful outcome without a payload
    pub fn ok_empty() -> Self {
        Self {
            success: true,
            data: None,
            error: None,
            metadata: Map::new(),
            timestamp: Utc::now(),
        }
    }

    /// Failed outcome. An empty message is replaced so that a failure
    /// always carries a non-empty error.
    pub fn failure(error: impl Into<String>) -> Self {
        let error = error.into();
        let error = if error.trim().is_empty() {
            UNKNOWN_ERROR.to_string()
        } else {
            error
        };
        Self {
            success: false,
            data: None,
            error: Some(error),
            metadata: Map::new(),
            timestamp: Utc::now(),
        }
    }

    /// Fold a `Result` into an envelope at a component boundary
    pub fn from_result<T, E>(result: Result<T, E>) -> Self
    where
        T: Serialize,
        E: Display,
    {
        match result {
            Ok(value) => match serde_json::to_value(value) {
                Ok(Value::Null) => Self::ok_empty(),
                Ok(data) => Self::ok(data),
                Err(e) => Self::failure(format!("failed to serialize result: {}", e)),
            },
            Err(e) => Self::failure(e.to_string()),
        }
    }

    /// Attach a metadata entry while the envelope is being built
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Attach a payload to a failure (e.g. partial results)
    pub fn with_data(mut self, data: impl Into<Value>) -> Self {
        self.data = Some(data.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    pub fn into_data(self) -> Option<Value> {
        self.data
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Error message, or an empty string for successful envelopes
    pub fn error_or_empty(&self) -> &str {
        self.error.as_deref().unwrap_or("")
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    pub fn metadata_value(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Rows returned by a relational store call (empty when not a row set)
    pub fn rows(&self) -> &[Value] {
        match &self.data {
            Some(Value::Array(rows)) => rows,
            _ => &[],
        }
    }

    /// Convert into a `Result`, dropping metadata
    pub fn into_result(self) -> Result<Option<Value>, String> {
        if self.success {
            Ok(self.data)
        } else {
            Err(self.error.unwrap_or_else(|| UNKNOWN_ERROR.to_string()))
        }
    }
}
