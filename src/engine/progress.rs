//! Progress ledger
//!
//! Ordered todo list plus aggregate workflow counters. The ledger itself
//! is synchronous; the orchestrator shares it behind a lock so that every
//! mutation is serialized.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::LedgerError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TodoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TodoStatus::Pending => "pending",
            TodoStatus::InProgress => "in_progress",
            TodoStatus::Completed => "completed",
            TodoStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TodoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TodoEntry {
    pub id: u64,
    pub content: String,
    pub status: TodoStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Aggregate counters kept alongside the todos
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WorkflowCounters {
    pub started_at: Option<DateTime<Utc>>,
    pub items_processed: u64,
    pub sub_items_processed: u64,
    pub errors: u64,
}

/// Partial update merged into [`WorkflowCounters`]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CounterUpdate {
    pub started_at: Option<DateTime<Utc>>,
    pub items_processed: Option<u64>,
    pub sub_items_processed: Option<u64>,
    pub errors: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TodoList {
    pub todos: Vec<TodoEntry>,
    pub by_status: BTreeMap<TodoStatus, usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Progress {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub percent_complete: f64,
    pub counters: WorkflowCounters,
}

#[derive(Debug, Clone)]
pub struct ProgressLedger {
    todos: Vec<TodoEntry>,
    next_id: u64,
    counters: WorkflowCounters,
}

impl Default for ProgressLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressLedger {
    pub fn new() -> Self {
        Self {
            todos: Vec::new(),
            next_id: 1,
            counters: WorkflowCounters::default(),
        }
    }

    pub fn add_todo(&mut self, content: impl Into<String>, status: TodoStatus) -> TodoEntry {
        let now = Utc::now();
        let todo = TodoEntry {
            id: self.next_id,
            content: content.into(),
            status,
            created_at: now,
            updated_at: now,
        };
        self.next_id += 1;
        self.todos.push(todo.clone());
        todo
    }

    pub fn update_todo(&mut self, id: u64, status: TodoStatus) -> Result<TodoEntry, LedgerError> {
        let todo = self
            .todos
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(LedgerError::NotFound(id))?;
        todo.status = status;
        todo.updated_at = Utc::now();
        Ok(todo.clone())
    }

    pub fn list_todos(&self) -> TodoList {
        TodoList {
            todos: self.todos.clone(),
            by_status: self.status_counts(),
        }
    }

    pub fn get_progress(&self) -> Progress {
        let counts = self.status_counts();
        let count = |status: TodoStatus| counts.get(&status).copied().unwrap_or(0);
        let total = self.todos.len();
        let completed = count(TodoStatus::Completed);

        let percent_complete = if total == 0 {
            0.0
        } else {
            (completed as f64 / total as f64 * 10_000.0).round() / 100.0
        };

        Progress {
            total,
            pending: count(TodoStatus::Pending),
            in_progress: count(TodoStatus::InProgress),
            completed,
            failed: count(TodoStatus::Failed),
            percent_complete,
            counters: self.counters.clone(),
        }
    }

    /// Merge `update` into the counters; `started_at` is set on the first
    /// update if nobody set it before
    pub fn update_stats(&mut self, update: CounterUpdate) -> WorkflowCounters {
        if let Some(started_at) = update.started_at {
            self.counters.started_at = Some(started_at);
        }
        if self.counters.started_at.is_none() {
            self.counters.started_at = Some(Utc::now());
        }
        if let Some(items) = update.items_processed {
            self.counters.items_processed = items;
        }
        if let Some(sub_items) = update.sub_items_processed {
            self.counters.sub_items_processed = sub_items;
        }
        if let Some(errors) = update.errors {
            self.counters.errors = errors;
        }
        self.counters.clone()
    }

    pub fn counters(&self) -> &WorkflowCounters {
        &self.counters
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    fn status_counts(&self) -> BTreeMap<TodoStatus, usize> {
        let mut counts = BTreeMap::new();
        for todo in &self.todos {
            *counts.entry(todo.status).or_insert(0) += 1;
        }
        counts
    }
}
