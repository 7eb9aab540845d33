//! Orchestration context
//!
//! Snapshot of the state a run works from. It is rebuilt at the start of
//! every run and only the run that owns it mutates it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::model::WorkItemRef;
use crate::engine::phase::PhaseId;

/// Runtime context for one orchestration run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowContext {
    /// Pending, paid work items at the last count
    pub pending_count: u64,

    /// Whether the storage container answered at context build time
    pub storage_accessible: bool,

    /// Phase the run is in (or resumes at)
    pub current_phase: PhaseId,

    /// Phases completed so far, in order (discovery may appear repeatedly)
    pub completed_phases: Vec<PhaseId>,

    /// Work item currently held by this run
    pub active_item: Option<WorkItemRef>,

    /// Most recent error observed by the run
    pub last_error: Option<String>,

    pub timestamp: DateTime<Utc>,
}

impl Default for WorkflowContext {
    fn default() -> Self {
        Self {
            pending_count: 0,
            storage_accessible: false,
            current_phase: PhaseId::Initialization,
            completed_phases: Vec::new(),
            active_item: None,
            last_error: None,
            timestamp: Utc::now(),
        }
    }
}

impl WorkflowContext {
    /// Fresh context for a run starting at `initialization`
    pub fn new(pending_count: u64, storage_accessible: bool, timestamp: DateTime<Utc>) -> Self {
        Self {
            pending_count,
            storage_accessible,
            timestamp,
            ..Default::default()
        }
    }

    /// Same context, resumed at an arbitrary phase
    pub fn resume_at(mut self, phase: PhaseId) -> Self {
        self.current_phase = phase;
        self
    }

    pub fn record_completed(&mut self, phase: PhaseId) {
        self.completed_phases.push(phase);
    }

    pub fn record_error(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
    }

    pub fn active_item_id(&self) -> Option<&str> {
        self.active_item.as_ref().map(|item| item.id.as_str())
    }

    pub fn has_completed(&self, phase: PhaseId) -> bool {
        self.completed_phases.contains(&phase)
    }
}
