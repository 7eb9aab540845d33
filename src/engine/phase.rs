//! Workflow phases
//!
//! The workflow is a linear state machine:
//!
//! ```text
//! initialization → discovery → processing → finalization → continuation ─┐
//!                      ▲                                                  │
//!                      └──────────── pending_count > 0 ───────────────────┤
//!                                                                         ▼
//!                                                                     (terminal)
//! ```
//!
//! Each [`PhaseId`] has a static [`Phase`] descriptor with its ordered
//! steps, success criterion and successor. Transitions are an exhaustive
//! `match`, so adding a phase forces every transition to be revisited.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::workflow::WorkflowContext;

/// Identifier of a workflow phase
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseId {
    #[default]
    Initialization,
    Discovery,
    Processing,
    Finalization,
    Continuation,
}

/// Static description of a phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Phase {
    pub id: PhaseId,
    pub title: &'static str,
    pub description: &'static str,
    pub steps: &'static [&'static str],
    pub success_criteria: &'static str,
    pub next: Option<PhaseId>,
}

const INITIALIZATION: Phase = Phase {
    id: PhaseId::Initialization,
    title: "Phase 0: Pre-flight Validation",
    description: "Initialize progress tracking and validate collaborator connectivity",
    steps: &[
        "Initialize progress tracking with a workflow todo",
        "Test relational store connectivity",
        "Verify storage container access",
        "Record the run start in workflow statistics",
    ],
    success_criteria: "Relational store and storage container reachable",
    next: Some(PhaseId::Discovery),
};

const DISCOVERY: Phase = Phase {
    id: PhaseId::Discovery,
    title: "Phase 1: Work Item Discovery & Locking",
    description: "Find the oldest pending work item and claim it exclusively",
    steps: &[
        "Query pending work items with completed payment, oldest first",
        "Claim the first candidate with a conditional pending → processing update",
        "Skip candidates already claimed by another run",
        "Mark the item's batch as processing",
        "Discover all pending sub-items of the claimed item",
    ],
    success_criteria: "Work item locked and sub-items discovered",
    next: Some(PhaseId::Processing),
};

const PROCESSING: Phase = Phase {
    id: PhaseId::Processing,
    title: "Phase 2: Sub-item Processing Pipeline",
    description: "Analyze each sub-item and embed the analysis into a processed copy",
    steps: &[
        "Verify the original object exists in storage",
        "Create a temporary access link for the original",
        "Analyze the sub-item with the analysis service",
        "Store the complete analysis payload",
        "Embed analysis metadata into a processed copy",
        "Verify the processed copy exists in storage",
        "Record the processed path and mark the sub-item completed",
    ],
    success_criteria: "All sub-items processed and verified",
    next: Some(PhaseId::Finalization),
};

const FINALIZATION: Phase = Phase {
    id: PhaseId::Finalization,
    title: "Phase 3: Work Item Finalization & Notification",
    description: "Complete the work item and notify its owner",
    steps: &[
        "Verify every sub-item of the work item is completed",
        "Mark the work item and its batch completed",
        "Enqueue the owner notification",
        "Record completion metrics and timing",
    ],
    success_criteria: "Work item completed and owner notification enqueued",
    next: Some(PhaseId::Continuation),
};

const CONTINUATION: Phase = Phase {
    id: PhaseId::Continuation,
    title: "Phase 4: Workflow Continuation",
    description: "Decide whether more work items remain",
    steps: &[
        "Re-count pending work items",
        "Return to discovery when pending work remains",
        "Otherwise finish the run",
    ],
    success_criteria: "Pending work re-evaluated",
    next: None,
};

impl PhaseId {
    /// All phases in chain order
    pub const ALL: [PhaseId; 5] = [
        PhaseId::Initialization,
        PhaseId::Discovery,
        PhaseId::Processing,
        PhaseId::Finalization,
        PhaseId::Continuation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseId::Initialization => "initialization",
            PhaseId::Discovery => "discovery",
            PhaseId::Processing => "processing",
            PhaseId::Finalization => "finalization",
            PhaseId::Continuation => "continuation",
        }
    }

    pub fn descriptor(&self) -> &'static Phase {
        match self {
            PhaseId::Initialization => &INITIALIZATION,
            PhaseId::Discovery => &DISCOVERY,
            PhaseId::Processing => &PROCESSING,
            PhaseId::Finalization => &FINALIZATION,
            PhaseId::Continuation => &CONTINUATION,
        }
    }

    /// Statically declared successor (`None` for the terminal phase)
    pub fn next(&self) -> Option<PhaseId> {
        self.descriptor().next
    }
}

impl fmt::Display for PhaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhaseId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "initialization" => Ok(PhaseId::Initialization),
            "discovery" | "order_discovery" => Ok(PhaseId::Discovery),
            "processing" | "image_processing" => Ok(PhaseId::Processing),
            "finalization" => Ok(PhaseId::Finalization),
            "continuation" => Ok(PhaseId::Continuation),
            other => Err(format!("unknown phase '{}'", other)),
        }
    }
}

/// Phase to run after `phase` completes, given the re-evaluated context.
/// `None` means the run is finished.
pub fn transition(phase: PhaseId, context: &WorkflowContext) -> Option<PhaseId> {
    match phase {
        PhaseId::Initialization => Some(PhaseId::Discovery),
        PhaseId::Discovery => Some(PhaseId::Processing),
        PhaseId::Processing => Some(PhaseId::Finalization),
        PhaseId::Finalization => Some(PhaseId::Continuation),
        PhaseId::Continuation if context.pending_count > 0 => Some(PhaseId::Discovery),
        PhaseId::Continuation => None,
    }
}
