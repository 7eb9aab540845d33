//! External reasoning agent support
//!
//! The orchestrator does not drive the agent. It renders a brief describing
//! the current context, the phases and the recovery procedures, and later
//! interprets the tool invocations the agent reports back.

use handlebars::Handlebars;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::error::OrchestratorError;
use super::phase::PhaseId;
use super::recovery::RecoveryCategory;
use crate::bridge::{AdapterCall, DatabaseOp};
use crate::workflow::model::AnalysisStatus;
use crate::workflow::WorkflowContext;

const BRIEF_TEMPLATE: &str = r#"You are an image processing workflow operator with direct access to the relational store, object storage, analysis and embedding tools.

## Current Workflow Context
- Timestamp: {{context.timestamp}}
- Pending work items: {{context.pending_count}}
- Storage: {{#if context.storage_accessible}}accessible{{else}}unreachable{{/if}}
- Current phase: {{context.current_phase}}
- Completed phases: {{completed}}
{{#if context.active_item}}- Active work item: {{context.active_item.id}} (user {{context.active_item.user_id}}{{#if context.active_item.batch_id}}, batch {{context.active_item.batch_id}}{{/if}})
{{/if}}{{#if context.last_error}}- Previous error: {{context.last_error}}
{{/if}}
{{#if phase}}## {{phase.title}}

Objective: {{phase.description}}

Required steps:
{{#each phase.steps}}{{this.number}}. {{this.text}}
{{/each}}
Success criteria: {{phase.success_criteria}}
Next phase: {{phase.next}}
{{else}}## Workflow Overview
{{#each phases}}
### [{{this.marker}}] {{this.title}}
Goal: {{this.description}}
Steps: {{this.step_count}} operations
{{/each}}{{/if}}
## Error Recovery Procedures
{{#each recovery}}
### {{this.title}}
{{#each this.steps}}{{this.number}}. {{this.text}}
{{/each}}{{/each}}
## Execution Instructions
{{#if idle}}No pending work items were found. Verify store connectivity, check the claim criteria (pending stage, completed payment) and report the current system state.
{{else}}Process all {{context.pending_count}} pending work items, starting with {{context.current_phase}}. Complete one sub-item fully before starting the next, store complete analysis payloads, and verify each step before moving on.
{{/if}}"#;

fn numbered(steps: &[&str]) -> Vec<Value> {
    steps
        .iter()
        .enumerate()
        .map(|(i, text)| json!({ "number": i + 1, "text": text }))
        .collect()
}

/// Natural-language brief for an external agent
#[derive(Debug)]
pub struct AgentBrief {
    registry: Handlebars<'static>,
}

impl AgentBrief {
    pub fn new() -> Result<Self, OrchestratorError> {
        let mut registry = Handlebars::new();
        registry.register_escape_fn(handlebars::no_escape);
        registry.set_strict_mode(false);
        registry
            .register_template_string("brief", BRIEF_TEMPLATE)
            .map_err(|e| OrchestratorError::Template(e.to_string()))?;
        Ok(Self { registry })
    }

    /// Render the brief. With `phase` the brief details that phase's steps,
    /// otherwise it gives an overview of every phase.
    pub fn render(
        &self,
        context: &WorkflowContext,
        phase: Option<PhaseId>,
    ) -> Result<String, OrchestratorError> {
        let completed = if context.completed_phases.is_empty() {
            "none".to_string()
        } else {
            context
                .completed_phases
                .iter()
                .map(PhaseId::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        };

        let phase_section = phase.map(|id| {
            let descriptor = id.descriptor();
            json!({
                "title": descriptor.title,
                "description": descriptor.description,
                "steps": numbered(descriptor.steps),
                "success_criteria": descriptor.success_criteria,
                "next": descriptor.next.map_or("workflow complete", |next| next.as_str()),
            })
        });

        let phases: Vec<Value> = PhaseId::ALL
            .iter()
            .map(|id| {
                let descriptor = id.descriptor();
                json!({
                    "marker": if *id == context.current_phase { "CURRENT" } else { "PENDING" },
                    "title": descriptor.title,
                    "description": descriptor.description,
                    "step_count": descriptor.steps.len(),
                })
            })
            .collect();

        let recovery: Vec<Value> = RecoveryCategory::ALL
            .iter()
            .map(|category| {
                json!({
                    "title": category.title(),
                    "steps": numbered(category.procedure()),
                })
            })
            .collect();

        let data = json!({
            "context": context,
            "completed": completed,
            "phase": phase_section,
            "phases": phases,
            "recovery": recovery,
            "idle": context.pending_count == 0,
        });

        self.registry
            .render("brief", &data)
            .map_err(|e| OrchestratorError::Template(e.to_string()))
    }
}

/// One tool invocation reported back by the agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReportedInvocation {
    #[serde(flatten)]
    pub call: AdapterCall,
    pub success: bool,
}

/// Counter deltas implied by a batch of reported invocations
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReportDelta {
    pub items_processed: u64,
    pub sub_items_processed: u64,
    pub errors: u64,
}

impl ReportDelta {
    pub fn from_invocations(invocations: &[ReportedInvocation]) -> Self {
        let mut delta = Self::default();
        for invocation in invocations {
            if !invocation.success {
                delta.errors += 1;
                continue;
            }
            match &invocation.call {
                AdapterCall::Database(DatabaseOp::CompleteItem { .. }) => delta.items_processed += 1,
                AdapterCall::Database(DatabaseOp::SetSubItemStatus {
                    status: AnalysisStatus::Completed,
                    ..
                }) => delta.sub_items_processed += 1,
                _ => {}
            }
        }
        delta
    }
}

/// Parse a JSON array of reported invocations
pub fn parse_report(json: &str) -> Result<Vec<ReportedInvocation>, OrchestratorError> {
    Ok(serde_json::from_str(json)?)
}
