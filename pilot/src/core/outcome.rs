//! Decision outcomes and the rules that turn a raw stage payload into one.
//!
//! Stage payloads arrive as loosely shaped JSON. After schema validation at
//! the boundary they are deserialized into [`RawDecision`], then
//! [`resolve`] picks exactly one [`DecisionOutcome`] and [`check_stage`]
//! rejects outcomes the stage is not allowed to produce.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::topology::Stage;
use crate::core::types::{SubgoalDraft, ToolCall};
use crate::error::PilotError;

/// JSON Schema for stage payloads (draft 2020-12).
pub const DECISION_SCHEMA: &str = include_str!("../../schemas/decision.schema.json");

/// Closed set of things a decision stage can ask for.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecisionOutcome {
    /// A new subgoal plan (planning stage only).
    Plan { subgoals: Vec<SubgoalDraft> },
    CompleteSubgoals { ids: Vec<String> },
    StructuredActions { calls: Vec<ToolCall> },
    ReplanRequested { reason: String },
    TaskComplete { result: Option<Value> },
    /// Thought only, no directive.
    Continue,
}

impl DecisionOutcome {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            DecisionOutcome::Plan { .. } => OutcomeKind::Plan,
            DecisionOutcome::CompleteSubgoals { .. } => OutcomeKind::CompleteSubgoals,
            DecisionOutcome::StructuredActions { .. } => OutcomeKind::StructuredActions,
            DecisionOutcome::ReplanRequested { .. } => OutcomeKind::ReplanRequested,
            DecisionOutcome::TaskComplete { .. } => OutcomeKind::TaskComplete,
            DecisionOutcome::Continue => OutcomeKind::Continue,
        }
    }

    /// Short summary for traces and thoughts.
    pub fn summary(&self) -> String {
        match self {
            DecisionOutcome::Plan { subgoals } => format!("plan with {} subgoals", subgoals.len()),
            DecisionOutcome::CompleteSubgoals { ids } => {
                format!("complete subgoals [{}]", ids.join(", "))
            }
            DecisionOutcome::StructuredActions { calls } => {
                let names: Vec<&str> = calls.iter().map(|call| call.name.as_str()).collect();
                format!("actions [{}]", names.join(", "))
            }
            DecisionOutcome::ReplanRequested { reason } => format!("replan requested: {reason}"),
            DecisionOutcome::TaskComplete { .. } => "task complete".to_string(),
            DecisionOutcome::Continue => "continue".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Plan,
    CompleteSubgoals,
    StructuredActions,
    ReplanRequested,
    TaskComplete,
    Continue,
}

impl OutcomeKind {
    pub fn label(self) -> &'static str {
        match self {
            OutcomeKind::Plan => "plan",
            OutcomeKind::CompleteSubgoals => "complete_subgoals",
            OutcomeKind::StructuredActions => "structured_actions",
            OutcomeKind::ReplanRequested => "replan_requested",
            OutcomeKind::TaskComplete => "task_complete",
            OutcomeKind::Continue => "continue",
        }
    }
}

/// A resolved stage decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub outcome: DecisionOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thought: Option<String>,
    /// Actions dropped because completions took precedence.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub discarded_actions: Vec<ToolCall>,
}

/// Wire shape of a stage payload.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawDecision {
    #[serde(default)]
    pub thought: Option<String>,
    #[serde(default)]
    pub subgoals: Option<Vec<SubgoalDraft>>,
    #[serde(default)]
    pub complete_subgoal_ids: Option<Vec<String>>,
    #[serde(default)]
    pub actions: Option<Vec<ToolCall>>,
    #[serde(default)]
    pub replan_reason: Option<String>,
    #[serde(default)]
    pub task_complete: Option<TaskCompletePayload>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskCompletePayload {
    #[serde(default)]
    pub result: Option<Value>,
}

/// Pick exactly one outcome from a raw payload.
///
/// Empty lists and blank strings count as absent. Completions together with
/// actions resolve to `CompleteSubgoals`, with the actions kept in
/// `discarded_actions` so the caller can report them. Any other combination
/// of directives is malformed.
pub fn resolve(stage: Stage, raw: RawDecision) -> Result<Decision, PilotError> {
    let thought = raw.thought.filter(|text| !text.trim().is_empty());
    let subgoals = raw.subgoals.filter(|list| !list.is_empty());
    let completions = raw.complete_subgoal_ids.filter(|list| !list.is_empty());
    let actions = raw.actions.filter(|list| !list.is_empty());
    let replan = raw.replan_reason.filter(|reason| !reason.trim().is_empty());
    let complete = raw.task_complete;

    let mut present = Vec::new();
    if subgoals.is_some() {
        present.push("subgoals");
    }
    if completions.is_some() {
        present.push("complete_subgoal_ids");
    }
    if actions.is_some() {
        present.push("actions");
    }
    if replan.is_some() {
        present.push("replan_reason");
    }
    if complete.is_some() {
        present.push("task_complete");
    }

    let (outcome, discarded_actions) = match (subgoals, completions, actions, replan, complete) {
        (None, None, None, None, None) => (DecisionOutcome::Continue, Vec::new()),
        (Some(subgoals), None, None, None, None) => {
            (DecisionOutcome::Plan { subgoals }, Vec::new())
        }
        (None, Some(ids), actions, None, None) => (
            DecisionOutcome::CompleteSubgoals { ids },
            actions.unwrap_or_default(),
        ),
        (None, None, Some(calls), None, None) => {
            (DecisionOutcome::StructuredActions { calls }, Vec::new())
        }
        (None, None, None, Some(reason), None) => {
            (DecisionOutcome::ReplanRequested { reason }, Vec::new())
        }
        (None, None, None, None, Some(payload)) => (
            DecisionOutcome::TaskComplete {
                result: payload.result.filter(|value| !value.is_null()),
            },
            Vec::new(),
        ),
        _ => {
            return Err(PilotError::malformed(
                stage,
                format!("conflicting directives: {}", present.join(", ")),
            ));
        }
    };

    Ok(Decision {
        outcome,
        thought,
        discarded_actions,
    })
}

/// Outcome kinds a stage is allowed to produce.
pub fn accepted_kinds(stage: Stage) -> &'static [OutcomeKind] {
    match stage {
        Stage::Planner => &[OutcomeKind::Plan],
        Stage::Orchestrator | Stage::Summarizer => &[
            OutcomeKind::CompleteSubgoals,
            OutcomeKind::ReplanRequested,
            OutcomeKind::TaskComplete,
            OutcomeKind::Continue,
        ],
        Stage::Actor | Stage::Cortex => &[
            OutcomeKind::CompleteSubgoals,
            OutcomeKind::StructuredActions,
            OutcomeKind::ReplanRequested,
            OutcomeKind::TaskComplete,
        ],
        Stage::Executor => &[OutcomeKind::StructuredActions, OutcomeKind::Continue],
        Stage::Contextor | Stage::Tools | Stage::Convergence => &[],
    }
}

/// Reject outcomes the stage may not produce.
pub fn check_stage(stage: Stage, decision: &Decision) -> Result<(), PilotError> {
    let kind = decision.outcome.kind();
    if !accepted_kinds(stage).contains(&kind) {
        return Err(PilotError::malformed(
            stage,
            format!("stage cannot produce '{}'", kind.label()),
        ));
    }
    Ok(())
}
