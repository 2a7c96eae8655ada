//! Error taxonomy for task runs.
//!
//! Per-call tool failures are normally carried as data (`ToolResult.ok = false`);
//! the variants here exist so that the coordinator and the text-entry protocol
//! can describe why a call failed, and so that the engine can report a stable
//! [`FailureReason`] when a run terminates.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::topology::Stage;
use crate::core::types::SubgoalStatus;

/// Stable reason code attached to every failed or aborted task run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    DecisionTimeout,
    DecisionMalformed,
    DecisionFailed,
    ToolExecutionFailure,
    InputRejected,
    ElementNotFocusable,
    InvalidTransition,
    UnknownSubgoal,
    PlanExhausted,
    StepBudgetExhausted,
    ReplanExhausted,
    Cancelled,
    MissingStage,
}

impl FailureReason {
    pub fn code(self) -> &'static str {
        match self {
            FailureReason::DecisionTimeout => "decision_timeout",
            FailureReason::DecisionMalformed => "decision_malformed",
            FailureReason::DecisionFailed => "decision_failed",
            FailureReason::ToolExecutionFailure => "tool_execution_failure",
            FailureReason::InputRejected => "input_rejected",
            FailureReason::ElementNotFocusable => "element_not_focusable",
            FailureReason::InvalidTransition => "invalid_transition",
            FailureReason::UnknownSubgoal => "unknown_subgoal",
            FailureReason::PlanExhausted => "plan_exhausted",
            FailureReason::StepBudgetExhausted => "step_budget_exhausted",
            FailureReason::ReplanExhausted => "replan_exhausted",
            FailureReason::Cancelled => "cancelled",
            FailureReason::MissingStage => "missing_stage",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PilotError {
    #[error("decision stage '{stage}' timed out after {timeout:?}")]
    DecisionTimeout { stage: Stage, timeout: Duration },

    #[error("decision stage '{stage}' returned a malformed outcome: {reason}")]
    DecisionMalformed { stage: Stage, reason: String },

    #[error("decision stage '{stage}' failed: {message}")]
    DecisionFailed { stage: Stage, message: String },

    #[error("tool '{tool}' failed: {message}")]
    ToolExecutionFailure { tool: String, message: String },

    #[error("element '{element}' rejected input: {message}")]
    InputRejected { element: String, message: String },

    #[error("element '{element}' cannot receive focus: {message}")]
    ElementNotFocusable { element: String, message: String },

    #[error("cannot move subgoal '{subgoal_id}' from {from} to {to}")]
    InvalidTransition {
        subgoal_id: String,
        from: SubgoalStatus,
        to: SubgoalStatus,
    },

    #[error("unknown subgoal '{id}'")]
    UnknownSubgoal { id: String },

    #[error("plan has no remaining subgoals")]
    PlanExhausted,

    #[error("step budget exhausted ({steps}/{max_steps} steps)")]
    StepBudgetExhausted { steps: u32, max_steps: u32 },

    #[error("replan limit reached ({max_replans} replans)")]
    ReplanExhausted { max_replans: u32 },

    #[error("task run cancelled")]
    Cancelled,

    #[error("no decision port wired for stage '{stage}'")]
    MissingStage { stage: Stage },
}

impl PilotError {
    pub fn reason(&self) -> FailureReason {
        match self {
            PilotError::DecisionTimeout { .. } => FailureReason::DecisionTimeout,
            PilotError::DecisionMalformed { .. } => FailureReason::DecisionMalformed,
            PilotError::DecisionFailed { .. } => FailureReason::DecisionFailed,
            PilotError::ToolExecutionFailure { .. } => FailureReason::ToolExecutionFailure,
            PilotError::InputRejected { .. } => FailureReason::InputRejected,
            PilotError::ElementNotFocusable { .. } => FailureReason::ElementNotFocusable,
            PilotError::InvalidTransition { .. } => FailureReason::InvalidTransition,
            PilotError::UnknownSubgoal { .. } => FailureReason::UnknownSubgoal,
            PilotError::PlanExhausted => FailureReason::PlanExhausted,
            PilotError::StepBudgetExhausted { .. } => FailureReason::StepBudgetExhausted,
            PilotError::ReplanExhausted { .. } => FailureReason::ReplanExhausted,
            PilotError::Cancelled => FailureReason::Cancelled,
            PilotError::MissingStage { .. } => FailureReason::MissingStage,
        }
    }

    /// True if the run ends ABORTED rather than FAILED.
    pub fn is_abort(&self) -> bool {
        matches!(
            self,
            PilotError::StepBudgetExhausted { .. } | PilotError::Cancelled
        )
    }

    pub(crate) fn malformed(stage: Stage, reason: impl Into<String>) -> Self {
        PilotError::DecisionMalformed {
            stage,
            reason: reason.into(),
        }
    }
}
