//! Shared deterministic types for the orchestration core.
//!
//! These types define stable contracts between core components and the
//! boundaries. They should not depend on external state or I/O and must
//! remain deterministic across runs.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::topology::Stage;

/// Lifecycle status of a single subgoal.
///
/// Transitions only move forward: `not_started -> pending -> {success, failure}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubgoalStatus {
    NotStarted,
    Pending,
    Success,
    Failure,
}

impl SubgoalStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SubgoalStatus::Success | SubgoalStatus::Failure)
    }

    pub fn label(self) -> &'static str {
        match self {
            SubgoalStatus::NotStarted => "not_started",
            SubgoalStatus::Pending => "pending",
            SubgoalStatus::Success => "success",
            SubgoalStatus::Failure => "failure",
        }
    }
}

impl fmt::Display for SubgoalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One discrete step of a task plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subgoal {
    pub id: String,
    pub description: String,
    pub status: SubgoalStatus,
}

/// Subgoal as proposed by the planning stage, before it enters the plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubgoalDraft {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub description: String,
}

impl SubgoalDraft {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            id: None,
            description: description.into(),
        }
    }

    pub fn with_id(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            description: description.into(),
        }
    }
}

/// A reasoning note recorded by a stage, kept as context for later decisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentThought {
    pub text: String,
    pub stage: Stage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subgoal_id: Option<String>,
}

/// A low-level action requested by a decision stage.
///
/// The coordinator treats it as opaque beyond its name and arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            name: name.into(),
            arguments,
        }
    }

    /// Call with no arguments (serialized as an empty object).
    pub fn bare(name: impl Into<String>) -> Self {
        Self::new(name, Value::Object(Default::default()))
    }

    /// String argument lookup; `None` if missing or not a string.
    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.arguments.get(key).and_then(Value::as_str)
    }
}

/// Result reported by the device boundary for one tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl ToolResult {
    pub fn success() -> Self {
        Self {
            ok: true,
            error: None,
            payload: None,
        }
    }

    pub fn success_with(payload: Value) -> Self {
        Self {
            ok: true,
            error: None,
            payload: Some(payload),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
            payload: None,
        }
    }
}

/// What happened to one call of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CallOutcome {
    /// The call was dispatched and produced a result (which may be a failure).
    Completed { result: ToolResult },
    /// Not dispatched because an earlier call in a sequential batch failed.
    Aborted,
    /// Not dispatched because the task run was cancelled.
    Cancelled,
}

/// A tool call paired with its outcome, in batch order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub call: ToolCall,
    pub outcome: CallOutcome,
}

impl ToolOutcome {
    pub fn completed(call: ToolCall, result: ToolResult) -> Self {
        Self {
            call,
            outcome: CallOutcome::Completed { result },
        }
    }

    pub fn aborted(call: ToolCall) -> Self {
        Self {
            call,
            outcome: CallOutcome::Aborted,
        }
    }

    pub fn cancelled(call: ToolCall) -> Self {
        Self {
            call,
            outcome: CallOutcome::Cancelled,
        }
    }

    pub fn result(&self) -> Option<&ToolResult> {
        match &self.outcome {
            CallOutcome::Completed { result } => Some(result),
            CallOutcome::Aborted | CallOutcome::Cancelled => None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.result().is_some_and(|result| result.ok)
    }

    pub fn failed(&self) -> bool {
        self.result().is_some_and(|result| !result.ok)
    }

    /// One-line summary used for thoughts and traces.
    pub fn describe(&self) -> String {
        match &self.outcome {
            CallOutcome::Completed { result } if result.ok => {
                format!("tool '{}' succeeded", self.call.name)
            }
            CallOutcome::Completed { result } => format!(
                "tool '{}' failed: {}",
                self.call.name,
                result.error.as_deref().unwrap_or("unknown error")
            ),
            CallOutcome::Aborted => format!(
                "tool '{}' aborted: a previous tool call failed",
                self.call.name
            ),
            CallOutcome::Cancelled => format!("tool '{}' cancelled", self.call.name),
        }
    }
}

/// How a batch of tool calls is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One at a time, in order; the first failure aborts the rest.
    SequentialAbort,
    /// All at once; failures are aggregated, never fatal to siblings.
    Parallel,
}

/// Where a task run currently is in its lifecycle.
///
/// `planning -> (executing <-> reviewing) -> {completed, failed, aborted}`, with
/// `replanning` looping back into planning from review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    Planning,
    Executing,
    Reviewing,
    Replanning,
    Completed,
    Failed,
    Aborted,
}

impl TaskPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskPhase::Completed | TaskPhase::Failed | TaskPhase::Aborted
        )
    }

    pub fn status(self) -> TaskStatus {
        match self {
            TaskPhase::Completed => TaskStatus::Success,
            TaskPhase::Failed => TaskStatus::Failure,
            TaskPhase::Aborted => TaskStatus::Aborted,
            TaskPhase::Planning
            | TaskPhase::Executing
            | TaskPhase::Reviewing
            | TaskPhase::Replanning => TaskStatus::Running,
        }
    }
}

/// Coarse status of a task run, as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Success,
    Failure,
    Aborted,
}

/// Result produced by a successful task run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum TaskOutput {
    /// Free-form text answer.
    Text(String),
    /// Payload that conforms to the caller-supplied output schema.
    Structured(Value),
    /// The run finished without producing a result.
    Empty,
}
