//! Decision boundary.
//!
//! The [`DecisionPort`] trait decouples orchestration from whatever produces
//! decisions (a model call with its prompts, a rules engine, a human). The
//! engine never looks inside a port: it hands over a [`TaskContext`] and gets
//! back raw JSON, which [`DecisionBoundary`] bounds in time, validates against
//! the decision schema, and resolves into a typed [`Decision`].

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use jsonschema::Validator;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::core::outcome::{DECISION_SCHEMA, Decision, RawDecision, check_stage, resolve};
use crate::core::topology::Stage;
use crate::core::types::{AgentThought, Subgoal, ToolCall, ToolOutcome};
use crate::error::PilotError;
use crate::run::TaskRun;

/// Everything a decision stage may look at.
///
/// `device_state` and `screen` are filled fresh for each invocation and are
/// never written back into the run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskContext {
    pub goal: String,
    pub stage: Stage,
    pub plan: Vec<Subgoal>,
    pub current_subgoal: Option<Subgoal>,
    pub recent_thoughts: Vec<AgentThought>,
    pub latest_results: Vec<ToolOutcome>,
    pub step_count: u32,
    pub max_steps: u32,
    /// Actions the decider proposed, for the executor to finalize.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub proposed_actions: Vec<ToolCall>,
    /// Completions awaiting review by the orchestrator.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub claimed_completions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replan_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_state: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screen: Option<Value>,
}

impl TaskContext {
    /// Snapshot the run for `stage`, keeping at most `thought_window` thoughts.
    pub fn from_run(run: &TaskRun, stage: Stage, thought_window: usize) -> Self {
        Self {
            goal: run.goal().to_string(),
            stage,
            plan: run.plan().subgoals().to_vec(),
            current_subgoal: run.plan().current().cloned(),
            recent_thoughts: run.thoughts().recent(thought_window),
            latest_results: run.last_results().to_vec(),
            step_count: run.step_count(),
            max_steps: run.max_steps(),
            proposed_actions: Vec::new(),
            claimed_completions: Vec::new(),
            replan_reason: run.replan_reason().map(str::to_string),
            output_schema: run.output_schema().cloned(),
            device_state: None,
            screen: None,
        }
    }
}

/// A decision-producing stage.
///
/// Implementations return the raw stage payload; shape checking happens in
/// [`DecisionBoundary`]. Errors are reported as `DecisionFailed`.
#[async_trait]
pub trait DecisionPort: Send + Sync {
    async fn invoke(&self, stage: Stage, context: &TaskContext) -> Result<Value>;
}

/// Time bound and shape check shared by every decision stage.
pub struct DecisionBoundary {
    timeout: Duration,
    validator: Validator,
}

impl DecisionBoundary {
    pub fn new(timeout: Duration) -> Result<Self> {
        let schema: Value =
            serde_json::from_str(DECISION_SCHEMA).context("parse decision schema")?;
        let validator = jsonschema::validator_for(&schema)
            .map_err(|err| anyhow!("invalid decision schema: {}", err))?;
        Ok(Self { timeout, validator })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    #[instrument(skip_all, fields(stage = %stage, step = context.step_count))]
    pub async fn decide(
        &self,
        port: &dyn DecisionPort,
        stage: Stage,
        context: &TaskContext,
    ) -> Result<Decision, PilotError> {
        debug!("invoking decision stage");
        let payload = match tokio::time::timeout(self.timeout, port.invoke(stage, context)).await
        {
            Err(_) => {
                warn!(timeout_secs = self.timeout.as_secs(), "decision stage timed out");
                return Err(PilotError::DecisionTimeout {
                    stage,
                    timeout: self.timeout,
                });
            }
            Ok(Err(err)) => {
                warn!(error = %format!("{err:#}"), "decision stage failed");
                return Err(PilotError::DecisionFailed {
                    stage,
                    message: format!("{err:#}"),
                });
            }
            Ok(Ok(payload)) => payload,
        };
        self.parse(stage, payload)
    }

    /// Validate and resolve a raw payload for `stage`.
    pub fn parse(&self, stage: Stage, payload: Value) -> Result<Decision, PilotError> {
        let messages: Vec<String> = self
            .validator
            .iter_errors(&payload)
            .map(|err| err.to_string())
            .collect();
        if !messages.is_empty() {
            return Err(PilotError::malformed(stage, messages.join("; ")));
        }
        let raw: RawDecision = serde_json::from_value(payload)
            .map_err(|err| PilotError::malformed(stage, err.to_string()))?;
        let decision = resolve(stage, raw)?;
        check_stage(stage, &decision)?;

        if !decision.discarded_actions.is_empty() {
            let names: Vec<&str> = decision
                .discarded_actions
                .iter()
                .map(|call| call.name.as_str())
                .collect();
            warn!(
                stage = %stage,
                discarded = ?names,
                "decision carried both completions and actions; completions win, actions discarded"
            );
        }
        debug!(outcome = decision.outcome.kind().label(), "decision resolved");
        Ok(decision)
    }
}
