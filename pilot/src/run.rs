//! Task run state and final reports.
//!
//! A [`TaskRun`] owns the plan and the thought log for one goal. Every plan
//! mutation goes through the wrappers here so that a derived thought is
//! recorded for each change. The whole struct serializes, which is what
//! snapshots and `Engine::resume` rely on.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::core::plan::{PlanChange, SubgoalPlan};
use crate::core::thoughts::ThoughtLog;
use crate::core::topology::{Stage, Topology};
use crate::core::types::{
    AgentThought, SubgoalDraft, TaskOutput, TaskPhase, TaskStatus, ToolOutcome,
};
use crate::error::{FailureReason, PilotError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRun {
    run_id: String,
    goal: String,
    topology: Topology,
    max_steps: u32,
    phase: TaskPhase,
    plan: SubgoalPlan,
    thoughts: ThoughtLog,
    /// Tool-call batches executed so far.
    step_count: u32,
    /// Orchestration cycles started so far.
    cycle: u32,
    stalled_cycles: u32,
    replans: u32,
    #[serde(default)]
    last_results: Vec<ToolOutcome>,
    #[serde(default)]
    replan_reason: Option<String>,
    #[serde(default)]
    output_schema: Option<Value>,
    #[serde(default)]
    outcome: Option<TaskOutcome>,
}

impl TaskRun {
    pub fn new(
        goal: impl Into<String>,
        topology: Topology,
        max_steps: u32,
        thought_retention: usize,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            goal: goal.into(),
            topology,
            max_steps,
            phase: TaskPhase::Planning,
            plan: SubgoalPlan::new(),
            thoughts: ThoughtLog::new(thought_retention),
            step_count: 0,
            cycle: 0,
            stalled_cycles: 0,
            replans: 0,
            last_results: Vec::new(),
            replan_reason: None,
            output_schema: None,
            outcome: None,
        }
    }

    /// Require `TaskComplete` results to validate against `schema`.
    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.output_schema = Some(schema);
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn goal(&self) -> &str {
        &self.goal
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    pub fn max_steps(&self) -> u32 {
        self.max_steps
    }

    pub fn phase(&self) -> TaskPhase {
        self.phase
    }

    pub fn status(&self) -> TaskStatus {
        self.phase.status()
    }

    pub fn plan(&self) -> &SubgoalPlan {
        &self.plan
    }

    pub fn thoughts(&self) -> &ThoughtLog {
        &self.thoughts
    }

    pub fn step_count(&self) -> u32 {
        self.step_count
    }

    pub fn cycle(&self) -> u32 {
        self.cycle
    }

    pub fn stalled_cycles(&self) -> u32 {
        self.stalled_cycles
    }

    pub fn replans(&self) -> u32 {
        self.replans
    }

    pub fn last_results(&self) -> &[ToolOutcome] {
        &self.last_results
    }

    pub fn replan_reason(&self) -> Option<&str> {
        self.replan_reason.as_deref()
    }

    pub fn output_schema(&self) -> Option<&Value> {
        self.output_schema.as_ref()
    }

    pub fn outcome(&self) -> Option<&TaskOutcome> {
        self.outcome.as_ref()
    }

    pub(crate) fn set_phase(&mut self, phase: TaskPhase) {
        self.phase = phase;
    }

    /// Append a thought attributed to the current subgoal.
    pub(crate) fn note(&mut self, stage: Stage, text: impl Into<String>) {
        let subgoal = self.plan.current().map(|subgoal| subgoal.id.clone());
        self.thoughts.record(stage, subgoal.as_deref(), text);
    }

    fn note_change(&mut self, stage: Stage, change: &PlanChange) {
        if change.is_noop() {
            return;
        }
        let subgoal = change
            .subgoal_id()
            .map(str::to_string)
            .or_else(|| self.plan.current().map(|subgoal| subgoal.id.clone()));
        self.thoughts
            .record(stage, subgoal.as_deref(), change.summary());
    }

    pub(crate) fn complete_subgoals(
        &mut self,
        stage: Stage,
        ids: &[String],
    ) -> Result<PlanChange, PilotError> {
        let change = self.plan.mark_complete(ids)?;
        self.note_change(stage, &change);
        Ok(change)
    }

    /// Mark the current subgoal as FAILURE, if there is one.
    pub(crate) fn fail_current(&mut self, stage: Stage) -> Result<Option<PlanChange>, PilotError> {
        let Some(current) = self.plan.current().map(|subgoal| subgoal.id.clone()) else {
            return Ok(None);
        };
        let change = self.plan.mark_failed(&current)?;
        self.note_change(stage, &change);
        Ok(Some(change))
    }

    /// Make sure a subgoal is pending while work remains.
    pub(crate) fn ensure_current(&mut self, stage: Stage) -> Result<(), PilotError> {
        if self.plan.current().is_none() && self.plan.has_not_started() {
            let change = self.plan.advance()?;
            self.note_change(stage, &change);
        }
        Ok(())
    }

    pub(crate) fn replace_plan(&mut self, drafts: Vec<SubgoalDraft>) -> PlanChange {
        let change = self.plan.replace(drafts);
        self.note_change(Stage::Planner, &change);
        change
    }

    /// Close every remaining subgoal as SUCCESS after a task-complete signal.
    pub(crate) fn close_remaining(&mut self, stage: Stage) -> Result<PlanChange, PilotError> {
        let remaining = self.plan.remaining_ids();
        self.complete_subgoals(stage, &remaining)
    }

    pub(crate) fn begin_cycle(&mut self) {
        self.cycle += 1;
    }

    /// Record one executed tool-call batch; the step counter moves exactly once.
    pub(crate) fn record_step(&mut self, outcomes: Vec<ToolOutcome>) {
        self.step_count += 1;
        for outcome in &outcomes {
            self.note(Stage::Tools, outcome.describe());
        }
        self.last_results = outcomes;
    }

    pub(crate) fn record_progress(&mut self, progressed: bool) {
        if progressed {
            self.stalled_cycles = 0;
        } else {
            self.stalled_cycles += 1;
        }
    }

    pub(crate) fn record_replan(&mut self, reason: String) {
        self.replans += 1;
        self.stalled_cycles = 0;
        self.replan_reason = Some(reason);
    }

    pub(crate) fn clear_replan_reason(&mut self) {
        self.replan_reason = None;
    }

    pub(crate) fn finish_success(&mut self, output: TaskOutput) -> TaskReport {
        self.phase = TaskPhase::Completed;
        let outcome = TaskOutcome::Success { output };
        self.outcome = Some(outcome.clone());
        self.build_report(outcome)
    }

    pub(crate) fn finish_failure(&mut self, err: &PilotError, thought_window: usize) -> TaskReport {
        self.phase = if err.is_abort() {
            TaskPhase::Aborted
        } else {
            TaskPhase::Failed
        };
        let outcome = TaskOutcome::Failure {
            reason: err.reason(),
            message: err.to_string(),
            thoughts: self.thoughts.recent(thought_window),
        };
        self.outcome = Some(outcome.clone());
        self.build_report(outcome)
    }

    /// Final report, once the run reached a terminal phase.
    pub fn report(&self) -> Option<TaskReport> {
        self.outcome
            .clone()
            .map(|outcome| self.build_report(outcome))
    }

    fn build_report(&self, outcome: TaskOutcome) -> TaskReport {
        TaskReport {
            run_id: self.run_id.clone(),
            status: self.status(),
            steps: self.step_count,
            cycles: self.cycle,
            outcome,
        }
    }
}

/// How a task run ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TaskOutcome {
    Success {
        output: TaskOutput,
    },
    /// Carries the most recent thoughts for diagnosis.
    Failure {
        reason: FailureReason,
        message: String,
        thoughts: Vec<AgentThought>,
    },
}

/// What the caller gets back from `Engine::run`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    pub run_id: String,
    pub status: TaskStatus,
    pub steps: u32,
    pub cycles: u32,
    pub outcome: TaskOutcome,
}

impl TaskReport {
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match &self.outcome {
            TaskOutcome::Failure { reason, .. } => Some(*reason),
            TaskOutcome::Success { .. } => None,
        }
    }

    pub fn output(&self) -> Option<&TaskOutput> {
        match &self.outcome {
            TaskOutcome::Success { output } => Some(output),
            TaskOutcome::Failure { .. } => None,
        }
    }
}
