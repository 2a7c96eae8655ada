//! Per-cycle continue / replan / end decision.

use serde_json::Value;

use crate::core::plan::SubgoalPlan;
use crate::core::types::ToolOutcome;
use crate::error::PilotError;

/// Terminal or replan request raised by a decision stage during the cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleSignal {
    TaskComplete(Option<Value>),
    ReplanRequested(String),
}

/// Everything the controller looks at after a cycle.
#[derive(Debug, Clone, Copy)]
pub struct ConvergenceInput<'a> {
    pub plan: &'a SubgoalPlan,
    pub latest_results: &'a [ToolOutcome],
    pub signal: Option<&'a CycleSignal>,
    pub step_count: u32,
    pub max_steps: u32,
    /// Consecutive cycles in which no subgoal reached SUCCESS.
    pub stalled_cycles: u32,
    pub replans_used: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Convergence {
    Continue,
    Replan { reason: String },
    End { result: Option<Value> },
    Abort { steps: u32, max_steps: u32 },
    Fail(PilotError),
}

impl Convergence {
    pub fn summary(&self) -> String {
        match self {
            Convergence::Continue => "continue".to_string(),
            Convergence::Replan { reason } => format!("replan: {reason}"),
            Convergence::End { .. } => "end".to_string(),
            Convergence::Abort { steps, max_steps } => {
                format!("abort: step budget exhausted ({steps}/{max_steps})")
            }
            Convergence::Fail(err) => format!("fail: {err}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvergenceController {
    stall_cycle_limit: u32,
    max_replans: u32,
}

impl ConvergenceController {
    pub fn new(stall_cycle_limit: u32, max_replans: u32) -> Self {
        Self {
            stall_cycle_limit,
            max_replans,
        }
    }

    pub fn budget_exhausted(step_count: u32, max_steps: u32) -> bool {
        step_count >= max_steps
    }

    /// Decide what happens after a cycle.
    ///
    /// Priority: step budget, task completion, replan (signalled or stalled),
    /// remaining subgoals, full success. A plan that is fully terminal but not
    /// fully successful fails with `PlanExhausted`.
    pub fn decide(&self, input: &ConvergenceInput<'_>) -> Convergence {
        if Self::budget_exhausted(input.step_count, input.max_steps) {
            return Convergence::Abort {
                steps: input.step_count,
                max_steps: input.max_steps,
            };
        }

        if let Some(CycleSignal::TaskComplete(result)) = input.signal {
            return Convergence::End {
                result: result.clone(),
            };
        }

        let replan_reason = match input.signal {
            Some(CycleSignal::ReplanRequested(reason)) => Some(reason.clone()),
            _ if input.stalled_cycles >= self.stall_cycle_limit => {
                Some(stall_reason(input.stalled_cycles, input.latest_results))
            }
            _ => None,
        };
        if let Some(reason) = replan_reason {
            if input.replans_used >= self.max_replans {
                return Convergence::Fail(PilotError::ReplanExhausted {
                    max_replans: self.max_replans,
                });
            }
            return Convergence::Replan { reason };
        }

        if !input.plan.remaining_ids().is_empty() {
            return Convergence::Continue;
        }
        if input.plan.is_complete() {
            return Convergence::End { result: None };
        }
        Convergence::Fail(PilotError::PlanExhausted)
    }
}

fn stall_reason(stalled: u32, latest: &[ToolOutcome]) -> String {
    let mut reason = format!("no subgoal progress for {stalled} consecutive cycles");
    if let Some(failed) = latest.iter().rev().find(|outcome| outcome.failed()) {
        reason.push_str("; last failure: ");
        reason.push_str(&failed.describe());
    }
    reason
}
