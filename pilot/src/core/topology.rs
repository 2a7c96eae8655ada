//! Stage graph topologies.
//!
//! A topology fixes which stages a task run visits and which of them are
//! backed by a decision port. Choosing a topology never changes the plan,
//! coordinator or convergence contracts, only the stage wiring and the number
//! of review/execute round-trips per cycle.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A slot in the stage graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Produces the subgoal plan (initially and on every replan).
    Planner,
    /// Single decision-maker used by the baseline topology.
    Actor,
    /// Reviews claimed subgoal completions.
    Orchestrator,
    /// Refreshes device state for the current cycle.
    Contextor,
    /// Decides the next move from the current device state.
    Cortex,
    /// Turns the cortex's proposal into concrete tool calls.
    Executor,
    /// Runs tool calls against the device.
    Tools,
    /// Digests the latest tool results.
    Summarizer,
    /// Decides continue / replan / end after the cycle.
    Convergence,
}

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Stage::Planner => "planner",
            Stage::Actor => "actor",
            Stage::Orchestrator => "orchestrator",
            Stage::Contextor => "contextor",
            Stage::Cortex => "cortex",
            Stage::Executor => "executor",
            Stage::Tools => "tools",
            Stage::Summarizer => "summarizer",
            Stage::Convergence => "convergence",
        }
    }

    /// True if the stage is served by an external decision port.
    pub fn is_decision(self) -> bool {
        matches!(
            self,
            Stage::Planner
                | Stage::Actor
                | Stage::Orchestrator
                | Stage::Cortex
                | Stage::Executor
                | Stage::Summarizer
        )
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

const BASELINE_STAGES: [Stage; 3] = [Stage::Planner, Stage::Actor, Stage::Tools];

const MULTI_ROLE_STAGES: [Stage; 8] = [
    Stage::Planner,
    Stage::Orchestrator,
    Stage::Contextor,
    Stage::Cortex,
    Stage::Executor,
    Stage::Tools,
    Stage::Summarizer,
    Stage::Convergence,
];

/// The fixed stage graph used for one task run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    /// Planner, a single actor, and the tool stage.
    Baseline,
    /// Planner, orchestrator, contextor, cortex, executor, tools, summarizer, convergence.
    MultiRole,
}

impl Topology {
    pub fn stages(self) -> &'static [Stage] {
        match self {
            Topology::Baseline => &BASELINE_STAGES,
            Topology::MultiRole => &MULTI_ROLE_STAGES,
        }
    }

    /// Stages that need a decision port wired before a run can start.
    pub fn decision_stages(self) -> impl Iterator<Item = Stage> {
        self.stages().iter().copied().filter(|stage| stage.is_decision())
    }

    /// The stage that opens every execution cycle.
    pub fn cycle_decider(self) -> Stage {
        match self {
            Topology::Baseline => Stage::Actor,
            Topology::MultiRole => Stage::Cortex,
        }
    }

    pub fn contains(self, stage: Stage) -> bool {
        self.stages().contains(&stage)
    }

    pub fn label(self) -> &'static str {
        match self {
            Topology::Baseline => "baseline",
            Topology::MultiRole => "multi_role",
        }
    }
}
