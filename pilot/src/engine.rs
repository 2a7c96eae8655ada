//! Orchestration engine.
//!
//! Drives one [`TaskRun`] through its phases: plan, then repeated cycles of
//! decide, execute and converge until the run completes, fails or aborts.
//!
//! ```text
//! planning ──► executing ──► reviewing ──► completed | failed | aborted
//!    ▲            ▲              │
//!    │            └── continue ──┤
//!    └──── replanning ◄── replan ┘
//! ```
//!
//! The topology only changes which stages a cycle visits. Both topologies
//! share the plan, coordinator and convergence rules, and both count one
//! step per executed tool-call batch.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::coordinator::ToolExecutionCoordinator;
use crate::core::convergence::{Convergence, ConvergenceController, ConvergenceInput, CycleSignal};
use crate::core::invariants::validate_plan_invariants;
use crate::core::outcome::{Decision, DecisionOutcome};
use crate::core::topology::{Stage, Topology};
use crate::core::types::{TaskOutput, TaskPhase, ToolCall, ToolOutcome};
use crate::error::PilotError;
use crate::io::config::PilotConfig;
use crate::io::decision::{DecisionBoundary, DecisionPort, TaskContext};
use crate::io::device::{CAPTURE_SCREEN, Device, OBSERVE_DEVICE, execute_with_timeout};
use crate::io::snapshot::write_snapshot;
use crate::io::trace::{DecisionSummary, NullTraceSink, TraceRecord, TraceSink};
use crate::run::{TaskReport, TaskRun};

/// Decision ports wired into stage slots.
#[derive(Default, Clone)]
pub struct StagePorts {
    ports: HashMap<Stage, Arc<dyn DecisionPort>>,
}

impl StagePorts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, stage: Stage, port: Arc<dyn DecisionPort>) -> Self {
        self.ports.insert(stage, port);
        self
    }

    /// Wire the same port into every decision stage of `topology`.
    pub fn uniform(topology: Topology, port: Arc<dyn DecisionPort>) -> Self {
        topology
            .decision_stages()
            .fold(Self::new(), |ports, stage| ports.with(stage, port.clone()))
    }

    pub fn get(&self, stage: Stage) -> Option<&Arc<dyn DecisionPort>> {
        self.ports.get(&stage)
    }

    /// First decision stage of `topology` with no port.
    pub fn missing(&self, topology: Topology) -> Option<Stage> {
        topology
            .decision_stages()
            .find(|stage| !self.ports.contains_key(stage))
    }
}

/// What happened during one cycle, for the trace record.
#[derive(Default)]
struct CycleLog {
    stages: Vec<Stage>,
    decisions: Vec<DecisionSummary>,
    results: Vec<ToolOutcome>,
}

impl CycleLog {
    fn visit(&mut self, stage: Stage) {
        self.stages.push(stage);
    }
}

pub struct Engine {
    config: PilotConfig,
    ports: StagePorts,
    device: Arc<dyn Device>,
    boundary: DecisionBoundary,
    coordinator: ToolExecutionCoordinator,
    convergence: ConvergenceController,
    trace: Box<dyn TraceSink>,
    checkpoint: Option<PathBuf>,
}

impl Engine {
    /// Build an engine; every decision stage of the configured topology must be wired.
    pub fn new(config: PilotConfig, ports: StagePorts, device: Arc<dyn Device>) -> Result<Self> {
        config.validate()?;
        if let Some(stage) = ports.missing(config.topology) {
            return Err(PilotError::MissingStage { stage }.into());
        }
        let boundary = DecisionBoundary::new(config.decision_timeout())?;
        let coordinator = ToolExecutionCoordinator::from_config(device.clone(), &config);
        let convergence = ConvergenceController::new(config.stall_cycle_limit, config.max_replans);
        Ok(Self {
            config,
            ports,
            device,
            boundary,
            coordinator,
            convergence,
            trace: Box::new(NullTraceSink),
            checkpoint: None,
        })
    }

    pub fn with_trace_sink(mut self, sink: Box<dyn TraceSink>) -> Self {
        self.trace = sink;
        self
    }

    /// Write a snapshot to `path` after planning and after every cycle.
    pub fn with_checkpoint(mut self, path: impl Into<PathBuf>) -> Self {
        self.checkpoint = Some(path.into());
        self
    }

    pub fn config(&self) -> &PilotConfig {
        &self.config
    }

    /// A fresh run carrying the configured topology and step budget.
    pub fn new_run(&self, goal: impl Into<String>) -> TaskRun {
        TaskRun::new(
            goal,
            self.config.topology,
            self.config.max_steps,
            self.config.thought_retention,
        )
    }

    /// Run `goal` from scratch to a terminal state.
    pub async fn run(&self, goal: &str, cancel: &CancellationToken) -> TaskReport {
        let (_, report) = self.drive(self.new_run(goal), cancel).await;
        report
    }

    /// Continue a run restored from a snapshot.
    ///
    /// Terminal runs return their recorded report unchanged.
    pub async fn resume(
        &self,
        mut run: TaskRun,
        cancel: &CancellationToken,
    ) -> (TaskRun, TaskReport) {
        if let Some(report) = run.report() {
            return (run, report);
        }
        if let Some(stage) = self.ports.missing(run.topology()) {
            let report = run.finish_failure(
                &PilotError::MissingStage { stage },
                self.config.context_thoughts,
            );
            return (run, report);
        }
        if let Some(violation) = validate_plan_invariants(run.plan()).into_iter().next() {
            warn!(run_id = run.run_id(), %violation, "refusing to resume run");
            let report = run.finish_failure(
                &PilotError::malformed(Stage::Planner, violation),
                self.config.context_thoughts,
            );
            return (run, report);
        }
        info!(run_id = run.run_id(), step = run.step_count(), phase = ?run.phase(), "resuming run");
        self.drive(run, cancel).await
    }

    /// Drive `run` until it reaches a terminal phase.
    #[instrument(skip_all, fields(run_id = run.run_id(), topology = run.topology().label()))]
    pub async fn drive(
        &self,
        mut run: TaskRun,
        cancel: &CancellationToken,
    ) -> (TaskRun, TaskReport) {
        if let Some(report) = run.report() {
            return (run, report);
        }
        info!(goal = run.goal(), max_steps = run.max_steps(), "task run started");
        let report = match self.drive_loop(&mut run, cancel).await {
            Ok(output) => run.finish_success(output),
            Err(err) => {
                warn!(error = %err, reason = ?err.reason(), "task run ended without success");
                run.finish_failure(&err, self.config.context_thoughts)
            }
        };
        self.write_checkpoint(&run);
        info!(
            status = ?report.status,
            steps = report.steps,
            cycles = report.cycles,
            "task run finished"
        );
        (run, report)
    }

    async fn drive_loop(
        &self,
        run: &mut TaskRun,
        cancel: &CancellationToken,
    ) -> Result<TaskOutput, PilotError> {
        let mut carried = Vec::new();
        loop {
            if cancel.is_cancelled() {
                return Err(PilotError::Cancelled);
            }
            if ConvergenceController::budget_exhausted(run.step_count(), run.max_steps()) {
                return Err(PilotError::StepBudgetExhausted {
                    steps: run.step_count(),
                    max_steps: run.max_steps(),
                });
            }

            if matches!(run.phase(), TaskPhase::Planning | TaskPhase::Replanning) {
                carried.push(self.plan(run, cancel).await?);
                run.set_phase(TaskPhase::Executing);
                self.write_checkpoint(run);
                continue;
            }

            let convergence = self.cycle(run, cancel, std::mem::take(&mut carried)).await?;
            match convergence {
                Convergence::Continue => run.set_phase(TaskPhase::Executing),
                Convergence::Replan { reason } => {
                    info!(%reason, "replanning");
                    run.fail_current(Stage::Convergence)?;
                    run.note(Stage::Convergence, format!("replan: {reason}"));
                    run.record_replan(reason);
                    run.set_phase(TaskPhase::Replanning);
                }
                Convergence::End { result } => {
                    let output = self.build_output(run, result)?;
                    run.close_remaining(Stage::Convergence)?;
                    return Ok(output);
                }
                Convergence::Abort { steps, max_steps } => {
                    return Err(PilotError::StepBudgetExhausted { steps, max_steps });
                }
                Convergence::Fail(err) => return Err(err),
            }
            self.write_checkpoint(run);
        }
    }

    /// Ask the planner for a (new) plan and select its first subgoal.
    async fn plan(
        &self,
        run: &mut TaskRun,
        cancel: &CancellationToken,
    ) -> Result<DecisionSummary, PilotError> {
        let context = self.context(run, Stage::Planner).await;
        let mut log = CycleLog::default();
        let decision = self
            .decide(run, Stage::Planner, context, cancel, &mut log)
            .await?;
        let DecisionOutcome::Plan { subgoals } = decision.outcome else {
            return Err(PilotError::malformed(Stage::Planner, "expected a plan"));
        };
        run.replace_plan(subgoals);
        run.clear_replan_reason();
        run.ensure_current(Stage::Planner)?;
        debug!(subgoals = run.plan().subgoals().len(), "plan ready");
        log.decisions
            .pop()
            .ok_or_else(|| PilotError::malformed(Stage::Planner, "planner decision not logged"))
    }

    /// One orchestration cycle; returns the convergence decision.
    ///
    /// A trace record is written whether the cycle converges or fails.
    async fn cycle(
        &self,
        run: &mut TaskRun,
        cancel: &CancellationToken,
        carried: Vec<DecisionSummary>,
    ) -> Result<Convergence, PilotError> {
        let started = Instant::now();
        run.begin_cycle();
        let mut log = CycleLog::default();
        if !carried.is_empty() {
            log.visit(Stage::Planner);
            log.decisions = carried;
        }

        match self.converge(run, cancel, &mut log).await {
            Ok(convergence) => {
                self.write_trace(run, log, convergence.summary(), started);
                Ok(convergence)
            }
            Err(err) => {
                self.write_trace(run, log, format!("fail: {err}"), started);
                Err(err)
            }
        }
    }

    async fn converge(
        &self,
        run: &mut TaskRun,
        cancel: &CancellationToken,
        log: &mut CycleLog,
    ) -> Result<Convergence, PilotError> {
        let decider = run.topology().cycle_decider();
        run.ensure_current(decider)?;
        let completed_before = run.plan().success_count();

        let signal = match run.topology() {
            Topology::Baseline => self.baseline_cycle(run, cancel, log).await?,
            Topology::MultiRole => self.multi_role_cycle(run, cancel, log).await?,
        };

        run.set_phase(TaskPhase::Reviewing);
        run.record_progress(run.plan().success_count() > completed_before);
        log.visit(Stage::Convergence);
        let convergence = self.convergence.decide(&ConvergenceInput {
            plan: run.plan(),
            latest_results: &log.results,
            signal: signal.as_ref(),
            step_count: run.step_count(),
            max_steps: run.max_steps(),
            stalled_cycles: run.stalled_cycles(),
            replans_used: run.replans(),
        });
        debug!(
            cycle = run.cycle(),
            step = run.step_count(),
            decision = %convergence.summary(),
            "cycle converged"
        );
        Ok(convergence)
    }

    /// Actor decides; completions apply directly, actions go to the tools.
    async fn baseline_cycle(
        &self,
        run: &mut TaskRun,
        cancel: &CancellationToken,
        log: &mut CycleLog,
    ) -> Result<Option<CycleSignal>, PilotError> {
        let context = self.context(run, Stage::Actor).await;
        let decision = self
            .decide(run, Stage::Actor, context, cancel, log)
            .await?;
        match decision.outcome {
            DecisionOutcome::CompleteSubgoals { ids } => {
                run.complete_subgoals(Stage::Actor, &ids)?;
                Ok(None)
            }
            DecisionOutcome::StructuredActions { calls } => {
                self.execute_batch(run, calls, cancel, log).await?;
                Ok(None)
            }
            other => Ok(signal_of(other)),
        }
    }

    /// Contextor observes, cortex decides, then either the orchestrator
    /// reviews claimed completions or the executor/tools/summarizer chain runs.
    async fn multi_role_cycle(
        &self,
        run: &mut TaskRun,
        cancel: &CancellationToken,
        log: &mut CycleLog,
    ) -> Result<Option<CycleSignal>, PilotError> {
        log.visit(Stage::Contextor);
        let observation = self.observe(run).await;

        let mut context = self.context(run, Stage::Cortex).await;
        context.device_state = observation.clone();
        let decision = self
            .decide(run, Stage::Cortex, context, cancel, log)
            .await?;

        let proposed = match decision.outcome {
            DecisionOutcome::CompleteSubgoals { ids } => {
                return self.review(run, ids, &observation, cancel, log).await;
            }
            DecisionOutcome::StructuredActions { calls } => calls,
            other => return Ok(signal_of(other)),
        };

        let mut context = self.context(run, Stage::Executor).await;
        context.device_state = observation.clone();
        context.proposed_actions = proposed.clone();
        let finalized = self
            .decide(run, Stage::Executor, context, cancel, log)
            .await?;
        let calls = match finalized.outcome {
            DecisionOutcome::StructuredActions { calls } => calls,
            _ => proposed,
        };
        self.execute_batch(run, calls, cancel, log).await?;

        let mut context = self.context(run, Stage::Summarizer).await;
        context.device_state = observation.clone();
        let digest = self
            .decide(run, Stage::Summarizer, context, cancel, log)
            .await?;
        match digest.outcome {
            DecisionOutcome::CompleteSubgoals { ids } => {
                self.review(run, ids, &observation, cancel, log).await
            }
            other => Ok(signal_of(other)),
        }
    }

    /// Orchestrator confirms (or not) the claimed completions.
    async fn review(
        &self,
        run: &mut TaskRun,
        claimed: Vec<String>,
        observation: &Option<Value>,
        cancel: &CancellationToken,
        log: &mut CycleLog,
    ) -> Result<Option<CycleSignal>, PilotError> {
        let mut context = self.context(run, Stage::Orchestrator).await;
        context.device_state = observation.clone();
        context.claimed_completions = claimed.clone();
        let decision = self
            .decide(run, Stage::Orchestrator, context, cancel, log)
            .await?;
        match decision.outcome {
            DecisionOutcome::CompleteSubgoals { ids } => {
                run.complete_subgoals(Stage::Orchestrator, &ids)?;
                Ok(None)
            }
            DecisionOutcome::Continue => {
                run.note(
                    Stage::Orchestrator,
                    format!("review: completion of [{}] not confirmed", claimed.join(", ")),
                );
                Ok(None)
            }
            other => Ok(signal_of(other)),
        }
    }

    async fn decide(
        &self,
        run: &mut TaskRun,
        stage: Stage,
        context: TaskContext,
        cancel: &CancellationToken,
        log: &mut CycleLog,
    ) -> Result<Decision, PilotError> {
        if cancel.is_cancelled() {
            return Err(PilotError::Cancelled);
        }
        let port = self
            .ports
            .get(stage)
            .ok_or(PilotError::MissingStage { stage })?;
        if stage != Stage::Planner {
            log.visit(stage);
        }

        let decision = self.boundary.decide(port.as_ref(), stage, &context).await?;
        if let Some(thought) = &decision.thought {
            run.note(stage, thought.clone());
        }
        if !decision.discarded_actions.is_empty() {
            let names: Vec<&str> = decision
                .discarded_actions
                .iter()
                .map(|call| call.name.as_str())
                .collect();
            run.note(
                stage,
                format!(
                    "discarded actions [{}]: subgoal completion takes precedence",
                    names.join(", ")
                ),
            );
        }
        log.decisions.push(DecisionSummary {
            stage,
            outcome: decision.outcome.summary(),
            thought: decision.thought.clone(),
        });
        Ok(decision)
    }

    async fn execute_batch(
        &self,
        run: &mut TaskRun,
        calls: Vec<ToolCall>,
        cancel: &CancellationToken,
        log: &mut CycleLog,
    ) -> Result<(), PilotError> {
        if cancel.is_cancelled() {
            return Err(PilotError::Cancelled);
        }
        log.visit(Stage::Tools);
        let report = self
            .coordinator
            .execute(calls, self.config.execution_mode, cancel)
            .await;
        log.results = report.outcomes.clone();
        run.record_step(report.outcomes);
        if cancel.is_cancelled() {
            return Err(PilotError::Cancelled);
        }
        Ok(())
    }

    /// Context for `stage`, with a fresh screen capture when vision is on.
    async fn context(&self, run: &TaskRun, stage: Stage) -> TaskContext {
        let mut context = TaskContext::from_run(run, stage, self.config.context_thoughts);
        if self.config.use_vision {
            context.screen = self.probe(CAPTURE_SCREEN).await;
        }
        context
    }

    /// Device state for this cycle only.
    async fn observe(&self, run: &mut TaskRun) -> Option<Value> {
        let observation = self.probe(OBSERVE_DEVICE).await;
        if observation.is_none() {
            run.note(Stage::Contextor, "device observation unavailable this cycle");
        }
        observation
    }

    async fn probe(&self, tool: &str) -> Option<Value> {
        let result = execute_with_timeout(
            self.device.as_ref(),
            &ToolCall::bare(tool),
            self.config.tool_timeout(),
        )
        .await;
        if !result.ok {
            warn!(tool, error = ?result.error, "device probe failed");
            return None;
        }
        result.payload
    }

    fn build_output(&self, run: &TaskRun, result: Option<Value>) -> Result<TaskOutput, PilotError> {
        let Some(schema) = run.output_schema() else {
            return Ok(match result {
                None => TaskOutput::Empty,
                Some(Value::String(text)) => TaskOutput::Text(text),
                Some(value) => TaskOutput::Structured(value),
            });
        };
        let Some(value) = result else {
            return Err(PilotError::malformed(
                Stage::Convergence,
                "task ended without a result but an output schema was supplied",
            ));
        };
        let validator = jsonschema::validator_for(schema).map_err(|err| {
            PilotError::malformed(Stage::Convergence, format!("invalid output schema: {err}"))
        })?;
        let messages: Vec<String> = validator
            .iter_errors(&value)
            .map(|err| err.to_string())
            .collect();
        if !messages.is_empty() {
            return Err(PilotError::malformed(
                Stage::Convergence,
                format!("task result does not match output schema: {}", messages.join("; ")),
            ));
        }
        Ok(TaskOutput::Structured(value))
    }

    fn write_trace(
        &self,
        run: &TaskRun,
        log: CycleLog,
        convergence: String,
        started: Instant,
    ) {
        let record = TraceRecord {
            run_id: run.run_id().to_string(),
            cycle: run.cycle(),
            step: run.step_count(),
            phase: run.phase(),
            stages: log.stages,
            decisions: log.decisions,
            tool_results: log.results,
            convergence,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        if let Err(err) = self.trace.record(&record) {
            warn!(error = %format!("{err:#}"), cycle = record.cycle, "trace write failed");
        }
    }

    fn write_checkpoint(&self, run: &TaskRun) {
        let Some(path) = &self.checkpoint else {
            return;
        };
        if let Err(err) = write_snapshot(path, run) {
            warn!(error = %format!("{err:#}"), path = %path.display(), "checkpoint write failed");
        }
    }
}

/// Replan and completion requests become convergence signals.
fn signal_of(outcome: DecisionOutcome) -> Option<CycleSignal> {
    match outcome {
        DecisionOutcome::ReplanRequested { reason } => Some(CycleSignal::ReplanRequested(reason)),
        DecisionOutcome::TaskComplete { result } => Some(CycleSignal::TaskComplete(result)),
        DecisionOutcome::Plan { .. }
        | DecisionOutcome::CompleteSubgoals { .. }
        | DecisionOutcome::StructuredActions { .. }
        | DecisionOutcome::Continue => None,
    }
}
