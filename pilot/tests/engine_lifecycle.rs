//! Engine-level lifecycle tests.
//!
//! These drive complete task runs through scripted decision ports and a
//! scripted device to verify end-to-end behavior: step accounting, replanning,
//! abort paths, cancellation, traces and checkpoint resume.

use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use pilot::core::topology::{Stage, Topology};
use pilot::core::types::{
    CallOutcome, ExecutionMode, SubgoalStatus, TaskOutput, TaskPhase, TaskStatus, ToolCall,
    ToolResult,
};
use pilot::engine::{Engine, StagePorts};
use pilot::error::FailureReason;
use pilot::io::config::PilotConfig;
use pilot::io::decision::{DecisionPort, TaskContext};
use pilot::io::snapshot::{load_snapshot, write_snapshot};
use pilot::io::trace::{FileTraceSink, TracePaths};
use pilot::run::TaskOutcome;
use pilot::test_support::{
    ScriptedDecisionPort, ScriptedDevice, actions_payload, complete_payload, plan_payload,
    plan_with,
};

fn config(topology: Topology) -> PilotConfig {
    PilotConfig {
        topology,
        max_steps: 20,
        ..PilotConfig::default()
    }
}

fn engine(
    config: PilotConfig,
    port: &Arc<ScriptedDecisionPort>,
    device: &Arc<ScriptedDevice>,
) -> Engine {
    let ports = StagePorts::uniform(config.topology, port.clone());
    Engine::new(config, ports, device.clone()).expect("engine")
}

/// A run that keeps acting without finishing stops at the step budget.
///
/// Every actor decision yields one batch, so with `max_steps = 3` the third
/// batch exhausts the budget and the run ends ABORTED without a fourth
/// decision.
#[tokio::test]
async fn step_budget_aborts_run() {
    let port = Arc::new(ScriptedDecisionPort::new());
    let device = Arc::new(ScriptedDevice::new());
    port.push(Stage::Planner, plan_payload(&["scroll forever"]));
    port.set_fallback(
        Stage::Actor,
        actions_payload(&[ToolCall::bare("swipe"), ToolCall::bare("swipe")]),
    );

    let config = PilotConfig {
        max_steps: 3,
        ..config(Topology::Baseline)
    };
    let report = engine(config, &port, &device)
        .run("scroll", &CancellationToken::new())
        .await;

    assert_eq!(report.status, TaskStatus::Aborted);
    assert_eq!(
        report.failure_reason(),
        Some(FailureReason::StepBudgetExhausted)
    );
    assert_eq!(report.steps, 3);
    assert_eq!(port.invoked(Stage::Actor), 3);
    // Two calls per batch, one step per batch.
    assert_eq!(device.count("swipe"), 6);
}

/// An explicit replan request fails the current subgoal, keeps finished
/// work, and hands the reason to the planner.
#[tokio::test]
async fn replan_request_retires_current_subgoal() {
    let port = Arc::new(ScriptedDecisionPort::new());
    let device = Arc::new(ScriptedDevice::new());
    port.push(Stage::Planner, plan_payload(&["open app", "find chat", "send"]));
    port.push(Stage::Actor, complete_payload(&["1"]));
    port.push(Stage::Actor, json!({"replan_reason": "chat list is empty"}));
    port.push(
        Stage::Planner,
        json!({"subgoals": [{"id": "search", "description": "search for contact"}]}),
    );
    port.push(Stage::Actor, complete_payload(&["search"]));

    let engine = engine(config(Topology::Baseline), &port, &device);
    let (run, report) = engine
        .drive(engine.new_run("message bob"), &CancellationToken::new())
        .await;

    assert_eq!(report.status, TaskStatus::Success);
    assert_eq!(run.replans(), 1);
    let active: Vec<(&str, SubgoalStatus)> = run
        .plan()
        .subgoals()
        .iter()
        .map(|s| (s.id.as_str(), s.status))
        .collect();
    assert_eq!(
        active,
        vec![("1", SubgoalStatus::Success), ("search", SubgoalStatus::Success)]
    );
    let retired: Vec<(&str, SubgoalStatus)> = run
        .plan()
        .retired()
        .iter()
        .map(|s| (s.id.as_str(), s.status))
        .collect();
    assert_eq!(retired, vec![("2", SubgoalStatus::Failure)]);

    let planner_contexts: Vec<TaskContext> = port
        .invocations()
        .into_iter()
        .filter(|context| context.stage == Stage::Planner)
        .collect();
    assert_eq!(planner_contexts.len(), 2);
    assert_eq!(planner_contexts[0].replan_reason, None);
    assert_eq!(
        planner_contexts[1].replan_reason.as_deref(),
        Some("chat list is empty")
    );
}

/// Cycles without subgoal progress trigger a replan, and the replan budget
/// turns the next stall into a failure.
#[tokio::test]
async fn stalled_cycles_replan_until_budget_runs_out() {
    let port = Arc::new(ScriptedDecisionPort::new());
    let device = Arc::new(ScriptedDevice::new());
    port.set_fallback(Stage::Planner, plan_payload(&["tap the button"]));
    port.set_fallback(Stage::Actor, actions_payload(&[ToolCall::bare("tap")]));
    device.set_fallback("tap", ToolResult::failure("no such element"));

    let config = PilotConfig {
        stall_cycle_limit: 2,
        max_replans: 1,
        ..config(Topology::Baseline)
    };
    let report = engine(config, &port, &device)
        .run("press", &CancellationToken::new())
        .await;

    assert_eq!(report.status, TaskStatus::Failure);
    assert_eq!(report.failure_reason(), Some(FailureReason::ReplanExhausted));
    assert_eq!(report.steps, 4);

    let reasons: Vec<Option<String>> = port
        .invocations()
        .into_iter()
        .filter(|context| context.stage == Stage::Planner)
        .map(|context| context.replan_reason)
        .collect();
    assert_eq!(
        reasons,
        vec![
            None,
            Some(
                "no subgoal progress for 2 consecutive cycles; \
                 last failure: tool 'tap' failed: no such element"
                    .to_string()
            ),
        ]
    );
}

/// With sequential-abort dispatch a failed call stops the rest of the batch,
/// and the summarizer sees the aborted calls in order.
#[tokio::test]
async fn sequential_abort_reaches_the_summarizer() {
    let port = Arc::new(ScriptedDecisionPort::new());
    let device = Arc::new(ScriptedDevice::new());
    port.push(Stage::Planner, plan_payload(&["fill form"]));
    port.push(
        Stage::Cortex,
        actions_payload(&[
            ToolCall::bare("tap"),
            ToolCall::bare("swipe"),
            ToolCall::bare("press_back"),
        ]),
    );
    port.push(Stage::Executor, json!({}));
    device.push("swipe", ToolResult::failure("gesture rejected"));
    port.push(Stage::Summarizer, json!({"task_complete": {}}));

    let config = PilotConfig {
        execution_mode: ExecutionMode::SequentialAbort,
        ..config(Topology::MultiRole)
    };
    let report = engine(config, &port, &device)
        .run("fill", &CancellationToken::new())
        .await;
    assert_eq!(report.status, TaskStatus::Success);
    assert_eq!(device.call_names(), vec!["observe_device", "tap", "swipe"]);

    let summarizer = port
        .invocations()
        .into_iter()
        .find(|context| context.stage == Stage::Summarizer)
        .expect("summarizer invoked");
    let states: Vec<&CallOutcome> = summarizer
        .latest_results
        .iter()
        .map(|outcome| &outcome.outcome)
        .collect();
    assert!(matches!(states[0], CallOutcome::Completed { result } if result.ok));
    assert!(matches!(states[1], CallOutcome::Completed { result } if !result.ok));
    assert_eq!(states[2], &CallOutcome::Aborted);
}

#[tokio::test]
async fn cancelled_before_start_never_plans() {
    let port = Arc::new(ScriptedDecisionPort::new());
    let device = Arc::new(ScriptedDevice::new());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = engine(config(Topology::MultiRole), &port, &device)
        .run("anything", &cancel)
        .await;
    assert_eq!(report.status, TaskStatus::Aborted);
    assert_eq!(report.failure_reason(), Some(FailureReason::Cancelled));
    assert_eq!(report.steps, 0);
    assert!(port.invocations().is_empty());
}

/// Cancelling while a batch is in flight lets the batch finish, counts it,
/// then ends the run without another decision.
#[tokio::test(start_paused = true)]
async fn cancellation_during_batch_stops_after_it() {
    let port = Arc::new(ScriptedDecisionPort::new());
    let device = Arc::new(ScriptedDevice::new());
    port.push(Stage::Planner, plan_payload(&["wait"]));
    port.set_fallback(Stage::Actor, actions_payload(&[ToolCall::bare("wait")]));
    device.push_delayed("wait", ToolResult::success(), Duration::from_secs(10));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        trigger.cancel();
    });

    let report = engine(config(Topology::Baseline), &port, &device)
        .run("wait", &cancel)
        .await;
    assert_eq!(report.status, TaskStatus::Aborted);
    assert_eq!(report.failure_reason(), Some(FailureReason::Cancelled));
    assert_eq!(report.steps, 1);
    assert_eq!(port.invoked(Stage::Actor), 1);
}

#[tokio::test(start_paused = true)]
async fn slow_planner_times_out() {
    let port = Arc::new(ScriptedDecisionPort::new());
    let device = Arc::new(ScriptedDevice::new());
    port.push_delayed(
        Stage::Planner,
        plan_payload(&["a"]),
        Duration::from_secs(600),
    );

    let config = PilotConfig {
        decision_timeout_secs: 5,
        ..config(Topology::Baseline)
    };
    let report = engine(config, &port, &device)
        .run("a", &CancellationToken::new())
        .await;
    assert_eq!(report.status, TaskStatus::Failure);
    assert_eq!(report.failure_reason(), Some(FailureReason::DecisionTimeout));
    match report.outcome {
        TaskOutcome::Failure { message, .. } => assert!(message.contains("planner")),
        TaskOutcome::Success { .. } => panic!("expected failure"),
    }
}

#[tokio::test]
async fn port_errors_fail_the_run() {
    let port = Arc::new(ScriptedDecisionPort::new());
    let device = Arc::new(ScriptedDevice::new());
    port.push(Stage::Planner, plan_payload(&["a"]));
    port.push_error(Stage::Actor, "model unavailable");

    let report = engine(config(Topology::Baseline), &port, &device)
        .run("a", &CancellationToken::new())
        .await;
    assert_eq!(report.failure_reason(), Some(FailureReason::DecisionFailed));
    match report.outcome {
        TaskOutcome::Failure {
            message, thoughts, ..
        } => {
            assert!(message.contains("model unavailable"));
            assert!(!thoughts.is_empty());
        }
        TaskOutcome::Success { .. } => panic!("expected failure"),
    }
}

#[tokio::test]
async fn file_trace_sink_writes_one_record_per_cycle() {
    let temp = tempfile::tempdir().expect("tempdir");
    let port = Arc::new(ScriptedDecisionPort::new());
    let device = Arc::new(ScriptedDevice::new());
    port.push(Stage::Planner, plan_payload(&["a"]));
    port.push(Stage::Actor, actions_payload(&[ToolCall::bare("tap")]));
    port.push(Stage::Actor, complete_payload(&["1"]));

    let report = engine(config(Topology::Baseline), &port, &device)
        .with_trace_sink(Box::new(FileTraceSink::new(temp.path())))
        .run("a", &CancellationToken::new())
        .await;
    assert_eq!(report.status, TaskStatus::Success);

    let paths = TracePaths::new(temp.path(), &report.run_id);
    let first: Value =
        serde_json::from_str(&fs::read_to_string(paths.cycle_path(1)).expect("read cycle 1"))
            .expect("parse cycle 1");
    assert_eq!(first["step"], 1);
    assert_eq!(first["convergence"], "continue");
    assert_eq!(first["tool_results"][0]["call"]["name"], "tap");
    let second: Value =
        serde_json::from_str(&fs::read_to_string(paths.cycle_path(2)).expect("read cycle 2"))
            .expect("parse cycle 2");
    assert_eq!(second["convergence"], "end");
    assert!(!paths.cycle_path(3).exists());
}

/// Port that copies the checkpoint aside and fails on its `crash_at`-th
/// actor invocation, standing in for a process that dies mid-run.
struct CrashingPort {
    inner: Arc<ScriptedDecisionPort>,
    checkpoint: PathBuf,
    crash_at: usize,
    captured: Mutex<Option<String>>,
}

#[async_trait]
impl DecisionPort for CrashingPort {
    async fn invoke(&self, stage: Stage, context: &TaskContext) -> Result<Value> {
        if stage == Stage::Actor && self.inner.invoked(Stage::Actor) + 1 == self.crash_at {
            let snapshot = fs::read_to_string(&self.checkpoint)?;
            *self.captured.lock().expect("captured lock") = Some(snapshot);
            return Err(anyhow!("process killed"));
        }
        self.inner.invoke(stage, context).await
    }
}

/// A run restored from a mid-run checkpoint continues where it stopped:
/// same run id, same plan, step and cycle counters carried forward.
#[tokio::test]
async fn resume_continues_from_checkpoint() {
    let temp = tempfile::tempdir().expect("tempdir");
    let checkpoint = temp.path().join(".pilot").join("snapshot.json");

    let scripted = Arc::new(ScriptedDecisionPort::new());
    scripted.push(Stage::Planner, plan_payload(&["open", "confirm"]));
    scripted.push(Stage::Actor, actions_payload(&[ToolCall::bare("launch")]));
    scripted.push(Stage::Actor, complete_payload(&["1"]));
    let crashing = Arc::new(CrashingPort {
        inner: scripted.clone(),
        checkpoint: checkpoint.clone(),
        crash_at: 3,
        captured: Mutex::new(None),
    });
    let device = Arc::new(ScriptedDevice::new());
    let first = Engine::new(
        config(Topology::Baseline),
        StagePorts::uniform(Topology::Baseline, crashing.clone()),
        device.clone(),
    )
    .expect("engine")
    .with_checkpoint(&checkpoint);
    let (crashed, report) = first
        .drive(first.new_run("open and confirm"), &CancellationToken::new())
        .await;
    assert_eq!(report.failure_reason(), Some(FailureReason::DecisionFailed));

    let captured = crashing
        .captured
        .lock()
        .expect("captured lock")
        .clone()
        .expect("checkpoint captured");
    let restored_path = temp.path().join("restored.json");
    fs::write(&restored_path, captured).expect("write restored");
    let restored = load_snapshot(&restored_path).expect("load restored");
    assert_eq!(restored.phase(), TaskPhase::Executing);
    assert_eq!(restored.step_count(), 1);
    assert_eq!(restored.cycle(), 2);
    assert_eq!(restored.run_id(), crashed.run_id());

    let port = Arc::new(ScriptedDecisionPort::new());
    port.push(Stage::Actor, complete_payload(&["2"]));
    let second = engine(config(Topology::Baseline), &port, &device);
    let (resumed, report) = second.resume(restored, &CancellationToken::new()).await;

    assert_eq!(report.status, TaskStatus::Success);
    assert_eq!(report.run_id, crashed.run_id());
    assert_eq!(report.steps, 1);
    assert_eq!(report.cycles, 3);
    assert!(resumed.plan().is_complete());
    // The plan survived, so the planner is not asked again.
    assert_eq!(port.stages(), vec![Stage::Actor]);

    // Resuming a finished run hands back the recorded report.
    let (_, again) = second.resume(resumed, &CancellationToken::new()).await;
    assert_eq!(again, report);
}

#[tokio::test]
async fn resume_rejects_run_for_unwired_topology() {
    let port = Arc::new(ScriptedDecisionPort::new());
    let device = Arc::new(ScriptedDevice::new());
    let multi_role = engine(config(Topology::MultiRole), &port, &device);
    let baseline = engine(config(Topology::Baseline), &port, &device);

    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("snapshot.json");
    write_snapshot(&path, &multi_role.new_run("x")).expect("write");
    let run = load_snapshot(&path).expect("load");

    let (_, report) = baseline.resume(run, &CancellationToken::new()).await;
    assert_eq!(report.status, TaskStatus::Failure);
    assert_eq!(report.failure_reason(), Some(FailureReason::MissingStage));
    assert!(port.invocations().is_empty());
}

/// A run checkpointed with its budget already spent aborts on resume before
/// any decision or tool call.
#[tokio::test]
async fn resume_at_step_budget_aborts_without_acting() {
    let port = Arc::new(ScriptedDecisionPort::new());
    let device = Arc::new(ScriptedDevice::new());
    port.set_fallback(Stage::Actor, actions_payload(&[ToolCall::bare("swipe")]));
    let config = PilotConfig {
        max_steps: 2,
        ..config(Topology::Baseline)
    };
    let engine = engine(config, &port, &device);

    let mut stored = serde_json::to_value(engine.new_run("scroll")).expect("serialize");
    stored["plan"] = serde_json::to_value(plan_with(&["scroll forever"])).expect("plan");
    stored["phase"] = serde_json::to_value(TaskPhase::Executing).expect("phase");
    stored["step_count"] = json!(2);
    stored["cycle"] = json!(2);
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("snapshot.json");
    fs::write(&path, stored.to_string()).expect("write snapshot");
    let run = load_snapshot(&path).expect("load");

    let (run, report) = engine.resume(run, &CancellationToken::new()).await;
    assert_eq!(report.status, TaskStatus::Aborted);
    assert_eq!(
        report.failure_reason(),
        Some(FailureReason::StepBudgetExhausted)
    );
    assert_eq!(report.steps, 2);
    assert_eq!(run.cycle(), 2);
    assert!(port.invocations().is_empty());
    assert!(device.calls().is_empty());
}

/// Text-entry calls from the cortex go through focus/clear/type/verify and
/// the verified field content is what the device ends up holding.
#[tokio::test]
async fn multi_role_text_entry_is_verified() {
    let port = Arc::new(ScriptedDecisionPort::new());
    let device = Arc::new(ScriptedDevice::new());
    port.push(Stage::Planner, plan_payload(&["type query"]));
    port.push(
        Stage::Cortex,
        actions_payload(&[ToolCall::new(
            "input_text",
            json!({"target": "search", "text": "coffee"}),
        )]),
    );
    port.push(Stage::Executor, json!({}));
    port.push(Stage::Summarizer, complete_payload(&["1"]));
    port.push(Stage::Orchestrator, complete_payload(&["1"]));

    let report = engine(config(Topology::MultiRole), &port, &device)
        .run("search coffee", &CancellationToken::new())
        .await;
    assert_eq!(report.status, TaskStatus::Success);
    assert_eq!(report.output(), Some(&TaskOutput::Empty));
    assert_eq!(device.field_text("search").as_deref(), Some("coffee"));
    assert_eq!(device.count("input_text"), 0);
    assert_eq!(device.count("focus_element"), 1);
    assert_eq!(device.count("type_text"), 1);
}
