//! Scripted collaborators and fixtures for tests.
//!
//! Compiled for unit tests and, through the `test-support` feature, for the
//! integration tests under `tests/`.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::{Value, json};

use crate::core::plan::SubgoalPlan;
use crate::core::topology::Stage;
use crate::core::types::{SubgoalDraft, ToolCall, ToolResult};
use crate::io::decision::{DecisionPort, TaskContext};
use crate::io::device::{CAPTURE_SCREEN, CLEAR_TEXT, Device, OBSERVE_DEVICE, READ_TEXT, TYPE_TEXT};
use crate::io::trace::{TraceRecord, TraceSink};

/// Drafts without ids, one per description.
pub fn drafts(descriptions: &[&str]) -> Vec<SubgoalDraft> {
    descriptions
        .iter()
        .map(|description| SubgoalDraft::new(*description))
        .collect()
}

/// Fresh plan with ids `"1"`, `"2"`, ... and every subgoal NOT_STARTED.
pub fn plan_with(descriptions: &[&str]) -> SubgoalPlan {
    let mut plan = SubgoalPlan::new();
    plan.replace(drafts(descriptions));
    plan
}

/// Planner payload listing `descriptions`.
pub fn plan_payload(descriptions: &[&str]) -> Value {
    let subgoals: Vec<Value> = descriptions
        .iter()
        .map(|description| json!({ "description": description }))
        .collect();
    json!({ "thought": "planning", "subgoals": subgoals })
}

pub fn actions_payload(calls: &[ToolCall]) -> Value {
    json!({ "actions": calls })
}

pub fn complete_payload(ids: &[&str]) -> Value {
    json!({ "complete_subgoal_ids": ids })
}

#[derive(Debug, Clone)]
enum ScriptedDecision {
    Respond(Value),
    Delayed(Value, Duration),
    Fail(String),
}

/// Decision port that replays queued payloads per stage.
///
/// When a stage's queue is empty the stage fallback is used; without one
/// the invocation fails.
#[derive(Default)]
pub struct ScriptedDecisionPort {
    queues: Mutex<HashMap<Stage, VecDeque<ScriptedDecision>>>,
    fallbacks: Mutex<HashMap<Stage, Value>>,
    invocations: Mutex<Vec<TaskContext>>,
}

impl ScriptedDecisionPort {
    pub fn new() -> Self {
        Self::default()
    }

    fn enqueue(&self, stage: Stage, entry: ScriptedDecision) {
        self.queues
            .lock()
            .expect("queues lock")
            .entry(stage)
            .or_default()
            .push_back(entry);
    }

    pub fn push(&self, stage: Stage, payload: Value) {
        self.enqueue(stage, ScriptedDecision::Respond(payload));
    }

    pub fn push_delayed(&self, stage: Stage, payload: Value, delay: Duration) {
        self.enqueue(stage, ScriptedDecision::Delayed(payload, delay));
    }

    pub fn push_error(&self, stage: Stage, message: &str) {
        self.enqueue(stage, ScriptedDecision::Fail(message.to_string()));
    }

    pub fn set_fallback(&self, stage: Stage, payload: Value) {
        self.fallbacks
            .lock()
            .expect("fallbacks lock")
            .insert(stage, payload);
    }

    /// Contexts received so far, in invocation order.
    pub fn invocations(&self) -> Vec<TaskContext> {
        self.invocations.lock().expect("invocations lock").clone()
    }

    pub fn stages(&self) -> Vec<Stage> {
        self.invocations()
            .into_iter()
            .map(|context| context.stage)
            .collect()
    }

    pub fn invoked(&self, stage: Stage) -> usize {
        self.stages().into_iter().filter(|s| *s == stage).count()
    }
}

#[async_trait]
impl DecisionPort for ScriptedDecisionPort {
    async fn invoke(&self, stage: Stage, context: &TaskContext) -> Result<Value> {
        self.invocations
            .lock()
            .expect("invocations lock")
            .push(context.clone());
        let next = self
            .queues
            .lock()
            .expect("queues lock")
            .get_mut(&stage)
            .and_then(VecDeque::pop_front);
        let entry = match next {
            Some(entry) => entry,
            None => {
                let fallback = self
                    .fallbacks
                    .lock()
                    .expect("fallbacks lock")
                    .get(&stage)
                    .cloned();
                match fallback {
                    Some(payload) => ScriptedDecision::Respond(payload),
                    None => return Err(anyhow!("no scripted decision for stage '{stage}'")),
                }
            }
        };
        match entry {
            ScriptedDecision::Respond(payload) => Ok(payload),
            ScriptedDecision::Delayed(payload, delay) => {
                tokio::time::sleep(delay).await;
                Ok(payload)
            }
            ScriptedDecision::Fail(message) => Err(anyhow!(message)),
        }
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Device with per-tool result queues and a simulated set of text fields.
///
/// Unscripted calls succeed. `type_text`/`clear_text` update the simulated
/// field when they succeed, and unscripted `read_text` returns its content.
#[derive(Default)]
pub struct ScriptedDevice {
    queues: Mutex<HashMap<String, VecDeque<(ToolResult, Option<Duration>)>>>,
    fallbacks: Mutex<HashMap<String, ToolResult>>,
    calls: Mutex<Vec<ToolCall>>,
    fields: Mutex<HashMap<String, String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    captures: AtomicUsize,
}

impl ScriptedDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, tool: &str, result: ToolResult) {
        self.enqueue(tool, result, None);
    }

    pub fn push_delayed(&self, tool: &str, result: ToolResult, delay: Duration) {
        self.enqueue(tool, result, Some(delay));
    }

    fn enqueue(&self, tool: &str, result: ToolResult, delay: Option<Duration>) {
        self.queues
            .lock()
            .expect("queues lock")
            .entry(tool.to_string())
            .or_default()
            .push_back((result, delay));
    }

    /// Result used for `tool` once its queue is empty.
    pub fn set_fallback(&self, tool: &str, result: ToolResult) {
        self.fallbacks
            .lock()
            .expect("fallbacks lock")
            .insert(tool.to_string(), result);
    }

    pub fn calls(&self) -> Vec<ToolCall> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn call_names(&self) -> Vec<String> {
        self.calls().into_iter().map(|call| call.name).collect()
    }

    pub fn count(&self, tool: &str) -> usize {
        self.calls().iter().filter(|call| call.name == tool).count()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn field_text(&self, target: &str) -> Option<String> {
        self.fields.lock().expect("fields lock").get(target).cloned()
    }

    fn simulate(&self, call: &ToolCall) -> ToolResult {
        match call.name.as_str() {
            READ_TEXT => {
                let text = call
                    .arg_str("target")
                    .and_then(|target| self.field_text(target))
                    .unwrap_or_default();
                ToolResult::success_with(json!({ "text": text }))
            }
            OBSERVE_DEVICE => {
                let fields = self.fields.lock().expect("fields lock").clone();
                ToolResult::success_with(json!({ "fields": fields }))
            }
            CAPTURE_SCREEN => {
                let frame = self.captures.fetch_add(1, Ordering::SeqCst) + 1;
                ToolResult::success_with(json!({ "frame": frame }))
            }
            _ => ToolResult::success(),
        }
    }

    fn apply_effect(&self, call: &ToolCall) {
        let Some(target) = call.arg_str("target") else {
            return;
        };
        let mut fields = self.fields.lock().expect("fields lock");
        match call.name.as_str() {
            CLEAR_TEXT => {
                fields.insert(target.to_string(), String::new());
            }
            TYPE_TEXT => {
                let text = call.arg_str("text").unwrap_or_default();
                fields.insert(target.to_string(), text.to_string());
            }
            _ => {}
        }
    }
}

#[async_trait]
impl Device for ScriptedDevice {
    async fn execute(&self, call: &ToolCall) -> ToolResult {
        self.calls.lock().expect("calls lock").push(call.clone());
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let scripted = self
            .queues
            .lock()
            .expect("queues lock")
            .get_mut(&call.name)
            .and_then(VecDeque::pop_front);
        let (scripted, delay) = match scripted {
            Some((result, delay)) => (Some(result), delay),
            None => (
                self.fallbacks
                    .lock()
                    .expect("fallbacks lock")
                    .get(&call.name)
                    .cloned(),
                None,
            ),
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let result = scripted.unwrap_or_else(|| self.simulate(call));
        if result.ok {
            self.apply_effect(call);
        }
        result
    }
}

/// Trace sink that keeps every record in memory.
#[derive(Default)]
pub struct MemoryTraceSink {
    records: Mutex<Vec<TraceRecord>>,
}

impl MemoryTraceSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<TraceRecord> {
        self.records.lock().expect("records lock").clone()
    }
}

impl TraceSink for MemoryTraceSink {
    fn record(&self, record: &TraceRecord) -> Result<()> {
        self.records
            .lock()
            .expect("records lock")
            .push(record.clone());
        Ok(())
    }
}

/// Trace sink whose writes always fail.
pub struct FailingTraceSink;

impl TraceSink for FailingTraceSink {
    fn record(&self, _record: &TraceRecord) -> Result<()> {
        Err(anyhow!("trace storage unavailable"))
    }
}
