//! Tool-call batch execution.
//!
//! The coordinator runs the calls produced by one decision either as an
//! ordered chain that stops at the first failure, or concurrently with
//! results aggregated in call order. Text-entry calls go through the
//! [`TextEntryProtocol`]; calls that declare an expected effect are
//! re-checked afterwards when post-validation is on.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::core::types::{ExecutionMode, ToolCall, ToolOutcome, ToolResult};
use crate::io::config::PilotConfig;
use crate::io::device::{
    Device, execute_with_timeout, is_text_entry, read_text_call, read_text_payload,
};
use crate::text_entry::TextEntryProtocol;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorSettings {
    pub tool_timeout: Duration,
    /// Permits shared by the calls of one parallel batch.
    pub max_concurrent_calls: usize,
    pub post_validation: bool,
}

impl CoordinatorSettings {
    pub fn from_config(config: &PilotConfig) -> Self {
        Self {
            tool_timeout: config.tool_timeout(),
            max_concurrent_calls: config.max_concurrent_calls,
            post_validation: config.post_validation,
        }
    }
}

/// Outcomes of one batch, in call order.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchReport {
    pub mode: ExecutionMode,
    pub outcomes: Vec<ToolOutcome>,
}

impl BatchReport {
    pub fn any_failed(&self) -> bool {
        self.outcomes.iter().any(ToolOutcome::failed)
    }

    pub fn dispatched(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.result().is_some())
            .count()
    }
}

pub struct ToolExecutionCoordinator {
    device: Arc<dyn Device>,
    text_entry: TextEntryProtocol,
    settings: CoordinatorSettings,
}

impl ToolExecutionCoordinator {
    pub fn new(
        device: Arc<dyn Device>,
        text_entry_retries: u32,
        settings: CoordinatorSettings,
    ) -> Self {
        let text_entry =
            TextEntryProtocol::new(device.clone(), text_entry_retries, settings.tool_timeout);
        Self {
            device,
            text_entry,
            settings,
        }
    }

    pub fn from_config(device: Arc<dyn Device>, config: &PilotConfig) -> Self {
        Self::new(
            device,
            config.text_entry_retries,
            CoordinatorSettings::from_config(config),
        )
    }

    pub fn settings(&self) -> CoordinatorSettings {
        self.settings
    }

    #[instrument(skip_all, fields(mode = ?mode, calls = calls.len()))]
    pub async fn execute(
        &self,
        calls: Vec<ToolCall>,
        mode: ExecutionMode,
        cancel: &CancellationToken,
    ) -> BatchReport {
        let outcomes = match mode {
            ExecutionMode::SequentialAbort => self.sequential(calls, cancel).await,
            ExecutionMode::Parallel => self.parallel(calls, cancel).await,
        };
        let report = BatchReport { mode, outcomes };
        info!(
            dispatched = report.dispatched(),
            failed = report.any_failed(),
            "tool batch finished"
        );
        report
    }

    async fn sequential(
        &self,
        calls: Vec<ToolCall>,
        cancel: &CancellationToken,
    ) -> Vec<ToolOutcome> {
        let mut outcomes = Vec::with_capacity(calls.len());
        let mut pending = calls.into_iter();
        let mut remainder: Option<fn(ToolCall) -> ToolOutcome> = None;

        for call in pending.by_ref() {
            if cancel.is_cancelled() {
                outcomes.push(ToolOutcome::cancelled(call));
                remainder = Some(ToolOutcome::cancelled);
                break;
            }
            let result = self.run_one(&call).await;
            let failed = !result.ok;
            outcomes.push(ToolOutcome::completed(call, result));
            if failed {
                debug!("call failed, aborting the rest of the batch");
                remainder = Some(ToolOutcome::aborted);
                break;
            }
        }
        if let Some(mark) = remainder {
            outcomes.extend(pending.map(mark));
        }
        outcomes
    }

    /// Dispatch every call concurrently, bounded by the permit count.
    ///
    /// Cancellation only affects calls still waiting for a permit; calls
    /// already on the device run to completion or timeout.
    async fn parallel(
        &self,
        calls: Vec<ToolCall>,
        cancel: &CancellationToken,
    ) -> Vec<ToolOutcome> {
        let permits = Semaphore::new(self.settings.max_concurrent_calls.max(1));
        let futures = calls.into_iter().map(|call| {
            let permits = &permits;
            async move {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    permit = permits.acquire() => permit.ok(),
                };
                let Some(_permit) = permit else {
                    return ToolOutcome::cancelled(call);
                };
                let result = self.run_one(&call).await;
                ToolOutcome::completed(call, result)
            }
        });
        join_all(futures).await
    }

    async fn run_one(&self, call: &ToolCall) -> ToolResult {
        if is_text_entry(&call.name) {
            debug!(tool = %call.name, "delegating to text entry");
            return self.text_entry.run_call(call).await;
        }
        let result =
            execute_with_timeout(self.device.as_ref(), call, self.settings.tool_timeout).await;
        self.post_validate(call, result).await
    }

    /// Re-read the field named in `arguments.expect` and compare.
    async fn post_validate(&self, call: &ToolCall, result: ToolResult) -> ToolResult {
        if !self.settings.post_validation || !result.ok {
            return result;
        }
        let Some(expect) = call.arguments.get("expect") else {
            return result;
        };
        let target = expect.get("target").and_then(Value::as_str);
        let text = expect.get("text").and_then(Value::as_str);
        let (Some(target), Some(text)) = (target, text) else {
            return ToolResult::failure(format!(
                "post-validation of '{}': 'expect' needs string 'target' and 'text'",
                call.name
            ));
        };

        let read = execute_with_timeout(
            self.device.as_ref(),
            &read_text_call(target),
            self.settings.tool_timeout,
        )
        .await;
        let observed = read_text_payload(&read).filter(|_| read.ok);
        if observed == Some(text) {
            return result;
        }
        warn!(tool = %call.name, element = target, ?observed, "post-validation mismatch");
        ToolResult {
            ok: false,
            error: Some(format!(
                "post-validation failed for '{target}': expected {text:?}, observed {observed:?}"
            )),
            payload: result.payload,
        }
    }
}
