//! Reliable text input on top of the device boundary.
//!
//! A text-entry call is expanded into focus, clear, type and read-back
//! device calls. A read-back that does not match exactly is retried from
//! the clear step until the retry budget is spent.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, instrument, warn};

use crate::core::text_entry::TextEntryState;
use crate::core::types::{ToolCall, ToolResult};
use crate::error::PilotError;
use crate::io::device::{
    CLEAR_TEXT, Device, FOCUS_ELEMENT, TYPE_TEXT, execute_with_timeout, read_text_call,
    read_text_payload,
};

/// How a text-entry session ended.
#[derive(Debug, Clone, PartialEq)]
pub struct TextEntryReport {
    pub state: TextEntryState,
    pub retries_used: u32,
    /// Last content read back from the field.
    pub observed: Option<String>,
    pub error: Option<PilotError>,
}

impl TextEntryReport {
    pub fn verified(&self) -> bool {
        self.state == TextEntryState::Verified
    }

    pub fn into_result(self) -> ToolResult {
        let payload = json!({
            "state": self.state,
            "retries": self.retries_used,
            "observed": self.observed,
        });
        match self.error {
            None => ToolResult::success_with(payload),
            Some(err) => ToolResult {
                ok: false,
                error: Some(err.to_string()),
                payload: Some(payload),
            },
        }
    }
}

/// One in-flight entry; dropped when it reaches a terminal state.
struct TextEntrySession<'a> {
    target: &'a str,
    desired: &'a str,
    state: TextEntryState,
    retries_used: u32,
    observed: Option<String>,
}

impl<'a> TextEntrySession<'a> {
    fn new(target: &'a str, desired: &'a str) -> Self {
        Self {
            target,
            desired,
            state: TextEntryState::Idle,
            retries_used: 0,
            observed: None,
        }
    }

    fn advance(&mut self, next: TextEntryState) {
        debug_assert!(
            self.state.can_transition(next),
            "{} -> {}",
            self.state,
            next
        );
        debug!(element = self.target, from = %self.state, to = %next, "text entry transition");
        self.state = next;
    }

    fn finish(mut self, error: Option<PilotError>) -> TextEntryReport {
        let terminal = if error.is_some() {
            TextEntryState::Failed
        } else {
            TextEntryState::Verified
        };
        self.advance(terminal);
        TextEntryReport {
            state: self.state,
            retries_used: self.retries_used,
            observed: self.observed,
            error,
        }
    }
}

pub struct TextEntryProtocol {
    device: Arc<dyn Device>,
    retry_budget: u32,
    call_timeout: Duration,
}

impl TextEntryProtocol {
    pub fn new(device: Arc<dyn Device>, retry_budget: u32, call_timeout: Duration) -> Self {
        Self {
            device,
            retry_budget,
            call_timeout,
        }
    }

    pub fn retry_budget(&self) -> u32 {
        self.retry_budget
    }

    /// Execute a text-entry tool call (`{target, text}` arguments).
    pub async fn run_call(&self, call: &ToolCall) -> ToolResult {
        let (Some(target), Some(text)) = (call.arg_str("target"), call.arg_str("text")) else {
            return ToolResult::failure(format!(
                "tool '{}' requires string arguments 'target' and 'text'",
                call.name
            ));
        };
        self.enter(target, text).await.into_result()
    }

    #[instrument(skip_all, fields(element = target, len = text.len()))]
    pub async fn enter(&self, target: &str, text: &str) -> TextEntryReport {
        let mut session = TextEntrySession::new(target, text);

        let focus = self
            .call(ToolCall::new(FOCUS_ELEMENT, json!({ "target": target })))
            .await;
        if !focus.ok {
            return session.finish(Some(PilotError::ElementNotFocusable {
                element: target.to_string(),
                message: error_text(&focus),
            }));
        }
        session.advance(TextEntryState::Focused);

        loop {
            if let Err(err) = self.clear(target).await {
                return session.finish(Some(err));
            }
            session.advance(TextEntryState::Cleared);

            let typed = self
                .call(ToolCall::new(
                    TYPE_TEXT,
                    json!({ "target": target, "text": session.desired }),
                ))
                .await;
            if !typed.ok {
                return session.finish(Some(PilotError::InputRejected {
                    element: target.to_string(),
                    message: error_text(&typed),
                }));
            }
            session.advance(TextEntryState::Typed);

            let read = self.call(read_text_call(target)).await;
            session.observed = read_text_payload(&read).map(str::to_string);
            if read.ok && session.observed.as_deref() == Some(session.desired) {
                return session.finish(None);
            }

            if session.retries_used >= self.retry_budget {
                warn!(
                    retries = session.retries_used,
                    observed = ?session.observed,
                    "text entry never verified"
                );
                let message = format!(
                    "text mismatch after {} retries: expected {:?}, observed {:?}",
                    session.retries_used, session.desired, session.observed
                );
                return session.finish(Some(PilotError::ToolExecutionFailure {
                    tool: TYPE_TEXT.to_string(),
                    message,
                }));
            }
            session.retries_used += 1;
            debug!(
                retry = session.retries_used,
                observed = ?session.observed,
                "text mismatch, retrying from clear"
            );
        }
    }

    /// Clear the field. A failed clear on a field that reads back empty is fine.
    async fn clear(&self, target: &str) -> Result<(), PilotError> {
        let cleared = self
            .call(ToolCall::new(CLEAR_TEXT, json!({ "target": target })))
            .await;
        if cleared.ok {
            return Ok(());
        }
        let read = self.call(read_text_call(target)).await;
        if read.ok && read_text_payload(&read) == Some("") {
            debug!(element = target, "clear failed on an empty field, continuing");
            return Ok(());
        }
        Err(PilotError::ToolExecutionFailure {
            tool: CLEAR_TEXT.to_string(),
            message: error_text(&cleared),
        })
    }

    async fn call(&self, call: ToolCall) -> ToolResult {
        execute_with_timeout(self.device.as_ref(), &call, self.call_timeout).await
    }
}

fn error_text(result: &ToolResult) -> String {
    result
        .error
        .clone()
        .unwrap_or_else(|| "device reported failure".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::device::READ_TEXT;
    use crate::test_support::ScriptedDevice;

    fn protocol(device: &Arc<ScriptedDevice>, budget: u32) -> TextEntryProtocol {
        TextEntryProtocol::new(device.clone(), budget, Duration::from_secs(5))
    }

    fn read(text: &str) -> ToolResult {
        ToolResult::success_with(json!({ "text": text }))
    }

    #[tokio::test]
    async fn verifies_on_first_attempt() {
        let device = Arc::new(ScriptedDevice::new());
        device.push(READ_TEXT, read("hello"));

        let report = protocol(&device, 2).enter("search", "hello").await;
        assert!(report.verified());
        assert_eq!(report.retries_used, 0);
        assert_eq!(
            device.call_names(),
            vec!["focus_element", "clear_text", "type_text", "read_text"]
        );
    }

    /// Wrong content on the first read, right on the second: one retry.
    #[tokio::test]
    async fn verifies_after_exactly_one_retry() {
        let device = Arc::new(ScriptedDevice::new());
        device.push(READ_TEXT, read("helo"));
        device.push(READ_TEXT, read("hello"));

        let report = protocol(&device, 2).enter("search", "hello").await;
        assert_eq!(report.state, TextEntryState::Verified);
        assert_eq!(report.retries_used, 1);
        assert_eq!(device.count(CLEAR_TEXT), 2);
        assert_eq!(device.count(TYPE_TEXT), 2);
    }

    #[tokio::test]
    async fn fails_after_spending_the_whole_budget() {
        let device = Arc::new(ScriptedDevice::new());
        device.set_fallback(READ_TEXT, read("hel"));

        let report = protocol(&device, 2).enter("search", "hello").await;
        assert_eq!(report.state, TextEntryState::Failed);
        assert_eq!(report.retries_used, 2);
        assert_eq!(report.observed.as_deref(), Some("hel"));
        assert_eq!(device.count(TYPE_TEXT), 3);

        let result = report.into_result();
        assert!(!result.ok);
        assert!(result.error.as_deref().unwrap_or("").contains("\"hel\""));
    }

    #[tokio::test]
    async fn unfocusable_element_fails_before_typing() {
        let device = Arc::new(ScriptedDevice::new());
        device.push(FOCUS_ELEMENT, ToolResult::failure("element is disabled"));

        let report = protocol(&device, 2).enter("search", "hello").await;
        assert_eq!(report.state, TextEntryState::Failed);
        assert!(matches!(
            report.error,
            Some(PilotError::ElementNotFocusable { .. })
        ));
        assert_eq!(device.count(TYPE_TEXT), 0);
    }

    #[tokio::test]
    async fn rejected_input_is_reported() {
        let device = Arc::new(ScriptedDevice::new());
        device.push(TYPE_TEXT, ToolResult::failure("max length 3"));

        let report = protocol(&device, 2).enter("pin", "12345").await;
        assert_eq!(
            report.error,
            Some(PilotError::InputRejected {
                element: "pin".to_string(),
                message: "max length 3".to_string(),
            })
        );
    }

    /// Clearing an already-empty field is not an error.
    #[tokio::test]
    async fn failed_clear_on_empty_field_proceeds() {
        let device = Arc::new(ScriptedDevice::new());
        device.push(CLEAR_TEXT, ToolResult::failure("nothing to clear"));
        device.push(READ_TEXT, read(""));
        device.push(READ_TEXT, read("hi"));

        let report = protocol(&device, 0).enter("name", "hi").await;
        assert!(report.verified());
    }

    #[tokio::test]
    async fn run_call_requires_target_and_text() {
        let device = Arc::new(ScriptedDevice::new());
        let result = protocol(&device, 2)
            .run_call(&ToolCall::new("input_text", json!({ "text": "hi" })))
            .await;
        assert!(!result.ok);
        assert!(device.call_names().is_empty());
    }
}
