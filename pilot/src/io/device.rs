//! Device boundary.
//!
//! The [`Device`] trait is the only way the core touches a phone. Drivers
//! (adb, XCUITest bridges, remote farms) live outside this crate; tests use
//! [`ScriptedDevice`](crate::test_support::ScriptedDevice).

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::warn;

use crate::core::types::{ToolCall, ToolResult};

/// Delegated to the text-entry protocol (`{target, text}`).
pub const INPUT_TEXT: &str = "input_text";
/// Alias used by decision stages that focus and type in one request.
pub const FOCUS_AND_INPUT_TEXT: &str = "focus_and_input_text";
pub const FOCUS_ELEMENT: &str = "focus_element";
pub const CLEAR_TEXT: &str = "clear_text";
pub const TYPE_TEXT: &str = "type_text";
/// Payload is `{"text": <current field content>}`.
pub const READ_TEXT: &str = "read_text";
pub const CAPTURE_SCREEN: &str = "capture_screen";
pub const OBSERVE_DEVICE: &str = "observe_device";

/// A device that executes one tool call at a time per invocation.
///
/// Implementations must tolerate concurrent calls when parallel dispatch is
/// configured. Failures are reported as `ToolResult { ok: false, .. }`.
#[async_trait]
pub trait Device: Send + Sync {
    async fn execute(&self, call: &ToolCall) -> ToolResult;
}

pub fn is_text_entry(name: &str) -> bool {
    name == INPUT_TEXT || name == FOCUS_AND_INPUT_TEXT
}

/// Run one call with a deadline; expiry becomes a failed result.
pub async fn execute_with_timeout(
    device: &dyn Device,
    call: &ToolCall,
    timeout: Duration,
) -> ToolResult {
    match tokio::time::timeout(timeout, device.execute(call)).await {
        Ok(result) => result,
        Err(_) => {
            warn!(tool = %call.name, timeout = ?timeout, "tool call timed out");
            ToolResult::failure(format!("timed out after {timeout:?}"))
        }
    }
}

pub fn read_text_call(target: &str) -> ToolCall {
    ToolCall::new(READ_TEXT, json!({ "target": target }))
}

/// Extract the field content from a `read_text` result.
pub fn read_text_payload(result: &ToolResult) -> Option<&str> {
    result
        .payload
        .as_ref()
        .and_then(|payload| payload.get("text"))
        .and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedDevice;

    #[tokio::test(start_paused = true)]
    async fn slow_calls_become_timeouts() {
        let device = ScriptedDevice::new();
        device.push_delayed("tap", ToolResult::success(), Duration::from_secs(5));

        let result =
            execute_with_timeout(&device, &ToolCall::bare("tap"), Duration::from_secs(1)).await;
        assert!(!result.ok);
        assert!(result.error.as_deref().unwrap_or("").contains("timed out"));
    }

    #[test]
    fn read_text_payload_requires_string_text() {
        assert_eq!(
            read_text_payload(&ToolResult::success_with(json!({"text": "hi"}))),
            Some("hi")
        );
        assert_eq!(
            read_text_payload(&ToolResult::success_with(json!({"text": 3}))),
            None
        );
        assert_eq!(read_text_payload(&ToolResult::success()), None);
        assert!(is_text_entry("input_text"));
        assert!(!is_text_entry("type_text"));
    }
}
