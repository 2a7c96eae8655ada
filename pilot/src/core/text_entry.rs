//! State table for the text-entry protocol.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextEntryState {
    Idle,
    Focused,
    Cleared,
    Typed,
    Verified,
    Failed,
}

impl TextEntryState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TextEntryState::Verified | TextEntryState::Failed)
    }

    /// True if `self -> next` is an edge of the protocol.
    ///
    /// `Typed -> Cleared` is the retry edge taken after a verification mismatch.
    pub fn can_transition(self, next: TextEntryState) -> bool {
        use TextEntryState::{Cleared, Failed, Focused, Idle, Typed, Verified};
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Idle, Focused) | (Focused, Cleared) | (Cleared, Typed) | (Typed, Verified) => true,
            (Typed, Cleared) => true,
            _ => false,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            TextEntryState::Idle => "idle",
            TextEntryState::Focused => "focused",
            TextEntryState::Cleared => "cleared",
            TextEntryState::Typed => "typed",
            TextEntryState::Verified => "verified",
            TextEntryState::Failed => "failed",
        }
    }
}

impl fmt::Display for TextEntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_and_retry_edges_are_allowed() {
        let path = [
            TextEntryState::Idle,
            TextEntryState::Focused,
            TextEntryState::Cleared,
            TextEntryState::Typed,
            TextEntryState::Cleared,
            TextEntryState::Typed,
            TextEntryState::Verified,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for next in [
            TextEntryState::Idle,
            TextEntryState::Cleared,
            TextEntryState::Failed,
        ] {
            assert!(!TextEntryState::Verified.can_transition(next));
            assert!(!TextEntryState::Failed.can_transition(next));
        }
        assert!(TextEntryState::Idle.can_transition(TextEntryState::Failed));
        assert!(!TextEntryState::Idle.can_transition(TextEntryState::Typed));
    }
}
