//! Bounded, append-only log of agent thoughts.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::core::topology::Stage;
use crate::core::types::AgentThought;

/// Ordered thought history for one task run.
///
/// Entries are never edited. Once `capacity` is reached the oldest entry is
/// dropped; `total` keeps counting so traces can tell how much was evicted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThoughtLog {
    entries: VecDeque<AgentThought>,
    capacity: usize,
    #[serde(default)]
    total: u64,
}

impl ThoughtLog {
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
            total: 0,
        }
    }

    /// Logs restored from disk may carry a zero capacity or excess entries;
    /// both are trimmed here.
    pub fn push(&mut self, thought: AgentThought) {
        while self.entries.len() >= self.capacity.max(1) {
            self.entries.pop_front();
        }
        self.entries.push_back(thought);
        self.total += 1;
    }

    pub fn record(&mut self, stage: Stage, subgoal_id: Option<&str>, text: impl Into<String>) {
        self.push(AgentThought {
            text: text.into(),
            stage,
            subgoal_id: subgoal_id.map(str::to_string),
        });
    }

    /// The last `n` thoughts, oldest first.
    pub fn recent(&self, n: usize) -> Vec<AgentThought> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(skip).cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AgentThought> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of thoughts ever recorded, including evicted ones.
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
