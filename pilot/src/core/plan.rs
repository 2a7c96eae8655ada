//! Subgoal plan lifecycle.
//!
//! The plan is an ordered list of subgoals owned by one task run. It is only
//! mutated through the operations below, each of which returns a
//! [`PlanChange`] so the caller can record what happened.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::core::types::{Subgoal, SubgoalDraft, SubgoalStatus};
use crate::error::PilotError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubgoalPlan {
    subgoals: Vec<Subgoal>,
    /// Failed subgoals removed by a replan, kept for the audit trail.
    #[serde(default)]
    retired: Vec<Subgoal>,
    /// Counter for ids assigned to drafts without one.
    #[serde(default)]
    next_id: u32,
}

/// Summary of a single plan mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanChange {
    /// Subgoals that moved to SUCCESS (already-successful ids are not listed).
    Completed { ids: Vec<String> },
    Failed { id: String },
    Started { id: String },
    Replaced {
        kept: Vec<String>,
        retired: Vec<String>,
        dropped: Vec<String>,
        added: Vec<String>,
    },
}

impl PlanChange {
    pub fn is_noop(&self) -> bool {
        matches!(self, PlanChange::Completed { ids } if ids.is_empty())
    }

    /// Subgoal the change is about, when there is exactly one.
    pub fn subgoal_id(&self) -> Option<&str> {
        match self {
            PlanChange::Completed { ids } if ids.len() == 1 => Some(ids[0].as_str()),
            PlanChange::Failed { id } | PlanChange::Started { id } => Some(id.as_str()),
            _ => None,
        }
    }

    /// Human-readable description used for derived thoughts.
    pub fn summary(&self) -> String {
        match self {
            PlanChange::Completed { ids } => {
                format!("plan: marked subgoals [{}] as success", ids.join(", "))
            }
            PlanChange::Failed { id } => format!("plan: marked subgoal '{id}' as failure"),
            PlanChange::Started { id } => format!("plan: started subgoal '{id}'"),
            PlanChange::Replaced {
                kept,
                retired,
                dropped,
                added,
            } => format!(
                "plan: replaced plan (kept [{}], retired [{}], dropped [{}], added [{}])",
                kept.join(", "),
                retired.join(", "),
                dropped.join(", "),
                added.join(", ")
            ),
        }
    }
}

impl SubgoalPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subgoals(&self) -> &[Subgoal] {
        &self.subgoals
    }

    pub fn retired(&self) -> &[Subgoal] {
        &self.retired
    }

    pub fn is_empty(&self) -> bool {
        self.subgoals.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Subgoal> {
        self.subgoals.iter().find(|subgoal| subgoal.id == id)
    }

    /// The PENDING subgoal, if any.
    pub fn current(&self) -> Option<&Subgoal> {
        self.subgoals
            .iter()
            .find(|subgoal| subgoal.status == SubgoalStatus::Pending)
    }

    pub fn has_not_started(&self) -> bool {
        self.subgoals
            .iter()
            .any(|subgoal| subgoal.status == SubgoalStatus::NotStarted)
    }

    /// True if the plan is non-empty and every subgoal is SUCCESS.
    pub fn is_complete(&self) -> bool {
        !self.subgoals.is_empty()
            && self
                .subgoals
                .iter()
                .all(|subgoal| subgoal.status == SubgoalStatus::Success)
    }

    pub fn success_count(&self) -> usize {
        self.subgoals
            .iter()
            .filter(|subgoal| subgoal.status == SubgoalStatus::Success)
            .count()
    }

    /// Ids of subgoals that are NOT_STARTED or PENDING, in plan order.
    pub fn remaining_ids(&self) -> Vec<String> {
        self.subgoals
            .iter()
            .filter(|subgoal| !subgoal.status.is_terminal())
            .map(|subgoal| subgoal.id.clone())
            .collect()
    }

    /// Move one subgoal to `to`, enforcing the forward-only lifecycle.
    ///
    /// Re-applying a terminal status to a subgoal that already has it is a
    /// no-op and returns `Ok(false)`.
    pub fn transition(&mut self, id: &str, to: SubgoalStatus) -> Result<bool, PilotError> {
        let index = self.index_of(id)?;
        let from = self.subgoals[index].status;
        if from == to && to.is_terminal() {
            return Ok(false);
        }
        if !transition_allowed(from, to) {
            return Err(invalid(id, from, to));
        }
        if to == SubgoalStatus::Pending && self.current().is_some() {
            // At most one subgoal may be pending.
            return Err(invalid(id, from, to));
        }
        self.subgoals[index].status = to;
        Ok(true)
    }

    /// Mark every listed subgoal as SUCCESS.
    ///
    /// All ids are validated before anything changes, so a failing call
    /// leaves the plan untouched.
    pub fn mark_complete(&mut self, ids: &[String]) -> Result<PlanChange, PilotError> {
        let mut unique: Vec<&str> = Vec::new();
        for id in ids {
            if !unique.contains(&id.as_str()) {
                unique.push(id);
            }
        }
        for id in &unique {
            let index = self.index_of(id)?;
            let from = self.subgoals[index].status;
            if from == SubgoalStatus::Failure {
                return Err(invalid(id, from, SubgoalStatus::Success));
            }
        }

        let mut completed = Vec::new();
        for id in unique {
            if self.transition(id, SubgoalStatus::Success)? {
                completed.push(id.to_string());
            }
        }
        Ok(PlanChange::Completed { ids: completed })
    }

    pub fn mark_failed(&mut self, id: &str) -> Result<PlanChange, PilotError> {
        self.transition(id, SubgoalStatus::Failure)?;
        Ok(PlanChange::Failed { id: id.to_string() })
    }

    /// Select the next NOT_STARTED subgoal as PENDING.
    pub fn advance(&mut self) -> Result<PlanChange, PilotError> {
        if let Some(current) = self.current() {
            return Err(invalid(
                &current.id,
                SubgoalStatus::Pending,
                SubgoalStatus::Pending,
            ));
        }
        let next = self
            .subgoals
            .iter()
            .find(|subgoal| subgoal.status == SubgoalStatus::NotStarted)
            .map(|subgoal| subgoal.id.clone())
            .ok_or(PilotError::PlanExhausted)?;
        self.transition(&next, SubgoalStatus::Pending)?;
        Ok(PlanChange::Started { id: next })
    }

    /// Replace every non-SUCCESS subgoal with `drafts`.
    ///
    /// SUCCESS subgoals stay in place as history, FAILURE subgoals move to
    /// the retired list, NOT_STARTED/PENDING ones are dropped. Draft ids that
    /// are missing or collide with an existing id are reassigned.
    pub fn replace(&mut self, drafts: Vec<SubgoalDraft>) -> PlanChange {
        let mut kept = Vec::new();
        let mut retired = Vec::new();
        let mut dropped = Vec::new();
        for subgoal in std::mem::take(&mut self.subgoals) {
            match subgoal.status {
                SubgoalStatus::Success => {
                    kept.push(subgoal.id.clone());
                    self.subgoals.push(subgoal);
                }
                SubgoalStatus::Failure => {
                    retired.push(subgoal.id.clone());
                    self.retired.push(subgoal);
                }
                SubgoalStatus::NotStarted | SubgoalStatus::Pending => dropped.push(subgoal.id),
            }
        }

        let mut taken: HashSet<String> = self
            .subgoals
            .iter()
            .chain(self.retired.iter())
            .map(|subgoal| subgoal.id.clone())
            .collect();
        let mut added = Vec::new();
        for draft in drafts {
            let id = match draft.id {
                Some(id) if !id.trim().is_empty() && !taken.contains(&id) => id,
                _ => self.fresh_id(&taken),
            };
            taken.insert(id.clone());
            added.push(id.clone());
            self.subgoals.push(Subgoal {
                id,
                description: draft.description,
                status: SubgoalStatus::NotStarted,
            });
        }

        PlanChange::Replaced {
            kept,
            retired,
            dropped,
            added,
        }
    }

    fn fresh_id(&mut self, taken: &HashSet<String>) -> String {
        loop {
            self.next_id += 1;
            let candidate = self.next_id.to_string();
            if !taken.contains(&candidate) {
                return candidate;
            }
        }
    }

    fn index_of(&self, id: &str) -> Result<usize, PilotError> {
        self.subgoals
            .iter()
            .position(|subgoal| subgoal.id == id)
            .ok_or_else(|| PilotError::UnknownSubgoal { id: id.to_string() })
    }
}

fn transition_allowed(from: SubgoalStatus, to: SubgoalStatus) -> bool {
    use SubgoalStatus::{Failure, NotStarted, Pending, Success};
    matches!(
        (from, to),
        (NotStarted, Pending)
            | (NotStarted, Success)
            | (NotStarted, Failure)
            | (Pending, Success)
            | (Pending, Failure)
    )
}

fn invalid(id: &str, from: SubgoalStatus, to: SubgoalStatus) -> PilotError {
    PilotError::InvalidTransition {
        subgoal_id: id.to_string(),
        from,
        to,
    }
}
