//! Plan invariants checked after loading a snapshot and in tests.

use crate::core::plan::SubgoalPlan;
use crate::core::types::SubgoalStatus;
use std::collections::HashSet;

/// Check invariants that deserialization alone cannot enforce:
/// - No duplicate ids across active and retired subgoals
/// - At most one subgoal is `pending`
/// - Retired subgoals are all `failure`
pub fn validate_plan_invariants(plan: &SubgoalPlan) -> Vec<String> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();

    for subgoal in plan.subgoals().iter().chain(plan.retired()) {
        if !seen.insert(subgoal.id.as_str()) {
            errors.push(format!("duplicate subgoal id '{}'", subgoal.id));
        }
        if subgoal.id.trim().is_empty() {
            errors.push("subgoal id must not be empty".to_string());
        }
    }

    let pending: Vec<&str> = plan
        .subgoals()
        .iter()
        .filter(|subgoal| subgoal.status == SubgoalStatus::Pending)
        .map(|subgoal| subgoal.id.as_str())
        .collect();
    if pending.len() > 1 {
        errors.push(format!(
            "at most one subgoal may be pending, found [{}]",
            pending.join(", ")
        ));
    }

    for subgoal in plan.retired() {
        if subgoal.status != SubgoalStatus::Failure {
            errors.push(format!(
                "retired subgoal '{}' has status {}, expected failure",
                subgoal.id, subgoal.status
            ));
        }
    }

    errors
}
