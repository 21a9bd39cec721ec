//! Goal descriptors and the completion predicate.
//!
//! A goal names the workspace slots whose presence means "done": all of
//! them (AND) or any one (OR). Lookup is exact on `goal_id` with a
//! longest-prefix fallback, so `goal.GENESIS_DEMO_HELLO.v1` resolves to a
//! registered `goal.GENESIS` when no exact entry exists.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::workspace::Workspace;

/// Errors from goal registration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum GoalError {
    /// A second registration for a goal id without override.
    #[error("duplicate goal_id: {goal_id}")]
    DuplicateGoal {
        /// The already-registered id.
        goal_id: String,
    },
}

/// One goal's completion contract.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoalDesc {
    /// Goal id, e.g. `goal.ERROR_SCAN.v1`.
    pub goal_id: String,
    /// Base tags seeding menu assembly for this goal.
    #[serde(default)]
    pub candidate_tags: Vec<String>,
    /// Slots whose presence satisfies the goal.
    #[serde(default)]
    pub required_slots: Vec<u8>,
    /// OR semantics over `required_slots` instead of AND.
    #[serde(default)]
    pub any_slot_sufficient: bool,
}

/// Registry of goals with prefix fallback.
#[derive(Debug, Default)]
pub struct GoalRegistry {
    goals: HashMap<String, GoalDesc>,
}

impl GoalRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a goal.
    ///
    /// # Errors
    ///
    /// Returns [`GoalError::DuplicateGoal`] for a repeat id without
    /// override. Goals with an empty id are ignored.
    pub fn register(&mut self, desc: GoalDesc, allow_override: bool) -> Result<(), GoalError> {
        if desc.goal_id.is_empty() {
            return Ok(());
        }
        if !allow_override && self.goals.contains_key(&desc.goal_id) {
            return Err(GoalError::DuplicateGoal {
                goal_id: desc.goal_id,
            });
        }
        self.goals.insert(desc.goal_id.clone(), desc);
        Ok(())
    }

    /// Exact lookup.
    #[must_use]
    pub fn get(&self, goal_id: &str) -> Option<&GoalDesc> {
        self.goals.get(goal_id)
    }

    /// Exact lookup with longest-prefix fallback.
    #[must_use]
    pub fn resolve(&self, goal_id: &str) -> Option<&GoalDesc> {
        if let Some(desc) = self.goals.get(goal_id) {
            return Some(desc);
        }
        self.goals
            .iter()
            .filter(|(key, _)| goal_id.starts_with(key.as_str()))
            .max_by_key(|(key, _)| key.len())
            .map(|(_, desc)| desc)
    }

    /// Whether `goal_id` is satisfied by `state`.
    ///
    /// Unknown goals and goals with no required slots are never complete.
    #[must_use]
    pub fn is_complete(&self, goal_id: &str, state: &Workspace) -> bool {
        let Some(desc) = self.resolve(goal_id) else {
            return false;
        };
        if desc.required_slots.is_empty() {
            return false;
        }
        if desc.any_slot_sufficient {
            desc.required_slots.iter().any(|slot| state.has(*slot))
        } else {
            desc.required_slots.iter().all(|slot| state.has(*slot))
        }
    }

    /// All registered goal ids, sorted.
    #[must_use]
    pub fn all_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.goals.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::Artifact;

    fn goal(id: &str, slots: &[u8], any: bool) -> GoalDesc {
        GoalDesc {
            goal_id: id.to_string(),
            candidate_tags: Vec::new(),
            required_slots: slots.to_vec(),
            any_slot_sufficient: any,
        }
    }

    fn state_with(slots: &[u8]) -> Workspace {
        let mut ws = Workspace::new();
        for s in slots {
            ws.put(*s, Artifact::new("text", "test", "{}")).unwrap();
        }
        ws
    }

    #[test]
    fn and_or_semantics() {
        let mut reg = GoalRegistry::new();
        reg.register(goal("goal.BOTH.v1", &[0, 2], false), false).unwrap();
        reg.register(goal("goal.EITHER.v1", &[0, 2], true), false).unwrap();

        assert!(!reg.is_complete("goal.BOTH.v1", &state_with(&[0])));
        assert!(reg.is_complete("goal.BOTH.v1", &state_with(&[0, 2])));
        assert!(reg.is_complete("goal.EITHER.v1", &state_with(&[2])));
        assert!(!reg.is_complete("goal.EITHER.v1", &state_with(&[1])));
    }

    #[test]
    fn prefix_fallback_longest_wins() {
        let mut reg = GoalRegistry::new();
        reg.register(goal("goal.GENESIS", &[0, 7], false), false).unwrap();
        reg.register(goal("goal.GENESIS_DEMO", &[0], false), false).unwrap();

        // Exact match absent: the longest registered prefix applies.
        let resolved = reg.resolve("goal.GENESIS_DEMO_HELLO.v1").unwrap();
        assert_eq!(resolved.goal_id, "goal.GENESIS_DEMO");
        assert!(reg.is_complete("goal.GENESIS_DEMO_HELLO.v1", &state_with(&[0])));

        // An exact registration takes precedence over prefixes.
        reg.register(goal("goal.GENESIS_DEMO_HELLO.v1", &[5], false), false)
            .unwrap();
        assert_eq!(
            reg.resolve("goal.GENESIS_DEMO_HELLO.v1").unwrap().goal_id,
            "goal.GENESIS_DEMO_HELLO.v1"
        );
    }

    #[test]
    fn unknown_or_slotless_goals_never_complete() {
        let mut reg = GoalRegistry::new();
        reg.register(goal("goal.EMPTY.v1", &[], false), false).unwrap();
        assert!(!reg.is_complete("goal.EMPTY.v1", &state_with(&[0, 1, 2])));
        assert!(!reg.is_complete("goal.UNKNOWN.v1", &state_with(&[0])));
    }

    #[test]
    fn duplicate_registration() {
        let mut reg = GoalRegistry::new();
        reg.register(goal("goal.X.v1", &[0], false), false).unwrap();
        assert!(matches!(
            reg.register(goal("goal.X.v1", &[1], false), false),
            Err(GoalError::DuplicateGoal { .. })
        ));
        reg.register(goal("goal.X.v1", &[1], false), true).unwrap();
        assert_eq!(reg.get("goal.X.v1").unwrap().required_slots, vec![1]);
    }
}
