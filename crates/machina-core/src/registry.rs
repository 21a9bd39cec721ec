//! Tool registry: descriptors, tag queries, and registration validation.
//!
//! The registry is read-mostly: the step loop queries it between tool
//! invocations, and only plugin load paths mutate it. A coarse
//! reader/writer lock is adequate for that pattern; see [`SharedRegistry`].
//!
//! # Registration invariants
//!
//! - `side_effects` must be non-empty; a pure tool declares `["none"]`.
//! - A `deterministic` tool with non-`"none"` side effects must declare at
//!   least one replay-input fence so the strict replayer can fingerprint the
//!   external inputs it depends on.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Aid;

/// Errors from registry operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RegistryError {
    /// A second registration for an AID without override.
    #[error("duplicate aid in registry: {aid}")]
    DuplicateAid {
        /// The already-registered AID.
        aid: String,
    },

    /// A descriptor that fails validation.
    #[error("invalid tool descriptor for {aid}: {reason}")]
    InvalidDesc {
        /// The offending AID.
        aid: String,
        /// Why validation failed.
        reason: String,
    },
}

/// Descriptor of one registered tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDesc {
    /// Stable tool id, e.g. `AID.ERROR_SCAN.v1`.
    pub aid: Aid,
    /// Human-readable name.
    pub name: String,
    /// Whether the tool is deterministic given fenced inputs.
    #[serde(default = "default_deterministic")]
    pub deterministic: bool,
    /// Menu tags, e.g. `tag.error`, `tag.report`.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Normalized side-effect list; `["none"]` for pure tools.
    #[serde(default)]
    pub side_effects: Vec<String>,
    /// Replay-input fence keys for deterministic side-effect tools.
    #[serde(default)]
    pub replay_inputs: Vec<String>,
}

const fn default_deterministic() -> bool {
    true
}

impl ToolDesc {
    /// True when the tool declares no side effects.
    #[must_use]
    pub fn is_pure(&self) -> bool {
        self.side_effects.len() == 1 && self.side_effects[0] == "none"
    }

    fn validate(&self) -> Result<(), RegistryError> {
        if self.aid.is_empty() {
            return Err(RegistryError::InvalidDesc {
                aid: String::new(),
                reason: "empty aid".to_string(),
            });
        }
        if self.side_effects.is_empty() {
            return Err(RegistryError::InvalidDesc {
                aid: self.aid.clone(),
                reason: "side_effects must be non-empty (use [\"none\"] for pure tools)"
                    .to_string(),
            });
        }
        if self.deterministic && !self.is_pure() && self.replay_inputs.is_empty() {
            return Err(RegistryError::InvalidDesc {
                aid: self.aid.clone(),
                reason: "deterministic tool with side effects must declare replay_inputs"
                    .to_string(),
            });
        }
        Ok(())
    }
}

/// Map from AID to descriptor with deterministic tag queries.
#[derive(Debug, Default)]
pub struct Registry {
    tools: HashMap<String, ToolDesc>,
}

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a descriptor.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::DuplicateAid`] when the AID exists and
    ///   `allow_override` is false
    /// - [`RegistryError::InvalidDesc`] when validation fails
    pub fn register(&mut self, desc: ToolDesc, allow_override: bool) -> Result<(), RegistryError> {
        desc.validate()?;
        if !allow_override && self.tools.contains_key(&desc.aid) {
            return Err(RegistryError::DuplicateAid { aid: desc.aid });
        }
        self.tools.insert(desc.aid.clone(), desc);
        Ok(())
    }

    /// Looks up a descriptor by AID.
    #[must_use]
    pub fn get(&self, aid: &str) -> Option<&ToolDesc> {
        self.tools.get(aid)
    }

    /// Tools whose tag list intersects `tags` (UNION semantics: any match
    /// qualifies); an empty query returns all tools. Sorted by AID.
    #[must_use]
    pub fn query_by_tags(&self, tags: &[String]) -> Vec<ToolDesc> {
        let mut out: Vec<ToolDesc> = self
            .tools
            .values()
            .filter(|d| tags.is_empty() || d.tags.iter().any(|t| tags.contains(t)))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.aid.cmp(&b.aid));
        out
    }

    /// All descriptors, sorted by AID.
    #[must_use]
    pub fn all(&self) -> Vec<ToolDesc> {
        self.query_by_tags(&[])
    }

    /// Number of registered tools.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// A registry shared between the step loop (reader) and plugin load paths
/// (infrequent writers).
pub type SharedRegistry = Arc<RwLock<Registry>>;

/// Creates an empty shared registry.
#[must_use]
pub fn shared_registry() -> SharedRegistry {
    Arc::new(RwLock::new(Registry::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(aid: &str, tags: &[&str]) -> ToolDesc {
        ToolDesc {
            aid: aid.to_string(),
            name: aid.to_lowercase(),
            deterministic: true,
            tags: tags.iter().map(ToString::to_string).collect(),
            side_effects: vec!["none".to_string()],
            replay_inputs: Vec::new(),
        }
    }

    #[test]
    fn duplicate_rejected_unless_override() {
        let mut reg = Registry::new();
        reg.register(desc("AID.X.v1", &[]), false).unwrap();
        assert!(matches!(
            reg.register(desc("AID.X.v1", &[]), false),
            Err(RegistryError::DuplicateAid { .. })
        ));
        reg.register(desc("AID.X.v1", &["tag.meta"]), true).unwrap();
        assert_eq!(reg.get("AID.X.v1").unwrap().tags, vec!["tag.meta"]);
    }

    #[test]
    fn query_is_union_and_sorted() {
        let mut reg = Registry::new();
        reg.register(desc("AID.C.v1", &["tag.error"]), false).unwrap();
        reg.register(desc("AID.A.v1", &["tag.fs"]), false).unwrap();
        reg.register(desc("AID.B.v1", &["tag.error", "tag.report"]), false)
            .unwrap();
        reg.register(desc("AID.D.v1", &["tag.net"]), false).unwrap();

        let result = reg.query_by_tags(&["tag.error".to_string(), "tag.fs".to_string()]);
        let aids: Vec<&str> = result.iter().map(|d| d.aid.as_str()).collect();
        assert_eq!(aids, vec!["AID.A.v1", "AID.B.v1", "AID.C.v1"]);
    }

    #[test]
    fn empty_query_returns_all() {
        let mut reg = Registry::new();
        reg.register(desc("AID.B.v1", &["tag.x"]), false).unwrap();
        reg.register(desc("AID.A.v1", &[]), false).unwrap();
        let all = reg.query_by_tags(&[]);
        let aids: Vec<&str> = all.iter().map(|d| d.aid.as_str()).collect();
        assert_eq!(aids, vec!["AID.A.v1", "AID.B.v1"]);
    }

    #[test]
    fn validation_enforces_side_effect_rules() {
        let mut reg = Registry::new();

        let mut no_effects = desc("AID.BAD.v1", &[]);
        no_effects.side_effects.clear();
        assert!(matches!(
            reg.register(no_effects, false),
            Err(RegistryError::InvalidDesc { .. })
        ));

        // Deterministic + side effects + no fences: rejected.
        let mut unfenced = desc("AID.WRITE.v1", &[]);
        unfenced.side_effects = vec!["file_write".to_string()];
        assert!(matches!(
            reg.register(unfenced.clone(), false),
            Err(RegistryError::InvalidDesc { .. })
        ));

        // Declaring a fence fixes it.
        unfenced.replay_inputs = vec!["path_fingerprint".to_string()];
        reg.register(unfenced, false).unwrap();

        // Non-deterministic side-effect tools need no fences.
        let mut nondet = desc("AID.HTTP.v1", &[]);
        nondet.deterministic = false;
        nondet.side_effects = vec!["network".to_string()];
        reg.register(nondet, false).unwrap();
    }
}
