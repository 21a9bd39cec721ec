//! Selector pipeline: how a run decides which tool to invoke next.
//!
//! Three [`Selector`] implementations share one interface:
//!
//! - [`HeuristicSelector`] - deterministic tier-0 rules over state flags
//! - [`CentroidSelector`] - embedding dot-product ranking with caches
//! - [`PolicySelector`] - an external policy subprocess wrapping a fallback,
//!   guarded by a circuit breaker
//!
//! Within a step the loop computes a *fallback* selection and a *policy*
//! selection against the same menu, journals both raw outputs, then combines
//! them per the run's [`ControlMode`] via [`blend`].

mod centroid;
mod embedding;
mod heuristic;
mod output;
mod policy;


use serde::{Deserialize, Serialize};

pub use centroid::CentroidSelector;
pub use embedding::{hash_embedding, l2_normalize, EmbeddingProvider, HashEmbedding};
pub use heuristic::HeuristicSelector;
pub use output::{format_selection, parse_selector_output, pick_wire};
pub use policy::{PolicyConfig, PolicySelector};

use crate::menu::Menu;
use crate::types::Sid;

/// Selector blending policy for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMode {
    /// Use the fallback selector only; the policy is not invoked.
    FallbackOnly,
    /// Use the fallback; still compute and journal the policy selection for
    /// offline evaluation.
    ShadowPolicy,
    /// Use the policy unless it is invalid (or circuit-broken), then the
    /// fallback.
    Blended,
    /// Use the policy selection.
    PolicyOnly,
}

impl ControlMode {
    /// Wire name, e.g. `"FALLBACK_ONLY"`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FallbackOnly => "FALLBACK_ONLY",
            Self::ShadowPolicy => "SHADOW_POLICY",
            Self::Blended => "BLENDED",
            Self::PolicyOnly => "POLICY_ONLY",
        }
    }

    /// Parses a wire name; unknown strings default to `FallbackOnly`.
    #[must_use]
    pub fn from_wire(s: &str) -> Self {
        match s {
            "SHADOW_POLICY" => Self::ShadowPolicy,
            "BLENDED" => Self::Blended,
            "POLICY_ONLY" => Self::PolicyOnly,
            _ => Self::FallbackOnly,
        }
    }
}

impl Default for ControlMode {
    fn default() -> Self {
        Self::FallbackOnly
    }
}

/// What a selector decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionKind {
    /// Invoke the tool bound to `sid`, optionally patching the run inputs.
    Pick {
        /// The menu entry to invoke.
        sid: Sid,
        /// Optional JSON object merged into the run inputs (subject to the
        /// reserved-prefix block list).
        input_patch: Option<String>,
    },
    /// Ask the supervisor for help and stop.
    AskSup,
    /// Do nothing and stop.
    Noop,
    /// The output was unusable.
    Invalid,
}

/// A selector's decision plus the raw text it produced (journaled verbatim).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    /// The parsed decision.
    pub kind: SelectionKind,
    /// Raw selector output, or a failure annotation.
    pub raw: String,
}

impl Selection {
    /// An invalid selection with `reason` as the raw text.
    #[must_use]
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self {
            kind: SelectionKind::Invalid,
            raw: reason.into(),
        }
    }

    /// The picked SID, when this is a pick.
    #[must_use]
    pub fn sid(&self) -> Option<Sid> {
        match &self.kind {
            SelectionKind::Pick { sid, .. } => Some(*sid),
            _ => None,
        }
    }
}

/// The selector interface.
///
/// `goal_context` carries the goal id, state flags, and effective tags in a
/// compact string; `state_digest` is the workspace crypto digest;
/// `inputs_json` the current run inputs.
pub trait Selector: Send {
    /// Decides on a menu entry (or NOOP/ASK_SUP/INVALID).
    fn select(
        &mut self,
        menu: &Menu,
        goal_context: &str,
        state_digest: &str,
        mode: ControlMode,
        inputs_json: &str,
    ) -> Selection;
}

/// Combines the fallback and policy selections per the run mode.
#[must_use]
pub fn blend(mode: ControlMode, fallback: Selection, policy: Selection) -> Selection {
    match mode {
        ControlMode::PolicyOnly => policy,
        ControlMode::Blended => {
            if policy.kind == SelectionKind::Invalid {
                fallback
            } else {
                policy
            }
        }
        ControlMode::ShadowPolicy | ControlMode::FallbackOnly => fallback,
    }
}
