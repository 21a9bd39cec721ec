//! Tool execution: in-process dispatch and out-of-process isolation.
//!
//! The in-proc path is a name-to-function map: [`Runner::run`] looks up the
//! registered [`ToolFn`] and invokes it against the transaction's mutable
//! workspace. A missing AID returns `TOOL_ERROR` with the exact error prefix
//! `MISSING_TOOL: ` - the step loop keys its Genesis auto-repair path off
//! that prefix.
//!
//! Out-of-proc tools are ordinary registered functions whose body forwards
//! through a [`SessionPool`](session::SessionPool) to a long-lived toolhost
//! child; see [`session`] and [`toolhost`]. Which tools run isolated is
//! decided by a pluggable [`IsolationPolicy`] rather than a hard-coded AID
//! set.

pub mod idempotency;
pub mod lease;
pub mod session;
pub mod toolhost;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

pub use idempotency::IdempotencyCache;
pub use lease::{classify_tool_tier, LeaseManager, LeaseToken, ToolTier};
pub use session::{SessionPool, ToolhostConfig};
pub use toolhost::ToolhostServer;

use crate::registry::ToolDesc;
use crate::types::{Aid, StepStatus};
use crate::workspace::Workspace;

/// Error prefix distinguishing an unregistered tool from a tool failure.
pub const MISSING_TOOL_PREFIX: &str = "MISSING_TOOL: ";

/// Result of one tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolResult {
    /// Invocation status.
    pub status: StepStatus,
    /// Tool output JSON (informational; workspace mutations are the real
    /// product).
    pub output_json: String,
    /// Error text for non-OK statuses.
    pub error: String,
}

impl ToolResult {
    /// A successful result with output.
    #[must_use]
    pub fn ok(output_json: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Ok,
            output_json: output_json.into(),
            error: String::new(),
        }
    }

    /// A tool error with an empty output object.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: StepStatus::ToolError,
            output_json: "{}".to_string(),
            error: message.into(),
        }
    }

    /// Whether this is the missing-tool error, and for which AID.
    #[must_use]
    pub fn missing_tool_aid(&self) -> Option<&str> {
        (self.status == StepStatus::ToolError)
            .then(|| self.error.strip_prefix(MISSING_TOOL_PREFIX))
            .flatten()
    }
}

/// A tool implementation: inputs JSON in, mutations against the transaction
/// workspace, result out.
pub type ToolFn = Arc<dyn Fn(&str, &mut Workspace) -> ToolResult + Send + Sync>;

/// In-process tool dispatcher.
///
/// Read-mostly like the registry: lookups per step, writes only on plugin
/// load.
#[derive(Default)]
pub struct Runner {
    fns: RwLock<HashMap<String, ToolFn>>,
}

impl Runner {
    /// Creates an empty runner.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the implementation for `aid`.
    pub fn register(&self, aid: impl Into<Aid>, f: ToolFn) {
        self.fns.write().expect("runner lock").insert(aid.into(), f);
    }

    /// Whether an implementation is registered for `aid`.
    #[must_use]
    pub fn has(&self, aid: &str) -> bool {
        self.fns.read().expect("runner lock").contains_key(aid)
    }

    /// Invokes `aid` against `workspace`.
    ///
    /// An unregistered AID yields `TOOL_ERROR` with the
    /// [`MISSING_TOOL_PREFIX`] error rather than a panic or an `Err`: the
    /// step loop treats it as a repairable condition.
    pub fn run(&self, aid: &str, input_json: &str, workspace: &mut Workspace) -> ToolResult {
        let f = {
            let fns = self.fns.read().expect("runner lock");
            fns.get(aid).cloned()
        };
        match f {
            Some(f) => f(input_json, workspace),
            None => ToolResult::error(format!("{MISSING_TOOL_PREFIX}{aid}")),
        }
    }
}

/// Decides which tools run out-of-process.
pub trait IsolationPolicy: Send + Sync {
    /// Whether `desc` should be routed through a toolhost pool.
    fn should_isolate(&self, desc: &ToolDesc) -> bool;
}

/// Default policy: isolate everything above [`ToolTier::Safe`].
#[derive(Debug, Default, Clone, Copy)]
pub struct TierIsolation;

impl IsolationPolicy for TierIsolation {
    fn should_isolate(&self, desc: &ToolDesc) -> bool {
        classify_tool_tier(&desc.aid, &desc.side_effects) > ToolTier::Safe
    }
}
