//! # machina-core
//!
//! Core library for machina - an agentic task runner that executes runs by
//! iteratively selecting and invoking tools against a transactional 8-slot
//! workspace until a declared goal is satisfied.
//!
//! ## Features
//!
//! - **Workspace**: slot-based artifact store with copy-on-write transactions
//!   and computed slot-level patches
//! - **Journal**: tamper-evident hash-chained JSONL event log with canonical
//!   serialization
//! - **Durable queue**: crash-recoverable file-backed priority queue with a
//!   framed, checksummed write-ahead log
//! - **Selector pipeline**: heuristic, centroid, and external-policy
//!   selectors with mode-dependent blending and a circuit breaker
//! - **Tool executor**: in-process dispatch plus out-of-process isolation via
//!   a long-lived toolhost subprocess pool with delta-encoded state
//! - **Genesis**: self-extension pipeline (write source, compile to a shared
//!   object, hash-verify, load)
//!
//! ## Example
//!
//! ```rust,no_run
//! use machina_core::run::RunRequest;
//! use machina_core::selector::ControlMode;
//!
//! let request = RunRequest {
//!     goal_id: "goal.ERROR_SCAN.v1".to_string(),
//!     candidate_tags: vec!["tag.error".to_string()],
//!     inputs_json: r#"{"input_path":"samples/log.csv"}"#.to_string(),
//!     control_mode: ControlMode::FallbackOnly,
//!     ..RunRequest::default()
//! };
//! # let _ = request;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod canonical;
pub mod executor;
pub mod genesis;
pub mod hash;
pub mod journal;
pub mod menu;
pub mod process;
pub mod queue;
pub mod registry;
pub mod run;
pub mod selector;
pub mod types;
pub mod wal;
pub mod workspace;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::executor::{Runner, ToolResult};
    pub use crate::journal::Journal;
    pub use crate::registry::{Registry, ToolDesc};
    pub use crate::run::{GoalDesc, GoalRegistry, RunRequest, StepLoop};
    pub use crate::selector::{ControlMode, Selection, Selector};
    pub use crate::types::{Budget, RunHeader, Sid, StepStatus};
    pub use crate::workspace::{Artifact, Tx, Workspace};
}

pub use registry::{Registry, ToolDesc};
pub use types::{Budget, RunHeader, Sid, StepStatus};
pub use workspace::{Artifact, Tx, Workspace};
