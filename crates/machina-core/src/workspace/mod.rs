//! The slot-based workspace (DS) and its transaction.
//!
//! A workspace maps a fixed slot index in `0..=7` to an [`Artifact`]. Slots
//! are sparse; absence is normal and meaningful (goal completion is a
//! predicate over slot presence). Artifacts are immutable once stored -
//! replacing a slot substitutes the whole artifact.
//!
//! Two digests cover the same canonical serialization:
//!
//! - [`Workspace::digest_fast`] - FNV-1a 64, for loop detection
//! - [`Workspace::digest`] - SHA-256, for tamper-evident journaling
//!
//! The canonical serialization includes a content hash per slot; omitting it
//! would allow silent content mutation undetected by the digests.

mod delta;
mod patch;
mod tx;


use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use delta::WorkspaceDelta;
pub use patch::{apply_patch, compute_patch};
pub use tx::Tx;

/// Number of slots in a workspace.
pub const SLOT_COUNT: u8 = 8;

/// Errors from workspace operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum WorkspaceError {
    /// A slot index outside `0..=7`.
    #[error("slot index out of range: {index}")]
    SlotOutOfRange {
        /// The offending index.
        index: u64,
    },

    /// A patch operation with an unrecognized `op` or malformed shape.
    #[error("invalid patch operation at index {index}: {reason}")]
    InvalidPatchOp {
        /// Position of the operation within the patch array.
        index: usize,
        /// Why the operation was rejected.
        reason: String,
    },

    /// A patch `path` that is not `/slots/<N>` with `N` in `0..=7`.
    #[error("invalid patch path: {path}")]
    InvalidPatchPath {
        /// The offending path.
        path: String,
    },

    /// The patch document was not a JSON array.
    #[error("patch is not a JSON array")]
    PatchNotArray,
}

/// A typed opaque payload held in a workspace slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Artifact type, e.g. `"table"`, `"text"`, `"genesis_stage"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Origin tag or hash.
    pub provenance: String,
    /// Opaque JSON text payload.
    pub content_json: String,
    /// Payload size in bytes.
    pub size_bytes: u64,
}

impl Artifact {
    /// Builds an artifact whose `size_bytes` tracks the payload length.
    #[must_use]
    pub fn new(kind: impl Into<String>, provenance: impl Into<String>, content_json: impl Into<String>) -> Self {
        let content_json = content_json.into();
        Self {
            kind: kind.into(),
            provenance: provenance.into(),
            size_bytes: content_json.len() as u64,
            content_json,
        }
    }

    /// Stable per-artifact fingerprint used by patch computation.
    ///
    /// Covers the full content so that content-only mutations change the
    /// fingerprint.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let s = format!(
            "{}|{}|{}|{}",
            self.kind, self.provenance, self.size_bytes, self.content_json
        );
        crate::hash::sha256_hex(s.as_bytes())
    }
}

/// The 8-slot artifact store.
///
/// Backed by a `BTreeMap` so iteration is already in slot order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    /// Occupied slots, keyed by index in `0..=7`.
    #[serde(default)]
    pub slots: BTreeMap<u8, Artifact>,
}

impl Workspace {
    /// Creates an empty workspace.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the artifact in `slot`, if present.
    #[must_use]
    pub fn get(&self, slot: u8) -> Option<&Artifact> {
        self.slots.get(&slot)
    }

    /// Whether `slot` is occupied.
    #[must_use]
    pub fn has(&self, slot: u8) -> bool {
        self.slots.contains_key(&slot)
    }

    /// Stores `artifact` into `slot`, replacing any previous occupant.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError::SlotOutOfRange`] for indices above 7.
    pub fn put(&mut self, slot: u8, artifact: Artifact) -> Result<(), WorkspaceError> {
        if slot >= SLOT_COUNT {
            return Err(WorkspaceError::SlotOutOfRange {
                index: u64::from(slot),
            });
        }
        self.slots.insert(slot, artifact);
        Ok(())
    }

    /// Clears `slot`, returning the removed artifact if any.
    pub fn remove(&mut self, slot: u8) -> Option<Artifact> {
        self.slots.remove(&slot)
    }

    // Canonical byte serialization underlying both digests. Slots in index
    // order; each contributes index, type, provenance, size, and a content
    // hash.
    fn canonical_slot_string(&self) -> String {
        use std::fmt::Write as _;
        let mut out = String::new();
        for (slot, artifact) in &self.slots {
            let content_sha = crate::hash::sha256_hex(artifact.content_json.as_bytes());
            let _ = write!(
                out,
                "{}:{}:{}:{}:{}|",
                slot, artifact.kind, artifact.provenance, artifact.size_bytes, content_sha
            );
        }
        out
    }

    /// Fast 64-bit digest (FNV-1a) for loop detection. Pure; no I/O.
    #[must_use]
    pub fn digest_fast(&self) -> String {
        crate::hash::hex64(crate::hash::fnv1a64(self.canonical_slot_string().as_bytes()))
    }

    /// Cryptographic digest (SHA-256) for journaling. Pure; no I/O.
    #[must_use]
    pub fn digest(&self) -> String {
        crate::hash::sha256_hex(self.canonical_slot_string().as_bytes())
    }
}
