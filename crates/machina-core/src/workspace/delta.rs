//! Delta encoding of workspace state for the toolhost wire protocol.
//!
//! A toolhost session tracks a `base_workspace` snapshot; requests and
//! responses carry only the slots that changed relative to it plus a list of
//! removed slot indices. A full workspace object (no `delta` flag) replaces
//! the receiver's state wholesale, which keeps cold-start and the
//! fork-per-request fallback on the same code path.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{Artifact, Workspace};

/// Wire form of workspace state: either a delta against a shared base or a
/// full snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceDelta {
    /// True for delta encoding; false/absent means `slots` is the full state.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub delta: bool,
    /// Changed (or, for full snapshots, all) slots.
    #[serde(default)]
    pub slots: BTreeMap<u8, Artifact>,
    /// Slots removed since the base; only meaningful when `delta` is true.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed_slots: Vec<u8>,
}

impl WorkspaceDelta {
    /// Encodes `current` as a delta against `base`.
    #[must_use]
    pub fn encode(current: &Workspace, base: &Workspace) -> Self {
        let mut slots = BTreeMap::new();
        let mut removed_slots = Vec::new();

        for (idx, artifact) in &current.slots {
            match base.get(*idx) {
                Some(prev) if prev.fingerprint() == artifact.fingerprint() => {}
                _ => {
                    slots.insert(*idx, artifact.clone());
                }
            }
        }
        for idx in base.slots.keys() {
            if !current.has(*idx) {
                removed_slots.push(*idx);
            }
        }

        Self {
            delta: true,
            slots,
            removed_slots,
        }
    }

    /// Encodes `current` as a full snapshot.
    #[must_use]
    pub fn full(current: &Workspace) -> Self {
        Self {
            delta: false,
            slots: current.slots.clone(),
            removed_slots: Vec::new(),
        }
    }

    /// An empty delta: the receiver's state is unchanged. Returned for
    /// idempotency cache hits.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            delta: true,
            slots: BTreeMap::new(),
            removed_slots: Vec::new(),
        }
    }

    /// True when applying this delta would change nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.delta && self.slots.is_empty() && self.removed_slots.is_empty()
    }

    /// Applies this wire state to `target`: incremental for deltas, wholesale
    /// replacement for full snapshots.
    pub fn apply(&self, target: &mut Workspace) {
        if self.delta {
            for (idx, artifact) in &self.slots {
                target.slots.insert(*idx, artifact.clone());
            }
            for idx in &self.removed_slots {
                target.slots.remove(idx);
            }
        } else {
            target.slots = self.slots.clone();
        }
    }
}
