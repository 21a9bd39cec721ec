//! Slot-level patch computation and application.
//!
//! Patches are RFC-6902-shaped but fixed to the 8-slot domain: every `path`
//! is `/slots/<N>` with `N` in `0..=7`. Computation walks the slots in order
//! and categorizes each as add, remove, or replace based on presence and the
//! per-artifact fingerprint. Application replays a patch for idempotent
//! catch-up during replay; any unrecognized path fails the whole apply.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Artifact, Workspace, WorkspaceError, SLOT_COUNT};

/// One patch operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchOp {
    /// `"add"`, `"replace"`, or `"remove"`.
    pub op: String,
    /// Slot path, `/slots/<N>`.
    pub path: String,
    /// The new artifact for add/replace; absent for remove.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Artifact>,
}

/// Computes the slot-level diff from `from` to `to`.
#[must_use]
pub fn compute_patch(from: &Workspace, to: &Workspace) -> Vec<PatchOp> {
    let mut ops = Vec::new();
    for slot in 0..SLOT_COUNT {
        let before = from.get(slot);
        let after = to.get(slot);
        match (before, after) {
            (None, Some(a)) => ops.push(PatchOp {
                op: "add".to_string(),
                path: format!("/slots/{slot}"),
                value: Some(a.clone()),
            }),
            (Some(_), None) => ops.push(PatchOp {
                op: "remove".to_string(),
                path: format!("/slots/{slot}"),
                value: None,
            }),
            (Some(b), Some(a)) => {
                if b.fingerprint() != a.fingerprint() {
                    ops.push(PatchOp {
                        op: "replace".to_string(),
                        path: format!("/slots/{slot}"),
                        value: Some(a.clone()),
                    });
                }
            }
            (None, None) => {}
        }
    }
    ops
}

/// Applies a patch JSON document to `target` in order.
///
/// # Errors
///
/// - [`WorkspaceError::PatchNotArray`] when the document is not an array
/// - [`WorkspaceError::InvalidPatchPath`] for any path outside `/slots/0..7`
/// - [`WorkspaceError::InvalidPatchOp`] for unknown ops or an add/replace
///   without a value
///
/// The target is only mutated when the whole document validates; a failed
/// apply leaves it untouched.
pub fn apply_patch(target: &mut Workspace, patch_json: &str) -> Result<(), WorkspaceError> {
    let doc: Value = serde_json::from_str(patch_json).map_err(|e| WorkspaceError::InvalidPatchOp {
        index: 0,
        reason: format!("patch is not valid JSON: {e}"),
    })?;
    let arr = doc.as_array().ok_or(WorkspaceError::PatchNotArray)?;

    // Validate fully before mutating so a bad tail cannot leave the target
    // half-patched.
    enum Staged {
        Set(u8, Artifact),
        Remove(u8),
    }
    let mut staged: Vec<Staged> = Vec::with_capacity(arr.len());
    for (index, entry) in arr.iter().enumerate() {
        let op: PatchOp =
            serde_json::from_value(entry.clone()).map_err(|e| WorkspaceError::InvalidPatchOp {
                index,
                reason: e.to_string(),
            })?;
        let slot = parse_slot_path(&op.path)?;
        match op.op.as_str() {
            "add" | "replace" => {
                let value = op.value.ok_or_else(|| WorkspaceError::InvalidPatchOp {
                    index,
                    reason: "add/replace without value".to_string(),
                })?;
                staged.push(Staged::Set(slot, value));
            }
            "remove" => staged.push(Staged::Remove(slot)),
            other => {
                return Err(WorkspaceError::InvalidPatchOp {
                    index,
                    reason: format!("unknown op: {other}"),
                })
            }
        }
    }

    for entry in staged {
        match entry {
            Staged::Set(slot, value) => {
                target.slots.insert(slot, value);
            }
            Staged::Remove(slot) => {
                target.slots.remove(&slot);
            }
        }
    }
    Ok(())
}

fn parse_slot_path(path: &str) -> Result<u8, WorkspaceError> {
    let invalid = || WorkspaceError::InvalidPatchPath {
        path: path.to_string(),
    };
    let rest = path.strip_prefix("/slots/").ok_or_else(invalid)?;
    let slot: u8 = rest.parse().map_err(|_| invalid())?;
    if slot >= SLOT_COUNT {
        return Err(invalid());
    }
    Ok(slot)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(tag: &str) -> Artifact {
        Artifact::new("text", "test", format!("{{\"v\":\"{tag}\"}}"))
    }

    #[test]
    fn compute_categorizes_ops() {
        let mut from = Workspace::new();
        from.put(0, artifact("keep")).unwrap();
        from.put(1, artifact("old")).unwrap();
        from.put(2, artifact("gone")).unwrap();

        let mut to = Workspace::new();
        to.put(0, artifact("keep")).unwrap();
        to.put(1, artifact("new")).unwrap();
        to.put(5, artifact("added")).unwrap();

        let patch = compute_patch(&from, &to);
        let ops: Vec<(&str, &str)> = patch.iter().map(|o| (o.op.as_str(), o.path.as_str())).collect();
        assert_eq!(
            ops,
            vec![
                ("replace", "/slots/1"),
                ("remove", "/slots/2"),
                ("add", "/slots/5"),
            ]
        );
    }

    #[test]
    fn identity_patch_is_empty() {
        let mut w = Workspace::new();
        w.put(0, artifact("x")).unwrap();
        assert!(compute_patch(&w, &w).is_empty());
    }

    #[test]
    fn apply_round_trips_compute() {
        let mut from = Workspace::new();
        from.put(1, artifact("a")).unwrap();
        from.put(6, artifact("b")).unwrap();

        let mut to = Workspace::new();
        to.put(1, artifact("a2")).unwrap();
        to.put(3, artifact("c")).unwrap();

        let patch = compute_patch(&from, &to);
        let json = serde_json::to_string(&patch).unwrap();

        let mut replayed = from.clone();
        apply_patch(&mut replayed, &json).unwrap();
        assert_eq!(replayed.digest(), to.digest());
    }

    #[test]
    fn apply_rejects_bad_paths() {
        let mut w = Workspace::new();
        for path in ["/slots/8", "/slots/-1", "/slot/1", "/slots/01x", ""] {
            let json = format!(r#"[{{"op":"remove","path":"{path}"}}]"#);
            let err = apply_patch(&mut w, &json).unwrap_err();
            assert!(
                matches!(err, WorkspaceError::InvalidPatchPath { .. }),
                "path {path:?} gave {err:?}"
            );
        }
    }

    #[test]
    fn apply_is_atomic_on_bad_tail() {
        let mut w = Workspace::new();
        let good = serde_json::to_string(&PatchOp {
            op: "add".to_string(),
            path: "/slots/0".to_string(),
            value: Some(artifact("x")),
        })
        .unwrap();
        let json = format!(r#"[{good},{{"op":"remove","path":"/slots/9"}}]"#);
        assert!(apply_patch(&mut w, &json).is_err());
        assert!(!w.has(0), "failed apply must not mutate the target");
    }

    #[test]
    fn apply_rejects_non_array() {
        let mut w = Workspace::new();
        assert!(matches!(
            apply_patch(&mut w, r#"{"op":"add"}"#),
            Err(WorkspaceError::PatchNotArray)
        ));
    }
}
