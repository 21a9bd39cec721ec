//! Replay-input fences.
//!
//! A deterministic tool with side effects names the external inputs a
//! strict replayer must fingerprint to confirm determinism. The step loop
//! computes those fingerprints at invocation time and journals them next to
//! the tool result.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::registry::ToolDesc;

/// Resolves a possibly-relative input path the way the original request
/// would have: request dir first, then the workspace root.
fn resolve_for_replay(input_path: &str, request_dir: &Path, root: &Path) -> PathBuf {
    let p = Path::new(input_path);
    if p.is_absolute() {
        return p.to_path_buf();
    }
    let in_request = request_dir.join(p);
    if in_request.exists() {
        return in_request;
    }
    let in_root = root.join(p);
    if in_root.exists() {
        return in_root;
    }
    in_request
}

fn path_fingerprint(inputs: &serde_json::Value, key: &str, request_dir: &Path, root: &Path) -> String {
    let Some(path) = inputs[key].as_str().filter(|s| !s.is_empty()) else {
        return format!("missing:{key}");
    };
    let resolved = resolve_for_replay(path, request_dir, root);
    crate::hash::fingerprint_file(&resolved).unwrap_or_else(|_| "unavailable:fingerprint".to_string())
}

/// Computes the fence map for one tool invocation. Unknown fence keys map
/// to `unhandled:<key>` so a replayer can distinguish "not computed" from
/// "missing input".
#[must_use]
pub fn compute_replay_inputs(
    desc: &ToolDesc,
    inputs_json: &str,
    request_dir: &Path,
    root: &Path,
) -> BTreeMap<String, String> {
    let inputs: serde_json::Value =
        serde_json::from_str(inputs_json).unwrap_or(serde_json::Value::Null);

    let mut out = BTreeMap::new();
    for key in &desc.replay_inputs {
        let value = match key.as_str() {
            "input_path_fingerprint" => path_fingerprint(&inputs, "input_path", request_dir, root),
            "path_fingerprint" => path_fingerprint(&inputs, "path", request_dir, root),
            "gpu_signature" => gpu_signature(),
            other => format!("unhandled:{other}"),
        };
        out.insert(key.clone(), value);
    }
    out
}

// No GPU probing in the core; the signature records that explicitly so a
// strict replayer treats the fence as unsatisfiable rather than matching.
fn gpu_signature() -> String {
    "none|avail=0|count=0|idx=-1".to_string()
}

/// Renders the fence map as a JSON object for journaling.
#[must_use]
pub fn replay_inputs_json(map: &BTreeMap<String, String>) -> String {
    serde_json::to_string(map).unwrap_or_else(|_| "{}".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc_with_fences(fences: &[&str]) -> ToolDesc {
        ToolDesc {
            aid: "AID.SCAN.v1".to_string(),
            name: "scan".to_string(),
            deterministic: true,
            tags: vec![],
            side_effects: vec!["file_read".to_string()],
            replay_inputs: fences.iter().map(ToString::to_string).collect(),
        }
    }

    #[test]
    fn fingerprints_existing_input_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("log.csv"), "a,b\n1,2\n").unwrap();

        let fences = compute_replay_inputs(
            &desc_with_fences(&["input_path_fingerprint"]),
            r#"{"input_path":"log.csv"}"#,
            dir.path(),
            dir.path(),
        );
        let fp = &fences["input_path_fingerprint"];
        assert!(fp.starts_with("fnv1a64:"), "{fp}");

        // Same content, same fence.
        let again = compute_replay_inputs(
            &desc_with_fences(&["input_path_fingerprint"]),
            r#"{"input_path":"log.csv"}"#,
            dir.path(),
            dir.path(),
        );
        assert_eq!(&again["input_path_fingerprint"], fp);
    }

    #[test]
    fn missing_and_unavailable_inputs_are_marked() {
        let dir = tempfile::tempdir().unwrap();
        let fences = compute_replay_inputs(
            &desc_with_fences(&["input_path_fingerprint", "path_fingerprint"]),
            r#"{"input_path":"nope.csv"}"#,
            dir.path(),
            dir.path(),
        );
        assert_eq!(fences["input_path_fingerprint"], "unavailable:fingerprint");
        assert_eq!(fences["path_fingerprint"], "missing:path");
    }

    #[test]
    fn unknown_fence_keys_are_unhandled() {
        let dir = tempfile::tempdir().unwrap();
        let fences = compute_replay_inputs(
            &desc_with_fences(&["custom_fence"]),
            "{}",
            dir.path(),
            dir.path(),
        );
        assert_eq!(fences["custom_fence"], "unhandled:custom_fence");
    }

    #[test]
    fn gpu_signature_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let fences = compute_replay_inputs(
            &desc_with_fences(&["gpu_signature"]),
            "{}",
            dir.path(),
            dir.path(),
        );
        assert_eq!(fences["gpu_signature"], "none|avail=0|count=0|idx=-1");
    }
}
