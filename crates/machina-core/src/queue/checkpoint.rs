//! Queue checkpoint: a periodic snapshot of in-memory scheduling state.
//!
//! After a checkpoint is written atomically, the WAL is truncated; recovery
//! loads the checkpoint first and then replays whatever the WAL accumulated
//! since. An unreadable or wrong-version checkpoint is skipped (recovery
//! falls back to the directory scan) rather than treated as fatal.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{write_atomic, QueueError};

/// One scheduled retry inside a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRetryEntry {
    /// Epoch milliseconds when the retry becomes due.
    pub due_ms: i64,
    /// The retry filename (`retry_<due_ms>_<original>`).
    pub name: String,
}

/// On-disk checkpoint document, version 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Schema version; only `1` is recognized.
    pub version: u32,
    /// Wall-clock creation time.
    pub created_ms: i64,
    /// Inbox filenames known to the in-memory queue.
    pub inbox: Vec<String>,
    /// Scheduled retries.
    pub retry: Vec<CheckpointRetryEntry>,
}

impl Checkpoint {
    /// Builds a version-1 checkpoint stamped with the current time.
    #[must_use]
    pub fn new(inbox: Vec<String>, retry: Vec<CheckpointRetryEntry>) -> Self {
        Self {
            version: 1,
            created_ms: crate::types::now_ms(),
            inbox,
            retry,
        }
    }

    /// Writes the checkpoint atomically (staging dir + rename).
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] on serialization or write failure.
    pub fn write(&self, tmp_dir: &Path, dst: &Path) -> Result<(), QueueError> {
        let body = serde_json::to_string(self).map_err(|e| QueueError::AtomicWrite {
            path: dst.to_path_buf(),
            reason: e.to_string(),
        })?;
        write_atomic(tmp_dir, dst, &body)
    }

    /// Loads a checkpoint; `None` for a missing, unreadable, or
    /// wrong-version file.
    #[must_use]
    pub fn load(path: &Path) -> Option<Self> {
        let text = std::fs::read_to_string(path).ok()?;
        let ckpt: Self = serde_json::from_str(&text).ok()?;
        (ckpt.version == 1).then_some(ckpt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("wal/checkpoint.json");
        let ckpt = Checkpoint::new(
            vec!["p0001_rq_1_aa.json".to_string()],
            vec![CheckpointRetryEntry {
                due_ms: 12345,
                name: "retry_12345_p0001_rq_1_aa.json".to_string(),
            }],
        );
        ckpt.write(&dir.path().join("tmp"), &dst).unwrap();

        let loaded = Checkpoint::load(&dst).unwrap();
        assert_eq!(loaded, ckpt);
    }

    #[test]
    fn missing_or_bad_checkpoint_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Checkpoint::load(&dir.path().join("nope.json")).is_none());

        let garbage = dir.path().join("bad.json");
        std::fs::write(&garbage, "{not json").unwrap();
        assert!(Checkpoint::load(&garbage).is_none());

        let wrong_version = dir.path().join("v2.json");
        std::fs::write(
            &wrong_version,
            r#"{"version":2,"created_ms":1,"inbox":[],"retry":[]}"#,
        )
        .unwrap();
        assert!(Checkpoint::load(&wrong_version).is_none());
    }
}
