//! Durable file-backed priority queue feeding the step loop.
//!
//! One queue root holds the full lifecycle as directories:
//!
//! ```text
//! inbox/       ready work: p<PPPP>_<tag>_<timestamp>_<random>.json
//! processing/  reserved work: <original>.processing
//! retry/       delayed work: retry_<due_ms>_<original>
//! done/        completed work
//! failed/      (reserved for operator tooling)
//! dlq/         work with exhausted attempts
//! out/         side-car results: <original>.attempt<N>.result.json
//! tmp/         staging for atomic renames
//! wal/         write-ahead log + checkpoint
//! ```
//!
//! Every cross-directory move is a single `rename` so concurrent workers and
//! external producers never observe half-written entries. Retry scheduling
//! is encoded twice - in the filename (`retry_<due_ms>_…`) and in the
//! `_queue` metadata object of the request document - so both a directory
//! scan and a document read can recover the schedule.

mod checkpoint;
mod dedup;
mod memory;
mod runtime;

#[cfg(test)]
mod tests;

use std::path::{Path, PathBuf};

use thiserror::Error;

pub use checkpoint::{Checkpoint, CheckpointRetryEntry};
pub use dedup::DedupCache;
pub use memory::{DelayQueue, PriorityQueue, QueueItem};
pub use runtime::{JobHandler, JobMetric, JobReport, QueueRuntime, RuntimeConfig, RuntimeThreads, ToolTotals};

/// Priority assigned when a filename carries no parseable prefix.
pub const DEFAULT_PRIORITY: i32 = 5000;

/// Errors from queue operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum QueueError {
    /// Filesystem failure.
    #[error("queue I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An atomic write could not be completed.
    #[error("atomic write to {path} failed: {reason}")]
    AtomicWrite {
        /// Destination path.
        path: PathBuf,
        /// Why it failed.
        reason: String,
    },
}

/// The directory set under one queue root.
#[derive(Debug, Clone)]
pub struct QueueDirs {
    /// The queue root.
    pub root: PathBuf,
}

impl QueueDirs {
    /// Binds to `root` and creates every lifecycle directory.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Io`] when a directory cannot be created.
    pub fn ensure(root: impl AsRef<Path>) -> Result<Self, QueueError> {
        let root = root.as_ref().to_path_buf();
        for sub in [
            "inbox",
            "processing",
            "retry",
            "done",
            "failed",
            "dlq",
            "out",
            "tmp",
            "wal",
        ] {
            std::fs::create_dir_all(root.join(sub))?;
        }
        Ok(Self { root })
    }

    /// `inbox/` - ready work.
    #[must_use]
    pub fn inbox(&self) -> PathBuf {
        self.root.join("inbox")
    }
    /// `processing/` - reserved work.
    #[must_use]
    pub fn processing(&self) -> PathBuf {
        self.root.join("processing")
    }
    /// `retry/` - delayed work.
    #[must_use]
    pub fn retry(&self) -> PathBuf {
        self.root.join("retry")
    }
    /// `done/` - completed work.
    #[must_use]
    pub fn done(&self) -> PathBuf {
        self.root.join("done")
    }
    /// `dlq/` - dead-lettered work.
    #[must_use]
    pub fn dlq(&self) -> PathBuf {
        self.root.join("dlq")
    }
    /// `out/` - side-car results.
    #[must_use]
    pub fn out(&self) -> PathBuf {
        self.root.join("out")
    }
    /// `tmp/` - staging for atomic renames.
    #[must_use]
    pub fn tmp(&self) -> PathBuf {
        self.root.join("tmp")
    }
    /// `wal/` - write-ahead log directory.
    #[must_use]
    pub fn wal_dir(&self) -> PathBuf {
        self.root.join("wal")
    }
    /// Active WAL segment path.
    #[must_use]
    pub fn wal_file(&self) -> PathBuf {
        self.wal_dir().join("queue.wal.jsonl")
    }
    /// Checkpoint file path.
    #[must_use]
    pub fn checkpoint_file(&self) -> PathBuf {
        self.wal_dir().join("checkpoint.json")
    }

    /// Writes a request document into `inbox/` via `tmp/` + rename and
    /// returns the final path.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] on write or rename failure.
    pub fn enqueue(&self, priority: i32, tag: &str, body: &str) -> Result<PathBuf, QueueError> {
        let name = inbox_filename(priority, tag);
        let dst = self.inbox().join(&name);
        write_atomic(&self.tmp(), &dst, body)?;
        Ok(dst)
    }

    /// Lists `inbox/` entries sorted by priority then name.
    #[must_use]
    pub fn list_inbox(&self) -> Vec<PathBuf> {
        let mut v: Vec<PathBuf> = read_json_files(&self.inbox());
        v.sort_by(|a, b| {
            let pa = parse_priority(&file_name(a));
            let pb = parse_priority(&file_name(b));
            pa.cmp(&pb).then_with(|| file_name(a).cmp(&file_name(b)))
        });
        v
    }
}

fn read_json_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|e| e == "json") && p.is_file())
        .collect()
}

fn file_name(p: &Path) -> String {
    p.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
}

/// Builds an inbox filename: `p<PPPP>_<tag>_<timestamp>_<random>.json`.
#[must_use]
pub fn inbox_filename(priority: i32, tag: &str) -> String {
    use rand::Rng;
    let priority = priority.clamp(0, 9999);
    let tag: String = tag
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .take(32)
        .collect();
    let tag = if tag.is_empty() { "rq".to_string() } else { tag };
    let random: u32 = rand::thread_rng().gen();
    format!("p{priority:04}_{tag}_{}_{random:08x}.json", crate::types::now_ms())
}

/// Parses the 4-digit priority prefix of an inbox filename; unparseable
/// names get [`DEFAULT_PRIORITY`].
#[must_use]
pub fn parse_priority(fname: &str) -> i32 {
    let bytes = fname.as_bytes();
    if bytes.len() >= 6
        && bytes[0] == b'p'
        && bytes[1..5].iter().all(u8::is_ascii_digit)
        && bytes[5] == b'_'
    {
        fname[1..5].parse().unwrap_or(DEFAULT_PRIORITY)
    } else {
        DEFAULT_PRIORITY
    }
}

/// Builds a retry filename: `retry_<due_ms>_<original>`.
#[must_use]
pub fn retry_filename(due_ms: i64, original: &str) -> String {
    format!("retry_{due_ms}_{original}")
}

/// Parses a retry filename, returning `(due_ms, original)`.
#[must_use]
pub fn parse_retry_name(fname: &str) -> Option<(i64, String)> {
    let rest = fname.strip_prefix("retry_")?;
    let (due, original) = rest.split_once('_')?;
    let due_ms: i64 = due.parse().ok()?;
    if due_ms < 0 || original.is_empty() {
        return None;
    }
    Some((due_ms, original.to_string()))
}

/// Parses the attempt counter from a name carrying an `.a<N>.json` suffix;
/// names without one are attempt 1.
#[must_use]
pub fn parse_attempt(name: &str) -> u32 {
    let Some(pos) = name.rfind(".a") else {
        return 1;
    };
    let rest = &name[pos + 2..];
    let Some(dot) = rest.find('.') else { return 1 };
    match rest[..dot].parse::<u32>() {
        Ok(n) if (1..=1000).contains(&n) => n,
        _ => 1,
    }
}

/// Rewrites `name` to carry attempt `n`: strips any existing `.a<N>` segment
/// and the `.json` extension, then appends `.a<n>.json`.
#[must_use]
pub fn with_attempt(name: &str, n: u32) -> String {
    let mut base = name.to_string();
    if let Some(pos) = base.rfind(".a") {
        if let Some(dot) = base[pos + 2..].find('.') {
            if base[pos + 2..pos + 2 + dot].chars().all(|c| c.is_ascii_digit()) {
                base.replace_range(pos..pos + 2 + dot, "");
            }
        }
    }
    if let Some(stripped) = base.strip_suffix(".json") {
        base = stripped.to_string();
    }
    format!("{base}.a{n}.json")
}

/// Exponential backoff with jitter for retry scheduling.
///
/// Attempt 2 waits `base_ms`, attempt 3 waits `base_ms * mult`, and so on,
/// capped at `max_ms`, plus up to `jitter_ms` of pseudo-random slack.
#[must_use]
pub fn backoff_delay_ms(next_attempt: u32, base_ms: i64, mult: i64, max_ms: i64, jitter_ms: i64) -> i64 {
    use rand::Rng;
    let base_ms = base_ms.max(0);
    let mult = mult.max(1);
    let exp = next_attempt.saturating_sub(2);
    let mut delay = base_ms;
    for _ in 0..exp {
        delay = delay.saturating_mul(mult);
        if max_ms > 0 && delay >= max_ms {
            delay = max_ms;
            break;
        }
    }
    if max_ms > 0 {
        delay = delay.min(max_ms);
    }
    if jitter_ms > 0 {
        delay += rand::thread_rng().gen_range(0..=jitter_ms);
    }
    delay
}

/// Writes `body` to `dst` atomically by staging in `tmp_dir` and renaming.
///
/// # Errors
///
/// Returns [`QueueError`] on write or rename failure; the staging file is
/// removed on a failed rename.
pub fn write_atomic(tmp_dir: &Path, dst: &Path, body: &str) -> Result<(), QueueError> {
    use rand::Rng;
    std::fs::create_dir_all(tmp_dir)?;
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let staging = tmp_dir.join(format!(
        "{}.{:08x}.tmp",
        file_name(dst),
        rand::thread_rng().gen::<u32>()
    ));
    std::fs::write(&staging, body)?;
    if let Err(err) = std::fs::rename(&staging, dst) {
        let _ = std::fs::remove_file(&staging);
        return Err(QueueError::AtomicWrite {
            path: dst.to_path_buf(),
            reason: err.to_string(),
        });
    }
    Ok(())
}

/// Rewrites the `_queue` metadata object of a request document for a retry:
/// attempt counter, bounds, next-run timestamp, and last error.
#[must_use]
pub fn patch_queue_meta(
    request_json: &str,
    attempt: u32,
    max_attempts: u32,
    next_run_at_ms: i64,
    last_error: &str,
) -> String {
    let mut doc: serde_json::Value = match serde_json::from_str(request_json) {
        Ok(serde_json::Value::Object(obj)) => serde_json::Value::Object(obj),
        _ => return request_json.to_string(),
    };
    if let Some(obj) = doc.as_object_mut() {
        obj.insert(
            "_queue".to_string(),
            serde_json::json!({
                "attempt": attempt,
                "max_attempts": max_attempts,
                "next_run_at_ms": next_run_at_ms,
                "last_error": last_error,
            }),
        );
    }
    doc.to_string()
}
