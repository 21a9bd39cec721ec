//! Queue runtime: recovery, feeder, checkpointing, and worker dispatch.
//!
//! The runtime owns the in-memory scheduling state layered over the file
//! queue. Startup order matters for crash recovery:
//!
//! 1. Scan `processing/` and rename orphaned `*.processing` files back into
//!    `inbox/` (WAL `RECOVER`) - a worker died mid-job.
//! 2. Load the checkpoint, seeding the ready queue and the delay heap.
//! 3. Scan `inbox/` and `retry/` for files the checkpoint missed.
//! 4. Replay the WAL: `ENQ`/`PROMOTE`/`RECOVER` re-seed the ready queue,
//!    `SCHED` the delay heap, `DEDUP` the request-id cache.
//! 5. Write a fresh checkpoint and truncate the WAL.
//!
//! An unreadable checkpoint or WAL is skipped; the directory scans remain
//! the backstop. Workers reserve a job with a single rename into
//! `processing/`, so two workers can never hold the same file.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::memory::DelayedEntry;
use super::{
    parse_attempt, parse_retry_name, patch_queue_meta, retry_filename, with_attempt, Checkpoint,
    CheckpointRetryEntry, DedupCache, DelayQueue, PriorityQueue, QueueDirs, QueueError,
};
use crate::wal::{read_framed, read_plain, Wal, WalPolicy};

/// Runtime tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Number of worker threads.
    pub workers: usize,
    /// Inbox/retry scan cadence for the feeder.
    #[serde(with = "humantime_serde")]
    pub scan_interval: Duration,
    /// Checkpoint cadence; zero disables the checkpoint thread.
    #[serde(with = "humantime_serde")]
    pub checkpoint_interval: Duration,
    /// Whether the WAL is kept at all.
    pub wal_enabled: bool,
    /// Framed (length+CRC) WAL records vs. plain JSONL.
    pub wal_framed: bool,
    /// fsync per WAL append.
    pub wal_fsync: bool,
    /// Default attempt cap; `_queue.max_attempts` overrides per request.
    pub max_attempts: u32,
    /// Retry backoff base delay in milliseconds.
    pub backoff_base_ms: i64,
    /// Retry backoff multiplier.
    pub backoff_mult: i64,
    /// Retry backoff cap in milliseconds.
    pub backoff_max_ms: i64,
    /// Retry backoff jitter bound in milliseconds.
    pub backoff_jitter_ms: i64,
    /// Request-id dedup TTL.
    #[serde(with = "humantime_serde")]
    pub dedup_ttl: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            scan_interval: Duration::from_millis(150),
            checkpoint_interval: Duration::from_secs(5),
            wal_enabled: true,
            wal_framed: true,
            wal_fsync: false,
            max_attempts: 5,
            backoff_base_ms: 2000,
            backoff_mult: 2,
            backoff_max_ms: 60_000,
            backoff_jitter_ms: 250,
            dedup_ttl: super::dedup::DEFAULT_DEDUP_TTL,
        }
    }
}

/// What a job handler reports back for one request document.
#[derive(Debug, Clone, Default)]
pub struct JobReport {
    /// Process-style exit code; zero is success.
    pub exit_code: i32,
    /// Run-log path (relative), for the side-car result.
    pub log_path: String,
    /// Per-tool metrics harvested from the run.
    pub metrics: Vec<JobMetric>,
}

/// One tool's contribution to a job.
#[derive(Debug, Clone)]
pub struct JobMetric {
    /// Tool id.
    pub aid: String,
    /// Whether the invocation succeeded.
    pub ok: bool,
    /// Wall-clock duration.
    pub duration_ms: u64,
}

/// Aggregated per-tool counters exposed to metrics exporters.
#[derive(Debug, Clone, Copy, Default)]
pub struct ToolTotals {
    /// Successful invocations.
    pub ok: u64,
    /// Failed invocations.
    pub fail: u64,
    /// Total duration across invocations.
    pub duration_ms: u64,
}

/// The handler invoked per reserved job file.
pub type JobHandler = Arc<dyn Fn(&Path) -> JobReport + Send + Sync>;

/// Thread handles for a running queue; dropped handles are joined by
/// [`QueueRuntime::join`].
#[derive(Debug, Default)]
pub struct RuntimeThreads {
    handles: Vec<std::thread::JoinHandle<()>>,
}

/// The queue runtime.
pub struct QueueRuntime {
    dirs: QueueDirs,
    config: RuntimeConfig,
    ready: PriorityQueue<PathBuf>,
    ready_seen: Mutex<HashSet<String>>,
    delay: Mutex<DelayQueue>,
    wal: Option<Wal>,
    dedup: DedupCache,
    stop: AtomicBool,
    jobs_processed: AtomicU64,
    jobs_ok: AtomicU64,
    jobs_fail: AtomicU64,
    tool_totals: Mutex<HashMap<String, ToolTotals>>,
}

impl QueueRuntime {
    /// Creates the runtime over an existing directory set, opening the WAL
    /// when enabled.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] when the WAL cannot be opened.
    pub fn new(dirs: QueueDirs, config: RuntimeConfig) -> Result<Self, QueueError> {
        let wal = if config.wal_enabled {
            Some(
                Wal::open_with(
                    dirs.wal_file(),
                    config.wal_framed,
                    config.wal_fsync,
                    WalPolicy::default(),
                )
                .map_err(|e| match e {
                    crate::wal::WalError::Io(io) => QueueError::Io(io),
                })?,
            )
        } else {
            None
        };
        let dedup = DedupCache::new(config.dedup_ttl);
        Ok(Self {
            dirs,
            config,
            ready: PriorityQueue::new(),
            ready_seen: Mutex::new(HashSet::new()),
            delay: Mutex::new(DelayQueue::new()),
            wal,
            dedup,
            stop: AtomicBool::new(false),
            jobs_processed: AtomicU64::new(0),
            jobs_ok: AtomicU64::new(0),
            jobs_fail: AtomicU64::new(0),
            tool_totals: Mutex::new(HashMap::new()),
        })
    }

    /// The directory set this runtime operates on.
    #[must_use]
    pub fn dirs(&self) -> &QueueDirs {
        &self.dirs
    }

    /// (processed, ok, fail) counters.
    #[must_use]
    pub fn counters(&self) -> (u64, u64, u64) {
        (
            self.jobs_processed.load(Ordering::Relaxed),
            self.jobs_ok.load(Ordering::Relaxed),
            self.jobs_fail.load(Ordering::Relaxed),
        )
    }

    /// Snapshot of per-tool totals.
    #[must_use]
    pub fn tool_totals(&self) -> HashMap<String, ToolTotals> {
        self.tool_totals.lock().expect("totals lock").clone()
    }

    fn wal_emit(&self, event: &str, fields: serde_json::Value) {
        let Some(wal) = &self.wal else { return };
        let mut obj = serde_json::json!({
            "t": event,
            "ms": crate::types::now_ms(),
        });
        if let (Some(dst), Some(src)) = (obj.as_object_mut(), fields.as_object()) {
            for (k, v) in src {
                dst.insert(k.clone(), v.clone());
            }
        }
        if let Err(err) = wal.append(&obj.to_string()) {
            tracing::warn!(error = %err, event, "wal append failed");
        }
    }

    fn ready_push(&self, path: PathBuf) {
        let name = file_name(&path);
        {
            let mut seen = self.ready_seen.lock().expect("seen lock");
            if !seen.insert(name.clone()) {
                return;
            }
        }
        self.ready.push(super::parse_priority(&name), path);
    }

    fn ready_forget(&self, name: &str) {
        self.ready_seen.lock().expect("seen lock").remove(name);
    }

    /// Enqueues a request document; `request_id` (when present) is
    /// deduplicated within the TTL.
    ///
    /// Returns the inbox path, or `None` when the request was deduplicated.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] on write failure.
    pub fn enqueue(
        &self,
        priority: i32,
        tag: &str,
        body: &str,
        request_id: Option<&str>,
    ) -> Result<Option<PathBuf>, QueueError> {
        let now = crate::types::now_ms();
        if let Some(rid) = request_id {
            if !rid.is_empty() && !self.dedup.insert(rid, now) {
                tracing::debug!(request_id = rid, "duplicate request deduplicated");
                return Ok(None);
            }
            if !rid.is_empty() {
                self.wal_emit("DEDUP", serde_json::json!({ "request_id": rid }));
            }
        }
        let path = self.dirs.enqueue(priority, tag, body)?;
        self.wal_emit("ENQ", serde_json::json!({ "name": file_name(&path) }));
        self.ready_push(path.clone());
        Ok(Some(path))
    }

    /// Runs crash recovery (steps 1-5 of the module docs).
    pub fn recover(&self) {
        let inbox = self.dirs.inbox();

        // 1. Orphaned processing files go back to the inbox.
        if let Ok(entries) = std::fs::read_dir(self.dirs.processing()) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                let Some(original) = name.strip_suffix(".processing") else {
                    continue;
                };
                let dst = inbox.join(original);
                if std::fs::rename(entry.path(), &dst).is_ok() {
                    tracing::info!(from = %name, to = %original, "recovered orphaned job");
                    self.wal_emit(
                        "RECOVER",
                        serde_json::json!({ "from": name, "to": original }),
                    );
                    self.ready_push(dst);
                }
            }
        }

        // 2. Checkpoint.
        if let Some(ckpt) = Checkpoint::load(&self.dirs.checkpoint_file()) {
            for name in &ckpt.inbox {
                if !name.is_empty() {
                    self.ready_push(inbox.join(name));
                }
            }
            for entry in &ckpt.retry {
                if let Some((file_due, original)) = parse_retry_name(&entry.name) {
                    let due_ms = if file_due > 0 { file_due } else { entry.due_ms };
                    self.schedule_retry_entry(due_ms, self.dirs.retry().join(&entry.name), original);
                }
            }
        }

        // 3. Directory scans are the backstop.
        for path in self.dirs.list_inbox() {
            self.ready_push(path);
        }
        self.scan_retry_dir();

        // 4. WAL replay.
        self.replay_wal();

        // 5. Fresh checkpoint; the WAL restarts empty.
        self.write_checkpoint();
    }

    fn replay_wal(&self) {
        let Some(wal) = &self.wal else { return };
        let records = if self.config.wal_framed {
            read_framed(wal.path())
        } else {
            read_plain(wal.path())
        };
        let records = match records {
            Ok(r) => r,
            Err(err) => {
                tracing::warn!(error = %err, "wal unreadable; relying on directory scan");
                return;
            }
        };
        let now = crate::types::now_ms();
        for line in records {
            let Ok(v) = serde_json::from_str::<serde_json::Value>(&line) else {
                continue;
            };
            match v["t"].as_str().unwrap_or("") {
                "ENQ" => {
                    if let Some(name) = v["name"].as_str() {
                        self.ready_push(self.dirs.inbox().join(name));
                    }
                }
                "SCHED" => {
                    let due_ms = v["due_ms"].as_i64().unwrap_or(0);
                    if let Some(name) = v["name"].as_str() {
                        if let Some((file_due, original)) = parse_retry_name(name) {
                            let due = if file_due > 0 { file_due } else { due_ms };
                            if due > 0 {
                                self.schedule_retry_entry(
                                    due,
                                    self.dirs.retry().join(name),
                                    original,
                                );
                            }
                        }
                    }
                }
                "PROMOTE" | "RECOVER" => {
                    if let Some(to) = v["to"].as_str() {
                        self.ready_push(self.dirs.inbox().join(to));
                    }
                }
                "DEDUP" => {
                    if let (Some(rid), Some(ms)) = (v["request_id"].as_str(), v["ms"].as_i64()) {
                        self.dedup.restore(rid, ms, now);
                    }
                }
                _ => {}
            }
        }
    }

    fn schedule_retry_entry(&self, due_ms: i64, path: PathBuf, original: String) {
        let newly = self.delay.lock().expect("delay lock").schedule(DelayedEntry {
            due_ms,
            path: path.clone(),
            original,
        });
        if newly {
            self.wal_emit(
                "SCHED",
                serde_json::json!({ "due_ms": due_ms, "name": file_name(&path) }),
            );
        }
    }

    fn scan_retry_dir(&self) {
        let Ok(entries) = std::fs::read_dir(self.dirs.retry()) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some((due_ms, original)) = parse_retry_name(&name) {
                self.schedule_retry_entry(due_ms, entry.path(), original);
            }
        }
    }

    fn promote_due_retries(&self) {
        let now = crate::types::now_ms();
        let due = self.delay.lock().expect("delay lock").pop_due(now);
        for entry in due {
            let dst = self.dirs.inbox().join(&entry.original);
            if std::fs::rename(&entry.path, &dst).is_err() {
                continue;
            }
            self.wal_emit(
                "PROMOTE",
                serde_json::json!({
                    "from": file_name(&entry.path),
                    "to": entry.original,
                }),
            );
            self.ready_push(dst);
        }
    }

    /// Writes a checkpoint of the in-memory state and truncates the WAL.
    pub fn write_checkpoint(&self) {
        if self.wal.is_none() {
            return;
        }
        let inbox: Vec<String> = self
            .ready_seen
            .lock()
            .expect("seen lock")
            .iter()
            .cloned()
            .collect();
        let retry: Vec<CheckpointRetryEntry> = self
            .delay
            .lock()
            .expect("delay lock")
            .entries()
            .into_iter()
            .map(|e| CheckpointRetryEntry {
                due_ms: e.due_ms,
                name: file_name(&e.path),
            })
            .collect();

        let ckpt = Checkpoint::new(inbox, retry);
        if let Err(err) = ckpt.write(&self.dirs.tmp(), &self.dirs.checkpoint_file()) {
            tracing::warn!(error = %err, "checkpoint write failed; keeping wal");
            return;
        }
        if let Some(wal) = &self.wal {
            if let Err(err) = wal.truncate() {
                tracing::warn!(error = %err, "wal truncate after checkpoint failed");
            }
        }
    }

    /// Spawns the feeder, checkpoint, and worker threads.
    pub fn start(self: &Arc<Self>, handler: JobHandler) -> RuntimeThreads {
        let mut threads = RuntimeThreads::default();

        {
            let rt = Arc::clone(self);
            threads.handles.push(
                std::thread::Builder::new()
                    .name("queue-feeder".to_string())
                    .spawn(move || rt.feeder_loop())
                    .expect("spawn feeder"),
            );
        }

        if !self.config.checkpoint_interval.is_zero() && self.wal.is_some() {
            let rt = Arc::clone(self);
            threads.handles.push(
                std::thread::Builder::new()
                    .name("queue-checkpoint".to_string())
                    .spawn(move || rt.checkpoint_loop())
                    .expect("spawn checkpoint"),
            );
        }

        for wid in 0..self.config.workers {
            let rt = Arc::clone(self);
            let handler = Arc::clone(&handler);
            threads.handles.push(
                std::thread::Builder::new()
                    .name(format!("queue-worker-{wid}"))
                    .spawn(move || rt.worker_loop(wid, &handler))
                    .expect("spawn worker"),
            );
        }
        threads
    }

    /// Signals shutdown: workers drain, the feeder and checkpoint threads
    /// exit at their next tick.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.ready.shutdown();
    }

    /// Joins all runtime threads.
    pub fn join(threads: RuntimeThreads) {
        for handle in threads.handles {
            let _ = handle.join();
        }
    }

    fn feeder_loop(&self) {
        while !self.stop.load(Ordering::SeqCst) {
            self.promote_due_retries();
            for path in self.dirs.list_inbox() {
                self.ready_push(path);
            }
            self.scan_retry_dir();

            let now = crate::types::now_ms();
            let mut sleep_ms =
                i64::try_from(self.config.scan_interval.as_millis()).unwrap_or(150);
            if let Some(next) = self.delay.lock().expect("delay lock").next_due_in_ms(now) {
                sleep_ms = sleep_ms.min(next);
            }
            std::thread::sleep(Duration::from_millis(sleep_ms.clamp(10, 5000) as u64));
        }
    }

    fn checkpoint_loop(&self) {
        while !self.stop.load(Ordering::SeqCst) {
            std::thread::sleep(self.config.checkpoint_interval);
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            self.write_checkpoint();
        }
    }

    fn worker_loop(&self, wid: usize, handler: &JobHandler) {
        while let Some(item) = self.ready.pop() {
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            let path = item.value;
            let base = file_name(&path);
            let processing = self.dirs.processing().join(format!("{base}.processing"));
            if std::fs::rename(&path, &processing).is_err() {
                // Lost the race (another worker, or the file vanished).
                self.ready_forget(&base);
                continue;
            }
            self.ready_forget(&base);
            self.process_reserved(wid, &processing, &base, handler);
        }
    }

    fn process_reserved(&self, wid: usize, processing: &Path, base: &str, handler: &JobHandler) {
        let attempt = parse_attempt(base);
        let report = handler(processing);

        // Read the per-request override before finish_job moves the file.
        let max_attempts = self
            .request_max_attempts(processing)
            .unwrap_or(self.config.max_attempts)
            .max(1);

        let (event, final_name, scheduled_retry, deadletter) =
            self.finish_job(processing, base, attempt, max_attempts, &report);

        self.wal_emit(
            event,
            serde_json::json!({
                "src": format!("{base}.processing"),
                "dst": final_name,
                "rc": report.exit_code,
                "attempt": attempt,
                "worker": wid,
            }),
        );

        self.jobs_processed.fetch_add(1, Ordering::Relaxed);
        if report.exit_code == 0 {
            self.jobs_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.jobs_fail.fetch_add(1, Ordering::Relaxed);
        }
        if !report.metrics.is_empty() {
            let mut totals = self.tool_totals.lock().expect("totals lock");
            for m in &report.metrics {
                let t = totals.entry(m.aid.clone()).or_default();
                if m.ok {
                    t.ok += 1;
                } else {
                    t.fail += 1;
                }
                t.duration_ms += m.duration_ms;
            }
        }

        // Side-car result for the producer.
        let result = serde_json::json!({
            "ok": report.exit_code == 0,
            "exit_code": report.exit_code,
            "job": final_name,
            "log": report.log_path,
            "attempt": attempt,
            "max_attempts": max_attempts,
            "scheduled_retry": scheduled_retry,
            "deadletter": deadletter,
        });
        let sidecar = self.dirs.out().join(format!("{base}.attempt{attempt}.result.json"));
        if let Err(err) = super::write_atomic(&self.dirs.tmp(), &sidecar, &result.to_string()) {
            tracing::warn!(error = %err, "side-car result write failed");
        }
    }

    fn request_max_attempts(&self, path: &Path) -> Option<u32> {
        let text = std::fs::read_to_string(path).ok()?;
        let doc: serde_json::Value = serde_json::from_str(&text).ok()?;
        doc["_queue"]["max_attempts"]
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .filter(|v| *v >= 1)
    }

    // Moves a finished job out of processing/. Returns
    // (wal event, final name, scheduled_retry, deadletter).
    fn finish_job(
        &self,
        processing: &Path,
        base: &str,
        attempt: u32,
        max_attempts: u32,
        report: &JobReport,
    ) -> (&'static str, String, bool, bool) {
        if report.exit_code == 0 {
            let dst = self.dirs.done().join(base);
            if let Err(err) = std::fs::rename(processing, &dst) {
                tracing::warn!(error = %err, job = base, "move to done/ failed");
            }
            return ("DONE", base.to_string(), false, false);
        }

        if attempt < max_attempts {
            let next_attempt = attempt + 1;
            let delay = super::backoff_delay_ms(
                next_attempt,
                self.config.backoff_base_ms,
                self.config.backoff_mult,
                self.config.backoff_max_ms,
                self.config.backoff_jitter_ms,
            );
            let due = crate::types::now_ms() + delay;
            let next_name = with_attempt(base, next_attempt);
            let retry_name = retry_filename(due, &next_name);
            let retry_path = self.dirs.retry().join(&retry_name);

            let body = std::fs::read_to_string(processing).unwrap_or_default();
            let last_error = format!("exit_code={};log={}", report.exit_code, report.log_path);
            let patched = patch_queue_meta(&body, next_attempt, max_attempts, due, &last_error);

            match super::write_atomic(&self.dirs.tmp(), &retry_path, &patched) {
                Ok(()) => {
                    let _ = std::fs::remove_file(processing);
                    self.schedule_retry_entry(due, retry_path, next_name);
                    return ("RETRY", retry_name, true, false);
                }
                Err(err) => {
                    tracing::warn!(error = %err, job = base, "retry write failed; dead-lettering");
                }
            }
        }

        let dst = self.dirs.dlq().join(base);
        if let Err(err) = std::fs::rename(processing, &dst) {
            tracing::warn!(error = %err, job = base, "move to dlq/ failed");
        }
        ("DLQ", base.to_string(), false, true)
    }
}

fn file_name(p: &Path) -> String {
    p.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
}
