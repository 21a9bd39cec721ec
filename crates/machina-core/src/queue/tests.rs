use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use super::*;

fn test_config(workers: usize) -> RuntimeConfig {
    RuntimeConfig {
        workers,
        scan_interval: Duration::from_millis(25),
        checkpoint_interval: Duration::from_millis(200),
        backoff_base_ms: 30,
        backoff_mult: 2,
        backoff_max_ms: 200,
        backoff_jitter_ms: 0,
        ..RuntimeConfig::default()
    }
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

#[test]
fn filename_helpers() {
    let name = inbox_filename(42, "scan");
    assert!(name.starts_with("p0042_scan_"), "{name}");
    assert!(name.ends_with(".json"));
    assert_eq!(parse_priority(&name), 42);

    assert_eq!(parse_priority("junk.json"), DEFAULT_PRIORITY);
    assert_eq!(parse_priority("p12345_x.json"), DEFAULT_PRIORITY);
    assert_eq!(parse_priority("p003_x.json"), DEFAULT_PRIORITY);

    let retry = retry_filename(1234, "p0042_scan_1_ab.json");
    assert_eq!(retry, "retry_1234_p0042_scan_1_ab.json");
    assert_eq!(
        parse_retry_name(&retry),
        Some((1234, "p0042_scan_1_ab.json".to_string()))
    );
    assert_eq!(parse_retry_name("retry_x_y.json"), None);
    assert_eq!(parse_retry_name("other.json"), None);
}

#[test]
fn attempt_suffix_round_trip() {
    assert_eq!(parse_attempt("p0001_rq_1_aa.json"), 1);
    assert_eq!(parse_attempt("p0001_rq_1_aa.a3.json"), 3);
    assert_eq!(with_attempt("p0001_rq_1_aa.json", 2), "p0001_rq_1_aa.a2.json");
    assert_eq!(
        with_attempt("p0001_rq_1_aa.a2.json", 3),
        "p0001_rq_1_aa.a3.json"
    );
    assert_eq!(parse_attempt(&with_attempt("x.json", 7)), 7);
}

#[test]
fn backoff_grows_and_caps() {
    assert_eq!(backoff_delay_ms(2, 2000, 2, 60_000, 0), 2000);
    assert_eq!(backoff_delay_ms(3, 2000, 2, 60_000, 0), 4000);
    assert_eq!(backoff_delay_ms(10, 2000, 2, 60_000, 0), 60_000);
    let with_jitter = backoff_delay_ms(2, 1000, 2, 60_000, 250);
    assert!((1000..=1250).contains(&with_jitter));
}

#[test]
fn queue_meta_patch_replaces_previous() {
    let body = r#"{"goal_id":"g","_queue":{"attempt":1,"old":true}}"#;
    let patched = patch_queue_meta(body, 2, 5, 99, "exit_code=1");
    let v: serde_json::Value = serde_json::from_str(&patched).unwrap();
    assert_eq!(v["_queue"]["attempt"], 2);
    assert_eq!(v["_queue"]["max_attempts"], 5);
    assert_eq!(v["_queue"]["next_run_at_ms"], 99);
    assert!(v["_queue"]["old"].is_null());
    assert_eq!(v["goal_id"], "g");
}

#[test]
fn enqueue_is_atomic_and_ordered() {
    let dir = tempfile::tempdir().unwrap();
    let dirs = QueueDirs::ensure(dir.path()).unwrap();
    dirs.enqueue(9000, "low", "{}").unwrap();
    dirs.enqueue(10, "high", "{}").unwrap();
    dirs.enqueue(5000, "mid", "{}").unwrap();

    let listed = dirs.list_inbox();
    let priorities: Vec<i32> = listed
        .iter()
        .map(|p| parse_priority(&p.file_name().unwrap().to_string_lossy()))
        .collect();
    assert_eq!(priorities, vec![10, 5000, 9000]);
    assert!(std::fs::read_dir(dirs.tmp()).unwrap().next().is_none());
}

#[test]
fn workers_process_jobs_to_done() {
    let dir = tempfile::tempdir().unwrap();
    let dirs = QueueDirs::ensure(dir.path()).unwrap();
    let rt = Arc::new(QueueRuntime::new(dirs, test_config(2)).unwrap());
    rt.recover();

    let handler: JobHandler = Arc::new(|_path: &Path| JobReport {
        exit_code: 0,
        log_path: "logs/run_x.jsonl".to_string(),
        metrics: vec![JobMetric {
            aid: "AID.ERROR_SCAN.v1".to_string(),
            ok: true,
            duration_ms: 3,
        }],
    });
    let threads = rt.start(handler);

    for i in 0..4 {
        rt.enqueue(100 + i, "job", r#"{"goal_id":"g"}"#, None).unwrap();
    }

    assert!(wait_until(Duration::from_secs(5), || rt.counters().0 == 4));
    rt.shutdown();
    QueueRuntime::join(threads);

    let done: Vec<_> = std::fs::read_dir(rt.dirs().done()).unwrap().collect();
    assert_eq!(done.len(), 4);
    let (processed, ok, fail) = rt.counters();
    assert_eq!((processed, ok, fail), (4, 4, 0));
    assert_eq!(rt.tool_totals()["AID.ERROR_SCAN.v1"].ok, 4);

    // Side-car results landed in out/.
    let out: Vec<_> = std::fs::read_dir(rt.dirs().out()).unwrap().collect();
    assert_eq!(out.len(), 4);
}

#[test]
fn failed_job_retries_then_dead_letters() {
    let dir = tempfile::tempdir().unwrap();
    let dirs = QueueDirs::ensure(dir.path()).unwrap();
    let mut config = test_config(1);
    config.max_attempts = 2;
    let rt = Arc::new(QueueRuntime::new(dirs, config).unwrap());
    rt.recover();

    let handler: JobHandler = Arc::new(|_path: &Path| JobReport {
        exit_code: 1,
        log_path: String::new(),
        metrics: Vec::new(),
    });
    let threads = rt.start(handler);

    rt.enqueue(100, "fail", r#"{"goal_id":"g"}"#, None).unwrap();

    // Two attempts: original plus one retry, then the dead-letter queue.
    assert!(wait_until(Duration::from_secs(10), || {
        std::fs::read_dir(rt.dirs().dlq()).map(|d| d.count()).unwrap_or(0) == 1
    }));
    rt.shutdown();
    QueueRuntime::join(threads);

    let dlq_name = std::fs::read_dir(rt.dirs().dlq())
        .unwrap()
        .next()
        .unwrap()
        .unwrap()
        .file_name()
        .to_string_lossy()
        .into_owned();
    assert_eq!(parse_attempt(&dlq_name), 2);

    // The retried document carries updated _queue metadata.
    let body = std::fs::read_to_string(rt.dirs().dlq().join(&dlq_name)).unwrap();
    let v: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(v["_queue"]["attempt"], 2);
    assert!(v["_queue"]["last_error"].as_str().unwrap().contains("exit_code=1"));
}

#[test]
fn recovery_renames_processing_back_to_inbox() {
    let dir = tempfile::tempdir().unwrap();
    let dirs = QueueDirs::ensure(dir.path()).unwrap();

    // Simulate a worker killed mid-job.
    let orphan = dirs.processing().join("p5000_rq_X.json.processing");
    std::fs::write(&orphan, r#"{"goal_id":"g"}"#).unwrap();

    let rt = Arc::new(QueueRuntime::new(dirs, test_config(0)).unwrap());
    rt.recover();

    assert!(rt.dirs().inbox().join("p5000_rq_X.json").exists());
    assert!(!orphan.exists());

    // The WAL was truncated by the post-recovery checkpoint, but the
    // checkpoint itself must list the recovered job.
    let ckpt = Checkpoint::load(&rt.dirs().checkpoint_file()).unwrap();
    assert!(ckpt.inbox.contains(&"p5000_rq_X.json".to_string()));
}

#[test]
fn recovery_replays_wal_sched_events() {
    let dir = tempfile::tempdir().unwrap();
    let dirs = QueueDirs::ensure(dir.path()).unwrap();

    let due = crate::types::now_ms() + 60_000;
    let retry_name = format!("retry_{due}_p5000_rq_Y.json");
    std::fs::write(dirs.retry().join(&retry_name), "{}").unwrap();

    // Hand-write a WAL with a SCHED record and no checkpoint.
    {
        let wal = crate::wal::Wal::open(dirs.wal_file()).unwrap();
        wal.append(
            &serde_json::json!({"t":"SCHED","ms":1,"due_ms":due,"name":retry_name}).to_string(),
        )
        .unwrap();
    }

    let rt = Arc::new(QueueRuntime::new(dirs, test_config(0)).unwrap());
    rt.recover();

    let ckpt = Checkpoint::load(&rt.dirs().checkpoint_file()).unwrap();
    assert_eq!(ckpt.retry.len(), 1);
    assert_eq!(ckpt.retry[0].due_ms, due);
}

#[test]
fn dedup_suppresses_repeat_request_ids() {
    let dir = tempfile::tempdir().unwrap();
    let dirs = QueueDirs::ensure(dir.path()).unwrap();
    let rt = Arc::new(QueueRuntime::new(dirs, test_config(0)).unwrap());

    let first = rt.enqueue(10, "rq", "{}", Some("rid-1")).unwrap();
    assert!(first.is_some());
    let second = rt.enqueue(10, "rq", "{}", Some("rid-1")).unwrap();
    assert!(second.is_none());
    let other = rt.enqueue(10, "rq", "{}", Some("rid-2")).unwrap();
    assert!(other.is_some());

    assert_eq!(rt.dirs().list_inbox().len(), 2);
}

#[test]
fn due_retry_promotes_to_inbox() {
    let dir = tempfile::tempdir().unwrap();
    let dirs = QueueDirs::ensure(dir.path()).unwrap();

    let due = crate::types::now_ms() - 1000; // already due
    let retry_name = format!("retry_{due}_p0100_rq_Z.json");
    std::fs::write(dirs.retry().join(&retry_name), r#"{"goal_id":"g"}"#).unwrap();

    let rt = Arc::new(QueueRuntime::new(dirs, test_config(1)).unwrap());
    rt.recover();
    let handler: JobHandler = Arc::new(|_p: &Path| JobReport::default());
    let threads = rt.start(handler);

    assert!(wait_until(Duration::from_secs(5), || rt.counters().0 == 1));
    rt.shutdown();
    QueueRuntime::join(threads);

    assert!(rt.dirs().done().join("p0100_rq_Z.json").exists());
}
