//! Subprocess execution with limits, timeouts, and group kill.
//!
//! Every child runs in its own process group so a timeout kills the whole
//! tree, not just the direct child. Pipes are CLOEXEC (Rust's default), so
//! fds never leak into grandchildren. On Linux the child additionally gets
//! rlimits and `PR_SET_NO_NEW_PRIVS` applied between fork and exec; on other
//! Unix targets the limiter degrades to rlimits-only or timeout-only, and
//! the degradation is reported in [`CaptureResult::sandbox`] so journal
//! consumers can observe it.
//!
//! There is no shell anywhere in this path: argv is executed verbatim.

use std::io::{Read, Write};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use wait_timeout::ChildExt;

/// Errors from process control.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProcessError {
    /// Empty argv.
    #[error("empty argv")]
    EmptyArgv,

    /// The child could not be spawned.
    #[error("spawn failed for {command}: {reason}")]
    SpawnFailed {
        /// argv[0].
        command: String,
        /// OS-level reason.
        reason: String,
    },
}

/// Resource limits for one child.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnLimits {
    /// Wall-clock timeout; the whole process group is SIGKILLed on expiry.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Captured output cap (merged stdout+stderr); the rest is discarded.
    pub stdout_max_bytes: usize,
    /// CPU-seconds rlimit; zero disables.
    pub cpu_secs: u64,
    /// Virtual memory rlimit in MiB; zero disables.
    pub as_mb: u64,
    /// Max-file-size rlimit in MiB; zero disables.
    pub fsize_mb: u64,
    /// Open-fd rlimit; zero disables.
    pub nofile: u64,
    /// Process-count rlimit; zero disables.
    pub nproc: u64,
    /// Apply `PR_SET_NO_NEW_PRIVS` (Linux only).
    pub no_new_privs: bool,
}

impl Default for SpawnLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(2000),
            stdout_max_bytes: 64 * 1024,
            cpu_secs: 2,
            as_mb: 512,
            fsize_mb: 10,
            nofile: 64,
            nproc: 32,
            no_new_privs: true,
        }
    }
}

/// Outcome of a captured child run.
#[derive(Debug, Clone, Default)]
pub struct CaptureResult {
    /// Exit code; 127 when unknown (signal death, kill on timeout).
    pub exit_code: i32,
    /// Whether the wall-clock timeout expired.
    pub timed_out: bool,
    /// Whether output was truncated at the cap.
    pub output_truncated: bool,
    /// Captured stdout followed by captured stderr.
    pub output: String,
    /// Which limiter actually applied, e.g. `"rlimits+no_new_privs"` or
    /// `"timeout-only"`. Observable in journal payloads.
    pub sandbox: &'static str,
}

fn sandbox_mode(limits: &SpawnLimits) -> &'static str {
    #[cfg(target_os = "linux")]
    {
        if limits.no_new_privs {
            "rlimits+no_new_privs"
        } else {
            "rlimits"
        }
    }
    #[cfg(all(unix, not(target_os = "linux")))]
    {
        let _ = limits;
        "rlimits"
    }
    #[cfg(not(unix))]
    {
        let _ = limits;
        "timeout-only"
    }
}

#[cfg(unix)]
fn apply_pre_exec(cmd: &mut Command, limits: &SpawnLimits) {
    use std::os::unix::process::CommandExt;

    let limits = limits.clone();
    // SAFETY: only async-signal-safe calls (setrlimit, prctl) run between
    // fork and exec.
    unsafe {
        cmd.pre_exec(move || {
            use nix::sys::resource::{setrlimit, Resource};
            let mib = 1024 * 1024;
            if limits.cpu_secs > 0 {
                let _ = setrlimit(Resource::RLIMIT_CPU, limits.cpu_secs, limits.cpu_secs);
            }
            if limits.as_mb > 0 {
                let _ = setrlimit(Resource::RLIMIT_AS, limits.as_mb * mib, limits.as_mb * mib);
            }
            if limits.fsize_mb > 0 {
                let _ = setrlimit(
                    Resource::RLIMIT_FSIZE,
                    limits.fsize_mb * mib,
                    limits.fsize_mb * mib,
                );
            }
            if limits.nofile > 0 {
                let _ = setrlimit(Resource::RLIMIT_NOFILE, limits.nofile, limits.nofile);
            }
            #[cfg(target_os = "linux")]
            if limits.nproc > 0 {
                let _ = setrlimit(Resource::RLIMIT_NPROC, limits.nproc, limits.nproc);
            }
            #[cfg(target_os = "linux")]
            if limits.no_new_privs {
                let _ = nix::sys::prctl::set_no_new_privs();
            }
            Ok(())
        });
    }
}

/// SIGKILLs the child's whole process group and reaps it.
pub fn kill_group(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        if let Ok(pid) = i32::try_from(child.id()) {
            let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

fn spawn(
    argv: &[String],
    cwd: Option<&std::path::Path>,
    limits: &SpawnLimits,
    stdin: Stdio,
) -> Result<Child, ProcessError> {
    let (exe, args) = argv.split_first().ok_or(ProcessError::EmptyArgv)?;
    let mut cmd = Command::new(exe);
    cmd.args(args)
        .stdin(stdin)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(cwd) = cwd {
        if !cwd.as_os_str().is_empty() {
            cmd.current_dir(cwd);
        }
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
        apply_pre_exec(&mut cmd, limits);
    }
    #[cfg(not(unix))]
    let _ = limits;
    cmd.spawn().map_err(|e| ProcessError::SpawnFailed {
        command: exe.clone(),
        reason: e.to_string(),
    })
}

fn capture_stream<R: Read + Send + 'static>(
    reader: R,
    cap: usize,
) -> std::thread::JoinHandle<(Vec<u8>, bool)> {
    std::thread::spawn(move || {
        let mut reader = reader;
        let mut out = Vec::new();
        let mut truncated = false;
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if out.len() < cap {
                        let take = n.min(cap - out.len());
                        out.extend_from_slice(&buf[..take]);
                        if take < n {
                            truncated = true;
                        }
                    } else {
                        truncated = true;
                    }
                }
                Err(_) => break,
            }
        }
        (out, truncated)
    })
}

fn wait_and_collect(mut child: Child, limits: &SpawnLimits) -> CaptureResult {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let out_handle = stdout.map(|s| capture_stream(s, limits.stdout_max_bytes));
    let err_handle = stderr.map(|s| capture_stream(s, limits.stdout_max_bytes));

    let mut result = CaptureResult {
        sandbox: sandbox_mode(limits),
        ..CaptureResult::default()
    };

    match child.wait_timeout(limits.timeout) {
        Ok(Some(status)) => {
            result.exit_code = status.code().unwrap_or(127);
        }
        Ok(None) => {
            result.timed_out = true;
            result.exit_code = 127;
            kill_group(&mut child);
        }
        Err(_) => {
            result.exit_code = 127;
            kill_group(&mut child);
        }
    }

    let mut output = Vec::new();
    let mut truncated = false;
    for handle in [out_handle, err_handle].into_iter().flatten() {
        if let Ok((bytes, trunc)) = handle.join() {
            let room = limits.stdout_max_bytes.saturating_sub(output.len());
            if bytes.len() > room {
                truncated = true;
            }
            output.extend_from_slice(&bytes[..bytes.len().min(room)]);
            truncated |= trunc;
        }
    }
    result.output = String::from_utf8_lossy(&output).into_owned();
    result.output_truncated = truncated;
    result
}

/// Runs argv, capturing merged output with the timeout and limits applied.
///
/// # Errors
///
/// Returns [`ProcessError`] only when the child never started; a started
/// child always yields a [`CaptureResult`], timed out or not.
pub fn run_capture(
    argv: &[String],
    cwd: Option<&std::path::Path>,
    limits: &SpawnLimits,
) -> Result<CaptureResult, ProcessError> {
    let child = spawn(argv, cwd, limits, Stdio::null())?;
    Ok(wait_and_collect(child, limits))
}

/// Runs argv with `stdin_data` fed to the child's stdin.
///
/// # Errors
///
/// Returns [`ProcessError`] only when the child never started.
pub fn run_capture_stdin(
    argv: &[String],
    cwd: Option<&std::path::Path>,
    stdin_data: &str,
    limits: &SpawnLimits,
) -> Result<CaptureResult, ProcessError> {
    let mut child = spawn(argv, cwd, limits, Stdio::piped())?;
    if let Some(mut stdin) = child.stdin.take() {
        // A child that exits early closes the pipe; a write error here is
        // the child's outcome, not ours.
        let _ = stdin.write_all(stdin_data.as_bytes());
    }
    Ok(wait_and_collect(child, limits))
}

/// Splits a command string into argv tokens with basic single/double quote
/// support and backslash escaping inside double quotes. Returns an empty
/// vector on unbalanced quotes.
#[must_use]
pub fn split_argv(cmd: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut chars = cmd.chars().peekable();
    let mut in_token = false;

    while let Some(c) = chars.next() {
        match c {
            ' ' | '\t' => {
                if in_token {
                    out.push(std::mem::take(&mut cur));
                    in_token = false;
                }
            }
            '\'' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => cur.push(c),
                        None => return Vec::new(),
                    }
                }
            }
            '"' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(e) => cur.push(e),
                            None => return Vec::new(),
                        },
                        Some(c) => cur.push(c),
                        None => return Vec::new(),
                    }
                }
            }
            c => {
                in_token = true;
                cur.push(c);
            }
        }
    }
    if in_token {
        out.push(cur);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn captures_output_and_exit_code() {
        let r = run_capture(
            &argv(&["sh", "-c", "echo hello; exit 3"]),
            None,
            &SpawnLimits::default(),
        )
        .unwrap();
        assert_eq!(r.exit_code, 3);
        assert!(!r.timed_out);
        assert!(r.output.contains("hello"));
    }

    #[test]
    fn merges_stderr() {
        let r = run_capture(
            &argv(&["sh", "-c", "echo out; echo err 1>&2"]),
            None,
            &SpawnLimits::default(),
        )
        .unwrap();
        assert!(r.output.contains("out"));
        assert!(r.output.contains("err"));
    }

    #[test]
    fn timeout_kills_the_group() {
        let limits = SpawnLimits {
            timeout: Duration::from_millis(200),
            ..SpawnLimits::default()
        };
        let start = std::time::Instant::now();
        let r = run_capture(&argv(&["sleep", "10"]), None, &limits).unwrap();
        assert!(r.timed_out);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn output_is_capped() {
        let limits = SpawnLimits {
            stdout_max_bytes: 100,
            ..SpawnLimits::default()
        };
        let r = run_capture(
            &argv(&["sh", "-c", "yes x | head -c 10000"]),
            None,
            &limits,
        )
        .unwrap();
        assert!(r.output_truncated);
        assert!(r.output.len() <= 100);
    }

    #[test]
    fn stdin_is_delivered() {
        let r = run_capture_stdin(
            &argv(&["cat"]),
            None,
            "payload-line\n",
            &SpawnLimits::default(),
        )
        .unwrap();
        assert_eq!(r.exit_code, 0);
        assert!(r.output.contains("payload-line"));
    }

    #[test]
    fn missing_binary_is_a_spawn_error() {
        let err = run_capture(
            &argv(&["definitely_not_a_real_binary_4242"]),
            None,
            &SpawnLimits::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ProcessError::SpawnFailed { .. }));
    }

    #[test]
    fn split_argv_handles_quotes() {
        assert_eq!(split_argv("a b c"), argv(&["a", "b", "c"]));
        assert_eq!(split_argv("python3 'my script.py'"), argv(&["python3", "my script.py"]));
        assert_eq!(
            split_argv(r#"sh -c "echo \"hi\"""#),
            argv(&["sh", "-c", r#"echo "hi""#])
        );
        assert!(split_argv("unbalanced 'quote").is_empty());
        assert!(split_argv("").is_empty());
    }
}
