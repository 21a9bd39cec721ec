//! Long-lived toolhost sessions and the per-plugin session pool.
//!
//! A session is one persistent toolhost child speaking NDJSON on
//! stdin/stdout. The pool hands out exclusive leases under a mutex and
//! condition variable; a session is only ever touched while its lease is
//! held, which is what makes the per-session `base_workspace` delta tracking
//! sound ("one logical owner per session at a time").
//!
//! Liveness handling: a dead session (EOF, write error, read timeout) is
//! shut down - close stdin, short grace, SIGTERM the group, SIGKILL the
//! group, reap - and respawned on next use. After three consecutive
//! spawn/serve failures the call degrades to fork-per-request with a full
//! workspace snapshot instead of a delta.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::ToolResult;
use crate::process::{kill_group, run_capture_stdin, SpawnLimits};
use crate::types::StepStatus;
use crate::workspace::{Workspace, WorkspaceDelta};

/// Hard cap on one NDJSON response line.
const MAX_RESPONSE_BYTES: usize = 1024 * 1024;

/// Consecutive session failures before fork-per-request fallback.
const SESSION_FAIL_LIMIT: u32 = 3;

/// Configuration of a toolhost pool for one plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolhostConfig {
    /// The toolhost binary (the host's own binary in practice).
    pub bin: PathBuf,
    /// The plugin shared object the child loads.
    pub plugin: PathBuf,
    /// Number of persistent sessions.
    pub pool_size: usize,
    /// Per-request response timeout.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Limits applied to fork-per-request fallback children.
    pub limits: SpawnLimits,
}

impl ToolhostConfig {
    /// Builds a config with the defaults (pool of 2, 8 s timeout).
    #[must_use]
    pub fn new(bin: impl Into<PathBuf>, plugin: impl Into<PathBuf>) -> Self {
        Self {
            bin: bin.into(),
            plugin: plugin.into(),
            pool_size: 2,
            timeout: Duration::from_secs(8),
            limits: SpawnLimits {
                timeout: Duration::from_secs(8),
                stdout_max_bytes: 512 * 1024,
                cpu_secs: 6,
                as_mb: 1024,
                fsize_mb: 16,
                nofile: 64,
                nproc: 32,
                no_new_privs: true,
            },
        }
    }

    fn serve_argv(&self) -> Vec<String> {
        vec![
            self.bin.to_string_lossy().into_owned(),
            "toolhost".to_string(),
            "serve".to_string(),
            self.plugin.to_string_lossy().into_owned(),
        ]
    }

    fn run_argv(&self, aid: &str) -> Vec<String> {
        vec![
            self.bin.to_string_lossy().into_owned(),
            "toolhost".to_string(),
            "run".to_string(),
            self.plugin.to_string_lossy().into_owned(),
            aid.to_string(),
        ]
    }
}

#[derive(Debug, Default)]
struct Session {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    read_buf: Vec<u8>,
    base: Workspace,
    fail_count: u32,
}

impl Session {
    fn alive(&mut self) -> bool {
        match &mut self.child {
            Some(child) => match child.try_wait() {
                Ok(None) => true,
                // Exited or unknowable: reap state and drop the handles.
                _ => {
                    self.teardown_handles();
                    false
                }
            },
            None => false,
        }
    }

    fn start(&mut self, config: &ToolhostConfig) -> bool {
        self.shutdown();

        let argv = config.serve_argv();
        let (exe, args) = match argv.split_first() {
            Some(pair) => pair,
            None => return false,
        };
        let mut cmd = Command::new(exe);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(err) => {
                tracing::warn!(error = %err, "toolhost session spawn failed");
                return false;
            }
        };
        self.stdin = child.stdin.take();
        self.stdout = child.stdout.take();
        self.child = Some(child);
        self.read_buf.clear();
        self.base = Workspace::new();
        true
    }

    // One request line out, one response line in.
    fn send_receive(&mut self, request: &str, timeout: Duration) -> Option<String> {
        if !self.alive() {
            return None;
        }
        {
            let stdin = self.stdin.as_mut()?;
            stdin.write_all(request.as_bytes()).ok()?;
            stdin.write_all(b"\n").ok()?;
            stdin.flush().ok()?;
        }
        self.read_line(timeout)
    }

    fn read_line(&mut self, timeout: Duration) -> Option<String> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(pos) = self.read_buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.read_buf.drain(..=pos).collect();
                return String::from_utf8(line[..line.len() - 1].to_vec()).ok();
            }
            if self.read_buf.len() > MAX_RESPONSE_BYTES {
                return None;
            }
            if Instant::now() >= deadline {
                return None;
            }
            if !self.poll_readable(deadline) {
                continue;
            }
            let stdout = self.stdout.as_mut()?;
            let mut buf = [0u8; 8192];
            match stdout.read(&mut buf) {
                Ok(0) => return None, // EOF: child closed stdout
                Ok(n) => self.read_buf.extend_from_slice(&buf[..n]),
                Err(_) => return None,
            }
        }
    }

    // Waits (bounded) for the child's stdout to become readable, so the
    // subsequent blocking read cannot stall past the deadline.
    fn poll_readable(&self, deadline: Instant) -> bool {
        #[cfg(unix)]
        {
            use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
            use std::os::fd::AsFd;

            let Some(stdout) = self.stdout.as_ref() else {
                return false;
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            let chunk = u8::try_from(remaining.as_millis().min(100)).unwrap_or(100);
            let mut fds = [PollFd::new(stdout.as_fd(), PollFlags::POLLIN)];
            matches!(poll(&mut fds, PollTimeout::from(chunk)), Ok(n) if n > 0)
        }
        #[cfg(not(unix))]
        {
            let _ = deadline;
            true
        }
    }

    fn teardown_handles(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.wait();
        }
        self.stdin = None;
        self.stdout = None;
        self.read_buf.clear();
    }

    fn shutdown(&mut self) {
        // Closing stdin is the graceful shutdown signal for the serve loop.
        self.stdin = None;
        if let Some(mut child) = self.child.take() {
            std::thread::sleep(Duration::from_millis(50));
            if !matches!(child.try_wait(), Ok(Some(_))) {
                #[cfg(unix)]
                {
                    use nix::sys::signal::{killpg, Signal};
                    use nix::unistd::Pid;
                    if let Ok(pid) = i32::try_from(child.id()) {
                        let _ = killpg(Pid::from_raw(pid), Signal::SIGTERM);
                    }
                }
                std::thread::sleep(Duration::from_millis(100));
                if !matches!(child.try_wait(), Ok(Some(_))) {
                    kill_group(&mut child);
                }
            }
            let _ = child.wait();
        }
        self.stdout = None;
        self.read_buf.clear();
        self.base = Workspace::new();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    status: String,
    #[serde(default)]
    output_json: String,
    #[serde(default)]
    error: String,
    #[serde(default)]
    ds_state: Option<WorkspaceDelta>,
}

/// Pool of persistent toolhost sessions for one plugin.
pub struct SessionPool {
    config: ToolhostConfig,
    sessions: Vec<Mutex<Session>>,
    in_use: Mutex<Vec<bool>>,
    cv: Condvar,
}

impl SessionPool {
    /// Creates a pool of `config.pool_size` (at least one) idle sessions;
    /// children spawn lazily on first use.
    #[must_use]
    pub fn new(config: ToolhostConfig) -> Self {
        let size = config.pool_size.max(1);
        Self {
            config,
            sessions: (0..size).map(|_| Mutex::new(Session::default())).collect(),
            in_use: Mutex::new(vec![false; size]),
            cv: Condvar::new(),
        }
    }

    fn acquire(&self) -> usize {
        let mut in_use = self.in_use.lock().expect("pool lock");
        loop {
            if let Some(idx) = in_use.iter().position(|b| !b) {
                in_use[idx] = true;
                return idx;
            }
            in_use = self.cv.wait(in_use).expect("pool lock");
        }
    }

    fn release(&self, idx: usize) {
        self.in_use.lock().expect("pool lock")[idx] = false;
        self.cv.notify_one();
    }

    /// Executes one tool call through the pool, blocking for a session
    /// lease if all are busy.
    ///
    /// The response delta is applied to the *caller's* workspace, then the
    /// session's base is updated to the post-apply state.
    pub fn run_tool(&self, aid: &str, input_json: &str, workspace: &mut Workspace) -> ToolResult {
        self.run_tool_keyed(aid, input_json, workspace, None, None)
    }

    /// [`Self::run_tool`] with an optional idempotency key and lease token
    /// forwarded on the wire.
    pub fn run_tool_keyed(
        &self,
        aid: &str,
        input_json: &str,
        workspace: &mut Workspace,
        idempotency_key: Option<&str>,
        lease_token: Option<&str>,
    ) -> ToolResult {
        let idx = self.acquire();
        let result = {
            let mut session = self.sessions[idx].lock().expect("session lock");
            self.run_on_session(&mut session, aid, input_json, workspace, idempotency_key, lease_token)
        };
        self.release(idx);
        result
    }

    fn run_on_session(
        &self,
        session: &mut Session,
        aid: &str,
        input_json: &str,
        workspace: &mut Workspace,
        idempotency_key: Option<&str>,
        lease_token: Option<&str>,
    ) -> ToolResult {
        let usable = session.alive()
            || (session.fail_count < SESSION_FAIL_LIMIT && session.start(&self.config));

        if usable {
            let mut request = serde_json::json!({
                "aid": aid,
                "input_json": input_json,
                "ds_state": WorkspaceDelta::encode(workspace, &session.base),
            });
            if let Some(key) = idempotency_key {
                request["idempotency_key"] = serde_json::json!(key);
            }
            if let Some(token) = lease_token {
                request["_lease_token"] = serde_json::json!(token);
            }

            if let Some(line) = session.send_receive(&request.to_string(), self.config.timeout) {
                if let Ok(resp) = serde_json::from_str::<WireResponse>(&line) {
                    // A parsed response means the serve round trip worked;
                    // the fallback threshold counts consecutive failures
                    // only.
                    session.fail_count = 0;
                    if !resp.ok {
                        return ToolResult::error(if resp.error.is_empty() {
                            "toolhost rejected request".to_string()
                        } else {
                            resp.error
                        });
                    }
                    if let Some(delta) = &resp.ds_state {
                        delta.apply(workspace);
                    }
                    session.base = workspace.clone();
                    return ToolResult {
                        status: StepStatus::from_wire(&resp.status),
                        output_json: if resp.output_json.is_empty() {
                            "{}".to_string()
                        } else {
                            resp.output_json
                        },
                        error: resp.error,
                    };
                }
            }
            // Session failed mid-call: tear it down and fall through.
            session.shutdown();
            session.fail_count += 1;
            tracing::warn!(aid, fail_count = session.fail_count, "toolhost session failed");
        }

        self.run_forked(aid, input_json, workspace)
    }

    // Fork-per-request fallback: one child per call, full workspace on the
    // wire, no delta tracking.
    fn run_forked(&self, aid: &str, input_json: &str, workspace: &mut Workspace) -> ToolResult {
        let request = serde_json::json!({
            "input_json": input_json,
            "ds_state": full_state_json(workspace),
        });
        let argv = self.config.run_argv(aid);
        let capture = match run_capture_stdin(&argv, None, &request.to_string(), &self.config.limits)
        {
            Ok(c) => c,
            Err(err) => return ToolResult::error(format!("toolhost launch failed: {err}")),
        };
        if capture.timed_out {
            return ToolResult::error(format!("toolhost timed out for {aid}"));
        }
        if capture.exit_code != 0 {
            return ToolResult::error(format!(
                "toolhost exit_code={}: {}",
                capture.exit_code,
                capture.output.trim()
            ));
        }
        let Ok(resp) = serde_json::from_str::<WireResponse>(capture.output.trim()) else {
            return ToolResult::error("toolhost invalid response JSON");
        };
        if !resp.ok {
            return ToolResult::error(resp.error);
        }
        if let Some(delta) = &resp.ds_state {
            delta.apply(workspace);
        }
        ToolResult {
            status: StepStatus::from_wire(&resp.status),
            output_json: if resp.output_json.is_empty() {
                "{}".to_string()
            } else {
                resp.output_json
            },
            error: resp.error,
        }
    }
}

fn full_state_json(workspace: &Workspace) -> serde_json::Value {
    let slots: BTreeMap<u8, &crate::workspace::Artifact> =
        workspace.slots.iter().map(|(k, v)| (*k, v)).collect();
    serde_json::json!({ "slots": slots })
}
