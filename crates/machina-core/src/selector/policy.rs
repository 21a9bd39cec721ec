//! External policy selector: a sandboxed subprocess wrapped around a
//! fallback, with a circuit breaker.
//!
//! The policy command is allow-listed twice before anything runs: argv[0]'s
//! basename must appear in the executable allow list, and when argv[1] looks
//! like a script (`.py`/`.sh`/`.js`) it must resolve under the allowed
//! script root. The payload travels through a temp file whose path is
//! appended as the last argv element; the child's stdout is parsed as a
//! selector output and a PICK is cross-checked against the current menu.
//!
//! Any failure - spawn, timeout, nonzero exit, empty output, parse failure,
//! unknown SID - counts as one policy fault and yields the fallback's
//! selection with the failure annotated into the raw text. After
//! `fail_threshold` consecutive faults the breaker opens for `cooldown`;
//! while open, the fallback answers directly. One success closes the
//! breaker and resets the fault counter.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{parse_selector_output, ControlMode, Selection, SelectionKind, Selector};
use crate::menu::Menu;
use crate::process::{run_capture, split_argv, SpawnLimits};

/// Configuration of the external policy hook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// The policy command line; empty disables the external hook entirely.
    pub command: String,
    /// Allowed argv[0] basenames (lowercased comparison).
    pub allowed_exe: Vec<String>,
    /// Root under which script arguments must resolve.
    pub script_root: PathBuf,
    /// Disables the allow-list checks (dev only).
    pub allow_unsafe: bool,
    /// Subprocess limits for each policy invocation.
    pub limits: SpawnLimits,
    /// Consecutive faults that open the breaker.
    pub fail_threshold: u32,
    /// How long the breaker stays open.
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            allowed_exe: ["python3", "python", "bash", "sh", "node"]
                .iter()
                .map(ToString::to_string)
                .collect(),
            script_root: PathBuf::from("policies"),
            allow_unsafe: false,
            limits: SpawnLimits {
                timeout: Duration::from_millis(2500),
                stdout_max_bytes: 64 * 1024,
                cpu_secs: 2,
                as_mb: 768,
                fsize_mb: 10,
                nofile: 64,
                nproc: 32,
                no_new_privs: true,
            },
            fail_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// The policy selector. Wraps a fallback selector that answers whenever the
/// policy is disabled, failing, or circuit-broken.
pub struct PolicySelector {
    fallback: Box<dyn Selector>,
    config: PolicyConfig,
    argv: Vec<String>,
    consecutive_faults: AtomicU32,
    disabled_until_ms: AtomicI64,
}

impl PolicySelector {
    /// Builds the selector; the command line is tokenized once up front.
    #[must_use]
    pub fn new(fallback: Box<dyn Selector>, config: PolicyConfig) -> Self {
        let argv = split_argv(&config.command);
        Self {
            fallback,
            config,
            argv,
            consecutive_faults: AtomicU32::new(0),
            disabled_until_ms: AtomicI64::new(0),
        }
    }

    /// Whether the breaker is currently open.
    #[must_use]
    pub fn breaker_open(&self) -> bool {
        self.disabled_until_ms.load(Ordering::SeqCst) > crate::types::now_ms()
    }

    fn allowlist_violation(&self) -> Option<String> {
        if self.config.allow_unsafe {
            return None;
        }
        let exe = Path::new(&self.argv[0])
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if !self
            .config
            .allowed_exe
            .iter()
            .any(|a| a.to_lowercase() == exe)
        {
            return Some(format!("policy exe not allowed: {exe}"));
        }

        if let Some(script) = self.argv.get(1) {
            let p = Path::new(script);
            let ext = p
                .extension()
                .map(|e| e.to_string_lossy().to_lowercase())
                .unwrap_or_default();
            if matches!(ext.as_str(), "py" | "sh" | "js") {
                let resolved = p
                    .canonicalize()
                    .unwrap_or_else(|_| p.to_path_buf());
                let root = self
                    .config
                    .script_root
                    .canonicalize()
                    .unwrap_or_else(|_| self.config.script_root.clone());
                if !resolved.starts_with(&root) {
                    return Some(format!(
                        "policy script path not allowed: {}",
                        resolved.display()
                    ));
                }
            }
        }
        None
    }

    fn payload_json(
        menu: &Menu,
        goal_context: &str,
        state_digest: &str,
        mode: ControlMode,
        inputs_json: &str,
    ) -> String {
        let menu_items: Vec<serde_json::Value> = menu
            .items
            .iter()
            .map(|i| {
                serde_json::json!({
                    "sid": i.sid.to_wire(),
                    "aid": i.aid,
                    "name": i.name,
                    "tags": i.tags,
                })
            })
            .collect();
        let mut payload = serde_json::json!({
            "goal_digest": goal_context,
            "state_digest": state_digest,
            "control_mode": mode.as_str(),
            "menu": menu_items,
        });
        if let Ok(serde_json::Value::Object(inputs)) = serde_json::from_str(inputs_json) {
            payload["inputs"] = serde_json::Value::Object(inputs);
        }
        payload.to_string()
    }

    fn fault(
        &mut self,
        why: &str,
        menu: &Menu,
        goal_context: &str,
        state_digest: &str,
        inputs_json: &str,
    ) -> Selection {
        let faults = self.consecutive_faults.fetch_add(1, Ordering::SeqCst) + 1;
        if faults >= self.config.fail_threshold {
            let until = crate::types::now_ms()
                + i64::try_from(self.config.cooldown.as_millis()).unwrap_or(i64::MAX);
            self.disabled_until_ms.store(until, Ordering::SeqCst);
            tracing::warn!(faults, why, "policy breaker opened");
        } else {
            tracing::debug!(faults, why, "policy fault");
        }

        // INVALID would hard-fail the whole run in POLICY_ONLY mode; the
        // fallback's answer with the failure annotated keeps it alive.
        let mut fb = self.fallback.select(
            menu,
            goal_context,
            state_digest,
            ControlMode::FallbackOnly,
            inputs_json,
        );
        fb.raw = format!("[policy_failure]{why}\n{}", fb.raw);
        fb
    }

    fn invoke_policy(
        &mut self,
        menu: &Menu,
        goal_context: &str,
        state_digest: &str,
        mode: ControlMode,
        inputs_json: &str,
    ) -> Selection {
        if let Some(violation) = self.allowlist_violation() {
            return Selection::invalid(violation);
        }

        let payload = Self::payload_json(menu, goal_context, state_digest, mode, inputs_json);
        let payload_path = std::env::temp_dir().join(format!(
            "machina_policy_payload_{}.json",
            uuid::Uuid::new_v4().simple()
        ));
        if std::fs::write(&payload_path, &payload).is_err() {
            return self.fault(
                "payload write failed",
                menu,
                goal_context,
                state_digest,
                inputs_json,
            );
        }

        let mut argv = self.argv.clone();
        argv.push(payload_path.to_string_lossy().into_owned());
        let outcome = run_capture(&argv, None, &self.config.limits);
        let _ = std::fs::remove_file(&payload_path);

        let result = match outcome {
            Ok(r) => r,
            Err(err) => {
                let why = format!("policy not started: {err}");
                return self.fault(&why, menu, goal_context, state_digest, inputs_json);
            }
        };
        if result.timed_out {
            return self.fault("policy timed out", menu, goal_context, state_digest, inputs_json);
        }
        if result.exit_code != 0 {
            let why = format!("policy exit_code={}", result.exit_code);
            return self.fault(&why, menu, goal_context, state_digest, inputs_json);
        }
        let text = result.output.trim();
        if text.is_empty() {
            return self.fault("empty policy output", menu, goal_context, state_digest, inputs_json);
        }

        let parsed = parse_selector_output(text);
        if parsed.kind == SelectionKind::Invalid {
            return self.fault("invalid policy output", menu, goal_context, state_digest, inputs_json);
        }
        if let Some(sid) = parsed.sid() {
            if menu.resolve(sid).is_none() {
                let why = format!("policy picked non-existent sid: {}", sid.to_wire());
                return self.fault(&why, menu, goal_context, state_digest, inputs_json);
            }
        }

        self.consecutive_faults.store(0, Ordering::SeqCst);
        self.disabled_until_ms.store(0, Ordering::SeqCst);
        parsed
    }
}

impl Selector for PolicySelector {
    fn select(
        &mut self,
        menu: &Menu,
        goal_context: &str,
        state_digest: &str,
        mode: ControlMode,
        inputs_json: &str,
    ) -> Selection {
        if mode == ControlMode::FallbackOnly || self.argv.is_empty() {
            return self.fallback.select(
                menu,
                goal_context,
                state_digest,
                ControlMode::FallbackOnly,
                inputs_json,
            );
        }

        if self.breaker_open() {
            let mut fb = self.fallback.select(
                menu,
                goal_context,
                state_digest,
                ControlMode::FallbackOnly,
                inputs_json,
            );
            fb.raw = format!("[policy_breaker_open]\n{}", fb.raw);
            return fb;
        }

        self.invoke_policy(menu, goal_context, state_digest, mode, inputs_json)
    }
}
