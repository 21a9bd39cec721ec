//! The run state machine: one request in, a journaled terminal outcome out.
//!
//! Each step: reload newly-dropped plugins, derive effective tags from base
//! tags plus state hints, build and capability-filter the menu, hash menu
//! and workspace for loop detection, run the selector pipeline, and act on
//! the blended selection - executing a picked tool inside a transaction,
//! committing on success, rolling back (and possibly retrying) on failure.
//! Every structural event lands in the hash-chained journal.
//!
//! Terminal conditions: goal satisfied (`goal_done`), selector `NOOP` or
//! `ASK_SUP`, invalid-pick budget or step budget exhausted (`breaker`), a
//! repeating `(menu, state)` pair (`loop_guard_triggered`), or an
//! unrecoverable tool error.

mod goal;
mod inputs;
mod replay;

#[cfg(test)]
mod tests;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

pub use goal::{GoalDesc, GoalError, GoalRegistry};
pub use inputs::{merge_unchecked, safe_merge_patch, RESERVED_PREFIXES};
pub use replay::{compute_replay_inputs, replay_inputs_json};

use crate::executor::{Runner, ToolFn, ToolResult};
use crate::genesis::{self, HostServices};
use crate::journal::{Journal, JournalError};
use crate::menu::{build_menu, filter_by_capabilities};
use crate::registry::ToolDesc;
use crate::selector::{blend, ControlMode, SelectionKind, Selector};
use crate::types::{Budget, StepStatus, ASK_SUP_AID, NOOP_AID};
use crate::workspace::{Artifact, Tx, Workspace};

/// Errors that abort a run before or outside the step loop.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RunError {
    /// The request document was unusable.
    #[error("invalid run request: {reason}")]
    InvalidRequest {
        /// Why the request was rejected.
        reason: String,
    },

    /// The journal could not be written; an unjournaled step must not run.
    #[error(transparent)]
    Journal(#[from] JournalError),
}

/// A parsed run request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunRequest {
    /// The goal to satisfy.
    pub goal_id: String,
    /// Base tags seeding menu assembly.
    #[serde(default)]
    pub candidate_tags: Vec<String>,
    /// Initial inputs JSON (an object).
    #[serde(default)]
    pub inputs_json: String,
    /// Selector blending mode.
    #[serde(default)]
    pub control_mode: ControlMode,
    /// Caller-supplied tracing id.
    #[serde(default)]
    pub request_id: String,
    /// Capability allow list (exact AIDs or `PREFIX*` globs).
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    /// Capability block list.
    #[serde(default)]
    pub blocked_tools: Vec<String>,
}

impl RunRequest {
    /// Parses a request document.
    ///
    /// `tag.meta` is always appended to the candidate tags so the menu can
    /// never be entirely empty of meta tools.
    ///
    /// # Errors
    ///
    /// Returns [`RunError::InvalidRequest`] for non-JSON documents or a
    /// missing `goal_id`.
    pub fn from_json(text: &str) -> Result<Self, RunError> {
        let doc: serde_json::Value =
            serde_json::from_str(text).map_err(|e| RunError::InvalidRequest {
                reason: format!("not valid JSON: {e}"),
            })?;
        let goal_id = doc["goal_id"].as_str().unwrap_or_default().to_string();
        if goal_id.is_empty() {
            return Err(RunError::InvalidRequest {
                reason: "missing goal_id".to_string(),
            });
        }

        let mut candidate_tags: Vec<String> = doc["candidate_tags"]
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(ToString::to_string))
                    .collect()
            })
            .unwrap_or_default();
        if !candidate_tags.iter().any(|t| t == "tag.meta") {
            candidate_tags.push("tag.meta".to_string());
        }

        let inputs_json = if doc["inputs"].is_object() {
            doc["inputs"].to_string()
        } else {
            "{}".to_string()
        };

        let caps = &doc["_capabilities"];
        let list = |key: &str| -> Vec<String> {
            caps[key]
                .as_array()
                .map(|a| {
                    a.iter()
                        .filter_map(|v| v.as_str().map(ToString::to_string))
                        .collect()
                })
                .unwrap_or_default()
        };

        Ok(Self {
            goal_id,
            candidate_tags,
            inputs_json,
            control_mode: ControlMode::from_wire(doc["control_mode"].as_str().unwrap_or_default()),
            request_id: doc["request_id"].as_str().unwrap_or_default().to_string(),
            allowed_tools: list("allowed_tools"),
            blocked_tools: list("blocked_tools"),
        })
    }
}

/// Step-loop tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Step and invalid-pick budgets.
    pub budget: Budget,
    /// Cap on Genesis compile-error retries.
    pub genesis_compile_retries_max: u32,
    /// Repair `MISSING_TOOL` errors via Genesis instead of failing.
    pub auto_genesis_on_missing: bool,
    /// Synthesize a stub plugin for the missing AID during repair.
    pub auto_genesis_autostub: bool,
    /// Whitelist for selector input patches; empty admits any
    /// non-reserved key.
    pub input_patch_whitelist: Vec<String>,
    /// Repeats of the same `(menu, state)` pair tolerated before the loop
    /// guard trips.
    pub loop_guard_limit: u32,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            budget: Budget::default(),
            genesis_compile_retries_max: 3,
            auto_genesis_on_missing: false,
            auto_genesis_autostub: false,
            input_patch_whitelist: Vec::new(),
            loop_guard_limit: 3,
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The goal's completion predicate held.
    GoalDone,
    /// The selector chose NOOP.
    Noop,
    /// The selector asked for supervision; the help request was stored.
    AskSup,
    /// A budget or breaker ended the run.
    Breaker(String),
    /// The loop guard detected a repeating state.
    LoopGuard,
    /// A tool failed unrecoverably.
    ToolError {
        /// The failing tool.
        aid: String,
        /// Its error text.
        error: String,
    },
}

impl RunOutcome {
    /// Operator-visible exit code.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::GoalDone | Self::Noop | Self::AskSup => 0,
            Self::Breaker(_) | Self::LoopGuard | Self::ToolError { .. } => 1,
        }
    }
}

/// One tool invocation's footprint in the report.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    /// Tool id.
    pub aid: String,
    /// Whether it succeeded.
    pub ok: bool,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

/// The result of executing one run.
#[derive(Debug)]
pub struct RunReport {
    /// Terminal outcome.
    pub outcome: RunOutcome,
    /// Steps executed.
    pub steps: u32,
    /// Final workspace state.
    pub state: Workspace,
    /// Per-tool invocation records.
    pub invocations: Vec<ToolInvocation>,
    /// Journal file path.
    pub journal_path: PathBuf,
}

/// The step-loop driver. One instance serves many runs; per-run state lives
/// on the stack of [`StepLoop::execute`].
pub struct StepLoop {
    host: Arc<HostServices>,
    goals: GoalRegistry,
    config: RunConfig,
    /// Directory the request document came from (for replay-input path
    /// resolution).
    pub request_dir: PathBuf,
}

impl StepLoop {
    /// Creates a driver over the host services and goal registry.
    #[must_use]
    pub fn new(host: Arc<HostServices>, goals: GoalRegistry, config: RunConfig) -> Self {
        let request_dir = host.root.clone();
        Self {
            host,
            goals,
            config,
            request_dir,
        }
    }

    /// The goal registry (for registration before runs start).
    pub fn goals_mut(&mut self) -> &mut GoalRegistry {
        &mut self.goals
    }

    fn state_flags(state: &Workspace) -> (bool, bool, bool, bool, String) {
        let ds6_stage = state
            .get(genesis::STAGE_SLOT)
            .and_then(|a| serde_json::from_str::<serde_json::Value>(&a.content_json).ok())
            .and_then(|v| v["stage"].as_str().map(ToString::to_string))
            .unwrap_or_default();
        (
            state.has(0),
            state.has(2),
            state.has(genesis::STAGE_SLOT),
            state.has(genesis::RESULT_SLOT),
            ds6_stage,
        )
    }

    fn effective_tags(&self, request: &RunRequest, ds0: bool, ds2: bool) -> Vec<String> {
        let mut tags = request.candidate_tags.clone();
        if request.goal_id.starts_with("goal.GENESIS") {
            tags.push("tag.genesis".to_string());
            tags.push("tag.runtime".to_string());
            tags.push("tag.meta".to_string());
        }
        if ds0 && !ds2 {
            tags.push("tag.report".to_string());
        }
        tags.sort();
        tags.dedup();
        tags
    }

    /// Executes one run to a terminal outcome.
    ///
    /// # Errors
    ///
    /// Returns [`RunError::Journal`] when the journal cannot be written;
    /// an unjournaled step never executes, so the run stops there.
    pub fn execute(
        &self,
        request: &RunRequest,
        selector: &mut dyn Selector,
        journal: &mut Journal,
    ) -> Result<RunReport, RunError> {
        let mut state = Workspace::new();
        let mut inputs = if request.inputs_json.is_empty() {
            "{}".to_string()
        } else {
            request.inputs_json.clone()
        };
        let mut invalid: u32 = 0;
        let mut compile_retries: u32 = 0;
        let mut autostub_done: HashSet<String> = HashSet::new();
        let mut loop_guard: HashMap<String, u32> = HashMap::new();
        let mut invocations = Vec::new();

        let report = |outcome: RunOutcome, steps: u32, state: Workspace, invocations: Vec<ToolInvocation>, journal: &Journal| RunReport {
            outcome,
            steps,
            state,
            invocations,
            journal_path: journal.path().to_path_buf(),
        };

        for step in 0..self.config.budget.max_steps {
            let (ds0, ds2, ds6, ds7, ds6_stage) = Self::state_flags(&state);

            // Newly-dropped plugins become visible between steps.
            {
                let mut plugins = self.host.plugins.lock().expect("plugin manager lock");
                let (newly, perr) = plugins.load_new_from_dir(
                    &self.host.plugin_root(),
                    &self.host.registry,
                    &self.host.runner,
                    self.host.allow_override,
                );
                if newly > 0 || perr.is_some() {
                    journal.event(
                        step,
                        "plugins_reload",
                        &json!({
                            "newly_loaded": newly,
                            "error": perr.map(|e| e.to_string()).unwrap_or_default(),
                        })
                        .to_string(),
                    )?;
                }
            }

            let step_tags = self.effective_tags(request, ds0, ds2);

            let menu = {
                let registry = self.host.registry.read().expect("registry lock");
                build_menu(&registry, &step_tags)
            };
            let menu = if request.allowed_tools.is_empty() && request.blocked_tools.is_empty() {
                menu
            } else {
                filter_by_capabilities(&menu, &request.allowed_tools, &request.blocked_tools)
            };

            let menu_digest = menu.digest();
            let menu_digest_fast = menu.digest_fast();
            let state_digest = state.digest();
            let state_digest_fast = state.digest_fast();

            {
                let key = format!("{menu_digest_fast}|{state_digest_fast}");
                let count = loop_guard.entry(key).or_insert(0);
                *count += 1;
                if *count > self.config.loop_guard_limit {
                    journal.event(
                        step,
                        "loop_guard_triggered",
                        &json!({
                            "count": *count,
                            "menu_digest_fast": menu_digest_fast,
                            "state_digest_fast": state_digest_fast,
                        })
                        .to_string(),
                    )?;
                    return Ok(report(RunOutcome::LoopGuard, step, state, invocations, journal));
                }
            }

            let flags = format!(
                "FLAGS:DS0={};DS2={};DS6={};DS7={};DS6_STAGE={ds6_stage};",
                u8::from(ds0),
                u8::from(ds2),
                u8::from(ds6),
                u8::from(ds7)
            );
            let mut goal_context = format!("{}|{flags}", request.goal_id);
            for tag in &step_tags {
                goal_context.push('|');
                goal_context.push_str(tag);
            }

            journal.event(
                step,
                "menu_built",
                &json!({
                    "goal_id": request.goal_id,
                    "candidate_tags": step_tags,
                    "base_candidate_tags": request.candidate_tags,
                    "flags": flags,
                    "menu_digest": menu_digest,
                    "menu_digest_fast": menu_digest_fast,
                    "state_digest": state_digest,
                    "state_digest_fast": state_digest_fast,
                })
                .to_string(),
            )?;

            // Fallback and policy selections against the same menu; in
            // FALLBACK_ONLY mode the policy hook is not invoked and its
            // journaled raw is the fallback's.
            let fallback = selector.select(
                &menu,
                &goal_context,
                &state_digest,
                ControlMode::FallbackOnly,
                &inputs,
            );
            let policy_mode = if request.control_mode == ControlMode::FallbackOnly {
                ControlMode::FallbackOnly
            } else {
                ControlMode::PolicyOnly
            };
            let policy = selector.select(&menu, &goal_context, &state_digest, policy_mode, &inputs);

            journal.event(step, "selector_fallback_raw", &json!({"raw": fallback.raw}).to_string())?;
            journal.event(step, "selector_policy_raw", &json!({"raw": policy.raw}).to_string())?;

            let picked = blend(request.control_mode, fallback, policy);
            journal.event(
                step,
                "selector_chosen",
                &json!({
                    "control_mode": request.control_mode.as_str(),
                    "raw": picked.raw,
                })
                .to_string(),
            )?;

            if let SelectionKind::Pick {
                input_patch: Some(patch),
                ..
            } = &picked.kind
            {
                let merged = safe_merge_patch(&inputs, patch, &self.config.input_patch_whitelist);
                journal.event(
                    step,
                    "inputs_patched",
                    &json!({
                        "patch": serde_json::from_str::<serde_json::Value>(patch)
                            .unwrap_or(serde_json::Value::Null),
                        "inputs": serde_json::from_str::<serde_json::Value>(&merged)
                            .unwrap_or(serde_json::Value::Null),
                    })
                    .to_string(),
                )?;
                inputs = merged;
            }

            match picked.kind {
                SelectionKind::Invalid => {
                    invalid += 1;
                    journal.event(step, "invalid_pick", &json!({"count": invalid}).to_string())?;
                    if invalid > self.config.budget.max_invalid_picks {
                        journal.event(step, "breaker", r#"{"reason":"max_invalid_picks"}"#)?;
                        return Ok(report(
                            RunOutcome::Breaker("max_invalid_picks".to_string()),
                            step,
                            state,
                            invocations,
                            journal,
                        ));
                    }
                    continue;
                }
                SelectionKind::Noop => {
                    journal.event(step, "noop", "{}")?;
                    return Ok(report(RunOutcome::Noop, step, state, invocations, journal));
                }
                SelectionKind::AskSup => {
                    let mut tx = Tx::new(&state);
                    let ask_inputs = r#"{"question":"Need clarification"}"#;
                    let started = Instant::now();
                    let result = self.host.runner.run(ASK_SUP_AID, ask_inputs, tx.tmp());
                    let duration_ms = started.elapsed().as_millis() as u64;
                    let tx_patch = if result.status == StepStatus::Ok {
                        tx.commit(&mut state)
                    } else {
                        tx.rollback();
                        "[]".to_string()
                    };
                    journal.event(
                        step,
                        "ask_sup",
                        &json!({
                            "status": "ok",
                            "duration_ms": duration_ms,
                            "ds_digest": state.digest(),
                            "ds_digest_fast": state.digest_fast(),
                            "tx_patch": serde_json::from_str::<serde_json::Value>(&tx_patch)
                                .unwrap_or(serde_json::Value::Null),
                        })
                        .to_string(),
                    )?;
                    return Ok(report(RunOutcome::AskSup, step, state, invocations, journal));
                }
                SelectionKind::Pick { sid, .. } => {
                    let Some(item) = menu.resolve(sid).cloned() else {
                        invalid += 1;
                        journal.event(
                            step,
                            "invalid_pick",
                            &json!({
                                "reason": "sid_not_in_menu",
                                "sid": sid.to_wire(),
                                "count": invalid,
                            })
                            .to_string(),
                        )?;
                        if invalid > self.config.budget.max_invalid_picks {
                            journal.event(step, "breaker", r#"{"reason":"max_invalid_picks"}"#)?;
                            return Ok(report(
                                RunOutcome::Breaker("max_invalid_picks".to_string()),
                                step,
                                state,
                                invocations,
                                journal,
                            ));
                        }
                        continue;
                    };

                    let desc = {
                        let registry = self.host.registry.read().expect("registry lock");
                        registry.get(&item.aid).cloned()
                    };
                    let deterministic = desc.as_ref().map_or(true, |d| d.deterministic);
                    let replay = desc
                        .as_ref()
                        .filter(|d| !d.replay_inputs.is_empty())
                        .map(|d| {
                            compute_replay_inputs(d, &inputs, &self.request_dir, &self.host.root)
                        })
                        .unwrap_or_default();

                    let mut tx = Tx::new(&state);
                    let started = Instant::now();
                    let result = self.host.runner.run(&item.aid, &inputs, tx.tmp());
                    let duration_ms = started.elapsed().as_millis() as u64;

                    if result.status == StepStatus::Ok {
                        let tx_patch = tx.commit(&mut state);
                        invocations.push(ToolInvocation {
                            aid: item.aid.clone(),
                            ok: true,
                            duration_ms,
                        });
                        journal.event(
                            step,
                            "tool_ok",
                            &json!({
                                "aid": item.aid,
                                "deterministic": deterministic,
                                "duration_ms": duration_ms,
                                "replay_inputs": replay,
                                "ds_digest": state.digest(),
                                "ds_digest_fast": state.digest_fast(),
                                "tx_patch": serde_json::from_str::<serde_json::Value>(&tx_patch)
                                    .unwrap_or(serde_json::Value::Null),
                            })
                            .to_string(),
                        )?;

                        if self.goals.is_complete(&request.goal_id, &state) {
                            journal.event(
                                step,
                                "goal_done",
                                &json!({"goal_id": request.goal_id}).to_string(),
                            )?;
                            for (slot, artifact) in &state.slots {
                                tracing::info!(slot, content = %artifact.content_json, "goal artifact");
                            }
                            return Ok(report(
                                RunOutcome::GoalDone,
                                step,
                                state,
                                invocations,
                                journal,
                            ));
                        }
                        continue;
                    }

                    // TOOL_ERROR path. The compile stage's diagnostics live
                    // in the tmp workspace and must be captured before the
                    // rollback discards them.
                    let compile_error_json = (item.aid == genesis::AID_COMPILE_SHARED)
                        .then(|| {
                            tx.tmp_ref()
                                .get(genesis::RESULT_SLOT)
                                .map(|a| a.content_json.clone())
                        })
                        .flatten();
                    tx.rollback();
                    invocations.push(ToolInvocation {
                        aid: item.aid.clone(),
                        ok: false,
                        duration_ms,
                    });
                    journal.event(
                        step,
                        "tool_error",
                        &json!({
                            "aid": item.aid,
                            "deterministic": deterministic,
                            "duration_ms": duration_ms,
                            "replay_inputs": replay,
                            "err": result.error,
                        })
                        .to_string(),
                    )?;

                    if item.aid == genesis::AID_COMPILE_SHARED {
                        compile_retries += 1;
                        if compile_retries <= self.config.genesis_compile_retries_max {
                            if let Some(error_json) = compile_error_json {
                                inputs = merge_unchecked(
                                    &inputs,
                                    &json!({ "_system_compile_error":
                                        serde_json::from_str::<serde_json::Value>(&error_json)
                                            .unwrap_or(serde_json::Value::String(error_json.clone()))
                                    })
                                    .to_string(),
                                );
                            }
                            journal.event(
                                step,
                                "genesis_compile_retry",
                                &json!({
                                    "retry": compile_retries,
                                    "max": self.config.genesis_compile_retries_max,
                                })
                                .to_string(),
                            )?;
                            continue;
                        }
                        // Retries exhausted: fall through to the terminal
                        // error handling below.
                    }

                    if let Some(missing_aid) = result.missing_tool_aid() {
                        if self.config.auto_genesis_on_missing {
                            let missing_aid = missing_aid.to_string();
                            self.record_missing_tool_diag(&mut state, &missing_aid, step);
                            if self.config.auto_genesis_autostub
                                && autostub_done.insert(missing_aid.clone())
                            {
                                self.run_autostub(&missing_aid, &mut state, step, journal)?;
                            }
                            continue;
                        }
                    }

                    return Ok(report(
                        RunOutcome::ToolError {
                            aid: item.aid,
                            error: result.error,
                        },
                        step,
                        state,
                        invocations,
                        journal,
                    ));
                }
            }
        }

        journal.event(self.config.budget.max_steps, "breaker", r#"{"reason":"max_steps"}"#)?;
        Ok(report(
            RunOutcome::Breaker("max_steps".to_string()),
            self.config.budget.max_steps,
            state,
            invocations,
            journal,
        ))
    }

    fn record_missing_tool_diag(&self, state: &mut Workspace, missing_aid: &str, step: u32) {
        let mut tx = Tx::new(state);
        let content = json!({
            "stage": "MISSING_TOOL",
            "missing_aid": missing_aid,
            "at_step": step,
            "ts_ms": crate::types::now_ms(),
        })
        .to_string();
        let _ = tx
            .tmp()
            .put(genesis::STAGE_SLOT, Artifact::new("system_diag", "runner", content));
        let _ = tx.commit(state);
    }

    // Synthesizes a stub plugin for a missing AID and runs the Genesis
    // write→compile→load ladder inline.
    fn run_autostub(
        &self,
        missing_aid: &str,
        state: &mut Workspace,
        step: u32,
        journal: &mut Journal,
    ) -> Result<(), RunError> {
        let base = format!(
            "autostub_{}",
            crate::hash::hex64(crate::hash::fnv1a64(missing_aid.as_bytes()))
        );
        let source = autostub_source(missing_aid, &base);
        let rel_cpp = format!("{base}.cpp");

        let stages: [(&str, &str, String); 3] = [
            (
                genesis::AID_WRITE_FILE,
                "genesis_autostub_write",
                json!({"relative_path": rel_cpp, "content": source, "overwrite": true}).to_string(),
            ),
            (
                genesis::AID_COMPILE_SHARED,
                "genesis_autostub_compile",
                json!({"src_relative_path": rel_cpp, "out_name": base}).to_string(),
            ),
            (
                genesis::AID_LOAD_PLUGIN,
                "genesis_autostub_load",
                json!({"out_name": base}).to_string(),
            ),
        ];

        for (aid, event, stage_inputs) in stages {
            let mut tx = Tx::new(state);
            let result = self.host.runner.run(aid, &stage_inputs, tx.tmp());
            let ok = result.status == StepStatus::Ok;
            if ok {
                let _ = tx.commit(state);
            } else {
                tx.rollback();
            }
            journal.event(
                step,
                event,
                &json!({"ok": ok, "err": result.error}).to_string(),
            )?;
            if !ok {
                break;
            }
        }
        Ok(())
    }
}

// A self-contained plugin source for the missing AID: no includes (the
// guard bans most headers), ABI structs declared inline, and a static
// response buffer so no allocator crosses the boundary.
fn autostub_source(missing_aid: &str, base: &str) -> String {
    let desc = json!({
        "aid": missing_aid,
        "name": base,
        "deterministic": true,
        "tags": ["tag.runtime", "tag.meta", "tag.autostub"],
        "side_effects": ["none"],
        "replay_inputs": [],
    })
    .to_string();
    let desc_escaped = desc.replace('\\', "\\\\").replace('"', "\\\"");

    format!(
        r#"typedef char* (*machina_tool_fn)(const char*, const char*);

struct MachinaRegistrar {{
    void* ctx;
    void (*register_tool)(void* ctx, const char* desc_json, machina_tool_fn tool);
}};

namespace {{
char g_response[] =
    "{{\"status\":\"OK\",\"output_json\":\"{{\\\"ok\\\":true,\\\"autostub\\\":true,\\\"note\\\":\\\"not implemented\\\"}}\",\"error\":\"\"}}";

char* stub_tool(const char*, const char*) {{
    return g_response;
}}
}} // namespace

extern "C" int machina_plugin_abi_version() {{ return 1; }}

extern "C" void machina_plugin_init(MachinaRegistrar* host) {{
    host->register_tool(host->ctx, "{desc_escaped}", &stub_tool);
}}
"#
    )
}

/// Registers the built-in meta tools the step loop depends on: the NOOP
/// menu terminator and the ASK_SUP help-request tool (which stores the
/// question as a DS5 artifact).
pub fn register_meta_tools(host: &HostServices) {
    let mut registry = host.registry.write().expect("registry lock");
    let _ = registry.register(
        ToolDesc {
            aid: NOOP_AID.to_string(),
            name: "noop".to_string(),
            deterministic: true,
            tags: vec!["tag.meta".to_string()],
            side_effects: vec!["none".to_string()],
            replay_inputs: vec![],
        },
        true,
    );
    let _ = registry.register(
        ToolDesc {
            aid: ASK_SUP_AID.to_string(),
            name: "ask supervisor".to_string(),
            deterministic: true,
            tags: vec!["tag.meta".to_string()],
            side_effects: vec!["none".to_string()],
            replay_inputs: vec![],
        },
        true,
    );
    drop(registry);

    host.runner.register(
        NOOP_AID,
        Arc::new(|_: &str, _: &mut Workspace| ToolResult::ok(r#"{"ok":true}"#)) as ToolFn,
    );
    host.runner.register(
        ASK_SUP_AID,
        Arc::new(|input: &str, ws: &mut Workspace| {
            let _ = ws.put(5, Artifact::new("help_request", "runner", input.to_string()));
            ToolResult::ok(r#"{"ok":true,"stored":true}"#)
        }) as ToolFn,
    );
}

/// Registers the three Genesis stage tools against `host`.
pub fn register_genesis_tools(host: &Arc<HostServices>) {
    let descs = [
        (genesis::AID_WRITE_FILE, "genesis write file"),
        (genesis::AID_COMPILE_SHARED, "genesis compile shared"),
        (genesis::AID_LOAD_PLUGIN, "genesis load plugin"),
    ];
    {
        let mut registry = host.registry.write().expect("registry lock");
        for (aid, name) in descs {
            let _ = registry.register(
                ToolDesc {
                    aid: aid.to_string(),
                    name: name.to_string(),
                    deterministic: false,
                    tags: vec!["tag.genesis".to_string()],
                    side_effects: vec!["file_write".to_string(), "process".to_string()],
                    replay_inputs: vec![],
                },
                true,
            );
        }
    }

    let h = Arc::clone(host);
    host.runner.register(
        genesis::AID_WRITE_FILE,
        Arc::new(move |input: &str, ws: &mut Workspace| genesis::tools::write_file(&h, input, ws))
            as ToolFn,
    );
    let h = Arc::clone(host);
    host.runner.register(
        genesis::AID_COMPILE_SHARED,
        Arc::new(move |input: &str, ws: &mut Workspace| {
            genesis::tools::compile_shared(&h, input, ws)
        }) as ToolFn,
    );
    let h = Arc::clone(host);
    host.runner.register(
        genesis::AID_LOAD_PLUGIN,
        Arc::new(move |input: &str, ws: &mut Workspace| genesis::tools::load_plugin(&h, input, ws))
            as ToolFn,
    );
}
