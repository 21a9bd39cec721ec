//! The toolhost serve protocol: NDJSON request/response over stdin/stdout.
//!
//! One persistent child per plugin. Each request line is a JSON object;
//! each response is exactly one JSON line. An empty line or EOF terminates
//! the server. Three request shapes:
//!
//! - `{aid, input_json, ds_state, idempotency_key?, _lease_token?}` - a
//!   normal tool call
//! - `{aid: "_lease.issue", tool_aid, tier, ttl_ms?}` - mint a lease
//! - `{aid: "_lease.gc"}` - GC expired leases, return counters
//!
//! The server keeps a session workspace across requests for delta tracking:
//! incoming `ds_state` (delta or full) is applied to it, the tool runs
//! against it, and the response carries only the slots the call changed.

use std::collections::HashMap;
use std::io::{BufRead, Write};

use serde::Deserialize;
use serde_json::json;

use super::{IdempotencyCache, LeaseManager, ToolFn, ToolResult};
use crate::registry::ToolDesc;
use crate::workspace::{Workspace, WorkspaceDelta};

/// Internal AID for minting a lease over the protocol.
pub const LEASE_ISSUE_AID: &str = "_lease.issue";
/// Internal AID for lease GC over the protocol.
pub const LEASE_GC_AID: &str = "_lease.gc";

#[derive(Debug, Deserialize)]
struct WireRequest {
    #[serde(default)]
    aid: String,
    #[serde(default)]
    input_json: Option<String>,
    #[serde(default)]
    ds_state: Option<WorkspaceDelta>,
    #[serde(default)]
    idempotency_key: Option<String>,
    #[serde(default, rename = "_lease_token")]
    lease_token: Option<String>,
    // _lease.issue fields
    #[serde(default)]
    tool_aid: Option<String>,
    #[serde(default)]
    tier: Option<i32>,
    #[serde(default)]
    ttl_ms: Option<i64>,
}

/// The serve-mode protocol server.
pub struct ToolhostServer {
    tools: HashMap<String, (ToolDesc, ToolFn)>,
    session_ws: Workspace,
    leases: LeaseManager,
    idempotency: IdempotencyCache,
    enforce_leases: bool,
}

impl ToolhostServer {
    /// Creates a server with no tools registered.
    #[must_use]
    pub fn new(enforce_leases: bool) -> Self {
        Self {
            tools: HashMap::new(),
            session_ws: Workspace::new(),
            leases: LeaseManager::new(),
            idempotency: IdempotencyCache::default(),
            enforce_leases,
        }
    }

    /// Registers a tool the server can execute.
    pub fn register(&mut self, desc: ToolDesc, f: ToolFn) {
        self.tools.insert(desc.aid.clone(), (desc, f));
    }

    /// Number of registered tools.
    #[must_use]
    pub fn tool_count(&self) -> usize {
        self.tools.len()
    }

    /// Runs the NDJSON loop until an empty line or EOF.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error when a response cannot be written.
    pub fn serve(&mut self, input: impl BufRead, mut output: impl Write) -> std::io::Result<()> {
        for line in input.lines() {
            let line = line?;
            if line.is_empty() {
                break;
            }
            let response = self.handle_line(&line);
            output.write_all(response.to_string().as_bytes())?;
            output.write_all(b"\n")?;
            output.flush()?;
        }
        Ok(())
    }

    /// Handles one request line, returning the response object.
    pub fn handle_line(&mut self, line: &str) -> serde_json::Value {
        let Ok(request) = serde_json::from_str::<WireRequest>(line) else {
            return json!({"ok": false, "error": "invalid JSON"});
        };
        if request.aid.is_empty() {
            return json!({"ok": false, "error": "missing aid"});
        }
        if request.aid == LEASE_ISSUE_AID {
            return self.handle_lease_issue(&request);
        }
        if request.aid == LEASE_GC_AID {
            return self.handle_lease_gc();
        }
        self.handle_tool_call(request)
    }

    fn handle_lease_issue(&self, request: &WireRequest) -> serde_json::Value {
        let tool_aid = request.tool_aid.clone().unwrap_or_default();
        let tier = request.tier.unwrap_or(0);
        let ttl_ms = request.ttl_ms.unwrap_or(10_000);
        let token = self.leases.issue(&tool_aid, tier, ttl_ms, "serve");
        json!({
            "ok": true,
            "token_id": token.token_id,
            "tool_aid": token.tool_aid,
            "tier": token.tier,
        })
    }

    fn handle_lease_gc(&self) -> serde_json::Value {
        self.leases.gc();
        let stats = self.leases.stats();
        json!({
            "ok": true,
            "active": self.leases.active_count(),
            "issued": stats.issued,
            "consumed": stats.consumed,
            "rejected": stats.rejected,
        })
    }

    fn handle_tool_call(&mut self, request: WireRequest) -> serde_json::Value {
        let Some((desc, f)) = self.tools.get(&request.aid) else {
            return json!({"ok": false, "error": format!("tool not found: {}", request.aid)});
        };
        let desc = desc.clone();
        let f = std::sync::Arc::clone(f);

        // Idempotency first: a cached response short-circuits even the
        // lease gate, because the authorized effect already happened.
        let idem_key = request.idempotency_key.clone().unwrap_or_default();
        if let Some(cached) = self.idempotency.get(&idem_key) {
            return json!({
                "ok": true,
                "status": cached.status.as_str(),
                "output_json": cached.output_json,
                "error": cached.error,
                "idempotent_hit": true,
                "ds_state": WorkspaceDelta::empty(),
            });
        }

        if self.enforce_leases && self.leases.requires_lease(&desc.aid, &desc.side_effects) {
            let tier = super::classify_tool_tier(&desc.aid, &desc.side_effects);
            let Some(token) = request.lease_token.as_deref().filter(|t| !t.is_empty()) else {
                return json!({
                    "ok": false,
                    "error": "lease_required",
                    "tier": tier.level(),
                    "aid": desc.aid,
                });
            };
            if let Err(reason) = self.leases.verify_and_consume(token, &desc.aid) {
                return json!({"ok": false, "error": "lease_rejected", "reason": reason});
            }
        }

        // Incoming state (delta or full) lands on the session workspace.
        if let Some(state) = &request.ds_state {
            state.apply(&mut self.session_ws);
        }
        let pre_call = self.session_ws.clone();

        let input_json = request.input_json.unwrap_or_else(|| "{}".to_string());
        let result: ToolResult = f(&input_json, &mut self.session_ws);

        self.idempotency.store(&idem_key, &result);

        json!({
            "ok": true,
            "status": result.status.as_str(),
            "output_json": result.output_json,
            "error": result.error,
            "ds_state": WorkspaceDelta::encode(&self.session_ws, &pre_call),
        })
    }
}
