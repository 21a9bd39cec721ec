//! Permission leases: TTL-bounded single-use authorization tokens.
//!
//! Tools classify into four tiers; by default only tier 0 executes freely.
//! A higher-tier invocation must present a lease minted by the operator or
//! policy layer - never by the selector - and each lease is consumed by
//! exactly one invocation. Token ids are compared in constant time.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::hash::constant_time_eq;
use crate::types::now_ms;

/// Minimum lease TTL.
pub const MIN_TTL_MS: i64 = 1_000;
/// Maximum lease TTL.
pub const MAX_TTL_MS: i64 = 300_000;
/// Default lease TTL.
pub const DEFAULT_TTL_MS: i64 = 60_000;

/// Permission tier of a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ToolTier {
    /// Read-only, no side effects.
    Safe = 0,
    /// File writes, memory appends, state mutations.
    Write = 1,
    /// Shell exec, network, process creation.
    System = 2,
    /// Genesis, plugin loading, raw syscalls.
    Dangerous = 3,
}

impl ToolTier {
    /// Numeric tier value.
    #[must_use]
    pub const fn level(self) -> i32 {
        self as i32
    }
}

/// Classifies a tool into its tier from AID and side-effect metadata.
///
/// Precedence, first match wins: `GENESIS` in the AID; `SHELL`/`NET.HTTP`
/// in the AID; side effects naming exec/network/process; side effects
/// naming write/append/delete/create; write-family AIDs; else safe.
#[must_use]
pub fn classify_tool_tier(aid: &str, side_effects: &[String]) -> ToolTier {
    if aid.contains("GENESIS") {
        return ToolTier::Dangerous;
    }
    if aid.contains("SHELL") || aid.contains("NET.HTTP") {
        return ToolTier::System;
    }
    for effect in side_effects {
        if effect == "none" {
            continue;
        }
        if effect.contains("exec") || effect.contains("network") || effect.contains("process") {
            return ToolTier::System;
        }
        if effect.contains("write")
            || effect.contains("append")
            || effect.contains("delete")
            || effect.contains("create")
        {
            return ToolTier::Write;
        }
    }
    if aid.contains("FILE.WRITE") || aid.contains("MEMORY.APPEND") || aid.contains("VECDB.UPSERT") {
        return ToolTier::Write;
    }
    ToolTier::Safe
}

/// A minted lease.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseToken {
    /// Unique random token id.
    pub token_id: String,
    /// Authorized tool AID, or `"*"` for any tool.
    pub tool_aid: String,
    /// Tier the lease was minted for.
    pub tier: i32,
    /// Mint time, epoch milliseconds.
    pub issued_ms: i64,
    /// Expiry, epoch milliseconds.
    pub expires_ms: i64,
    /// Single-use flag.
    pub consumed: bool,
    /// Who minted the lease.
    pub issuer: String,
}

/// Issue/verify/consume counters for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeaseStats {
    /// Leases minted.
    pub issued: u64,
    /// Leases consumed by a successful verification.
    pub consumed: u64,
    /// Verifications rejected.
    pub rejected: u64,
}

/// The lease authority. All operations take the internal mutex briefly.
#[derive(Debug, Default)]
pub struct LeaseManager {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    leases: HashMap<String, LeaseToken>,
    stats: LeaseStats,
}

impl LeaseManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mints a lease for `tool_aid` (or `"*"`) at `tier`. The TTL is
    /// clamped to `1s..=300s`.
    pub fn issue(&self, tool_aid: &str, tier: i32, ttl_ms: i64, issuer: &str) -> LeaseToken {
        use rand::RngCore;
        let ttl_ms = ttl_ms.clamp(MIN_TTL_MS, MAX_TTL_MS);
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        let now = now_ms();
        let token = LeaseToken {
            token_id: format!("lease_{}", hex::encode(bytes)),
            tool_aid: tool_aid.to_string(),
            tier,
            issued_ms: now,
            expires_ms: now + ttl_ms,
            consumed: false,
            issuer: issuer.to_string(),
        };
        let mut inner = self.inner.lock().expect("lease lock");
        inner.leases.insert(token.token_id.clone(), token.clone());
        inner.stats.issued += 1;
        token
    }

    /// Verifies a token against `tool_aid` and consumes it on success.
    ///
    /// Checks, in order: existence, expiry, single-use, AID match. The
    /// failure reason is returned for journaling. Once consumed, every
    /// later verification of the same token fails with "already consumed".
    pub fn verify_and_consume(&self, token_id: &str, tool_aid: &str) -> Result<(), String> {
        let mut guard = self.inner.lock().expect("lease lock");
        let inner = &mut *guard;

        // Constant-time scan: the token id is a bearer secret.
        let found = inner
            .leases
            .keys()
            .find(|k| constant_time_eq(k, token_id))
            .cloned();
        let Some(key) = found else {
            inner.stats.rejected += 1;
            return Err("lease not found".to_string());
        };

        let now = now_ms();
        let expired = inner.leases[&key].expires_ms < now;
        if expired {
            inner.leases.remove(&key);
            inner.stats.rejected += 1;
            return Err("lease expired".to_string());
        }
        let token = inner.leases.get_mut(&key).expect("present");
        if token.consumed {
            inner.stats.rejected += 1;
            return Err("lease already consumed".to_string());
        }
        if token.tool_aid != "*" && token.tool_aid != tool_aid {
            let reason = format!(
                "lease tool mismatch: expected={} got={tool_aid}",
                token.tool_aid
            );
            inner.stats.rejected += 1;
            return Err(reason);
        }
        token.consumed = true;
        inner.stats.consumed += 1;
        Ok(())
    }

    /// Whether a tool at this AID/side-effect combination needs a lease.
    #[must_use]
    pub fn requires_lease(&self, aid: &str, side_effects: &[String]) -> bool {
        classify_tool_tier(aid, side_effects) > ToolTier::Safe
    }

    /// Drops expired and consumed leases.
    pub fn gc(&self) {
        let now = now_ms();
        self.inner
            .lock()
            .expect("lease lock")
            .leases
            .retain(|_, t| !t.consumed && t.expires_ms >= now);
    }

    /// Number of live (unconsumed, unexpired) leases.
    #[must_use]
    pub fn active_count(&self) -> usize {
        let now = now_ms();
        self.inner
            .lock()
            .expect("lease lock")
            .leases
            .values()
            .filter(|t| !t.consumed && t.expires_ms > now)
            .count()
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> LeaseStats {
        self.inner.lock().expect("lease lock").stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn effects(list: &[&str]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn classification_precedence() {
        assert_eq!(
            classify_tool_tier("AID.GENESIS.WRITE_FILE.v1", &effects(&["file_write"])),
            ToolTier::Dangerous
        );
        assert_eq!(
            classify_tool_tier("AID.SHELL.EXEC.v1", &effects(&["none"])),
            ToolTier::System
        );
        assert_eq!(
            classify_tool_tier("AID.NET.HTTP_GET.v1", &effects(&["none"])),
            ToolTier::System
        );
        assert_eq!(
            classify_tool_tier("AID.CUSTOM.v1", &effects(&["spawns process"])),
            ToolTier::System
        );
        assert_eq!(
            classify_tool_tier("AID.CUSTOM.v1", &effects(&["file_write"])),
            ToolTier::Write
        );
        assert_eq!(
            classify_tool_tier("AID.FILE.WRITE.v1", &effects(&[])),
            ToolTier::Write
        );
        assert_eq!(
            classify_tool_tier("AID.FILE.READ.v1", &effects(&["none"])),
            ToolTier::Safe
        );
    }

    #[test]
    fn lease_lifecycle() {
        let mgr = LeaseManager::new();
        let token = mgr.issue("AID.FILE.WRITE.v1", 1, 60_000, "operator");
        assert!(token.token_id.starts_with("lease_"));
        assert_eq!(mgr.active_count(), 1);

        mgr.verify_and_consume(&token.token_id, "AID.FILE.WRITE.v1").unwrap();
        assert_eq!(mgr.active_count(), 0);
        assert_eq!(mgr.stats().consumed, 1);
    }

    #[test]
    fn consumption_is_monotone() {
        let mgr = LeaseManager::new();
        let token = mgr.issue("*", 2, 60_000, "test");
        mgr.verify_and_consume(&token.token_id, "AID.X.v1").unwrap();
        for _ in 0..3 {
            let err = mgr.verify_and_consume(&token.token_id, "AID.X.v1").unwrap_err();
            assert_eq!(err, "lease already consumed");
        }
        assert_eq!(mgr.stats().rejected, 3);
    }

    #[test]
    fn wildcard_and_mismatch() {
        let mgr = LeaseManager::new();
        let wild = mgr.issue("*", 1, 60_000, "test");
        mgr.verify_and_consume(&wild.token_id, "AID.ANY.v1").unwrap();

        let bound = mgr.issue("AID.A.v1", 1, 60_000, "test");
        let err = mgr.verify_and_consume(&bound.token_id, "AID.B.v1").unwrap_err();
        assert!(err.contains("mismatch"));
        // The rejected lease is not consumed; the right tool can still use it.
        mgr.verify_and_consume(&bound.token_id, "AID.A.v1").unwrap();
    }

    #[test]
    fn unknown_token_rejected() {
        let mgr = LeaseManager::new();
        assert_eq!(
            mgr.verify_and_consume("lease_0000", "AID.X.v1").unwrap_err(),
            "lease not found"
        );
    }

    #[test]
    fn ttl_is_clamped() {
        let mgr = LeaseManager::new();
        let short = mgr.issue("*", 1, 1, "test");
        assert!(short.expires_ms - short.issued_ms >= MIN_TTL_MS);
        let long = mgr.issue("*", 1, 3_600_000, "test");
        assert!(long.expires_ms - long.issued_ms <= MAX_TTL_MS);
    }

    #[test]
    fn gc_drops_consumed() {
        let mgr = LeaseManager::new();
        let a = mgr.issue("*", 1, 60_000, "test");
        let _b = mgr.issue("*", 1, 60_000, "test");
        mgr.verify_and_consume(&a.token_id, "AID.X.v1").unwrap();
        mgr.gc();
        assert_eq!(mgr.active_count(), 1);
        // The consumed lease is gone entirely now.
        assert_eq!(
            mgr.verify_and_consume(&a.token_id, "AID.X.v1").unwrap_err(),
            "lease not found"
        );
    }
}
