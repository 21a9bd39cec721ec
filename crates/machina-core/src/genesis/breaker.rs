//! Per-name circuit breaker for Genesis compile and load failures.
//!
//! Failures are tracked in a rolling window; hitting the threshold blocks
//! further attempts against the same name until the cooldown passes. State
//! is file-backed (one small JSON per key under the breaker dir) so a
//! crashing run cannot reset its own breaker by restarting.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::now_ms;

/// Default failure threshold.
pub const DEFAULT_THRESHOLD: u32 = 3;
/// Default rolling window.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(300);
/// Default cooldown once tripped.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct BreakerState {
    #[serde(default)]
    fail_count: u32,
    #[serde(default)]
    first_fail_ms: i64,
    #[serde(default)]
    last_fail_ms: i64,
    #[serde(default)]
    block_until_ms: i64,
}

/// File-backed breaker over `(kind, name)` keys.
#[derive(Debug, Clone)]
pub struct GenesisBreaker {
    dir: PathBuf,
    enabled: bool,
    threshold: u32,
    window_ms: i64,
    cooldown_ms: i64,
}

impl GenesisBreaker {
    /// Creates a breaker persisting under `dir` with default tuning.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            enabled: true,
            threshold: DEFAULT_THRESHOLD,
            window_ms: i64::try_from(DEFAULT_WINDOW.as_millis()).unwrap_or(i64::MAX),
            cooldown_ms: i64::try_from(DEFAULT_COOLDOWN.as_millis()).unwrap_or(i64::MAX),
        }
    }

    /// Overrides threshold/window/cooldown.
    #[must_use]
    pub fn with_tuning(mut self, threshold: u32, window: Duration, cooldown: Duration) -> Self {
        self.threshold = threshold.max(1);
        self.window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX).max(1);
        self.cooldown_ms = i64::try_from(cooldown.as_millis()).unwrap_or(i64::MAX).max(1);
        self
    }

    /// Disables the breaker entirely (dev).
    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    fn state_file(&self, kind: &str, name: &str) -> PathBuf {
        let key = crate::hash::sha256_hex(format!("{kind}:{name}").as_bytes());
        self.dir.join(format!("{}.json", &key[..40]))
    }

    fn load(path: &Path) -> BreakerState {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    }

    fn store(&self, path: &Path, state: &BreakerState) {
        let _ = std::fs::create_dir_all(&self.dir);
        if let Ok(body) = serde_json::to_string(state) {
            let _ = std::fs::write(path, body);
        }
    }

    /// Whether `(kind, name)` is currently blocked; returns the block
    /// expiry when it is.
    #[must_use]
    pub fn blocked_until(&self, kind: &str, name: &str) -> Option<i64> {
        if !self.enabled {
            return None;
        }
        let state = Self::load(&self.state_file(kind, name));
        (state.block_until_ms > 0 && now_ms() < state.block_until_ms)
            .then_some(state.block_until_ms)
    }

    /// Records one failure, tripping the breaker when the rolling-window
    /// count reaches the threshold. Returns whether the breaker is now
    /// open.
    pub fn record_fail(&self, kind: &str, name: &str) -> bool {
        if !self.enabled {
            return false;
        }
        let path = self.state_file(kind, name);
        let mut state = Self::load(&path);
        let now = now_ms();

        if state.first_fail_ms == 0 || now - state.first_fail_ms > self.window_ms {
            state.fail_count = 1;
            state.first_fail_ms = now;
        } else {
            state.fail_count += 1;
        }
        state.last_fail_ms = now;
        if state.fail_count >= self.threshold {
            state.block_until_ms = now + self.cooldown_ms;
        }
        self.store(&path, &state);
        state.block_until_ms > now
    }

    /// Clears the breaker for `(kind, name)` after a success.
    pub fn record_success(&self, kind: &str, name: &str) {
        let _ = std::fs::remove_file(self.state_file(kind, name));
    }
}
