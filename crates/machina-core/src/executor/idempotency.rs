//! Idempotency cache for toolhost requests.
//!
//! A request carrying an `idempotency_key` caches its response; a repeat of
//! the same key within the TTL returns the cached `{status, output_json,
//! error}` without invoking the tool, and the caller sees an empty workspace
//! delta. Eviction is lazy: expired entries are swept when the cache passes
//! half capacity on insert.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use super::ToolResult;
use crate::types::now_ms;

/// Default response TTL.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// Default entry cap.
pub const DEFAULT_MAX_ENTRIES: usize = 1024;

#[derive(Debug, Clone)]
struct Entry {
    result: ToolResult,
    expiry_ms: i64,
}

/// TTL cache keyed by idempotency key.
#[derive(Debug)]
pub struct IdempotencyCache {
    ttl_ms: i64,
    max_entries: usize,
    entries: Mutex<HashMap<String, Entry>>,
}

impl IdempotencyCache {
    /// Creates a cache with explicit TTL and capacity.
    #[must_use]
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl_ms: i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX),
            max_entries: max_entries.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Looks up a live entry for `key`. An empty key never hits.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<ToolResult> {
        if key.is_empty() {
            return None;
        }
        let mut entries = self.entries.lock().expect("idempotency lock");
        let now = now_ms();
        match entries.get(key) {
            Some(entry) if entry.expiry_ms > now => Some(entry.result.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Stores the response for `key`. An empty key is not cached.
    pub fn store(&self, key: &str, result: &ToolResult) {
        if key.is_empty() {
            return;
        }
        let mut entries = self.entries.lock().expect("idempotency lock");
        let now = now_ms();
        if entries.len() >= self.max_entries / 2 {
            entries.retain(|_, e| e.expiry_ms > now);
        }
        // Hard cap: refuse new entries rather than evicting live ones, so a
        // flood of fresh keys cannot silently break earlier idempotency
        // promises.
        if entries.len() >= self.max_entries && !entries.contains_key(key) {
            return;
        }
        entries.insert(
            key.to_string(),
            Entry {
                result: result.clone(),
                expiry_ms: now + self.ttl_ms,
            },
        );
    }

    /// Number of entries (live and lazily-expired).
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().expect("idempotency lock").len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for IdempotencyCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_MAX_ENTRIES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(tag: &str) -> ToolResult {
        ToolResult::ok(format!(r#"{{"tag":"{tag}"}}"#))
    }

    #[test]
    fn hit_within_ttl_returns_identical_response() {
        let cache = IdempotencyCache::default();
        cache.store("k1", &result("first"));
        let hit = cache.get("k1").unwrap();
        assert_eq!(hit, result("first"));
        // A second read still hits.
        assert_eq!(cache.get("k1").unwrap(), result("first"));
    }

    #[test]
    fn expired_entry_misses() {
        let cache = IdempotencyCache::new(Duration::from_millis(30), 16);
        cache.store("k1", &result("x"));
        std::thread::sleep(Duration::from_millis(60));
        assert!(cache.get("k1").is_none());
    }

    #[test]
    fn empty_key_never_caches() {
        let cache = IdempotencyCache::default();
        cache.store("", &result("x"));
        assert!(cache.get("").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn error_results_cache_too() {
        let cache = IdempotencyCache::default();
        let err = ToolResult::error("boom");
        cache.store("k", &err);
        assert_eq!(cache.get("k").unwrap(), err);
    }
}
