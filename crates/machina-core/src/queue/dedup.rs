//! Request-id dedup cache for enqueue idempotency.
//!
//! A producer may stamp each request with a `request_id`; re-sending the same
//! id within the TTL is acknowledged without enqueueing a second job. The
//! cache is rebuilt from `DEDUP` WAL events on recovery, so dedup survives a
//! restart within the TTL window.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Default dedup TTL: five minutes.
pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(300);

/// TTL cache of recently seen request ids.
#[derive(Debug)]
pub struct DedupCache {
    ttl_ms: i64,
    seen: Mutex<HashMap<String, i64>>,
}

impl DedupCache {
    /// Creates a cache with the given TTL.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl_ms: i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX),
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Records `request_id` at `now_ms` unless it is already live.
    ///
    /// Returns `true` when the id is fresh (caller should enqueue) and
    /// `false` on a duplicate (caller should return the cached ack). Expired
    /// entries are pruned lazily on each insert.
    pub fn insert(&self, request_id: &str, now_ms: i64) -> bool {
        let mut seen = self.seen.lock().expect("dedup lock");
        seen.retain(|_, first_seen| now_ms - *first_seen < self.ttl_ms);
        match seen.get(request_id) {
            Some(_) => false,
            None => {
                seen.insert(request_id.to_string(), now_ms);
                true
            }
        }
    }

    /// Restores an entry observed in the WAL, if still within TTL relative
    /// to `now_ms`.
    pub fn restore(&self, request_id: &str, seen_ms: i64, now_ms: i64) {
        if now_ms - seen_ms < self.ttl_ms {
            self.seen
                .lock()
                .expect("dedup lock")
                .insert(request_id.to_string(), seen_ms);
        }
    }

    /// Number of live entries (expired ones may still be counted until the
    /// next insert prunes them).
    #[must_use]
    pub fn len(&self) -> usize {
        self.seen.lock().expect("dedup lock").len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_within_ttl_is_rejected() {
        let cache = DedupCache::new(Duration::from_millis(1000));
        assert!(cache.insert("rq-1", 0));
        assert!(!cache.insert("rq-1", 500));
        assert!(cache.insert("rq-2", 500));
    }

    #[test]
    fn entry_expires_after_ttl() {
        let cache = DedupCache::new(Duration::from_millis(100));
        assert!(cache.insert("rq-1", 0));
        assert!(cache.insert("rq-1", 150));
    }

    #[test]
    fn restore_respects_ttl() {
        let cache = DedupCache::new(Duration::from_millis(1000));
        cache.restore("old", 0, 5000);
        assert!(cache.insert("old", 5000), "expired entry must not dedup");

        cache.restore("fresh", 4500, 5000);
        assert!(!cache.insert("fresh", 5000));
    }
}
