//! In-memory scheduling structures: the blocking priority queue and the
//! delayed-retry heap.
//!
//! The file queue is the source of truth; these exist for fast in-process
//! dispatch. Lower priority value runs first; within a priority class,
//! FIFO by a monotonic sequence number.

use std::collections::BinaryHeap;
use std::path::PathBuf;
use std::sync::{Condvar, Mutex};

/// An item popped from the [`PriorityQueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem<T> {
    /// Scheduling priority; lower runs first.
    pub priority: i32,
    /// Monotonic enqueue sequence, for FIFO within a priority class.
    pub seq: u64,
    /// The payload.
    pub value: T,
}

impl<T: Eq> Ord for QueueItem<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; invert so the lowest (priority, seq) pops
        // first.
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<T: Eq> PartialOrd for QueueItem<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug)]
struct PqState<T: Eq> {
    heap: BinaryHeap<QueueItem<T>>,
    seq: u64,
    closed: bool,
}

/// Thread-safe blocking priority queue with shutdown.
#[derive(Debug)]
pub struct PriorityQueue<T: Eq> {
    state: Mutex<PqState<T>>,
    cv: Condvar,
}

impl<T: Eq> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Eq> PriorityQueue<T> {
    /// Creates an empty, open queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PqState {
                heap: BinaryHeap::new(),
                seq: 0,
                closed: false,
            }),
            cv: Condvar::new(),
        }
    }

    /// Enqueues a value. Silently dropped after [`Self::shutdown`].
    pub fn push(&self, priority: i32, value: T) {
        let mut state = self.state.lock().expect("queue lock");
        if state.closed {
            return;
        }
        let seq = state.seq;
        state.seq += 1;
        state.heap.push(QueueItem {
            priority,
            seq,
            value,
        });
        drop(state);
        self.cv.notify_one();
    }

    /// Blocks until an item is available or the queue is shut down.
    ///
    /// Returns `None` only when the queue is closed *and* drained: items
    /// enqueued before shutdown are still delivered.
    pub fn pop(&self) -> Option<QueueItem<T>> {
        let mut state = self.state.lock().expect("queue lock");
        loop {
            if let Some(item) = state.heap.pop() {
                return Some(item);
            }
            if state.closed {
                return None;
            }
            state = self.cv.wait(state).expect("queue lock");
        }
    }

    /// Closes the queue and wakes every blocked popper.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().expect("queue lock");
        state.closed = true;
        drop(state);
        self.cv.notify_all();
    }

    /// Number of queued items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().expect("queue lock").heap.len()
    }

    /// Whether the queue holds no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether [`Self::shutdown`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().expect("queue lock").closed
    }
}

/// One delayed entry: a retry file due for promotion at `due_ms`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayedEntry {
    /// Epoch milliseconds when the entry becomes due.
    pub due_ms: i64,
    /// The retry file's current path.
    pub path: PathBuf,
    /// The original (post-promotion) filename.
    pub original: String,
}

impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Min-heap on due time.
        other.due_ms.cmp(&self.due_ms)
    }
}

impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap of delayed retries, deduplicated by filename.
#[derive(Debug, Default)]
pub struct DelayQueue {
    heap: BinaryHeap<DelayedEntry>,
    seen: std::collections::HashSet<String>,
}

impl DelayQueue {
    /// Creates an empty delay queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules an entry; a filename already scheduled is ignored.
    /// Returns whether the entry was newly added.
    pub fn schedule(&mut self, entry: DelayedEntry) -> bool {
        let key = entry
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if !self.seen.insert(key) {
            return false;
        }
        self.heap.push(entry);
        true
    }

    /// Removes and returns every entry due at or before `now_ms`.
    pub fn pop_due(&mut self, now_ms: i64) -> Vec<DelayedEntry> {
        let mut due = Vec::new();
        while self.heap.peek().is_some_and(|e| e.due_ms <= now_ms) {
            let entry = self.heap.pop().expect("peeked");
            if let Some(name) = entry.path.file_name() {
                self.seen.remove(&name.to_string_lossy().into_owned());
            }
            due.push(entry);
        }
        due
    }

    /// Milliseconds until the next entry is due, if any.
    #[must_use]
    pub fn next_due_in_ms(&self, now_ms: i64) -> Option<i64> {
        self.heap.peek().map(|e| (e.due_ms - now_ms).max(0))
    }

    /// Snapshot of all scheduled entries (heap order, not due order).
    #[must_use]
    pub fn entries(&self) -> Vec<DelayedEntry> {
        self.heap.iter().cloned().collect()
    }

    /// Number of scheduled entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether no entries are scheduled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn priority_order_then_fifo() {
        let q = PriorityQueue::new();
        q.push(5000, "mid-1");
        q.push(100, "high");
        q.push(5000, "mid-2");
        q.push(9000, "low");

        assert_eq!(q.pop().unwrap().value, "high");
        assert_eq!(q.pop().unwrap().value, "mid-1");
        assert_eq!(q.pop().unwrap().value, "mid-2");
        assert_eq!(q.pop().unwrap().value, "low");
    }

    #[test]
    fn shutdown_wakes_blocked_poppers() {
        let q = Arc::new(PriorityQueue::<String>::new());
        let mut handles = Vec::new();
        for _ in 0..3 {
            let q = Arc::clone(&q);
            handles.push(std::thread::spawn(move || q.pop()));
        }
        std::thread::sleep(std::time::Duration::from_millis(50));
        q.shutdown();
        for h in handles {
            assert!(h.join().unwrap().is_none());
        }
    }

    #[test]
    fn items_before_shutdown_still_drain() {
        let q = PriorityQueue::new();
        q.push(1, "a");
        q.push(2, "b");
        q.shutdown();
        assert_eq!(q.pop().unwrap().value, "a");
        assert_eq!(q.pop().unwrap().value, "b");
        assert!(q.pop().is_none());
        // push after shutdown is dropped
        q.push(1, "c");
        assert!(q.pop().is_none());
    }

    #[test]
    fn delay_queue_pops_due_in_time_order() {
        let mut dq = DelayQueue::new();
        for (due, name) in [(300, "c"), (100, "a"), (200, "b")] {
            dq.schedule(DelayedEntry {
                due_ms: due,
                path: PathBuf::from(format!("retry_{due}_{name}.json")),
                original: format!("{name}.json"),
            });
        }
        assert_eq!(dq.next_due_in_ms(0), Some(100));

        let due = dq.pop_due(250);
        assert_eq!(
            due.iter().map(|e| e.due_ms).collect::<Vec<_>>(),
            vec![100, 200]
        );
        assert_eq!(dq.len(), 1);
    }

    #[test]
    fn delay_queue_dedups_by_filename() {
        let mut dq = DelayQueue::new();
        let entry = DelayedEntry {
            due_ms: 10,
            path: PathBuf::from("retry_10_x.json"),
            original: "x.json".to_string(),
        };
        assert!(dq.schedule(entry.clone()));
        assert!(!dq.schedule(entry));
        assert_eq!(dq.len(), 1);

        // Once popped, the same name may be scheduled again.
        dq.pop_due(100);
        assert!(dq.schedule(DelayedEntry {
            due_ms: 20,
            path: PathBuf::from("retry_10_x.json"),
            original: "x.json".to_string(),
        }));
    }
}
