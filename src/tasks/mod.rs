//! Background task bookkeeping for cancellable, supersedable work.
//!
//! Statistics computations are keyed by tag id: issuing a new task for a key
//! cancels the one in flight and only the most recently issued task may
//! publish. Filter evaluation is debounced so that a burst of changes runs
//! once.

pub mod debounce;
pub mod manager;

pub use debounce::Debouncer;
pub use manager::KeyedTaskManager;

/// Unique identifier for a background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub u64);

impl TaskId {
    pub fn new() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        TaskId(COUNTER.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

/// Proof that a task was the latest one issued for `key` at the time it
/// started. Results are accepted only while the ticket is still current.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket<K> {
    pub key: K,
    pub task: TaskId,
}
