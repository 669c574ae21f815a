//! Keyed task tracking with last-issued-wins semantics.

use std::collections::HashMap;
use std::hash::Hash;
use tokio::task::AbortHandle;
use tracing::debug;

use super::{TaskId, Ticket};

struct Entry {
    current: TaskId,
    handle: Option<AbortHandle>,
}

/// Tracks at most one live task per key.
pub struct KeyedTaskManager<K> {
    tasks: HashMap<K, Entry>,
}

impl<K> KeyedTaskManager<K>
where
    K: Copy + Eq + Hash + std::fmt::Debug,
{
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
        }
    }

    /// Issue a new task for `key`, aborting whatever was running for it.
    pub fn begin(&mut self, key: K) -> Ticket<K> {
        let task = TaskId::new();
        let previous = self.tasks.insert(
            key,
            Entry {
                current: task,
                handle: None,
            },
        );
        if let Some(Entry {
            handle: Some(handle),
            ..
        }) = previous
        {
            debug!(?key, "Superseding in-flight task");
            handle.abort();
        }
        Ticket { key, task }
    }

    /// Attach the abort handle of a spawned task. A ticket that was
    /// superseded in the meantime has its task aborted immediately.
    pub fn attach(&mut self, ticket: Ticket<K>, handle: AbortHandle) {
        match self.tasks.get_mut(&ticket.key) {
            Some(entry) if entry.current == ticket.task => entry.handle = Some(handle),
            _ => handle.abort(),
        }
    }

    pub fn is_current(&self, ticket: &Ticket<K>) -> bool {
        self.tasks
            .get(&ticket.key)
            .is_some_and(|entry| entry.current == ticket.task)
    }

    /// Retire a ticket. Returns `true` if it was still current, meaning its
    /// result may be published.
    pub fn finish(&mut self, ticket: &Ticket<K>) -> bool {
        if self.is_current(ticket) {
            self.tasks.remove(&ticket.key);
            true
        } else {
            false
        }
    }

    /// Cancel whatever is in flight for `key`. Any outstanding ticket for the
    /// key stops being current.
    pub fn cancel(&mut self, key: K) -> bool {
        match self.tasks.remove(&key) {
            Some(entry) => {
                if let Some(handle) = entry.handle {
                    handle.abort();
                }
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, entry) in self.tasks.drain() {
            if let Some(handle) = entry.handle {
                handle.abort();
            }
        }
    }
}

impl<K> Default for KeyedTaskManager<K>
where
    K: Copy + Eq + Hash + std::fmt::Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_newer_ticket_supersedes() {
        let mut manager = KeyedTaskManager::new();
        let first = manager.begin(7_i64);
        let handle = tokio::spawn(std::future::pending::<()>());
        manager.attach(first, handle.abort_handle());

        let second = manager.begin(7);
        assert!(!manager.is_current(&first));
        assert!(manager.is_current(&second));
        assert!(handle.await.unwrap_err().is_cancelled());

        assert!(!manager.finish(&first));
        assert!(manager.finish(&second));
        assert!(!manager.is_current(&second));
    }

    #[tokio::test]
    async fn test_cancel_invalidates_ticket() {
        let mut manager = KeyedTaskManager::new();
        let ticket = manager.begin(1_i64);
        assert!(manager.cancel(1));
        assert!(!manager.finish(&ticket));

        // attaching to a dead ticket aborts the task straight away
        let handle = tokio::spawn(std::future::pending::<()>());
        manager.attach(ticket, handle.abort_handle());
        assert!(handle.await.unwrap_err().is_cancelled());
    }

    #[test]
    fn test_keys_are_independent() {
        let mut manager = KeyedTaskManager::new();
        let a = manager.begin(1_i64);
        let b = manager.begin(2_i64);
        assert!(manager.is_current(&a));
        assert!(manager.is_current(&b));
        manager.cancel_all();
        assert!(!manager.is_current(&a));
    }
}
