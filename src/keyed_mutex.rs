//! Keyed FIFO operation serializer.
//!
//! An operation names a set of string keys and proceeds only when none of
//! them is held and no earlier waiter sharing a key is still queued. Keys are
//! normalized (trimmed, sorted, deduplicated) so multi-key callers cannot
//! deadlock each other by acquiring in different orders.

use crate::error::{HistoryError, Result};
use crate::manifest::KEY_SEPARATOR;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};
use tracing::{trace, warn};

/// Queue position of a waiter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Priority {
    #[default]
    Normal,
    /// Queued ahead of every `Normal` waiter.
    High,
}

/// Lock key of one document branch.
pub fn branch_key(note_id: &str, branch: &str) -> String {
    format!("{note_id}{KEY_SEPARATOR}{branch}")
}

struct Waiter {
    ticket: u64,
    keys: Vec<String>,
    priority: Priority,
}

#[derive(Default)]
struct State {
    held: HashSet<String>,
    queue: VecDeque<Waiter>,
    next_ticket: u64,
}

impl State {
    fn enqueue(&mut self, keys: Vec<String>, priority: Priority) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        let waiter = Waiter {
            ticket,
            keys,
            priority,
        };
        match priority {
            Priority::Normal => self.queue.push_back(waiter),
            Priority::High => {
                let at = self
                    .queue
                    .iter()
                    .position(|w| w.priority == Priority::Normal)
                    .unwrap_or(self.queue.len());
                self.queue.insert(at, waiter);
            }
        }
        ticket
    }

    fn position(&self, ticket: u64) -> Option<usize> {
        self.queue.iter().position(|w| w.ticket == ticket)
    }

    fn can_acquire(&self, ticket: u64) -> bool {
        let Some(pos) = self.position(ticket) else {
            return false;
        };
        let keys = &self.queue[pos].keys;
        if keys.iter().any(|k| self.held.contains(k)) {
            return false;
        }
        !self.queue.iter().take(pos).any(|earlier| {
            earlier.keys.iter().any(|k| keys.binary_search(k).is_ok())
        })
    }

    fn dequeue(&mut self, ticket: u64) -> Option<Waiter> {
        let pos = self.position(ticket)?;
        self.queue.remove(pos)
    }
}

/// FIFO mutex over string keys.
pub struct KeyedMutex {
    state: Mutex<State>,
    released: Condvar,
    default_timeout: Duration,
}

impl KeyedMutex {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            released: Condvar::new(),
            default_timeout,
        }
    }

    /// Trim, sort and deduplicate keys. An empty set is invalid.
    pub fn normalize<I, S>(keys: I) -> Result<Vec<String>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut normalized: Vec<String> = keys
            .into_iter()
            .map(|k| k.as_ref().trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();
        normalized.sort();
        normalized.dedup();
        if normalized.is_empty() {
            return Err(HistoryError::Validation("no lock keys given".into()));
        }
        Ok(normalized)
    }

    /// Wait for the keys. A waiter that times out is removed from the queue.
    pub fn lock<I, S>(
        &self,
        keys: I,
        timeout: Option<Duration>,
        priority: Priority,
    ) -> Result<KeyGuard<'_>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keys = Self::normalize(keys)?;
        let timeout = timeout.unwrap_or(self.default_timeout);
        let deadline = Instant::now() + timeout;

        let mut state = self.state.lock();
        let ticket = state.enqueue(keys, priority);

        loop {
            if state.can_acquire(ticket) {
                let waiter = state.dequeue(ticket).ok_or_else(|| {
                    HistoryError::StateConsistency("lock waiter vanished from queue".into())
                })?;
                for key in &waiter.keys {
                    state.held.insert(key.clone());
                }
                trace!(keys = ?waiter.keys, "acquired keys");
                // Later waiters on disjoint keys may have been blocked behind us.
                self.released.notify_all();
                return Ok(KeyGuard {
                    mutex: self,
                    keys: waiter.keys,
                });
            }

            if self.released.wait_until(&mut state, deadline).timed_out()
                && !state.can_acquire(ticket)
            {
                let waiter = state.dequeue(ticket);
                self.released.notify_all();
                let keys = waiter.map(|w| w.keys).unwrap_or_default();
                warn!(?keys, timeout_ms = timeout.as_millis() as u64, "lock wait timed out");
                return Err(HistoryError::OperationTimeout {
                    operation: format!("waiting for lock on {}", keys.join(", ")),
                    after: timeout,
                });
            }
        }
    }

    /// Run `operation` while holding the keys.
    pub fn run<I, S, T, F>(
        &self,
        keys: I,
        timeout: Option<Duration>,
        priority: Priority,
        operation: F,
    ) -> Result<T>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        F: FnOnce() -> Result<T>,
    {
        let _guard = self.lock(keys, timeout, priority)?;
        operation()
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.state.lock().held.contains(key)
    }

    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    fn release(&self, keys: &[String]) {
        let mut state = self.state.lock();
        for key in keys {
            state.held.remove(key);
        }
        self.released.notify_all();
    }
}

/// Holds keys until dropped.
pub struct KeyGuard<'a> {
    mutex: &'a KeyedMutex,
    keys: Vec<String>,
}

impl KeyGuard<'_> {
    pub fn keys(&self) -> &[String] {
        &self.keys
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.mutex.release(&self.keys);
    }
}
