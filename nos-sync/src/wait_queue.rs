//! Priority-ordered queue of blocked contexts
//!
//! Entries are kept in descending effective priority, ties in insertion
//! order. Priorities can rise after enqueue through donation, so removal
//! re-sorts against the priorities current at wake time before taking the
//! front.

use alloc::collections::VecDeque;
use core::cmp::Reverse;

use crate::thread::{Priority, ThreadId};

/// Blocked contexts of one primitive, in wake order.
///
/// The queue holds non-owning thread ids; the contexts belong to the
/// scheduler. Priorities are looked up through the `priority_of` callback so
/// the queue itself never goes stale.
#[derive(Debug, Default, Clone)]
pub struct WaitQueue {
    entries: VecDeque<ThreadId>,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, thread: ThreadId) -> bool {
        self.entries.contains(&thread)
    }

    /// Queued contexts in current queue order.
    pub fn iter(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.entries.iter().copied()
    }

    /// Inserts `thread` behind every entry of equal or higher priority.
    pub fn push(&mut self, thread: ThreadId, priority_of: impl Fn(ThreadId) -> Priority) {
        let priority = priority_of(thread);
        let at = self
            .entries
            .iter()
            .position(|queued| priority_of(*queued) < priority)
            .unwrap_or(self.entries.len());
        log::trace!("wait queue: {} (priority {}) queued at {}", thread, priority, at);
        self.entries.insert(at, thread);
    }

    /// Removes and returns the highest-priority entry as of now.
    pub fn pop_highest(&mut self, priority_of: impl Fn(ThreadId) -> Priority) -> Option<ThreadId> {
        self.resort(&priority_of);
        self.entries.pop_front()
    }

    /// Priority of the entry [`pop_highest`](Self::pop_highest) would return.
    pub fn highest_priority(&self, priority_of: impl Fn(ThreadId) -> Priority) -> Option<Priority> {
        self.entries.iter().map(|queued| priority_of(*queued)).max()
    }

    /// Removes `thread` wherever it is queued.
    pub fn remove(&mut self, thread: ThreadId) -> bool {
        match self.entries.iter().position(|queued| *queued == thread) {
            Some(at) => {
                self.entries.remove(at);
                true
            }
            None => false,
        }
    }

    fn resort(&mut self, priority_of: &impl Fn(ThreadId) -> Priority) {
        // Stable: equal priorities keep their queue order.
        self.entries
            .make_contiguous()
            .sort_by_key(|queued| Reverse(priority_of(*queued)));
    }
}
