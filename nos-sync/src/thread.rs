//! Execution-context records
//!
//! The scheduler owns the threads; this module owns the part of each thread's
//! state the synchronization primitives read and update: base and effective
//! priority, the lock it is trying to acquire, and the locks it holds. Locks
//! are registered here too, so the wait-for chain `thread -> awaited lock ->
//! owner -> ...` is an index walk over one arena instead of a pointer chase.

use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use spin::Mutex;

use crate::config::{self, PRI_DEFAULT, PRI_MAX, PRI_MIN};
use crate::error::{fatal, ContractViolation};
use crate::invariants::{self, InvariantViolation};

// ============================================================================
// Identifiers
// ============================================================================

/// Identity of an execution context, assigned by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub u32);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread {}", self.0)
    }
}

/// Identity of a [`Lock`](crate::Lock). Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockId(u64);

impl LockId {
    fn allocate() -> Self {
        static NEXT_LOCK_ID: AtomicU64 = AtomicU64::new(1);
        LockId(NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw id value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lock #{}", self.0)
    }
}

/// Scheduling priority. Higher values are more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Priority(u8);

impl Priority {
    pub const MIN: Priority = Priority(PRI_MIN);
    pub const DEFAULT: Priority = Priority(PRI_DEFAULT);
    pub const MAX: Priority = Priority(PRI_MAX);

    /// Creates a priority, clamping `value` into `MIN..=MAX`.
    pub const fn new(value: u8) -> Self {
        if value > PRI_MAX {
            Priority(PRI_MAX)
        } else {
            Priority(value)
        }
    }

    pub const fn get(self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::DEFAULT
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Records
// ============================================================================

/// Synchronization state of one execution context.
#[derive(Debug, Clone)]
pub(crate) struct Thread {
    pub(crate) name: String,
    /// Priority before any donation
    pub(crate) base: Priority,
    /// Priority the scheduler uses
    pub(crate) effective: Priority,
    /// Lock this context is blocked acquiring
    pub(crate) awaited: Option<LockId>,
    /// Held locks, highest waiter priority at insertion first
    pub(crate) held: Vec<LockId>,
}

/// Ownership and waiters of one lock.
#[derive(Debug, Clone, Default)]
pub(crate) struct LockRecord {
    pub(crate) owner: Option<ThreadId>,
    /// Contexts with `awaited == this lock`, in arrival order
    pub(crate) waiters: Vec<ThreadId>,
}

/// The arena behind a [`ThreadTable`].
#[derive(Debug, Default)]
pub(crate) struct Registry {
    pub(crate) threads: HashMap<ThreadId, Thread>,
    pub(crate) locks: HashMap<LockId, LockRecord>,
}

impl Registry {
    pub(crate) fn thread(&self, tid: ThreadId) -> &Thread {
        match self.threads.get(&tid) {
            Some(thread) => thread,
            None => fatal(ContractViolation::UnknownThread(tid)),
        }
    }

    pub(crate) fn thread_mut(&mut self, tid: ThreadId) -> &mut Thread {
        match self.threads.get_mut(&tid) {
            Some(thread) => thread,
            None => fatal(ContractViolation::UnknownThread(tid)),
        }
    }

    pub(crate) fn lock(&self, id: LockId) -> &LockRecord {
        match self.locks.get(&id) {
            Some(lock) => lock,
            None => fatal(ContractViolation::UnknownLock(id)),
        }
    }

    pub(crate) fn lock_mut(&mut self, id: LockId) -> &mut LockRecord {
        match self.locks.get_mut(&id) {
            Some(lock) => lock,
            None => fatal(ContractViolation::UnknownLock(id)),
        }
    }

    fn info(&self, tid: ThreadId) -> Option<ThreadInfo> {
        let thread = self.threads.get(&tid)?;
        let donations = thread
            .held
            .iter()
            .filter(|lock| self.top_waiter(**lock).is_some_and(|p| p > thread.base))
            .count();
        Some(ThreadInfo {
            name: thread.name.clone(),
            priority: thread.effective,
            base_priority: thread.base,
            donations,
            awaited_lock: thread.awaited,
            held_locks: thread.held.clone(),
        })
    }
}

/// Point-in-time view of a context's synchronization state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    pub name: String,
    /// Effective priority
    pub priority: Priority,
    pub base_priority: Priority,
    /// Held locks whose highest waiter currently outranks the base priority
    pub donations: usize,
    pub awaited_lock: Option<LockId>,
    pub held_locks: Vec<LockId>,
}

// ============================================================================
// ThreadTable
// ============================================================================

/// Execution-context records shared by the scheduler and the primitives.
///
/// The scheduler registers a context when it creates it and unregisters it on
/// exit, and reads [`priority`](Self::priority) when choosing what to run.
/// The primitives mutate the rest.
///
/// Every method takes a plain spin lock, so callers must have preemption and
/// interrupts disabled. The primitives reach the table only under a
/// [`PreemptGuard`](crate::PreemptGuard); the scheduler calls in from its own
/// critical sections.
#[derive(Debug, Default)]
pub struct ThreadTable {
    inner: Mutex<Registry>,
}

impl ThreadTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Registry::default()),
        }
    }

    /// Adds a context with base and effective priority `priority`.
    pub fn register(&self, tid: ThreadId, name: &str, priority: Priority) {
        let thread = Thread {
            name: name.to_string(),
            base: priority,
            effective: priority,
            awaited: None,
            held: Vec::new(),
        };
        self.with(|reg| {
            if reg.threads.insert(tid, thread).is_some() {
                log::warn!("{} registered twice, previous record replaced", tid);
            }
        });
    }

    /// Removes an exiting context.
    ///
    /// Exiting while holding or waiting for a lock is a usage error: it is
    /// logged, the context is dropped from every wait list, and the locks it
    /// owned are left ownerless (and permanently unavailable).
    pub fn unregister(&self, tid: ThreadId) -> bool {
        self.with(|reg| {
            let Some(thread) = reg.threads.remove(&tid) else {
                return false;
            };
            if let Some(lock) = thread.awaited {
                log::error!("{} ({}) exited while waiting for {}", tid, thread.name, lock);
                if let Some(record) = reg.locks.get_mut(&lock) {
                    record.waiters.retain(|t| *t != tid);
                    // Its donation ends with it.
                    if let Some(owner) = record.owner.filter(|o| reg.threads.contains_key(o)) {
                        reg.propagate(owner);
                    }
                }
            }
            for lock in &thread.held {
                log::error!("{} ({}) exited while holding {}", tid, thread.name, lock);
                if let Some(record) = reg.locks.get_mut(lock) {
                    record.owner = None;
                }
            }
            true
        })
    }

    pub fn contains(&self, tid: ThreadId) -> bool {
        self.inner.lock().threads.contains_key(&tid)
    }

    /// Effective priority of `tid`.
    pub fn priority(&self, tid: ThreadId) -> Priority {
        self.inner.lock().thread(tid).effective
    }

    /// Priority of `tid` before donation.
    pub fn base_priority(&self, tid: ThreadId) -> Priority {
        self.inner.lock().thread(tid).base
    }

    pub fn info(&self, tid: ThreadId) -> Option<ThreadInfo> {
        self.inner.lock().info(tid)
    }

    /// Current owner of `lock`. Advisory: the answer may be stale as soon as
    /// preemption is re-enabled.
    pub fn lock_owner(&self, lock: LockId) -> Option<ThreadId> {
        self.inner.lock().locks.get(&lock).and_then(|record| record.owner)
    }

    /// Checks every donation-graph invariant; empty when all hold.
    pub fn check_invariants(&self) -> Vec<InvariantViolation> {
        invariants::check_all_invariants(&self.inner.lock())
    }

    pub(crate) fn register_lock(&self) -> LockId {
        let id = LockId::allocate();
        self.with(|reg| {
            reg.locks.insert(id, LockRecord::default());
        });
        id
    }

    pub(crate) fn unregister_lock(&self, id: LockId) {
        self.with(|reg| {
            let Some(record) = reg.locks.remove(&id) else {
                return;
            };
            for waiter in record.waiters {
                log::error!("{} destroyed while {} waits for it", id, waiter);
                if let Some(thread) = reg.threads.get_mut(&waiter) {
                    thread.awaited = None;
                }
            }
            if let Some(owner) = record.owner {
                log::error!("{} destroyed while owned by {}", id, owner);
                if let Some(thread) = reg.threads.get_mut(&owner) {
                    thread.held.retain(|lock| *lock != id);
                    reg.propagate(owner);
                }
            }
        });
    }

    /// Runs `f` on the registry, then re-verifies invariants when enabled.
    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut Registry) -> R) -> R {
        let mut reg = self.inner.lock();
        let result = f(&mut reg);
        if config::CHECK_INVARIANTS {
            invariants::assert_invariants(&reg);
        }
        result
    }
}
