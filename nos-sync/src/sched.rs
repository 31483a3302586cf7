//! Scheduler interface consumed by the primitives
//!
//! Ready-queue selection, context switching and thread lifecycle live outside
//! this crate. The primitives only need the handful of operations below.

use core::ops::{Deref, DerefMut};

use crate::thread::{Priority, ThreadId, ThreadTable};

/// The scheduler of a single preemptible core.
pub trait Scheduler: Send + Sync {
    /// Execution-context records owned by this scheduler
    fn threads(&self) -> &ThreadTable;

    /// Identity of the running context
    fn current(&self) -> ThreadId;

    /// Whether the caller is an interrupt handler (cannot sleep)
    fn in_interrupt(&self) -> bool;

    /// Disables preemption and returns whether it was enabled before
    fn push_off(&self) -> bool;

    /// Restores the preemption state returned by [`push_off`](Self::push_off)
    fn pop_off(&self, was_enabled: bool);

    /// Removes the running context from the runnable set until
    /// [`resume`](Self::resume)d. Called with preemption disabled; returns
    /// once the context runs again.
    fn suspend_current(&self);

    /// Makes a suspended context runnable again. Does not switch.
    fn resume(&self, thread: ThreadId);

    /// Gives up the processor, re-entering the ready queue at the current
    /// effective priority
    fn yield_current(&self);

    /// Requests a yield as soon as the running interrupt handler returns
    fn yield_on_return(&self);

    /// Highest effective priority among runnable (not running) contexts
    fn max_ready_priority(&self) -> Option<Priority>;
}

/// RAII guard for a critical section with preemption disabled.
///
/// Guards nest; each one restores the state it found.
pub struct PreemptGuard<'a> {
    sched: &'a dyn Scheduler,
    was_enabled: bool,
}

impl<'a> PreemptGuard<'a> {
    pub fn new(sched: &'a dyn Scheduler) -> Self {
        let was_enabled = sched.push_off();
        Self { sched, was_enabled }
    }
}

impl Drop for PreemptGuard<'_> {
    fn drop(&mut self) {
        self.sched.pop_off(self.was_enabled);
    }
}

// ============================================================================
// PreemptMutex<T> - spin lock that disables preemption while held
// ============================================================================

/// A spin lock whose holder cannot be preempted or interrupted.
///
/// On one core a plain spin lock taken with preemption enabled can be
/// re-entered by an interrupt handler or a higher-priority context, which then
/// spins forever. Locking through the scheduler rules that out.
pub struct PreemptMutex<T> {
    inner: spin::Mutex<T>,
}

impl<T> PreemptMutex<T> {
    pub const fn new(data: T) -> Self {
        Self {
            inner: spin::Mutex::new(data),
        }
    }

    /// Disables preemption, then takes the lock.
    pub fn lock<'a>(&'a self, sched: &'a dyn Scheduler) -> PreemptMutexGuard<'a, T> {
        let preempt = PreemptGuard::new(sched);
        PreemptMutexGuard {
            data: self.inner.lock(),
            _preempt: preempt,
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

/// RAII guard for [`PreemptMutex`]. Unlocks before restoring preemption.
pub struct PreemptMutexGuard<'a, T> {
    data: spin::MutexGuard<'a, T>,
    _preempt: PreemptGuard<'a>,
}

impl<T> Deref for PreemptMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.data
    }
}

impl<T> DerefMut for PreemptMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.data
    }
}

/// Yields if a ready context now outranks the running one.
///
/// Inside an interrupt handler the yield is deferred to handler exit. The
/// priorities are read under a guard; the yield happens after it is dropped.
pub(crate) fn yield_if_outranked(sched: &dyn Scheduler) {
    let (top, mine) = {
        let _guard = PreemptGuard::new(sched);
        let Some(top) = sched.max_ready_priority() else {
            return;
        };
        (top, sched.threads().priority(sched.current()))
    };
    if top <= mine {
        return;
    }
    log::trace!("{} (priority {}) outranked by ready priority {}", sched.current(), mine, top);
    if sched.in_interrupt() {
        sched.yield_on_return();
    } else {
        sched.yield_current();
    }
}
