//! Counting semaphore
//!
//! A semaphore is a non-negative counter with two operations:
//!
//! - `down` ("P"): wait for the counter to become positive, then decrement it
//! - `up` ("V"): increment the counter and wake the most urgent waiter
//!
//! A semaphore created with zero permits is a one-shot or repeating event
//! signal; one created with `n` permits bounds concurrent use of a resource.
//! Locks and condition variables in this crate are built on it.
//!
//! Waiters are woken strictly by effective priority as of the moment of the
//! `up`, ties in arrival order. After waking a waiter, `up` yields if the woken
//! context outranks the caller.

use alloc::sync::Arc;

use crate::error::{fatal, ContractViolation, WouldBlock};
use crate::sched::{self, PreemptGuard, PreemptMutex, Scheduler};
use crate::wait_queue::WaitQueue;

/// Counting semaphore
pub struct Semaphore {
    sched: Arc<dyn Scheduler>,
    state: PreemptMutex<SemaState>,
}

struct SemaState {
    count: usize,
    waiters: WaitQueue,
}

impl Semaphore {
    /// Creates a semaphore holding `count` permits with no waiters.
    pub fn new(sched: Arc<dyn Scheduler>, count: usize) -> Self {
        Self {
            sched,
            state: PreemptMutex::new(SemaState {
                count,
                waiters: WaitQueue::new(),
            }),
        }
    }

    /// Waits for a permit and takes it.
    ///
    /// Sleeps while the counter is zero. Must not be called from interrupt
    /// context.
    pub fn down(&self) {
        let sched = &*self.sched;
        if sched.in_interrupt() {
            fatal(ContractViolation::BlockingInInterrupt { op: "Semaphore::down" });
        }

        let _guard = PreemptGuard::new(sched);
        let me = sched.current();
        // A wake-up only means "look again": the permit may be gone by the
        // time this context runs.
        loop {
            {
                let mut state = self.state.lock(sched);
                if state.count > 0 {
                    state.count -= 1;
                    return;
                }
                if !state.waiters.contains(me) {
                    let threads = sched.threads();
                    state.waiters.push(me, |t| threads.priority(t));
                }
            }
            sched.suspend_current();
        }
    }

    /// Takes a permit if one is available, without sleeping.
    ///
    /// Safe to call from interrupt context.
    pub fn try_down(&self) -> Result<(), WouldBlock> {
        let mut state = self.state.lock(&*self.sched);
        if state.count > 0 {
            state.count -= 1;
            Ok(())
        } else {
            Err(WouldBlock)
        }
    }

    /// Returns a permit and wakes the highest-priority waiter, if any.
    ///
    /// Safe to call from interrupt context; there the yield to a more urgent
    /// woken context is deferred until the handler returns.
    pub fn up(&self) {
        self.up_without_yield();
        sched::yield_if_outranked(&*self.sched);
    }

    /// Returns a permit and makes the highest-priority waiter runnable, but
    /// leaves the yield check to the caller.
    ///
    /// Lets [`Lock::release`](crate::Lock::release) wake the next owner inside
    /// the same critical section that restored its own priority.
    pub(crate) fn up_without_yield(&self) {
        let sched = &*self.sched;
        let _guard = PreemptGuard::new(sched);
        let woken = {
            let mut state = self.state.lock(sched);
            let threads = sched.threads();
            let woken = state.waiters.pop_highest(|t| threads.priority(t));
            state.count += 1;
            woken
        };
        if let Some(thread) = woken {
            log::trace!("semaphore: waking {}", thread);
            sched.resume(thread);
        }
    }

    /// Current permit count. Advisory only.
    pub fn value(&self) -> usize {
        self.state.lock(&*self.sched).count
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if !state.waiters.is_empty() {
            log::error!(
                "semaphore destroyed with {} waiter(s) still queued",
                state.waiters.len()
            );
        }
    }
}
