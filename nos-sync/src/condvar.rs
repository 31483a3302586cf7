//! Condition variable
//!
//! Lets code holding a [`Lock`] sleep until another context announces that
//! some condition may have become true. Signals carry no state and are not
//! remembered: signaling with nobody waiting does nothing.
//!
//! Semantics are Mesa-style. A woken waiter does not run immediately; it
//! competes for the lock again, and by the time it holds it the condition may
//! be false once more. Always wait in a loop:
//!
//! ```ignore
//! lock.acquire();
//! while !ready() {
//!     condvar.wait(&lock);
//! }
//! // ... the condition holds here ...
//! lock.release();
//! ```
//!
//! Each waiter sleeps on a private zero-count [`Semaphore`]. `signal` wakes
//! the waiter whose context currently has the highest effective priority,
//! earliest waiter first among equals.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::{fatal, ContractViolation};
use crate::lock::Lock;
use crate::sched::{PreemptMutex, Scheduler};
use crate::semaphore::Semaphore;
use crate::thread::ThreadId;

struct CondWaiter {
    thread: ThreadId,
    sema: Arc<Semaphore>,
}

/// Mesa-style condition variable, used together with a [`Lock`].
pub struct Condvar {
    sched: Arc<dyn Scheduler>,
    waiters: PreemptMutex<Vec<CondWaiter>>,
}

impl Condvar {
    pub fn new(sched: Arc<dyn Scheduler>) -> Self {
        Self {
            sched,
            waiters: PreemptMutex::new(Vec::new()),
        }
    }

    /// Atomically releases `lock` and sleeps until signaled, then reacquires
    /// `lock` before returning.
    ///
    /// The caller must hold `lock`. Must not be called from interrupt context.
    pub fn wait(&self, lock: &Lock) {
        let sched = &*self.sched;
        if sched.in_interrupt() {
            fatal(ContractViolation::BlockingInInterrupt { op: "Condvar::wait" });
        }
        let me = sched.current();
        if !lock.held_by_current() {
            fatal(ContractViolation::WaitWithoutLock { lock: lock.id(), thread: me });
        }

        // Queued before the lock is released, so a signal sent in between is
        // banked in the semaphore rather than lost.
        let sema = Arc::new(Semaphore::new(self.sched.clone(), 0));
        self.waiters.lock(sched).push(CondWaiter {
            thread: me,
            sema: sema.clone(),
        });

        lock.release();
        sema.down();
        lock.acquire();
    }

    /// Wakes the most urgent waiter, if any.
    ///
    /// The caller must hold `lock`.
    pub fn signal(&self, lock: &Lock) {
        self.check_signal(lock);
        self.wake_one();
    }

    /// Wakes every current waiter.
    ///
    /// The caller must hold `lock`. Waiters are woken in priority order.
    pub fn broadcast(&self, lock: &Lock) {
        self.check_signal(lock);
        let mut woken = 0usize;
        while self.wake_one() {
            woken += 1;
        }
        log::trace!("condvar: broadcast woke {} waiter(s)", woken);
    }

    /// Number of contexts waiting. Advisory only.
    pub fn waiters(&self) -> usize {
        self.waiters.lock(&*self.sched).len()
    }

    fn check_signal(&self, lock: &Lock) {
        let sched = &*self.sched;
        if sched.in_interrupt() {
            fatal(ContractViolation::BlockingInInterrupt { op: "Condvar::signal" });
        }
        if !lock.held_by_current() {
            fatal(ContractViolation::SignalWithoutLock {
                lock: lock.id(),
                thread: sched.current(),
            });
        }
    }

    /// Removes the highest-priority waiter and ups its semaphore.
    fn wake_one(&self) -> bool {
        let waiter = {
            let mut waiters = self.waiters.lock(&*self.sched);
            let threads = self.sched.threads();
            let mut best: Option<(usize, _)> = None;
            for (i, waiter) in waiters.iter().enumerate() {
                let priority = threads.priority(waiter.thread);
                if best.is_none_or(|(_, top)| priority > top) {
                    best = Some((i, priority));
                }
            }
            match best {
                Some((i, _)) => waiters.remove(i),
                None => return false,
            }
        };
        log::trace!("condvar: signaling {}", waiter.thread);
        waiter.sema.up();
        true
    }
}

impl Drop for Condvar {
    fn drop(&mut self) {
        let waiters = self.waiters.get_mut();
        if !waiters.is_empty() {
            log::error!("condvar destroyed with {} waiter(s) still queued", waiters.len());
        }
    }
}
