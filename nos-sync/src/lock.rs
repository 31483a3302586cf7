//! Lock with priority donation
//!
//! A lock is a semaphore of one permit with two extra rules: only one context
//! can own it at a time, and only the owner may release it. Locks are not
//! recursive: acquiring a lock the caller already owns is fatal.
//!
//! ## Priority donation
//!
//! When a context blocks on an owned lock, it lends its effective priority to
//! the owner, and through the owner to whatever lock the owner is itself
//! blocked on, and so on down the wait-for chain. Without this a low-priority
//! owner could be starved by medium-priority work while a high-priority
//! context waits on it (priority inversion).
//!
//! On release the owner drops back to the priority it is still owed: its base
//! priority, raised by the best waiter of every lock it continues to hold.
//! The bookkeeping lives in the thread table; see [`crate::donation`].
//!
//! |                 | blocks? | donation | interrupt context |
//! |-----------------|---------|----------|-------------------|
//! | `acquire`       | yes     | yes      | fatal             |
//! | `try_acquire`   | no      | no       | allowed           |
//! | `release`       | no      | restores | -                 |

use alloc::sync::Arc;

use crate::error::{fatal, ContractViolation, WouldBlock};
use crate::sched::{self, PreemptGuard, Scheduler};
use crate::semaphore::Semaphore;
use crate::thread::LockId;

/// A non-recursive, priority-donating lock.
pub struct Lock {
    id: LockId,
    sched: Arc<dyn Scheduler>,
    semaphore: Semaphore,
}

impl Lock {
    /// Creates an unowned lock and registers it with the scheduler's thread
    /// table.
    pub fn new(sched: Arc<dyn Scheduler>) -> Self {
        let id = {
            let _guard = PreemptGuard::new(&*sched);
            sched.threads().register_lock()
        };
        Self {
            id,
            semaphore: Semaphore::new(sched.clone(), 1),
            sched,
        }
    }

    pub fn id(&self) -> LockId {
        self.id
    }

    /// Acquires the lock, sleeping until it is available.
    ///
    /// If the lock is owned, the caller's priority is donated along the
    /// wait-for chain before sleeping.
    pub fn acquire(&self) {
        let sched = &*self.sched;
        if sched.in_interrupt() {
            fatal(ContractViolation::BlockingInInterrupt { op: "Lock::acquire" });
        }
        let me = sched.current();
        if self.held_by_current() {
            fatal(ContractViolation::ReentrantAcquire { lock: self.id, thread: me });
        }

        let _guard = PreemptGuard::new(sched);
        sched.threads().with(|reg| reg.begin_wait(me, self.id));
        self.semaphore.down();
        sched.threads().with(|reg| reg.complete_acquire(me, self.id));
        log::trace!("{} acquired by {}", self.id, me);
    }

    /// Acquires the lock only if it is free right now.
    ///
    /// Never sleeps and never donates; safe from interrupt context.
    pub fn try_acquire(&self) -> Result<(), WouldBlock> {
        let sched = &*self.sched;
        let me = sched.current();
        if self.held_by_current() {
            fatal(ContractViolation::ReentrantAcquire { lock: self.id, thread: me });
        }

        let _guard = PreemptGuard::new(sched);
        self.semaphore.try_down()?;
        sched.threads().with(|reg| reg.complete_acquire(me, self.id));
        Ok(())
    }

    /// Releases the lock, which the caller must own.
    ///
    /// The caller's priority is restored and the next owner woken in one
    /// critical section, so a more urgent waiter preempts it right away and
    /// nothing else can run in between.
    pub fn release(&self) {
        let sched = &*self.sched;
        let me = sched.current();
        if !self.held_by_current() {
            fatal(ContractViolation::ReleaseNotOwner { lock: self.id, thread: me });
        }

        {
            let _guard = PreemptGuard::new(sched);
            sched.threads().with(|reg| reg.release(me, self.id));
            self.semaphore.up_without_yield();
        }
        sched::yield_if_outranked(sched);
    }

    /// Whether the running context owns this lock.
    ///
    /// Asking about another context's ownership would be racy, so there is no
    /// such query.
    pub fn held_by_current(&self) -> bool {
        let sched = &*self.sched;
        let _guard = PreemptGuard::new(sched);
        sched.threads().lock_owner(self.id) == Some(sched.current())
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        let sched = &*self.sched;
        let _guard = PreemptGuard::new(sched);
        sched.threads().unregister_lock(self.id);
    }
}
