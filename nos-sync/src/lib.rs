//! NOS Sync - Blocking synchronization primitives for a uniprocessor kernel
//!
//! This crate provides the sleeping synchronization primitives used by the
//! rest of the kernel: counting semaphores, non-recursive locks with priority
//! donation, and Mesa-style condition variables. The scheduler, thread
//! lifecycle and context switching are external; they are reached through the
//! [`Scheduler`] trait.
//!
//! # Architecture
//!
//! - **WaitQueue**: blocked contexts, woken in effective-priority order
//! - **Semaphore**: a non-negative counter plus a wait queue
//! - **Lock**: a semaphore of one permit with an owner and priority donation
//! - **Condvar**: a queue of private single-use semaphores paired with a lock
//! - **ThreadTable**: the execution-context records the primitives read and
//!   update (effective/base priority, awaited lock, held locks)
//!
//! # Mutual exclusion model
//!
//! There is one core. Every operation runs inside a [`PreemptGuard`], which
//! disables preemption (and interrupts) through the scheduler for the duration
//! of the call. The spin locks inside the primitives are [`PreemptMutex`]es and
//! the [`ThreadTable`] is only touched under a guard, so no holder of either can
//! be preempted or interrupted, and neither lock is ever contended. The only
//! place a context gives up the processor inside such a section is
//! [`Scheduler::suspend_current`] in `Semaphore::down`.
//!
//! # Contract violations
//!
//! Misuse (re-acquiring an owned lock, releasing a lock owned by someone else,
//! blocking from an interrupt handler, waiting without the lock, a wait-for
//! cycle) is fatal. See [`error::fatal`].
//!
//! # Usage
//!
//! ```rust,ignore
//! use nos_sync::{Condvar, Lock};
//!
//! let lock = Lock::new(sched.clone());
//! let ready = Condvar::new(sched.clone());
//!
//! lock.acquire();
//! while !queue_has_items() {
//!     ready.wait(&lock);
//! }
//! lock.release();
//! ```

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod config;
pub mod condvar;
pub mod donation;
pub mod error;
pub mod invariants;
pub mod lock;
pub mod sched;
pub mod semaphore;
pub mod thread;
pub mod wait_queue;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use crate::condvar::Condvar;
pub use crate::donation::{get_priority, set_priority, set_priority_of};
pub use crate::error::{ContractViolation, WouldBlock};
pub use crate::lock::Lock;
pub use crate::sched::{PreemptGuard, PreemptMutex, PreemptMutexGuard, Scheduler};
pub use crate::semaphore::Semaphore;
pub use crate::thread::{LockId, Priority, ThreadId, ThreadInfo, ThreadTable};
pub use crate::wait_queue::WaitQueue;

static_assertions::assert_impl_all!(Semaphore: Send, Sync);
static_assertions::assert_impl_all!(Lock: Send, Sync);
static_assertions::assert_impl_all!(Condvar: Send, Sync);
static_assertions::assert_impl_all!(ThreadTable: Send, Sync);
