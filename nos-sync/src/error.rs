//! Error types for the synchronization core
//!
//! Every misuse of a primitive is a programming-contract violation. Continuing
//! with corrupted synchronization state is unsafe, so violations never travel
//! as values: they go through [`fatal`], which logs and halts the caller.
//! The only recoverable failure is [`WouldBlock`], returned by the
//! non-blocking `try_*` operations.

use alloc::vec::Vec;
use core::fmt;

use crate::thread::{LockId, ThreadId};

/// A broken usage contract of a semaphore, lock or condition variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContractViolation {
    /// The caller tried to acquire a lock it already owns
    ReentrantAcquire { lock: LockId, thread: ThreadId },
    /// The caller tried to release a lock it does not own
    ReleaseNotOwner { lock: LockId, thread: ThreadId },
    /// A blocking operation was invoked from interrupt context
    BlockingInInterrupt { op: &'static str },
    /// `Condvar::wait` without holding the associated lock
    WaitWithoutLock { lock: LockId, thread: ThreadId },
    /// `Condvar::signal`/`broadcast` without holding the associated lock
    SignalWithoutLock { lock: LockId, thread: ThreadId },
    /// Blocking on `lock` would close a wait-for cycle through `chain`
    DonationCycle { lock: LockId, chain: Vec<ThreadId> },
    /// A thread id with no record in the thread table
    UnknownThread(ThreadId),
    /// A lock id with no record in the thread table
    UnknownLock(LockId),
}

impl fmt::Display for ContractViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContractViolation::ReentrantAcquire { lock, thread } => {
                write!(f, "{} already held by {}: locks are not recursive", lock, thread)
            }
            ContractViolation::ReleaseNotOwner { lock, thread } => {
                write!(f, "{} released by {}, which does not own it", lock, thread)
            }
            ContractViolation::BlockingInInterrupt { op } => {
                write!(f, "{} may block and cannot run in interrupt context", op)
            }
            ContractViolation::WaitWithoutLock { lock, thread } => {
                write!(f, "condition wait by {} without holding {}", thread, lock)
            }
            ContractViolation::SignalWithoutLock { lock, thread } => {
                write!(f, "condition signal by {} without holding {}", thread, lock)
            }
            ContractViolation::DonationCycle { lock, chain } => {
                write!(f, "wait-for cycle on {}:", lock)?;
                for thread in chain {
                    write!(f, " {} ->", thread)?;
                }
                write!(f, " back to the caller (deadlock)")
            }
            ContractViolation::UnknownThread(thread) => {
                write!(f, "{} is not registered in the thread table", thread)
            }
            ContractViolation::UnknownLock(lock) => {
                write!(f, "{} is not registered in the thread table", lock)
            }
        }
    }
}

/// Reports a contract violation and halts the calling context.
///
/// The violation is logged at `error` level before panicking, so it is still
/// visible when the kernel's panic handler does not print the payload.
#[cold]
#[track_caller]
pub fn fatal(violation: ContractViolation) -> ! {
    log::error!("sync contract violation: {}", violation);
    panic!("sync contract violation: {}", violation);
}

/// A non-blocking acquisition found the primitive unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WouldBlock;

impl fmt::Display for WouldBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "operation would block")
    }
}
