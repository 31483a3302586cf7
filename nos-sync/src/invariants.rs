//! Donation-graph invariants
//!
//! Runtime-checkable properties of the thread/lock arena that must hold
//! whenever no primitive operation is mid-flight. They are checked after
//! every mutation when the `debug_checks` feature is on (and always in unit
//! tests), and are available to tests through
//! [`ThreadTable::check_invariants`](crate::ThreadTable::check_invariants).
//!
//! # Invariants
//!
//! 1. **Ownership**: a lock's owner lists it in `held`, and every held lock
//!    names that thread as owner (at most one owner per lock)
//! 2. **Waiting**: a lock's waiters all await exactly that lock, and every
//!    awaiting thread is listed; a thread never waits for a lock it holds
//! 3. **Priority floor**: effective priority is never below base priority
//! 4. **Entitlement**: effective priority equals base raised by the best
//!    waiter of every held lock

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use crate::thread::Registry;

/// An invariant violation with details
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvariantViolation {
    /// Name of the violated invariant
    pub invariant: &'static str,
    /// Description of what went wrong
    pub description: String,
}

/// Check all invariants.
///
/// Returns a list of violations (empty if all invariants hold).
pub(crate) fn check_all_invariants(reg: &Registry) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    violations.extend(check_ownership(reg));
    violations.extend(check_waiting(reg));
    violations.extend(check_priority_floor(reg));
    violations.extend(check_entitlement(reg));

    violations
}

/// Panics with every violation if any invariant is broken.
pub(crate) fn assert_invariants(reg: &Registry) {
    let violations = check_all_invariants(reg);
    if violations.is_empty() {
        return;
    }
    for violation in &violations {
        log::error!("invariant {} violated: {}", violation.invariant, violation.description);
    }
    panic!(
        "{} donation-graph invariant(s) violated, first: {}",
        violations.len(),
        violations[0].description
    );
}

/// Invariant 1: owner and held lists agree
fn check_ownership(reg: &Registry) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    for (id, lock) in &reg.locks {
        let Some(owner) = lock.owner else { continue };
        match reg.threads.get(&owner) {
            Some(thread) if thread.held.contains(id) => {}
            Some(_) => violations.push(InvariantViolation {
                invariant: "ownership",
                description: format!("{} owned by {} but missing from its held list", id, owner),
            }),
            None => violations.push(InvariantViolation {
                invariant: "ownership",
                description: format!("{} owned by unregistered {}", id, owner),
            }),
        }
    }

    for (tid, thread) in &reg.threads {
        for (i, id) in thread.held.iter().enumerate() {
            if thread.held[..i].contains(id) {
                violations.push(InvariantViolation {
                    invariant: "ownership",
                    description: format!("{} holds {} twice", tid, id),
                });
            }
            let owner = reg.locks.get(id).and_then(|lock| lock.owner);
            if owner != Some(*tid) {
                violations.push(InvariantViolation {
                    invariant: "ownership",
                    description: format!("{} lists {} as held, owner is {:?}", tid, id, owner),
                });
            }
        }
    }

    violations
}

/// Invariant 2: waiter lists and awaited locks agree
fn check_waiting(reg: &Registry) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    for (id, lock) in &reg.locks {
        for (i, waiter) in lock.waiters.iter().enumerate() {
            if lock.waiters[..i].contains(waiter) {
                violations.push(InvariantViolation {
                    invariant: "waiting",
                    description: format!("{} queued twice on {}", waiter, id),
                });
            }
            let awaited = reg.threads.get(waiter).and_then(|thread| thread.awaited);
            if awaited != Some(*id) {
                violations.push(InvariantViolation {
                    invariant: "waiting",
                    description: format!("{} listed on {} but awaits {:?}", waiter, id, awaited),
                });
            }
        }
    }

    for (tid, thread) in &reg.threads {
        let Some(id) = thread.awaited else { continue };
        match reg.locks.get(&id) {
            Some(lock) if lock.waiters.contains(tid) => {
                if lock.owner == Some(*tid) {
                    violations.push(InvariantViolation {
                        invariant: "waiting",
                        description: format!("{} waits for {}, which it owns", tid, id),
                    });
                }
            }
            Some(_) => violations.push(InvariantViolation {
                invariant: "waiting",
                description: format!("{} awaits {} but is not on its waiter list", tid, id),
            }),
            None => violations.push(InvariantViolation {
                invariant: "waiting",
                description: format!("{} awaits unregistered {}", tid, id),
            }),
        }
    }

    violations
}

/// Invariant 3: donation only ever raises
fn check_priority_floor(reg: &Registry) -> Vec<InvariantViolation> {
    reg.threads
        .iter()
        .filter(|(_, thread)| thread.effective < thread.base)
        .map(|(tid, thread)| InvariantViolation {
            invariant: "priority_floor",
            description: format!(
                "{} runs at {} below its base {}",
                tid, thread.effective, thread.base
            ),
        })
        .collect()
}

/// Invariant 4: effective priority is exactly what the held locks donate
fn check_entitlement(reg: &Registry) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    for (tid, thread) in &reg.threads {
        // Only well-formed records can be evaluated; the checks above report
        // the rest.
        let well_formed = thread.held.iter().all(|id| {
            reg.locks
                .get(id)
                .is_some_and(|lock| lock.waiters.iter().all(|w| reg.threads.contains_key(w)))
        });
        if !well_formed {
            continue;
        }
        let entitled = reg.entitled_priority(*tid);
        if thread.effective != entitled {
            violations.push(InvariantViolation {
                invariant: "entitlement",
                description: format!(
                    "{} runs at {} but is entitled to {}",
                    tid, thread.effective, entitled
                ),
            });
        }
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::{Priority, ThreadId, ThreadTable};

    #[test]
    fn test_consistent_graph_has_no_violations() {
        let table = ThreadTable::new();
        table.register(ThreadId(1), "low", Priority::new(1));
        table.register(ThreadId(2), "high", Priority::new(9));
        let lock = table.register_lock();
        table.with(|reg| {
            reg.complete_acquire(ThreadId(1), lock);
            reg.begin_wait(ThreadId(2), lock);
        });
        assert!(table.check_invariants().is_empty());
    }

    #[test]
    fn test_detects_stale_effective_priority() {
        let mut reg = Registry::default();
        reg.threads.insert(
            ThreadId(1),
            crate::thread::Thread {
                name: "t".into(),
                base: Priority::new(3),
                effective: Priority::new(2),
                awaited: None,
                held: Vec::new(),
            },
        );

        let violations = check_all_invariants(&reg);
        let names: Vec<_> = violations.iter().map(|v| v.invariant).collect();
        assert!(names.contains(&"priority_floor"));
        assert!(names.contains(&"entitlement"));
    }

    #[test]
    fn test_detects_dangling_owner() {
        let mut reg = Registry::default();
        let table = ThreadTable::new();
        let lock = table.register_lock();
        reg.locks.insert(
            lock,
            crate::thread::LockRecord {
                owner: Some(ThreadId(7)),
                waiters: Vec::new(),
            },
        );

        let violations = check_all_invariants(&reg);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].invariant, "ownership");
    }
}
