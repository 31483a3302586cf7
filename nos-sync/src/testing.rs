//! Scheduler doubles for unit tests.

// The mock expansion expects the std prelude; this crate is `no_std`.
#[allow(unused_imports)]
use std::prelude::rust_2021::*;
// Named explicitly so `panic!` does not resolve through the glob above.
use core::panic;

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use crate::sched::Scheduler;
use crate::thread::{Priority, ThreadId, ThreadTable};

mockall::mock! {
    pub Sched {}

    impl Scheduler for Sched {
        fn threads(&self) -> &ThreadTable;
        fn current(&self) -> ThreadId;
        fn in_interrupt(&self) -> bool;
        fn push_off(&self) -> bool;
        fn pop_off(&self, was_enabled: bool);
        fn suspend_current(&self);
        fn resume(&self, thread: ThreadId);
        fn yield_current(&self);
        fn yield_on_return(&self);
        fn max_ready_priority(&self) -> Option<Priority>;
    }
}

/// A scheduler with nothing else to run.
///
/// Operations that would need a second runnable context panic instead of
/// hanging. The running identity can be switched with
/// [`switch_to`](Self::switch_to) to act as different contexts in turn.
pub(crate) struct SoloScheduler {
    table: ThreadTable,
    current: AtomicU32,
    interrupt: AtomicBool,
    enabled: AtomicBool,
    strict: AtomicBool,
    yields: AtomicUsize,
}

impl SoloScheduler {
    pub(crate) const MAIN: ThreadId = ThreadId(1);

    pub(crate) fn new(priority: Priority) -> Arc<Self> {
        let sched = Self {
            table: ThreadTable::new(),
            current: AtomicU32::new(Self::MAIN.0),
            interrupt: AtomicBool::new(false),
            enabled: AtomicBool::new(true),
            strict: AtomicBool::new(false),
            yields: AtomicUsize::new(0),
        };
        sched.table.register(Self::MAIN, "main", priority);
        Arc::new(sched)
    }

    /// Registers another context that can be switched to.
    pub(crate) fn add_thread(&self, tid: ThreadId, priority: Priority) {
        self.table.register(tid, "other", priority);
    }

    /// From now on, reaching the thread table with preemption enabled
    /// panics.
    pub(crate) fn require_preemption_off(&self) {
        self.strict.store(true, Ordering::SeqCst);
    }

    pub(crate) fn switch_to(&self, tid: ThreadId) {
        self.current.store(tid.0, Ordering::SeqCst);
    }

    /// Runs `f` as an interrupt handler.
    pub(crate) fn in_handler<R>(&self, f: impl FnOnce() -> R) -> R {
        self.interrupt.store(true, Ordering::SeqCst);
        let result = f();
        self.interrupt.store(false, Ordering::SeqCst);
        result
    }

    pub(crate) fn preemption_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub(crate) fn yields(&self) -> usize {
        self.yields.load(Ordering::SeqCst)
    }
}

impl Scheduler for SoloScheduler {
    fn threads(&self) -> &ThreadTable {
        if self.strict.load(Ordering::SeqCst) && self.preemption_enabled() {
            panic!("thread table reached with preemption enabled");
        }
        &self.table
    }

    fn current(&self) -> ThreadId {
        ThreadId(self.current.load(Ordering::SeqCst))
    }

    fn in_interrupt(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    fn push_off(&self) -> bool {
        self.enabled.swap(false, Ordering::SeqCst)
    }

    fn pop_off(&self, was_enabled: bool) {
        self.enabled.store(was_enabled, Ordering::SeqCst);
    }

    fn suspend_current(&self) {
        panic!("{} would sleep forever: no other context can run", self.current());
    }

    fn resume(&self, thread: ThreadId) {
        panic!("{} resumed, but no context is ever suspended here", thread);
    }

    fn yield_current(&self) {
        self.yields.fetch_add(1, Ordering::SeqCst);
    }

    fn yield_on_return(&self) {
        self.yields.fetch_add(1, Ordering::SeqCst);
    }

    fn max_ready_priority(&self) -> Option<Priority> {
        None
    }
}
