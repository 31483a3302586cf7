//! NOS Sync Sim - A single-core machine for running nos-sync on a host
//!
//! Every simulated context is backed by a host thread, but only the context
//! holding the baton executes; the others are parked on a condition variable.
//! The baton changes hands only at the scheduling points the primitives call
//! (`suspend_current`, `yield_current`) and when a context exits, so a run is
//! deterministic: the highest effective priority among ready contexts always
//! runs next, ties in the order they became ready.
//!
//! There is no timer, so nothing is preempted behind a context's back.
//! Interrupt handlers are modelled by [`Machine::interrupt`], which runs a
//! closure in interrupt context on the current context's stack.
//!
//! A run ends when every context has exited, when a context panics (contract
//! violations included), or when every remaining context is blocked. In the
//! last two cases the parked contexts are unwound and [`Machine::run`]
//! reports the failure.

use std::cell::Cell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use hashbrown::HashSet;
use nos_sync::{Priority, Scheduler, ThreadId, ThreadTable};

thread_local! {
    static CURRENT: Cell<Option<ThreadId>> = const { Cell::new(None) };
    static PREEMPT_ENABLED: Cell<bool> = const { Cell::new(true) };
}

/// Unwind payload that stops parked contexts once a run has failed.
struct Aborted;

/// Why a simulated run did not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimError {
    /// A context panicked; contract violations end up here
    Panicked { thread: String, message: String },
    /// Contexts remain but none of them can run
    Deadlock { blocked: Vec<ThreadId> },
}

impl fmt::Display for SimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimError::Panicked { thread, message } => {
                write!(f, "context '{}' panicked: {}", thread, message)
            }
            SimError::Deadlock { blocked } => {
                write!(f, "deadlock: {} context(s) blocked, none ready", blocked.len())
            }
        }
    }
}

impl std::error::Error for SimError {}

impl SimError {
    /// Panic message, if the run ended in a panic.
    pub fn panic_message(&self) -> Option<&str> {
        match self {
            SimError::Panicked { message, .. } => Some(message),
            SimError::Deadlock { .. } => None,
        }
    }
}

#[derive(Default)]
struct State {
    /// Context holding the baton
    running: Option<ThreadId>,
    /// Runnable contexts in the order they became ready
    ready: Vec<ThreadId>,
    blocked: HashSet<ThreadId>,
    interrupt: bool,
    yield_pending: bool,
    /// Contexts spawned and not yet exited
    live: usize,
    outcome: Option<SimError>,
    handles: Vec<JoinHandle<()>>,
}

/// A simulated uniprocessor implementing [`Scheduler`].
pub struct Machine {
    table: ThreadTable,
    state: Mutex<State>,
    baton: Condvar,
    next_tid: AtomicU32,
}

impl Machine {
    fn new() -> Self {
        Self {
            table: ThreadTable::new(),
            state: Mutex::new(State::default()),
            baton: Condvar::new(),
            next_tid: AtomicU32::new(1),
        }
    }

    /// Boots a machine whose first context, `main`, runs at `priority`, and
    /// drives it until every context has exited.
    pub fn run<F>(priority: Priority, main: F) -> Result<(), SimError>
    where
        F: FnOnce(Arc<Machine>) + Send + 'static,
    {
        let machine = Arc::new(Machine::new());
        let handle = machine.clone();
        machine.spawn("main", priority, move || main(handle));

        {
            let mut st = machine.lock_state();
            st.running = machine.pick_next(&mut st);
            machine.baton.notify_all();
            while st.outcome.is_none() && st.live > 0 {
                st = machine.wait(st);
            }
        }

        let handles = std::mem::take(&mut machine.lock_state().handles);
        for handle in handles {
            // Contexts catch their own panics; a host-level failure here
            // already left its outcome behind.
            let _ = handle.join();
        }

        let outcome = machine.lock_state().outcome.take();
        match outcome {
            Some(err) => {
                log::debug!("sim: run failed: {}", err);
                Err(err)
            }
            None => Ok(()),
        }
    }

    /// Creates a ready context running `body`.
    ///
    /// Like thread creation in the kernel, the caller yields at once if the
    /// new context outranks it.
    pub fn spawn<F>(self: &Arc<Self>, name: &str, priority: Priority, body: F) -> ThreadId
    where
        F: FnOnce() + Send + 'static,
    {
        let tid = ThreadId(self.next_tid.fetch_add(1, Ordering::Relaxed));
        self.table.register(tid, name, priority);

        let machine = self.clone();
        let thread_name = name.to_string();
        let handle = std::thread::spawn(move || machine.thread_main(tid, thread_name, body));
        {
            let mut st = self.lock_state();
            st.handles.push(handle);
            st.ready.push(tid);
            st.live += 1;
        }
        log::trace!("sim: spawned {} ({}) at priority {}", tid, name, priority);

        if let Some(me) = CURRENT.with(Cell::get) {
            if priority > self.table.priority(me) {
                self.yield_current();
            }
        }
        tid
    }

    /// Runs `handler` as an interrupt handler on the current context.
    ///
    /// A yield requested by the handler happens after it returns.
    pub fn interrupt<R>(&self, handler: impl FnOnce() -> R) -> R {
        {
            let mut st = self.lock_state();
            assert!(!st.interrupt, "nested interrupt");
            st.interrupt = true;
        }
        let was_enabled = self.push_off();
        let result = handler();
        self.pop_off(was_enabled);

        let pending = {
            let mut st = self.lock_state();
            st.interrupt = false;
            std::mem::take(&mut st.yield_pending)
        };
        if pending {
            self.yield_current();
        }
        result
    }

    /// Whether preemption is enabled for the calling context.
    pub fn preemption_enabled(&self) -> bool {
        PREEMPT_ENABLED.with(Cell::get)
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, st: MutexGuard<'a, State>) -> MutexGuard<'a, State> {
        self.baton.wait(st).unwrap_or_else(PoisonError::into_inner)
    }

    /// Removes the best ready context: highest effective priority, earliest
    /// among equals.
    fn pick_next(&self, st: &mut State) -> Option<ThreadId> {
        let mut best: Option<(usize, Priority)> = None;
        for (i, tid) in st.ready.iter().enumerate() {
            let priority = self.table.priority(*tid);
            if best.is_none_or(|(_, top)| priority > top) {
                best = Some((i, priority));
            }
        }
        best.map(|(i, _)| st.ready.remove(i))
    }

    /// Passes the baton on after the running context left the ready set.
    fn dispatch(&self, st: &mut State) {
        st.running = self.pick_next(st);
        if st.running.is_none() && !st.blocked.is_empty() {
            let mut blocked: Vec<_> = st.blocked.iter().copied().collect();
            blocked.sort();
            log::debug!("sim: deadlock, blocked: {:?}", blocked);
            st.outcome.get_or_insert(SimError::Deadlock { blocked });
        }
        self.baton.notify_all();
    }

    /// Hands the core to the best ready context and waits until `me` is
    /// dispatched again.
    fn switch(&self, mut st: MutexGuard<'_, State>, me: ThreadId) {
        self.dispatch(&mut st);
        if st.running != Some(me) {
            log::trace!("sim: {} -> {:?}", me, st.running);
        }
        self.park(st, me);
    }

    fn park(&self, mut st: MutexGuard<'_, State>, me: ThreadId) {
        loop {
            if st.outcome.is_some() {
                drop(st);
                panic::resume_unwind(Box::new(Aborted));
            }
            if st.running == Some(me) {
                return;
            }
            st = self.wait(st);
        }
    }

    fn thread_main(self: Arc<Self>, tid: ThreadId, name: String, body: impl FnOnce()) {
        CURRENT.with(|current| current.set(Some(tid)));
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let st = self.lock_state();
            self.park(st, tid);
            body();
        }));

        match result {
            Ok(()) => {
                self.table.unregister(tid);
                let mut st = self.lock_state();
                st.live -= 1;
                log::trace!("sim: {} ({}) exited", tid, name);
                self.dispatch(&mut st);
            }
            Err(payload) if payload.is::<Aborted>() => {}
            Err(payload) => {
                let message = if let Some(s) = payload.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "non-string panic payload".to_string()
                };
                let mut st = self.lock_state();
                st.outcome.get_or_insert(SimError::Panicked { thread: name, message });
                self.baton.notify_all();
            }
        }
    }
}

impl Scheduler for Machine {
    fn threads(&self) -> &ThreadTable {
        &self.table
    }

    fn current(&self) -> ThreadId {
        match CURRENT.with(Cell::get) {
            Some(tid) => tid,
            None => panic!("scheduler used outside a simulated context"),
        }
    }

    fn in_interrupt(&self) -> bool {
        self.lock_state().interrupt
    }

    fn push_off(&self) -> bool {
        PREEMPT_ENABLED.with(|enabled| enabled.replace(false))
    }

    fn pop_off(&self, was_enabled: bool) {
        PREEMPT_ENABLED.with(|enabled| enabled.set(was_enabled));
    }

    fn suspend_current(&self) {
        let me = self.current();
        debug_assert!(!self.preemption_enabled(), "{} suspended with preemption enabled", me);
        let mut st = self.lock_state();
        st.blocked.insert(me);
        self.switch(st, me);
    }

    fn resume(&self, thread: ThreadId) {
        let mut st = self.lock_state();
        if !st.blocked.remove(&thread) {
            log::warn!("sim: resume of {}, which is not blocked", thread);
            return;
        }
        st.ready.push(thread);
    }

    fn yield_current(&self) {
        let me = self.current();
        let mut st = self.lock_state();
        st.ready.push(me);
        self.switch(st, me);
    }

    fn yield_on_return(&self) {
        self.lock_state().yield_pending = true;
    }

    fn max_ready_priority(&self) -> Option<Priority> {
        let st = self.lock_state();
        st.ready.iter().map(|tid| self.table.priority(*tid)).max()
    }
}
