//! Semaphore scenarios on the simulated machine.

mod common;

use std::sync::Arc;

use common::{pri, Journal};
use nos_sync::{Priority, Semaphore};
use nos_sync_sim::Machine;
use proptest::prelude::*;

#[test]
fn test_up_wakes_highest_priority_waiter() {
    let journal = Journal::new();
    let j = journal.clone();
    Machine::run(Priority::MIN, move |m| {
        let sema = Arc::new(Semaphore::new(m.clone(), 0));
        for priority in [3u8, 7, 5] {
            let (s, jj) = (sema.clone(), j.clone());
            m.spawn(&format!("priority {priority}"), pri(priority), move || {
                s.down();
                jj.record(format!("priority {priority} woke"));
            });
        }
        for _ in 0..3 {
            sema.up();
        }
        j.record("main: done");
    })
    .expect("run completes");

    assert_eq!(
        journal.entries(),
        ["priority 7 woke", "priority 5 woke", "priority 3 woke", "main: done"]
    );
}

#[test]
fn test_ping_pong() {
    let journal = Journal::new();
    let j = journal.clone();
    Machine::run(Priority::DEFAULT, move |m| {
        let ping = Arc::new(Semaphore::new(m.clone(), 0));
        let pong = Arc::new(Semaphore::new(m.clone(), 0));

        let (p, q, jj) = (ping.clone(), pong.clone(), j.clone());
        m.spawn("pong", Priority::DEFAULT, move || {
            for _ in 0..10 {
                p.down();
                q.up();
            }
            jj.record("pong: done");
        });

        for _ in 0..10 {
            ping.up();
            pong.down();
        }
        j.record(format!("main: done, ping {} pong {}", ping.value(), pong.value()));
    })
    .expect("run completes");

    assert_eq!(journal.entries(), ["pong: done", "main: done, ping 0 pong 0"]);
}

#[test]
fn test_up_from_interrupt_defers_yield() {
    let journal = Journal::new();
    let j = journal.clone();
    Machine::run(pri(10), move |m| {
        let sema = Arc::new(Semaphore::new(m.clone(), 0));
        let (s, jj) = (sema.clone(), j.clone());
        m.spawn("waiter", pri(20), move || {
            s.down();
            jj.record("waiter: woke");
        });

        m.interrupt(|| {
            sema.up();
            j.record("handler: returning");
        });
        j.record("main: after interrupt");
    })
    .expect("run completes");

    assert_eq!(
        journal.entries(),
        ["handler: returning", "waiter: woke", "main: after interrupt"]
    );
}

#[test]
fn test_down_by_sole_context_is_deadlock() {
    let err = Machine::run(Priority::DEFAULT, |m| {
        let sema = Semaphore::new(m.clone(), 0);
        sema.down();
    })
    .unwrap_err();
    assert_eq!(err.panic_message(), None);
    assert!(err.to_string().starts_with("deadlock"));
}

#[test]
fn test_preemption_restored_after_blocking() {
    let journal = Journal::new();
    let j = journal.clone();
    Machine::run(pri(10), move |m| {
        let sema = Arc::new(Semaphore::new(m.clone(), 0));
        let (s, jj, mm) = (sema.clone(), j.clone(), m.clone());
        m.spawn("waiter", pri(20), move || {
            s.down();
            jj.record(format!("waiter: preemption {}", mm.preemption_enabled()));
        });
        sema.up();
        j.record(format!("main: preemption {}", m.preemption_enabled()));
    })
    .expect("run completes");

    assert_eq!(
        journal.entries(),
        ["waiter: preemption true", "main: preemption true"]
    );
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn test_wake_order_follows_priority_then_arrival(priorities in proptest::collection::vec(1u8..=8, 1..8)) {
        let journal = Journal::new();
        let j = journal.clone();
        let spawned = priorities.clone();
        Machine::run(Priority::MIN, move |m| {
            let sema = Arc::new(Semaphore::new(m.clone(), 0));
            for (i, priority) in spawned.iter().enumerate() {
                let (s, jj) = (sema.clone(), j.clone());
                m.spawn(&format!("waiter {i}"), pri(*priority), move || {
                    s.down();
                    jj.record(i.to_string());
                });
            }
            for _ in 0..spawned.len() {
                sema.up();
            }
        })
        .expect("run completes");

        let mut expected: Vec<usize> = (0..priorities.len()).collect();
        expected.sort_by_key(|i| std::cmp::Reverse(priorities[*i]));
        let expected: Vec<String> = expected.iter().map(|i| i.to_string()).collect();
        prop_assert_eq!(journal.entries(), expected);
    }
}
