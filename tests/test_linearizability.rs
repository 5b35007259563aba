extern crate rand;
extern crate rs_splitref_stack;

use rand::Rng;
use rs_splitref_stack::lockfree_stack::LockFreeStack;
use rs_splitref_stack::util;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Op {
    Push(u32),
    Pop(Option<u32>),
}

/// One completed call. `invoke` and `response` come from a shared logical clock, so
/// `a.response < b.invoke` means `a` returned before `b` was called.
#[derive(Debug, Clone, Copy)]
struct Event {
    op: Op,
    invoke: u64,
    response: u64,
}

/// Backtracking search for a sequential LIFO order that respects real-time precedence.
struct Checker<'a> {
    events: &'a [Event],
    failed: HashSet<(u64, Vec<u32>)>,
}

impl<'a> Checker<'a> {
    fn new(events: &'a [Event]) -> Self {
        assert!(events.len() <= 64);
        Checker {
            events,
            failed: HashSet::new(),
        }
    }

    fn is_linearizable(&mut self) -> bool {
        let mut model = vec![];
        self.search(0, &mut model)
    }

    fn search(&mut self, done: u64, model: &mut Vec<u32>) -> bool {
        let n = self.events.len();
        if done.count_ones() as usize == n {
            return true;
        }
        if self.failed.contains(&(done, model.clone())) {
            return false;
        }
        for i in 0..n {
            if done & (1 << i) != 0 || !self.is_minimal(done, i) {
                continue;
            }
            let e = self.events[i];
            match e.op {
                Op::Push(v) => {
                    model.push(v);
                    if self.search(done | (1 << i), model) {
                        return true;
                    }
                    model.pop();
                }
                Op::Pop(Some(v)) => {
                    if model.last() == Some(&v) {
                        model.pop();
                        if self.search(done | (1 << i), model) {
                            return true;
                        }
                        model.push(v);
                    }
                }
                Op::Pop(None) => {
                    if model.is_empty() && self.search(done | (1 << i), model) {
                        return true;
                    }
                }
            }
        }
        self.failed.insert((done, model.clone()));
        false
    }

    /// No pending event returned before event `i` was invoked.
    fn is_minimal(&self, done: u64, i: usize) -> bool {
        let invoke = self.events[i].invoke;
        self.events
            .iter()
            .enumerate()
            .all(|(j, e)| j == i || done & (1 << j) != 0 || e.response >= invoke)
    }
}

fn run_round(thread_cnt: usize, ops_per_thread: usize, preload: u32) -> Vec<Event> {
    let stack = Arc::new(LockFreeStack::new());
    for v in 0..preload {
        stack.push(v);
    }
    let clock = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(thread_cnt));

    let threads: Vec<_> = (0..thread_cnt)
        .map(|t| {
            let stack = stack.clone();
            let clock = clock.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                let mut events = vec![];
                barrier.wait();
                for i in 0..ops_per_thread {
                    for _ in 0..rng.gen_range(0..64) {
                        util::pause();
                    }
                    let invoke = clock.fetch_add(1, Ordering::SeqCst);
                    let op = if rng.gen_bool(0.5) {
                        let v = 1000 + (t * ops_per_thread + i) as u32;
                        stack.push(v);
                        Op::Push(v)
                    } else {
                        Op::Pop(stack.try_pop())
                    };
                    let response = clock.fetch_add(1, Ordering::SeqCst);
                    events.push(Event {
                        op,
                        invoke,
                        response,
                    });
                }
                events
            })
        })
        .collect();

    let mut history = vec![];
    for t in threads {
        history.extend(t.join().unwrap());
    }
    history.sort_by_key(|e| e.invoke);

    // Preloaded values are pushes that completed before anything else started.
    let shift = 2 * preload as u64;
    let mut events: Vec<Event> = (0..preload)
        .map(|v| Event {
            op: Op::Push(v),
            invoke: 2 * v as u64,
            response: 2 * v as u64 + 1,
        })
        .collect();
    for e in history {
        events.push(Event {
            op: e.op,
            invoke: e.invoke + shift,
            response: e.response + shift,
        });
    }
    events
}

#[test]
fn test_checker_accepts_sequential_lifo() {
    let events = [
        Event {
            op: Op::Push(1),
            invoke: 0,
            response: 1,
        },
        Event {
            op: Op::Push(2),
            invoke: 2,
            response: 3,
        },
        Event {
            op: Op::Pop(Some(2)),
            invoke: 4,
            response: 5,
        },
        Event {
            op: Op::Pop(Some(1)),
            invoke: 6,
            response: 7,
        },
        Event {
            op: Op::Pop(None),
            invoke: 8,
            response: 9,
        },
    ];
    assert!(Checker::new(&events).is_linearizable());
}

#[test]
fn test_checker_rejects_fifo() {
    let events = [
        Event {
            op: Op::Push(1),
            invoke: 0,
            response: 1,
        },
        Event {
            op: Op::Push(2),
            invoke: 2,
            response: 3,
        },
        Event {
            op: Op::Pop(Some(1)),
            invoke: 4,
            response: 5,
        },
    ];
    assert!(!Checker::new(&events).is_linearizable());
}

#[test]
fn test_checker_uses_overlap() {
    // The two pushes overlap, so either may be on top.
    let events = [
        Event {
            op: Op::Push(1),
            invoke: 0,
            response: 3,
        },
        Event {
            op: Op::Push(2),
            invoke: 1,
            response: 2,
        },
        Event {
            op: Op::Pop(Some(1)),
            invoke: 4,
            response: 5,
        },
        Event {
            op: Op::Pop(Some(2)),
            invoke: 6,
            response: 7,
        },
    ];
    assert!(Checker::new(&events).is_linearizable());

    let events = [
        Event {
            op: Op::Push(1),
            invoke: 0,
            response: 1,
        },
        Event {
            op: Op::Pop(None),
            invoke: 2,
            response: 3,
        },
    ];
    assert!(!Checker::new(&events).is_linearizable());
}

#[test]
fn test_random_histories_linearizable() {
    for round in 0..300 {
        let preload = if round % 3 == 0 { 0 } else { 2 };
        let events = run_round(3, 6, preload);
        assert!(
            Checker::new(&events).is_linearizable(),
            "round {} not linearizable: {:?}",
            round,
            events
        );
    }
}

#[test]
fn test_random_histories_many_threads() {
    for round in 0..50 {
        let events = run_round(6, 4, 1);
        assert!(
            Checker::new(&events).is_linearizable(),
            "round {} not linearizable: {:?}",
            round,
            events
        );
    }
}
