//! Stacks on several threads sharing one profiler.

use std::sync::{Arc, Barrier};
use std::thread;

use rtimer_runtime::{
    Clock, Config, DynamicCategory, ManualClock, ProfilerBuilder, ReportMode, StaticId, TimerStack,
};

const THREADS: usize = 8;
const CALLS: u64 = 500;

#[test]
fn threads_intern_the_same_names_once() {
    let state = ProfilerBuilder::new(Config::default())
        .clock(Clock::manual(ManualClock::new(0)))
        .static_timers(["Worker"])
        .build()
        .unwrap();
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let state = Arc::clone(&state);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut stack = TimerStack::new(state);
                barrier.wait();
                stack.begin_static(StaticId::new(0));
                for i in 0..CALLS {
                    let name = format!("f{}.R:1", i % 10);
                    let h = stack
                        .begin_dynamic(&name, DynamicCategory::UserFunction)
                        .unwrap();
                    stack.end_dynamic(h);
                }
                stack.end_static(StaticId::new(0));
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(state.registry().len(), 1 + 10);
    let report = state.snapshot(ReportMode::Raw).unwrap();
    assert_eq!(report.rows.len(), 11);
    assert_eq!(report.row("Worker").unwrap().counters.calls, THREADS as u64);
    let user_calls: u64 = report
        .rows
        .iter()
        .filter(|r| r.category.is_dynamic())
        .map(|r| r.counters.calls)
        .sum();
    assert_eq!(user_calls, THREADS as u64 * CALLS);
    assert_eq!(state.protocol_violations(), 0);
}

#[test]
fn real_clock_threads_partition_their_own_time() {
    let state = ProfilerBuilder::new(Config::default())
        .static_timers(["outer", "inner"])
        .build()
        .unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let state = Arc::clone(&state);
            thread::spawn(move || {
                let mut stack = TimerStack::new(state);
                for _ in 0..1_000 {
                    let mut outer = stack.static_scope(StaticId::new(0));
                    let _inner = outer.static_scope(StaticId::new(1));
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let report = state.snapshot(ReportMode::Raw).unwrap();
    let outer = report.row("outer").unwrap().counters;
    let inner = report.row("inner").unwrap().counters;
    assert_eq!((outer.calls, inner.calls), (4_000, 4_000));
    assert_eq!(outer.aborts + inner.aborts, 0);
    assert!(outer.total_ticks >= inner.total_ticks);
    assert_eq!(outer.total_ticks, outer.self_ticks + inner.total_ticks);
}
