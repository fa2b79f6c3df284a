//! Randomized host traces against the accounting invariants.

use std::sync::Arc;

use proptest::prelude::*;
use rtimer_runtime::{Clock, Config, ManualClock, ProfilerBuilder, SlotId, StaticId, TimerStack};

const SLOTS: usize = 4;

#[derive(Debug, Clone)]
enum Op {
    Begin(usize),
    End(usize),
    EndTop,
    Unwind(usize),
    Advance(u64),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..SLOTS).prop_map(Op::Begin),
        1 => (0..SLOTS).prop_map(Op::End),
        3 => Just(Op::EndTop),
        1 => (0..6usize).prop_map(Op::Unwind),
        4 => (0..50u64).prop_map(Op::Advance),
    ]
}

proptest! {
    /// Self time over all slots equals the time the stack was non-empty, and
    /// no slot reports more aborts than calls.
    #[test]
    fn self_time_partitions_busy_time(ops in prop::collection::vec(op(), 0..200)) {
        let clock = ManualClock::new(0);
        let state = ProfilerBuilder::new(Config::default())
            .clock(Clock::manual(Arc::clone(&clock)))
            .static_timers(["s0", "s1", "s2", "s3"])
            .build()
            .unwrap();
        let ids: Vec<SlotId> = (0..SLOTS)
            .map(|i| state.static_slot(StaticId::new(i)).unwrap())
            .collect();
        let mut stack = TimerStack::new(Arc::clone(&state));

        let mut busy = 0u64;
        let mut begins = 0u64;
        for op in ops {
            match op {
                Op::Begin(i) => {
                    stack.begin(ids[i]);
                    begins += 1;
                }
                Op::End(i) => stack.end(ids[i]),
                Op::EndTop => {
                    if let Some(top) = stack.top() {
                        stack.end(top);
                    }
                }
                Op::Unwind(depth) => stack.notify_unwind(depth),
                Op::Advance(ticks) => {
                    if !stack.is_empty() {
                        busy += ticks;
                    }
                    clock.advance(ticks);
                }
            }
        }
        stack.notify_unwind(0);
        prop_assert_eq!(state.live_activations(), 0);

        let counters: Vec<_> = ids
            .iter()
            .map(|&id| state.registry().slot(id).unwrap().counters())
            .collect();
        let self_sum: u64 = counters.iter().map(|c| c.self_ticks).sum();
        let calls: u64 = counters.iter().map(|c| c.calls).sum();
        prop_assert_eq!(self_sum, busy);
        prop_assert_eq!(calls, begins);
        for c in &counters {
            prop_assert!(c.aborts <= c.calls);
            prop_assert!(c.recursive_calls <= c.calls);
            prop_assert!(c.self_ticks <= c.total_ticks);
        }
    }

    /// Interning the same names in any order yields one slot per name.
    #[test]
    fn interning_is_idempotent(names in prop::collection::vec("[a-z]{1,3}\\.R:[0-9]", 1..40)) {
        let state = ProfilerBuilder::new(Config::default())
            .clock(Clock::manual(ManualClock::new(0)))
            .build()
            .unwrap();
        let mut distinct = names.clone();
        distinct.sort();
        distinct.dedup();

        for name in &names {
            let first = state
                .intern_dynamic(name, rtimer_runtime::DynamicCategory::UserFunction)
                .unwrap();
            let again = state
                .intern_dynamic(name, rtimer_runtime::DynamicCategory::UserFunction)
                .unwrap();
            prop_assert_eq!(first, again);
        }
        prop_assert_eq!(state.registry().len(), distinct.len());
    }
}
