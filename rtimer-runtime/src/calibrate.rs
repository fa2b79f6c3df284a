//! Self-measurement of begin/end cost.
//!
//! Two numbers go into every report: one cold begin/end pair timed right
//! after the clock is created (caches and branch predictors untrained), and
//! the average of `rounds` back-to-back pairs with no work between them,
//! nested inside an enclosing activation the way host timers usually are.
//!
//! Both are taken on a real `TimerStack` over a scratch profiler state, so
//! they include the slot cache, the parent credit and the live counter. The
//! scratch slots never reach the host's registry or its reports.

use std::sync::Arc;

use crate::clock::Clock;
use crate::profiler::ProfilerState;
use crate::registry::{Registry, SlotId};
use crate::stack::TimerStack;

#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize)]
pub struct Overhead {
    /// Mean ticks per begin/end pair.
    pub avg_ticks: f64,
    /// Ticks for the first, cold begin/end pair.
    pub cold_ticks: u64,
    pub rounds: u32,
}

#[inline(never)]
fn begin_end(stack: &mut TimerStack, timer: SlotId) {
    stack.begin(timer);
    stack.end(timer);
}

pub(crate) fn measure(clock: &Clock, rounds: u32) -> Overhead {
    let (registry, outer, timer) = Registry::calibration();
    let state = ProfilerState::bare(clock.clone(), registry);
    measure_on(&state, outer, timer, rounds)
}

fn measure_on(state: &Arc<ProfilerState>, outer: SlotId, timer: SlotId, rounds: u32) -> Overhead {
    let clock = state.clock();
    let mut stack = TimerStack::new(Arc::clone(state));

    let start = clock.sample();
    begin_end(&mut stack, timer);
    let cold_ticks = clock.sample().saturating_sub(start);

    let avg_ticks = if rounds == 0 {
        0.0
    } else {
        stack.begin(outer);
        let start = clock.sample();
        for _ in 0..rounds {
            begin_end(&mut stack, timer);
        }
        let ticks = clock.sample().saturating_sub(start);
        stack.end(outer);
        ticks as f64 / f64::from(rounds)
    };

    Overhead {
        avg_ticks,
        cold_ticks,
        rounds,
    }
}
