//! Per-thread timer stack and the attribution engine.
//!
//! The host calls `begin` when an instrumented region starts and `end` when
//! it returns. Each call pushes or pops an `Activation`. Self time is
//! deferred: whatever elapsed since the top activation's `last_sample` is
//! credited to the top slot whenever control leaves it (a child begins, or
//! the top itself ends), and the parent's `last_sample` is reset when a child
//! ends. No activation ever subtracts its children after the fact, so the
//! self times of all slots partition the run exactly.
//!
//! Non-local exits reach the engine as `notify_unwind(depth)`: every
//! activation above `depth` is closed with one shared timestamp and counted
//! as an abort. Each `begin` thus gets exactly one terminating event.
//!
//! One `TimerStack` belongs to one thread. Stacks on different threads can
//! share a `ProfilerState`; they only meet in the slot counters, which are
//! atomic.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crate::config::MAX_STACK_CAPACITY;
use crate::error::Error;
use crate::names::FunctionIdentity;
use crate::profiler::{ProfilerState, StaticId};
use crate::registry::{DynamicCategory, Slot, SlotId};

#[inline(always)]
fn elapsed(from: u64, to: u64) -> u64 {
    to.saturating_sub(from)
}

/// One live occurrence of a slot on the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Activation {
    pub(crate) slot: SlotId,
    pub(crate) start: u64,
    pub(crate) last_sample: u64,
    /// Another activation of the same slot was live below this one.
    pub(crate) recursive: bool,
}

impl Activation {
    #[inline]
    pub(crate) fn open(slot: SlotId, now: u64, recursive: bool) -> Self {
        Self {
            slot,
            start: now,
            last_sample: now,
            recursive,
        }
    }

    /// Credit the final self and total time to `slot`.
    #[inline]
    pub(crate) fn finish(self, slot: &Slot, now: u64, aborted: bool) {
        slot.add_self(elapsed(self.last_sample, now));
        slot.add_total(elapsed(self.start, now));
        if aborted {
            slot.record_abort();
        }
    }
}

/// Returned by `begin_dynamic`; pass it back to `end_dynamic`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivationHandle {
    pub slot: SlotId,
    /// Stack depth the activation was pushed at.
    pub depth: usize,
}

#[derive(Debug)]
struct CachedSlot {
    slot: Arc<Slot>,
    /// Activations of this slot currently on this stack.
    live: u32,
}

#[derive(Debug)]
pub struct TimerStack {
    state: Arc<ProfilerState>,
    frames: Vec<Activation>,
    /// Slot handles resolved by this stack, indexed by `SlotId`. Keeps the
    /// registry lock off the begin/end path after the first use of a slot.
    cache: Vec<Option<CachedSlot>>,
}

impl TimerStack {
    /// A stack pre-sized to the configured capacity, capped at
    /// `MAX_STACK_CAPACITY` for configs built by hand.
    pub fn new(state: Arc<ProfilerState>) -> Self {
        let capacity = state.config().stack_capacity.min(MAX_STACK_CAPACITY);
        let slots = state.registry().len();
        let mut cache = Vec::new();
        cache.resize_with(slots, || None);
        Self {
            state,
            frames: Vec::with_capacity(capacity),
            cache,
        }
    }

    pub fn state(&self) -> &Arc<ProfilerState> {
        &self.state
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Slot of the innermost live activation.
    pub fn top(&self) -> Option<SlotId> {
        self.frames.last().map(|a| a.slot)
    }

    /// Slots from the outermost to the innermost activation.
    pub fn slots(&self) -> impl Iterator<Item = SlotId> + '_ {
        self.frames.iter().map(|a| a.slot)
    }

    fn resolve(&mut self, id: SlotId) -> Option<&mut CachedSlot> {
        let idx = id.index();
        if !matches!(self.cache.get(idx), Some(Some(_))) {
            // Only ids this registry knows may grow the cache.
            let slot = self.state.registry().slot(id)?;
            if idx >= self.cache.len() {
                self.cache.resize_with(idx + 1, || None);
            }
            self.cache[idx] = Some(CachedSlot { slot, live: 0 });
        }
        self.cache[idx].as_mut()
    }

    /// Start timing `id`.
    #[inline]
    pub fn begin(&mut self, id: SlotId) {
        let now = self.state.clock().sample();

        if let Some(top) = self.frames.last_mut() {
            if let Some(Some(parent)) = self.cache.get(top.slot.index()) {
                parent.slot.add_self(elapsed(top.last_sample, now));
            }
            top.last_sample = now;
        }

        let recursive = match self.resolve(id) {
            Some(entry) => {
                let recursive = entry.live > 0;
                entry.live += 1;
                entry.slot.record_call(recursive);
                recursive
            }
            None => {
                self.state.note_protocol_violation();
                tracing::warn!(slot = %id, "begin on a slot that was never registered; ignored");
                return;
            }
        };

        self.frames.push(Activation::open(id, now, recursive));
        self.state.activation_opened();
    }

    /// Stop timing `id`, which must be the innermost live activation.
    ///
    /// A mismatched `end` is recovered rather than trusted: the nearest live
    /// activation of `id` is found, everything above it is closed as an
    /// abort, and then it is ended normally. An `end` with no live activation
    /// of `id` is dropped. Both cases count as protocol violations.
    #[inline]
    pub fn end(&mut self, id: SlotId) {
        let now = self.state.clock().sample();
        match self.frames.last() {
            Some(top) if top.slot == id => {
                self.close_top(now, false);
            }
            _ => self.end_mismatched(id, now),
        }
    }

    #[cold]
    fn end_mismatched(&mut self, id: SlotId, now: u64) {
        self.state.note_protocol_violation();
        match self.frames.iter().rposition(|a| a.slot == id) {
            Some(pos) => {
                let skipped = self.frames.len() - pos - 1;
                tracing::warn!(
                    slot = %id,
                    top = ?self.top(),
                    skipped,
                    "end does not match the top of the timer stack; closing skipped timers as aborts"
                );
                while self.frames.len() > pos + 1 {
                    self.close_top(now, true);
                }
                self.close_top(now, false);
            }
            None => {
                tracing::warn!(
                    slot = %id,
                    depth = self.frames.len(),
                    "end without a live activation; ignored"
                );
            }
        }
    }

    /// Close every activation above `target_depth` as an abort, all at one
    /// timestamp. Returns how many were closed; a stack already at or below
    /// `target_depth` is left alone.
    pub fn abort(&mut self, target_depth: usize) -> usize {
        if self.frames.len() <= target_depth {
            return 0;
        }
        let now = self.state.clock().sample();
        let mut closed = 0;
        while self.frames.len() > target_depth {
            self.close_top(now, true);
            closed += 1;
        }
        tracing::trace!(target_depth, closed, "unwound timer stack");
        closed
    }

    /// Host hook for non-local exits: control is about to resume at
    /// `target_depth`.
    pub fn notify_unwind(&mut self, target_depth: usize) {
        self.abort(target_depth);
    }

    fn close_top(&mut self, now: u64, aborted: bool) -> Option<SlotId> {
        let activation = self.frames.pop()?;
        if let Some(Some(entry)) = self.cache.get_mut(activation.slot.index()) {
            activation.finish(&entry.slot, now, aborted);
            entry.live = entry.live.saturating_sub(1);
        }
        if let Some(parent) = self.frames.last_mut() {
            parent.last_sample = now;
        }
        self.state.activation_closed();
        Some(activation.slot)
    }

    /// Begin a static timer. Disabled statics are no-ops.
    #[inline]
    pub fn begin_static(&mut self, id: StaticId) {
        if let Some(slot) = self.state.static_slot(id) {
            self.begin(slot);
        }
    }

    #[inline]
    pub fn end_static(&mut self, id: StaticId) {
        if let Some(slot) = self.state.static_slot(id) {
            self.end(slot);
        }
    }

    /// Begin the function-table entry at `index`.
    #[inline]
    pub fn begin_function(&mut self, index: usize) {
        match self.state.registry().table_slot(index) {
            Some(slot) => self.begin(slot),
            None => tracing::warn!(index, "begin on an unknown function-table entry; ignored"),
        }
    }

    #[inline]
    pub fn end_function(&mut self, index: usize) {
        if let Some(slot) = self.state.registry().table_slot(index) {
            self.end(slot);
        }
    }

    /// Intern `name` (if new) and begin its timer.
    pub fn begin_dynamic(
        &mut self,
        name: &str,
        category: DynamicCategory,
    ) -> Result<ActivationHandle, Error> {
        let slot = self.state.intern_dynamic(name, category)?;
        let depth = self.frames.len();
        self.begin(slot);
        Ok(ActivationHandle { slot, depth })
    }

    /// Begin the user-function timer for whatever the host knows about the
    /// callee.
    pub fn begin_user_function(
        &mut self,
        identity: &FunctionIdentity<'_>,
    ) -> Result<ActivationHandle, Error> {
        self.begin_dynamic(&identity.timer_name(), DynamicCategory::UserFunction)
    }

    pub fn end_dynamic(&mut self, handle: ActivationHandle) {
        self.end(handle.slot);
    }

    /// Set the sticky bytecode flag on a user-function slot.
    pub fn mark_bytecode_used(&mut self, id: SlotId) {
        if let Some(entry) = self.resolve(id) {
            entry.slot.mark_bytecode();
        }
    }

    /// Begin `id` and return a guard that ends it on drop.
    pub fn scope(&mut self, id: SlotId) -> Scope<'_> {
        let base = self.frames.len();
        self.begin(id);
        Scope {
            stack: self,
            slot: Some(id),
            base,
        }
    }

    /// Like `scope`, for a static timer. A disabled static yields a guard
    /// that does nothing.
    pub fn static_scope(&mut self, id: StaticId) -> Scope<'_> {
        match self.state.static_slot(id) {
            Some(slot) => self.scope(slot),
            None => {
                let base = self.frames.len();
                Scope {
                    stack: self,
                    slot: None,
                    base,
                }
            }
        }
    }
}

impl Drop for TimerStack {
    fn drop(&mut self) {
        if !self.frames.is_empty() {
            tracing::warn!(
                live = self.frames.len(),
                "timer stack dropped with live activations; closing them as aborts"
            );
            self.abort(0);
        }
    }
}

/// RAII activation. Ends its timer when dropped, or unwinds back to the depth
/// it was opened at if the thread is panicking.
///
/// Derefs to the stack so nested timers can be opened through the guard.
#[must_use = "dropping the scope immediately ends the timer; bind it with `let mut scope = ...`"]
pub struct Scope<'a> {
    stack: &'a mut TimerStack,
    slot: Option<SlotId>,
    base: usize,
}

impl Scope<'_> {
    pub fn slot(&self) -> Option<SlotId> {
        self.slot
    }
}

impl Deref for Scope<'_> {
    type Target = TimerStack;

    fn deref(&self) -> &TimerStack {
        &*self.stack
    }
}

impl DerefMut for Scope<'_> {
    fn deref_mut(&mut self) -> &mut TimerStack {
        &mut *self.stack
    }
}

impl Drop for Scope<'_> {
    fn drop(&mut self) {
        let Some(slot) = self.slot else {
            return;
        };
        // Already closed by an unwind delivered inside the scope.
        if self.stack.depth() <= self.base {
            return;
        }
        if std::thread::panicking() {
            self.stack.abort(self.base);
        } else {
            self.stack.end(slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::Config;
    use crate::profiler::ProfilerBuilder;

    fn profiler(statics: &[&str]) -> (Arc<ManualClock>, Arc<ProfilerState>) {
        let manual = ManualClock::new(0);
        let state = ProfilerBuilder::new(Config::default())
            .clock(Clock::manual(Arc::clone(&manual)))
            .static_timers(statics.iter().copied())
            .build()
            .unwrap();
        (manual, state)
    }

    fn counters(state: &ProfilerState, id: SlotId) -> crate::SlotCounters {
        state.registry().slot(id).unwrap().counters()
    }

    #[test]
    fn nested_begin_end_matches_worked_example() {
        let (clock, state) = profiler(&["A", "B"]);
        let a = state.static_slot(StaticId::new(0)).unwrap();
        let b = state.static_slot(StaticId::new(1)).unwrap();
        let mut stack = TimerStack::new(Arc::clone(&state));

        clock.set(0);
        stack.begin(a);
        clock.set(1);
        stack.begin(b);
        clock.set(3);
        stack.end(b);
        clock.set(4);
        stack.end(a);

        let ca = counters(&state, a);
        let cb = counters(&state, b);
        assert_eq!((ca.self_ticks, ca.total_ticks, ca.calls), (2, 4, 1));
        assert_eq!((cb.self_ticks, cb.total_ticks, cb.calls), (2, 2, 1));
        assert!(stack.is_empty());
        assert_eq!(state.live_activations(), 0);
    }

    #[test]
    fn recursion_sets_marker_and_counts_recursive_calls() {
        let (clock, state) = profiler(&["f"]);
        let f = state.static_slot(StaticId::new(0)).unwrap();
        let mut stack = TimerStack::new(Arc::clone(&state));

        for _ in 0..3 {
            stack.begin(f);
            clock.advance(1);
        }
        assert_eq!(
            stack.frames.iter().map(|a| a.recursive).collect::<Vec<_>>(),
            vec![false, true, true]
        );
        for _ in 0..3 {
            stack.end(f);
        }
        let c = counters(&state, f);
        assert_eq!(c.calls, 3);
        assert_eq!(c.recursive_calls, 2);
        assert_eq!(c.self_ticks, 3);
        // Activations lasted 3, 2 and 1 ticks.
        assert_eq!(c.total_ticks, 6);
    }

    #[test]
    fn abort_is_a_noop_at_or_below_target() {
        let (_clock, state) = profiler(&["A"]);
        let a = state.static_slot(StaticId::new(0)).unwrap();
        let mut stack = TimerStack::new(Arc::clone(&state));
        stack.begin(a);
        assert_eq!(stack.abort(1), 0);
        assert_eq!(stack.abort(5), 0);
        assert_eq!(stack.depth(), 1);
        stack.end(a);
        assert_eq!(counters(&state, a).aborts, 0);
    }

    #[test]
    fn mismatched_end_closes_skipped_frames_as_aborts() {
        let (clock, state) = profiler(&["outer", "inner"]);
        let outer = state.static_slot(StaticId::new(0)).unwrap();
        let inner = state.static_slot(StaticId::new(1)).unwrap();
        let mut stack = TimerStack::new(Arc::clone(&state));

        stack.begin(outer);
        clock.set(2);
        stack.begin(inner);
        clock.set(5);
        stack.end(outer);

        assert!(stack.is_empty());
        let ci = counters(&state, inner);
        let co = counters(&state, outer);
        assert_eq!((ci.aborts, ci.self_ticks, ci.total_ticks), (1, 3, 3));
        assert_eq!((co.aborts, co.self_ticks, co.total_ticks), (0, 2, 5));
        assert_eq!(state.protocol_violations(), 1);
    }

    #[test]
    fn end_without_live_activation_is_dropped() {
        let (_clock, state) = profiler(&["A", "B"]);
        let a = state.static_slot(StaticId::new(0)).unwrap();
        let b = state.static_slot(StaticId::new(1)).unwrap();
        let mut stack = TimerStack::new(Arc::clone(&state));
        stack.begin(a);
        stack.end(b);
        assert_eq!(stack.depth(), 1);
        assert_eq!(stack.top(), Some(a));
        assert_eq!(state.protocol_violations(), 1);
        stack.end(a);
    }

    #[test]
    fn foreign_slot_id_does_not_grow_the_cache() {
        let (_clock, state) = profiler(&["A"]);
        let (_other_clock, other) = profiler(&[]);
        for i in 0..64 {
            other
                .intern_dynamic(&format!("f{i}.R:1"), DynamicCategory::UserFunction)
                .unwrap();
        }
        let foreign = other
            .registry()
            .lookup_dynamic("f63.R:1", DynamicCategory::UserFunction)
            .unwrap();

        let mut stack = TimerStack::new(Arc::clone(&state));
        let before = stack.cache.len();
        stack.begin(foreign);
        assert!(stack.is_empty());
        assert_eq!(stack.cache.len(), before);
        assert_eq!(state.protocol_violations(), 1);
    }

    #[test]
    fn oversized_capacity_is_capped() {
        let mut config = Config::default();
        config.stack_capacity = usize::MAX;
        let state = ProfilerBuilder::new(config)
            .clock(Clock::manual(ManualClock::new(0)))
            .static_timers(["A"])
            .build()
            .unwrap();
        let mut stack = TimerStack::new(Arc::clone(&state));
        assert!(stack.frames.capacity() <= MAX_STACK_CAPACITY);
        let a = state.static_slot(StaticId::new(0)).unwrap();
        stack.begin(a);
        stack.end(a);
        assert!(stack.is_empty());
    }

    #[test]
    fn disabled_static_is_a_noop() {
        let manual = ManualClock::new(0);
        let mut config = Config::default();
        config.statics.deny = vec!["GcInternal".into()];
        let state = ProfilerBuilder::new(config)
            .clock(Clock::manual(manual))
            .static_timers(["Startup", "GcInternal"])
            .build()
            .unwrap();
        let mut stack = TimerStack::new(Arc::clone(&state));
        stack.begin_static(StaticId::new(1));
        assert!(stack.is_empty());
        stack.end_static(StaticId::new(1));
        assert_eq!(state.protocol_violations(), 0);
    }

    #[test]
    fn scope_ends_on_drop_and_nests_through_deref() {
        let (clock, state) = profiler(&["outer", "inner"]);
        let outer = state.static_slot(StaticId::new(0)).unwrap();
        let inner = state.static_slot(StaticId::new(1)).unwrap();
        let mut stack = TimerStack::new(Arc::clone(&state));
        {
            let mut s = stack.scope(outer);
            clock.advance(1);
            {
                let _i = s.scope(inner);
                clock.advance(2);
            }
            assert_eq!(s.depth(), 1);
            clock.advance(1);
        }
        assert!(stack.is_empty());
        assert_eq!(counters(&state, outer).self_ticks, 2);
        assert_eq!(counters(&state, inner).self_ticks, 2);
        assert_eq!(counters(&state, outer).total_ticks, 4);
    }

    #[test]
    fn scope_skips_end_after_unwind_inside_it() {
        let (_clock, state) = profiler(&["A"]);
        let a = state.static_slot(StaticId::new(0)).unwrap();
        let mut stack = TimerStack::new(Arc::clone(&state));
        {
            let mut s = stack.scope(a);
            s.notify_unwind(0);
        }
        assert_eq!(state.protocol_violations(), 0);
        assert_eq!(counters(&state, a).aborts, 1);
    }

    #[test]
    fn panicking_scope_aborts_instead_of_ending() {
        let (_clock, state) = profiler(&["guarded", "leaf"]);
        let guarded = state.static_slot(StaticId::new(0)).unwrap();
        let leaf = state.static_slot(StaticId::new(1)).unwrap();
        let shared = Arc::clone(&state);

        let result = std::thread::spawn(move || {
            let mut stack = TimerStack::new(shared);
            let mut s = stack.scope(guarded);
            s.begin(leaf);
            panic!("host error");
        })
        .join();
        assert!(result.is_err());

        assert_eq!(counters(&state, guarded).aborts, 1);
        assert_eq!(counters(&state, leaf).aborts, 1);
        assert_eq!(state.live_activations(), 0);
        assert_eq!(state.protocol_violations(), 0);
    }

    #[test]
    fn dropping_a_live_stack_flushes_it() {
        let (_clock, state) = profiler(&["A"]);
        let a = state.static_slot(StaticId::new(0)).unwrap();
        {
            let mut stack = TimerStack::new(Arc::clone(&state));
            stack.begin(a);
            stack.begin(a);
        }
        let c = counters(&state, a);
        assert_eq!((c.calls, c.aborts), (2, 2));
        assert_eq!(state.live_activations(), 0);
    }

    #[test]
    fn dynamic_timers_share_slots_across_calls() {
        let (clock, state) = profiler(&[]);
        let mut stack = TimerStack::new(Arc::clone(&state));
        let h1 = stack
            .begin_dynamic("utils.R:10", DynamicCategory::UserFunction)
            .unwrap();
        clock.advance(3);
        stack.end_dynamic(h1);
        let h2 = stack
            .begin_user_function(&FunctionIdentity::Source {
                file: "utils.R",
                line: 10,
            })
            .unwrap();
        stack.mark_bytecode_used(h2.slot);
        stack.end_dynamic(h2);

        assert_eq!(h1.slot, h2.slot);
        assert_eq!(h1.depth, 0);
        let c = counters(&state, h1.slot);
        assert_eq!(c.calls, 2);
        assert_eq!(c.self_ticks, 3);
        assert!(c.has_bytecode);
    }

    #[test]
    fn function_table_entries_are_timed_by_index() {
        let manual = ManualClock::new(0);
        let state = ProfilerBuilder::new(Config::default())
            .clock(Clock::manual(Arc::clone(&manual)))
            .function_table([
                crate::FunctionEntry::builtin("sum"),
                crate::FunctionEntry::special("if"),
            ])
            .build()
            .unwrap();
        let mut stack = TimerStack::new(Arc::clone(&state));
        stack.begin_function(1);
        manual.advance(7);
        stack.end_function(1);
        stack.begin_function(9);
        assert!(stack.is_empty());

        let slot = state.registry().table_slot(1).unwrap();
        assert_eq!(counters(&state, slot).self_ticks, 7);
    }
}
