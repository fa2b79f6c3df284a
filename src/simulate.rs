//! A synthetic interpreter host driving the runtime.
//!
//! The workload is a REPL evaluating a recursive user function through a
//! small function table. Some iterations raise a condition at the bottom of
//! the recursion; it propagates as an `Err` that skips every pending `end`,
//! and the REPL's handler reports the non-local exit with `notify_unwind`,
//! the same way an interpreter reports a longjmp.

use std::sync::Arc;

use rtimer_runtime::{
    DynamicCategory, FunctionEntry, ProfilerBuilder, ProfilerState, SlotId, StaticId, TimerStack,
};

use crate::error::Error;

pub const STATIC_TIMERS: [&str; 4] = ["Startup", "Repl", "Eval", "GcInternal"];

const STARTUP: StaticId = StaticId::new(0);
const REPL: StaticId = StaticId::new(1);
const EVAL: StaticId = StaticId::new(2);
const GC: StaticId = StaticId::new(3);

const PLUS: usize = 0;
const SUM: usize = 1;
const IF: usize = 2;

pub fn function_table() -> Vec<FunctionEntry> {
    vec![
        FunctionEntry::builtin("+"),
        FunctionEntry::builtin("sum"),
        FunctionEntry::special("if"),
    ]
}

/// Declare the simulated host's timers on a builder.
pub fn register(builder: ProfilerBuilder) -> ProfilerBuilder {
    builder
        .static_timers(STATIC_TIMERS)
        .function_table(function_table())
}

#[derive(Debug, Clone, Copy)]
pub struct SimulationOptions {
    /// Argument to the recursive function.
    pub depth: u32,
    pub iterations: u32,
    /// Every `fail_every`-th iteration raises a condition; 0 never does.
    pub fail_every: u32,
    /// Busy-work units per function body.
    pub work: u32,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            depth: 12,
            iterations: 100,
            fail_every: 5,
            work: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimulationSummary {
    pub iterations: u32,
    pub unwinds: u32,
    pub checksum: u64,
}

/// Raised inside the workload; carries nothing.
struct Condition;

struct Host {
    stack: TimerStack,
    fib_timer: SlotId,
    blas_timer: SlotId,
    options: SimulationOptions,
}

fn spin(units: u32) {
    let mut acc = 0u64;
    for i in 0..u64::from(units) * 16 {
        acc = acc.wrapping_mul(6364136223846793005).wrapping_add(i);
    }
    std::hint::black_box(acc);
}

impl Host {
    fn fib(&mut self, n: u32, fail: bool) -> Result<u64, Condition> {
        self.stack.begin(self.fib_timer);
        self.stack.begin_function(IF);
        spin(self.options.work / 4);
        self.stack.end_function(IF);

        if fail && n <= 1 {
            return Err(Condition);
        }
        if n < 2 {
            spin(self.options.work);
            self.stack.end(self.fib_timer);
            return Ok(u64::from(n));
        }
        let a = self.fib(n - 1, fail)?;
        let b = self.fib(n - 2, fail)?;

        self.stack.begin_function(PLUS);
        let result = a.wrapping_add(b);
        self.stack.end_function(PLUS);
        self.stack.end(self.fib_timer);
        Ok(result)
    }

    fn iteration(&mut self, i: u32) -> (u64, bool) {
        let fail = self.options.fail_every != 0 && (i + 1) % self.options.fail_every == 0;
        self.stack.begin_static(REPL);
        let handler_depth = self.stack.depth();

        self.stack.begin_static(EVAL);
        let (value, unwound) = match self.fib(self.options.depth, fail) {
            Ok(v) => {
                self.stack.end_static(EVAL);
                (v, false)
            }
            Err(Condition) => {
                self.stack.notify_unwind(handler_depth);
                (0, true)
            }
        };

        self.stack.begin(self.blas_timer);
        self.stack.begin_function(SUM);
        spin(self.options.work * 2);
        self.stack.end_function(SUM);
        self.stack.end(self.blas_timer);

        if i % 10 == 9 {
            self.stack.begin_static(GC);
            spin(self.options.work);
            self.stack.end_static(GC);
        }
        self.stack.end_static(REPL);
        (value, unwound)
    }
}

/// Run the workload on the calling thread. The stack is drained on return.
pub fn run(
    state: &Arc<ProfilerState>,
    options: SimulationOptions,
) -> Result<SimulationSummary, Error> {
    let fib = state.intern_dynamic("fib.R:1", DynamicCategory::UserFunction)?;
    let blas = state.intern_dynamic("C_dgemm", DynamicCategory::ExternalFunction)?;
    state.mark_bytecode_used(fib);

    let mut host = Host {
        stack: TimerStack::new(Arc::clone(state)),
        fib_timer: fib,
        blas_timer: blas,
        options,
    };
    host.stack.begin_static(STARTUP);
    spin(options.work * 8);
    host.stack.end_static(STARTUP);

    let mut summary = SimulationSummary {
        iterations: options.iterations,
        ..SimulationSummary::default()
    };
    for i in 0..options.iterations {
        let (value, unwound) = host.iteration(i);
        summary.checksum = summary.checksum.wrapping_add(value);
        summary.unwinds += u32::from(unwound);
    }
    tracing::debug!(
        iterations = summary.iterations,
        unwinds = summary.unwinds,
        "simulation finished"
    );
    Ok(summary)
}
