//! Deterministic call-tree timers for interpreter hosts.
//!
//! Build one [`ProfilerState`] per run, give each host thread a
//! [`TimerStack`], and call `begin`/`end` around every timed region. Self and
//! total time are attributed exactly, recursion included, and non-local exits
//! are reconciled through [`TimerStack::notify_unwind`]. When every stack has
//! drained, [`ProfilerState::snapshot`] or [`ProfilerState::write_report`]
//! produces the report.
//!
//! ```
//! use std::sync::Arc;
//! use rtimer_runtime::{
//!     Clock, Config, ManualClock, ProfilerBuilder, ReportMode, StaticId, TimerStack,
//! };
//!
//! let clock = ManualClock::new(0);
//! let state = ProfilerBuilder::new(Config::default())
//!     .clock(Clock::manual(Arc::clone(&clock)))
//!     .static_timers(["Startup", "Repl"])
//!     .build()?;
//!
//! let mut stack = TimerStack::new(Arc::clone(&state));
//! stack.begin_static(StaticId::new(0));
//! clock.advance(10);
//! stack.end_static(StaticId::new(0));
//!
//! let report = state.snapshot(ReportMode::Raw)?;
//! assert_eq!(report.row("Startup").map(|r| r.counters.self_ticks), Some(10));
//! # Ok::<(), rtimer_runtime::Error>(())
//! ```

#![allow(unsafe_code)]

mod calibrate;
mod clock;
mod config;
mod cpu_clock;
mod error;
pub mod names;
mod profiler;
mod registry;
mod report;
mod stack;

pub use calibrate::Overhead;
pub use clock::{Clock, ClockKind, ManualClock, TimerUnit};
pub use config::{
    Config, PolicyAction, StaticPolicy, DEFAULT_CALIBRATION_ROUNDS, DEFAULT_STACK_CAPACITY,
    MAX_STACK_CAPACITY,
};
pub use error::Error;
pub use names::FunctionIdentity;
pub use profiler::{ProfilerBuilder, ProfilerState, StaticId};
pub use registry::{
    Category, DynamicCategory, FunctionEntry, Registry, Slot, SlotCounters, SlotId, TableKind,
    MAX_NAME_LEN,
};
pub use report::{
    AggregateSum, Report, ReportMode, ReportRow, RunMetadata, BUILTIN_SUM, BYTECODE_SUFFIX,
    FORMAT_VERSION, SPECIAL_SUM, USER_FUNCTION_SUM,
};
pub use stack::{ActivationHandle, Scope, TimerStack};
