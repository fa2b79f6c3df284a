//! Clock sources for timer samples.
//!
//! A `Clock` is chosen once, when the profiler is built, and every sample in
//! the run comes from it. Samples are opaque `u64` ticks; only differences
//! between samples from the same clock mean anything.
//!
//! * `Monotonic` reads `Instant` and reports nanoseconds since the clock was
//!   created. Portable and unaffected by frequency scaling.
//! * `CycleCounter` reads the hardware counter (TSC on x86_64, CNTVCT on
//!   aarch64) and reports raw ticks. Cheaper, but ticks are not converted to
//!   wall time, and a thread that migrates between cores or sockets whose
//!   counters disagree will produce skewed deltas. That is not detected.
//! * `Manual` is driven explicitly through a shared [`ManualClock`].

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::error::Error;

/// Which hardware or OS source a profiler reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockKind {
    #[default]
    Monotonic,
    Cycles,
}

impl FromStr for ClockKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "monotonic" | "wall" | "ns" => Ok(ClockKind::Monotonic),
            "cycles" | "tsc" | "ticks" => Ok(ClockKind::Cycles),
            other => Err(Error::UnsupportedClock(other.to_owned())),
        }
    }
}

/// Unit label carried by every sample of a clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TimerUnit {
    #[serde(rename = "ns")]
    Nanoseconds,
    #[serde(rename = "ticks")]
    CpuTicks,
}

impl TimerUnit {
    pub fn label(self) -> &'static str {
        match self {
            TimerUnit::Nanoseconds => "ns",
            TimerUnit::CpuTicks => "ticks",
        }
    }
}

impl fmt::Display for TimerUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// An explicitly driven clock. Cloned handles share the same time.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: u64) -> Arc<Self> {
        Arc::new(Self {
            now: AtomicU64::new(start),
        })
    }

    pub fn now(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }

    pub fn set(&self, ticks: u64) {
        self.now.store(ticks, Ordering::Relaxed);
    }

    /// Move the clock forward and return the new time.
    pub fn advance(&self, ticks: u64) -> u64 {
        self.now.fetch_add(ticks, Ordering::Relaxed) + ticks
    }
}

#[derive(Debug, Clone)]
pub enum Clock {
    Monotonic { epoch: Instant },
    CycleCounter,
    Manual(Arc<ManualClock>),
}

impl Clock {
    /// Build the clock for `kind`. Fails if the source does not exist on this
    /// target; there is no fallback to another source.
    pub fn new(kind: ClockKind) -> Result<Self, Error> {
        match kind {
            ClockKind::Monotonic => Ok(Clock::Monotonic {
                epoch: Instant::now(),
            }),
            ClockKind::Cycles => {
                if cycle_counter_available() {
                    Ok(Clock::CycleCounter)
                } else {
                    Err(Error::ClockUnavailable {
                        arch: std::env::consts::ARCH,
                    })
                }
            }
        }
    }

    pub fn manual(clock: Arc<ManualClock>) -> Self {
        Clock::Manual(clock)
    }

    #[inline(always)]
    pub fn sample(&self) -> u64 {
        match self {
            Clock::Monotonic { epoch } => epoch.elapsed().as_nanos() as u64,
            Clock::CycleCounter => read_cycle_counter(),
            Clock::Manual(clock) => clock.now(),
        }
    }

    pub fn unit(&self) -> TimerUnit {
        match self {
            Clock::Monotonic { .. } => TimerUnit::Nanoseconds,
            Clock::CycleCounter | Clock::Manual(_) => TimerUnit::CpuTicks,
        }
    }

    pub fn kind_label(&self) -> &'static str {
        match self {
            Clock::Monotonic { .. } => "monotonic",
            Clock::CycleCounter => "cycles",
            Clock::Manual(_) => "manual",
        }
    }
}

pub(crate) fn cycle_counter_available() -> bool {
    cfg!(any(target_arch = "x86_64", target_arch = "aarch64"))
}

/// Read the hardware cycle counter. Single inline instruction on both
/// x86_64 (`rdtsc`) and aarch64 (`mrs cntvct_el0`).
#[inline(always)]
fn read_cycle_counter() -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        // SAFETY: rdtsc is available on every x86_64 CPU and has no side effects.
        unsafe { core::arch::x86_64::_rdtsc() }
    }
    #[cfg(target_arch = "aarch64")]
    {
        let val: u64;
        // SAFETY: cntvct_el0 is readable from EL0 on every aarch64 target we build for.
        unsafe { core::arch::asm!("mrs {}, cntvct_el0", out(reg) val) };
        val
    }
    // `Clock::new` refuses `Cycles` on other targets, so this is unreachable
    // in practice.
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        0
    }
}
