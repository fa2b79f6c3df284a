//! Shared profiler state and its builder.
//!
//! A `ProfilerState` is built once per run, before the host executes
//! anything, and shared by every `TimerStack` through an `Arc`. Building it
//! fixes the clock, registers the static timers (definition order) and the
//! function table (table order), and measures begin/end overhead.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::calibrate::{self, Overhead};
use crate::clock::{Clock, TimerUnit};
use crate::config::Config;
use crate::error::Error;
use crate::registry::{DynamicCategory, FunctionEntry, Registry, SlotId};
use crate::report::{Report, ReportMode};

/// Index of a static timer in the order it was declared to the builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StaticId(u32);

impl StaticId {
    pub const fn new(index: usize) -> Self {
        Self(index as u32)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

pub struct ProfilerBuilder {
    config: Config,
    clock: Option<Clock>,
    statics: Vec<String>,
    table: Vec<FunctionEntry>,
}

impl ProfilerBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            clock: None,
            statics: Vec::new(),
            table: Vec::new(),
        }
    }

    /// Use `clock` instead of the source named in the config.
    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Declare static timers. Their `StaticId`s follow declaration order,
    /// across calls.
    pub fn static_timers<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.statics.extend(names.into_iter().map(Into::into));
        self
    }

    /// Declare function-table entries, in table order.
    pub fn function_table(mut self, entries: impl IntoIterator<Item = FunctionEntry>) -> Self {
        self.table.extend(entries);
        self
    }

    pub fn build(self) -> Result<Arc<ProfilerState>, Error> {
        let clock = match self.clock {
            Some(clock) => clock,
            None => Clock::new(self.config.clock)?,
        };
        let overhead = calibrate::measure(&clock, self.config.calibration_rounds);

        let policy = &self.config.statics;
        policy.validate()?;
        for name in policy.unknown_names(&self.statics) {
            tracing::warn!(timer = name, "static timer policy names an undeclared timer");
        }

        let mut seen = HashSet::new();
        let mut registry = Registry::new();
        for name in &self.statics {
            if !seen.insert(name.as_str()) {
                return Err(Error::DuplicateStatic(name.clone()));
            }
            let enabled = policy.is_enabled(name);
            registry.register_static(name, enabled)?;
            if !enabled {
                tracing::debug!(timer = name.as_str(), "static timer disabled");
            }
        }
        for entry in &self.table {
            registry.register_function_table(entry)?;
        }

        tracing::debug!(
            clock = clock.kind_label(),
            unit = %clock.unit(),
            statics = registry.static_count(),
            table = registry.table_len(),
            avg = overhead.avg_ticks,
            cold = overhead.cold_ticks,
            "profiler ready"
        );

        let start_sample = clock.sample();
        Ok(Arc::new(ProfilerState {
            config: self.config,
            clock,
            registry,
            static_names: self.statics,
            overhead,
            start_sample,
            start_time_ms: timestamp_ms(),
            live: AtomicU64::new(0),
            protocol_violations: AtomicU64::new(0),
        }))
    }
}

#[derive(Debug)]
pub struct ProfilerState {
    config: Config,
    clock: Clock,
    registry: Registry,
    /// Every declared static name, disabled ones included, by `StaticId`.
    static_names: Vec<String>,
    overhead: Overhead,
    start_sample: u64,
    start_time_ms: u64,
    /// Activations pushed and not yet closed, across all stacks.
    live: AtomicU64,
    protocol_violations: AtomicU64,
}

impl ProfilerState {
    pub fn builder(config: Config) -> ProfilerBuilder {
        ProfilerBuilder::new(config)
    }

    /// A state over `registry` alone: default config, no statics and no
    /// overhead figures of its own.
    pub(crate) fn bare(clock: Clock, registry: Registry) -> Arc<Self> {
        let start_sample = clock.sample();
        Arc::new(Self {
            config: Config::default(),
            clock,
            registry,
            static_names: Vec::new(),
            overhead: Overhead::default(),
            start_sample,
            start_time_ms: 0,
            live: AtomicU64::new(0),
            protocol_violations: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn unit(&self) -> TimerUnit {
        self.clock.unit()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn overhead(&self) -> Overhead {
        self.overhead
    }

    pub fn start_sample(&self) -> u64 {
        self.start_sample
    }

    pub fn start_time_ms(&self) -> u64 {
        self.start_time_ms
    }

    /// Look up a static timer by its declared name.
    pub fn static_id(&self, name: &str) -> Option<StaticId> {
        self.static_names
            .iter()
            .position(|n| n == name)
            .map(StaticId::new)
    }

    /// Slot behind a static timer; `None` when it is disabled. Hosts can
    /// resolve this once at startup and call `TimerStack::begin` directly.
    #[inline]
    pub fn static_slot(&self, id: StaticId) -> Option<SlotId> {
        self.registry.static_slot(id.index())
    }

    pub fn intern_dynamic(&self, name: &str, category: DynamicCategory) -> Result<SlotId, Error> {
        self.registry.intern_dynamic(name, category)
    }

    pub fn mark_bytecode_used(&self, id: SlotId) {
        if let Some(slot) = self.registry.slot(id) {
            slot.mark_bytecode();
        }
    }

    #[inline]
    pub(crate) fn activation_opened(&self) {
        self.live.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn activation_closed(&self) {
        self.live.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn live_activations(&self) -> u64 {
        self.live.load(Ordering::Relaxed)
    }

    pub(crate) fn note_protocol_violation(&self) {
        self.protocol_violations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn protocol_violations(&self) -> u64 {
        self.protocol_violations.load(Ordering::Relaxed)
    }

    /// Snapshot every slot. Fails while any activation is live on any stack.
    pub fn snapshot(&self, mode: ReportMode) -> Result<Report, Error> {
        Report::capture(self, mode, self.config.verbose)
    }

    /// Write a report in the configured mode to `<runs_dir>/<unix-ms>.tsv`.
    pub fn write_report(&self) -> Result<PathBuf, Error> {
        let dir = self.config.runs_dir();
        std::fs::create_dir_all(&dir).map_err(|source| Error::ReportWrite {
            path: dir.clone(),
            source,
        })?;
        let path = dir.join(format!("{}.tsv", timestamp_ms()));
        self.write_report_to(&path, self.config.mode)?;
        Ok(path)
    }

    pub fn write_report_to(&self, path: &Path, mode: ReportMode) -> Result<(), Error> {
        let report = self.snapshot(mode)?;
        let write = || -> std::io::Result<()> {
            let mut out = BufWriter::new(File::create(path)?);
            report.write_tsv(&mut out)?;
            out.flush()
        };
        write().map_err(|source| Error::ReportWrite {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), rows = report.rows.len(), "report written");
        Ok(())
    }
}

/// Return the current time as milliseconds since the Unix epoch.
fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
