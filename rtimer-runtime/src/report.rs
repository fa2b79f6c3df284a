//! Report snapshots and the tab-separated run format.

use std::fmt;
use std::io::{self, Write};
use std::str::FromStr;

use crate::calibrate::Overhead;
use crate::clock::TimerUnit;
use crate::cpu_clock;
use crate::error::Error;
use crate::profiler::ProfilerState;
use crate::registry::{Category, Slot, SlotCounters, SlotId, TableKind};

pub const FORMAT_VERSION: u32 = 1;

pub const BUILTIN_SUM: &str = "BuiltinSum";
pub const SPECIAL_SUM: &str = "SpecialSum";
pub const USER_FUNCTION_SUM: &str = "UserFunctionSum";

/// Appended to the name of a user function that ran bytecode.
pub const BYTECODE_SUFFIX: &str = " [bc]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportMode {
    /// Category order, no percentages.
    Raw,
    /// Sorted by self time with a percentage of the run.
    #[default]
    Processed,
}

impl ReportMode {
    pub fn label(self) -> &'static str {
        match self {
            ReportMode::Raw => "raw",
            ReportMode::Processed => "processed",
        }
    }
}

impl fmt::Display for ReportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for ReportMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "raw" => Ok(ReportMode::Raw),
            "processed" => Ok(ReportMode::Processed),
            other => Err(format!("unknown report mode '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ReportRow {
    pub name: String,
    pub slot: SlotId,
    #[serde(flatten)]
    pub category: Category,
    #[serde(flatten)]
    pub counters: SlotCounters,
    /// Processed mode only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub self_percentage: Option<f64>,
}

impl ReportRow {
    fn from_slot(slot: &Slot) -> Self {
        Self {
            name: slot.name().to_owned(),
            slot: slot.id(),
            category: slot.category(),
            counters: slot.counters(),
            self_percentage: None,
        }
    }

    /// Name as written to the run file.
    pub fn display_name(&self) -> String {
        if self.counters.has_bytecode {
            format!("{}{BYTECODE_SUFFIX}", self.name)
        } else {
            self.name.clone()
        }
    }
}

/// A synthetic row summing one group of slots.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct AggregateSum {
    pub name: &'static str,
    #[serde(flatten)]
    pub counters: SlotCounters,
}

impl AggregateSum {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            counters: SlotCounters::default(),
        }
    }

    fn add(&mut self, c: &SlotCounters) {
        let sum = &mut self.counters;
        sum.calls += c.calls;
        sum.aborts += c.aborts;
        sum.self_ticks += c.self_ticks;
        sum.total_ticks += c.total_ticks;
        sum.recursive_calls += c.recursive_calls;
        sum.has_bytecode |= c.has_bytecode;
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct RunMetadata {
    pub format_version: u32,
    pub mode: ReportMode,
    pub clock: &'static str,
    pub unit: TimerUnit,
    pub start_time_ms: u64,
    /// Ticks from profiler construction to the snapshot.
    pub total_run_ticks: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_cpu_ns: Option<u64>,
    pub overhead: Overhead,
    pub protocol_violations: u64,
    /// Registered slots, reported or not.
    pub slots: usize,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Report {
    pub metadata: RunMetadata,
    pub rows: Vec<ReportRow>,
    /// Always `BuiltinSum`, `SpecialSum`, `UserFunctionSum`, in that order.
    pub sums: Vec<AggregateSum>,
}

impl Report {
    /// Read every slot of `state`. Fails while any activation is live.
    pub fn capture(state: &ProfilerState, mode: ReportMode, verbose: bool) -> Result<Self, Error> {
        let live = state.live_activations();
        if live != 0 {
            return Err(Error::NotDrained { live });
        }
        let total_run_ticks = state.clock().sample().saturating_sub(state.start_sample());
        let slots = state.registry().slots();

        let mut builtin = AggregateSum::new(BUILTIN_SUM);
        let mut special = AggregateSum::new(SPECIAL_SUM);
        let mut user = AggregateSum::new(USER_FUNCTION_SUM);
        for slot in &slots {
            let counters = slot.counters();
            match slot.category() {
                Category::FunctionTable {
                    kind: TableKind::Builtin,
                    ..
                } => builtin.add(&counters),
                Category::FunctionTable {
                    kind: TableKind::Special,
                    ..
                } => special.add(&counters),
                Category::UserFunction => user.add(&counters),
                _ => {}
            }
        }

        let mut ordered: Vec<&Slot> = slots
            .iter()
            .map(|s| &**s)
            .filter(|s| verbose || s.category() == Category::Static || s.counters().calls > 0)
            .collect();
        ordered.sort_by(|a, b| {
            (a.category().rank(), a.order(), a.name())
                .cmp(&(b.category().rank(), b.order(), b.name()))
        });
        let mut rows: Vec<ReportRow> = ordered.into_iter().map(ReportRow::from_slot).collect();

        if mode == ReportMode::Processed {
            // Stable: equal self times keep category order.
            rows.sort_by(|a, b| b.counters.self_ticks.cmp(&a.counters.self_ticks));
            for row in &mut rows {
                row.self_percentage = Some(percentage(row.counters.self_ticks, total_run_ticks));
            }
        }

        Ok(Report {
            metadata: RunMetadata {
                format_version: FORMAT_VERSION,
                mode,
                clock: state.clock().kind_label(),
                unit: state.unit(),
                start_time_ms: state.start_time_ms(),
                total_run_ticks,
                process_cpu_ns: cpu_clock::process_cpu_ns(),
                overhead: state.overhead(),
                protocol_violations: state.protocol_violations(),
                slots: slots.len(),
            },
            rows,
            sums: vec![builtin, special, user],
        })
    }

    pub fn row(&self, name: &str) -> Option<&ReportRow> {
        self.rows.iter().find(|r| r.name == name)
    }

    pub fn sum(&self, name: &str) -> Option<&AggregateSum> {
        self.sums.iter().find(|s| s.name == name)
    }

    pub fn write_tsv<W: Write>(&self, out: &mut W) -> io::Result<()> {
        let m = &self.metadata;
        writeln!(out, "#!rtimer\t{}", m.format_version)?;
        writeln!(out, "Mode\t{}", m.mode)?;
        writeln!(out, "Clock\t{}", m.clock)?;
        writeln!(out, "Unit\t{}", m.unit)?;
        writeln!(out, "StartTime\t{}", m.start_time_ms)?;
        writeln!(out, "TotalRuntime\t{}", m.total_run_ticks)?;
        if let Some(ns) = m.process_cpu_ns {
            writeln!(out, "ProcessCpuNs\t{ns}")?;
        }
        writeln!(out, "OverheadAvg\t{:.3}", m.overhead.avg_ticks)?;
        writeln!(out, "OverheadCold\t{}", m.overhead.cold_ticks)?;
        writeln!(out, "CalibrationRounds\t{}", m.overhead.rounds)?;
        writeln!(out, "ProtocolViolations\t{}", m.protocol_violations)?;
        writeln!(out, "Slots\t{}", m.slots)?;

        let processed = m.mode == ReportMode::Processed;
        if processed {
            writeln!(out, "#!rows\tpct\tname\tself\ttotal\tcalls\taborts")?;
        } else {
            writeln!(out, "#!rows\tname\tself\ttotal\tcalls\taborts")?;
        }
        for row in &self.rows {
            if processed {
                write!(out, "{:.2}\t", row.self_percentage.unwrap_or(0.0))?;
            }
            write_counters(out, &row.display_name(), &row.counters)?;
        }

        writeln!(out, "#!sums\tname\tself\ttotal\tcalls\taborts")?;
        for sum in &self.sums {
            write_counters(out, sum.name, &sum.counters)?;
        }
        Ok(())
    }

    pub fn to_tsv(&self) -> String {
        let mut buf = Vec::new();
        // Writing into a Vec cannot fail.
        let _ = self.write_tsv(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    }
}

fn write_counters<W: Write>(out: &mut W, name: &str, c: &SlotCounters) -> io::Result<()> {
    writeln!(
        out,
        "{name}\t{}\t{}\t{}\t{}",
        c.self_ticks, c.total_ticks, c.calls, c.aborts
    )
}

fn percentage(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}
