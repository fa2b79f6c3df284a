use std::collections::HashMap;
use std::path::{Path, PathBuf};

use rtimer_runtime::{BYTECODE_SUFFIX, FORMAT_VERSION};

use crate::error::Error;

/// A profiling run loaded from a `.tsv` file written by rtimer-runtime.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Run {
    pub header: RunHeader,
    pub rows: Vec<RunRow>,
    pub sums: Vec<RunRow>,
}

/// The `Key<TAB>value` lines before the rows.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RunHeader {
    pub version: u32,
    pub mode: String,
    pub clock: String,
    pub unit: String,
    pub start_time_ms: u64,
    pub total_runtime: u64,
    pub process_cpu_ns: Option<u64>,
    pub overhead_avg: f64,
    pub overhead_cold: u64,
    pub calibration_rounds: u32,
    pub protocol_violations: u64,
    pub slots: usize,
}

/// Timing data for one timer within a run.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RunRow {
    pub name: String,
    /// Present in processed runs.
    pub self_percentage: Option<f64>,
    pub self_ticks: u64,
    pub total_ticks: u64,
    pub calls: u64,
    pub aborts: u64,
    pub bytecode: bool,
}

enum Section {
    Header,
    Rows { processed: bool },
    Sums,
}

/// Read a profiling run from a file on disk.
pub fn load_run(path: &Path) -> Result<Run, Error> {
    let contents = std::fs::read_to_string(path).map_err(|source| Error::RunReadError {
        path: path.to_path_buf(),
        source,
    })?;
    parse_run(&contents).map_err(|reason| Error::InvalidRunData {
        path: path.to_path_buf(),
        reason,
    })
}

/// Parse the tab-separated run format.
pub fn parse_run(text: &str) -> Result<Run, String> {
    let mut lines = text.lines().enumerate();
    let version = match lines.next() {
        Some((_, first)) => match first.split_once('\t') {
            Some(("#!rtimer", v)) => v
                .trim()
                .parse::<u32>()
                .map_err(|_| format!("bad format version '{v}'"))?,
            _ => return Err("missing #!rtimer marker".into()),
        },
        None => return Err("empty file".into()),
    };
    if version != FORMAT_VERSION {
        return Err(format!(
            "format version {version} is not supported (expected {FORMAT_VERSION})"
        ));
    }

    let mut run = Run {
        header: RunHeader {
            version,
            ..RunHeader::default()
        },
        rows: Vec::new(),
        sums: Vec::new(),
    };
    let mut section = Section::Header;

    for (idx, line) in lines {
        let lineno = idx + 1;
        if line.is_empty() {
            continue;
        }
        if let Some(marker) = line.strip_prefix("#!rows") {
            let processed = marker.split('\t').nth(1) == Some("pct");
            section = Section::Rows { processed };
            continue;
        }
        if line.starts_with("#!sums") {
            section = Section::Sums;
            continue;
        }
        match section {
            Section::Header => {
                let (key, value) = line
                    .split_once('\t')
                    .ok_or_else(|| format!("line {lineno}: expected Key<TAB>value"))?;
                apply_header(&mut run.header, key, value)
                    .map_err(|e| format!("line {lineno}: {e}"))?;
            }
            Section::Rows { processed } => {
                let row = parse_row(line, processed).map_err(|e| format!("line {lineno}: {e}"))?;
                run.rows.push(row);
            }
            Section::Sums => {
                let row = parse_row(line, false).map_err(|e| format!("line {lineno}: {e}"))?;
                run.sums.push(row);
            }
        }
    }
    Ok(run)
}

fn apply_header(header: &mut RunHeader, key: &str, value: &str) -> Result<(), String> {
    fn num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, String> {
        value
            .trim()
            .parse()
            .map_err(|_| format!("bad value for {key}: '{value}'"))
    }
    match key {
        "Mode" => header.mode = value.to_owned(),
        "Clock" => header.clock = value.to_owned(),
        "Unit" => header.unit = value.to_owned(),
        "StartTime" => header.start_time_ms = num(key, value)?,
        "TotalRuntime" => header.total_runtime = num(key, value)?,
        "ProcessCpuNs" => header.process_cpu_ns = Some(num(key, value)?),
        "OverheadAvg" => header.overhead_avg = num(key, value)?,
        "OverheadCold" => header.overhead_cold = num(key, value)?,
        "CalibrationRounds" => header.calibration_rounds = num(key, value)?,
        "ProtocolViolations" => header.protocol_violations = num(key, value)?,
        "Slots" => header.slots = num(key, value)?,
        // Newer writers may add keys.
        _ => tracing::debug!(key, "ignoring unknown run header key"),
    }
    Ok(())
}

fn parse_row(line: &str, processed: bool) -> Result<RunRow, String> {
    let fields: Vec<&str> = line.split('\t').collect();
    let expected = if processed { 6 } else { 5 };
    if fields.len() != expected {
        return Err(format!(
            "expected {expected} columns, found {}",
            fields.len()
        ));
    }
    let (pct, rest) = if processed {
        let pct: f64 = fields[0]
            .parse()
            .map_err(|_| format!("bad percentage '{}'", fields[0]))?;
        (Some(pct), &fields[1..])
    } else {
        (None, &fields[..])
    };
    let int = |s: &str| -> Result<u64, String> {
        s.parse().map_err(|_| format!("bad count '{s}'"))
    };
    let (name, bytecode) = match rest[0].strip_suffix(BYTECODE_SUFFIX) {
        Some(stripped) => (stripped.to_owned(), true),
        None => (rest[0].to_owned(), false),
    };
    Ok(RunRow {
        name,
        self_percentage: pct,
        self_ticks: int(rest[1])?,
        total_ticks: int(rest[2])?,
        calls: int(rest[3])?,
        aborts: int(rest[4])?,
        bytecode,
    })
}

fn display_name(row: &RunRow) -> String {
    if row.bytecode {
        format!("{}{BYTECODE_SUFFIX}", row.name)
    } else {
        row.name.clone()
    }
}

fn percent_of(row: &RunRow, total: u64) -> f64 {
    row.self_percentage.unwrap_or_else(|| {
        if total == 0 {
            0.0
        } else {
            row.self_ticks as f64 * 100.0 / total as f64
        }
    })
}

/// Format a run as a text table sorted by self time, descending.
///
/// Zero-call rows are hidden unless `show_all` is set.
pub fn format_table(run: &Run, show_all: bool) -> String {
    let mut rows: Vec<&RunRow> = run
        .rows
        .iter()
        .filter(|r| show_all || r.calls > 0)
        .collect();
    rows.sort_by(|a, b| b.self_ticks.cmp(&a.self_ticks));

    let unit = &run.header.unit;
    let mut out = String::new();
    out.push_str(&format!(
        "{:<40} {:>14} {:>7} {:>14} {:>9} {:>7}\n",
        "Timer", "Self", "%", "Total", "Calls", "Aborts"
    ));
    out.push_str(&format!("{}\n", "-".repeat(96)));
    for row in &rows {
        out.push_str(&format!(
            "{:<40} {:>14} {:>6.2}% {:>14} {:>9} {:>7}\n",
            display_name(row),
            row.self_ticks,
            percent_of(row, run.header.total_runtime),
            row.total_ticks,
            row.calls,
            row.aborts
        ));
    }

    if !run.sums.is_empty() {
        out.push('\n');
        for sum in &run.sums {
            out.push_str(&format!(
                "{:<40} {:>14} {:>7} {:>14} {:>9} {:>7}\n",
                sum.name, sum.self_ticks, "", sum.total_ticks, sum.calls, sum.aborts
            ));
        }
    }

    let h = &run.header;
    out.push_str(&format!(
        "\nrun: {} {unit} ({} clock), overhead {:.1} {unit}/call avg, {} {unit} cold\n",
        h.total_runtime, h.clock, h.overhead_avg, h.overhead_cold
    ));
    if h.protocol_violations > 0 {
        out.push_str(&format!(
            "warning: {} begin/end protocol violation(s) were recovered\n",
            h.protocol_violations
        ));
    }
    out
}

/// Show the self-time delta between two runs, matching timers by name.
pub fn diff_runs(a: &Run, b: &Run) -> String {
    let a_map: HashMap<&str, &RunRow> = a.rows.iter().map(|r| (r.name.as_str(), r)).collect();
    let b_map: HashMap<&str, &RunRow> = b.rows.iter().map(|r| (r.name.as_str(), r)).collect();

    // Sorted for deterministic output.
    let mut names: Vec<&str> = a_map.keys().chain(b_map.keys()).copied().collect();
    names.sort_unstable();
    names.dedup();

    let mut out = String::new();
    if a.header.unit != b.header.unit {
        out.push_str(&format!(
            "warning: comparing runs measured in {} and {}\n",
            a.header.unit, b.header.unit
        ));
    }
    out.push_str(&format!(
        "{:<40} {:>14} {:>14} {:>15}\n",
        "Timer", "Before", "After", "Delta"
    ));
    out.push_str(&format!("{}\n", "-".repeat(86)));

    for name in &names {
        let before = a_map.get(name).map_or(0, |r| r.self_ticks);
        let after = b_map.get(name).map_or(0, |r| r.self_ticks);
        let delta = after as i128 - before as i128;
        out.push_str(&format!(
            "{:<40} {:>14} {:>14} {:>+15}\n",
            name, before, after, delta
        ));
    }
    out
}

pub fn to_json(run: &Run) -> Result<String, Error> {
    Ok(serde_json::to_string_pretty(run)?)
}

/// Find the most recent run file in a directory.
///
/// Run files are named `<unix-ms>.tsv`; the highest timestamp wins.
pub fn latest_run(runs_dir: &Path) -> Result<PathBuf, Error> {
    let entries = std::fs::read_dir(runs_dir).map_err(|source| Error::RunReadError {
        path: runs_dir.to_path_buf(),
        source,
    })?;
    entries
        .filter_map(|entry| {
            let path = entry.ok()?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("tsv") {
                return None;
            }
            let ts: u64 = path.file_stem()?.to_str()?.parse().ok()?;
            Some((ts, path))
        })
        .max_by_key(|(ts, _)| *ts)
        .map(|(_, path)| path)
        .ok_or_else(|| Error::NoRuns(runs_dir.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const PROCESSED: &str = "#!rtimer\t1
Mode\tprocessed
Clock\tmonotonic
Unit\tns
StartTime\t1700000000000
TotalRuntime\t1000
ProcessCpuNs\t950
OverheadAvg\t21.500
OverheadCold\t340
CalibrationRounds\t1000
ProtocolViolations\t0
Slots\t5
#!rows\tpct\tname\tself\ttotal\tcalls\taborts
60.00\tfib.R:1 [bc]\t600\t2400\t177\t5
30.00\tEval\t300\t1000\t1\t0
0.00\tStartup\t0\t0\t0\t0
#!sums\tname\tself\ttotal\tcalls\taborts
BuiltinSum\t40\t40\t88\t0
SpecialSum\t0\t0\t0\t0
UserFunctionSum\t600\t2400\t177\t5
";

    fn run_with(rows: &[(&str, u64)]) -> Run {
        Run {
            header: RunHeader {
                version: 1,
                unit: "ns".into(),
                ..RunHeader::default()
            },
            rows: rows
                .iter()
                .map(|&(name, self_ticks)| RunRow {
                    name: name.into(),
                    self_percentage: None,
                    self_ticks,
                    total_ticks: self_ticks,
                    calls: 1,
                    aborts: 0,
                    bytecode: false,
                })
                .collect(),
            sums: Vec::new(),
        }
    }

    #[test]
    fn parses_processed_run() {
        let run = parse_run(PROCESSED).unwrap();
        assert_eq!(run.header.mode, "processed");
        assert_eq!(run.header.total_runtime, 1000);
        assert_eq!(run.header.process_cpu_ns, Some(950));
        assert!((run.header.overhead_avg - 21.5).abs() < f64::EPSILON);
        assert_eq!(run.rows.len(), 3);

        let fib = &run.rows[0];
        assert_eq!(fib.name, "fib.R:1");
        assert!(fib.bytecode);
        assert_eq!(fib.self_percentage, Some(60.0));
        assert_eq!((fib.self_ticks, fib.total_ticks, fib.calls, fib.aborts), (600, 2400, 177, 5));
        assert_eq!(run.sums.len(), 3);
        assert_eq!(run.sums[0].name, "BuiltinSum");
        assert_eq!(run.sums[0].calls, 88);
    }

    #[test]
    fn parses_raw_rows() {
        let text = "#!rtimer\t1\nMode\traw\nUnit\tticks\n\
                    #!rows\tname\tself\ttotal\tcalls\taborts\nRepl\t5\t9\t2\t1\n";
        let run = parse_run(text).unwrap();
        assert_eq!(run.header.process_cpu_ns, None);
        assert_eq!(run.rows[0].self_percentage, None);
        assert_eq!(run.rows[0].aborts, 1);
    }

    #[test]
    fn rejects_malformed_runs() {
        assert!(parse_run("").is_err());
        assert!(parse_run("name,calls\n").is_err());
        let err = parse_run("#!rtimer\t2\n").unwrap_err();
        assert!(err.contains("version 2"), "{err}");
        let err = parse_run("#!rtimer\t1\n#!rows\tname\tself\ttotal\tcalls\taborts\nx\t1\t2\n")
            .unwrap_err();
        assert!(err.contains("line 3"), "{err}");
    }

    #[test]
    fn load_run_reports_path_on_bad_data() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("1700000000000.tsv");
        fs::write(&path, "garbage").unwrap();
        let err = load_run(&path).unwrap_err();
        assert!(matches!(err, Error::InvalidRunData { .. }));
        assert!(err.to_string().contains("1700000000000.tsv"), "{err}");
    }

    #[test]
    fn missing_run_file_is_a_read_error_with_its_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing.tsv");
        match load_run(&path).unwrap_err() {
            Error::RunReadError { path: p, source } => {
                assert_eq!(p, path);
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn format_table_sorts_by_self_time_and_hides_idle_rows() {
        let run = parse_run(PROCESSED).unwrap();
        let table = format_table(&run, false);
        let fib = table.find("fib.R:1 [bc]").expect("fib not in table");
        let eval = table.find("Eval").expect("Eval not in table");
        assert!(fib < eval, "fib (self=600) should come before Eval (self=300)");
        assert!(!table.contains("Startup"), "zero-call row shown:\n{table}");
        assert!(table.contains("UserFunctionSum"));

        let all = format_table(&run, true);
        assert!(all.contains("Startup"));
    }

    #[test]
    fn diff_shows_signed_delta() {
        let a = run_with(&[("walk", 10), ("gone", 4)]);
        let b = run_with(&[("walk", 8), ("new", 3)]);
        let diff = diff_runs(&a, &b);
        assert!(diff.contains("-2"), "should show negative delta: {diff}");
        assert!(diff.contains("+3"), "should show new timer: {diff}");
        assert!(diff.contains("-4"), "should show removed timer: {diff}");
        assert!(!diff.contains("warning"));
    }

    #[test]
    fn json_export_includes_rows_and_sums() {
        let run = parse_run(PROCESSED).unwrap();
        let json: serde_json::Value = serde_json::from_str(&to_json(&run).unwrap()).unwrap();
        assert_eq!(json["rows"][0]["name"], "fib.R:1");
        assert_eq!(json["sums"][2]["calls"], 177);
        assert_eq!(json["header"]["unit"], "ns");
    }

    #[test]
    fn latest_run_finds_most_recent_by_timestamp() {
        let dir = TempDir::new().unwrap();
        for name in [
            "1700000000000.tsv",
            "1700000002000.tsv",
            "1700000001500.tsv",
            "1800000000000.json",
            "notes.tsv",
        ] {
            fs::write(dir.path().join(name), "").unwrap();
        }
        let latest = latest_run(dir.path()).unwrap();
        assert_eq!(latest.file_name().unwrap(), "1700000002000.tsv");
    }

    #[test]
    fn latest_run_errors_on_empty_dir() {
        let dir = TempDir::new().unwrap();
        let err = latest_run(dir.path()).unwrap_err();
        assert!(
            err.to_string().contains("no rtimer runs found"),
            "unexpected error: {err}"
        );
    }
}
