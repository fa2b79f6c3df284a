use std::io::IsTerminal;
use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use rtimer::error::Error;
use rtimer::report::{diff_runs, format_table, latest_run, load_run, to_json};
use rtimer::simulate::{self, SimulationOptions};
use rtimer_runtime::{ClockKind, Config, ProfilerBuilder, ReportMode};

#[derive(Parser)]
#[command(
    name = "rtimer",
    about = "Reports, diffs and overhead calibration for rtimer call-tree profiles",
    version,
    after_help = "Runs are read from RTIMER_RUNS_DIR (default: target/rtimer/runs). \
                  Set RTIMER_LOG=debug for runtime diagnostics."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the latest run (or a specific one) sorted by self time.
    Report {
        /// Path to a specific run file. If omitted, shows the latest.
        run: Option<PathBuf>,

        /// Show all timers, including those with zero calls.
        #[arg(long)]
        all: bool,
    },
    /// Compare self time between two runs.
    Diff {
        /// Baseline run file.
        a: PathBuf,
        /// Run file to compare against the baseline.
        b: PathBuf,
    },
    /// Print a run as JSON.
    Json {
        /// Path to a specific run file. If omitted, uses the latest.
        run: Option<PathBuf>,
    },
    /// Measure begin/end overhead on this machine.
    Overhead {
        /// Clock source: monotonic or cycles.
        #[arg(long)]
        clock: Option<ClockKind>,

        /// Back-to-back begin/end cycles to average over.
        #[arg(long)]
        rounds: Option<u32>,
    },
    /// Drive a synthetic interpreter workload through the runtime and write a
    /// report.
    Simulate {
        /// Argument to the recursive user function.
        #[arg(long, default_value_t = 12)]
        depth: u32,

        #[arg(long, default_value_t = 100)]
        iterations: u32,

        /// Raise a condition every N iterations (0 disables).
        #[arg(long, default_value_t = 5)]
        fail_every: u32,

        /// Clock source: monotonic or cycles.
        #[arg(long)]
        clock: Option<ClockKind>,

        /// Write the report in raw (category) order instead of processed.
        #[arg(long)]
        raw: bool,
    },
}

fn main() {
    init_logging();
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("error: {e}");
        process::exit(1);
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("RTIMER_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<(), Error> {
    match cli.command {
        Commands::Report { run, all } => cmd_report(run, all),
        Commands::Diff { a, b } => cmd_diff(a, b),
        Commands::Json { run } => cmd_json(run),
        Commands::Overhead { clock, rounds } => cmd_overhead(clock, rounds),
        Commands::Simulate {
            depth,
            iterations,
            fail_every,
            clock,
            raw,
        } => cmd_simulate(
            SimulationOptions {
                depth,
                iterations,
                fail_every,
                ..SimulationOptions::default()
            },
            clock,
            raw,
        ),
    }
}

/// Resolve an explicit run path, or the latest run in the configured runs dir.
fn resolve_run(run: Option<PathBuf>) -> Result<PathBuf, Error> {
    match run {
        Some(path) => Ok(path),
        None => {
            let config = Config::from_env()?;
            latest_run(&config.runs_dir())
        }
    }
}

fn cmd_report(run: Option<PathBuf>, show_all: bool) -> Result<(), Error> {
    let path = resolve_run(run)?;
    let run = load_run(&path)?;
    anstream::print!("{}", format_table(&run, show_all));
    Ok(())
}

fn cmd_diff(a: PathBuf, b: PathBuf) -> Result<(), Error> {
    let run_a = load_run(&a)?;
    let run_b = load_run(&b)?;
    anstream::print!("{}", diff_runs(&run_a, &run_b));
    Ok(())
}

fn cmd_json(run: Option<PathBuf>) -> Result<(), Error> {
    let path = resolve_run(run)?;
    let run = load_run(&path)?;
    anstream::println!("{}", to_json(&run)?);
    Ok(())
}

fn cmd_overhead(clock: Option<ClockKind>, rounds: Option<u32>) -> Result<(), Error> {
    let mut config = Config::from_env()?;
    if let Some(clock) = clock {
        config.clock = clock;
    }
    if let Some(rounds) = rounds {
        config.calibration_rounds = rounds;
    }
    let state = ProfilerBuilder::new(config).build()?;
    let overhead = state.overhead();
    let unit = state.unit();
    anstream::println!("clock:   {} ({unit})", state.clock().kind_label());
    anstream::println!("average: {:.3} {unit} per begin/end", overhead.avg_ticks);
    anstream::println!("cold:    {} {unit}", overhead.cold_ticks);
    anstream::println!("rounds:  {}", overhead.rounds);
    Ok(())
}

fn cmd_simulate(
    options: SimulationOptions,
    clock: Option<ClockKind>,
    raw: bool,
) -> Result<(), Error> {
    let mut config = Config::from_env()?;
    if let Some(clock) = clock {
        config.clock = clock;
    }
    if raw {
        config.mode = ReportMode::Raw;
    }

    let state = simulate::register(ProfilerBuilder::new(config)).build()?;
    let summary = simulate::run(&state, options)?;
    let path = state.write_report()?;

    eprintln!(
        "simulated {} iteration(s), {} unwind(s)",
        summary.iterations, summary.unwinds
    );
    eprintln!("wrote: {}", path.display());
    if std::io::stdout().is_terminal() {
        let run = load_run(&path)?;
        anstream::print!("{}", format_table(&run, false));
    } else {
        println!("{}", path.display());
    }
    Ok(())
}
