//! Profiler configuration.
//!
//! Everything a run needs to know up front: which clock to read, which
//! static timers exist at call sites, how the report is shaped and where it
//! goes. Read once when the profiler is built; nothing here changes mid-run.

use std::collections::HashSet;
use std::path::PathBuf;

use crate::clock::ClockKind;
use crate::error::Error;
use crate::report::ReportMode;

pub const DEFAULT_CALIBRATION_ROUNDS: u32 = 1_000;
pub const DEFAULT_STACK_CAPACITY: usize = 1_024;
/// Largest stack pre-size accepted. Deeper stacks still grow on demand.
pub const MAX_STACK_CAPACITY: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PolicyAction {
    #[default]
    Enable,
    Disable,
}

/// Which static timers are live. Names on the allow or deny list override
/// the default action.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticPolicy {
    pub default: PolicyAction,
    pub allow: Vec<String>,
    pub deny: Vec<String>,
}

impl StaticPolicy {
    pub fn validate(&self) -> Result<(), Error> {
        let deny: HashSet<&str> = self.deny.iter().map(String::as_str).collect();
        if let Some(both) = self.allow.iter().find(|n| deny.contains(n.as_str())) {
            return Err(Error::ConflictingPolicy(both.clone()));
        }
        Ok(())
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        if self.deny.iter().any(|n| n == name) {
            return false;
        }
        if self.allow.iter().any(|n| n == name) {
            return true;
        }
        self.default == PolicyAction::Enable
    }

    /// Listed names that match no declared static timer.
    pub(crate) fn unknown_names<'a>(&'a self, declared: &[String]) -> Vec<&'a str> {
        self.allow
            .iter()
            .chain(&self.deny)
            .map(String::as_str)
            .filter(|n| !declared.iter().any(|d| d == n))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub clock: ClockKind,
    pub statics: StaticPolicy,
    pub mode: ReportMode,
    /// Keep zero-call function-table and dynamic rows in reports.
    pub verbose: bool,
    pub runs_dir: Option<PathBuf>,
    pub calibration_rounds: u32,
    pub stack_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            clock: ClockKind::Monotonic,
            statics: StaticPolicy::default(),
            mode: ReportMode::Processed,
            verbose: false,
            runs_dir: None,
            calibration_rounds: DEFAULT_CALIBRATION_ROUNDS,
            stack_capacity: DEFAULT_STACK_CAPACITY,
        }
    }
}

impl Config {
    /// Read `RTIMER_*` variables from the process environment.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build a config from any variable source. Unset variables keep their
    /// defaults; set but unparsable ones are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let mut config = Config::default();

        if let Some(v) = lookup("RTIMER_CLOCK") {
            config.clock = v.parse()?;
        }
        if let Some(v) = lookup("RTIMER_MODE") {
            config.mode = v.parse().map_err(|_| Error::InvalidSetting {
                var: "RTIMER_MODE",
                value: v.clone(),
            })?;
        }
        if let Some(v) = lookup("RTIMER_VERBOSE") {
            config.verbose = parse_bool("RTIMER_VERBOSE", &v)?;
        }
        if let Some(v) = lookup("RTIMER_RUNS_DIR") {
            if !v.is_empty() {
                config.runs_dir = Some(PathBuf::from(v));
            }
        }
        if let Some(v) = lookup("RTIMER_STATIC_DEFAULT") {
            config.statics.default = match v.trim().to_ascii_lowercase().as_str() {
                "enable" | "enabled" | "on" => PolicyAction::Enable,
                "disable" | "disabled" | "off" => PolicyAction::Disable,
                _ => {
                    return Err(Error::InvalidSetting {
                        var: "RTIMER_STATIC_DEFAULT",
                        value: v,
                    });
                }
            };
        }
        if let Some(v) = lookup("RTIMER_STATIC_ALLOW") {
            config.statics.allow = split_list(&v);
        }
        if let Some(v) = lookup("RTIMER_STATIC_DENY") {
            config.statics.deny = split_list(&v);
        }
        if let Some(v) = lookup("RTIMER_CALIBRATION_ROUNDS") {
            config.calibration_rounds = v.trim().parse().map_err(|_| Error::InvalidSetting {
                var: "RTIMER_CALIBRATION_ROUNDS",
                value: v.clone(),
            })?;
        }
        if let Some(v) = lookup("RTIMER_STACK_CAPACITY") {
            config.stack_capacity = v
                .trim()
                .parse()
                .ok()
                .filter(|&n| n <= MAX_STACK_CAPACITY)
                .ok_or_else(|| Error::InvalidSetting {
                    var: "RTIMER_STACK_CAPACITY",
                    value: v.clone(),
                })?;
        }

        config.statics.validate()?;
        Ok(config)
    }

    /// Directory reports are written to.
    pub fn runs_dir(&self) -> PathBuf {
        self.runs_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("target").join("rtimer").join("runs"))
    }
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, Error> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(Error::InvalidSetting {
            var,
            value: value.to_owned(),
        }),
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}
