use std::path::PathBuf;

use crate::registry::MAX_NAME_LEN;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unsupported clock source '{0}' -- expected `monotonic` or `cycles`")]
    UnsupportedClock(String),

    #[error("cycle counter is not available on {arch}")]
    ClockUnavailable { arch: &'static str },

    #[error("timer name is {len} bytes, limit is {MAX_NAME_LEN}: {name}")]
    NameTooLong { name: String, len: usize },

    #[error("timer name contains a tab or line break: {name:?}")]
    NameHasControl { name: String },

    #[error("static timer '{0}' is declared more than once")]
    DuplicateStatic(String),

    #[error("static timer '{0}' is on both the allow and the deny list")]
    ConflictingPolicy(String),

    #[error("invalid value for {var}: '{value}'")]
    InvalidSetting { var: &'static str, value: String },

    #[error(
        "{live} timer activation(s) still live -- every begin needs an end or an unwind before snapshot"
    )]
    NotDrained { live: u64 },

    #[error("failed to write report to {}: {source}", path.display())]
    ReportWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

}
