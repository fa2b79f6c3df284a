use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(
        "no rtimer runs found in {} -- run `rtimer simulate` or a profiled host first",
        .0.display()
    )]
    NoRuns(PathBuf),

    #[error("failed to read run file {}: {source}", path.display())]
    RunReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid run data in {}: {reason}", path.display())]
    InvalidRunData { path: PathBuf, reason: String },

    #[error(transparent)]
    Runtime(#[from] rtimer_runtime::Error),

    #[error("failed to encode run as JSON: {0}")]
    Json(#[from] serde_json::Error),
}
