//! Error taxonomy for the dispatch core.
//!
//! One `thiserror`-derived enum per failure-capable boundary operation.

use crate::task::TaskId;

/// Returned by `evict`/`evict_at_once`/`extend` when the given id is not
/// where the caller expected it (pending, for eviction; running, for
/// extension). Never fatal; callers typically treat it as "already gone".
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("task not found: {0}")]
    NotFound(TaskId),
}

/// Returned by `wait` when the caller's cancellation future resolves before
/// the task finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("wait cancelled")]
pub struct Cancelled;

/// Returned by `QueueConfig::from_toml_file` when the config file cannot be
/// read or does not parse.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}
