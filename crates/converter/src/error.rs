use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors produced by the converter.
///
/// Only `DirectoryList` and `TransportShutdown` surface as process-level
/// failures. Every other variant is the terminal outcome of a single job (or,
/// for `EngineParse`, a log-only event).
#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("failed to list watched directory {}: {source}", path.display())]
    DirectoryList {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{} was still being copied after {}s", path.display(), waited.as_secs())]
    CopyTimeout { path: PathBuf, waited: Duration },

    #[error("failed to stat {}: {source}", path.display())]
    Stat {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start transcoder for {}: {source}", path.display())]
    EngineStart {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("progress parse error: {0}")]
    EngineParse(String),

    #[error("transcoder failed: {0}")]
    EngineRun(String),

    #[error("status server shutdown failed: {0}")]
    TransportShutdown(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ConvertError {
    /// Short machine-friendly name for the error kind, used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            ConvertError::DirectoryList { .. } => "directory_list",
            ConvertError::CopyTimeout { .. } => "copy_timeout",
            ConvertError::Stat { .. } => "stat",
            ConvertError::EngineStart { .. } => "engine_start",
            ConvertError::EngineParse(_) => "engine_parse",
            ConvertError::EngineRun(_) => "engine_run",
            ConvertError::TransportShutdown(_) => "transport_shutdown",
            ConvertError::Config(_) => "config",
        }
    }
}
