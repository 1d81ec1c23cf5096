use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error(transparent)]
    Config(#[from] fractal_core::errors::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error on path '{path}': {source}")]
    PathIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed protocol file '{path}': {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize protocol record: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Version mismatch between submitter and worker: {0}")]
    VersionMismatch(String),

    #[error("Failed to spawn task command '{command}': {source}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, ExecutorError>;
