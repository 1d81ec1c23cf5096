use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Config(#[from] fractal_core::errors::ConfigError),

    #[error(transparent)]
    Executor(#[from] fractal_executor::ExecutorError),

    #[error(transparent)]
    InvalidBatching(#[from] fractal_core::errors::InvalidBatchingRequest),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Command '{command}' failed on target '{target}' (exit {code}): {stderr}")]
    TargetCommandFailed {
        target: String,
        command: String,
        code: String,
        stderr: String,
    },

    #[error("Failed to spawn '{command}' for target '{target}': {source}")]
    Spawn {
        target: String,
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse SLURM job ID from sbatch output: '{0}'")]
    SlurmIdParse(String),

    #[error("Invalid path '{path}': {reason}")]
    InvalidPath { path: PathBuf, reason: String },

    #[error("Unexpected output from target command: {0}")]
    UnexpectedOutput(String),
}

impl ClientError {
    /// Stderr of a failed target command, if that is what this error is.
    pub fn command_stderr(&self) -> Option<&str> {
        match self {
            ClientError::TargetCommandFailed { stderr, .. } => Some(stderr),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
