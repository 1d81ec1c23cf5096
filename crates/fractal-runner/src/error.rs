use fractal_core::model::TaskType;
use thiserror::Error;

/// Call-level precondition failures. Nothing has been submitted when one of
/// these is returned; per-item failures are reported through outcomes instead.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error(transparent)]
    Config(#[from] fractal_core::errors::ConfigError),

    #[error(transparent)]
    Client(#[from] fractal_client::ClientError),

    #[error(transparent)]
    InvalidBatching(#[from] fractal_core::errors::InvalidBatchingRequest),

    #[error("Parameters at position {index} have no string '{field}' field")]
    MissingItemKey { index: usize, field: &'static str },

    #[error("Item key '{key}' appears at positions {first} and {second}")]
    DuplicateItemKey {
        key: String,
        first: usize,
        second: usize,
    },

    #[error("multisubmit does not accept '{0}' tasks")]
    UnsupportedTaskType(TaskType),

    #[error("Failed to start runner: {0}")]
    Startup(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RunnerError>;
