use crate::constants::SHUTDOWN_MESSAGE;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error on path '{path}': {source}")]
    PathIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to parse TOML configuration: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Failed to expand path '{path}': {reason}")]
    PathExpansion { path: String, reason: String },

    #[error("Invalid configuration: {0}")]
    General(String),
}

/// Batching parameters that can never be satisfied. Not caused by runtime
/// conditions, so callers must not retry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid batching request: {0}")]
pub struct InvalidBatchingRequest(pub String);

/// The task itself failed inside the worker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error(
    "Task '{}' failed{}: {message}",
    .task_name.as_deref().unwrap_or("<unknown>"),
    item_suffix(.item_key.as_deref())
)]
pub struct TaskExecutionError {
    pub kind: String,
    pub message: String,
    pub task_name: Option<String>,
    pub item_key: Option<String>,
    pub batch_position: Option<usize>,
}

fn item_suffix(item_key: Option<&str>) -> String {
    item_key
        .map(|k| format!(" for item '{}'", k))
        .unwrap_or_default()
}

impl TaskExecutionError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            task_name: None,
            item_key: None,
            batch_position: None,
        }
    }
}

/// The infrastructure around the task failed: scheduler interaction, lost
/// output, version mismatch or shutdown.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{info}")]
pub struct JobExecutionError {
    pub info: String,
    pub script_path: Option<PathBuf>,
    pub stdout_path: Option<PathBuf>,
    pub stderr_path: Option<PathBuf>,
}

impl JobExecutionError {
    pub fn new(info: impl Into<String>) -> Self {
        Self {
            info: info.into(),
            script_path: None,
            stdout_path: None,
            stderr_path: None,
        }
    }

    pub fn shutdown() -> Self {
        Self::new(SHUTDOWN_MESSAGE)
    }

    pub fn is_shutdown(&self) -> bool {
        self.info.contains(SHUTDOWN_MESSAGE)
    }

    pub fn with_files(
        mut self,
        script_path: Option<PathBuf>,
        stdout_path: Option<PathBuf>,
        stderr_path: Option<PathBuf>,
    ) -> Self {
        self.script_path = script_path;
        self.stdout_path = stdout_path;
        self.stderr_path = stderr_path;
        self
    }

    /// Full human-readable diagnostic: the info line followed by the contents
    /// of whichever job files are known and readable.
    pub fn assemble_message(&self) -> String {
        let mut message = String::new();
        let sections = [
            ("Submission script", &self.script_path),
            ("Slurm stdout", &self.stdout_path),
            ("Slurm stderr", &self.stderr_path),
        ];
        for (label, path) in sections {
            if let Some(path) = path {
                append_file_section(&mut message, label, path);
            }
        }
        if !self.info.is_empty() {
            let _ = writeln!(message, "Additional information:\n{}", self.info);
        }
        message
    }
}

fn append_file_section(message: &mut String, label: &str, path: &Path) {
    let _ = writeln!(message, "{} ({}):", label, path.display());
    match fs_err::read_to_string(path) {
        Ok(content) if content.trim().is_empty() => {
            let _ = writeln!(message, "<empty>");
        }
        Ok(content) => {
            let _ = writeln!(message, "{}", content.trim_end());
        }
        Err(e) => {
            let _ = writeln!(message, "<unreadable: {}>", e);
        }
    }
    let _ = writeln!(message);
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error(transparent)]
    Task(#[from] TaskExecutionError),

    #[error(transparent)]
    Job(#[from] JobExecutionError),
}

impl ExecutionError {
    pub fn is_task_error(&self) -> bool {
        matches!(self, ExecutionError::Task(_))
    }

    pub fn is_job_error(&self) -> bool {
        matches!(self, ExecutionError::Job(_))
    }

    pub fn assemble_message(&self) -> String {
        match self {
            ExecutionError::Task(e) => e.to_string(),
            ExecutionError::Job(e) => e.assemble_message(),
        }
    }
}
