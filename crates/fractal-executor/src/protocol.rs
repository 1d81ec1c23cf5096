//! Request/response records exchanged between the submitting side and the
//! worker through the job-side filesystem.

use crate::error::{ExecutorError, Result};
use fractal_core::constants::suffixes;
use fractal_core::errors::{ExecutionError, JobExecutionError, TaskExecutionError};
use fractal_core::model::Params;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};

/// Bumped whenever the on-disk shape of requests or responses changes.
pub const PROTOCOL_VERSION: u32 = 1;

pub mod kinds {
    pub const JOB_EXECUTION: &str = "JobExecutionError";
    pub const VERSION_MISMATCH: &str = "VersionMismatch";
    pub const WORKER: &str = "WorkerError";
    pub const UNKNOWN_CALLABLE: &str = "UnknownCallable";
    pub const COMMAND_FAILED: &str = "TaskCommandFailed";
    pub const PANIC: &str = "Panic";

    /// Kinds raised by the plumbing around the task rather than the task.
    pub const INFRASTRUCTURE: &[&str] = &[JOB_EXECUTION, VERSION_MISMATCH, WORKER];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub crate_version: String,
    pub protocol_version: u32,
    pub os: String,
    pub arch: String,
}

impl VersionInfo {
    pub fn current() -> Self {
        Self {
            crate_version: env!("CARGO_PKG_VERSION").to_string(),
            protocol_version: PROTOCOL_VERSION,
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }

    /// Platform differences are tolerated; build or protocol differences are not.
    pub fn check_compatible(&self, worker: &VersionInfo) -> Result<()> {
        if self.protocol_version != worker.protocol_version {
            return Err(ExecutorError::VersionMismatch(format!(
                "protocol version {} (submitter) != {} (worker)",
                self.protocol_version, worker.protocol_version
            )));
        }
        if self.crate_version != worker.crate_version {
            return Err(ExecutorError::VersionMismatch(format!(
                "build version {} (submitter) != {} (worker)",
                self.crate_version, worker.crate_version
            )));
        }
        if self.os != worker.os || self.arch != worker.arch {
            tracing::debug!(
                "Submitter platform {}/{} differs from worker platform {}/{}",
                self.os,
                self.arch,
                worker.os,
                worker.arch
            );
        }
        Ok(())
    }
}

/// What the worker should run for one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Callable {
    /// An external task executable, invoked as
    /// `<command> --args-json <file> --out-json <file>`.
    Command { command: String, task_name: String },
    /// A function looked up by name in the worker's [`crate::TaskRegistry`].
    Registered { name: String },
}

impl Callable {
    pub fn command(command: impl Into<String>, task_name: impl Into<String>) -> Self {
        Callable::Command {
            command: command.into(),
            task_name: task_name.into(),
        }
    }

    pub fn registered(name: impl Into<String>) -> Self {
        Callable::Registered { name: name.into() }
    }

    pub fn task_name(&self) -> &str {
        match self {
            Callable::Command { task_name, .. } => task_name,
            Callable::Registered { name } => name,
        }
    }
}

impl fmt::Display for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Callable::Command { command, task_name } => {
                write!(f, "command '{}' ({})", task_name, command)
            }
            Callable::Registered { name } => write!(f, "registered function '{}'", name),
        }
    }
}

/// Side files the worker may produce next to the response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFiles {
    pub args_json: PathBuf,
    pub out_json: PathBuf,
    pub log: PathBuf,
}

impl TaskFiles {
    /// Derives the side files from a per-item prefix such as
    /// `/work/0_create/par-1_3`.
    pub fn from_prefix(prefix: &Path) -> Self {
        let with_suffix = |suffix: &str| {
            let mut s = prefix.as_os_str().to_os_string();
            s.push(".");
            s.push(suffix);
            PathBuf::from(s)
        };
        Self {
            args_json: with_suffix(suffixes::ARGS),
            out_json: with_suffix(suffixes::OUTPUT),
            log: with_suffix(suffixes::LOG),
        }
    }

    pub fn all(&self) -> [&Path; 3] {
        [&self.args_json, &self.out_json, &self.log]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub callable: Callable,
    pub params: Params,
    #[serde(default)]
    pub item_key: Option<String>,
    #[serde(default)]
    pub batch_position: Option<usize>,
    pub files: TaskFiles,
    pub versions: VersionInfo,
}

/// A failure captured inside the worker, carried as plain data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionProxy {
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub task_name: Option<String>,
    #[serde(default)]
    pub item_key: Option<String>,
    #[serde(default)]
    pub batch_position: Option<usize>,
}

impl ExceptionProxy {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            task_name: None,
            item_key: None,
            batch_position: None,
        }
    }

    pub fn for_request(mut self, request: &InvocationRequest) -> Self {
        self.task_name = Some(request.callable.task_name().to_string());
        self.item_key = request.item_key.clone();
        self.batch_position = request.batch_position;
        self
    }

    pub fn is_infrastructure(&self) -> bool {
        kinds::INFRASTRUCTURE.contains(&self.kind.as_str())
    }

    /// Unknown kinds are treated as task failures.
    pub fn into_execution_error(self) -> ExecutionError {
        if self.is_infrastructure() {
            let mut info = format!("{}: {}", self.kind, self.message);
            if let Some(key) = &self.item_key {
                info.push_str(&format!(" (item '{}')", key));
            }
            return ExecutionError::Job(JobExecutionError::new(info));
        }
        ExecutionError::Task(TaskExecutionError {
            kind: self.kind,
            message: self.message,
            task_name: self.task_name,
            item_key: self.item_key,
            batch_position: self.batch_position,
        })
    }
}

impl From<&ExecutorError> for ExceptionProxy {
    fn from(err: &ExecutorError) -> Self {
        let kind = match err {
            ExecutorError::VersionMismatch(_) => kinds::VERSION_MISMATCH,
            _ => kinds::WORKER,
        };
        ExceptionProxy::new(kind, err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ResponseRecord", into = "ResponseRecord")]
pub enum InvocationResponse {
    Success(Value),
    Failure(ExceptionProxy),
}

impl InvocationResponse {
    pub fn is_success(&self) -> bool {
        matches!(self, InvocationResponse::Success(_))
    }

    pub fn into_result(self) -> std::result::Result<Value, ExecutionError> {
        match self {
            InvocationResponse::Success(value) => Ok(value),
            InvocationResponse::Failure(proxy) => Err(proxy.into_execution_error()),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct ResponseRecord {
    success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<ExceptionProxy>,
}

impl TryFrom<ResponseRecord> for InvocationResponse {
    type Error = String;

    fn try_from(record: ResponseRecord) -> std::result::Result<Self, Self::Error> {
        match (record.success, record.error) {
            (true, None) => Ok(InvocationResponse::Success(
                record.value.unwrap_or(Value::Null),
            )),
            (false, Some(error)) => Ok(InvocationResponse::Failure(error)),
            (true, Some(_)) => Err("successful response must not carry an error".to_string()),
            (false, None) => Err("failed response is missing its error".to_string()),
        }
    }
}

impl From<InvocationResponse> for ResponseRecord {
    fn from(response: InvocationResponse) -> Self {
        match response {
            InvocationResponse::Success(value) => ResponseRecord {
                success: true,
                value: Some(value),
                error: None,
            },
            InvocationResponse::Failure(error) => ResponseRecord {
                success: false,
                value: None,
                error: Some(error),
            },
        }
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(".");
    s.push(suffixes::TMP);
    PathBuf::from(s)
}

/// Writes through a sibling temporary file so readers never see a partial record.
pub fn write_json_atomic<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs_err::create_dir_all(parent)?;
    }
    let content = serde_json::to_vec_pretty(record)?;
    let tmp = tmp_path(path);
    fs_err::write(&tmp, content)?;
    fs_err::rename(&tmp, path)?;
    Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs_err::read(path).map_err(|e| ExecutorError::PathIo {
        path: path.to_path_buf(),
        source: e,
    })?;
    serde_json::from_slice(&content).map_err(|e| ExecutorError::Malformed {
        path: path.to_path_buf(),
        source: e,
    })
}

pub fn write_request(path: &Path, request: &InvocationRequest) -> Result<()> {
    write_json_atomic(path, request)
}

pub fn read_request(path: &Path) -> Result<InvocationRequest> {
    read_json(path)
}

pub fn write_response(path: &Path, response: &InvocationResponse) -> Result<()> {
    write_json_atomic(path, response)
}

pub fn read_response(path: &Path) -> Result<InvocationResponse> {
    read_json(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_response_wire_shape() {
        let ok = serde_json::to_value(InvocationResponse::Success(json!({"n": 1}))).unwrap();
        assert_eq!(ok, json!({"success": true, "value": {"n": 1}}));

        let failed = InvocationResponse::Failure(ExceptionProxy::new("ValueError", "bad"));
        let v = serde_json::to_value(failed).unwrap();
        assert_eq!(v["success"], json!(false));
        assert_eq!(v["error"]["kind"], json!("ValueError"));
        assert!(v.get("value").is_none());
    }

    #[test]
    fn test_response_rejects_inconsistent_records() {
        let bad: std::result::Result<InvocationResponse, _> =
            serde_json::from_value(json!({"success": false}));
        assert!(bad.is_err());
        let null_value: InvocationResponse =
            serde_json::from_value(json!({"success": true})).unwrap();
        assert_eq!(null_value, InvocationResponse::Success(Value::Null));
    }

    #[test]
    fn test_proxy_maps_to_taxonomy() {
        let task = ExceptionProxy::new("ValueError", "bad").into_execution_error();
        assert!(task.is_task_error());
        assert!(task.to_string().contains("bad"));

        let infra = ExceptionProxy::new(kinds::VERSION_MISMATCH, "0.1 != 0.2");
        assert!(infra.is_infrastructure());
        assert!(infra.into_execution_error().is_job_error());
    }

    #[test]
    fn test_version_check() {
        let mine = VersionInfo::current();
        assert!(mine.check_compatible(&mine.clone()).is_ok());

        let mut other = mine.clone();
        other.crate_version = "0.0.0-other".into();
        assert!(matches!(
            mine.check_compatible(&other),
            Err(ExecutorError::VersionMismatch(_))
        ));

        let mut other_platform = mine.clone();
        other_platform.arch = "riscv64".into();
        assert!(mine.check_compatible(&other_platform).is_ok());
    }

    #[test]
    fn test_atomic_write_leaves_no_tmp_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sub/par-1_0.res.json");
        write_response(&path, &InvocationResponse::Success(json!(3))).unwrap();
        assert!(path.exists());
        assert!(!tmp_path(&path).exists());
        assert_eq!(
            read_response(&path).unwrap(),
            InvocationResponse::Success(json!(3))
        );
    }

    #[test]
    fn test_task_files_from_prefix() {
        let files = TaskFiles::from_prefix(Path::new("/w/0_task/par-1_2"));
        assert_eq!(files.args_json, PathBuf::from("/w/0_task/par-1_2.args.json"));
        assert_eq!(files.out_json, PathBuf::from("/w/0_task/par-1_2.out.json"));
        assert_eq!(files.log, PathBuf::from("/w/0_task/par-1_2.log"));
    }
}
