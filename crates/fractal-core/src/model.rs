use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::constants::ITEM_KEY_FIELD;

pub type Params = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemKey(pub String);

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ItemKey {
    fn from(s: &str) -> Self {
        ItemKey(s.to_string())
    }
}

/// One parallelizable unit of work: a data-item key plus its parameter bundle.
///
/// `index` is the position of the item in the list handed to the runner and is
/// what results are keyed by.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub index: usize,
    pub key: Option<ItemKey>,
    pub params: Params,
}

impl Item {
    pub fn new(index: usize, params: Params) -> Self {
        let key = params
            .get(ITEM_KEY_FIELD)
            .and_then(Value::as_str)
            .map(ItemKey::from);
        Self { index, key, params }
    }

    pub fn key_str(&self) -> &str {
        self.key.as_ref().map(|k| k.0.as_str()).unwrap_or("")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ResourceRequest {
    pub cpus_per_item: u32,
    pub mem_per_item_mb: u64,
}

impl Default for ResourceRequest {
    fn default() -> Self {
        Self {
            cpus_per_item: 1,
            mem_per_item_mb: 4000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct ClusterLimits {
    pub target_cpus_per_job: u32,
    pub max_cpus_per_job: u32,
    pub target_mem_per_job_mb: u64,
    pub max_mem_per_job_mb: u64,
    pub target_num_jobs: usize,
    pub max_num_jobs: usize,
}

impl Default for ClusterLimits {
    fn default() -> Self {
        Self {
            target_cpus_per_job: 16,
            max_cpus_per_job: 64,
            target_mem_per_job_mb: 32_000,
            max_mem_per_job_mb: 125_000,
            target_num_jobs: 100,
            max_num_jobs: 500,
        }
    }
}

impl ClusterLimits {
    pub fn validate(&self) -> Result<(), String> {
        if self.target_cpus_per_job == 0
            || self.max_cpus_per_job == 0
            || self.target_mem_per_job_mb == 0
            || self.max_mem_per_job_mb == 0
            || self.target_num_jobs == 0
            || self.max_num_jobs == 0
        {
            return Err("all cluster limits must be positive".to_string());
        }
        if self.target_cpus_per_job > self.max_cpus_per_job {
            return Err(format!(
                "target-cpus-per-job ({}) exceeds max-cpus-per-job ({})",
                self.target_cpus_per_job, self.max_cpus_per_job
            ));
        }
        if self.target_mem_per_job_mb > self.max_mem_per_job_mb {
            return Err(format!(
                "target-mem-per-job-mb ({}) exceeds max-mem-per-job-mb ({})",
                self.target_mem_per_job_mb, self.max_mem_per_job_mb
            ));
        }
        if self.target_num_jobs > self.max_num_jobs {
            return Err(format!(
                "target-num-jobs ({}) exceeds max-num-jobs ({})",
                self.target_num_jobs, self.max_num_jobs
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchingPlan {
    pub items_per_job: usize,
    pub parallel_items_per_job: usize,
}

/// Caller-supplied batching override. Either both fields are set or neither.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ExplicitPlan {
    pub items_per_job: Option<usize>,
    pub parallel_items_per_job: Option<usize>,
}

impl ExplicitPlan {
    pub fn new(items_per_job: usize, parallel_items_per_job: usize) -> Self {
        Self {
            items_per_job: Some(items_per_job),
            parallel_items_per_job: Some(parallel_items_per_job),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items_per_job.is_none() && self.parallel_items_per_job.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Submitted,
    Done,
    Failed,
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemStatus::Submitted => write!(f, "submitted"),
            ItemStatus::Done => write!(f, "done"),
            ItemStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LedgerRef(pub u64);

impl fmt::Display for LedgerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    NonParallel,
    #[default]
    Parallel,
    Compound,
    ConverterNonParallel,
    ConverterCompound,
}

impl TaskType {
    /// Compound steps own their ledger updates and may repeat item keys.
    pub fn is_compound(&self) -> bool {
        matches!(self, TaskType::Compound | TaskType::ConverterCompound)
    }

    pub fn is_parallel(&self) -> bool {
        matches!(self, TaskType::Parallel)
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskType::NonParallel => write!(f, "non_parallel"),
            TaskType::Parallel => write!(f, "parallel"),
            TaskType::Compound => write!(f, "compound"),
            TaskType::ConverterNonParallel => write!(f, "converter_non_parallel"),
            TaskType::ConverterCompound => write!(f, "converter_compound"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseTaskTypeError(pub String);

impl fmt::Display for ParseTaskTypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid task type: '{}'. Valid values are: non_parallel, parallel, compound, converter_non_parallel, converter_compound",
            self.0
        )
    }
}

impl std::error::Error for ParseTaskTypeError {}

impl FromStr for TaskType {
    type Err = ParseTaskTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "non_parallel" => Ok(TaskType::NonParallel),
            "parallel" => Ok(TaskType::Parallel),
            "compound" => Ok(TaskType::Compound),
            "converter_non_parallel" => Ok(TaskType::ConverterNonParallel),
            "converter_compound" => Ok(TaskType::ConverterCompound),
            _ => Err(ParseTaskTypeError(s.to_string())),
        }
    }
}

/// Identifies the workflow step a submission belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepInfo {
    pub index: usize,
    pub task_name: String,
}

impl StepInfo {
    pub fn new(index: usize, task_name: impl Into<String>) -> Self {
        Self {
            index,
            task_name: task_name.into(),
        }
    }

    pub fn subfolder_name(&self) -> String {
        let sanitized: String = self
            .task_name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}_{}", self.index, sanitized)
    }
}
