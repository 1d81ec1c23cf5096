//! Naming of everything a job leaves on disk, on both the server side and
//! the job side of the filesystem boundary.

use fractal_core::config::RunnerSettings;
use fractal_core::constants::{prefixes, slurm::JOB_ID_PLACEHOLDER, suffixes};
use fractal_core::model::{StepInfo, TaskType};
use fractal_executor::TaskFiles;
use std::path::{Path, PathBuf};

/// One working subfolder per workflow step, seen from both sides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFolders {
    pub local: PathBuf,
    pub remote: PathBuf,
}

impl StepFolders {
    pub fn new(settings: &RunnerSettings, step: &StepInfo) -> Self {
        let subfolder = step.subfolder_name();
        Self {
            local: settings.working_dir.join(&subfolder),
            remote: settings.job_working_dir().join(&subfolder),
        }
    }

    pub fn is_shared(&self) -> bool {
        self.local == self.remote
    }
}

pub fn job_prefix(task_type: TaskType, seq: u64) -> String {
    let kind = if task_type.is_parallel() || task_type.is_compound() {
        prefixes::PARALLEL
    } else {
        prefixes::NON_PARALLEL
    };
    format!("{}-{}", kind, seq)
}

fn with_suffix(dir: &Path, stem: &str, suffix: &str) -> PathBuf {
    dir.join(format!("{}.{}", stem, suffix))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFiles {
    /// Position of the item in the submitting call.
    pub index: usize,
    pub request_local: PathBuf,
    pub request_remote: PathBuf,
    pub response_local: PathBuf,
    pub response_remote: PathBuf,
    pub task: TaskFiles,
}

impl ItemFiles {
    /// Request, response and task files on the job side.
    pub fn remote_cleanup_paths(&self) -> Vec<PathBuf> {
        let mut paths = vec![self.request_remote.clone(), self.response_remote.clone()];
        paths.extend(self.task.all().iter().map(|p| p.to_path_buf()));
        paths
    }

    pub fn local_cleanup_paths(&self) -> Vec<PathBuf> {
        vec![self.request_local.clone(), self.response_local.clone()]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFiles {
    pub prefix: String,
    pub folders: StepFolders,
    pub script_local: PathBuf,
    pub script_remote: PathBuf,
    pub stdout_remote: PathBuf,
    pub stderr_remote: PathBuf,
    pub stdout_local: PathBuf,
    pub stderr_local: PathBuf,
    pub items: Vec<ItemFiles>,
}

impl JobFiles {
    pub fn new(folders: &StepFolders, prefix: &str, item_indices: &[usize]) -> Self {
        let log_stem = format!("{}_{}", prefix, JOB_ID_PLACEHOLDER);
        let items = item_indices
            .iter()
            .map(|&index| {
                let stem = format!("{}_{}", prefix, index);
                ItemFiles {
                    index,
                    request_local: with_suffix(&folders.local, &stem, suffixes::REQUEST),
                    request_remote: with_suffix(&folders.remote, &stem, suffixes::REQUEST),
                    response_local: with_suffix(&folders.local, &stem, suffixes::RESPONSE),
                    response_remote: with_suffix(&folders.remote, &stem, suffixes::RESPONSE),
                    task: TaskFiles::from_prefix(&folders.remote.join(&stem)),
                }
            })
            .collect();
        Self {
            prefix: prefix.to_string(),
            folders: folders.clone(),
            script_local: with_suffix(&folders.local, prefix, suffixes::SCRIPT),
            script_remote: with_suffix(&folders.remote, prefix, suffixes::SCRIPT),
            stdout_remote: with_suffix(&folders.remote, &log_stem, suffixes::STDOUT),
            stderr_remote: with_suffix(&folders.remote, &log_stem, suffixes::STDERR),
            stdout_local: with_suffix(&folders.local, &log_stem, suffixes::STDOUT),
            stderr_local: with_suffix(&folders.local, &log_stem, suffixes::STDERR),
            items,
        }
    }

    /// Replaces the `%j` placeholder in the scheduler log paths once the
    /// job id is known.
    pub fn resolve_job_id(&mut self, job_id: &str) {
        for path in [
            &mut self.stdout_remote,
            &mut self.stderr_remote,
            &mut self.stdout_local,
            &mut self.stderr_local,
        ] {
            let replaced = path
                .to_string_lossy()
                .replace(JOB_ID_PLACEHOLDER, job_id);
            *path = PathBuf::from(replaced);
        }
    }

    /// Script and scheduler logs on the job side.
    pub fn remote_cleanup_paths(&self) -> Vec<PathBuf> {
        vec![
            self.script_remote.clone(),
            self.stdout_remote.clone(),
            self.stderr_remote.clone(),
        ]
    }

    pub fn local_cleanup_paths(&self) -> Vec<PathBuf> {
        vec![
            self.script_local.clone(),
            self.stdout_local.clone(),
            self.stderr_local.clone(),
        ]
    }

    pub fn response_paths(&self) -> Vec<PathBuf> {
        self.items
            .iter()
            .map(|item| item.response_remote.clone())
            .collect()
    }
}
