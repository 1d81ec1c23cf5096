use crate::error::{ClientError, Result};
use crate::files::JobFiles;
use crate::script::{JobScript, SbatchDirectives};
use crate::slurm::SlurmClient;
use crate::targets::Target;
use fractal_core::config::{RunnerSettings, SlurmSettings};
use fractal_core::errors::JobExecutionError;
use fractal_core::model::{BatchingPlan, Item, ResourceRequest};
use fractal_executor::{Callable, InvocationRequest, VersionInfo};
use std::path::Path;
use std::sync::Arc;

/// A job accepted by the scheduler. Carries only what result collection
/// needs; it does not point back at the runner.
#[derive(Debug, Clone)]
pub struct SubmittedJob {
    pub job_id: String,
    pub task_name: String,
    pub files: JobFiles,
    pub items: Vec<Item>,
}

pub struct JobSubmitter {
    slurm: SlurmClient,
    runner: RunnerSettings,
    settings: SlurmSettings,
    versions: VersionInfo,
}

impl JobSubmitter {
    pub fn new(target: Arc<dyn Target>, runner: RunnerSettings, settings: SlurmSettings) -> Self {
        let slurm = SlurmClient::new(target, settings.pre_submission_commands.clone());
        Self {
            slurm,
            runner,
            settings,
            versions: VersionInfo::current(),
        }
    }

    pub fn slurm(&self) -> &SlurmClient {
        &self.slurm
    }

    fn target(&self) -> &Arc<dyn Target> {
        self.slurm.target()
    }

    fn needs_upload(&self, files: &JobFiles) -> bool {
        !(self.target().shares_filesystem() && files.folders.is_shared())
    }

    /// Writes locally and, if the job side is elsewhere, mirrors to the target.
    fn place_file(&self, local: &Path, remote: &Path, content: &str, upload: bool) -> Result<()> {
        if let Some(parent) = local.parent() {
            fs_err::create_dir_all(parent)?;
        }
        fs_err::write(local, content)?;
        if upload {
            self.target().write_remote_file(remote, content)?;
        }
        Ok(())
    }

    fn prepare(
        &self,
        callable: &Callable,
        batch: &[Item],
        resources: &ResourceRequest,
        plan: &BatchingPlan,
        files: &JobFiles,
    ) -> Result<()> {
        let upload = self.needs_upload(files);
        for (position, (item, item_files)) in batch.iter().zip(&files.items).enumerate() {
            let request = InvocationRequest {
                callable: callable.clone(),
                params: item.params.clone(),
                item_key: item.key.as_ref().map(|k| k.0.clone()),
                batch_position: Some(position),
                files: item_files.task.clone(),
                versions: self.versions.clone(),
            };
            let content = serde_json::to_string_pretty(&request)
                .map_err(fractal_executor::ExecutorError::from)?;
            self.place_file(
                &item_files.request_local,
                &item_files.request_remote,
                &content,
                upload,
            )?;
        }

        let parallel = plan.parallel_items_per_job.min(batch.len()).max(1);
        let script = JobScript {
            settings: &self.settings,
            directives: SbatchDirectives::for_job(&self.settings, resources, parallel, files),
            worker_command: &self.runner.worker_command,
            resources: *resources,
            parallel,
            files,
        }
        .render()?;
        self.place_file(&files.script_local, &files.script_remote, &script, upload)
    }

    /// Writes the request files and script for one batch and submits it.
    /// Items of `batch` must line up with `files.items`.
    pub fn submit_batch(
        &self,
        callable: &Callable,
        batch: Vec<Item>,
        resources: &ResourceRequest,
        plan: &BatchingPlan,
        mut files: JobFiles,
    ) -> std::result::Result<SubmittedJob, JobExecutionError> {
        let as_job_error = |e: ClientError, files: &JobFiles| {
            JobExecutionError::new(format!(
                "Submission of job '{}' failed: {}",
                files.prefix, e
            ))
            .with_files(Some(files.script_local.clone()), None, None)
        };

        if batch.len() != files.items.len() {
            return Err(JobExecutionError::new(format!(
                "Job '{}' has {} items but {} file sets",
                files.prefix,
                batch.len(),
                files.items.len()
            )));
        }

        self.prepare(callable, &batch, resources, plan, &files)
            .map_err(|e| as_job_error(e, &files))?;
        let job_id = self
            .slurm
            .submit(&files.script_remote)
            .map_err(|e| as_job_error(e, &files))?;
        files.resolve_job_id(&job_id);
        tracing::info!(
            "Job {} ('{}') runs {} item(s) of '{}'",
            job_id,
            files.prefix,
            batch.len(),
            callable.task_name()
        );

        Ok(SubmittedJob {
            job_id,
            task_name: callable.task_name().to_string(),
            files,
            items: batch,
        })
    }
}
