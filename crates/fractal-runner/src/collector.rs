//! Turns the response files of a finished job into item outcomes.

use crate::monitor::{CompletionHandler, TrackedJob};
use crate::pending::ItemOutcome;
use fractal_client::{ItemFiles, JobFiles, Target};
use fractal_core::config::RunnerSettings;
use fractal_core::errors::{ExecutionError, JobExecutionError};
use fractal_executor::InvocationResponse;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Default)]
struct JobLogs {
    stdout: Option<PathBuf>,
    stderr: Option<PathBuf>,
}

pub struct ResultCollector {
    target: Arc<dyn Target>,
    settings: RunnerSettings,
}

impl ResultCollector {
    pub fn new(target: Arc<dyn Target>, settings: RunnerSettings) -> Self {
        Self { target, settings }
    }

    fn is_shared(&self, files: &JobFiles) -> bool {
        self.target.shares_filesystem() && files.folders.is_shared()
    }

    /// Reads the job-side file, copying it next to its server-side twin
    /// when the two differ.
    fn fetch(&self, remote: &Path, local: &Path, shared: bool) -> Option<String> {
        if shared {
            return match fs_err::read_to_string(local) {
                Ok(content) => Some(content),
                Err(e) if e.kind() == ErrorKind::NotFound => None,
                Err(e) => {
                    tracing::error!("{}", e);
                    None
                }
            };
        }
        match self.target.read_remote_file(remote) {
            Ok(Some(content)) => {
                if let Err(e) = write_local(local, &content) {
                    tracing::warn!("Could not keep a local copy of '{}': {}", remote.display(), e);
                }
                Some(content)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::error!("Fetching '{}' from {} failed: {}", remote.display(), self.target.name(), e);
                None
            }
        }
    }

    fn fetch_response(&self, item: &ItemFiles, shared: bool) -> Option<String> {
        self.fetch(&item.response_remote, &item.response_local, shared)
    }

    /// Every response of the job, with a single wait and retry for the ones
    /// not there yet.
    fn fetch_responses(&self, tracked: &TrackedJob, shared: bool) -> Vec<Option<String>> {
        let items = &tracked.job.files.items;
        let mut contents: Vec<Option<String>> = items
            .iter()
            .map(|item| self.fetch_response(item, shared))
            .collect();
        let missing = contents.iter().filter(|c| c.is_none()).count();
        if missing > 0 {
            tracing::debug!(
                "{} response(s) of job {} not there yet; retrying once",
                missing,
                tracked.job_id()
            );
            std::thread::sleep(self.settings.output_retry_delay());
            for (item, content) in items.iter().zip(contents.iter_mut()) {
                if content.is_none() {
                    *content = self.fetch_response(item, shared);
                }
            }
        }
        contents
    }

    /// Scheduler logs, brought over so they can be shown in diagnostics.
    fn fetch_job_logs(&self, files: &JobFiles, shared: bool) -> JobLogs {
        let stdout = self
            .fetch(&files.stdout_remote, &files.stdout_local, shared)
            .map(|_| files.stdout_local.clone());
        let stderr = self
            .fetch(&files.stderr_remote, &files.stderr_local, shared)
            .map(|_| files.stderr_local.clone());
        JobLogs { stdout, stderr }
    }

    fn missing_output_error(
        &self,
        tracked: &TrackedJob,
        item: &ItemFiles,
        logs: &JobLogs,
    ) -> JobExecutionError {
        let state = tracked
            .last_state
            .as_ref()
            .map(|s| s.as_str().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let info = format!(
            "Output file '{}' of item {} in job {} is missing (last scheduler state: {}).\n\
             Possible reasons:\n\
             1. The job was cancelled before or while it ran.\n\
             2. The worker could not write its output because of a storage or filesystem problem.",
            item.response_remote.display(),
            item.index,
            tracked.job_id(),
            state
        );
        JobExecutionError::new(info).with_files(
            Some(tracked.job.files.script_local.clone()),
            logs.stdout.clone(),
            logs.stderr.clone(),
        )
    }

    fn parse_response(
        &self,
        tracked: &TrackedJob,
        item: &ItemFiles,
        content: &str,
    ) -> ItemOutcome {
        match serde_json::from_str::<InvocationResponse>(content) {
            Ok(response) => response.into_result(),
            Err(e) => Err(ExecutionError::Job(
                JobExecutionError::new(format!(
                    "Malformed response '{}' in job {}: {}",
                    item.response_remote.display(),
                    tracked.job_id(),
                    e
                ))
                .with_files(Some(tracked.job.files.script_local.clone()), None, None),
            )),
        }
    }

    fn remove_files(&self, remote: Vec<PathBuf>, local: Vec<PathBuf>, shared: bool) {
        if let Err(e) = self.target.remove_remote_files(&remote) {
            tracing::warn!("Cleanup on {} failed: {}", self.target.name(), e);
        }
        if !shared {
            for path in local {
                match fs_err::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => tracing::warn!("{}", e),
                }
            }
        }
    }

    /// Resolves every item of `tracked` in batch order. Files are cleaned up
    /// before any result is handed back.
    pub fn collect(&self, tracked: TrackedJob) {
        let shared = self.is_shared(&tracked.job.files);
        let contents = self.fetch_responses(&tracked, shared);
        let logs = if contents.iter().any(Option::is_none) {
            self.fetch_job_logs(&tracked.job.files, shared)
        } else {
            JobLogs::default()
        };

        let items = &tracked.job.files.items;
        let outcomes: Vec<ItemOutcome> = items
            .iter()
            .zip(&contents)
            .map(|(item, content)| match content {
                Some(content) => self.parse_response(&tracked, item, content),
                None => Err(ExecutionError::Job(
                    self.missing_output_error(&tracked, item, &logs),
                )),
            })
            .collect();

        if !self.settings.keep_files {
            for (item, outcome) in items.iter().zip(&outcomes) {
                if outcome.is_ok() {
                    self.remove_files(
                        item.remote_cleanup_paths(),
                        item.local_cleanup_paths(),
                        shared,
                    );
                }
            }
            if outcomes.iter().all(Result::is_ok) {
                let files = &tracked.job.files;
                self.remove_files(
                    files.remote_cleanup_paths(),
                    files.local_cleanup_paths(),
                    shared,
                );
            }
        }

        for ((item, pending), outcome) in items.iter().zip(&tracked.pendings).zip(outcomes) {
            if let Err(e) = &outcome {
                tracing::error!("Item {} of job {} failed: {}", item.index, tracked.job_id(), e);
            }
            if !pending.resolve(outcome) {
                tracing::debug!(
                    "Item {} of job {} was resolved elsewhere first",
                    item.index,
                    tracked.job_id()
                );
            }
        }
    }
}

impl CompletionHandler for ResultCollector {
    fn job_finished(&self, job: TrackedJob) {
        self.collect(job);
    }
}

fn write_local(path: &Path, content: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs_err::create_dir_all(parent)?;
    }
    fs_err::write(path, content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pending::{outcome_channel, PendingResult};
    use fractal_client::targets::{CommandRunner, FileOps, LocalTarget, TargetInfo};
    use fractal_client::{JobState, StepFolders, SubmittedJob};
    use fractal_core::model::{Item, StepInfo};
    use fractal_executor::protocol::write_response;
    use fractal_executor::ExceptionProxy;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    /// Local file access on a "remote" folder, recording every read.
    #[derive(Default)]
    struct CountingTarget {
        files: LocalTarget,
        reads: Mutex<Vec<PathBuf>>,
    }

    impl CountingTarget {
        fn reads_of(&self, path: &Path) -> usize {
            self.reads.lock().unwrap().iter().filter(|p| *p == path).count()
        }
    }

    impl TargetInfo for CountingTarget {
        fn name(&self) -> &str {
            "counting"
        }
    }

    impl CommandRunner for CountingTarget {
        fn run_command(&self, command: &str, args: &[&str]) -> fractal_client::Result<String> {
            self.files.run_command(command, args)
        }
    }

    impl FileOps for CountingTarget {
        fn write_remote_file(&self, path: &Path, content: &str) -> fractal_client::Result<()> {
            self.files.write_remote_file(path, content)
        }

        fn read_remote_file(&self, path: &Path) -> fractal_client::Result<Option<String>> {
            self.reads.lock().unwrap().push(path.to_path_buf());
            self.files.read_remote_file(path)
        }

        fn remove_remote_files(&self, paths: &[PathBuf]) -> fractal_client::Result<()> {
            self.files.remove_remote_files(paths)
        }
    }

    fn settings(root: &Path, keep_files: bool) -> RunnerSettings {
        let mut settings = RunnerSettings::new(root, root.join("shutdown"));
        settings.output_retry_delay_ms = 10;
        settings.keep_files = keep_files;
        settings
    }

    fn job(settings: &RunnerSettings, n: usize) -> SubmittedJob {
        let folders = StepFolders::new(settings, &StepInfo::new(0, "task"));
        let indices: Vec<usize> = (0..n).collect();
        let mut files = JobFiles::new(&folders, "par-1", &indices);
        files.resolve_job_id("42");
        fs_err::create_dir_all(&folders.local).unwrap();
        fs_err::write(&files.script_local, "#!/bin/bash\n").unwrap();
        SubmittedJob {
            job_id: "42".into(),
            task_name: "task".into(),
            items: indices
                .iter()
                .map(|&i| Item::new(i, serde_json::Map::new()))
                .collect(),
            files,
        }
    }

    #[test]
    fn test_collect_mixed_outcomes_and_cleanup() {
        let dir = tempdir().unwrap();
        let settings = settings(dir.path(), false);
        let job = job(&settings, 3);
        write_response(
            &job.files.items[0].response_local,
            &InvocationResponse::Success(json!({"ok": 0})),
        )
        .unwrap();
        write_response(
            &job.files.items[1].response_local,
            &InvocationResponse::Failure(ExceptionProxy::new("ValueError", "bad")),
        )
        .unwrap();

        let (tx, rx) = outcome_channel();
        let pendings = (0..3).map(|i| PendingResult::new(i, tx.clone())).collect();
        drop(tx);
        let mut tracked = TrackedJob::new(job.clone(), pendings);
        tracked.last_state = Some(JobState::Cancelled);

        let collector = ResultCollector::new(Arc::new(LocalTarget::new()), settings);
        collector.collect(tracked);

        let mut outcomes: Vec<_> = rx.iter().collect();
        outcomes.sort_by_key(|(i, _)| *i);
        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0].1.as_ref().unwrap(), &json!({"ok": 0}));

        let task_err = outcomes[1].1.as_ref().unwrap_err();
        assert!(task_err.is_task_error());
        assert!(task_err.to_string().contains("bad"));

        let job_err = outcomes[2].1.as_ref().unwrap_err();
        assert!(job_err.is_job_error());
        assert!(job_err.assemble_message().contains("CANCELLED"));

        // Successful item cleaned up; the job-level files stay for inspection.
        assert!(!job.files.items[0].response_local.exists());
        assert!(job.files.items[1].response_local.exists());
        assert!(job.files.script_local.exists());
    }

    #[test]
    fn test_response_copied_from_job_side_folder() {
        let dir = tempdir().unwrap();
        let mut settings = settings(dir.path(), true);
        settings.working_dir = dir.path().join("server");
        settings.job_working_dir = Some(dir.path().join("cluster"));
        let job = job(&settings, 1);
        write_response(
            &job.files.items[0].response_remote,
            &InvocationResponse::Success(json!(5)),
        )
        .unwrap();

        let (tx, rx) = outcome_channel();
        let tracked = TrackedJob::new(job.clone(), vec![PendingResult::new(0, tx)]);
        ResultCollector::new(Arc::new(LocalTarget::new()), settings).collect(tracked);

        let (_, outcome) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(outcome.unwrap(), json!(5));
        assert!(job.files.items[0].response_local.exists());
    }

    #[test]
    fn test_missing_outputs_wait_once_per_job() {
        let dir = tempdir().unwrap();
        let mut settings = settings(dir.path(), true);
        settings.output_retry_delay_ms = 300;
        settings.working_dir = dir.path().join("server");
        settings.job_working_dir = Some(dir.path().join("cluster"));
        let job = job(&settings, 10);
        fs_err::create_dir_all(job.files.stderr_remote.parent().unwrap()).unwrap();
        fs_err::write(&job.files.stderr_remote, "*** JOB 42 CANCELLED ***\n").unwrap();

        let (tx, rx) = outcome_channel();
        let pendings = (0..10).map(|i| PendingResult::new(i, tx.clone())).collect();
        drop(tx);
        let target = Arc::new(CountingTarget::default());
        let collector = ResultCollector::new(target.clone(), settings);

        let started = Instant::now();
        collector.collect(TrackedJob::new(job.clone(), pendings));
        assert!(started.elapsed() < Duration::from_millis(1500));

        let outcomes: Vec<_> = rx.iter().collect();
        assert_eq!(outcomes.len(), 10);
        for (_, outcome) in &outcomes {
            let err = outcome.as_ref().unwrap_err();
            assert!(err.is_job_error());
            assert!(err.assemble_message().contains("CANCELLED"));
        }
        for item in &job.files.items {
            assert_eq!(target.reads_of(&item.response_remote), 2);
        }
        assert_eq!(target.reads_of(&job.files.stderr_remote), 1);
        assert_eq!(target.reads_of(&job.files.stdout_remote), 1);
    }
}
