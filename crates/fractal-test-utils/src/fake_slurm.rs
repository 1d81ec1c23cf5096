use fractal_client::targets::{CommandRunner, FileOps, LocalTarget, TargetInfo};
use fractal_client::{ClientError, Result};
use fractal_core::constants::worker::{INPUT_FLAG, OUTPUT_FLAG};
use fractal_executor::{run_worker_blocking, TaskRegistry};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

static WORKER_LINE: Lazy<Regex> = Lazy::new(|| {
    let pattern = format!(
        r"{} '([^']*)' {} '([^']*)'",
        regex::escape(INPUT_FLAG),
        regex::escape(OUTPUT_FLAG)
    );
    match Regex::new(&pattern) {
        Ok(re) => re,
        Err(e) => unreachable!("worker line pattern is valid: {}", e),
    }
});

#[derive(Debug, Clone)]
struct FakeJob {
    state: &'static str,
    /// Dropped out of the scheduler's history.
    expired: bool,
    stderr: Option<PathBuf>,
}

impl FakeJob {
    fn is_terminal(&self) -> bool {
        matches!(self.state, "COMPLETED" | "FAILED" | "CANCELLED")
    }
}

#[derive(Default)]
struct Inner {
    registry: TaskRegistry,
    jobs: Mutex<BTreeMap<String, FakeJob>>,
    next_id: AtomicU64,
    scancel_calls: Mutex<Vec<Vec<String>>>,
    squeue_calls: AtomicUsize,
    fail_submissions: AtomicBool,
    hide_new_jobs: AtomicBool,
    keep_running: AtomicBool,
}

impl Inner {
    fn jobs(&self) -> MutexGuard<'_, BTreeMap<String, FakeJob>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn state(&self, job_id: &str) -> Option<&'static str> {
        self.jobs().get(job_id).map(|j| j.state)
    }

    fn finish(&self, job_id: &str, state: &'static str) {
        if let Some(job) = self.jobs().get_mut(job_id) {
            if !job.is_terminal() {
                job.state = state;
            }
        }
    }

    fn cancel(&self, job_id: &str) {
        let stderr = {
            let mut jobs = self.jobs();
            match jobs.get_mut(job_id) {
                Some(job) if !job.is_terminal() => {
                    job.state = "CANCELLED";
                    job.stderr.clone()
                }
                _ => None,
            }
        };
        if let Some(path) = stderr {
            let line = format!("slurmstepd: error: *** JOB {} CANCELLED ***\n", job_id);
            if let Err(e) = fs_err::write(&path, line) {
                tracing::warn!("{}", e);
            }
        }
    }
}

/// A SLURM stand-in reachable through the target traits.
///
/// `sbatch` parses the submitted script and runs each worker line with the
/// in-process worker on a background thread, in script order. A response
/// only lands in place if the job was not cancelled meanwhile, like a real
/// job killed mid-run. Job-side and server-side paths are the same local
/// filesystem.
#[derive(Clone)]
pub struct FakeSlurm {
    inner: Arc<Inner>,
    files: LocalTarget,
}

impl FakeSlurm {
    pub fn new(registry: TaskRegistry) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                next_id: AtomicU64::new(1000),
                ..Inner::default()
            }),
            files: LocalTarget::new(),
        }
    }

    pub fn submitted_jobs(&self) -> Vec<String> {
        self.inner.jobs().keys().cloned().collect()
    }

    pub fn job_state(&self, job_id: &str) -> Option<&'static str> {
        self.inner.state(job_id)
    }

    /// Cancels as an operator would, outside the runner.
    pub fn cancel_externally(&self, job_id: &str) {
        self.inner.cancel(job_id);
    }

    /// Makes `squeue` forget the job, as after the history window passes.
    pub fn expire(&self, job_id: &str) {
        if let Some(job) = self.inner.jobs().get_mut(job_id) {
            job.expired = true;
        }
    }

    /// Jobs submitted from now on never show up in `squeue`.
    pub fn hide_new_jobs(&self, hide: bool) {
        self.inner.hide_new_jobs.store(hide, Ordering::SeqCst);
    }

    /// Jobs stay RUNNING after their workers are done, like a job stuck in
    /// its epilog.
    pub fn keep_jobs_running(&self, keep: bool) {
        self.inner.keep_running.store(keep, Ordering::SeqCst);
    }

    pub fn fail_submissions(&self, fail: bool) {
        self.inner.fail_submissions.store(fail, Ordering::SeqCst);
    }

    pub fn scancel_calls(&self) -> Vec<Vec<String>> {
        self.inner
            .scancel_calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn squeue_calls(&self) -> usize {
        self.inner.squeue_calls.load(Ordering::SeqCst)
    }

    /// Polls until at least `count` jobs are in `state`.
    pub fn wait_for_jobs_in_state(&self, count: usize, state: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            let matching = self
                .inner
                .jobs()
                .values()
                .filter(|j| j.state == state)
                .count();
            if matching >= count {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    fn failure(&self, command: &str, stderr: &str) -> ClientError {
        ClientError::TargetCommandFailed {
            target: self.name().to_string(),
            command: command.to_string(),
            code: "1".to_string(),
            stderr: stderr.to_string(),
        }
    }

    fn sbatch(&self, args: &[&str]) -> Result<String> {
        if self.inner.fail_submissions.load(Ordering::SeqCst) {
            return Err(self.failure("sbatch", "sbatch: error: Batch job submission failed"));
        }
        let script_path = args
            .last()
            .ok_or_else(|| self.failure("sbatch", "no script given"))?;
        let script = fs_err::read_to_string(script_path)?;

        let job_id = self.inner.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        let directive = |name: &str| {
            script.lines().find_map(|line| {
                line.strip_prefix(&format!("#SBATCH --{}=", name))
                    .map(|p| PathBuf::from(p.replace("%j", &job_id)))
            })
        };
        let stdout = directive("output");
        let stderr = directive("error");
        let workers: Vec<(PathBuf, PathBuf)> = WORKER_LINE
            .captures_iter(&script)
            .map(|c| (PathBuf::from(&c[1]), PathBuf::from(&c[2])))
            .collect();

        self.inner.jobs().insert(
            job_id.clone(),
            FakeJob {
                state: "RUNNING",
                expired: self.inner.hide_new_jobs.load(Ordering::SeqCst),
                stderr: stderr.clone(),
            },
        );

        let inner = self.inner.clone();
        let id = job_id.clone();
        std::thread::spawn(move || run_job(&inner, &id, &workers, stdout.as_deref()));
        Ok(format!("{}\n", job_id))
    }

    fn squeue(&self, args: &[&str]) -> Result<String> {
        self.inner.squeue_calls.fetch_add(1, Ordering::SeqCst);
        let ids: Vec<&str> = args
            .iter()
            .find_map(|a| a.strip_prefix("--jobs="))
            .map(|list| list.split(',').collect())
            .unwrap_or_default();

        let jobs = self.inner.jobs();
        let mut out = String::new();
        for id in ids {
            match jobs.get(id) {
                Some(job) if !job.expired => out.push_str(&format!("{} {}\n", id, job.state)),
                _ => {
                    return Err(self.failure(
                        "squeue",
                        "slurm_load_jobs error: Invalid job id specified",
                    ))
                }
            }
        }
        Ok(out)
    }

    fn scancel(&self, args: &[&str]) -> Result<String> {
        let ids: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        self.inner
            .scancel_calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(ids.clone());
        for id in &ids {
            self.inner.cancel(id);
        }
        Ok(String::new())
    }
}

fn run_job(inner: &Inner, job_id: &str, workers: &[(PathBuf, PathBuf)], stdout: Option<&Path>) {
    let mut log = String::new();
    let mut all_ok = true;
    for (input, output) in workers {
        if inner.state(job_id) == Some("CANCELLED") {
            break;
        }
        let staging = output.with_extension("fake");
        let succeeded = match run_worker_blocking(input, &staging, &inner.registry) {
            Ok(ok) => ok,
            Err(e) => {
                log.push_str(&format!("worker error: {}\n", e));
                false
            }
        };
        all_ok &= succeeded;
        if inner.state(job_id) == Some("CANCELLED") {
            let _ = fs_err::remove_file(&staging);
            break;
        }
        if let Err(e) = fs_err::rename(&staging, output) {
            log.push_str(&format!("{}\n", e));
        }
    }
    if let Some(path) = stdout {
        log.push_str(&format!("job {} done\n", job_id));
        let _ = fs_err::write(path, log);
    }
    if !inner.keep_running.load(Ordering::SeqCst) {
        inner.finish(job_id, if all_ok { "COMPLETED" } else { "FAILED" });
    }
}

impl TargetInfo for FakeSlurm {
    fn name(&self) -> &str {
        "fake-slurm"
    }

    fn shares_filesystem(&self) -> bool {
        true
    }
}

impl CommandRunner for FakeSlurm {
    fn run_command(&self, command: &str, args: &[&str]) -> Result<String> {
        match command {
            "sbatch" => self.sbatch(args),
            "squeue" => self.squeue(args),
            "scancel" => self.scancel(args),
            other => Err(self.failure(other, "command not available on the fake cluster")),
        }
    }
}

impl FileOps for FakeSlurm {
    fn write_remote_file(&self, path: &Path, content: &str) -> Result<()> {
        self.files.write_remote_file(path, content)
    }

    fn read_remote_file(&self, path: &Path) -> Result<Option<String>> {
        self.files.read_remote_file(path)
    }

    fn remove_remote_files(&self, paths: &[PathBuf]) -> Result<()> {
        self.files.remove_remote_files(paths)
    }

    fn files_exist(&self, paths: &[PathBuf]) -> Result<Vec<bool>> {
        self.files.files_exist(paths)
    }
}
