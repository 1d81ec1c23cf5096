//! Thin wrapper over the `sbatch` / `squeue` / `scancel` command line, run
//! through whichever [`Target`] the runner was configured with.

use crate::error::{ClientError, Result};
use crate::targets::{RemoteCommand, Target};
use fractal_core::constants::slurm::{SBATCH, SCANCEL, SQUEUE};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

mod state;

pub use state::JobState;

const INVALID_JOB_ID: &str = "Invalid job id";

static JOB_ID_RE: Lazy<Regex> = Lazy::new(|| match Regex::new(r"^(\d+)(?:;[\w.\-]+)?$") {
    Ok(re) => re,
    Err(e) => unreachable!("job id pattern is valid: {}", e),
});

/// `sbatch --parsable` prints `<id>` or `<id>;<cluster>`.
pub fn parse_job_id(stdout: &str) -> Result<String> {
    let line = stdout
        .lines()
        .map(str::trim)
        .rfind(|l| !l.is_empty())
        .unwrap_or("");
    JOB_ID_RE
        .captures(line)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| ClientError::SlurmIdParse(stdout.trim().to_string()))
}

/// Parses `squeue --noheader --format="%i %T"` output.
pub fn parse_squeue_output(stdout: &str) -> HashMap<String, JobState> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let id = parts.next()?;
            let state = parts.collect::<Vec<_>>().join(" ");
            if state.is_empty() {
                tracing::warn!("Ignoring malformed squeue line: '{}'", line);
                return None;
            }
            Some((id.to_string(), JobState::parse(&state)))
        })
        .collect()
}

#[derive(Clone)]
pub struct SlurmClient {
    target: Arc<dyn Target>,
    pre_submission_commands: Vec<String>,
}

impl SlurmClient {
    pub fn new(target: Arc<dyn Target>, pre_submission_commands: Vec<String>) -> Self {
        Self {
            target,
            pre_submission_commands,
        }
    }

    pub fn target(&self) -> &Arc<dyn Target> {
        &self.target
    }

    /// Submits `script_path` (a job-side path) and returns the job id.
    pub fn submit(&self, script_path: &Path) -> Result<String> {
        let script = script_path.to_string_lossy();
        let stdout = if self.pre_submission_commands.is_empty() {
            self.target
                .run_command(SBATCH, &["--parsable", script.as_ref()])?
        } else {
            let sbatch = RemoteCommand::new(SBATCH)
                .arg("--parsable")
                .arg(script.as_ref());
            let chained = self
                .pre_submission_commands
                .iter()
                .rev()
                .fold(sbatch, |acc, pre| RemoteCommand::from(pre.as_str()).and(acc));
            self.target.run_shell(&chained.to_shell_string())?
        };
        let job_id = parse_job_id(&stdout)?;
        tracing::info!(
            "Submitted '{}' as SLURM job {} via {}",
            script,
            job_id,
            self.target.name()
        );
        Ok(job_id)
    }

    /// States of the given jobs in one `squeue` call. Jobs absent from the
    /// result are unknown to the scheduler (never seen or already purged).
    pub fn query(&self, job_ids: &[String]) -> Result<HashMap<String, JobState>> {
        if job_ids.is_empty() {
            return Ok(HashMap::new());
        }
        match self.query_batch(job_ids) {
            Ok(states) => Ok(states),
            Err(e) => {
                tracing::warn!(
                    "Batched squeue for {} jobs failed, querying one by one: {}",
                    job_ids.len(),
                    e
                );
                self.query_each(job_ids)
            }
        }
    }

    fn query_batch(&self, job_ids: &[String]) -> Result<HashMap<String, JobState>> {
        let jobs_arg = format!("--jobs={}", job_ids.join(","));
        let stdout = self.target.run_command(
            SQUEUE,
            &[
                "--noheader",
                "--format=%i %T",
                "--states=all",
                jobs_arg.as_str(),
            ],
        )?;
        Ok(parse_squeue_output(&stdout))
    }

    fn query_each(&self, job_ids: &[String]) -> Result<HashMap<String, JobState>> {
        let mut states = HashMap::new();
        for job_id in job_ids {
            match self.query_batch(std::slice::from_ref(job_id)) {
                Ok(found) => states.extend(found),
                Err(e)
                    if e
                        .command_stderr()
                        .is_some_and(|stderr| stderr.contains(INVALID_JOB_ID)) =>
                {
                    tracing::debug!("squeue does not know job {}", job_id);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(states)
    }

    /// One `scancel` covering every id.
    pub fn cancel(&self, job_ids: &[String]) -> Result<()> {
        if job_ids.is_empty() {
            return Ok(());
        }
        let args: Vec<&str> = job_ids.iter().map(String::as_str).collect();
        self.target.run_command(SCANCEL, &args)?;
        tracing::info!("Cancelled SLURM jobs {}", job_ids.join(","));
        Ok(())
    }
}
