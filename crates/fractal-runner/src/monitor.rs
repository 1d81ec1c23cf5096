//! Background polling of the scheduler for submitted jobs, and the shutdown
//! path that cancels whatever is still outstanding.

use crate::pending::PendingResult;
use fractal_client::{JobState, SlurmClient, SubmittedJob};
use fractal_core::config::RunnerSettings;
use fractal_core::errors::{ExecutionError, JobExecutionError};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorPhase {
    Running,
    ShuttingDown,
    Stopped,
}

/// A submitted job plus the results waiting on it. Owned by the monitor
/// until the job finishes, then handed to the completion handler.
#[derive(Debug)]
pub struct TrackedJob {
    pub job: SubmittedJob,
    /// Aligned with `job.items`.
    pub pendings: Vec<PendingResult>,
    pub last_state: Option<JobState>,
    seen: bool,
    misses: u32,
}

impl TrackedJob {
    pub fn new(job: SubmittedJob, pendings: Vec<PendingResult>) -> Self {
        Self {
            job,
            pendings,
            last_state: None,
            seen: false,
            misses: 0,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job.job_id
    }

    fn resolve_all_shutdown(&self) {
        for pending in &self.pendings {
            pending.resolve(Err(ExecutionError::Job(JobExecutionError::shutdown())));
        }
    }

    /// Folds one scheduler answer in. Returns true once the job counts as
    /// finished.
    fn observe(&mut self, state: Option<&JobState>, unseen_limit: u32) -> bool {
        match state {
            Some(state) => {
                self.seen = true;
                self.misses = 0;
                self.last_state = Some(state.clone());
                state.is_terminal()
            }
            // Dropped out of the scheduler's history window.
            None if self.seen => true,
            None => {
                self.misses += 1;
                self.misses >= unseen_limit
            }
        }
    }
}

pub trait CompletionHandler: Send + Sync {
    /// Called exactly once per finished job, never under the monitor lock.
    fn job_finished(&self, job: TrackedJob);
}

struct MonitorState {
    phase: MonitorPhase,
    jobs: BTreeMap<String, TrackedJob>,
}

pub struct CompletionMonitor {
    slurm: SlurmClient,
    settings: RunnerSettings,
    handler: Arc<dyn CompletionHandler>,
    state: Mutex<MonitorState>,
}

impl CompletionMonitor {
    pub fn new(
        slurm: SlurmClient,
        settings: RunnerSettings,
        handler: Arc<dyn CompletionHandler>,
    ) -> Self {
        Self {
            slurm,
            settings,
            handler,
            state: Mutex::new(MonitorState {
                phase: MonitorPhase::Running,
                jobs: BTreeMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn phase(&self) -> MonitorPhase {
        self.lock().phase
    }

    pub fn is_running(&self) -> bool {
        self.phase() == MonitorPhase::Running
    }

    pub fn job_ids(&self) -> Vec<String> {
        self.lock().jobs.keys().cloned().collect()
    }

    /// Starts tracking `job`. A job that arrives after shutdown began is
    /// cancelled straight away and its results resolved as shut down.
    pub fn register(&self, job: TrackedJob) {
        let rejected = {
            let mut state = self.lock();
            if state.phase == MonitorPhase::Running {
                tracing::debug!("Tracking job {}", job.job_id());
                state.jobs.insert(job.job_id().to_string(), job);
                None
            } else {
                Some(job)
            }
        };
        if let Some(job) = rejected {
            tracing::warn!(
                "Job {} was submitted during shutdown; cancelling it",
                job.job_id()
            );
            if let Err(e) = self.slurm.cancel(&[job.job_id().to_string()]) {
                tracing::error!("Failed to cancel job {}: {}", job.job_id(), e);
            }
            job.resolve_all_shutdown();
        }
    }

    pub fn shutdown_requested(&self) -> bool {
        self.settings.shutdown_file.exists()
    }

    /// Cancels every outstanding job with one `scancel` and resolves their
    /// results as shut down. Only the first call does anything; it returns
    /// whether this call performed the shutdown.
    pub fn shutdown(&self) -> bool {
        let jobs: Vec<TrackedJob> = {
            let mut state = self.lock();
            if state.phase != MonitorPhase::Running {
                return false;
            }
            state.phase = MonitorPhase::ShuttingDown;
            std::mem::take(&mut state.jobs).into_values().collect()
        };

        let ids: Vec<String> = jobs.iter().map(|j| j.job_id().to_string()).collect();
        tracing::info!("Shutting down; cancelling {} outstanding job(s)", ids.len());
        if let Err(e) = self.slurm.cancel(&ids) {
            tracing::error!("Failed to cancel jobs {}: {}", ids.join(","), e);
        }
        for job in &jobs {
            job.resolve_all_shutdown();
        }

        self.lock().phase = MonitorPhase::Stopped;
        true
    }

    /// Job ids whose response files are all in place, checked with one
    /// target call for every job in `ids`.
    fn jobs_with_all_outputs(&self, ids: &[String]) -> HashSet<String> {
        let expected: Vec<(String, Vec<PathBuf>)> = {
            let state = self.lock();
            ids.iter()
                .filter_map(|id| {
                    state
                        .jobs
                        .get(id.as_str())
                        .map(|job| (id.clone(), job.job.files.response_paths()))
                })
                .filter(|(_, paths)| !paths.is_empty())
                .collect()
        };
        let paths: Vec<PathBuf> = expected
            .iter()
            .flat_map(|(_, paths)| paths.iter().cloned())
            .collect();
        if paths.is_empty() {
            return HashSet::new();
        }
        let flags = match self.slurm.target().files_exist(&paths) {
            Ok(flags) => flags,
            Err(e) => {
                tracing::warn!("Checking for job outputs failed, retrying next cycle: {}", e);
                return HashSet::new();
            }
        };

        let mut flags = flags.into_iter();
        expected
            .into_iter()
            .filter_map(|(id, paths)| {
                let all_present = flags
                    .by_ref()
                    .take(paths.len())
                    .fold(true, |acc, present| acc && present);
                all_present.then_some(id)
            })
            .collect()
    }

    /// Queries the scheduler for every tracked job at once and takes the
    /// finished ones out of the tracked set. A job is finished when the
    /// scheduler says so or when every response file of it has appeared.
    pub fn poll_scheduler(&self) -> Vec<TrackedJob> {
        let ids = self.job_ids();
        if ids.is_empty() {
            return Vec::new();
        }
        let states = match self.slurm.query(&ids) {
            Ok(states) => Some(states),
            Err(e) => {
                tracing::warn!("Scheduler query failed, retrying next cycle: {}", e);
                None
            }
        };
        let with_outputs = self.jobs_with_all_outputs(&ids);

        let mut state = self.lock();
        if state.phase != MonitorPhase::Running {
            return Vec::new();
        }
        let limit = self.settings.unseen_query_limit.max(1);
        let done: Vec<String> = ids
            .iter()
            .filter(|id| {
                let Some(job) = state.jobs.get_mut(id.as_str()) else {
                    return false;
                };
                let by_state = states
                    .as_ref()
                    .is_some_and(|states| job.observe(states.get(id.as_str()), limit));
                by_state || with_outputs.contains(id.as_str())
            })
            .cloned()
            .collect();
        done.iter()
            .filter_map(|id| state.jobs.remove(id))
            .collect()
    }

    fn run(&self, stop: mpsc::Receiver<()>, finished: Sender<TrackedJob>) {
        let query_every = u64::from(self.settings.query_every.max(1));
        let mut tick: u64 = 0;
        loop {
            match stop.recv_timeout(self.settings.poll_interval()) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
            if !self.is_running() {
                break;
            }
            if self.shutdown_requested() {
                tracing::info!(
                    "Shutdown marker '{}' found",
                    self.settings.shutdown_file.display()
                );
                self.shutdown();
                break;
            }
            tick += 1;
            if tick % query_every != 0 {
                continue;
            }
            for job in self.poll_scheduler() {
                tracing::info!(
                    "Job {} finished ({})",
                    job.job_id(),
                    job.last_state
                        .as_ref()
                        .map(JobState::as_str)
                        .unwrap_or("no longer listed")
                );
                if let Err(mpsc::SendError(job)) = finished.send(job) {
                    tracing::error!("Result collection has stopped; dropping job {}", job.job_id());
                }
            }
        }
        tracing::debug!("Completion monitor stopped");
    }
}

/// The ticker thread plus the thread that collects finished jobs, so slow
/// collection never delays polling or shutdown. Dropping the handle stops
/// and joins both; jobs already handed over are still collected.
pub struct MonitorHandle {
    stop: Option<Sender<()>>,
    threads: Vec<JoinHandle<()>>,
}

impl MonitorHandle {
    pub fn spawn(monitor: Arc<CompletionMonitor>) -> std::io::Result<Self> {
        let (stop_tx, stop_rx) = mpsc::channel();
        let (finished_tx, finished_rx) = mpsc::channel::<TrackedJob>();
        let collector = {
            let monitor = monitor.clone();
            std::thread::Builder::new()
                .name("fractal-collector".into())
                .spawn(move || {
                    for job in finished_rx {
                        monitor.handler.job_finished(job);
                    }
                })?
        };
        let ticker = std::thread::Builder::new()
            .name("fractal-monitor".into())
            .spawn(move || monitor.run(stop_rx, finished_tx))?;
        Ok(Self {
            stop: Some(stop_tx),
            threads: vec![ticker, collector],
        })
    }

    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                tracing::error!("Completion monitor thread panicked");
            }
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_terminal_state_finishes() {
        let mut job = tracked();
        assert!(!job.observe(Some(&JobState::Running), 3));
        assert!(job.observe(Some(&JobState::Cancelled), 3));
        assert_eq!(job.last_state, Some(JobState::Cancelled));
    }

    #[test]
    fn test_observe_vanished_after_seen_finishes() {
        let mut job = tracked();
        assert!(!job.observe(Some(&JobState::Pending), 3));
        assert!(job.observe(None, 3));
    }

    #[test]
    fn test_observe_never_seen_needs_repeated_misses() {
        let mut job = tracked();
        assert!(!job.observe(None, 3));
        assert!(!job.observe(None, 3));
        assert!(job.observe(None, 3));
    }

    fn tracked() -> TrackedJob {
        use fractal_client::{JobFiles, StepFolders};
        use fractal_core::model::StepInfo;

        let settings = RunnerSettings::new("/wd", "/wd/shutdown");
        let folders = StepFolders::new(&settings, &StepInfo::new(0, "t"));
        TrackedJob::new(
            SubmittedJob {
                job_id: "1".into(),
                task_name: "t".into(),
                files: JobFiles::new(&folders, "par-1", &[]),
                items: Vec::new(),
            },
            Vec::new(),
        )
    }
}
