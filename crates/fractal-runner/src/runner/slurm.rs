use super::{lost_result, Runner, TaskInvocation};
use crate::collector::ResultCollector;
use crate::error::{Result, RunnerError};
use crate::monitor::{CompletionMonitor, MonitorHandle, TrackedJob};
use crate::pending::{outcome_channel, ItemOutcome, PendingResult};
use fractal_client::heuristics::{plan, split_into_batches};
use fractal_client::{build_target, job_prefix, JobFiles, JobSubmitter, StepFolders, Target};
use fractal_core::config::{Config, RunnerSettings, SlurmSettings};
use fractal_core::errors::{ExecutionError, JobExecutionError};
use fractal_core::ledger::HistoryLedger;
use fractal_core::model::{ClusterLimits, Item};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Runs items as SLURM jobs through an injected [`Target`].
pub struct SlurmRunner {
    settings: RunnerSettings,
    slurm_settings: SlurmSettings,
    limits: ClusterLimits,
    submitter: JobSubmitter,
    monitor: Arc<CompletionMonitor>,
    _handle: MonitorHandle,
    ledger: Arc<dyn HistoryLedger>,
    job_seq: AtomicU64,
}

impl SlurmRunner {
    pub fn new(
        config: &Config,
        target: Arc<dyn Target>,
        ledger: Arc<dyn HistoryLedger>,
    ) -> Result<Self> {
        config.validate()?;
        let submitter = JobSubmitter::new(
            target.clone(),
            config.runner.clone(),
            config.slurm.clone(),
        );
        let collector = Arc::new(ResultCollector::new(target, config.runner.clone()));
        let monitor = Arc::new(CompletionMonitor::new(
            submitter.slurm().clone(),
            config.runner.clone(),
            collector,
        ));
        let handle = MonitorHandle::spawn(monitor.clone()).map_err(RunnerError::Startup)?;
        tracing::info!(
            "SLURM runner ready on {} (working dir '{}')",
            submitter.slurm().target().name(),
            config.runner.working_dir.display()
        );

        Ok(Self {
            settings: config.runner.clone(),
            slurm_settings: config.slurm.clone(),
            limits: config.limits,
            submitter,
            monitor,
            _handle: handle,
            ledger,
            job_seq: AtomicU64::new(0),
        })
    }

    /// Uses the target named in `config`.
    pub fn from_config(config: &Config, ledger: Arc<dyn HistoryLedger>) -> Result<Self> {
        Self::new(config, build_target(&config.target), ledger)
    }

    pub fn monitor(&self) -> &CompletionMonitor {
        &self.monitor
    }

    fn next_prefix(&self, task: &TaskInvocation) -> String {
        let seq = self.job_seq.fetch_add(1, Ordering::SeqCst) + 1;
        job_prefix(task.task_type, seq)
    }
}

impl Runner for SlurmRunner {
    fn ledger(&self) -> &dyn HistoryLedger {
        self.ledger.as_ref()
    }

    fn run_items(
        &self,
        task: &TaskInvocation,
        items: Vec<Item>,
        on_outcome: &mut dyn FnMut(&Item, &ItemOutcome),
    ) -> Result<BTreeMap<usize, ItemOutcome>> {
        let resources = task
            .resources
            .unwrap_or_else(|| self.slurm_settings.resource_request());
        let explicit = if task.plan.is_empty() {
            self.slurm_settings.explicit_plan()
        } else {
            task.plan
        };
        let batching = plan(items.len(), &resources, &self.limits, &explicit)?;
        let batches = split_into_batches(&items, batching.items_per_job);
        tracing::info!(
            "'{}': {} item(s) in {} job(s), {} per job, {} at a time",
            task.callable.task_name(),
            items.len(),
            batches.len(),
            batching.items_per_job,
            batching.parallel_items_per_job
        );

        if self.monitor.shutdown_requested() {
            self.monitor.shutdown();
        }

        let folders = StepFolders::new(&self.settings, &task.step);
        let (tx, rx) = outcome_channel();
        for batch in batches {
            let indices: Vec<usize> = batch.iter().map(|item| item.index).collect();
            let pendings: Vec<PendingResult> = indices
                .iter()
                .map(|&index| PendingResult::new(index, tx.clone()))
                .collect();

            if !self.monitor.is_running() {
                for pending in &pendings {
                    pending.resolve(Err(ExecutionError::Job(JobExecutionError::shutdown())));
                }
                continue;
            }

            let files = JobFiles::new(&folders, &self.next_prefix(task), &indices);
            match self
                .submitter
                .submit_batch(&task.callable, batch, &resources, &batching, files)
            {
                Ok(job) => self.monitor.register(TrackedJob::new(job, pendings)),
                Err(e) => {
                    tracing::error!("{}", e);
                    for pending in &pendings {
                        pending.resolve(Err(ExecutionError::Job(e.clone())));
                    }
                }
            }
        }
        drop(tx);

        let by_index: BTreeMap<usize, &Item> = items.iter().map(|i| (i.index, i)).collect();
        let mut outcomes = BTreeMap::new();
        for (index, outcome) in rx {
            match by_index.get(&index) {
                Some(item) => on_outcome(item, &outcome),
                None => tracing::error!("Outcome for unknown item {}", index),
            }
            outcomes.insert(index, outcome);
        }

        for item in &items {
            if !outcomes.contains_key(&item.index) {
                let outcome = Err(lost_result(item.index));
                on_outcome(item, &outcome);
                outcomes.insert(item.index, outcome);
            }
        }
        Ok(outcomes)
    }

    fn shutdown(&self) {
        if !self.monitor.shutdown() {
            tracing::debug!("Runner already shut down");
        }
    }
}
