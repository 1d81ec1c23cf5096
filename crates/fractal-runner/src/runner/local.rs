use super::{lost_result, Runner, TaskInvocation};
use crate::error::{Result, RunnerError};
use crate::pending::ItemOutcome;
use fractal_client::{job_prefix, StepFolders};
use fractal_core::config::{Config, RunnerSettings};
use fractal_core::errors::{ExecutionError, JobExecutionError};
use fractal_core::ledger::HistoryLedger;
use fractal_core::model::Item;
use fractal_executor::{invoke, InvocationRequest, TaskFiles, TaskRegistry, VersionInfo};
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio::sync::Semaphore;

/// Runs items in-process on a bounded pool, without a scheduler.
pub struct LocalRunner {
    settings: RunnerSettings,
    parallel_items: usize,
    registry: Arc<TaskRegistry>,
    ledger: Arc<dyn HistoryLedger>,
    runtime: Runtime,
    shut_down: AtomicBool,
    call_seq: AtomicU64,
}

impl LocalRunner {
    pub fn new(
        config: &Config,
        registry: TaskRegistry,
        ledger: Arc<dyn HistoryLedger>,
    ) -> Result<Self> {
        config.validate()?;
        let parallel_items = config.local.parallel_items.max(1);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(parallel_items.min(num_cpus::get()).max(1))
            .thread_name("fractal-local")
            .enable_all()
            .build()
            .map_err(RunnerError::Startup)?;
        tracing::info!("Local runner ready ({} item(s) at a time)", parallel_items);

        Ok(Self {
            settings: config.runner.clone(),
            parallel_items,
            registry: Arc::new(registry),
            ledger,
            runtime,
            shut_down: AtomicBool::new(false),
            call_seq: AtomicU64::new(0),
        })
    }

    fn stop_requested(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst) || self.settings.shutdown_file.exists()
    }

    fn cleanup(files: &TaskFiles) {
        for path in files.all() {
            match fs_err::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("{}", e),
            }
        }
    }

    async fn run_one(
        &self,
        task: &TaskInvocation,
        item: &Item,
        files: TaskFiles,
        limit: &Semaphore,
    ) -> ItemOutcome {
        let _permit = limit.acquire().await.map_err(|_| {
            ExecutionError::Job(JobExecutionError::new("Local worker pool was closed"))
        })?;
        if self.stop_requested() {
            return Err(ExecutionError::Job(JobExecutionError::shutdown()));
        }

        let request = InvocationRequest {
            callable: task.callable.clone(),
            params: item.params.clone(),
            item_key: item.key.as_ref().map(|k| k.0.clone()),
            batch_position: Some(0),
            files: files.clone(),
            versions: VersionInfo::current(),
        };
        let outcome = invoke(&request, &self.registry).await.into_result();
        if outcome.is_ok() && !self.settings.keep_files {
            Self::cleanup(&files);
        }
        outcome
    }
}

impl Runner for LocalRunner {
    fn ledger(&self) -> &dyn HistoryLedger {
        self.ledger.as_ref()
    }

    fn run_items(
        &self,
        task: &TaskInvocation,
        items: Vec<Item>,
        on_outcome: &mut dyn FnMut(&Item, &ItemOutcome),
    ) -> Result<BTreeMap<usize, ItemOutcome>> {
        let folders = StepFolders::new(&self.settings, &task.step);
        let seq = self.call_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let prefix = job_prefix(task.task_type, seq);
        let limit = Semaphore::new(self.parallel_items);

        let mut outcomes = self.runtime.block_on(async {
            let mut running: FuturesUnordered<_> = items
                .iter()
                .map(|item| {
                    let files = TaskFiles::from_prefix(
                        &folders.local.join(format!("{}_{}", prefix, item.index)),
                    );
                    let limit = &limit;
                    async move { (item, self.run_one(task, item, files, limit).await) }
                })
                .collect();

            let mut outcomes = BTreeMap::new();
            while let Some((item, outcome)) = running.next().await {
                if let Err(e) = &outcome {
                    tracing::error!("Item {} failed: {}", item.index, e);
                }
                on_outcome(item, &outcome);
                outcomes.insert(item.index, outcome);
            }
            outcomes
        });

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
        if !self.shut_down.swap(true, Ordering::SeqCst) {
            tracing::info!("Local runner shutting down; pending items will not start");
        }
    }
}
