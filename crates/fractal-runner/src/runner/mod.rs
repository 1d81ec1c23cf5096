use crate::error::{Result, RunnerError};
use crate::pending::ItemOutcome;
use fractal_core::constants::ITEM_KEY_FIELD;
use fractal_core::errors::{ExecutionError, JobExecutionError};
use fractal_core::ledger::HistoryLedger;
use fractal_core::model::{
    ExplicitPlan, Item, ItemKey, ItemStatus, LedgerRef, Params, ResourceRequest, StepInfo,
    TaskType,
};
use fractal_executor::Callable;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

mod local;
mod slurm;

pub use local::LocalRunner;
pub use slurm::SlurmRunner;

/// What to run and how to account for it.
#[derive(Debug, Clone)]
pub struct TaskInvocation {
    pub callable: Callable,
    pub task_type: TaskType,
    pub step: StepInfo,
    /// Falls back to the configured per-item request.
    pub resources: Option<ResourceRequest>,
    /// Falls back to the configured plan, then to the heuristics.
    pub plan: ExplicitPlan,
}

impl TaskInvocation {
    pub fn new(callable: Callable, task_type: TaskType, step: StepInfo) -> Self {
        Self {
            callable,
            task_type,
            step,
            resources: None,
            plan: ExplicitPlan::default(),
        }
    }

    pub fn with_resources(mut self, resources: ResourceRequest) -> Self {
        self.resources = Some(resources);
        self
    }

    pub fn with_plan(mut self, plan: ExplicitPlan) -> Self {
        self.plan = plan;
        self
    }
}

/// Per-item results and errors of one `multisubmit`, keyed by input position.
#[derive(Debug, Default)]
pub struct MultisubmitOutcome {
    pub results: BTreeMap<usize, Value>,
    pub errors: BTreeMap<usize, ExecutionError>,
}

impl MultisubmitOutcome {
    fn from_outcomes(outcomes: BTreeMap<usize, ItemOutcome>) -> Self {
        let mut this = Self::default();
        for (index, outcome) in outcomes {
            match outcome {
                Ok(value) => {
                    this.results.insert(index, value);
                }
                Err(e) => {
                    this.errors.insert(index, e);
                }
            }
        }
        this
    }

    pub fn len(&self) -> usize {
        self.results.len() + self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub(crate) fn lost_result(index: usize) -> ExecutionError {
    ExecutionError::Job(JobExecutionError::new(format!(
        "No outcome was reported for item {}",
        index
    )))
}

fn status_of(outcome: &ItemOutcome) -> ItemStatus {
    if outcome.is_ok() {
        ItemStatus::Done
    } else {
        ItemStatus::Failed
    }
}

fn write_item(ledger: &dyn HistoryLedger, ledger_ref: LedgerRef, key: &ItemKey, status: ItemStatus) {
    if let Err(e) = ledger.update_item(ledger_ref, key, status) {
        tracing::error!("{}", e);
    }
}

fn write_all(ledger: &dyn HistoryLedger, ledger_ref: LedgerRef, status: ItemStatus) {
    if let Err(e) = ledger.update_all(ledger_ref, status) {
        tracing::error!("{}", e);
    }
}

/// Builds items from parameter bundles, rejecting missing keys and, unless
/// `allow_duplicates`, repeated ones.
pub fn validate_items(params: Vec<Params>, allow_duplicates: bool) -> Result<Vec<Item>> {
    let items: Vec<Item> = params
        .into_iter()
        .enumerate()
        .map(|(index, params)| Item::new(index, params))
        .collect();

    let mut first_seen: HashMap<&ItemKey, usize> = HashMap::new();
    for item in &items {
        let key = item.key.as_ref().ok_or(RunnerError::MissingItemKey {
            index: item.index,
            field: ITEM_KEY_FIELD,
        })?;
        if allow_duplicates {
            continue;
        }
        if let Some(&first) = first_seen.get(key) {
            return Err(RunnerError::DuplicateItemKey {
                key: key.to_string(),
                first,
                second: item.index,
            });
        }
        first_seen.insert(key, item.index);
    }
    Ok(items)
}

/// Common interface of the execution backends.
///
/// Backends provide [`Runner::run_items`]; ledger bookkeeping and input
/// validation are shared.
pub trait Runner: Send + Sync {
    fn ledger(&self) -> &dyn HistoryLedger;

    /// Runs every item to an outcome. `on_outcome` is called exactly once per
    /// item, as soon as that item's outcome is known.
    fn run_items(
        &self,
        task: &TaskInvocation,
        items: Vec<Item>,
        on_outcome: &mut dyn FnMut(&Item, &ItemOutcome),
    ) -> Result<BTreeMap<usize, ItemOutcome>>;

    /// Cancels outstanding work. Safe to call more than once.
    fn shutdown(&self);

    /// Runs a single item and blocks until it resolves.
    fn submit(
        &self,
        task: &TaskInvocation,
        params: Params,
        ledger_ref: LedgerRef,
    ) -> Result<ItemOutcome> {
        let item = Item::new(0, params);
        let key = item.key.clone();
        let mut outcomes = self.run_items(task, vec![item], &mut |_: &Item, _: &ItemOutcome| {})?;
        let outcome = outcomes.remove(&0).unwrap_or_else(|| Err(lost_result(0)));

        let status = status_of(&outcome);
        match (task.task_type, key) {
            (t, _) if t.is_compound() => {}
            (TaskType::Parallel, Some(key)) => write_item(self.ledger(), ledger_ref, &key, status),
            _ => write_all(self.ledger(), ledger_ref, status),
        }
        Ok(outcome)
    }

    /// Runs many items concurrently, updating the ledger item by item as
    /// they resolve.
    fn multisubmit(
        &self,
        task: &TaskInvocation,
        params: Vec<Params>,
        ledger_ref: LedgerRef,
    ) -> Result<MultisubmitOutcome> {
        let compound = task.task_type.is_compound();
        if !compound && !task.task_type.is_parallel() {
            return Err(RunnerError::UnsupportedTaskType(task.task_type));
        }
        let items = validate_items(params, compound)?;
        if items.is_empty() {
            return Ok(MultisubmitOutcome::default());
        }

        let ledger = self.ledger();
        let outcomes = self.run_items(task, items, &mut |item: &Item, outcome: &ItemOutcome| {
            if compound {
                return;
            }
            if let Some(key) = &item.key {
                write_item(ledger, ledger_ref, key, status_of(outcome));
            }
        })?;
        Ok(MultisubmitOutcome::from_outcomes(outcomes))
    }
}
