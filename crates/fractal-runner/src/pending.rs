use fractal_core::errors::{ExecutionError, JobExecutionError};
use serde_json::Value;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;

pub type ItemOutcome = Result<Value, ExecutionError>;

pub type OutcomeSender = Sender<(usize, ItemOutcome)>;

/// Channel every pending result of one call reports into.
pub fn outcome_channel() -> (OutcomeSender, Receiver<(usize, ItemOutcome)>) {
    mpsc::channel()
}

/// Write-once slot for one item's outcome.
///
/// The first `resolve` wins; later ones are logged and ignored. A result
/// dropped without being resolved reports a job error, so the waiting caller
/// always hears about every item.
#[derive(Debug)]
pub struct PendingResult {
    index: usize,
    sender: Mutex<Option<OutcomeSender>>,
}

impl PendingResult {
    pub fn new(index: usize, sender: OutcomeSender) -> Self {
        Self {
            index,
            sender: Mutex::new(Some(sender)),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_resolved(&self) -> bool {
        self.lock().is_none()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<OutcomeSender>> {
        self.sender.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns `false` if the result had already been resolved.
    pub fn resolve(&self, outcome: ItemOutcome) -> bool {
        let Some(sender) = self.lock().take() else {
            tracing::debug!(
                "Result for item {} already resolved; dropping late outcome",
                self.index
            );
            return false;
        };
        if sender.send((self.index, outcome)).is_err() {
            tracing::debug!("Nobody is waiting for item {} any more", self.index);
        }
        true
    }
}

impl Drop for PendingResult {
    fn drop(&mut self) {
        if !self.is_resolved() {
            tracing::warn!("Result for item {} was abandoned", self.index);
            self.resolve(Err(ExecutionError::Job(JobExecutionError::new(
                "The job tracking this item was discarded before it produced a result",
            ))));
        }
    }
}
