//! Runs task items to completion, either in-process or as SLURM jobs, and
//! records each item's outcome in the history ledger.

pub mod collector;
pub mod error;
pub mod monitor;
pub mod pending;
pub mod runner;

pub use error::{Result, RunnerError};
pub use pending::{ItemOutcome, PendingResult};
pub use runner::{
    validate_items, LocalRunner, MultisubmitOutcome, Runner, SlurmRunner, TaskInvocation,
};
