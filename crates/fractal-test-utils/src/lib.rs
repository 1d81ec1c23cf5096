//! Shared fixtures for integration tests: a scheduler that runs jobs in
//! threads, a ledger that remembers every write and a few task functions.

mod fake_slurm;
mod harness;
mod ledger;

pub use fake_slurm::FakeSlurm;
pub use harness::{params, params_with, test_registry, TestContext};
pub use ledger::{LedgerWrite, RecordingLedger};
