//! Everything that talks to the scheduler: batching heuristics, job file
//! layout, batch script rendering and the targets commands run on.

pub mod error;
pub mod files;
pub mod heuristics;
pub mod script;
pub mod slurm;
pub mod submission;
pub mod targets;

pub use error::{ClientError, Result};
pub use files::{job_prefix, ItemFiles, JobFiles, StepFolders};
pub use slurm::{JobState, SlurmClient};
pub use submission::{JobSubmitter, SubmittedJob};
pub use targets::{build_target, Target};
