mod error;
mod invoke;
pub mod protocol;
mod registry;
mod worker;

pub use error::{ExecutorError, Result};
pub use invoke::invoke;
pub use protocol::{
    Callable, ExceptionProxy, InvocationRequest, InvocationResponse, TaskFiles, VersionInfo,
};
pub use registry::{TaskFailure, TaskFn, TaskRegistry};
pub use worker::{run_worker, run_worker_blocking};
