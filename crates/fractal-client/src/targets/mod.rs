//! Where scheduler commands and job-side file operations actually run.

use crate::error::Result;
use fractal_core::config::TargetConfig;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub mod common;
pub mod local;
pub mod remote_command;
pub mod ssh;
pub mod sudo;

pub use local::LocalTarget;
pub use remote_command::RemoteCommand;
pub use ssh::SshTarget;
pub use sudo::SudoTarget;

pub trait TargetInfo {
    fn name(&self) -> &str;

    /// Whether job-side paths are directly visible to this process, so that
    /// no copy is needed between server-side and job-side folders.
    fn shares_filesystem(&self) -> bool {
        false
    }
}

pub trait CommandRunner {
    /// Runs `command args...` and returns its stdout. Fails on non-zero exit.
    fn run_command(&self, command: &str, args: &[&str]) -> Result<String>;

    fn run_shell(&self, script: &str) -> Result<String> {
        self.run_command("sh", &["-c", script])
    }
}

pub trait FileOps {
    fn write_remote_file(&self, path: &Path, content: &str) -> Result<()>;

    /// `Ok(None)` if the file does not exist.
    fn read_remote_file(&self, path: &Path) -> Result<Option<String>>;

    fn remove_remote_files(&self, paths: &[PathBuf]) -> Result<()>;

    /// One flag per path, in order.
    fn files_exist(&self, paths: &[PathBuf]) -> Result<Vec<bool>> {
        paths
            .iter()
            .map(|path| Ok(self.read_remote_file(path)?.is_some()))
            .collect()
    }
}

pub trait Target: TargetInfo + CommandRunner + FileOps + Send + Sync {}

impl<T: TargetInfo + CommandRunner + FileOps + Send + Sync> Target for T {}

pub fn build_target(config: &TargetConfig) -> Arc<dyn Target> {
    match config {
        TargetConfig::Local => Arc::new(LocalTarget::new()),
        TargetConfig::Sudo { user } => Arc::new(SudoTarget::new(user)),
        TargetConfig::Ssh { address } => Arc::new(SshTarget::new(address)),
    }
}
