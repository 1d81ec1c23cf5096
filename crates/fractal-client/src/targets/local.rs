use super::common::execute;
use super::{CommandRunner, FileOps, TargetInfo};
use crate::error::Result;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Runs everything as the current user on the current host.
#[derive(Debug, Clone, Default)]
pub struct LocalTarget;

impl LocalTarget {
    pub fn new() -> Self {
        Self
    }
}

impl TargetInfo for LocalTarget {
    fn name(&self) -> &str {
        "local"
    }

    fn shares_filesystem(&self) -> bool {
        true
    }
}

impl CommandRunner for LocalTarget {
    fn run_command(&self, command: &str, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new(command);
        cmd.args(args);
        execute(self.name(), &mut cmd)
    }
}

impl FileOps for LocalTarget {
    fn write_remote_file(&self, path: &Path, content: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs_err::create_dir_all(parent)?;
        }
        fs_err::write(path, content)?;
        Ok(())
    }

    fn read_remote_file(&self, path: &Path) -> Result<Option<String>> {
        match fs_err::read_to_string(path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn remove_remote_files(&self, paths: &[PathBuf]) -> Result<()> {
        for path in paths {
            match fs_err::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn files_exist(&self, paths: &[PathBuf]) -> Result<Vec<bool>> {
        Ok(paths.iter().map(|path| path.is_file()).collect())
    }
}
