use super::common::{
    execute, execute_with_stdin, files_exist_command, parse_files_exist, parse_read_output,
    read_file_command, remove_files_command, write_file_command,
};
use super::{CommandRunner, FileOps, TargetInfo};
use crate::error::Result;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Runs commands on this host as another local user through
/// non-interactive `sudo`.
#[derive(Debug, Clone)]
pub struct SudoTarget {
    user: String,
    name: String,
}

impl SudoTarget {
    pub fn new(user: &str) -> Self {
        Self {
            user: user.to_string(),
            name: format!("sudo:{}", user),
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    fn sudo(&self) -> Command {
        let mut cmd = Command::new("sudo");
        cmd.arg("--set-home")
            .arg("--non-interactive")
            .arg("-u")
            .arg(&self.user);
        cmd
    }
}

impl TargetInfo for SudoTarget {
    fn name(&self) -> &str {
        &self.name
    }
}

impl CommandRunner for SudoTarget {
    fn run_command(&self, command: &str, args: &[&str]) -> Result<String> {
        let mut cmd = self.sudo();
        cmd.arg(command).args(args);
        execute(&self.name, &mut cmd)
    }
}

impl FileOps for SudoTarget {
    fn write_remote_file(&self, path: &Path, content: &str) -> Result<()> {
        let script = write_file_command(path)?.to_shell_string();
        let mut cmd = self.sudo();
        cmd.arg("sh").arg("-c").arg(script);
        execute_with_stdin(&self.name, &mut cmd, content)?;
        Ok(())
    }

    fn read_remote_file(&self, path: &Path) -> Result<Option<String>> {
        let output = self.run_shell(&read_file_command(path).to_shell_string())?;
        Ok(parse_read_output(output))
    }

    fn remove_remote_files(&self, paths: &[PathBuf]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        self.run_shell(&remove_files_command(paths).to_shell_string())?;
        Ok(())
    }

    fn files_exist(&self, paths: &[PathBuf]) -> Result<Vec<bool>> {
        if paths.is_empty() {
            return Ok(Vec::new());
        }
        let output = self.run_shell(&files_exist_command(paths).to_shell_string())?;
        parse_files_exist(&output, paths.len())
    }
}
