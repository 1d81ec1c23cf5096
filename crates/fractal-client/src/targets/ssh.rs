use super::common::{
    execute, execute_with_stdin, files_exist_command, parse_files_exist, parse_read_output,
    read_file_command, remove_files_command, shell_quote, write_file_command,
};
use super::{CommandRunner, FileOps, RemoteCommand, TargetInfo};
use crate::error::Result;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Runs commands on a login node over `ssh`. Key-based, non-interactive
/// authentication is assumed.
#[derive(Debug, Clone)]
pub struct SshTarget {
    address: String,
    name: String,
}

impl SshTarget {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            name: format!("ssh:{}", address),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn ssh(&self, remote_command: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg(&self.address)
            .arg(remote_command);
        cmd
    }

    fn remote_string(command: &str, args: &[&str]) -> String {
        if command == "sh" && args.len() == 2 && args[0] == "-c" {
            format!("sh -c {}", shell_quote(args[1]))
        } else {
            RemoteCommand::new(command).args(args).to_shell_string()
        }
    }
}

impl TargetInfo for SshTarget {
    fn name(&self) -> &str {
        &self.name
    }
}

impl CommandRunner for SshTarget {
    fn run_command(&self, command: &str, args: &[&str]) -> Result<String> {
        let mut cmd = self.ssh(&Self::remote_string(command, args));
        execute(&self.name, &mut cmd)
    }
}

impl FileOps for SshTarget {
    fn write_remote_file(&self, path: &Path, content: &str) -> Result<()> {
        let remote = write_file_command(path)?.to_shell_string();
        let mut cmd = self.ssh(&remote);
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
