use super::RemoteCommand;
use crate::error::{ClientError, Result};
use fractal_core::logging::{format_command_for_display, log_and_print_command};
use std::io::Write;
use std::path::Path;
use std::process::{Command, Output, Stdio};

/// Printed by the remote read helper when the file does not exist, so that
/// "missing" is distinguishable from "empty" across sudo and ssh.
pub const MISSING_FILE_MARKER: &str = "__FRACTAL_FILE_MISSING__";

pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

fn check_output(target: &str, cmd: &Command, output: Output) -> Result<String> {
    if !output.status.success() {
        return Err(ClientError::TargetCommandFailed {
            target: target.to_string(),
            command: format_command_for_display(cmd),
            code: output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string()),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

pub fn execute(target: &str, cmd: &mut Command) -> Result<String> {
    log_and_print_command(cmd);
    let display = format_command_for_display(cmd);
    let output = cmd.output().map_err(|e| ClientError::Spawn {
        target: target.to_string(),
        command: display,
        source: e,
    })?;
    check_output(target, cmd, output)
}

/// Like [`execute`], feeding `content` to the command's stdin.
pub fn execute_with_stdin(target: &str, cmd: &mut Command, content: &str) -> Result<String> {
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    log_and_print_command(cmd);

    let display = format_command_for_display(cmd);
    let spawn_error = |e: std::io::Error| ClientError::Spawn {
        target: target.to_string(),
        command: display.clone(),
        source: e,
    };
    let mut child = cmd.spawn().map_err(spawn_error)?;
    let mut stdin = child.stdin.take().ok_or_else(|| {
        spawn_error(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "stdin not captured",
        ))
    })?;
    let bytes = content.as_bytes().to_vec();
    let writer = std::thread::spawn(move || stdin.write_all(&bytes));

    let output = child.wait_with_output().map_err(spawn_error)?;
    match writer.join() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!("Writing stdin for '{}' failed: {}", target, e),
        Err(_) => tracing::warn!("stdin writer thread for '{}' panicked", target),
    }
    check_output(target, cmd, output)
}

pub fn write_file_command(path: &Path) -> Result<RemoteCommand> {
    let parent = path.parent().ok_or_else(|| ClientError::InvalidPath {
        path: path.to_path_buf(),
        reason: "Path has no parent directory".to_string(),
    })?;
    Ok(RemoteCommand::new("mkdir")
        .arg("-p")
        .arg(&parent.to_string_lossy())
        .and(RemoteCommand::new("cat").redirect_out(&path.to_string_lossy())))
}

pub fn read_file_command(path: &Path) -> RemoteCommand {
    let quoted = shell_quote(&path.to_string_lossy());
    RemoteCommand::from(
        format!(
            "if [ -f {0} ]; then cat {0}; else printf '%s' {1}; fi",
            quoted, MISSING_FILE_MARKER
        )
        .as_str(),
    )
}

pub fn parse_read_output(output: String) -> Option<String> {
    if output == MISSING_FILE_MARKER {
        None
    } else {
        Some(output)
    }
}

pub fn remove_files_command<P: AsRef<Path>>(paths: &[P]) -> RemoteCommand {
    RemoteCommand::new("rm")
        .arg("-f")
        .args(paths.iter().map(|p| p.as_ref().to_string_lossy().to_string()))
}

/// Prints one `1`/`0` line per path, so a whole job is checked in a single
/// round trip.
pub fn files_exist_command<P: AsRef<Path>>(paths: &[P]) -> RemoteCommand {
    RemoteCommand::new("for")
        .raw("f")
        .raw("in")
        .args(paths.iter().map(|p| p.as_ref().to_string_lossy().to_string()))
        .raw(";")
        .raw(r#"do if [ -f "$f" ]; then echo 1; else echo 0; fi; done"#)
}

pub fn parse_files_exist(output: &str, expected: usize) -> Result<Vec<bool>> {
    let flags: Vec<bool> = output.lines().map(|line| line.trim() == "1").collect();
    if flags.len() != expected {
        return Err(ClientError::UnexpectedOutput(format!(
            "expected {} existence flags, got {:?}",
            expected, output
        )));
    }
    Ok(flags)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote_simple() {
        assert_eq!(shell_quote("hello"), "'hello'");
    }

    #[test]
    fn test_shell_quote_with_single_quote() {
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn test_execute_reports_stderr_on_failure() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo nope >&2; exit 4");
        let err = execute("local", &mut cmd).unwrap_err();
        match err {
            ClientError::TargetCommandFailed { code, stderr, .. } => {
                assert_eq!(code, "4");
                assert_eq!(stderr, "nope");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_execute_with_stdin_roundtrip() {
        let mut cmd = Command::new("cat");
        let out = execute_with_stdin("local", &mut cmd, "payload\n").unwrap();
        assert_eq!(out, "payload\n");
    }

    #[test]
    fn test_files_exist_command_through_shell() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("par-1_0.res.json");
        std::fs::write(&present, "{}").unwrap();
        let paths = vec![present, dir.path().join("it's missing.json")];

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(files_exist_command(&paths).to_shell_string());
        let output = execute("local", &mut cmd).unwrap();
        assert_eq!(parse_files_exist(&output, 2).unwrap(), vec![true, false]);
        assert!(parse_files_exist(&output, 3).is_err());
    }

    #[test]
    fn test_read_file_command_through_shell() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("a.json");
        std::fs::write(&present, "{}").unwrap();

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(read_file_command(&present).to_shell_string());
        assert_eq!(parse_read_output(execute("local", &mut cmd).unwrap()), Some("{}".into()));

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(read_file_command(&dir.path().join("missing")).to_shell_string());
        assert_eq!(parse_read_output(execute("local", &mut cmd).unwrap()), None);
    }
}
