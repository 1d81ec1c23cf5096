use crate::protocol::{kinds, Callable, ExceptionProxy, InvocationRequest, InvocationResponse};
use crate::registry::TaskRegistry;
use fractal_core::constants::worker::LOG_TAIL_LINES;
use serde_json::Value;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command as TokioCommand;

/// Runs one request in the current process and captures its outcome.
/// Never fails: every problem becomes a failure response.
pub async fn invoke(request: &InvocationRequest, registry: &TaskRegistry) -> InvocationResponse {
    let outcome = match &request.callable {
        Callable::Registered { name } => invoke_registered(name, request, registry).await,
        Callable::Command { command, .. } => invoke_command(command, request).await,
    };
    match outcome {
        Ok(value) => InvocationResponse::Success(value),
        Err(proxy) => InvocationResponse::Failure(proxy.for_request(request)),
    }
}

async fn invoke_registered(
    name: &str,
    request: &InvocationRequest,
    registry: &TaskRegistry,
) -> Result<Value, ExceptionProxy> {
    let function = registry.get(name).ok_or_else(|| {
        ExceptionProxy::new(
            kinds::UNKNOWN_CALLABLE,
            format!(
                "No task function named '{}' (known: {})",
                name,
                registry.names().join(", ")
            ),
        )
    })?;
    let params = request.params.clone();
    let joined = tokio::task::spawn_blocking(move || function(&params)).await;
    match joined {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(failure)) => Err(ExceptionProxy::new(failure.kind, failure.message)),
        Err(join_err) => Err(ExceptionProxy::new(
            kinds::PANIC,
            format!("Task function '{}' panicked: {}", name, join_err),
        )),
    }
}

async fn invoke_command(command: &str, request: &InvocationRequest) -> Result<Value, ExceptionProxy> {
    let files = &request.files;
    let io_failure = |what: &str, path: &Path, e: std::io::Error| {
        ExceptionProxy::new(
            kinds::WORKER,
            format!("Failed to {} '{}': {}", what, path.display(), e),
        )
    };

    if let Some(parent) = files.args_json.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| io_failure("create directory", parent, e))?;
    }
    let args = serde_json::to_vec_pretty(&request.params)
        .map_err(|e| ExceptionProxy::new(kinds::WORKER, e.to_string()))?;
    tokio::fs::write(&files.args_json, args)
        .await
        .map_err(|e| io_failure("write", &files.args_json, e))?;

    let log = std::fs::File::create(&files.log).map_err(|e| io_failure("create", &files.log, e))?;
    let log_err = log
        .try_clone()
        .map_err(|e| io_failure("open", &files.log, e))?;

    let full_command = format!(
        "{} --args-json {} --out-json {}",
        command,
        shell_quote(&files.args_json.to_string_lossy()),
        shell_quote(&files.out_json.to_string_lossy())
    );
    let mut cmd = TokioCommand::new("sh");
    cmd.arg("-c")
        .arg(&full_command)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err));
    tracing::info!("Running task command: {}", full_command);

    let status = cmd.status().await.map_err(|e| {
        ExceptionProxy::new(
            kinds::WORKER,
            format!("Failed to spawn '{}': {}", full_command, e),
        )
    })?;

    if !status.success() {
        let tail = read_tail(&files.log, LOG_TAIL_LINES).await;
        let code = status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        return Err(ExceptionProxy::new(
            kinds::COMMAND_FAILED,
            format!(
                "Task command exited with status {}.\nCommand: {}\nLog tail ({}):\n{}",
                code,
                full_command,
                files.log.display(),
                tail
            ),
        ));
    }

    match tokio::fs::read(&files.out_json).await {
        Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(Value::Null),
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
            ExceptionProxy::new(
                kinds::COMMAND_FAILED,
                format!(
                    "Task output '{}' is not valid JSON: {}",
                    files.out_json.display(),
                    e
                ),
            )
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Value::Null),
        Err(e) => Err(io_failure("read", &files.out_json, e)),
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

async fn read_tail(path: &Path, lines: usize) -> String {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => {
            let all: Vec<&str> = content.lines().collect();
            let start = all.len().saturating_sub(lines);
            all[start..].join("\n")
        }
        Err(e) => format!("<failed to read log: {}>", e),
    }
}
