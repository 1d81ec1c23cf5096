use crate::error::{ExecutorError, Result};
use crate::invoke::invoke;
use crate::protocol::{
    read_request, write_response, ExceptionProxy, InvocationResponse, VersionInfo,
};
use crate::registry::TaskRegistry;
use std::path::Path;

/// Worker side of the protocol: reads `input`, runs it and always tries to
/// leave a response in `output`.
///
/// Returns `Ok(true)` if the task succeeded and `Ok(false)` if it failed with
/// a captured error. `Err` means the request could not be honoured at all
/// (unreadable request, incompatible versions); a failure response is still
/// written when possible.
pub async fn run_worker(input: &Path, output: &Path, registry: &TaskRegistry) -> Result<bool> {
    let request = match read_request(input) {
        Ok(request) => request,
        Err(e) => {
            tracing::error!("Cannot read request '{}': {}", input.display(), e);
            write_failure(output, ExceptionProxy::from(&e));
            return Err(e);
        }
    };

    if let Err(e) = request.versions.check_compatible(&VersionInfo::current()) {
        tracing::error!("Refusing request '{}': {}", input.display(), e);
        write_failure(output, ExceptionProxy::from(&e).for_request(&request));
        return Err(e);
    }

    tracing::debug!(
        "Invoking {} for item {:?}",
        request.callable,
        request.item_key
    );
    let response = invoke(&request, registry).await;
    let success = response.is_success();
    write_response(output, &response)?;
    Ok(success)
}

/// Blocking wrapper for callers without a tokio runtime.
pub fn run_worker_blocking(input: &Path, output: &Path, registry: &TaskRegistry) -> Result<bool> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(ExecutorError::Io)?;
    runtime.block_on(run_worker(input, output, registry))
}

fn write_failure(output: &Path, proxy: ExceptionProxy) {
    if let Err(e) = write_response(output, &InvocationResponse::Failure(proxy)) {
        tracing::error!(
            "Could not write failure response '{}': {}",
            output.display(),
            e
        );
    }
}
