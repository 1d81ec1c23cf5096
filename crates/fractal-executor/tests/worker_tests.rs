use fractal_core::model::Params;
use fractal_executor::protocol::{kinds, read_response, write_request};
use fractal_executor::{
    run_worker_blocking, Callable, ExecutorError, InvocationRequest, InvocationResponse,
    TaskFailure, TaskFiles, TaskRegistry, VersionInfo,
};
use serde_json::json;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

fn registry() -> TaskRegistry {
    TaskRegistry::new()
        .with("echo", |p: &Params| Ok(serde_json::Value::Object(p.clone())))
        .with("bad", |_: &Params| Err(TaskFailure::new("ValueError", "bad")))
}

fn write_test_request(dir: &Path, callable: Callable, versions: VersionInfo) -> InvocationRequest {
    let request = InvocationRequest {
        callable,
        params: json!({"zarr_url": "/data/p.zarr/A/01/0"})
            .as_object()
            .cloned()
            .unwrap(),
        item_key: Some("/data/p.zarr/A/01/0".into()),
        batch_position: Some(2),
        files: TaskFiles::from_prefix(&dir.join("par-1_2")),
        versions,
    };
    write_request(&dir.join("par-1_2.req.json"), &request).unwrap();
    request
}

#[test]
fn test_worker_writes_success_response() {
    let dir = tempdir().unwrap();
    write_test_request(dir.path(), Callable::registered("echo"), VersionInfo::current());

    let input = dir.path().join("par-1_2.req.json");
    let output = dir.path().join("par-1_2.res.json");
    assert!(run_worker_blocking(&input, &output, &registry()).unwrap());

    let response = read_response(&output).unwrap();
    assert_eq!(
        response,
        InvocationResponse::Success(json!({"zarr_url": "/data/p.zarr/A/01/0"}))
    );
}

#[test]
fn test_worker_captures_task_failure() {
    let dir = tempdir().unwrap();
    write_test_request(dir.path(), Callable::registered("bad"), VersionInfo::current());

    let input = dir.path().join("par-1_2.req.json");
    let output = dir.path().join("par-1_2.res.json");
    assert!(!run_worker_blocking(&input, &output, &registry()).unwrap());

    let err = read_response(&output).unwrap().into_result().unwrap_err();
    assert!(err.is_task_error());
    let msg = err.to_string();
    assert!(msg.contains("bad"));
    assert!(msg.contains("/data/p.zarr/A/01/0"));
}

#[test]
fn test_worker_rejects_version_mismatch() {
    let dir = tempdir().unwrap();
    let mut versions = VersionInfo::current();
    versions.crate_version = "0.0.1-elsewhere".into();
    write_test_request(dir.path(), Callable::registered("echo"), versions);

    let input = dir.path().join("par-1_2.req.json");
    let output = dir.path().join("par-1_2.res.json");
    let result = run_worker_blocking(&input, &output, &registry());
    assert!(matches!(result, Err(ExecutorError::VersionMismatch(_))));

    match read_response(&output).unwrap() {
        InvocationResponse::Failure(proxy) => {
            assert_eq!(proxy.kind, kinds::VERSION_MISMATCH);
            assert!(proxy.clone().into_execution_error().is_job_error());
        }
        other => panic!("expected failure response, got {:?}", other),
    }
}

#[test]
fn test_worker_handles_garbage_request() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("broken.req.json");
    let output = dir.path().join("broken.res.json");
    fs::write(&input, "{not json").unwrap();

    assert!(run_worker_blocking(&input, &output, &registry()).is_err());
    let err = read_response(&output).unwrap().into_result().unwrap_err();
    assert!(err.is_job_error());
}
