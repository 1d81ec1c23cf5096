use fractal_core::errors::ExecutionError;
use fractal_core::ledger::NoopLedger;
use fractal_core::model::{ItemStatus, LedgerRef, StepInfo, TaskType};
use fractal_executor::Callable;
use fractal_runner::{LocalRunner, Runner, TaskInvocation};
use fractal_test_utils::{params, params_with, test_registry, RecordingLedger, TestContext};
use serde_json::json;
use std::sync::Arc;

const LEDGER: LedgerRef = LedgerRef(1);

fn task(callable: Callable, task_type: TaskType) -> TaskInvocation {
    let name = callable.task_name().to_string();
    TaskInvocation::new(callable, task_type, StepInfo::new(1, name))
}

#[test]
fn test_local_multisubmit_records_each_item() {
    let ctx = TestContext::new();
    let ledger = Arc::new(RecordingLedger::new());
    let runner = LocalRunner::new(&ctx.config, test_registry(), ledger.clone()).unwrap();

    let list = vec![
        params("/data/a"),
        params_with("/data/b", json!({"fail": true})),
        params("/data/c"),
    ];
    let outcome = runner
        .multisubmit(
            &task(Callable::registered("fail_if_flagged"), TaskType::Parallel),
            list,
            LEDGER,
        )
        .unwrap();

    assert_eq!(outcome.results.len(), 2);
    assert!(outcome.errors[&1].is_task_error());
    let history = ledger.item_history();
    assert_eq!(history["/data/a"], vec![ItemStatus::Done]);
    assert_eq!(history["/data/b"], vec![ItemStatus::Failed]);
    assert_eq!(history["/data/c"], vec![ItemStatus::Done]);
}

#[test]
fn test_local_command_callable() {
    let ctx = TestContext::new();
    let runner = LocalRunner::new(&ctx.config, test_registry(), Arc::new(NoopLedger)).unwrap();

    let ok = runner
        .submit(
            &task(Callable::command("true", "noop"), TaskType::NonParallel),
            params("/data/a"),
            LEDGER,
        )
        .unwrap();
    assert_eq!(ok.unwrap(), serde_json::Value::Null);

    let failed = runner
        .submit(
            &task(Callable::command("false", "broken"), TaskType::NonParallel),
            params("/data/a"),
            LEDGER,
        )
        .unwrap();
    match failed {
        Err(ExecutionError::Task(e)) => assert_eq!(e.kind, "TaskCommandFailed"),
        other => panic!("expected a task error, got {:?}", other),
    }
}

#[test]
fn test_local_shutdown_prevents_new_items() {
    let ctx = TestContext::new();
    let ledger = Arc::new(RecordingLedger::new());
    let runner = LocalRunner::new(&ctx.config, test_registry(), ledger.clone()).unwrap();
    runner.shutdown();
    runner.shutdown();

    let outcome = runner
        .multisubmit(
            &task(Callable::registered("echo"), TaskType::Parallel),
            vec![params("/data/a"), params("/data/b")],
            LEDGER,
        )
        .unwrap();
    assert_eq!(outcome.errors.len(), 2);
    assert!(outcome
        .errors
        .values()
        .all(|e| matches!(e, ExecutionError::Job(j) if j.is_shutdown())));
    assert_eq!(ledger.len(), 2);
}

#[test]
fn test_local_shutdown_marker_is_honoured() {
    let ctx = TestContext::new();
    let runner = LocalRunner::new(&ctx.config, test_registry(), Arc::new(NoopLedger)).unwrap();
    ctx.request_shutdown();

    let outcome = runner
        .submit(
            &task(Callable::registered("echo"), TaskType::Parallel),
            params("/data/a"),
            LEDGER,
        )
        .unwrap();
    assert!(matches!(outcome, Err(ExecutionError::Job(ref e)) if e.is_shutdown()));
}
