use fractal_core::errors::ExecutionError;
use fractal_core::model::{ExplicitPlan, ItemStatus, LedgerRef, StepInfo, TaskType};
use fractal_executor::Callable;
use fractal_runner::{Runner, RunnerError, SlurmRunner, TaskInvocation};
use fractal_test_utils::{
    params, params_with, test_registry, FakeSlurm, LedgerWrite, RecordingLedger, TestContext,
};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

const LEDGER: LedgerRef = LedgerRef(7);

fn setup(ctx: &TestContext) -> (FakeSlurm, Arc<RecordingLedger>, Arc<SlurmRunner>) {
    let slurm = FakeSlurm::new(test_registry());
    let ledger = Arc::new(RecordingLedger::new());
    let runner =
        SlurmRunner::new(&ctx.config, Arc::new(slurm.clone()), ledger.clone()).unwrap();
    (slurm, ledger, Arc::new(runner))
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

fn task(name: &str, task_type: TaskType) -> TaskInvocation {
    TaskInvocation::new(Callable::registered(name), task_type, StepInfo::new(0, name))
}

#[test]
fn test_multisubmit_reports_task_failure_per_item() {
    let ctx = TestContext::new();
    let (_slurm, ledger, runner) = setup(&ctx);

    let list = vec![
        params("/data/a"),
        params("/data/b"),
        params_with("/data/c", json!({"fail": true})),
        params("/data/d"),
    ];
    let outcome = runner
        .multisubmit(&task("fail_if_flagged", TaskType::Parallel), list, LEDGER)
        .unwrap();

    assert_eq!(outcome.len(), 4);
    assert!(!outcome.results.contains_key(&2));
    for i in [0, 1, 3] {
        assert!(outcome.results.contains_key(&i));
    }
    let err = &outcome.errors[&2];
    assert!(err.is_task_error());
    assert!(err.to_string().contains("bad"));

    let history = ledger.item_history();
    assert_eq!(history.len(), 4);
    assert_eq!(history["/data/a"], vec![ItemStatus::Done]);
    assert_eq!(history["/data/b"], vec![ItemStatus::Done]);
    assert_eq!(history["/data/c"], vec![ItemStatus::Failed]);
    assert_eq!(history["/data/d"], vec![ItemStatus::Done]);
    assert_eq!(ledger.len(), 4);
}

#[test]
fn test_batches_cover_every_item_in_order() {
    let ctx = TestContext::new();
    let (slurm, ledger, runner) = setup(&ctx);

    let keys: Vec<String> = (0..5).map(|i| format!("/plate/{}", i)).collect();
    let list = keys.iter().map(|k| params(k)).collect();
    let task = task("echo", TaskType::Parallel).with_plan(ExplicitPlan::new(2, 1));
    let outcome = runner.multisubmit(&task, list, LEDGER).unwrap();

    assert_eq!(slurm.submitted_jobs().len(), 3);
    assert!(outcome.errors.is_empty());
    for (i, key) in keys.iter().enumerate() {
        assert_eq!(outcome.results[&i]["zarr_url"], json!(key));
    }
    assert!(ledger
        .item_history()
        .values()
        .all(|statuses| statuses == &vec![ItemStatus::Done]));
}

#[test]
fn test_cancelled_job_reports_scheduler_state() {
    let ctx = TestContext::new();
    let (slurm, ledger, runner) = setup(&ctx);

    let canceller = {
        let slurm = slurm.clone();
        std::thread::spawn(move || {
            assert!(slurm.wait_for_jobs_in_state(1, "RUNNING", Duration::from_secs(10)));
            slurm.cancel_externally(&slurm.submitted_jobs()[0]);
        })
    };
    let outcome = runner
        .submit(
            &task("sleep", TaskType::NonParallel),
            params_with("/data/a", json!({"seconds": 3})),
            LEDGER,
        )
        .unwrap();
    canceller.join().unwrap();

    match outcome {
        Err(ExecutionError::Job(e)) => {
            let message = e.assemble_message();
            assert!(message.contains("CANCELLED"), "{}", message);
        }
        other => panic!("expected a job error, got {:?}", other),
    }
    assert_eq!(
        ledger.writes(),
        vec![LedgerWrite::All {
            ledger_ref: LEDGER,
            status: ItemStatus::Failed
        }]
    );
}

#[test]
fn test_shutdown_marker_cancels_outstanding_jobs_once() {
    let ctx = TestContext::new();
    let (slurm, _ledger, runner) = setup(&ctx);

    let trigger = {
        let slurm = slurm.clone();
        let marker = ctx.shutdown_file.clone();
        std::thread::spawn(move || {
            assert!(slurm.wait_for_jobs_in_state(2, "RUNNING", Duration::from_secs(10)));
            fs_err::write(&marker, "").unwrap();
        })
    };

    let started = Instant::now();
    let task = task("sleep", TaskType::Parallel).with_plan(ExplicitPlan::new(1, 1));
    let list = vec![
        params_with("/data/a", json!({"seconds": 5})),
        params_with("/data/b", json!({"seconds": 5})),
    ];
    let outcome = runner.multisubmit(&task, list, LEDGER).unwrap();
    trigger.join().unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(outcome.errors.len(), 2);
    for err in outcome.errors.values() {
        match err {
            ExecutionError::Job(e) => assert!(e.is_shutdown()),
            other => panic!("unexpected {:?}", other),
        }
        assert!(err.to_string().contains("shutdown"));
    }

    let mut jobs = slurm.submitted_jobs();
    jobs.sort();
    let calls = slurm.scancel_calls();
    assert_eq!(calls.len(), 1);
    let mut cancelled = calls[0].clone();
    cancelled.sort();
    assert_eq!(cancelled, jobs);
}

#[test]
fn test_explicit_shutdown_is_idempotent() {
    let ctx = TestContext::new();
    let (slurm, _ledger, runner) = setup(&ctx);

    let worker = {
        let runner = runner.clone();
        std::thread::spawn(move || {
            runner.submit(
                &task("sleep", TaskType::Parallel),
                params_with("/data/a", json!({"seconds": 5})),
                LEDGER,
            )
        })
    };
    assert!(slurm.wait_for_jobs_in_state(1, "RUNNING", Duration::from_secs(10)));
    runner.shutdown();
    runner.shutdown();

    let outcome = worker.join().unwrap().unwrap();
    assert!(matches!(outcome, Err(ExecutionError::Job(ref e)) if e.is_shutdown()));
    assert_eq!(slurm.scancel_calls().len(), 1);

    // Nothing new reaches the scheduler afterwards.
    let late = runner
        .submit(&task("echo", TaskType::Parallel), params("/data/b"), LEDGER)
        .unwrap();
    assert!(matches!(late, Err(ExecutionError::Job(ref e)) if e.is_shutdown()));
    assert_eq!(slurm.submitted_jobs().len(), 1);
}

#[test]
fn test_submission_failure_fails_items_without_raising() {
    let ctx = TestContext::new();
    let (slurm, ledger, runner) = setup(&ctx);
    slurm.fail_submissions(true);

    let outcome = runner
        .multisubmit(
            &task("echo", TaskType::Parallel),
            vec![params("/data/a"), params("/data/b")],
            LEDGER,
        )
        .unwrap();

    assert_eq!(outcome.errors.len(), 2);
    assert!(outcome.errors.values().all(ExecutionError::is_job_error));
    assert!(outcome.errors[&0]
        .to_string()
        .contains("Batch job submission failed"));
    assert_eq!(ledger.item_history()["/data/b"], vec![ItemStatus::Failed]);
}

#[test]
fn test_job_never_listed_by_scheduler_finishes_after_misses() {
    let mut ctx = TestContext::new();
    ctx.config.runner.unseen_query_limit = 25;
    let (slurm, ledger, runner) = setup(&ctx);
    slurm.hide_new_jobs(true);

    let started = Instant::now();
    let outcome = runner
        .submit(
            &task("sleep", TaskType::Parallel),
            params_with("/data/a", json!({"seconds": 5})),
            LEDGER,
        )
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(4));
    assert!(matches!(outcome, Err(ExecutionError::Job(ref e)) if !e.is_shutdown()));
    assert!(slurm.squeue_calls() >= 25);
    assert_eq!(ledger.item_history()["/data/a"], vec![ItemStatus::Failed]);
}

#[test]
fn test_job_dropped_from_scheduler_history_counts_as_finished() {
    let ctx = TestContext::new();
    let (slurm, _ledger, runner) = setup(&ctx);

    let expirer = {
        let slurm = slurm.clone();
        std::thread::spawn(move || {
            assert!(slurm.wait_for_jobs_in_state(1, "RUNNING", Duration::from_secs(10)));
            assert!(wait_until(Duration::from_secs(10), || slurm.squeue_calls() >= 2));
            slurm.expire(&slurm.submitted_jobs()[0]);
        })
    };
    let started = Instant::now();
    let outcome = runner
        .submit(
            &task("sleep", TaskType::Parallel),
            params_with("/data/a", json!({"seconds": 5})),
            LEDGER,
        )
        .unwrap();
    expirer.join().unwrap();

    assert!(started.elapsed() < Duration::from_secs(4));
    match outcome {
        Err(ExecutionError::Job(e)) => {
            assert!(!e.is_shutdown());
            assert!(e.assemble_message().contains("RUNNING"));
        }
        other => panic!("expected a job error, got {:?}", other),
    }
}

#[test]
fn test_job_collected_once_outputs_appear() {
    let ctx = TestContext::new();
    let (slurm, ledger, runner) = setup(&ctx);
    slurm.keep_jobs_running(true);

    let outcome = runner
        .submit(&task("echo", TaskType::Parallel), params("/data/a"), LEDGER)
        .unwrap();

    assert_eq!(outcome.unwrap()["zarr_url"], json!("/data/a"));
    let jobs = slurm.submitted_jobs();
    assert_eq!(slurm.job_state(&jobs[0]), Some("RUNNING"));
    assert_eq!(ledger.item_history()["/data/a"], vec![ItemStatus::Done]);
}

#[test]
fn test_slow_collection_does_not_delay_shutdown() {
    let mut ctx = TestContext::new();
    ctx.config.runner.output_retry_delay_ms = 3000;
    let (slurm, _ledger, runner) = setup(&ctx);

    let trigger = {
        let slurm = slurm.clone();
        let runner = runner.clone();
        let marker = ctx.shutdown_file.clone();
        std::thread::spawn(move || {
            assert!(slurm.wait_for_jobs_in_state(2, "RUNNING", Duration::from_secs(10)));
            let jobs = slurm.submitted_jobs();
            let remaining = vec![jobs[1].clone()];
            slurm.cancel_externally(&jobs[0]);
            // The cancelled job is now being collected, waiting on its output.
            assert!(wait_until(Duration::from_secs(5), || {
                runner.monitor().job_ids() == remaining
            }));
            fs_err::write(&marker, "").unwrap();
            let cancelled_in_time =
                wait_until(Duration::from_millis(1500), || !slurm.scancel_calls().is_empty());
            (jobs, cancelled_in_time)
        })
    };

    let task = task("sleep", TaskType::Parallel).with_plan(ExplicitPlan::new(1, 1));
    let list = vec![
        params_with("/data/a", json!({"seconds": 5})),
        params_with("/data/b", json!({"seconds": 5})),
    ];
    let outcome = runner.multisubmit(&task, list, LEDGER).unwrap();
    let (jobs, cancelled_in_time) = trigger.join().unwrap();

    assert!(cancelled_in_time);
    assert_eq!(slurm.scancel_calls(), vec![vec![jobs[1].clone()]]);
    assert_eq!(outcome.errors.len(), 2);
    let shutdowns = outcome
        .errors
        .values()
        .filter(|e| matches!(e, ExecutionError::Job(j) if j.is_shutdown()))
        .count();
    assert_eq!(shutdowns, 1);
}

#[test]
fn test_duplicate_keys_rejected_before_submission() {
    let ctx = TestContext::new();
    let (slurm, ledger, runner) = setup(&ctx);

    let err = runner
        .multisubmit(
            &task("echo", TaskType::Parallel),
            vec![params("/data/a"), params("/data/a")],
            LEDGER,
        )
        .unwrap_err();
    assert!(matches!(err, RunnerError::DuplicateItemKey { .. }));
    assert!(slurm.submitted_jobs().is_empty());
    assert!(ledger.is_empty());
}

#[test]
fn test_compound_allows_duplicates_and_skips_ledger() {
    let ctx = TestContext::new();
    let (_slurm, ledger, runner) = setup(&ctx);

    let outcome = runner
        .multisubmit(
            &task("echo", TaskType::Compound),
            vec![params("/data/a"), params("/data/a")],
            LEDGER,
        )
        .unwrap();
    assert_eq!(outcome.results.len(), 2);
    assert!(ledger.is_empty());
}

#[test]
fn test_non_parallel_multisubmit_rejected() {
    let ctx = TestContext::new();
    let (_slurm, _ledger, runner) = setup(&ctx);
    let err = runner
        .multisubmit(
            &task("echo", TaskType::NonParallel),
            vec![params("/data/a")],
            LEDGER,
        )
        .unwrap_err();
    assert!(matches!(err, RunnerError::UnsupportedTaskType(TaskType::NonParallel)));
}

#[test]
fn test_successful_item_files_are_removed() {
    let ctx = TestContext::new();
    let (_slurm, _ledger, runner) = setup(&ctx);

    let outcome = runner
        .submit(&task("echo", TaskType::Parallel), params("/data/a"), LEDGER)
        .unwrap();
    assert!(outcome.is_ok());

    let step_dir = ctx.working_dir.join("0_echo");
    let leftovers: Vec<_> = fs_err::read_dir(&step_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .filter(|name| name.ends_with(".json") || name.ends_with(".sbatch"))
        .collect();
    assert!(leftovers.is_empty(), "{:?}", leftovers);
}
