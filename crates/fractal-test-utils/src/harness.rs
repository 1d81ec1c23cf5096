use fractal_core::config::{Config, RunnerSettings};
use fractal_core::constants::ITEM_KEY_FIELD;
use fractal_core::model::Params;
use fractal_executor::{TaskFailure, TaskRegistry};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;

/// A scratch working directory and a configuration tuned for fast polling.
pub struct TestContext {
    pub _temp_dir: tempfile::TempDir,
    pub working_dir: PathBuf,
    pub shutdown_file: PathBuf,
    pub config: Config,
}

impl TestContext {
    pub fn new() -> Self {
        let temp_dir = tempfile::Builder::new()
            .prefix("fractal-test-")
            .tempdir()
            .expect("Failed to create temp dir");
        let working_dir = temp_dir.path().join("work");
        let shutdown_file = temp_dir.path().join("shutdown");
        fs_err::create_dir_all(&working_dir).expect("Failed to create working dir");

        let mut runner = RunnerSettings::new(&working_dir, &shutdown_file);
        runner.poll_interval_ms = 20;
        runner.query_every = 1;
        runner.output_retry_delay_ms = 20;
        let mut config = Config::new(runner);
        config.local.parallel_items = 2;

        Self {
            _temp_dir: temp_dir,
            working_dir,
            shutdown_file,
            config,
        }
    }

    pub fn request_shutdown(&self) {
        fs_err::write(&self.shutdown_file, "").expect("Failed to create shutdown marker");
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// A parameter bundle carrying only the item key.
pub fn params(key: &str) -> Params {
    params_with(key, json!({}))
}

pub fn params_with(key: &str, extra: Value) -> Params {
    let mut params = extra.as_object().cloned().unwrap_or_default();
    params.insert(ITEM_KEY_FIELD.to_string(), Value::String(key.to_string()));
    params
}

/// - `echo`: returns its parameters.
/// - `fail_if_flagged`: raises `ValueError("bad")` when `fail` is true.
/// - `sleep`: sleeps for `seconds` (default 5), then returns null.
pub fn test_registry() -> TaskRegistry {
    TaskRegistry::new()
        .with("echo", |p: &Params| Ok(Value::Object(p.clone())))
        .with("fail_if_flagged", |p: &Params| {
            if p.get("fail").and_then(Value::as_bool).unwrap_or(false) {
                Err(TaskFailure::new("ValueError", "bad"))
            } else {
                Ok(json!({ "key": p.get(ITEM_KEY_FIELD).cloned() }))
            }
        })
        .with("sleep", |p: &Params| {
            let seconds = p.get("seconds").and_then(Value::as_f64).unwrap_or(5.0);
            std::thread::sleep(Duration::from_secs_f64(seconds));
            Ok(Value::Null)
        })
}
