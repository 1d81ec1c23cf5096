use fractal_core::model::Params;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Failure returned by a registered task function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub kind: String,
    pub message: String,
}

impl TaskFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

pub type TaskFn = Arc<dyn Fn(&Params) -> Result<Value, TaskFailure> + Send + Sync>;

/// Named functions a worker can run in-process.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    functions: HashMap<String, TaskFn>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, function: F) -> &mut Self
    where
        F: Fn(&Params) -> Result<Value, TaskFailure> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.functions.insert(name.clone(), Arc::new(function)).is_some() {
            tracing::warn!("Task function '{}' registered twice; keeping the latest", name);
        }
        self
    }

    pub fn with<F>(mut self, name: impl Into<String>, function: F) -> Self
    where
        F: Fn(&Params) -> Result<Value, TaskFailure> + Send + Sync + 'static,
    {
        self.register(name, function);
        self
    }

    pub fn get(&self, name: &str) -> Option<TaskFn> {
        self.functions.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("functions", &self.names())
            .finish()
    }
}
