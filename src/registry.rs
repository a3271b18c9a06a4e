//! Named task functions.
//!
//! Closures cannot cross a process boundary, so tasks are referred to by a
//! registered name. Workers are forked from the parent after the registry is
//! built, so every worker sees the same table without any lookup service.

use crate::error::{ExceptionInfo, TaskError};
use crate::protocol::{JobId, TaskArgs};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Set from the worker's SIGUSR1 handler, cleared before each task.
pub(crate) static SOFT_LIMIT_EXCEEDED: AtomicBool = AtomicBool::new(false);

type TaskFn = dyn Fn(&TaskContext, TaskArgs) -> Result<Value, TaskError> + Send + Sync;

/// Execution context handed to every task.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub worker_index: usize,
    pub pid: i32,
    pub job_id: JobId,
    pub index: usize,
}

impl TaskContext {
    /// Whether the soft time limit for the running task has passed.
    ///
    /// Long-running tasks should poll this and wind down when it turns true.
    pub fn soft_time_limit_exceeded(&self) -> bool {
        SOFT_LIMIT_EXCEEDED.load(Ordering::SeqCst)
    }
}

/// Table of task functions keyed by name.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, Arc<TaskFn>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `f` under `name`, replacing any earlier registration.
    ///
    /// The return value is serialized to JSON in the worker; a value that
    /// cannot be serialized is reported as [`TaskError::Unrepresentable`].
    pub fn register<F, R>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&TaskContext, TaskArgs) -> anyhow::Result<R> + Send + Sync + 'static,
        R: Serialize,
    {
        let wrapped = move |ctx: &TaskContext, args: TaskArgs| -> Result<Value, TaskError> {
            match catch_unwind(AssertUnwindSafe(|| f(ctx, args))) {
                Ok(Ok(value)) => {
                    serde_json::to_value(&value).map_err(|e| TaskError::Unrepresentable {
                        type_name: std::any::type_name::<R>().to_string(),
                        message: e.to_string(),
                    })
                }
                Ok(Err(err)) => Err(TaskError::Raised(ExceptionInfo::from_error(&err))),
                Err(payload) => Err(TaskError::Panicked(ExceptionInfo::from_panic(
                    payload.as_ref(),
                ))),
            }
        };
        self.tasks.insert(name.into(), Arc::new(wrapped));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tasks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Run the task registered under `name`.
    pub fn invoke(&self, name: &str, ctx: &TaskContext, args: TaskArgs) -> Result<Value, TaskError> {
        match self.tasks.get(name) {
            Some(f) => f(ctx, args),
            None => Err(TaskError::UnknownTask {
                name: name.to_string(),
            }),
        }
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn ctx() -> TaskContext {
        TaskContext {
            worker_index: 0,
            pid: std::process::id() as i32,
            job_id: 1,
            index: 0,
        }
    }

    #[test]
    fn test_invoke_returns_json_value() {
        let mut registry = TaskRegistry::new();
        registry.register("add", |_, args| {
            Ok(args.arg::<i64>(0)? + args.arg::<i64>(1)?)
        });
        let out = registry
            .invoke("add", &ctx(), TaskArgs::new(vec![json!(2), json!(40)]))
            .unwrap();
        assert_eq!(out, json!(42));
    }

    #[test]
    fn test_error_is_wrapped_with_causes() {
        let mut registry = TaskRegistry::new();
        registry.register("fail", |_, _| -> anyhow::Result<()> {
            Err(anyhow::anyhow!("root cause")).map_err(|e| e.context("while failing"))
        });
        match registry.invoke("fail", &ctx(), TaskArgs::default()) {
            Err(TaskError::Raised(info)) => {
                assert_eq!(info.message, "while failing");
                assert_eq!(info.causes, vec!["root cause".to_string()]);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_panic_is_caught() {
        let mut registry = TaskRegistry::new();
        registry.register("boom", |_, _| -> anyhow::Result<()> { panic!("kaboom") });
        match registry.invoke("boom", &ctx(), TaskArgs::default()) {
            Err(TaskError::Panicked(info)) => assert_eq!(info.message, "kaboom"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_unrepresentable_result() {
        let mut registry = TaskRegistry::new();
        // JSON object keys must be strings.
        registry.register("bad", |_, _| {
            let mut map = BTreeMap::new();
            map.insert(vec![1u8], 1u8);
            Ok(map)
        });
        match registry.invoke("bad", &ctx(), TaskArgs::default()) {
            Err(TaskError::Unrepresentable { type_name, .. }) => {
                assert!(type_name.contains("BTreeMap"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_task() {
        let registry = TaskRegistry::new();
        assert!(matches!(
            registry.invoke("missing", &ctx(), TaskArgs::default()),
            Err(TaskError::UnknownTask { name }) if name == "missing"
        ));
    }

    #[test]
    fn test_names_sorted() {
        let mut registry = TaskRegistry::new();
        registry
            .register("b", |_, _| Ok(()))
            .register("a", |_, _| Ok(()));
        assert_eq!(registry.names(), vec!["a", "b"]);
        assert!(registry.contains("a"));
        assert_eq!(registry.len(), 2);
    }
}
