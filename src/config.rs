//! Pool configuration.
//!
//! # Environment Variables
//!
//! Read by [`PoolConfig::with_env_overrides`]:
//!
//! - `FORKPOOL_PROCESSES` - Number of worker processes
//! - `FORKPOOL_MAX_TASKS_PER_CHILD` - Recycle a worker after this many tasks
//! - `FORKPOOL_TIMEOUT` - Hard time limit per task, in seconds
//! - `FORKPOOL_SOFT_TIMEOUT` - Soft time limit per task, in seconds
//! - `FORKPOOL_MAX_RESTARTS` - Restarts tolerated within the restart window
//! - `FORKPOOL_MAX_RESTART_WINDOW` - Restart window, in seconds
//! - `FORKPOOL_BLOCKING_SUBMIT` - `true`/`false`, block `apply_async` when saturated

use crate::error::{PoolError, Result};
use crate::heap::DEFAULT_ARENA_SIZE;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Per-worker startup hook, run in the child before its first task.
pub type Initializer = Arc<dyn Fn(&[Value]) -> anyhow::Result<()> + Send + Sync>;

/// Configuration for a [`Pool`](crate::Pool).
#[derive(Clone)]
pub struct PoolConfig {
    /// Target number of worker processes.
    pub processes: usize,
    pub initializer: Option<Initializer>,
    pub initargs: Vec<Value>,
    /// Recycle a worker after it completes this many tasks.
    pub max_tasks_per_child: Option<usize>,
    /// Default hard time limit.
    pub timeout: Option<Duration>,
    /// Default soft time limit.
    pub soft_timeout: Option<Duration>,
    /// Abnormal exits tolerated within `max_restart_window`; `None` is unlimited.
    pub max_restarts: Option<usize>,
    pub max_restart_window: Duration,
    /// Block `apply_async` when every submission slot is in use, instead of
    /// failing with [`PoolError::Saturated`].
    pub blocking_submit: bool,
    /// How long a task of an abnormally exited worker may still be answered
    /// before it is failed as lost.
    pub lost_worker_timeout: Duration,
    /// Supervisor tick once warm-up is over.
    pub maintain_interval: Duration,
    /// Supervisor tick during warm-up.
    pub warmup_interval: Duration,
    /// Number of warm-up ticks.
    pub warmup_ticks: usize,
    pub timeout_check_interval: Duration,
    /// Delay between SIGTERM and SIGKILL when reclaiming a worker.
    pub terminate_grace: Duration,
    /// How long the result handler keeps draining after shutdown begins.
    pub shutdown_grace: Duration,
    /// Size of the first shared-memory arena.
    pub arena_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            processes: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            initializer: None,
            initargs: Vec::new(),
            max_tasks_per_child: None,
            timeout: None,
            soft_timeout: None,
            max_restarts: None,
            max_restart_window: Duration::from_secs(1),
            blocking_submit: true,
            lost_worker_timeout: Duration::from_secs(10),
            maintain_interval: Duration::from_millis(800),
            warmup_interval: Duration::from_millis(100),
            warmup_ticks: 10,
            timeout_check_interval: Duration::from_secs(1),
            terminate_grace: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(10),
            arena_size: DEFAULT_ARENA_SIZE,
        }
    }
}

impl fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConfig")
            .field("processes", &self.processes)
            .field("initializer", &self.initializer.as_ref().map(|_| ".."))
            .field("initargs", &self.initargs)
            .field("max_tasks_per_child", &self.max_tasks_per_child)
            .field("timeout", &self.timeout)
            .field("soft_timeout", &self.soft_timeout)
            .field("max_restarts", &self.max_restarts)
            .field("max_restart_window", &self.max_restart_window)
            .field("blocking_submit", &self.blocking_submit)
            .field("lost_worker_timeout", &self.lost_worker_timeout)
            .field("maintain_interval", &self.maintain_interval)
            .field("warmup_interval", &self.warmup_interval)
            .field("warmup_ticks", &self.warmup_ticks)
            .field("timeout_check_interval", &self.timeout_check_interval)
            .field("terminate_grace", &self.terminate_grace)
            .field("shutdown_grace", &self.shutdown_grace)
            .field("arena_size", &self.arena_size)
            .finish()
    }
}

impl PoolConfig {
    pub fn new(processes: usize) -> Self {
        Self {
            processes,
            ..Self::default()
        }
    }

    pub fn with_processes(mut self, processes: usize) -> Self {
        self.processes = processes;
        self
    }

    pub fn with_initializer<F>(mut self, f: F, initargs: Vec<Value>) -> Self
    where
        F: Fn(&[Value]) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.initializer = Some(Arc::new(f));
        self.initargs = initargs;
        self
    }

    pub fn with_max_tasks_per_child(mut self, n: usize) -> Self {
        self.max_tasks_per_child = Some(n);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_soft_timeout(mut self, timeout: Duration) -> Self {
        self.soft_timeout = Some(timeout);
        self
    }

    pub fn with_max_restarts(mut self, max_restarts: usize, window: Duration) -> Self {
        self.max_restarts = Some(max_restarts);
        self.max_restart_window = window;
        self
    }

    pub fn with_blocking_submit(mut self, blocking: bool) -> Self {
        self.blocking_submit = blocking;
        self
    }

    pub fn with_lost_worker_timeout(mut self, timeout: Duration) -> Self {
        self.lost_worker_timeout = timeout;
        self
    }

    /// Set the supervisor tick and the number of faster warm-up ticks.
    pub fn with_maintain_interval(mut self, interval: Duration, warmup_ticks: usize) -> Self {
        self.maintain_interval = interval;
        self.warmup_ticks = warmup_ticks;
        self
    }

    pub fn with_timeout_check_interval(mut self, interval: Duration) -> Self {
        self.timeout_check_interval = interval;
        self
    }

    pub fn with_terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = grace;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_arena_size(mut self, size: usize) -> Self {
        self.arena_size = size;
        self
    }

    /// Apply `FORKPOOL_*` environment overrides. Unparseable values are
    /// ignored with a warning.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(n) = env_parse::<usize>("FORKPOOL_PROCESSES") {
            self.processes = n;
        }
        if let Some(n) = env_parse::<usize>("FORKPOOL_MAX_TASKS_PER_CHILD") {
            self.max_tasks_per_child = Some(n);
        }
        if let Some(secs) = env_parse::<f64>("FORKPOOL_TIMEOUT") {
            self.timeout = seconds(secs);
        }
        if let Some(secs) = env_parse::<f64>("FORKPOOL_SOFT_TIMEOUT") {
            self.soft_timeout = seconds(secs);
        }
        if let Some(n) = env_parse::<usize>("FORKPOOL_MAX_RESTARTS") {
            self.max_restarts = Some(n);
        }
        if let Some(window) = env_parse::<f64>("FORKPOOL_MAX_RESTART_WINDOW").and_then(seconds) {
            self.max_restart_window = window;
        }
        if let Some(blocking) = env_parse::<bool>("FORKPOOL_BLOCKING_SUBMIT") {
            self.blocking_submit = blocking;
        }
        self
    }

    /// Reject configurations the pool cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.processes == 0 {
            return Err(PoolError::Config("processes must be at least 1".into()));
        }
        if self.max_tasks_per_child == Some(0) {
            return Err(PoolError::Config(
                "max_tasks_per_child must be at least 1".into(),
            ));
        }
        for (name, value) in [
            ("maintain_interval", self.maintain_interval),
            ("warmup_interval", self.warmup_interval),
            ("timeout_check_interval", self.timeout_check_interval),
            ("max_restart_window", self.max_restart_window),
        ] {
            if value.is_zero() {
                return Err(PoolError::Config(format!("{} must be non-zero", name)));
            }
        }
        if let (Some(soft), Some(hard)) = (self.soft_timeout, self.timeout)
            && soft >= hard
        {
            return Err(PoolError::Config(format!(
                "soft_timeout ({:?}) must be shorter than timeout ({:?})",
                soft, hard
            )));
        }
        if u32::try_from(self.processes).is_err() {
            return Err(PoolError::Config("processes is too large".into()));
        }
        Ok(())
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(variable = name, value = %raw, "Ignoring unparseable environment override");
            None
        }
    }
}

/// Non-positive values mean "no limit".
fn seconds(secs: f64) -> Option<Duration> {
    (secs.is_finite() && secs > 0.0).then(|| Duration::from_secs_f64(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PoolConfig::default();
        assert!(config.processes >= 1);
        assert!(config.blocking_submit);
        assert_eq!(config.max_restarts, None);
        assert_eq!(config.max_restart_window, Duration::from_secs(1));
        assert_eq!(config.lost_worker_timeout, Duration::from_secs(10));
        assert_eq!(config.warmup_ticks, 10);
        assert_eq!(config.arena_size, DEFAULT_ARENA_SIZE);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builders() {
        let config = PoolConfig::new(3)
            .with_max_tasks_per_child(5)
            .with_timeout(Duration::from_secs(2))
            .with_soft_timeout(Duration::from_secs(1))
            .with_max_restarts(1, Duration::from_secs(60))
            .with_blocking_submit(false)
            .with_initializer(|_| Ok(()), vec![serde_json::json!("x")]);
        assert_eq!(config.processes, 3);
        assert_eq!(config.max_tasks_per_child, Some(5));
        assert_eq!(config.max_restarts, Some(1));
        assert_eq!(config.max_restart_window, Duration::from_secs(60));
        assert!(!config.blocking_submit);
        assert!(config.initializer.is_some());
        assert_eq!(config.initargs.len(), 1);
        assert!(config.validate().is_ok());
        assert!(format!("{:?}", config).contains("processes: 3"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(PoolConfig::new(0).validate().is_err());
        assert!(PoolConfig::new(1).with_max_tasks_per_child(0).validate().is_err());
        assert!(
            PoolConfig::new(1)
                .with_maintain_interval(Duration::ZERO, 0)
                .validate()
                .is_err()
        );
        let err = PoolConfig::new(1)
            .with_timeout(Duration::from_secs(1))
            .with_soft_timeout(Duration::from_secs(1))
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("soft_timeout"));
    }

    #[test]
    fn test_seconds_helper() {
        assert_eq!(seconds(1.5), Some(Duration::from_millis(1500)));
        assert_eq!(seconds(0.0), None);
        assert_eq!(seconds(-3.0), None);
        assert_eq!(seconds(f64::NAN), None);
    }
}
