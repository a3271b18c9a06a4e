//! Error types for forkpool.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Main error type returned by pool operations.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Pool is not running")]
    NotRunning,

    #[error("Pool must be closed or terminated before join()")]
    StillRunning,

    #[error("Pool is saturated: all {0} submission slots are in use")]
    Saturated(usize),

    #[error("Restart frequency exceeded: {restarts} worker restarts within {window:?}")]
    RestartFreqExceeded { restarts: usize, window: Duration },

    #[error("Cannot shrink pool by {requested}: only {idle} idle workers")]
    ShrinkUnavailable { requested: usize, idle: usize },

    #[error("Timed out after {0:?} waiting for a result")]
    Timeout(Duration),

    #[error("Task failed: {0}")]
    Task(#[from] TaskError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Heap error: {0}")]
    Heap(#[from] HeapError),

    #[error("Synchronization error: {0}")]
    Sync(#[from] SyncError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("System call failed: {0}")]
    Sys(#[from] nix::errno::Errno),
}

/// Result type alias for forkpool operations.
pub type Result<T> = std::result::Result<T, PoolError>;

/// Errors raised by the shared-memory arena allocator.
#[derive(Error, Debug)]
pub enum HeapError {
    #[error("Invalid allocation size: {0} bytes")]
    InvalidSize(usize),

    #[error("Out of memory mapping a {size} byte arena: {source}")]
    OutOfMemory {
        size: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("Block {arena}:{start}..{stop} is not allocated")]
    UnknownBlock {
        arena: usize,
        start: usize,
        stop: usize,
    },
}

/// Errors raised by the process-shared synchronization primitives.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Lock is not owned by the calling thread")]
    NotOwner,

    #[error("Lock is already held by the calling thread")]
    AlreadyHeld,

    #[error("Semaphore released too many times")]
    ReleasedTooManyTimes,

    #[error("Semaphore operation failed: {0}")]
    Os(#[from] std::io::Error),

    #[error(transparent)]
    Heap(#[from] HeapError),
}

/// Failure metadata captured from a task that returned an error or panicked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionInfo {
    /// Short classification, e.g. `error` or `panic`.
    pub kind: String,
    /// Top-level message.
    pub message: String,
    /// Messages of the underlying causes, outermost first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub causes: Vec<String>,
    /// Captured backtrace, when one was available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backtrace: Option<String>,
}

impl ExceptionInfo {
    /// Flatten an `anyhow::Error` chain.
    pub fn from_error(err: &anyhow::Error) -> Self {
        let backtrace = match err.backtrace().status() {
            std::backtrace::BacktraceStatus::Captured => Some(err.backtrace().to_string()),
            _ => None,
        };
        Self {
            kind: "error".to_string(),
            message: err.to_string(),
            causes: err.chain().skip(1).map(|c| c.to_string()).collect(),
            backtrace,
        }
    }

    /// Describe a caught panic payload.
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "task panicked".to_string()
        };
        Self {
            kind: "panic".to_string(),
            message,
            causes: Vec::new(),
            backtrace: None,
        }
    }
}

impl std::fmt::Display for ExceptionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        for cause in &self.causes {
            write!(f, ": {}", cause)?;
        }
        Ok(())
    }
}

/// Why a task did not produce a value.
///
/// Travels over the wire inside `READY` frames, and is also produced in the
/// parent for timeouts, lost workers and termination.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum TaskError {
    #[error("{0}")]
    Raised(ExceptionInfo),

    #[error("task panicked: {0}")]
    Panicked(ExceptionInfo),

    #[error("unrepresentable result of type {type_name}: {message}")]
    Unrepresentable { type_name: String, message: String },

    #[error("no task registered under '{name}'")]
    UnknownTask { name: String },

    #[error("time limit exceeded ({limit:?})")]
    TimeLimitExceeded { limit: Duration },

    #[error("worker {pid} lost: {reason}")]
    WorkerLost { pid: i32, reason: String },

    #[error("pool terminated before the task completed")]
    Terminated,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_restart_freq_error_message() {
        let err = PoolError::RestartFreqExceeded {
            restarts: 2,
            window: Duration::from_secs(60),
        };
        let msg = err.to_string();
        assert!(msg.contains("Restart frequency exceeded"));
        assert!(msg.contains("2 worker restarts"));
        assert!(msg.contains("60s"));
    }

    #[test]
    fn test_shrink_unavailable_message() {
        let err = PoolError::ShrinkUnavailable {
            requested: 3,
            idle: 1,
        };
        let msg = err.to_string();
        assert!(msg.contains("shrink pool by 3"));
        assert!(msg.contains("1 idle"));
    }

    #[test]
    fn test_task_error_wraps_into_pool_error() {
        let err: PoolError = TaskError::UnknownTask {
            name: "nope".to_string(),
        }
        .into();
        let msg = err.to_string();
        assert!(msg.contains("Task failed"));
        assert!(msg.contains("nope"));
    }

    #[test]
    fn test_heap_error_messages() {
        assert!(HeapError::InvalidSize(7).to_string().contains("7 bytes"));
        let err = HeapError::UnknownBlock {
            arena: 1,
            start: 8,
            stop: 16,
        };
        assert!(err.to_string().contains("1:8..16"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed");
        let err: PoolError = io_err.into();
        assert!(err.to_string().contains("pipe closed"));
    }

    #[test]
    fn test_exception_info_from_error_chain() {
        let err = anyhow::anyhow!("disk unavailable").context("loading shard 4");
        let info = ExceptionInfo::from_error(&err);
        assert_eq!(info.kind, "error");
        assert_eq!(info.message, "loading shard 4");
        assert_eq!(info.causes, vec!["disk unavailable".to_string()]);
        assert_eq!(info.to_string(), "loading shard 4: disk unavailable");
    }

    #[test]
    fn test_exception_info_from_panic_payload() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        let info = ExceptionInfo::from_panic(payload.as_ref());
        assert_eq!(info.kind, "panic");
        assert_eq!(info.message, "boom");

        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(ExceptionInfo::from_panic(payload.as_ref()).message, "bang");
    }

    #[test]
    fn test_task_error_serde_tagging() {
        let err = TaskError::WorkerLost {
            pid: 42,
            reason: "killed by signal SIGKILL".to_string(),
        };
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains(r#""error":"worker_lost""#));
        let back: TaskError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
    }
}
