//! Per-call submission options.

use crate::error::TaskError;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Which deadline a timeout callback is reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// Advisory: the task was signalled and keeps running.
    Soft,
    /// Enforced: the task failed and its worker is being reclaimed.
    Hard,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Soft => write!(f, "soft"),
            Self::Hard => write!(f, "hard"),
        }
    }
}

pub type SuccessCallback = Arc<dyn Fn(&Value) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&TaskError) + Send + Sync>;
pub type AcceptCallback = Arc<dyn Fn(i32, DateTime<Utc>) + Send + Sync>;
pub type TimeoutCallback = Arc<dyn Fn(TimeoutKind, Duration) + Send + Sync>;

/// Callbacks attached to one job. They run on the pool's handler threads
/// and must not block for long.
#[derive(Clone, Default)]
pub(crate) struct Callbacks {
    pub on_success: Option<SuccessCallback>,
    pub on_error: Option<ErrorCallback>,
    pub on_accept: Option<AcceptCallback>,
    pub on_timeout: Option<TimeoutCallback>,
}

/// Options for [`Pool::apply_async`](crate::Pool::apply_async) and friends.
///
/// ```
/// use forkpool::ApplyOptions;
/// use std::time::Duration;
///
/// let opts = ApplyOptions::new()
///     .with_timeout(Duration::from_secs(30))
///     .on_error(|err| eprintln!("task failed: {}", err));
/// ```
#[derive(Clone, Default)]
pub struct ApplyOptions {
    pub kwargs: Map<String, Value>,
    pub soft_timeout: Option<Duration>,
    pub timeout: Option<Duration>,
    pub(crate) callbacks: Callbacks,
}

impl ApplyOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_kwarg(mut self, name: impl Into<String>, value: Value) -> Self {
        self.kwargs.insert(name.into(), value);
        self
    }

    pub fn with_kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs = kwargs;
        self
    }

    /// Hard time limit for this call, overriding the pool default.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Soft time limit for this call, overriding the pool default.
    pub fn with_soft_timeout(mut self, timeout: Duration) -> Self {
        self.soft_timeout = Some(timeout);
        self
    }

    pub fn on_success(mut self, f: impl Fn(&Value) + Send + Sync + 'static) -> Self {
        self.callbacks.on_success = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&TaskError) + Send + Sync + 'static) -> Self {
        self.callbacks.on_error = Some(Arc::new(f));
        self
    }

    /// Called once a worker has picked the task up.
    pub fn on_accept(mut self, f: impl Fn(i32, DateTime<Utc>) + Send + Sync + 'static) -> Self {
        self.callbacks.on_accept = Some(Arc::new(f));
        self
    }

    pub fn on_timeout(mut self, f: impl Fn(TimeoutKind, Duration) + Send + Sync + 'static) -> Self {
        self.callbacks.on_timeout = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for ApplyOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplyOptions")
            .field("kwargs", &self.kwargs)
            .field("soft_timeout", &self.soft_timeout)
            .field("timeout", &self.timeout)
            .field("on_success", &self.callbacks.on_success.is_some())
            .field("on_error", &self.callbacks.on_error.is_some())
            .field("on_accept", &self.callbacks.on_accept.is_some())
            .field("on_timeout", &self.callbacks.on_timeout.is_some())
            .finish()
    }
}
