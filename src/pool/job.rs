//! Jobs in flight and the result handles callers wait on.
//!
//! A [`Job`] is one submission: a single apply, a chunked map or a streaming
//! imap. Every task of a job is an entry keyed by its index. An entry is
//! resolved at most once, whichever of the result handler, the timeout
//! handler, the supervisor or a terminating pool gets there first; later
//! attempts are ignored. A job leaves the cache exactly once, when every
//! task is resolved and every resolved task has either been acknowledged by
//! a worker or abandoned.

use super::options::{Callbacks, TimeoutKind};
use crate::error::{PoolError, Result, TaskError};
use crate::protocol::{JobId, Outcome};
use crate::sync::Semaphore;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::warn;

/// A worker's acknowledgement of one task.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Acceptance {
    pub pid: i32,
    pub at: DateTime<Utc>,
    /// Parent-side clock reading, used for deadline arithmetic.
    pub instant: Instant,
}

#[derive(Debug, Default)]
struct Entry {
    accepted: Option<Acceptance>,
    resolved: bool,
    /// Accepted, or known never to be.
    settled: bool,
}

/// How a resolution arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Via {
    /// A worker (or the timeout handler on its behalf) produced the outcome.
    Ready,
    /// The pool gave up on the task; no acknowledgement will follow.
    Abandoned,
}

/// Result of a [`Job::accept`] call.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Accepted {
    pub first: bool,
    pub remove: bool,
}

enum Results {
    Apply(Option<Outcome>),
    Map {
        chunks: Vec<Option<Vec<Value>>>,
        error: Option<TaskError>,
    },
    IMap {
        ordered: bool,
        pending: BTreeMap<usize, Outcome>,
        next_chunk: usize,
        items: VecDeque<Outcome>,
        chunks_delivered: usize,
    },
}

struct JobInner {
    entries: HashMap<usize, Entry>,
    /// Number of tasks; unknown while a lazy imap source is still producing.
    expected: Option<usize>,
    resolved: usize,
    ready: bool,
    removed: bool,
    results: Results,
}

impl JobInner {
    fn new(expected: Option<usize>, results: Results) -> Self {
        let entries = (0..expected.unwrap_or(0))
            .map(|i| (i, Entry::default()))
            .collect();
        Self {
            entries,
            expected,
            resolved: 0,
            ready: expected == Some(0),
            removed: false,
            results,
        }
    }

    fn complete(&self) -> bool {
        self.expected == Some(self.resolved)
    }

    fn store(&mut self, index: usize, outcome: Outcome) {
        match &mut self.results {
            Results::Apply(slot) => {
                *slot = Some(outcome);
                self.ready = true;
            }
            Results::Map { chunks, error } => {
                match outcome {
                    Ok(value) => {
                        if let Some(chunk) = chunks.get_mut(index) {
                            *chunk = Some(flatten(value));
                        }
                    }
                    Err(e) => {
                        error.get_or_insert(e);
                    }
                }
                self.ready = error.is_some() || self.expected == Some(self.resolved);
            }
            Results::IMap {
                ordered,
                pending,
                next_chunk,
                items,
                chunks_delivered,
            } => {
                if *ordered {
                    pending.insert(index, outcome);
                    while let Some(next) = pending.remove(&*next_chunk) {
                        expand_into(items, next);
                        *next_chunk += 1;
                        *chunks_delivered += 1;
                    }
                } else {
                    expand_into(items, outcome);
                    *chunks_delivered += 1;
                }
                self.ready = self.expected == Some(self.resolved);
            }
        }
    }

    /// Outcome reported to callbacks when the job turns ready.
    fn final_outcome(&self) -> Option<Outcome> {
        match &self.results {
            Results::Apply(slot) => slot.clone(),
            Results::Map { chunks, error } => Some(match error {
                Some(e) => Err(e.clone()),
                None => Ok(Value::Array(
                    chunks.iter().flatten().flatten().cloned().collect(),
                )),
            }),
            Results::IMap { .. } => None,
        }
    }

    fn try_remove(&mut self) -> bool {
        if self.removed || !self.complete() || !self.entries.values().all(|e| e.settled) {
            return false;
        }
        self.removed = true;
        true
    }
}

fn flatten(value: Value) -> Vec<Value> {
    match value {
        Value::Array(values) => values,
        other => vec![other],
    }
}

fn expand_into(items: &mut VecDeque<Outcome>, outcome: Outcome) {
    match outcome {
        Ok(value) => items.extend(flatten(value).into_iter().map(Ok)),
        Err(e) => items.push_back(Err(e)),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn run_callback(job_id: JobId, which: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        warn!(job_id, callback = which, "Job callback panicked");
    }
}

/// One submission and its per-task bookkeeping.
pub(crate) struct Job {
    id: JobId,
    name: String,
    soft_timeout: Option<Duration>,
    timeout: Option<Duration>,
    callbacks: Callbacks,
    /// Submission slot returned when the job turns ready.
    slot: Option<Arc<Semaphore>>,
    slot_released: AtomicBool,
    inner: Mutex<JobInner>,
    changed: Condvar,
}

impl Job {
    fn build(
        id: JobId,
        name: &str,
        callbacks: Callbacks,
        timeouts: (Option<Duration>, Option<Duration>),
        slot: Option<Arc<Semaphore>>,
        inner: JobInner,
    ) -> Self {
        Self {
            id,
            name: name.to_string(),
            soft_timeout: timeouts.0,
            timeout: timeouts.1,
            callbacks,
            slot,
            slot_released: AtomicBool::new(false),
            inner: Mutex::new(inner),
            changed: Condvar::new(),
        }
    }

    /// A single call. `timeouts` is `(soft, hard)`.
    pub(crate) fn apply(
        id: JobId,
        name: &str,
        callbacks: Callbacks,
        timeouts: (Option<Duration>, Option<Duration>),
        slot: Option<Arc<Semaphore>>,
    ) -> Self {
        let inner = JobInner::new(Some(1), Results::Apply(None));
        Self::build(id, name, callbacks, timeouts, slot, inner)
    }

    /// A map over `chunks` chunks.
    pub(crate) fn map(
        id: JobId,
        name: &str,
        chunks: usize,
        callbacks: Callbacks,
        timeouts: (Option<Duration>, Option<Duration>),
    ) -> Self {
        let inner = JobInner::new(
            Some(chunks),
            Results::Map {
                chunks: vec![None; chunks],
                error: None,
            },
        );
        Self::build(id, name, callbacks, timeouts, None, inner)
    }

    /// A streaming map whose length is learned as its source is consumed.
    pub(crate) fn imap(
        id: JobId,
        name: &str,
        ordered: bool,
        timeouts: (Option<Duration>, Option<Duration>),
    ) -> Self {
        let inner = JobInner::new(
            None,
            Results::IMap {
                ordered,
                pending: BTreeMap::new(),
                next_chunk: 0,
                items: VecDeque::new(),
                chunks_delivered: 0,
            },
        );
        Self::build(id, name, Callbacks::default(), timeouts, None, inner)
    }

    pub(crate) fn id(&self) -> JobId {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn soft_timeout(&self) -> Option<Duration> {
        self.soft_timeout
    }

    pub(crate) fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Register task `index` of a lazily produced job.
    pub(crate) fn add_task(&self, index: usize) {
        lock(&self.inner).entries.entry(index).or_default();
    }

    /// Fix the number of tasks once the source is exhausted.
    ///
    /// Returns `true` if the job should now leave the cache.
    pub(crate) fn set_length(&self, len: usize) -> bool {
        let remove = {
            let mut inner = lock(&self.inner);
            inner.expected = Some(len);
            if inner.complete() {
                inner.ready = true;
            }
            inner.try_remove()
        };
        self.changed.notify_all();
        remove
    }

    /// Record that worker `pid` picked up task `index`.
    pub(crate) fn accept(&self, index: usize, pid: i32, at: DateTime<Utc>) -> Accepted {
        let result = {
            let mut inner = lock(&self.inner);
            if inner.removed {
                return Accepted::default();
            }
            let entry = inner.entries.entry(index).or_default();
            let first = entry.accepted.is_none();
            if first {
                entry.accepted = Some(Acceptance {
                    pid,
                    at,
                    instant: Instant::now(),
                });
            }
            entry.settled = true;
            Accepted {
                first,
                remove: inner.try_remove(),
            }
        };
        self.changed.notify_all();
        if result.first
            && let Some(cb) = &self.callbacks.on_accept
        {
            run_callback(self.id, "accept", || cb(pid, at));
        }
        result
    }

    /// Resolve task `index`.
    ///
    /// Returns `None` if it was already resolved, otherwise whether the job
    /// should now leave the cache.
    pub(crate) fn resolve(&self, index: usize, outcome: Outcome, via: Via) -> Option<bool> {
        let (remove, fire) = {
            let mut inner = lock(&self.inner);
            if inner.removed {
                return None;
            }
            let entry = inner.entries.entry(index).or_default();
            if entry.resolved {
                return None;
            }
            entry.resolved = true;
            if via == Via::Abandoned || entry.accepted.is_some() {
                entry.settled = true;
            }
            inner.resolved += 1;
            let was_ready = inner.ready;
            inner.store(index, outcome);
            let fire = (!was_ready && inner.ready)
                .then(|| inner.final_outcome())
                .flatten();
            (inner.try_remove(), fire)
        };
        self.changed.notify_all();
        if let Some(outcome) = fire {
            self.on_ready(outcome);
        }
        Some(remove)
    }

    /// Resolve every outstanding task with `err`. The job is finished
    /// afterwards; returns `false` if it had already left the cache.
    pub(crate) fn abort(&self, err: TaskError) -> bool {
        let fire = {
            let mut inner = lock(&self.inner);
            if inner.removed {
                return false;
            }
            if inner.expected.is_none() {
                inner.expected = Some(inner.entries.len());
            }
            let mut open: Vec<usize> = inner
                .entries
                .iter()
                .filter(|(_, e)| !e.resolved)
                .map(|(&i, _)| i)
                .collect();
            open.sort_unstable();
            let was_ready = inner.ready;
            for index in open {
                if let Some(entry) = inner.entries.get_mut(&index) {
                    entry.resolved = true;
                    entry.settled = true;
                }
                inner.resolved += 1;
                inner.store(index, Err(err.clone()));
            }
            inner.ready = true;
            inner.removed = true;
            (!was_ready).then(|| inner.final_outcome()).flatten()
        };
        self.changed.notify_all();
        if let Some(outcome) = fire {
            self.on_ready(outcome);
        } else {
            self.release_slot();
        }
        true
    }

    fn on_ready(&self, outcome: Outcome) {
        self.release_slot();
        match (&outcome, &self.callbacks.on_success, &self.callbacks.on_error) {
            (Ok(value), Some(cb), _) => run_callback(self.id, "success", || cb(value)),
            (Err(err), _, Some(cb)) => run_callback(self.id, "error", || cb(err)),
            _ => {}
        }
    }

    fn release_slot(&self) {
        if let Some(slot) = &self.slot
            && !self.slot_released.swap(true, Ordering::SeqCst)
            && let Err(e) = slot.release()
        {
            warn!(job_id = self.id, error = %e, "Could not release submission slot");
        }
    }

    pub(crate) fn fire_timeout(&self, kind: TimeoutKind, limit: Duration) {
        if let Some(cb) = &self.callbacks.on_timeout {
            run_callback(self.id, "timeout", || cb(kind, limit));
        }
    }

    /// Tasks accepted by a worker and not yet resolved.
    pub(crate) fn in_flight(&self) -> Vec<(usize, Acceptance)> {
        lock(&self.inner)
            .entries
            .iter()
            .filter(|(_, e)| !e.resolved)
            .filter_map(|(&i, e)| e.accepted.map(|a| (i, a)))
            .collect()
    }

    pub(crate) fn is_ready(&self) -> bool {
        lock(&self.inner).ready
    }

    pub(crate) fn is_removed(&self) -> bool {
        lock(&self.inner).removed
    }

    fn acceptance(&self, index: usize) -> Option<Acceptance> {
        lock(&self.inner).entries.get(&index).and_then(|e| e.accepted)
    }

    /// Block until the job is ready; `false` on timeout.
    pub(crate) fn wait_ready(&self, timeout: Option<Duration>) -> bool {
        let inner = lock(&self.inner);
        match timeout {
            None => {
                let inner = self
                    .changed
                    .wait_while(inner, |i| !i.ready)
                    .unwrap_or_else(PoisonError::into_inner);
                inner.ready
            }
            Some(d) => {
                let (inner, _) = self
                    .changed
                    .wait_timeout_while(inner, d, |i| !i.ready)
                    .unwrap_or_else(PoisonError::into_inner);
                inner.ready
            }
        }
    }

    fn apply_outcome(&self) -> Option<Outcome> {
        match &lock(&self.inner).results {
            Results::Apply(slot) => slot.clone(),
            _ => None,
        }
    }

    fn map_outcome(&self) -> Option<std::result::Result<Vec<Value>, TaskError>> {
        let inner = lock(&self.inner);
        if !inner.ready {
            return None;
        }
        match &inner.results {
            Results::Map { chunks, error } => Some(match error {
                Some(e) => Err(e.clone()),
                None => Ok(chunks.iter().flatten().flatten().cloned().collect()),
            }),
            _ => None,
        }
    }

    fn successful(&self) -> Option<bool> {
        let inner = lock(&self.inner);
        if !inner.ready {
            return None;
        }
        match &inner.results {
            Results::Apply(slot) => slot.as_ref().map(|r| r.is_ok()),
            Results::Map { error, .. } => Some(error.is_none()),
            Results::IMap { .. } => None,
        }
    }

    /// Next streamed item, waiting up to `timeout`.
    fn next_item(&self, timeout: Option<Duration>) -> NextItem {
        let deadline = timeout.map(|d| Instant::now() + d);
        let mut inner = lock(&self.inner);
        loop {
            {
                let state = &mut *inner;
                let Results::IMap {
                    items,
                    chunks_delivered,
                    ..
                } = &mut state.results
                else {
                    return NextItem::Done;
                };
                if let Some(item) = items.pop_front() {
                    return NextItem::Item(item);
                }
                if state.expected.is_some_and(|n| *chunks_delivered >= n) {
                    return NextItem::Done;
                }
            }
            inner = match deadline {
                None => self
                    .changed
                    .wait(inner)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return NextItem::TimedOut;
                    }
                    self.changed
                        .wait_timeout(inner, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }
}

enum NextItem {
    Item(Outcome),
    Done,
    TimedOut,
}

/// Jobs the pool is still tracking, by id.
#[derive(Default)]
pub(crate) struct JobCache {
    jobs: Mutex<HashMap<JobId, Arc<Job>>>,
}

impl JobCache {
    pub(crate) fn insert(&self, job: Arc<Job>) {
        lock(&self.jobs).insert(job.id(), job);
    }

    pub(crate) fn get(&self, id: JobId) -> Option<Arc<Job>> {
        lock(&self.jobs).get(&id).cloned()
    }

    pub(crate) fn remove(&self, id: JobId) -> Option<Arc<Job>> {
        lock(&self.jobs).remove(&id)
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.jobs).len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        lock(&self.jobs).is_empty()
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<Job>> {
        lock(&self.jobs).values().cloned().collect()
    }

    pub(crate) fn drain(&self) -> Vec<Arc<Job>> {
        lock(&self.jobs).drain().map(|(_, job)| job).collect()
    }
}

/// Handle to the result of a single [`Pool::apply_async`](crate::Pool::apply_async) call.
#[derive(Clone)]
pub struct AsyncResult {
    job: Arc<Job>,
}

impl AsyncResult {
    pub(crate) fn new(job: Arc<Job>) -> Self {
        Self { job }
    }

    pub fn job_id(&self) -> JobId {
        self.job.id()
    }

    /// Wait for the result. `None` waits forever.
    pub fn get(&self, timeout: Option<Duration>) -> Result<Value> {
        if !self.job.wait_ready(timeout) {
            return Err(PoolError::Timeout(timeout.unwrap_or_default()));
        }
        match self.job.apply_outcome() {
            Some(Ok(value)) => Ok(value),
            Some(Err(e)) => Err(PoolError::Task(e)),
            None => Err(PoolError::Task(TaskError::Terminated)),
        }
    }

    /// Wait for the result and decode it.
    pub fn get_as<T: DeserializeOwned>(&self, timeout: Option<Duration>) -> Result<T> {
        Ok(serde_json::from_value(self.get(timeout)?)?)
    }

    /// Wait until ready; `false` if `timeout` passed first.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        self.job.wait_ready(timeout)
    }

    pub fn ready(&self) -> bool {
        self.job.is_ready()
    }

    /// `None` until ready.
    pub fn successful(&self) -> Option<bool> {
        self.job.successful()
    }

    /// Whether a worker has acknowledged the task.
    pub fn accepted(&self) -> bool {
        self.job.acceptance(0).is_some()
    }

    pub fn accepted_at(&self) -> Option<DateTime<Utc>> {
        self.job.acceptance(0).map(|a| a.at)
    }

    /// Pid of the worker that accepted the task.
    pub fn worker_pid(&self) -> Option<i32> {
        self.job.acceptance(0).map(|a| a.pid)
    }
}

impl std::fmt::Debug for AsyncResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncResult")
            .field("job_id", &self.job.id())
            .field("task", &self.job.name())
            .field("ready", &self.ready())
            .finish()
    }
}

/// Handle to the result of a [`Pool::map_async`](crate::Pool::map_async) call.
#[derive(Clone)]
pub struct MapResult {
    job: Arc<Job>,
}

impl MapResult {
    pub(crate) fn new(job: Arc<Job>) -> Self {
        Self { job }
    }

    pub fn job_id(&self) -> JobId {
        self.job.id()
    }

    /// Wait for every chunk, or the first failure. Results keep input order.
    pub fn get(&self, timeout: Option<Duration>) -> Result<Vec<Value>> {
        if !self.job.wait_ready(timeout) {
            return Err(PoolError::Timeout(timeout.unwrap_or_default()));
        }
        match self.job.map_outcome() {
            Some(Ok(values)) => Ok(values),
            Some(Err(e)) => Err(PoolError::Task(e)),
            None => Err(PoolError::Task(TaskError::Terminated)),
        }
    }

    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        self.job.wait_ready(timeout)
    }

    pub fn ready(&self) -> bool {
        self.job.is_ready()
    }

    pub fn successful(&self) -> Option<bool> {
        self.job.successful()
    }
}

impl std::fmt::Debug for MapResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapResult")
            .field("job_id", &self.job.id())
            .field("task", &self.job.name())
            .field("ready", &self.ready())
            .finish()
    }
}

/// Streaming results of [`Pool::imap`](crate::Pool::imap) and
/// [`Pool::imap_unordered`](crate::Pool::imap_unordered).
///
/// A failed chunk yields one `Err` in place of its items.
pub struct IMapIterator {
    job: Arc<Job>,
}

impl IMapIterator {
    pub(crate) fn new(job: Arc<Job>) -> Self {
        Self { job }
    }

    pub fn job_id(&self) -> JobId {
        self.job.id()
    }

    /// Like [`Iterator::next`], but gives up after `timeout`.
    pub fn next_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<std::result::Result<Value, TaskError>>> {
        match self.job.next_item(Some(timeout)) {
            NextItem::Item(item) => Ok(Some(item)),
            NextItem::Done => Ok(None),
            NextItem::TimedOut => Err(PoolError::Timeout(timeout)),
        }
    }
}

impl Iterator for IMapIterator {
    type Item = std::result::Result<Value, TaskError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.job.next_item(None) {
            NextItem::Item(item) => Some(item),
            NextItem::Done | NextItem::TimedOut => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    const NO_TIMEOUTS: (Option<Duration>, Option<Duration>) = (None, None);

    fn lost() -> TaskError {
        TaskError::WorkerLost {
            pid: 9,
            reason: "killed by signal SIGKILL".into(),
        }
    }

    #[test]
    fn test_apply_ack_then_ready_removes_once() {
        let job = Job::apply(1, "square", Callbacks::default(), NO_TIMEOUTS, None);
        let acc = job.accept(0, 100, Utc::now());
        assert!(acc.first);
        assert!(!acc.remove);
        assert_eq!(job.resolve(0, Ok(json!(4)), Via::Ready), Some(true));
        // Second resolution is ignored.
        assert_eq!(job.resolve(0, Err(lost()), Via::Abandoned), None);
        let result = AsyncResult::new(Arc::new(job));
        assert_eq!(result.get(Some(Duration::ZERO)).unwrap(), json!(4));
        assert_eq!(result.worker_pid(), Some(100));
        assert_eq!(result.successful(), Some(true));
    }

    #[test]
    fn test_late_ack_performs_removal() {
        let job = Job::apply(1, "square", Callbacks::default(), NO_TIMEOUTS, None);
        assert_eq!(job.resolve(0, Ok(json!(1)), Via::Ready), Some(false));
        assert!(job.is_ready());
        let acc = job.accept(0, 100, Utc::now());
        assert!(acc.remove);
        // Anything after removal is a no-op.
        assert!(!job.accept(0, 100, Utc::now()).remove);
        assert!(!job.abort(TaskError::Terminated));
    }

    #[test]
    fn test_abandoned_task_removes_without_ack() {
        let job = Job::apply(2, "sleep", Callbacks::default(), NO_TIMEOUTS, None);
        assert_eq!(job.resolve(0, Err(lost()), Via::Abandoned), Some(true));
        let result = AsyncResult::new(Arc::new(job));
        assert!(matches!(
            result.get(None),
            Err(PoolError::Task(TaskError::WorkerLost { pid: 9, .. }))
        ));
    }

    #[test]
    fn test_callbacks_fire_once() {
        let successes = Arc::new(AtomicUsize::new(0));
        let accepts = Arc::new(AtomicUsize::new(0));
        let callbacks = Callbacks {
            on_success: Some({
                let n = Arc::clone(&successes);
                Arc::new(move |_: &Value| {
                    n.fetch_add(1, Ordering::SeqCst);
                })
            }),
            on_accept: Some({
                let n = Arc::clone(&accepts);
                Arc::new(move |_: i32, _: DateTime<Utc>| {
                    n.fetch_add(1, Ordering::SeqCst);
                })
            }),
            ..Callbacks::default()
        };
        let job = Job::apply(3, "square", callbacks, NO_TIMEOUTS, None);
        job.accept(0, 1, Utc::now());
        job.accept(0, 1, Utc::now());
        job.resolve(0, Ok(json!(9)), Via::Ready);
        job.resolve(0, Ok(json!(9)), Via::Ready);
        assert_eq!(successes.load(Ordering::SeqCst), 1);
        assert_eq!(accepts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let callbacks = Callbacks {
            on_error: Some(Arc::new(|err: &TaskError| {
                if !err.to_string().is_empty() {
                    panic!("callback bug")
                }
            })),
            ..Callbacks::default()
        };
        let job = Job::apply(4, "fail", callbacks, NO_TIMEOUTS, None);
        assert_eq!(job.resolve(0, Err(lost()), Via::Abandoned), Some(true));
        assert!(job.is_ready());
    }

    #[test]
    fn test_slot_released_exactly_once() {
        let heap = Arc::new(Heap::new());
        let slots = Arc::new(Semaphore::lax_bounded(&heap, 1).unwrap());
        assert!(slots.try_acquire().unwrap());
        let job = Job::apply(
            5,
            "square",
            Callbacks::default(),
            NO_TIMEOUTS,
            Some(Arc::clone(&slots)),
        );
        job.resolve(0, Ok(json!(1)), Via::Ready);
        job.abort(TaskError::Terminated);
        assert_eq!(slots.value().unwrap(), 1);
    }

    #[test]
    fn test_map_preserves_order_across_completion_order() {
        let job = Arc::new(Job::map(6, "square", 3, Callbacks::default(), NO_TIMEOUTS));
        for i in 0..3 {
            job.accept(i, 1, Utc::now());
        }
        job.resolve(2, Ok(json!([25])), Via::Ready);
        job.resolve(0, Ok(json!([1, 4])), Via::Ready);
        assert!(!job.is_ready());
        assert_eq!(job.resolve(1, Ok(json!([9, 16])), Via::Ready), Some(true));
        let result = MapResult::new(job);
        assert_eq!(
            result.get(None).unwrap(),
            vec![json!(1), json!(4), json!(9), json!(16), json!(25)]
        );
    }

    #[test]
    fn test_map_first_error_is_ready_but_stays_cached() {
        let job = Job::map(7, "fail", 2, Callbacks::default(), NO_TIMEOUTS);
        job.accept(0, 1, Utc::now());
        job.accept(1, 1, Utc::now());
        assert_eq!(job.resolve(0, Err(lost()), Via::Ready), Some(false));
        assert!(job.is_ready());
        assert_eq!(job.successful(), Some(false));
        assert_eq!(job.resolve(1, Ok(json!([1])), Via::Ready), Some(true));
    }

    #[test]
    fn test_empty_map_is_ready_immediately() {
        let result = MapResult::new(Arc::new(Job::map(
            8,
            "square",
            0,
            Callbacks::default(),
            NO_TIMEOUTS,
        )));
        assert!(result.ready());
        assert!(result.get(None).unwrap().is_empty());
    }

    #[test]
    fn test_imap_ordered_resequences_chunks() {
        let job = Arc::new(Job::imap(9, "square", true, NO_TIMEOUTS));
        for i in 0..3 {
            job.add_task(i);
            job.accept(i, 1, Utc::now());
        }
        job.resolve(1, Ok(json!([4])), Via::Ready);
        job.resolve(2, Err(lost()), Via::Ready);
        let mut iter = IMapIterator::new(Arc::clone(&job));
        assert!(iter.next_timeout(Duration::from_millis(10)).is_err());

        job.resolve(0, Ok(json!([0, 1])), Via::Ready);
        assert!(job.set_length(3));
        let items: Vec<_> = iter.collect();
        assert_eq!(items.len(), 4);
        assert_eq!(items[0], Ok(json!(0)));
        assert_eq!(items[1], Ok(json!(1)));
        assert_eq!(items[2], Ok(json!(4)));
        assert!(matches!(items[3], Err(TaskError::WorkerLost { .. })));
    }

    #[test]
    fn test_imap_abort_ends_iteration() {
        let job = Arc::new(Job::imap(10, "sleep", false, NO_TIMEOUTS));
        job.add_task(0);
        job.add_task(1);
        job.resolve(0, Ok(json!(["a"])), Via::Ready);
        assert!(job.abort(TaskError::Terminated));
        let items: Vec<_> = IMapIterator::new(job).collect();
        assert_eq!(items, vec![Ok(json!("a")), Err(TaskError::Terminated)]);
    }

    #[test]
    fn test_in_flight_lists_accepted_unresolved() {
        let job = Job::map(11, "sleep", 2, Callbacks::default(), NO_TIMEOUTS);
        job.accept(1, 42, Utc::now());
        let flying = job.in_flight();
        assert_eq!(flying.len(), 1);
        assert_eq!(flying[0].0, 1);
        assert_eq!(flying[0].1.pid, 42);
    }

    #[test]
    fn test_cache_drain() {
        let cache = JobCache::default();
        cache.insert(Arc::new(Job::apply(
            1,
            "a",
            Callbacks::default(),
            NO_TIMEOUTS,
            None,
        )));
        cache.insert(Arc::new(Job::imap(2, "b", true, NO_TIMEOUTS)));
        assert_eq!(cache.len(), 2);
        assert!(cache.get(2).is_some());
        assert!(cache.remove(1).is_some());
        assert_eq!(cache.drain().len(), 1);
        assert!(cache.is_empty());
    }
}
