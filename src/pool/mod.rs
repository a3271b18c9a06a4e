//! The process pool.
//!
//! A [`Pool`] owns a set of forked workers and four handler threads:
//!
//! - **supervisor** reaps exited workers, enforces the restart budget and
//!   spawns replacements.
//! - **task handler** drains submitted batches and writes each task to an
//!   idle worker's inbound queue.
//! - **timeout handler** scans accepted tasks for soft and hard deadlines.
//! - **result handler** reads `ACK`, `READY` and `DEATH` frames from the
//!   shared result pipe and resolves jobs.
//!
//! State only moves forward: `Running → Closing → Terminated`.

mod job;
mod options;
mod restart;
mod result_handler;
mod supervisor;
mod task_handler;
mod timeout_handler;
mod workers;

pub use job::{AsyncResult, IMapIterator, MapResult};
pub use options::{
    AcceptCallback, ApplyOptions, ErrorCallback, SuccessCallback, TimeoutCallback, TimeoutKind,
};
pub use restart::RestartState;
use restart::RestartBudget;

use crate::config::PoolConfig;
use crate::error::{PoolError, Result, TaskError};
use crate::heap::Heap;
use crate::ipc::{ChunkReader, Connection, Queue};
use crate::protocol::{JobId, Payload, Task, TaskArgs, TaskKey};
use crate::registry::TaskRegistry;
use crate::sync::{Event, Mutex as SharedMutex, Semaphore};
use crate::worker::{CloseList, ResultSink, WorkerContext, spawn_handler_thread, spawn_worker};
use crossbeam_channel::{Receiver, Sender};
use job::{Job, JobCache, Via};
use serde_json::Value;
use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use workers::{WorkerSlot, WorkerTable};

/// How long blocking loops wait before rechecking pool state.
const RECHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Lifecycle of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PoolState {
    Running = 0,
    Closing = 1,
    Terminated = 2,
}

impl PoolState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Running,
            1 => Self::Closing,
            _ => Self::Terminated,
        }
    }
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Closing => write!(f, "closing"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// Point-in-time counters, see [`Pool::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    /// Target worker count.
    pub processes: usize,
    pub live_workers: usize,
    pub idle_workers: usize,
    pub jobs_in_flight: usize,
    pub tasks_completed: usize,
    /// Abnormal worker exits so far.
    pub restarts: usize,
}

/// Work handed from submitters to the task handler.
pub(crate) enum TaskBatch {
    Tasks(Vec<Task>),
    /// An imap source, consumed chunk by chunk on the task handler thread.
    Lazy {
        job: Arc<Job>,
        source: Box<dyn Iterator<Item = Vec<Value>> + Send>,
        chunksize: usize,
    },
    /// No more batches.
    Sentinel,
}

/// A task whose worker exited abnormally, failed once its deadline passes
/// unless a `READY` for it shows up first.
pub(crate) struct LostJob {
    pub key: TaskKey,
    pub pid: i32,
    pub reason: String,
    pub deadline: Instant,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared between the pool handle and its handler threads.
pub(crate) struct PoolShared {
    pub config: PoolConfig,
    registry: Arc<TaskRegistry>,
    heap: Arc<Heap>,
    state: AtomicU8,
    pub cache: JobCache,
    workers: Mutex<WorkerTable>,
    workers_changed: Condvar,
    /// Submission slots, one per worker.
    pub putlock: Arc<Semaphore>,
    pub results: Arc<ResultSink>,
    result_reader_fd: RawFd,
    shutdown: Arc<Event>,
    task_tx: Sender<TaskBatch>,
    fatal: Mutex<Option<(usize, Duration)>>,
    pub tasks_exhausted: AtomicBool,
    next_job_id: AtomicU64,
    pub restarts: AtomicUsize,
    pub tasks_completed: AtomicUsize,
    pub lost: Mutex<Vec<LostJob>>,
    pub restart_budget: Mutex<RestartBudget>,
    target: AtomicUsize,
    pause_lock: Mutex<()>,
    pause_cv: Condvar,
}

impl PoolShared {
    pub fn state(&self) -> PoolState {
        PoolState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn target(&self) -> usize {
        self.target.load(Ordering::SeqCst)
    }

    pub fn lock_workers(&self) -> MutexGuard<'_, WorkerTable> {
        lock(&self.workers)
    }

    /// Wait on the worker table for up to `timeout`.
    pub fn wait_workers<'a>(
        &self,
        table: MutexGuard<'a, WorkerTable>,
        timeout: Duration,
    ) -> MutexGuard<'a, WorkerTable> {
        self.workers_changed
            .wait_timeout(table, timeout)
            .unwrap_or_else(PoisonError::into_inner)
            .0
    }

    pub fn notify_workers(&self) {
        self.workers_changed.notify_all();
    }

    /// Sleep for `d`, returning early once the pool is terminated.
    pub fn pause(&self, d: Duration) {
        let guard = lock(&self.pause_lock);
        let _ = self
            .pause_cv
            .wait_timeout_while(guard, d, |_| self.state() != PoolState::Terminated);
    }

    fn wake_sleepers(&self) {
        let _guard = lock(&self.pause_lock);
        self.pause_cv.notify_all();
    }

    pub fn is_fatal(&self) -> bool {
        lock(&self.fatal).is_some()
    }

    fn fatal_error(&self) -> Option<PoolError> {
        (*lock(&self.fatal)).map(|(restarts, window)| PoolError::RestartFreqExceeded { restarts, window })
    }

    /// Whether the supervisor and timeout handler have nothing left to do.
    pub fn should_wind_down(&self) -> bool {
        match self.state() {
            PoolState::Terminated => true,
            PoolState::Running => false,
            PoolState::Closing => {
                self.tasks_exhausted.load(Ordering::SeqCst) && self.cache.is_empty()
            }
        }
    }

    /// Record a restart storm: stop accepting work and wind down.
    pub fn enter_fatal(&self, restarts: usize, window: Duration) {
        {
            let mut fatal = lock(&self.fatal);
            if fatal.is_some() {
                return;
            }
            *fatal = Some((restarts, window));
        }
        error!(
            restarts,
            window_ms = window.as_millis() as u64,
            "Restart frequency exceeded, closing pool"
        );
        if self
            .state
            .compare_exchange(
                PoolState::Running as u8,
                PoolState::Closing as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            let _ = self.task_tx.send(TaskBatch::Sentinel);
        }
        self.notify_workers();
    }

    /// Give up on a task that will never run.
    pub fn abandon(&self, key: TaskKey, err: TaskError) {
        if let Some(job) = self.cache.get(key.job_id)
            && job.resolve(key.index, Err(err), Via::Abandoned) == Some(true)
        {
            self.cache.remove(key.job_id);
        }
    }

    /// Fork one worker into the lowest free index.
    pub fn spawn_locked(&self, table: &mut WorkerTable) -> Result<()> {
        let index = table.free_index();
        let mut inqueue = Queue::new(&self.heap, None, &format!("forkpool-w{}", index))?;
        let inbound = inqueue
            .take_reader()
            .ok_or_else(|| PoolError::Worker(format!("Inbound queue for worker {} has no reader", index)))?;

        let mut close: CloseList = vec![self.result_reader_fd];
        close.extend(table.slots.iter().filter_map(|s| s.inqueue.writer_fd()));
        close.extend(inqueue.writer_fd());

        let ctx = WorkerContext {
            index,
            inbound,
            results: Arc::clone(&self.results),
            shutdown: Arc::clone(&self.shutdown),
            registry: Arc::clone(&self.registry),
            initializer: self.config.initializer.clone(),
            initargs: self.config.initargs.clone(),
            max_tasks: self.config.max_tasks_per_child,
        };
        let proc = spawn_worker(ctx, &close)?;
        debug!(worker_id = index, pid = proc.pid().as_raw(), "Spawned worker");
        table.slots.push(WorkerSlot::new(proc, inqueue));
        self.notify_workers();
        Ok(())
    }

    /// Close every worker's task channel; idle workers exit on the sentinel.
    pub fn close_worker_queues(&self) {
        let table = self.lock_workers();
        for slot in &table.slots {
            if let Err(e) = slot.inqueue.close() {
                debug!(worker_id = slot.index, error = %e, "Could not close worker queue");
            }
        }
    }

    /// SIGTERM every remaining worker, SIGKILL stragglers after `grace`,
    /// reap them all and free the result lock from any that held it.
    fn stop_workers(&self, grace: Duration) {
        let mut slots = std::mem::take(&mut self.lock_workers().slots);
        self.notify_workers();
        for slot in &slots {
            let _ = slot.inqueue.close();
            if let Err(e) = slot.proc.terminate() {
                debug!(worker_id = slot.index, error = %e, "Could not signal worker");
            }
        }
        let deadline = Instant::now() + grace;
        for slot in &mut slots {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let reaped = matches!(slot.proc.wait_timeout(remaining), Ok(Some(_)));
            if !reaped && let Err(e) = slot.proc.kill() {
                warn!(worker_id = slot.index, error = %e, "Could not kill worker");
            }
            self.results.writer_gone(slot.proc.pid());
            debug!(
                worker_id = slot.index,
                pid = slot.pid(),
                reason = ?slot.proc.exit_reason(),
                "Worker stopped"
            );
        }
    }
}

#[derive(Default)]
struct Handlers {
    supervisor: Option<JoinHandle<()>>,
    task: Option<JoinHandle<()>>,
    timeout: Option<JoinHandle<()>>,
    result: Option<JoinHandle<()>>,
}

fn join_handler(name: &str, handle: Option<JoinHandle<()>>) {
    if let Some(handle) = handle
        && handle.join().is_err()
    {
        error!(handler = name, "Pool handler thread panicked");
    }
}

/// Join a handler, leaving it detached if it has not finished within `limit`.
fn join_handler_within(name: &str, handle: Option<JoinHandle<()>>, limit: Duration) {
    let Some(handle) = handle else {
        return;
    };
    let deadline = Instant::now() + limit;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            warn!(handler = name, limit_ms = limit.as_millis() as u64, "Handler did not stop; detaching");
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    join_handler(name, Some(handle));
}

/// `ceil(len / (4 * processes))`, at least one.
pub fn default_chunksize(len: usize, processes: usize) -> usize {
    len.div_ceil(4 * processes.max(1)).max(1)
}

/// A pool of forked worker processes running registered tasks.
///
/// ```no_run
/// use forkpool::{Pool, PoolConfig, TaskRegistry};
/// use serde_json::json;
///
/// let mut registry = TaskRegistry::new();
/// registry.register("square", |_, args| Ok(args.arg::<i64>(0)?.pow(2)));
///
/// let pool = Pool::new(PoolConfig::new(4), registry)?;
/// let squares = pool.map("square", (1..=10).map(|n| json!(n)).collect(), None)?;
/// assert_eq!(squares[2], json!(9));
/// pool.close();
/// pool.join()?;
/// # Ok::<(), forkpool::PoolError>(())
/// ```
pub struct Pool {
    shared: Arc<PoolShared>,
    handlers: Mutex<Handlers>,
}

impl Pool {
    /// Start `config.processes` workers and the handler threads.
    pub fn new(config: PoolConfig, registry: TaskRegistry) -> Result<Self> {
        config.validate()?;
        let processes = config.processes;
        let heap = Arc::new(Heap::with_arena_size(config.arena_size));

        let (reader, writer) = Connection::pipe()?;
        let result_reader_fd = reader
            .reader_fd()
            .ok_or_else(|| PoolError::Worker("Result pipe has no read end".to_string()))?;
        let results = Arc::new(ResultSink::new(writer, SharedMutex::new(&heap)?));
        let putlock = Arc::new(Semaphore::lax_bounded(&heap, processes as u32)?);
        let shutdown = Arc::new(Event::new(&heap)?);
        let (task_tx, task_rx): (Sender<TaskBatch>, Receiver<TaskBatch>) =
            crossbeam_channel::unbounded();

        let shared = Arc::new(PoolShared {
            restart_budget: Mutex::new(RestartBudget::new(
                processes,
                config.max_restarts,
                config.max_restart_window,
            )),
            config,
            registry: Arc::new(registry),
            heap,
            state: AtomicU8::new(PoolState::Running as u8),
            cache: JobCache::default(),
            workers: Mutex::new(WorkerTable::default()),
            workers_changed: Condvar::new(),
            putlock,
            results,
            result_reader_fd,
            shutdown,
            task_tx,
            fatal: Mutex::new(None),
            tasks_exhausted: AtomicBool::new(false),
            next_job_id: AtomicU64::new(1),
            restarts: AtomicUsize::new(0),
            tasks_completed: AtomicUsize::new(0),
            lost: Mutex::new(Vec::new()),
            target: AtomicUsize::new(processes),
            pause_lock: Mutex::new(()),
            pause_cv: Condvar::new(),
        });

        {
            let mut table = shared.lock_workers();
            for _ in 0..processes {
                shared.spawn_locked(&mut table)?;
            }
        }

        let pool = Self {
            shared: Arc::clone(&shared),
            handlers: Mutex::new(Handlers::default()),
        };
        {
            let mut handlers = lock(&pool.handlers);
            let s = Arc::clone(&shared);
            handlers.supervisor = Some(spawn_handler_thread("forkpool-supervisor", move || {
                supervisor::run(&s)
            })?);
            let s = Arc::clone(&shared);
            handlers.task = Some(spawn_handler_thread("forkpool-tasks", move || {
                task_handler::run(&s, task_rx)
            })?);
            let s = Arc::clone(&shared);
            handlers.timeout = Some(spawn_handler_thread("forkpool-timeouts", move || {
                timeout_handler::run(&s)
            })?);
            let s = Arc::clone(&shared);
            handlers.result = Some(spawn_handler_thread("forkpool-results", move || {
                result_handler::run(&s, ChunkReader::new(reader))
            })?);
        }

        info!(processes, "Pool started");
        Ok(pool)
    }

    pub fn state(&self) -> PoolState {
        self.shared.state()
    }

    fn check_running(&self) -> Result<()> {
        if let Some(err) = self.shared.fatal_error() {
            return Err(err);
        }
        if self.shared.state() != PoolState::Running {
            return Err(PoolError::NotRunning);
        }
        Ok(())
    }

    fn check_task(&self, name: &str) -> Result<()> {
        if self.shared.registry.contains(name) {
            Ok(())
        } else {
            Err(TaskError::UnknownTask {
                name: name.to_string(),
            }
            .into())
        }
    }

    fn next_job_id(&self) -> JobId {
        self.shared.next_job_id.fetch_add(1, Ordering::SeqCst)
    }

    fn timeouts(&self, options: &ApplyOptions) -> (Option<Duration>, Option<Duration>) {
        (
            options.soft_timeout.or(self.shared.config.soft_timeout),
            options.timeout.or(self.shared.config.timeout),
        )
    }

    /// Take a submission slot, blocking or failing per `blocking_submit`.
    fn acquire_slot(&self) -> Result<()> {
        let putlock = &self.shared.putlock;
        if !self.shared.config.blocking_submit {
            if putlock.try_acquire()? {
                return Ok(());
            }
            return Err(PoolError::Saturated(
                putlock.max_value().unwrap_or(self.shared.target()),
            ));
        }
        loop {
            if putlock.acquire(Some(RECHECK_INTERVAL))? {
                return Ok(());
            }
            self.check_running()?;
        }
    }

    fn submit(&self, job: &Arc<Job>, batch: TaskBatch) -> Result<()> {
        if self.shared.task_tx.send(batch).is_err() {
            self.shared.cache.remove(job.id());
            job.abort(TaskError::Terminated);
            return Err(PoolError::NotRunning);
        }
        Ok(())
    }

    /// Run `name(*args)` on a worker and wait for its result.
    pub fn apply(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        self.apply_async(name, args, ApplyOptions::default())?
            .get(None)
    }

    /// Submit `name(*args)` and return a handle to its eventual result.
    pub fn apply_async(
        &self,
        name: &str,
        args: Vec<Value>,
        options: ApplyOptions,
    ) -> Result<AsyncResult> {
        self.check_running()?;
        self.check_task(name)?;
        self.acquire_slot()?;

        let job_id = self.next_job_id();
        let job = Arc::new(Job::apply(
            job_id,
            name,
            options.callbacks.clone(),
            self.timeouts(&options),
            Some(Arc::clone(&self.shared.putlock)),
        ));
        self.shared.cache.insert(Arc::clone(&job));
        let task = Task {
            job_id,
            index: 0,
            name: name.to_string(),
            payload: Payload::Call(TaskArgs::new(args).with_kwargs(options.kwargs)),
        };
        self.submit(&job, TaskBatch::Tasks(vec![task]))?;
        debug!(job_id, task = name, "Submitted task");
        Ok(AsyncResult::new(job))
    }

    /// Apply `name` to every item, one argument each; results keep input order.
    pub fn map(&self, name: &str, items: Vec<Value>, chunksize: Option<usize>) -> Result<Vec<Value>> {
        self.map_async(name, items, chunksize, ApplyOptions::default())?
            .get(None)
    }

    pub fn map_async(
        &self,
        name: &str,
        items: Vec<Value>,
        chunksize: Option<usize>,
        options: ApplyOptions,
    ) -> Result<MapResult> {
        let items = items.into_iter().map(|v| vec![v]).collect();
        self.starmap_async(name, items, chunksize, options)
    }

    /// Like [`map`](Self::map), but each item is a full argument list.
    pub fn starmap(
        &self,
        name: &str,
        items: Vec<Vec<Value>>,
        chunksize: Option<usize>,
    ) -> Result<Vec<Value>> {
        self.starmap_async(name, items, chunksize, ApplyOptions::default())?
            .get(None)
    }

    pub fn starmap_async(
        &self,
        name: &str,
        items: Vec<Vec<Value>>,
        chunksize: Option<usize>,
        options: ApplyOptions,
    ) -> Result<MapResult> {
        self.check_running()?;
        self.check_task(name)?;

        let chunksize = chunksize
            .unwrap_or_else(|| default_chunksize(items.len(), self.shared.target()))
            .max(1);
        let chunks: Vec<Vec<Vec<Value>>> = items.chunks(chunksize).map(<[_]>::to_vec).collect();

        let job_id = self.next_job_id();
        let job = Arc::new(Job::map(
            job_id,
            name,
            chunks.len(),
            options.callbacks.clone(),
            self.timeouts(&options),
        ));
        if chunks.is_empty() {
            return Ok(MapResult::new(job));
        }
        self.shared.cache.insert(Arc::clone(&job));

        let tasks = chunks
            .into_iter()
            .enumerate()
            .map(|(index, items)| Task {
                job_id,
                index,
                name: name.to_string(),
                payload: Payload::Chunk {
                    items,
                    kwargs: options.kwargs.clone(),
                },
            })
            .collect::<Vec<_>>();
        debug!(job_id, task = name, chunks = tasks.len(), chunksize, "Submitted map");
        self.submit(&job, TaskBatch::Tasks(tasks))?;
        Ok(MapResult::new(job))
    }

    /// Lazily apply `name` to `items`, yielding results in input order.
    pub fn imap<I>(&self, name: &str, items: I, chunksize: Option<usize>) -> Result<IMapIterator>
    where
        I: IntoIterator<Item = Value>,
        I::IntoIter: Send + 'static,
    {
        self.imap_inner(name, items, chunksize, true)
    }

    /// Like [`imap`](Self::imap), but yields results as they complete.
    pub fn imap_unordered<I>(
        &self,
        name: &str,
        items: I,
        chunksize: Option<usize>,
    ) -> Result<IMapIterator>
    where
        I: IntoIterator<Item = Value>,
        I::IntoIter: Send + 'static,
    {
        self.imap_inner(name, items, chunksize, false)
    }

    fn imap_inner<I>(
        &self,
        name: &str,
        items: I,
        chunksize: Option<usize>,
        ordered: bool,
    ) -> Result<IMapIterator>
    where
        I: IntoIterator<Item = Value>,
        I::IntoIter: Send + 'static,
    {
        self.check_running()?;
        self.check_task(name)?;

        let job_id = self.next_job_id();
        let job = Arc::new(Job::imap(
            job_id,
            name,
            ordered,
            (self.shared.config.soft_timeout, self.shared.config.timeout),
        ));
        self.shared.cache.insert(Arc::clone(&job));
        let batch = TaskBatch::Lazy {
            job: Arc::clone(&job),
            source: Box::new(items.into_iter().map(|v| vec![v])),
            chunksize: chunksize.unwrap_or(1).max(1),
        };
        self.submit(&job, batch)?;
        debug!(job_id, task = name, ordered, "Submitted imap");
        Ok(IMapIterator::new(job))
    }

    /// Stop accepting work. Submitted work still runs to completion.
    pub fn close(&self) {
        if self
            .shared
            .state
            .compare_exchange(
                PoolState::Running as u8,
                PoolState::Closing as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            info!("Closing pool");
            let _ = self.shared.task_tx.send(TaskBatch::Sentinel);
        }
    }

    /// Kill every worker now and fail whatever was still in flight.
    pub fn terminate(&self) -> Result<()> {
        let prev = self
            .shared
            .state
            .swap(PoolState::Terminated as u8, Ordering::SeqCst);
        if PoolState::from_u8(prev) == PoolState::Terminated {
            return Ok(());
        }
        info!("Terminating pool");
        let shared = &self.shared;
        if let Err(e) = shared.shutdown.set() {
            warn!(error = %e, "Could not raise worker shutdown flag");
        }
        shared.wake_sleepers();
        shared.notify_workers();
        let _ = shared.task_tx.send(TaskBatch::Sentinel);

        let mut handlers = std::mem::take(&mut *lock(&self.handlers));
        join_handler("supervisor", handlers.supervisor.take());
        shared.stop_workers(shared.config.terminate_grace);

        for job in shared.cache.drain() {
            job.abort(TaskError::Terminated);
        }
        lock(&shared.lost).clear();

        if let Err(e) = shared.results.send_sentinel() {
            debug!(error = %e, "Could not write result sentinel");
        }
        join_handler("task", handlers.task.take());
        join_handler("timeout", handlers.timeout.take());
        let limit = shared.config.terminate_grace + RECHECK_INTERVAL * 5;
        join_handler_within("result", handlers.result.take(), limit);
        info!("Pool terminated");
        Ok(())
    }

    /// Wait for the handler threads and workers to finish.
    ///
    /// The pool must be closed or terminated first. Returns the restart
    /// storm error if one shut the pool down.
    pub fn join(&self) -> Result<()> {
        if self.shared.state() == PoolState::Running {
            return Err(PoolError::StillRunning);
        }
        let mut handlers = std::mem::take(&mut *lock(&self.handlers));
        join_handler("task", handlers.task.take());
        join_handler("result", handlers.result.take());
        join_handler("supervisor", handlers.supervisor.take());
        join_handler("timeout", handlers.timeout.take());

        self.shared.stop_workers(self.shared.config.terminate_grace);
        self.shared
            .state
            .store(PoolState::Terminated as u8, Ordering::SeqCst);
        debug!("Pool joined");
        match self.shared.fatal_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Add `n` workers and `n` submission slots.
    pub fn grow(&self, n: usize) -> Result<()> {
        self.check_running()?;
        {
            let mut table = self.shared.lock_workers();
            for _ in 0..n {
                self.shared.spawn_locked(&mut table)?;
                self.shared.target.fetch_add(1, Ordering::SeqCst);
                self.shared.putlock.grow(1)?;
            }
        }
        info!(added = n, processes = self.shared.target(), "Pool grown");
        Ok(())
    }

    /// Retire `n` idle workers and remove `n` submission slots.
    pub fn shrink(&self, n: usize) -> Result<()> {
        self.check_running()?;
        if n == 0 {
            return Ok(());
        }
        let target = self.shared.target();
        if n >= target {
            return Err(PoolError::Config(format!(
                "cannot shrink a pool of {} workers by {}",
                target, n
            )));
        }
        {
            let mut table = self.shared.lock_workers();
            let idle = table.idle_count();
            if idle < n {
                return Err(PoolError::ShrinkUnavailable { requested: n, idle });
            }
            for slot in table.slots.iter_mut().filter(|s| s.is_idle()).take(n) {
                slot.controlled_termination = true;
                slot.inqueue.close()?;
            }
            self.shared.target.fetch_sub(n, Ordering::SeqCst);
            self.shared.putlock.shrink(n)?;
        }
        info!(removed = n, processes = self.shared.target(), "Pool shrunk");
        Ok(())
    }

    pub fn stats(&self) -> PoolStats {
        let (live_workers, idle_workers) = {
            let table = self.shared.lock_workers();
            (table.len(), table.idle_count())
        };
        PoolStats {
            processes: self.shared.target(),
            live_workers,
            idle_workers,
            jobs_in_flight: self.shared.cache.len(),
            tasks_completed: self.shared.tasks_completed.load(Ordering::SeqCst),
            restarts: self.shared.restarts.load(Ordering::SeqCst),
        }
    }

    /// Pids of the workers currently in the table.
    pub fn worker_pids(&self) -> Vec<i32> {
        self.shared.lock_workers().pids()
    }

    /// Default chunk size [`map`](Self::map) would use for `len` items.
    pub fn chunksize_for(&self, len: usize) -> usize {
        default_chunksize(len, self.shared.target())
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        if self.shared.state() != PoolState::Terminated
            && let Err(e) = self.terminate()
        {
            warn!(error = %e, "Pool termination on drop failed");
        }
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("state", &self.state())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_chunksize() {
        assert_eq!(default_chunksize(0, 4), 1);
        assert_eq!(default_chunksize(16, 4), 1);
        assert_eq!(default_chunksize(17, 4), 2);
        assert_eq!(default_chunksize(100, 2), 13);
        assert_eq!(default_chunksize(5, 0), 2);
    }

    #[test]
    fn test_state_ordering() {
        assert!(PoolState::Running < PoolState::Closing);
        assert!(PoolState::Closing < PoolState::Terminated);
        assert_eq!(PoolState::from_u8(PoolState::Closing as u8), PoolState::Closing);
        assert_eq!(PoolState::Terminated.to_string(), "terminated");
    }
}
