//! Worker process main loop.
//!
//! Runs in a freshly forked child. Reads `TASK` frames from the inbound
//! channel and answers with `ACK` before running the task and `READY` after.

use super::signals::{install_worker_handlers, reset_soft_time_limit};
use super::{EX_FAILURE, EX_OK, EX_RECYCLE, WorkerContext};
use crate::error::{PoolError, TaskError};
use crate::ipc::Incoming;
use crate::protocol::{Message, Outcome, Payload, Task, TaskArgs};
use crate::registry::TaskContext;
use nix::unistd::getpid;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error, trace, warn};

/// How long one wait for a task lasts before the shutdown flag is rechecked.
const TASK_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Worker lifecycle.
#[derive(Debug)]
enum WorkerState {
    Idle,
    WaitingForTask,
    Executing(Task),
    /// Tell the parent we are leaving, then exit with the code.
    Terminating(i32),
    Dead(i32),
}

struct Worker {
    ctx: WorkerContext,
    pid: i32,
    completed: usize,
}

impl Worker {
    fn new(ctx: WorkerContext) -> Self {
        Self {
            ctx,
            pid: getpid().as_raw(),
            completed: 0,
        }
    }

    fn run(&mut self) -> i32 {
        let mut state = WorkerState::Idle;
        loop {
            state = match state {
                WorkerState::Idle => self.on_idle(),
                WorkerState::WaitingForTask => self.wait_for_task(),
                WorkerState::Executing(task) => self.execute(task),
                WorkerState::Terminating(code) => self.terminate(code),
                WorkerState::Dead(code) => return code,
            };
        }
    }

    fn on_idle(&self) -> WorkerState {
        match self.ctx.shutdown.is_set() {
            Ok(true) => WorkerState::Terminating(EX_OK),
            Ok(false) => WorkerState::WaitingForTask,
            Err(e) => {
                warn!(worker_id = self.ctx.index, error = %e, "Shutdown flag unreadable");
                WorkerState::Terminating(EX_FAILURE)
            }
        }
    }

    fn wait_for_task(&self) -> WorkerState {
        match self.ctx.inbound.poll(Some(TASK_POLL_INTERVAL)) {
            Ok(false) => return WorkerState::Idle,
            Ok(true) => {}
            Err(e) => {
                warn!(worker_id = self.ctx.index, error = %e, "Inbound poll failed");
                return WorkerState::Terminating(EX_FAILURE);
            }
        }
        match self.ctx.inbound.recv::<Message>() {
            Ok(Incoming::Message(Message::Task(task))) => WorkerState::Executing(task),
            Ok(Incoming::Message(other)) => {
                warn!(
                    worker_id = self.ctx.index,
                    kind = other.kind(),
                    "Ignoring unexpected inbound message"
                );
                WorkerState::Idle
            }
            Ok(Incoming::Sentinel) | Ok(Incoming::Closed) => {
                debug!(worker_id = self.ctx.index, "No more tasks");
                WorkerState::Terminating(EX_OK)
            }
            Err(PoolError::Json(e)) => {
                warn!(worker_id = self.ctx.index, error = %e, "Dropping undecodable task frame");
                WorkerState::Idle
            }
            Err(e) => {
                warn!(worker_id = self.ctx.index, error = %e, "Inbound channel failed");
                WorkerState::Terminating(EX_FAILURE)
            }
        }
    }

    fn execute(&mut self, task: Task) -> WorkerState {
        let key = task.key();
        reset_soft_time_limit();

        if let Err(e) = self.ctx.results.send(&Message::ack(key, self.pid)) {
            error!(worker_id = self.ctx.index, error = %e, "Could not acknowledge task");
            return WorkerState::Dead(EX_FAILURE);
        }
        trace!(worker_id = self.ctx.index, job_id = key.job_id, index = key.index, "Task accepted");

        let task_ctx = TaskContext {
            worker_index: self.ctx.index,
            pid: self.pid,
            job_id: key.job_id,
            index: key.index,
        };
        let outcome = self.run_payload(&task.name, &task_ctx, task.payload);

        if let Err(e) = self.ctx.results.send(&Message::ready(key, outcome)) {
            error!(worker_id = self.ctx.index, error = %e, "Could not deliver result");
            return WorkerState::Dead(EX_FAILURE);
        }

        self.completed += 1;
        match self.ctx.max_tasks {
            Some(max) if self.completed >= max => {
                debug!(worker_id = self.ctx.index, completed = self.completed, "Recycling worker");
                WorkerState::Terminating(EX_RECYCLE)
            }
            _ => WorkerState::Idle,
        }
    }

    fn run_payload(&self, name: &str, ctx: &TaskContext, payload: Payload) -> Outcome {
        let registry = &self.ctx.registry;
        match payload {
            Payload::Call(args) => registry.invoke(name, ctx, args),
            Payload::Chunk { items, kwargs } => {
                let mut results = Vec::with_capacity(items.len());
                for item in items {
                    let args = TaskArgs::new(item).with_kwargs(kwargs.clone());
                    results.push(registry.invoke(name, ctx, args)?);
                }
                Ok(Value::Array(results))
            }
        }
    }

    fn terminate(&self, code: i32) -> WorkerState {
        let death = Message::Death {
            pid: self.pid,
            exit_code: code,
        };
        if let Err(e) = self.ctx.results.send(&death) {
            debug!(worker_id = self.ctx.index, error = %e, "Could not announce exit");
        }
        WorkerState::Dead(code)
    }
}

fn run_initializer(ctx: &WorkerContext) -> Result<(), TaskError> {
    let Some(init) = ctx.initializer.as_ref() else {
        return Ok(());
    };
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| init(&ctx.initargs))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(TaskError::Raised(crate::error::ExceptionInfo::from_error(&e))),
        Err(payload) => Err(TaskError::Panicked(
            crate::error::ExceptionInfo::from_panic(payload.as_ref()),
        )),
    }
}

/// Entry point of a forked worker. Never returns.
pub(crate) fn run_worker_main(ctx: WorkerContext) -> ! {
    if let Err(e) = install_worker_handlers() {
        error!(worker_id = ctx.index, error = %e, "Could not install signal handlers");
        exit_now(EX_FAILURE);
    }

    if let Err(e) = run_initializer(&ctx) {
        error!(worker_id = ctx.index, error = %e, "Worker initializer failed");
        exit_now(EX_FAILURE);
    }

    debug!(worker_id = ctx.index, pid = getpid().as_raw(), "Worker started");
    let code = Worker::new(ctx).run();
    exit_now(code)
}

/// Leave the process without running atexit handlers or destructors.
pub(crate) fn exit_now(code: i32) -> ! {
    // Safety: `_exit` has no preconditions; skipping destructors is the
    // point, since the parent's state was copied into this process.
    unsafe { libc::_exit(code) }
}
