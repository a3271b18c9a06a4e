//! Worker processes.
//!
//! # Architecture
//!
//! ```text
//!                  ┌──────────────────────────┐
//!                  │      Parent process      │
//!                  │ TaskHandler ResultHandler│
//!                  └───┬──────────────────▲───┘
//!        per-worker    │                  │   one shared result pipe,
//!        inbound Queue │                  │   pipe-atomic chunks tagged
//!               ┌──────┼──────┐           │   with the writer's pid
//!         ┌─────▼───┐ ┌▼────────┐         │
//!         │ Worker 0│ │ Worker 1│ ... ────┘
//!         │ (fork)  │ │ (fork)  │
//!         └─────────┘ └─────────┘
//! ```
//!
//! Workers are created with `fork()`, so they inherit the task registry and
//! the shared heap holding the synchronization primitives. A worker never
//! returns into the parent's code: it leaves through `_exit`.

mod proc;
mod signals;
mod spawn;
mod worker_main;

pub use proc::WorkerProc;
pub use signals::{TerminationReason, WorkerFailure, analyze_wait_status, reason_for_exit_code};
pub(crate) use spawn::{spawn_handler_thread, spawn_worker};

use crate::config::Initializer;
use crate::error::Result;
use crate::ipc::{ChunkWriter, Connection};
use crate::protocol::Message;
use crate::registry::TaskRegistry;
use crate::sync::{Event, Mutex};
use nix::unistd::{Pid, getpid};
use serde_json::Value;
use std::os::unix::io::RawFd;
use std::sync::Arc;

/// Exit code of a worker that finished normally.
pub const EX_OK: i32 = 0;
/// Exit code of a worker whose initializer failed or whose channels broke.
pub const EX_FAILURE: i32 = 1;
/// Exit code of a worker that retired after `max_tasks_per_child` tasks.
pub const EX_RECYCLE: i32 = 155;

/// Write side of the result path shared by every worker.
///
/// Frames travel as pipe-atomic chunks, so a writer killed mid-frame leaves
/// only whole chunks behind. Writers still hold a process-shared mutex for
/// the duration of one frame to keep frames contiguous on the wire.
pub(crate) struct ResultSink {
    out: ChunkWriter,
    lock: Mutex,
}

impl ResultSink {
    pub(crate) fn new(conn: Connection, lock: Mutex) -> Self {
        Self {
            out: ChunkWriter::new(conn),
            lock,
        }
    }

    pub(crate) fn send(&self, message: &Message) -> Result<()> {
        let _guard = self.lock.lock()?;
        self.out.send(getpid().as_raw(), message)
    }

    /// Write the end-of-results sentinel. A single chunk needs no lock.
    pub(crate) fn send_sentinel(&self) -> Result<()> {
        self.out.send_sentinel(getpid().as_raw())?;
        Ok(())
    }

    /// Clean up after the reaped worker `pid`: free the write lock if it
    /// died holding it, and tell the reader to drop its unfinished frame.
    ///
    /// Returns whether the lock was recovered.
    pub(crate) fn writer_gone(&self, pid: Pid) -> bool {
        let released = match self.lock.force_release(pid) {
            Ok(released) => released,
            Err(e) => {
                tracing::warn!(pid = pid.as_raw(), error = %e, "Could not recover result lock");
                false
            }
        };
        if let Err(e) = self.out.send_discard(pid.as_raw()) {
            tracing::debug!(pid = pid.as_raw(), error = %e, "Could not send discard marker");
        }
        released
    }
}

/// Everything a worker process needs, handed over explicitly at fork time.
pub(crate) struct WorkerContext {
    pub index: usize,
    /// Read end of this worker's inbound queue.
    pub inbound: Connection,
    pub results: Arc<ResultSink>,
    /// Set by the pool on terminate; checked between tasks.
    pub shutdown: Arc<Event>,
    pub registry: Arc<TaskRegistry>,
    pub initializer: Option<Initializer>,
    pub initargs: Vec<Value>,
    pub max_tasks: Option<usize>,
}

/// Descriptors a new worker must close: the result reader and every inbound
/// queue's write end, its own included.
pub(crate) type CloseList = Vec<RawFd>;
