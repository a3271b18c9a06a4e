//! The parent's table of live worker processes.

use crate::ipc::Queue;
use crate::protocol::TaskKey;
use crate::worker::WorkerProc;
use std::time::Instant;

/// One worker process as the parent sees it.
pub(crate) struct WorkerSlot {
    pub proc: WorkerProc,
    pub index: usize,
    /// Parent side of the worker's task channel.
    pub inqueue: Queue,
    /// Task written to this worker and not yet answered with `READY`.
    pub assigned: Option<TaskKey>,
    pub tasks_completed: usize,
    /// Asked to leave by the pool (shrink or courtesy signal).
    pub controlled_termination: bool,
    /// Killed for exceeding a hard time limit.
    pub job_terminated: bool,
    /// About to recycle; no new tasks go to it.
    pub retiring: bool,
    pub started_at: Instant,
}

impl WorkerSlot {
    pub fn new(proc: WorkerProc, inqueue: Queue) -> Self {
        Self {
            index: proc.index(),
            proc,
            inqueue,
            assigned: None,
            tasks_completed: 0,
            controlled_termination: false,
            job_terminated: false,
            retiring: false,
            started_at: Instant::now(),
        }
    }

    pub fn pid(&self) -> i32 {
        self.proc.pid().as_raw()
    }

    pub fn is_idle(&self) -> bool {
        self.assigned.is_none()
            && !self.retiring
            && !self.controlled_termination
            && !self.job_terminated
    }
}

#[derive(Default)]
pub(crate) struct WorkerTable {
    pub slots: Vec<WorkerSlot>,
}

impl WorkerTable {
    /// Lowest worker index not held by a live slot.
    pub fn free_index(&self) -> usize {
        (0..)
            .find(|i| !self.slots.iter().any(|s| s.index == *i))
            .unwrap_or(self.slots.len())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn idle_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_idle()).count()
    }

    pub fn by_pid(&mut self, pid: i32) -> Option<&mut WorkerSlot> {
        self.slots.iter_mut().find(|s| s.pid() == pid)
    }

    pub fn by_task(&mut self, key: TaskKey) -> Option<&mut WorkerSlot> {
        self.slots.iter_mut().find(|s| s.assigned == Some(key))
    }

    pub fn pids(&self) -> Vec<i32> {
        self.slots.iter().map(WorkerSlot::pid).collect()
    }
}
