//! Consumes `ACK`, `READY` and `DEATH` frames from the shared result pipe.

use super::job::Via;
use super::{PoolShared, PoolState, RECHECK_INTERVAL, lock};
use crate::error::{PoolError, TaskError};
use crate::ipc::{ChunkReader, Incoming};
use crate::protocol::{Message, TaskKey};
use crate::worker::reason_for_exit_code;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tracing::{debug, trace, warn};

/// Why the read loop stopped.
#[derive(Debug, PartialEq, Eq)]
enum Stop {
    Sentinel,
    Terminated,
    Broken,
}

pub(crate) fn run(shared: &PoolShared, mut reader: ChunkReader) {
    debug!("Result handler started");
    let stop = read_until_sentinel(shared, &mut reader);
    debug!(reason = ?stop, "Result handler stopped reading tasks");
    if stop == Stop::Sentinel {
        drain(shared, &mut reader);
    }
    debug!("Result handler exiting");
}

/// Read one chunk if one arrives within the recheck interval, handling the
/// frame it completes.
fn poll_once(shared: &PoolShared, reader: &mut ChunkReader) -> Option<Stop> {
    match reader.poll(Some(RECHECK_INTERVAL)) {
        Ok(true) => {}
        Ok(false) => return None,
        Err(e) => {
            warn!(error = %e, "Result pipe poll failed");
            return Some(Stop::Broken);
        }
    }
    match reader.recv::<Message>() {
        Ok(None) => None,
        Ok(Some(Incoming::Message(message))) => {
            handle(shared, message);
            None
        }
        Ok(Some(Incoming::Sentinel)) => Some(Stop::Sentinel),
        Ok(Some(Incoming::Closed)) => Some(Stop::Broken),
        Err(PoolError::Json(e)) => {
            warn!(error = %e, "Dropping undecodable result frame");
            None
        }
        Err(e) => {
            warn!(error = %e, "Result pipe read failed");
            Some(Stop::Broken)
        }
    }
}

fn read_until_sentinel(shared: &PoolShared, reader: &mut ChunkReader) -> Stop {
    loop {
        if shared.state() == PoolState::Terminated {
            return Stop::Terminated;
        }
        if let Some(stop) = poll_once(shared, reader) {
            return stop;
        }
    }
}

/// Keep collecting results that raced with shutdown until every job is
/// done, the pool is terminated, or no worker is left to answer for
/// `shutdown_grace`.
fn drain(shared: &PoolShared, reader: &mut ChunkReader) {
    let mut orphaned_since: Option<Instant> = None;
    while !shared.cache.is_empty() && shared.state() != PoolState::Terminated {
        if shared.lock_workers().len() > 0 {
            orphaned_since = None;
        } else {
            let since = *orphaned_since.get_or_insert_with(Instant::now);
            if since.elapsed() >= shared.config.shutdown_grace {
                abort_leftovers(shared);
                break;
            }
        }
        match poll_once(shared, reader) {
            None | Some(Stop::Sentinel) => {}
            Some(stop) => {
                debug!(reason = ?stop, "Result pipe ended while draining");
                break;
            }
        }
    }
}

fn abort_leftovers(shared: &PoolShared) {
    for job in shared.cache.drain() {
        warn!(job_id = job.id(), task = job.name(), "Job abandoned at shutdown");
        job.abort(TaskError::WorkerLost {
            pid: 0,
            reason: "no worker left to finish the job at shutdown".to_string(),
        });
    }
}

fn handle(shared: &PoolShared, message: Message) {
    trace!(kind = message.kind(), "Result frame");
    match message {
        Message::Ack {
            job_id,
            index,
            accepted_at,
            pid,
        } => {
            lock(&shared.restart_budget).task_accepted();
            match shared.cache.get(job_id) {
                Some(job) => {
                    if job.accept(index, pid, accepted_at).remove {
                        shared.cache.remove(job_id);
                    }
                }
                None => trace!(job_id, index, "ACK for a job no longer cached"),
            }
        }
        Message::Ready {
            job_id,
            index,
            outcome,
        } => {
            if let Some(job) = shared.cache.get(job_id)
                && job.resolve(index, outcome, Via::Ready) == Some(true)
            {
                shared.cache.remove(job_id);
            }
            on_task_done(shared, TaskKey { job_id, index });
        }
        Message::Death { pid, exit_code } => {
            debug!(pid, exit_code, "Worker announced exit");
            let mut table = shared.lock_workers();
            if let Some(slot) = table.by_pid(pid) {
                if death_is_controlled(exit_code) {
                    slot.controlled_termination = true;
                }
                slot.retiring = true;
                if let Err(e) = slot.proc.terminate() {
                    debug!(pid, error = %e, "Courtesy SIGTERM failed");
                }
            }
        }
        Message::Task(task) => {
            warn!(job_id = task.job_id, "Worker sent a TASK frame; ignoring");
        }
    }
}

/// Only a clean announced exit keeps the worker off the restart budget.
fn death_is_controlled(exit_code: i32) -> bool {
    reason_for_exit_code(exit_code).is_clean()
}

/// Free the worker that ran `key` for its next task.
fn on_task_done(shared: &PoolShared, key: TaskKey) {
    shared.tasks_completed.fetch_add(1, Ordering::SeqCst);
    let max_tasks = shared.config.max_tasks_per_child;
    {
        let mut table = shared.lock_workers();
        if let Some(slot) = table.by_task(key) {
            slot.assigned = None;
            slot.tasks_completed += 1;
            if max_tasks.is_some_and(|max| slot.tasks_completed >= max) {
                slot.retiring = true;
            }
        }
    }
    shared.notify_workers();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{EX_FAILURE, EX_OK, EX_RECYCLE};

    #[test]
    fn test_only_clean_deaths_are_controlled() {
        assert!(death_is_controlled(EX_OK));
        assert!(death_is_controlled(EX_RECYCLE));
        assert!(!death_is_controlled(EX_FAILURE));
        assert!(!death_is_controlled(-1));
    }
}
