//! Fans submitted tasks out to idle workers.

use super::{PoolShared, PoolState, RECHECK_INTERVAL, TaskBatch};
use crate::error::TaskError;
use crate::protocol::{Message, Payload, Task};
use crossbeam_channel::Receiver;
use serde_json::Map;
use std::sync::atomic::Ordering;
use tracing::{debug, trace, warn};

/// Outcome of one dispatch attempt.
enum Dispatch {
    Sent,
    Abandoned,
}

pub(crate) fn run(shared: &PoolShared, batches: Receiver<TaskBatch>) {
    debug!("Task handler started");
    while let Ok(batch) = batches.recv() {
        match batch {
            TaskBatch::Tasks(tasks) => {
                for task in tasks {
                    dispatch(shared, task);
                }
            }
            TaskBatch::Lazy {
                job,
                source,
                chunksize,
            } => {
                let mut source = source.peekable();
                let mut index = 0;
                while source.peek().is_some() {
                    if shared.state() == PoolState::Terminated {
                        break;
                    }
                    let items: Vec<_> = source.by_ref().take(chunksize).collect();
                    job.add_task(index);
                    let task = Task {
                        job_id: job.id(),
                        index,
                        name: job.name().to_string(),
                        payload: Payload::Chunk {
                            items,
                            kwargs: Map::new(),
                        },
                    };
                    if let Dispatch::Abandoned = dispatch(shared, task) {
                        trace!(job_id = job.id(), index, "Lazy chunk abandoned");
                    }
                    index += 1;
                }
                if shared.state() != PoolState::Terminated && job.set_length(index) {
                    shared.cache.remove(job.id());
                }
            }
            TaskBatch::Sentinel => break,
        }
    }

    debug!("Task handler got sentinel, closing worker queues");
    shared.tasks_exhausted.store(true, Ordering::SeqCst);
    shared.close_worker_queues();
    shared.notify_workers();

    if let Err(e) = shared.results.send_sentinel() {
        debug!(error = %e, "Could not write result sentinel");
    }
    debug!("Task handler exiting");
}

/// Write `task` to the first idle worker, waiting for one if needed.
fn dispatch(shared: &PoolShared, task: Task) -> Dispatch {
    let key = task.key();
    let message = Message::Task(task);
    let mut table = shared.lock_workers();
    loop {
        let give_up = match shared.state() {
            PoolState::Terminated => true,
            _ => shared.is_fatal() && table.len() == 0,
        };
        if give_up {
            drop(table);
            shared.abandon(key, TaskError::Terminated);
            return Dispatch::Abandoned;
        }

        if let Some(slot) = table.slots.iter_mut().find(|s| s.is_idle()) {
            match slot.inqueue.put(&message, None) {
                Ok(()) => {
                    slot.assigned = Some(key);
                    trace!(
                        worker_id = slot.index,
                        job_id = key.job_id,
                        index = key.index,
                        "Dispatched task"
                    );
                    return Dispatch::Sent;
                }
                Err(e) => {
                    warn!(worker_id = slot.index, error = %e, "Worker queue rejected task");
                    slot.retiring = true;
                    continue;
                }
            }
        }
        table = shared.wait_workers(table, RECHECK_INTERVAL);
    }
}
