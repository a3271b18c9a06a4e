//! Keeps the worker count at its target.

use super::workers::WorkerSlot;
use super::job::Via;
use super::{LostJob, PoolShared, PoolState, lock};
use crate::error::{PoolError, TaskError};
use crate::worker::{TerminationReason, WorkerFailure};
use std::sync::atomic::Ordering;
use std::time::Instant;
use tracing::{debug, error, info, warn};

pub(crate) fn run(shared: &PoolShared) {
    debug!("Supervisor started");
    let mut tick = 0usize;
    loop {
        let warm = tick < shared.config.warmup_ticks;
        maintain(shared, warm);
        if shared.should_wind_down() {
            break;
        }
        tick = tick.saturating_add(1);
        let interval = if warm {
            shared.config.warmup_interval
        } else {
            shared.config.maintain_interval
        };
        shared.pause(interval);
    }
    debug!("Supervisor exiting");
}

/// One maintenance tick.
fn maintain(shared: &PoolShared, warm: bool) {
    let now = Instant::now();
    for slot in reap(shared) {
        on_exit(shared, slot, warm, now);
    }
    respawn(shared);
    expire_lost(shared, now);
    shared.notify_workers();
}

/// Remove every exited worker from the table.
fn reap(shared: &PoolShared) -> Vec<WorkerSlot> {
    let mut table = shared.lock_workers();
    let mut exited = Vec::new();
    let mut i = 0;
    while i < table.slots.len() {
        match table.slots[i].proc.try_wait() {
            Ok(Some(_)) => exited.push(table.slots.remove(i)),
            Ok(None) => i += 1,
            Err(e) => {
                warn!(worker_id = table.slots[i].index, error = %e, "Could not poll worker");
                i += 1;
            }
        }
    }
    exited
}

fn on_exit(shared: &PoolShared, slot: WorkerSlot, warm: bool, now: Instant) {
    let reason = slot.proc.exit_reason().unwrap_or(TerminationReason::Unknown);
    let pid = slot.pid();
    if shared.results.writer_gone(slot.proc.pid()) {
        warn!(worker_id = slot.index, pid, "Recovered result lock from dead worker");
    }

    if let Some(key) = slot.assigned
        && !slot.job_terminated
    {
        let failure = WorkerFailure::new(reason).with_context(format!(
            "running job {} task {}",
            key.job_id, key.index
        ));
        warn!(
            worker_id = slot.index,
            pid,
            job_id = key.job_id,
            index = key.index,
            reason = %reason,
            "Worker exited with a task in flight"
        );
        lock(&shared.lost).push(LostJob {
            key,
            pid,
            reason: failure.to_string(),
            deadline: now + shared.config.lost_worker_timeout,
        });
    }

    let abnormal = !reason.is_clean() && !slot.controlled_termination && !slot.job_terminated;
    if !abnormal {
        debug!(
            worker_id = slot.index,
            pid,
            reason = %reason,
            tasks_completed = slot.tasks_completed,
            "Worker exited"
        );
        return;
    }

    warn!(
        worker_id = slot.index,
        pid,
        reason = %reason,
        uptime_ms = slot.started_at.elapsed().as_millis() as u64,
        "Worker died unexpectedly"
    );
    shared.restarts.fetch_add(1, Ordering::SeqCst);
    let step = lock(&shared.restart_budget).record(warm, now);
    if let Err(PoolError::RestartFreqExceeded { restarts, window }) = step {
        shared.enter_fatal(restarts, window);
    }
}

fn respawn(shared: &PoolShared) {
    if shared.is_fatal()
        || shared.state() == PoolState::Terminated
        || shared.tasks_exhausted.load(Ordering::SeqCst)
    {
        return;
    }
    let mut table = shared.lock_workers();
    let target = shared.target();
    while table.len() < target {
        let index = table.free_index();
        if let Err(e) = shared.spawn_locked(&mut table) {
            error!(worker_id = index, error = %e, "Could not spawn replacement worker");
            break;
        }
        info!(worker_id = index, "Replaced worker");
    }
}

/// Fail lost tasks whose grace period ran out.
fn expire_lost(shared: &PoolShared, now: Instant) {
    let expired: Vec<LostJob> = {
        let mut lost = lock(&shared.lost);
        let (expired, waiting): (Vec<LostJob>, Vec<LostJob>) = std::mem::take(&mut *lost)
            .into_iter()
            .partition(|l| l.deadline <= now);
        *lost = waiting;
        expired
    };
    for l in expired {
        let Some(job) = shared.cache.get(l.key.job_id) else {
            continue;
        };
        let err = TaskError::WorkerLost {
            pid: l.pid,
            reason: l.reason,
        };
        match job.resolve(l.key.index, Err(err), Via::Abandoned) {
            Some(remove) => {
                warn!(job_id = l.key.job_id, index = l.key.index, pid = l.pid, "Task lost with its worker");
                if remove {
                    shared.cache.remove(l.key.job_id);
                }
            }
            None => debug!(job_id = l.key.job_id, index = l.key.index, "Lost task had already resolved"),
        }
    }
}
