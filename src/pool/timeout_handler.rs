//! Soft and hard per-task deadlines.
//!
//! Runs as a periodic scan over accepted, unresolved tasks. A soft expiry
//! sends SIGUSR1 to the worker once per task and reports it to the job's
//! timeout callback. A hard expiry fails the task with `TimeLimitExceeded`,
//! sends SIGTERM to the worker and escalates to SIGKILL on a later tick if
//! the process is still around after `terminate_grace`.

use super::job::{Acceptance, Job, Via};
use super::{PoolShared, TimeoutKind};
use crate::error::TaskError;
use crate::protocol::TaskKey;
use nix::sys::signal::Signal;
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// A worker that was sent SIGTERM and is due a SIGKILL at `deadline`.
struct PendingKill {
    pid: i32,
    deadline: Instant,
}

#[derive(Default)]
struct TimeoutState {
    /// Tasks already signalled for their soft limit.
    soft_sent: HashSet<TaskKey>,
    pending_kills: Vec<PendingKill>,
}

pub(crate) fn run(shared: &PoolShared) {
    debug!("Timeout handler started");
    let mut state = TimeoutState::default();
    while !shared.should_wind_down() {
        scan(shared, &mut state, Instant::now());
        escalate(shared, &mut state, Instant::now());
        shared.pause(shared.config.timeout_check_interval);
    }
    debug!("Timeout handler exiting");
}

fn scan(shared: &PoolShared, state: &mut TimeoutState, now: Instant) {
    let mut seen = HashSet::new();
    for job in shared.cache.snapshot() {
        let (soft, hard) = (job.soft_timeout(), job.timeout());
        if soft.is_none() && hard.is_none() {
            continue;
        }
        for (index, acceptance) in job.in_flight() {
            let key = TaskKey {
                job_id: job.id(),
                index,
            };
            seen.insert(key);
            let elapsed = now.saturating_duration_since(acceptance.instant);
            match (soft, hard) {
                (_, Some(limit)) if elapsed >= limit => {
                    on_hard_timeout(shared, state, &job, key, acceptance, limit, now);
                }
                (Some(limit), _) if elapsed >= limit && state.soft_sent.insert(key) => {
                    on_soft_timeout(shared, &job, key, acceptance, limit);
                }
                _ => {}
            }
        }
    }
    state.soft_sent.retain(|key| seen.contains(key));
}

fn on_soft_timeout(
    shared: &PoolShared,
    job: &Job,
    key: TaskKey,
    acceptance: Acceptance,
    limit: Duration,
) {
    warn!(
        job_id = key.job_id,
        index = key.index,
        pid = acceptance.pid,
        limit_ms = limit.as_millis() as u64,
        "Soft time limit exceeded"
    );
    signal_worker(shared, acceptance.pid, Signal::SIGUSR1);
    job.fire_timeout(TimeoutKind::Soft, limit);
}

fn on_hard_timeout(
    shared: &PoolShared,
    state: &mut TimeoutState,
    job: &Job,
    key: TaskKey,
    acceptance: Acceptance,
    limit: Duration,
    now: Instant,
) {
    let err = TaskError::TimeLimitExceeded { limit };
    let Some(remove) = job.resolve(key.index, Err(err), Via::Ready) else {
        // The result won the race.
        return;
    };
    if remove {
        shared.cache.remove(key.job_id);
    }
    warn!(
        job_id = key.job_id,
        index = key.index,
        pid = acceptance.pid,
        limit_ms = limit.as_millis() as u64,
        "Hard time limit exceeded, terminating worker"
    );
    job.fire_timeout(TimeoutKind::Hard, limit);

    let mut table = shared.lock_workers();
    if let Some(slot) = table.by_pid(acceptance.pid) {
        slot.job_terminated = true;
        if let Err(e) = slot.proc.terminate() {
            warn!(pid = acceptance.pid, error = %e, "Could not terminate timed-out worker");
        }
        state.pending_kills.push(PendingKill {
            pid: acceptance.pid,
            deadline: now + shared.config.terminate_grace,
        });
    }
}

/// SIGKILL workers that outlived their SIGTERM grace.
fn escalate(shared: &PoolShared, state: &mut TimeoutState, now: Instant) {
    if state.pending_kills.is_empty() {
        return;
    }
    let mut table = shared.lock_workers();
    state.pending_kills.retain(|kill| {
        if now < kill.deadline {
            return true;
        }
        if let Some(slot) = table.by_pid(kill.pid)
            && matches!(slot.proc.try_wait(), Ok(None))
        {
            debug!(pid = kill.pid, "Worker ignored SIGTERM, killing");
            if let Err(e) = slot.proc.signal(Signal::SIGKILL) {
                warn!(pid = kill.pid, error = %e, "Could not kill worker");
            }
        }
        false
    });
}

fn signal_worker(shared: &PoolShared, pid: i32, sig: Signal) {
    let table = shared.lock_workers();
    let Some(slot) = table.slots.iter().find(|s| s.pid() == pid) else {
        return;
    };
    if let Err(e) = slot.proc.signal(sig) {
        debug!(pid, signal = sig.as_str(), error = %e, "Could not signal worker");
    }
}
