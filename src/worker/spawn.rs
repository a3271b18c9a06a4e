//! Forking workers and starting the parent's handler threads.

use super::proc::WorkerProc;
use super::worker_main::{exit_now, run_worker_main};
use super::{EX_FAILURE, WorkerContext};
use crate::error::{ExceptionInfo, PoolError, Result};
use nix::unistd::{ForkResult, fork};
use std::io;
use std::os::unix::io::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::thread::JoinHandle;
use tracing::error;

/// Stack size for the pool's handler threads (2 MiB).
pub const HANDLER_STACK_SIZE: usize = 2 * 1024 * 1024;

/// Fork a worker process running [`run_worker_main`] with `ctx`.
///
/// The child closes every descriptor in `close_in_child` first. The parent
/// drops its copy of `ctx`, which closes its end of the worker's inbound
/// read pipe.
pub(crate) fn spawn_worker(ctx: WorkerContext, close_in_child: &[RawFd]) -> Result<WorkerProc> {
    let index = ctx.index;
    // Safety: the child only touches process-shared primitives, atomics and
    // its own descriptors before leaving through `_exit`.
    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            for &fd in close_in_child {
                // Safety: these descriptors belong to the parent's side of
                // the channels and the child holds no owner for them.
                unsafe {
                    libc::close(fd);
                }
            }
            run_in_child(index, move || {
                run_worker_main(ctx);
            })
        }
        Ok(ForkResult::Parent { child }) => {
            drop(ctx);
            Ok(WorkerProc::new(child, index))
        }
        Err(e) => Err(PoolError::Worker(format!(
            "Failed to fork worker {}: {}",
            index, e
        ))),
    }
}

/// Run `body` as the rest of a forked child's life.
///
/// A panic ends the process with [`EX_FAILURE`] instead of unwinding into
/// the frames the child inherited from the parent.
pub(crate) fn run_in_child(index: usize, body: impl FnOnce()) -> ! {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(body)) {
        let info = ExceptionInfo::from_panic(payload.as_ref());
        error!(worker_id = index, error = %info.message, "Worker panicked outside a task");
    }
    exit_now(EX_FAILURE)
}

/// Spawn a named pool handler thread.
pub(crate) fn spawn_handler_thread<F, T>(name: &str, f: F) -> io::Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    std::thread::Builder::new()
        .name(name.to_string())
        .stack_size(HANDLER_STACK_SIZE)
        .spawn(f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::TerminationReason;

    #[test]
    fn test_child_panic_does_not_unwind_into_parent_frames() {
        // Safety: the child only runs `run_in_child`, which never returns.
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => run_in_child(0, || panic!("outside any task")),
            ForkResult::Parent { child } => {
                let mut proc = WorkerProc::new(child, 0);
                assert_eq!(proc.wait().unwrap(), TerminationReason::Exited(EX_FAILURE));
            }
        }
    }

    #[test]
    fn test_handler_thread_is_named() {
        let handle = spawn_handler_thread("forkpool-test", || {
            std::thread::current().name().map(str::to_string)
        })
        .unwrap();
        assert_eq!(handle.join().unwrap().as_deref(), Some("forkpool-test"));
    }
}
