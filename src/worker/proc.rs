//! Process handle for forked workers.

use super::signals::{TerminationReason, analyze_wait_status};
use crate::error::{PoolError, Result};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::time::{Duration, Instant};

/// Handle to a worker process. The parent is the only process that reaps it.
#[derive(Debug)]
pub struct WorkerProc {
    pid: Pid,
    index: usize,
    /// Set once the process has been reaped.
    exit: Option<TerminationReason>,
}

impl WorkerProc {
    pub fn new(pid: Pid, index: usize) -> Self {
        Self {
            pid,
            index,
            exit: None,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// How the process ended, once reaped.
    pub fn exit_reason(&self) -> Option<TerminationReason> {
        self.exit
    }

    /// Check if the process is still running (non-blocking).
    pub fn is_running(&mut self) -> bool {
        matches!(self.try_wait(), Ok(None))
    }

    /// Reap the process if it has exited; `None` while it is still running.
    pub fn try_wait(&mut self) -> Result<Option<TerminationReason>> {
        if let Some(reason) = self.exit {
            return Ok(Some(reason));
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(status) => Ok(Some(self.record(status))),
            Err(Errno::ECHILD) => Ok(Some(self.record_lost())),
            Err(e) => Err(PoolError::Worker(format!(
                "waitpid({}) failed: {}",
                self.pid, e
            ))),
        }
    }

    /// Block until the process exits.
    pub fn wait(&mut self) -> Result<TerminationReason> {
        if let Some(reason) = self.exit {
            return Ok(reason);
        }
        loop {
            match waitpid(self.pid, None) {
                Ok(WaitStatus::StillAlive) => continue,
                Ok(status) => return Ok(self.record(status)),
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => return Ok(self.record_lost()),
                Err(e) => {
                    return Err(PoolError::Worker(format!(
                        "waitpid({}) failed: {}",
                        self.pid, e
                    )));
                }
            }
        }
    }

    /// Poll for exit until `timeout` elapses.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<TerminationReason>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(reason) = self.try_wait()? {
                return Ok(Some(reason));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn record(&mut self, status: WaitStatus) -> TerminationReason {
        let reason = analyze_wait_status(status);
        self.exit = Some(reason);
        reason
    }

    /// Someone else reaped the child; its status is gone.
    fn record_lost(&mut self) -> TerminationReason {
        self.exit = Some(TerminationReason::Unknown);
        TerminationReason::Unknown
    }

    /// Deliver `sig` unless the process has already been reaped.
    pub fn signal(&self, sig: Signal) -> Result<()> {
        if self.exit.is_some() {
            return Ok(());
        }
        match signal::kill(self.pid, sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(PoolError::Worker(format!(
                "Failed to send {} to {}: {}",
                sig.as_str(),
                self.pid,
                e
            ))),
        }
    }

    /// Send SIGTERM to the process.
    pub fn terminate(&self) -> Result<()> {
        self.signal(Signal::SIGTERM)
    }

    /// Send SIGKILL and reap.
    pub fn kill(&mut self) -> Result<TerminationReason> {
        self.signal(Signal::SIGKILL)?;
        self.wait()
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL.
    pub fn stop(&mut self, grace: Duration) -> Result<TerminationReason> {
        if let Some(reason) = self.try_wait()? {
            return Ok(reason);
        }
        self.terminate()?;
        if let Some(reason) = self.wait_timeout(grace)? {
            return Ok(reason);
        }
        tracing::debug!(
            worker_id = self.index,
            pid = self.pid.as_raw(),
            "Worker ignored SIGTERM, killing"
        );
        self.kill()
    }
}

impl Drop for WorkerProc {
    fn drop(&mut self) {
        if self.exit.is_none() {
            let _ = signal::kill(self.pid, Signal::SIGKILL);
            let _ = waitpid(self.pid, None);
        }
    }
}
