//! Exit analysis for worker processes, and the signal setup a worker
//! installs when it starts.

use super::EX_RECYCLE;
use crate::registry::SOFT_LIMIT_EXCEEDED;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::WaitStatus;
use std::sync::atomic::Ordering;

/// Why a worker process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Voluntary exit after reaching the task limit.
    Recycled,
    /// Killed by signal.
    Signaled { signal: Signal, core_dumped: bool },
    /// Process is still running.
    StillAlive,
    Unknown,
}

impl TerminationReason {
    /// Clean exits (plain success or recycling) are not counted as restarts.
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Exited(0) | Self::Recycled)
    }

    pub fn description(&self) -> String {
        match self {
            Self::Exited(code) => format!("exited with code {}", code),
            Self::Recycled => "recycled after reaching its task limit".to_string(),
            Self::Signaled {
                signal,
                core_dumped: true,
            } => format!("killed by signal {} (core dumped)", signal.as_str()),
            Self::Signaled { signal, .. } => format!("killed by signal {}", signal.as_str()),
            Self::StillAlive => "still running".to_string(),
            Self::Unknown => "unknown reason".to_string(),
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Termination reason for a worker that exits with `code`.
pub fn reason_for_exit_code(code: i32) -> TerminationReason {
    match code {
        EX_RECYCLE => TerminationReason::Recycled,
        code => TerminationReason::Exited(code),
    }
}

/// Analyze a `WaitStatus` to determine the termination reason.
pub fn analyze_wait_status(status: WaitStatus) -> TerminationReason {
    match status {
        WaitStatus::Exited(_, code) => reason_for_exit_code(code),
        WaitStatus::Signaled(_, signal, core_dumped) => TerminationReason::Signaled {
            signal,
            core_dumped,
        },
        WaitStatus::StillAlive => TerminationReason::StillAlive,
        _ => TerminationReason::Unknown,
    }
}

/// A worker exit together with what it was doing.
#[derive(Debug)]
pub struct WorkerFailure {
    pub reason: TerminationReason,
    pub context: Option<String>,
}

impl WorkerFailure {
    pub fn new(reason: TerminationReason) -> Self {
        Self {
            reason,
            context: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

impl std::fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker {}", self.reason)?;
        if let Some(ctx) = &self.context {
            write!(f, " while {}", ctx)?;
        }
        Ok(())
    }
}

extern "C" fn on_soft_time_limit(_: libc::c_int) {
    SOFT_LIMIT_EXCEEDED.store(true, Ordering::SeqCst);
}

/// Signal dispositions for a freshly forked worker.
///
/// SIGTERM and SIGINT get their default action so the parent can always
/// reclaim the process, SIGPIPE is ignored (a vanished parent surfaces as a
/// write error), and SIGUSR1 raises the soft-time-limit flag.
pub(crate) fn install_worker_handlers() -> nix::Result<()> {
    let soft = SigAction::new(
        SigHandler::Handler(on_soft_time_limit),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    // Safety: the handler only stores to an atomic.
    unsafe {
        signal::signal(Signal::SIGTERM, SigHandler::SigDfl)?;
        signal::signal(Signal::SIGINT, SigHandler::SigDfl)?;
        signal::signal(Signal::SIGPIPE, SigHandler::SigIgn)?;
        signal::sigaction(Signal::SIGUSR1, &soft)?;
    }
    Ok(())
}

/// Clear the soft-time-limit flag before a new task starts.
pub(crate) fn reset_soft_time_limit() {
    SOFT_LIMIT_EXCEEDED.store(false, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Pid;

    #[test]
    fn test_clean_exits() {
        assert!(TerminationReason::Exited(0).is_clean());
        assert!(TerminationReason::Recycled.is_clean());
        assert!(!TerminationReason::Exited(1).is_clean());
        assert!(reason_for_exit_code(EX_RECYCLE).is_clean());
        assert!(!reason_for_exit_code(crate::worker::EX_FAILURE).is_clean());
        assert!(
            !TerminationReason::Signaled {
                signal: Signal::SIGKILL,
                core_dumped: false
            }
            .is_clean()
        );
    }

    #[test]
    fn test_analyze_wait_status() {
        let pid = Pid::from_raw(1);
        assert_eq!(
            analyze_wait_status(WaitStatus::Exited(pid, 0)),
            TerminationReason::Exited(0)
        );
        assert_eq!(
            analyze_wait_status(WaitStatus::Exited(pid, EX_RECYCLE)),
            TerminationReason::Recycled
        );
        assert_eq!(
            analyze_wait_status(WaitStatus::Signaled(pid, Signal::SIGSEGV, true)),
            TerminationReason::Signaled {
                signal: Signal::SIGSEGV,
                core_dumped: true
            }
        );
        assert_eq!(
            analyze_wait_status(WaitStatus::StillAlive),
            TerminationReason::StillAlive
        );
    }

    #[test]
    fn test_failure_display() {
        let failure = WorkerFailure::new(TerminationReason::Signaled {
            signal: Signal::SIGKILL,
            core_dumped: false,
        })
        .with_context("running job 3 task 0");
        let text = failure.to_string();
        assert!(text.contains("SIGKILL"));
        assert!(text.contains("job 3"));
    }
}
