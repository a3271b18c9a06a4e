//! Restart-frequency guard.

use crate::error::PoolError;
use std::time::{Duration, Instant};

/// Counts abnormal worker exits inside a sliding window.
///
/// Once `max_restarts` exits have been counted and another one arrives
/// before `window` has passed since the first, [`RestartState::step`] fails
/// with [`PoolError::RestartFreqExceeded`].
#[derive(Debug, Clone)]
pub struct RestartState {
    max_restarts: Option<usize>,
    window: Duration,
    count: usize,
    window_start: Option<Instant>,
}

impl RestartState {
    pub fn new(max_restarts: Option<usize>, window: Duration) -> Self {
        Self {
            max_restarts,
            window,
            count: 0,
            window_start: None,
        }
    }

    /// Record one restart at `now`.
    pub fn step(&mut self, now: Instant) -> Result<(), PoolError> {
        let seen = self.count;
        match (self.window_start, self.max_restarts) {
            (Some(start), _) if now.saturating_duration_since(start) >= self.window => {
                self.window_start = Some(now);
                self.count = 0;
            }
            (_, Some(max)) if max > 0 && self.count >= max && self.count > 0 => {
                // Reset so a caller that survives the error starts afresh.
                self.count = 0;
                return Err(PoolError::RestartFreqExceeded {
                    restarts: seen,
                    window: self.window,
                });
            }
            _ => {}
        }
        if self.window_start.is_none() {
            self.window_start = Some(now);
        }
        self.count += 1;
        Ok(())
    }

    /// Forget counted restarts; the window keeps its start.
    pub fn reset(&mut self) {
        self.count = 0;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

/// Crashes tolerated per worker per second while the pool warms up.
const WARMUP_RESTARTS_PER_WORKER: usize = 10;

/// The pool's two restart budgets: a wide one for the warm-up ticks after
/// start, and the configured one afterwards.
#[derive(Debug, Clone)]
pub(crate) struct RestartBudget {
    warmup: RestartState,
    configured: RestartState,
}

impl RestartBudget {
    pub(crate) fn new(processes: usize, max_restarts: Option<usize>, window: Duration) -> Self {
        Self {
            warmup: RestartState::new(
                Some(WARMUP_RESTARTS_PER_WORKER * processes.max(1)),
                Duration::from_secs(1),
            ),
            configured: RestartState::new(max_restarts, window),
        }
    }

    /// Count one abnormal exit against the budget in force.
    pub(crate) fn record(&mut self, warm: bool, now: Instant) -> Result<(), PoolError> {
        if warm {
            self.warmup.step(now)
        } else {
            self.configured.step(now)
        }
    }

    /// A worker accepted a task; forget crashes seen during warm-up.
    pub(crate) fn task_accepted(&mut self) {
        self.warmup.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_crash_in_window_is_fatal() {
        let mut state = RestartState::new(Some(1), Duration::from_secs(60));
        let t0 = Instant::now();
        state.step(t0).unwrap();
        let err = state.step(t0 + Duration::from_secs(1)).unwrap_err();
        assert!(matches!(
            err,
            PoolError::RestartFreqExceeded { restarts: 1, .. }
        ));
    }

    #[test]
    fn test_window_expiry_resets_count() {
        let mut state = RestartState::new(Some(2), Duration::from_secs(1));
        let t0 = Instant::now();
        state.step(t0).unwrap();
        state.step(t0 + Duration::from_millis(100)).unwrap();
        assert_eq!(state.count(), 2);
        // Window over: counting starts again.
        state.step(t0 + Duration::from_secs(2)).unwrap();
        assert_eq!(state.count(), 1);
        state.step(t0 + Duration::from_millis(2100)).unwrap();
        assert!(state.step(t0 + Duration::from_millis(2200)).is_err());
    }

    #[test]
    fn test_unlimited_never_fails() {
        let mut state = RestartState::new(None, Duration::from_secs(1));
        let t0 = Instant::now();
        for i in 0..1000 {
            state.step(t0 + Duration::from_micros(i)).unwrap();
        }
        assert_eq!(state.count(), 1000);
    }

    #[test]
    fn test_reset_clears_pressure() {
        let mut state = RestartState::new(Some(1), Duration::from_secs(60));
        let t0 = Instant::now();
        state.step(t0).unwrap();
        state.reset();
        state.step(t0 + Duration::from_secs(1)).unwrap();
        assert!(state.step(t0 + Duration::from_secs(2)).is_err());
    }

    #[test]
    fn test_error_resets_for_survivors() {
        let mut state = RestartState::new(Some(1), Duration::from_secs(60));
        let t0 = Instant::now();
        state.step(t0).unwrap();
        assert!(state.step(t0).is_err());
        assert_eq!(state.count(), 0);
        state.step(t0).unwrap();
    }

    #[test]
    fn test_warmup_tolerates_crash_burst() {
        let mut budget = RestartBudget::new(2, Some(1), Duration::from_secs(60));
        let t0 = Instant::now();
        // Twenty crashes inside one second fit the warm-up budget of two workers.
        for i in 0..20 {
            budget.record(true, t0 + Duration::from_millis(i * 10)).unwrap();
        }
        assert!(matches!(
            budget.record(true, t0 + Duration::from_millis(300)),
            Err(PoolError::RestartFreqExceeded { restarts: 20, .. })
        ));
    }

    #[test]
    fn test_configured_budget_applies_after_warmup() {
        let mut budget = RestartBudget::new(1, Some(1), Duration::from_secs(60));
        let t0 = Instant::now();
        for i in 0..5 {
            budget.record(true, t0 + Duration::from_millis(i)).unwrap();
        }
        // Warm-up crashes do not count against the configured budget.
        let t1 = t0 + Duration::from_secs(5);
        budget.record(false, t1).unwrap();
        assert!(matches!(
            budget.record(false, t1 + Duration::from_secs(1)),
            Err(PoolError::RestartFreqExceeded { restarts: 1, .. })
        ));
    }

    #[test]
    fn test_accepted_task_resets_warmup_only() {
        let mut budget = RestartBudget::new(1, Some(1), Duration::from_secs(60));
        let t0 = Instant::now();
        for i in 0..10 {
            budget.record(true, t0 + Duration::from_millis(i)).unwrap();
        }
        budget.task_accepted();
        for i in 0..10 {
            budget.record(true, t0 + Duration::from_millis(20 + i)).unwrap();
        }

        budget.record(false, t0).unwrap();
        budget.task_accepted();
        assert!(budget.record(false, t0 + Duration::from_secs(1)).is_err());
    }
}
