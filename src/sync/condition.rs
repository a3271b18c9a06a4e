//! Condition variable built from three counting semaphores.

use super::{RecursiveMutex, RecursiveMutexGuard, Semaphore};
use crate::error::SyncError;
use crate::heap::Heap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A process-shared condition variable with its own recursive lock.
///
/// `sleeping` counts waiters that announced themselves, `woken` counts
/// waiters that returned from the gate (by notification or timeout), and
/// `wait_gate` is what a notifier releases to let one sleeper through.
pub struct Condition {
    lock: RecursiveMutex,
    sleeping: Semaphore,
    woken: Semaphore,
    wait_gate: Semaphore,
}

impl Condition {
    pub fn new(heap: &Arc<Heap>) -> Result<Self, SyncError> {
        Ok(Self {
            lock: RecursiveMutex::new(heap)?,
            sleeping: Semaphore::new(heap, 0)?,
            woken: Semaphore::new(heap, 0)?,
            wait_gate: Semaphore::new(heap, 0)?,
        })
    }

    pub fn acquire(&self, timeout: Option<Duration>) -> Result<bool, SyncError> {
        self.lock.acquire(timeout)
    }

    pub fn release(&self) -> Result<(), SyncError> {
        self.lock.release()
    }

    pub fn lock(&self) -> Result<RecursiveMutexGuard<'_>, SyncError> {
        self.lock.lock()
    }

    /// Wait for a notification, releasing the lock meanwhile.
    ///
    /// The caller must hold the lock; it is re-acquired at the same depth
    /// before returning. Returns `false` on timeout.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool, SyncError> {
        if !self.lock.is_mine() {
            return Err(SyncError::NotOwner);
        }

        self.sleeping.release()?;
        let depth = self.lock.release_all()?;

        let notified = self.wait_gate.acquire(timeout);

        // Always account for waking and take the lock back, even on error.
        let woke = self.woken.release();
        self.lock.restore(depth)?;
        woke?;
        notified
    }

    /// Wait until `predicate` holds or `timeout` elapses.
    pub fn wait_for<F>(&self, mut predicate: F, timeout: Option<Duration>) -> Result<bool, SyncError>
    where
        F: FnMut() -> bool,
    {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut result = predicate();
        while !result {
            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    Some(deadline - now)
                }
                None => None,
            };
            self.wait(remaining)?;
            result = predicate();
        }
        Ok(result)
    }

    /// Wake up to `n` waiters.
    pub fn notify(&self, n: usize) -> Result<(), SyncError> {
        if !self.lock.is_mine() {
            return Err(SyncError::NotOwner);
        }

        // Waiters that timed out since the last notify already bumped
        // `woken`; cancel them against `sleeping`.
        while self.woken.try_acquire()? {
            let had_sleeper = self.sleeping.try_acquire()?;
            debug_assert!(had_sleeper, "woken count exceeded sleeping count");
        }

        let mut sleepers = 0;
        while sleepers < n && self.sleeping.try_acquire()? {
            self.wait_gate.release()?;
            sleepers += 1;
        }

        if sleepers > 0 {
            for _ in 0..sleepers {
                self.woken.acquire(None)?;
            }
            // A sleeper that timed out concurrently leaves a stray gate permit.
            while self.wait_gate.try_acquire()? {}
        }
        Ok(())
    }

    pub fn notify_all(&self) -> Result<(), SyncError> {
        self.notify(usize::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    #[test]
    fn test_wait_requires_lock() {
        let heap = Arc::new(Heap::new());
        let cond = Condition::new(&heap).unwrap();
        assert!(matches!(
            cond.wait(Some(Duration::from_millis(1))),
            Err(SyncError::NotOwner)
        ));
        assert!(matches!(cond.notify(1), Err(SyncError::NotOwner)));
    }

    #[test]
    fn test_wait_times_out_and_keeps_depth() {
        let heap = Arc::new(Heap::new());
        let cond = Arc::new(Condition::new(&heap).unwrap());
        {
            let _g1 = cond.lock().unwrap();
            let _g2 = cond.lock().unwrap();
            assert!(!cond.wait(Some(Duration::from_millis(20))).unwrap());
            assert_eq!(cond.lock.depth(), 2);
        }

        // A later waiter still gets the single notification.
        let waiter = {
            let cond = Arc::clone(&cond);
            thread::spawn(move || {
                let _guard = cond.lock().unwrap();
                cond.wait(Some(Duration::from_secs(5))).unwrap()
            })
        };
        let deadline = Instant::now() + Duration::from_secs(5);
        while cond.sleeping.value().unwrap() < 2 {
            assert!(Instant::now() < deadline, "second waiter never slept");
            thread::sleep(Duration::from_millis(5));
        }
        {
            let _guard = cond.lock().unwrap();
            cond.notify(1).unwrap();
        }
        assert!(waiter.join().unwrap(), "notification was lost");
    }

    #[test]
    fn test_notify_wakes_waiter() {
        let heap = Arc::new(Heap::new());
        let cond = Arc::new(Condition::new(&heap).unwrap());
        let ready = Arc::new(AtomicBool::new(false));

        let waiter = {
            let cond = Arc::clone(&cond);
            let ready = Arc::clone(&ready);
            thread::spawn(move || {
                let _guard = cond.lock().unwrap();
                cond.wait_for(|| ready.load(Ordering::SeqCst), Some(Duration::from_secs(5)))
                    .unwrap()
            })
        };

        thread::sleep(Duration::from_millis(20));
        {
            let _guard = cond.lock().unwrap();
            ready.store(true, Ordering::SeqCst);
            cond.notify_all().unwrap();
        }
        assert!(waiter.join().unwrap());
    }
}
