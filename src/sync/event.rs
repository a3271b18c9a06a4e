//! One-shot/resettable event flag.

use super::{Condition, Semaphore};
use crate::error::SyncError;
use crate::heap::Heap;
use std::sync::Arc;
use std::time::Duration;

/// A process-shared event: a [`Condition`] plus a binary flag semaphore.
pub struct Event {
    cond: Condition,
    flag: Semaphore,
}

impl Event {
    pub fn new(heap: &Arc<Heap>) -> Result<Self, SyncError> {
        Ok(Self {
            cond: Condition::new(heap)?,
            flag: Semaphore::new(heap, 0)?,
        })
    }

    pub fn is_set(&self) -> Result<bool, SyncError> {
        let _guard = self.cond.lock()?;
        self.peek()
    }

    pub fn set(&self) -> Result<(), SyncError> {
        let _guard = self.cond.lock()?;
        self.flag.try_acquire()?;
        self.flag.release()?;
        self.cond.notify_all()
    }

    pub fn clear(&self) -> Result<(), SyncError> {
        let _guard = self.cond.lock()?;
        self.flag.try_acquire()?;
        Ok(())
    }

    /// Block until the flag is set or `timeout` elapses; returns the flag.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool, SyncError> {
        let _guard = self.cond.lock()?;
        if !self.peek()? {
            self.cond.wait(timeout)?;
        }
        self.peek()
    }

    /// Test the flag without consuming it. Caller holds the condition lock.
    fn peek(&self) -> Result<bool, SyncError> {
        if self.flag.try_acquire()? {
            self.flag.release()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::wait::{WaitStatus, waitpid};
    use nix::unistd::{ForkResult, fork};
    use std::thread;

    #[test]
    fn test_set_and_clear() {
        let heap = Arc::new(Heap::new());
        let event = Event::new(&heap).unwrap();
        assert!(!event.is_set().unwrap());
        event.set().unwrap();
        event.set().unwrap();
        assert!(event.is_set().unwrap());
        assert!(event.wait(Some(Duration::ZERO)).unwrap());
        event.clear().unwrap();
        assert!(!event.is_set().unwrap());
        assert!(!event.wait(Some(Duration::from_millis(10))).unwrap());
    }

    #[test]
    fn test_wait_wakes_on_set_from_thread() {
        let heap = Arc::new(Heap::new());
        let event = Arc::new(Event::new(&heap).unwrap());
        let setter = {
            let event = Arc::clone(&event);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                event.set().unwrap();
            })
        };
        assert!(event.wait(Some(Duration::from_secs(5))).unwrap());
        setter.join().unwrap();
    }

    #[test]
    fn test_set_in_child_is_seen_by_parent() {
        let heap = Arc::new(Heap::new());
        let event = Event::new(&heap).unwrap();

        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                let code = if event.set().is_ok() { 0 } else { 1 };
                unsafe { libc::_exit(code) };
            }
            ForkResult::Parent { child } => {
                assert!(matches!(
                    waitpid(child, None).unwrap(),
                    WaitStatus::Exited(_, 0)
                ));
                assert!(event.is_set().unwrap());
            }
        }
    }
}
