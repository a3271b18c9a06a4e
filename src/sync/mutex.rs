//! Non-recursive and recursive process-shared mutexes.

use super::{SemHandle, current_owner, owner_pid};
use crate::error::SyncError;
use crate::heap::Heap;
use nix::unistd::Pid;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

/// A process-shared mutex: a semaphore with an initial and maximum value of 1.
pub struct Mutex {
    sem: SemHandle,
}

impl Mutex {
    pub fn new(heap: &Arc<Heap>) -> Result<Self, SyncError> {
        Ok(Self {
            sem: SemHandle::new(heap, 1)?,
        })
    }

    /// Acquire the mutex, waiting up to `timeout` (forever on `None`).
    ///
    /// Returns `Ok(false)` on timeout and [`SyncError::AlreadyHeld`] if the
    /// calling thread already owns it.
    pub fn acquire(&self, timeout: Option<Duration>) -> Result<bool, SyncError> {
        if self.sem.is_mine() {
            return Err(SyncError::AlreadyHeld);
        }
        if !self.sem.wait(timeout)? {
            return Ok(false);
        }
        self.sem.owner().store(current_owner(), Ordering::SeqCst);
        Ok(true)
    }

    pub fn try_acquire(&self) -> Result<bool, SyncError> {
        self.acquire(Some(Duration::ZERO))
    }

    pub fn release(&self) -> Result<(), SyncError> {
        if !self.sem.is_mine() {
            return Err(SyncError::NotOwner);
        }
        self.sem.owner().store(0, Ordering::SeqCst);
        self.sem.post()
    }

    /// Block until acquired and return a guard that releases on drop.
    pub fn lock(&self) -> Result<MutexGuard<'_>, SyncError> {
        self.acquire(None)?;
        Ok(MutexGuard { mutex: self })
    }

    pub fn is_mine(&self) -> bool {
        self.sem.is_mine()
    }

    /// Pid of the process currently holding the mutex.
    pub fn owner_pid(&self) -> Option<Pid> {
        owner_pid(self.sem.owner().load(Ordering::SeqCst))
    }

    /// Release the mutex on behalf of `pid` if that process holds it.
    ///
    /// Only meaningful once `pid` is known to be dead and reaped.
    pub fn force_release(&self, pid: Pid) -> Result<bool, SyncError> {
        let token = self.sem.owner().load(Ordering::SeqCst);
        if owner_pid(token) != Some(pid) {
            return Ok(false);
        }
        if self
            .sem
            .owner()
            .compare_exchange(token, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(false);
        }
        self.sem.post()?;
        Ok(true)
    }
}

/// Releases a [`Mutex`] when dropped.
pub struct MutexGuard<'a> {
    mutex: &'a Mutex,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        let _ = self.mutex.release();
    }
}

/// A process-shared mutex that the owning thread may re-acquire.
pub struct RecursiveMutex {
    sem: SemHandle,
}

impl RecursiveMutex {
    pub fn new(heap: &Arc<Heap>) -> Result<Self, SyncError> {
        Ok(Self {
            sem: SemHandle::new(heap, 1)?,
        })
    }

    pub fn acquire(&self, timeout: Option<Duration>) -> Result<bool, SyncError> {
        if self.sem.is_mine() {
            self.sem.depth().fetch_add(1, Ordering::SeqCst);
            return Ok(true);
        }
        if !self.sem.wait(timeout)? {
            return Ok(false);
        }
        self.sem.owner().store(current_owner(), Ordering::SeqCst);
        self.sem.depth().store(1, Ordering::SeqCst);
        Ok(true)
    }

    pub fn try_acquire(&self) -> Result<bool, SyncError> {
        self.acquire(Some(Duration::ZERO))
    }

    pub fn release(&self) -> Result<(), SyncError> {
        if !self.sem.is_mine() {
            return Err(SyncError::NotOwner);
        }
        if self.sem.depth().fetch_sub(1, Ordering::SeqCst) == 1 {
            self.sem.owner().store(0, Ordering::SeqCst);
            self.sem.post()?;
        }
        Ok(())
    }

    pub fn lock(&self) -> Result<RecursiveMutexGuard<'_>, SyncError> {
        self.acquire(None)?;
        Ok(RecursiveMutexGuard { mutex: self })
    }

    pub fn is_mine(&self) -> bool {
        self.sem.is_mine()
    }

    /// Recursion depth held by the calling thread (0 if not the owner).
    pub fn depth(&self) -> u32 {
        if self.sem.is_mine() {
            self.sem.depth().load(Ordering::SeqCst)
        } else {
            0
        }
    }

    /// Drop every level of ownership at once, returning the depth released.
    pub(crate) fn release_all(&self) -> Result<u32, SyncError> {
        if !self.sem.is_mine() {
            return Err(SyncError::NotOwner);
        }
        let depth = self.sem.depth().swap(0, Ordering::SeqCst);
        self.sem.owner().store(0, Ordering::SeqCst);
        self.sem.post()?;
        Ok(depth)
    }

    /// Re-acquire ownership at a depth previously returned by `release_all`.
    pub(crate) fn restore(&self, depth: u32) -> Result<(), SyncError> {
        self.sem.wait(None)?;
        self.sem.owner().store(current_owner(), Ordering::SeqCst);
        self.sem.depth().store(depth, Ordering::SeqCst);
        Ok(())
    }
}

/// Releases one level of a [`RecursiveMutex`] when dropped.
pub struct RecursiveMutexGuard<'a> {
    mutex: &'a RecursiveMutex,
}

impl Drop for RecursiveMutexGuard<'_> {
    fn drop(&mut self) {
        let _ = self.mutex.release();
    }
}
