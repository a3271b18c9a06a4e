//! Counting semaphores.

use super::SemHandle;
use crate::error::SyncError;
use crate::heap::Heap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BoundKind {
    Unbounded,
    /// Releasing past the maximum is an error.
    Strict,
    /// Releasing past the maximum is silently ignored.
    Lax,
}

/// A process-shared counting semaphore.
///
/// Three flavours share one type: unbounded, strictly bounded, and lax
/// bounded. The lax flavour backs the pool's submission slots, whose capacity
/// changes at runtime through [`Semaphore::grow`] and [`Semaphore::shrink`].
pub struct Semaphore {
    sem: SemHandle,
    kind: BoundKind,
    max: AtomicUsize,
    /// Permits removed by `shrink` that were in use at the time; later
    /// releases pay these back instead of posting.
    owed: AtomicUsize,
}

impl Semaphore {
    /// Unbounded semaphore starting at `value`.
    pub fn new(heap: &Arc<Heap>, value: u32) -> Result<Self, SyncError> {
        Self::build(heap, value, BoundKind::Unbounded)
    }

    /// Semaphore whose value may never be released above `value`.
    pub fn bounded(heap: &Arc<Heap>, value: u32) -> Result<Self, SyncError> {
        Self::build(heap, value, BoundKind::Strict)
    }

    /// Bounded semaphore that ignores releases past its maximum.
    pub fn lax_bounded(heap: &Arc<Heap>, value: u32) -> Result<Self, SyncError> {
        Self::build(heap, value, BoundKind::Lax)
    }

    fn build(heap: &Arc<Heap>, value: u32, kind: BoundKind) -> Result<Self, SyncError> {
        Ok(Self {
            sem: SemHandle::new(heap, value)?,
            kind,
            max: AtomicUsize::new(value as usize),
            owed: AtomicUsize::new(0),
        })
    }

    /// Take one permit, waiting up to `timeout` (forever on `None`).
    pub fn acquire(&self, timeout: Option<Duration>) -> Result<bool, SyncError> {
        self.sem.wait(timeout)
    }

    pub fn try_acquire(&self) -> Result<bool, SyncError> {
        self.sem.try_wait()
    }

    /// Return one permit.
    pub fn release(&self) -> Result<(), SyncError> {
        if self
            .owed
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Ok(());
        }
        match self.kind {
            BoundKind::Unbounded => self.sem.post(),
            BoundKind::Strict => {
                if self.sem.value()? >= self.max.load(Ordering::SeqCst) {
                    return Err(SyncError::ReleasedTooManyTimes);
                }
                self.sem.post()
            }
            BoundKind::Lax => {
                if self.sem.value()? >= self.max.load(Ordering::SeqCst) {
                    return Ok(());
                }
                self.sem.post()
            }
        }
    }

    /// Current number of available permits.
    pub fn value(&self) -> Result<usize, SyncError> {
        self.sem.value()
    }

    /// Configured maximum, `None` for unbounded semaphores.
    pub fn max_value(&self) -> Option<usize> {
        (self.kind != BoundKind::Unbounded).then(|| self.max.load(Ordering::SeqCst))
    }

    /// Raise the capacity by `n` and make `n` more permits available.
    pub fn grow(&self, n: usize) -> Result<(), SyncError> {
        self.max.fetch_add(n, Ordering::SeqCst);
        for _ in 0..n {
            if self
                .owed
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |o| o.checked_sub(1))
                .is_err()
            {
                self.sem.post()?;
            }
        }
        Ok(())
    }

    /// Lower the capacity by `n`.
    ///
    /// Free permits are taken immediately; permits currently held are
    /// swallowed by the next releases.
    pub fn shrink(&self, n: usize) -> Result<(), SyncError> {
        let _ = self
            .max
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |m| {
                Some(m.saturating_sub(n))
            });
        for _ in 0..n {
            if !self.sem.try_wait()? {
                self.owed.fetch_add(1, Ordering::SeqCst);
            }
        }
        Ok(())
    }
}
