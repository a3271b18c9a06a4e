//! Process-shared synchronization primitives.
//!
//! Every primitive wraps POSIX unnamed semaphores (`sem_init` with
//! `pshared = 1`) that live in blocks of the shared [`Heap`]. Because the
//! heap's arenas are `MAP_SHARED`, a primitive created before `fork()` keeps
//! working across the parent and all of its children.
//!
//! Ownership of the mutex types is recorded next to the semaphore in shared
//! memory as a `(pid, thread)` token, so ownership checks are meaningful in
//! every process.

mod condition;
mod event;
mod mutex;
mod semaphore;

pub use condition::Condition;
pub use event::Event;
pub use mutex::{Mutex, MutexGuard, RecursiveMutex, RecursiveMutexGuard};
pub use semaphore::Semaphore;

use crate::error::SyncError;
use crate::heap::{ALIGNMENT, Heap, SharedBlock};
use nix::unistd::{Pid, getpid};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

/// Layout of one semaphore slot in the shared heap.
#[repr(C)]
struct SemSlot {
    sem: libc::sem_t,
    owner: AtomicU64,
    depth: AtomicU32,
    _reserved: u32,
}

const _: () = assert!(std::mem::align_of::<SemSlot>() <= ALIGNMENT);

static NEXT_THREAD_TOKEN: AtomicU32 = AtomicU32::new(1);

thread_local! {
    static THREAD_TOKEN: u32 = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
}

/// Owner token of the calling thread: pid in the high half, a per-thread
/// counter in the low half. Zero means "unowned".
fn current_owner() -> u64 {
    let pid = getpid().as_raw() as u32 as u64;
    (pid << 32) | THREAD_TOKEN.with(|t| *t) as u64
}

fn owner_pid(token: u64) -> Option<Pid> {
    (token != 0).then(|| Pid::from_raw((token >> 32) as i32))
}

/// One OS counting semaphore plus owner bookkeeping, stored in a heap block.
pub(crate) struct SemHandle {
    block: SharedBlock,
}

impl SemHandle {
    pub(crate) fn new(heap: &Arc<Heap>, value: u32) -> Result<Self, SyncError> {
        let block = SharedBlock::new(heap, std::mem::size_of::<SemSlot>())?;
        let slot = block.as_ptr() as *mut SemSlot;
        // Safety: the block is zeroed, large enough and suitably aligned for a
        // SemSlot; zero is a valid bit pattern for the atomics.
        let rc = unsafe { libc::sem_init(std::ptr::addr_of_mut!((*slot).sem), 1, value) };
        if rc != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(Self { block })
    }

    fn slot(&self) -> *mut SemSlot {
        self.block.as_ptr() as *mut SemSlot
    }

    fn sem(&self) -> *mut libc::sem_t {
        // Safety: `slot` points at an initialized SemSlot.
        unsafe { std::ptr::addr_of_mut!((*self.slot()).sem) }
    }

    pub(crate) fn owner(&self) -> &AtomicU64 {
        // Safety: the atomic lives as long as the block.
        unsafe { &*std::ptr::addr_of!((*self.slot()).owner) }
    }

    pub(crate) fn depth(&self) -> &AtomicU32 {
        // Safety: as above.
        unsafe { &*std::ptr::addr_of!((*self.slot()).depth) }
    }

    pub(crate) fn is_mine(&self) -> bool {
        self.owner().load(Ordering::SeqCst) == current_owner()
    }

    /// Decrement, blocking up to `timeout` (forever on `None`).
    ///
    /// Returns `false` if the timeout elapsed first.
    pub(crate) fn wait(&self, timeout: Option<Duration>) -> Result<bool, SyncError> {
        match timeout {
            Some(d) if d.is_zero() => self.try_wait(),
            Some(d) => self.timed_wait(d),
            None => loop {
                // Safety: initialized semaphore.
                if unsafe { libc::sem_wait(self.sem()) } == 0 {
                    return Ok(true);
                }
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::EINTR) {
                    return Err(err.into());
                }
            },
        }
    }

    pub(crate) fn try_wait(&self) -> Result<bool, SyncError> {
        loop {
            // Safety: initialized semaphore.
            if unsafe { libc::sem_trywait(self.sem()) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) => return Ok(false),
                Some(libc::EINTR) => continue,
                _ => return Err(err.into()),
            }
        }
    }

    fn timed_wait(&self, timeout: Duration) -> Result<bool, SyncError> {
        let deadline = realtime_deadline(timeout);
        loop {
            // Safety: initialized semaphore, valid timespec.
            if unsafe { libc::sem_timedwait(self.sem(), &deadline) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::ETIMEDOUT) => return Ok(false),
                Some(libc::EINTR) => continue,
                _ => return Err(err.into()),
            }
        }
    }

    pub(crate) fn post(&self) -> Result<(), SyncError> {
        // Safety: initialized semaphore.
        if unsafe { libc::sem_post(self.sem()) } == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error().into())
        }
    }

    pub(crate) fn value(&self) -> Result<usize, SyncError> {
        let mut value: libc::c_int = 0;
        // Safety: initialized semaphore, valid out pointer.
        if unsafe { libc::sem_getvalue(self.sem(), &mut value) } == 0 {
            Ok(value.max(0) as usize)
        } else {
            Err(io::Error::last_os_error().into())
        }
    }
}

impl Drop for SemHandle {
    fn drop(&mut self) {
        // Forked children never tear down semaphores the parent still uses.
        if getpid() == self.block.owner() {
            // Safety: initialized semaphore, no longer reachable from Rust.
            unsafe { libc::sem_destroy(self.sem()) };
        }
    }
}

/// Absolute CLOCK_REALTIME deadline `timeout` from now, as `sem_timedwait` wants.
fn realtime_deadline(timeout: Duration) -> libc::timespec {
    // Safety: timespec is plain old data.
    let mut now: libc::timespec = unsafe { std::mem::zeroed() };
    // Safety: valid clock id and out pointer.
    unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) };

    let nanos = now.tv_nsec as u64 + timeout.subsec_nanos() as u64;
    let secs = (now.tv_sec as u64)
        .saturating_add(timeout.as_secs())
        .saturating_add(nanos / 1_000_000_000);

    // Safety: as above.
    let mut deadline: libc::timespec = unsafe { std::mem::zeroed() };
    deadline.tv_sec = secs.min(libc::time_t::MAX as u64) as libc::time_t;
    deadline.tv_nsec = (nanos % 1_000_000_000) as _;
    deadline
}
