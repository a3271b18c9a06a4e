//! Shared-memory arena allocator.
//!
//! Blocks are carved out of file-backed `MAP_SHARED` mappings, so anything
//! allocated before a `fork()` is the same physical memory in the parent and
//! every child. The process-shared synchronization primitives in
//! [`crate::sync`] live in these blocks.
//!
//! Bookkeeping follows a classic best-fit scheme:
//!
//! - free blocks are indexed by length (for best-fit lookup) and by their
//!   start/stop offsets (for O(1) coalescing with neighbours);
//! - allocated blocks live in a per-arena allocated set.
//!
//! A block is either free (present in both free indexes) or allocated, never
//! both. Blocks are plain `(arena, start, stop)` handles; turning one into an
//! address always goes through a lookup in the allocated set.

use crate::error::HeapError;
use crossbeam_queue::SegQueue;
use memmap2::MmapMut;
use nix::unistd::{Pid, getpid};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use tracing::{debug, warn};

/// Allocation granularity in bytes.
pub const ALIGNMENT: usize = 8;

/// Size of the first arena mapped by [`Heap::new`].
pub const DEFAULT_ARENA_SIZE: usize = 64 * 1024;

/// Requests above this size are rejected outright.
pub const MAX_ALLOCATION: usize = 1 << 40;

/// Arena sizes double until they reach this size.
const DOUBLE_ARENA_SIZE_UNTIL: usize = 4 * 1024 * 1024;

/// Fully free arenas larger than this are unmapped instead of kept around.
const DISCARD_FREE_SPACE_LARGER_THAN: usize = 4 * 1024 * 1024;

/// Prefer a memory-backed filesystem for arena files when one has room.
const SHM_DIR: &str = "/dev/shm";

/// A contiguous sub-range of an arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Block {
    /// Index of the owning arena.
    pub arena: usize,
    /// First byte offset (inclusive).
    pub start: usize,
    /// Last byte offset (exclusive).
    pub stop: usize,
}

impl Block {
    /// Number of bytes covered by this block.
    pub fn size(&self) -> usize {
        self.stop - self.start
    }
}

/// Usage summary for one arena.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArenaStats {
    pub index: usize,
    pub size: usize,
    pub allocated: usize,
    pub free: usize,
    pub free_blocks: usize,
}

/// A single memory-mapped region.
struct Arena {
    map: MmapMut,
    size: usize,
    _file: File,
}

#[derive(Default)]
struct HeapState {
    arenas: Vec<Option<Arena>>,
    next_size: usize,
    /// Free blocks keyed by length, for best-fit search.
    free_by_len: BTreeMap<usize, Vec<Block>>,
    /// Free blocks keyed by `(arena, start)`.
    start_to_block: HashMap<(usize, usize), Block>,
    /// Free blocks keyed by `(arena, stop)`.
    stop_to_block: HashMap<(usize, usize), Block>,
    /// Allocated `(start, stop)` ranges per arena.
    allocated: HashMap<usize, HashSet<(usize, usize)>>,
}

/// Arena allocator over shared mappings.
pub struct Heap {
    state: Mutex<HeapState>,
    /// Blocks whose `free()` could not take the lock immediately.
    pending_free: SegQueue<Block>,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    /// Create a heap whose first arena is [`DEFAULT_ARENA_SIZE`] bytes.
    pub fn new() -> Self {
        Self::with_arena_size(DEFAULT_ARENA_SIZE)
    }

    /// Create a heap with a custom first-arena size.
    ///
    /// No memory is mapped until the first allocation.
    pub fn with_arena_size(size: usize) -> Self {
        Self {
            state: Mutex::new(HeapState {
                next_size: size.max(page_size()),
                ..HeapState::default()
            }),
            pending_free: SegQueue::new(),
        }
    }

    /// Allocate a block of at least `size` bytes.
    ///
    /// The size is rounded up to [`ALIGNMENT`]; zero-byte requests get one
    /// aligned unit.
    pub fn allocate(&self, size: usize) -> Result<Block, HeapError> {
        if size > MAX_ALLOCATION {
            return Err(HeapError::InvalidSize(size));
        }
        let size = round_up(size.max(1), ALIGNMENT);

        let mut state = self.lock();
        self.drain_pending(&mut state);

        let block = match state.take_free(size) {
            Some(block) => block,
            None => state.new_arena(size)?,
        };

        let real_stop = block.start + size;
        if real_stop < block.stop {
            state.insert_free(Block {
                arena: block.arena,
                start: real_stop,
                stop: block.stop,
            });
        }
        state
            .allocated
            .entry(block.arena)
            .or_default()
            .insert((block.start, real_stop));

        Ok(Block {
            arena: block.arena,
            start: block.start,
            stop: real_stop,
        })
    }

    /// Return a block to the heap.
    ///
    /// If the heap lock is contended the block is parked on a pending list and
    /// reclaimed by the next call that does get the lock; in that case an
    /// unknown block is only reported through the log.
    pub fn free(&self, block: Block) -> Result<(), HeapError> {
        let mut state = match self.state.try_lock() {
            Ok(state) => state,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                self.pending_free.push(block);
                return Ok(());
            }
        };
        self.drain_pending(&mut state);
        state.release(block)
    }

    /// Resolve a block handle to its address.
    ///
    /// Fails unless the block is currently allocated.
    pub fn address(&self, block: &Block) -> Result<NonNull<u8>, HeapError> {
        let mut state = self.lock();
        let known = state
            .allocated
            .get(&block.arena)
            .is_some_and(|set| set.contains(&(block.start, block.stop)));
        let arena = state
            .arenas
            .get_mut(block.arena)
            .and_then(Option::as_mut)
            .filter(|_| known)
            .ok_or(HeapError::UnknownBlock {
                arena: block.arena,
                start: block.start,
                stop: block.stop,
            })?;
        // Safety: the block lies inside the arena; allocated ranges are always
        // within `0..arena.size`.
        let ptr = unsafe { arena.map.as_mut_ptr().add(block.start) };
        NonNull::new(ptr).ok_or(HeapError::UnknownBlock {
            arena: block.arena,
            start: block.start,
            stop: block.stop,
        })
    }

    /// Per-arena usage, skipping discarded arenas.
    pub fn stats(&self) -> Vec<ArenaStats> {
        let state = self.lock();
        state
            .arenas
            .iter()
            .enumerate()
            .filter_map(|(index, arena)| {
                let arena = arena.as_ref()?;
                let allocated = state
                    .allocated
                    .get(&index)
                    .map(|set| set.iter().map(|(s, e)| e - s).sum())
                    .unwrap_or(0);
                let free_blocks: Vec<&Block> = state
                    .start_to_block
                    .values()
                    .filter(|b| b.arena == index)
                    .collect();
                Some(ArenaStats {
                    index,
                    size: arena.size,
                    allocated,
                    free: free_blocks.iter().map(|b| b.size()).sum(),
                    free_blocks: free_blocks.len(),
                })
            })
            .collect()
    }

    /// Number of frees waiting for the heap lock.
    pub fn pending_frees(&self) -> usize {
        self.pending_free.len()
    }

    fn lock(&self) -> MutexGuard<'_, HeapState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn drain_pending(&self, state: &mut HeapState) {
        while let Some(block) = self.pending_free.pop() {
            if let Err(e) = state.release(block) {
                warn!(error = %e, "Dropping deferred free of unknown block");
            }
        }
    }
}

impl HeapState {
    /// Pop the smallest free block that can hold `size` bytes.
    fn take_free(&mut self, size: usize) -> Option<Block> {
        let length = *self.free_by_len.range(size..).next()?.0;
        let seq = self.free_by_len.get_mut(&length)?;
        let block = seq.pop()?;
        if seq.is_empty() {
            self.free_by_len.remove(&length);
        }
        self.start_to_block.remove(&(block.arena, block.start));
        self.stop_to_block.remove(&(block.arena, block.stop));
        Some(block)
    }

    fn insert_free(&mut self, block: Block) {
        self.free_by_len.entry(block.size()).or_default().push(block);
        self.start_to_block.insert((block.arena, block.start), block);
        self.stop_to_block.insert((block.arena, block.stop), block);
    }

    /// Remove a free block from every free index.
    fn absorb(&mut self, block: Block) {
        self.start_to_block.remove(&(block.arena, block.start));
        self.stop_to_block.remove(&(block.arena, block.stop));
        let length = block.size();
        if let Some(seq) = self.free_by_len.get_mut(&length) {
            if let Some(pos) = seq.iter().position(|b| *b == block) {
                seq.swap_remove(pos);
            }
            if seq.is_empty() {
                self.free_by_len.remove(&length);
            }
        }
    }

    fn release(&mut self, block: Block) -> Result<(), HeapError> {
        let removed = self
            .allocated
            .get_mut(&block.arena)
            .is_some_and(|set| set.remove(&(block.start, block.stop)));
        if !removed {
            return Err(HeapError::UnknownBlock {
                arena: block.arena,
                start: block.start,
                stop: block.stop,
            });
        }

        let mut merged = block;
        if let Some(prev) = self.stop_to_block.get(&(block.arena, block.start)).copied() {
            self.absorb(prev);
            merged.start = prev.start;
        }
        if let Some(next) = self.start_to_block.get(&(block.arena, block.stop)).copied() {
            self.absorb(next);
            merged.stop = next.stop;
        }

        if self.should_discard(&merged) {
            debug!(arena = merged.arena, size = merged.size(), "Unmapping empty arena");
            self.arenas[merged.arena] = None;
            self.allocated.remove(&merged.arena);
            return Ok(());
        }

        self.insert_free(merged);
        Ok(())
    }

    fn should_discard(&self, block: &Block) -> bool {
        let Some(Some(arena)) = self.arenas.get(block.arena) else {
            return false;
        };
        let live = self.arenas.iter().filter(|a| a.is_some()).count();
        block.start == 0
            && block.stop == arena.size
            && arena.size > DISCARD_FREE_SPACE_LARGER_THAN
            && live > 1
    }

    /// Map a new arena large enough for `size` and return it as one block.
    fn new_arena(&mut self, size: usize) -> Result<Block, HeapError> {
        let length = round_up(size.max(self.next_size), page_size());
        if self.next_size < DOUBLE_ARENA_SIZE_UNTIL {
            self.next_size = self.next_size.saturating_mul(2);
        }

        let file = arena_file(length).map_err(|source| HeapError::OutOfMemory {
            size: length,
            source,
        })?;
        // Safety: the file is private to this heap (unlinked on creation) and
        // is never truncated while mapped.
        let map = unsafe { MmapMut::map_mut(&file) }.map_err(|source| {
            HeapError::OutOfMemory {
                size: length,
                source,
            }
        })?;

        let arena = Arena {
            map,
            size: length,
            _file: file,
        };
        let index = match self.arenas.iter().position(Option::is_none) {
            Some(index) => {
                self.arenas[index] = Some(arena);
                index
            }
            None => {
                self.arenas.push(Some(arena));
                self.arenas.len() - 1
            }
        };
        debug!(arena = index, size = length, "Mapped new arena");

        Ok(Block {
            arena: index,
            start: 0,
            stop: length,
        })
    }
}

/// Create the unlinked backing file for an arena.
fn arena_file(length: usize) -> std::io::Result<File> {
    let file = if shm_has_room(length) {
        tempfile::tempfile_in(SHM_DIR)?
    } else {
        tempfile::tempfile()?
    };
    file.set_len(length as u64)?;
    Ok(file)
}

fn shm_has_room(length: usize) -> bool {
    let dir = Path::new(SHM_DIR);
    if !dir.is_dir() {
        return false;
    }
    match nix::sys::statvfs::statvfs(dir) {
        Ok(st) => (st.blocks_available() as u64).saturating_mul(st.fragment_size() as u64)
            >= length as u64,
        Err(_) => false,
    }
}

fn page_size() -> usize {
    // Safety: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as usize } else { 4096 }
}

fn round_up(n: usize, alignment: usize) -> usize {
    let mask = alignment - 1;
    (n + mask) & !mask
}

/// An allocated block that frees itself on drop.
///
/// Holds its heap alive, so the backing arena stays mapped for as long as the
/// pointer is reachable.
pub struct SharedBlock {
    heap: Arc<Heap>,
    block: Block,
    ptr: NonNull<u8>,
    owner: Pid,
}

// Safety: the pointer targets a shared mapping owned by `heap`; callers only
// touch it through atomics or OS semaphore calls.
unsafe impl Send for SharedBlock {}
unsafe impl Sync for SharedBlock {}

impl SharedBlock {
    /// Allocate and zero a block of `size` bytes.
    pub fn new(heap: &Arc<Heap>, size: usize) -> Result<Self, HeapError> {
        let block = heap.allocate(size)?;
        let ptr = match heap.address(&block) {
            Ok(ptr) => ptr,
            Err(e) => {
                let _ = heap.free(block);
                return Err(e);
            }
        };
        // Safety: freshly allocated, exclusively ours, `block.size()` bytes long.
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, block.size()) };
        Ok(Self {
            heap: Arc::clone(heap),
            block,
            ptr,
            owner: getpid(),
        })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn block(&self) -> Block {
        self.block
    }

    /// Pid of the process that allocated the block.
    pub fn owner(&self) -> Pid {
        self.owner
    }
}

impl Drop for SharedBlock {
    fn drop(&mut self) {
        if getpid() != self.owner {
            return;
        }
        if let Err(e) = self.heap.free(self.block) {
            warn!(error = %e, "Failed to free shared block");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::wait::{WaitStatus, waitpid};
    use nix::unistd::{ForkResult, fork};
    use proptest::prelude::*;

    fn assert_accounted(heap: &Heap) {
        for arena in heap.stats() {
            assert_eq!(
                arena.allocated + arena.free,
                arena.size,
                "arena {} leaks or overlaps bytes",
                arena.index
            );
        }
    }

    #[test]
    fn test_allocate_rounds_to_alignment() {
        let heap = Heap::new();
        let a = heap.allocate(1).unwrap();
        let b = heap.allocate(13).unwrap();
        let c = heap.allocate(0).unwrap();
        assert_eq!(a.size(), 8);
        assert_eq!(b.size(), 16);
        assert_eq!(c.size(), 8);
        assert_eq!(a.start % ALIGNMENT, 0);
        assert_eq!(b.start % ALIGNMENT, 0);
        assert_accounted(&heap);
    }

    #[test]
    fn test_adjacent_frees_coalesce() {
        let heap = Heap::new();
        let a = heap.allocate(64).unwrap();
        let b = heap.allocate(64).unwrap();
        assert_eq!(a.stop, b.start);

        heap.free(a).unwrap();
        heap.free(b).unwrap();

        let stats = heap.stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].free_blocks, 1);
        assert_eq!(stats[0].free, stats[0].size);

        let combined = heap.allocate(128).unwrap();
        assert_eq!(combined.start, a.start);
        assert_eq!(combined.stop, b.stop);
    }

    #[test]
    fn test_best_fit_prefers_smallest_hole() {
        let heap = Heap::new();
        let a = heap.allocate(256).unwrap();
        let _keep1 = heap.allocate(8).unwrap();
        let b = heap.allocate(32).unwrap();
        let _keep2 = heap.allocate(8).unwrap();
        heap.free(a).unwrap();
        heap.free(b).unwrap();

        let c = heap.allocate(24).unwrap();
        assert_eq!(c.start, b.start);
    }

    #[test]
    fn test_invalid_size_rejected() {
        let heap = Heap::new();
        let err = heap.allocate(MAX_ALLOCATION + 1).unwrap_err();
        assert!(matches!(err, HeapError::InvalidSize(_)));
    }

    #[test]
    fn test_double_free_is_unknown_block() {
        let heap = Heap::new();
        let a = heap.allocate(16).unwrap();
        heap.free(a).unwrap();
        assert!(matches!(
            heap.free(a),
            Err(HeapError::UnknownBlock { .. })
        ));
        assert!(heap.address(&a).is_err());
    }

    #[test]
    fn test_growth_maps_new_arena() {
        let heap = Heap::with_arena_size(4096);
        let big = heap.allocate(3 * 4096).unwrap();
        let small = heap.allocate(4000).unwrap();
        let stats = heap.stats();
        assert!(!stats.is_empty());
        assert!(stats.iter().any(|a| a.index == big.arena));
        assert!(stats.iter().any(|a| a.index == small.arena));
        assert_accounted(&heap);
    }

    #[test]
    fn test_contended_free_is_deferred() {
        let heap = Heap::new();
        let a = heap.allocate(32).unwrap();
        {
            let _guard = heap.state.lock().unwrap();
            heap.free(a).unwrap();
            assert_eq!(heap.pending_frees(), 1);
        }
        let _b = heap.allocate(8).unwrap();
        assert_eq!(heap.pending_frees(), 0);
        assert_accounted(&heap);
    }

    #[test]
    fn test_shared_block_visible_across_fork() {
        let heap = Arc::new(Heap::new());
        let block = SharedBlock::new(&heap, 8).unwrap();
        let cell = block.as_ptr() as *mut u64;

        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                unsafe { cell.write_volatile(0xfeed) };
                unsafe { libc::_exit(0) };
            }
            ForkResult::Parent { child } => {
                let status = waitpid(child, None).unwrap();
                assert!(matches!(status, WaitStatus::Exited(_, 0)));
                assert_eq!(unsafe { cell.read_volatile() }, 0xfeed);
            }
        }
    }

    #[test]
    fn test_shared_block_frees_on_drop() {
        let heap = Arc::new(Heap::new());
        let block = SharedBlock::new(&heap, 40).unwrap();
        let handle = block.block();
        drop(block);
        assert!(heap.address(&handle).is_err());
        assert_eq!(heap.stats()[0].allocated, 0);
    }

    proptest! {
        #[test]
        fn prop_allocated_plus_free_equals_arena_size(
            ops in proptest::collection::vec((any::<bool>(), 1usize..3000, any::<usize>()), 1..120)
        ) {
            let heap = Heap::with_arena_size(4096);
            let mut live: Vec<Block> = Vec::new();
            for (alloc, size, pick) in ops {
                if alloc || live.is_empty() {
                    live.push(heap.allocate(size).unwrap());
                } else {
                    let block = live.swap_remove(pick % live.len());
                    heap.free(block).unwrap();
                }
                for arena in heap.stats() {
                    prop_assert_eq!(arena.allocated + arena.free, arena.size);
                }
            }

            live.sort();
            for pair in live.windows(2) {
                if pair[0].arena == pair[1].arena {
                    prop_assert!(pair[0].stop <= pair[1].start);
                }
            }

            for block in live.drain(..) {
                heap.free(block).unwrap();
            }
            for arena in heap.stats() {
                prop_assert_eq!(arena.free_blocks, 1);
                prop_assert_eq!(arena.free, arena.size);
            }
        }
    }
}
