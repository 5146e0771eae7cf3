//! The pool engine: size-class dispatch, pool lifecycle, and block
//! operations.
//!
//! One engine owns a size-class table, the pool chains hanging off it, and
//! the span registry. A single mutex guards all of that mutable state;
//! every heap-backend call happens with the lock released, so large
//! requests and backing-store traffic never serialize behind pool
//! contention.

pub(crate) mod pool;
pub(crate) mod size_class;
pub(crate) mod span;

use core::fmt;
use core::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::config::{DebugChecks, EngineConfig};
use crate::error::{AllocError, AllocResult};
use crate::flags::AllocFlags;
use crate::heap::HeapBackend;
use self::size_class::SizeClassTable;
use self::span::SpanRegistry;

/// Mutable engine state behind the engine mutex.
struct EngineState {
    table: SizeClassTable,
    spans: SpanRegistry,
}

// SAFETY: EngineState holds raw pool pointers, but every pool region is
// exclusively owned by its engine and only dereferenced while the engine
// mutex is held. Sending the state to another thread moves that ownership
// wholesale; no pointer is shared outside the lock.
unsafe impl Send for EngineState {}

/// Segregated free-list pool allocator.
///
/// Small requests are served from size-classed pools with intrusive free
/// lists; anything larger than the largest class is delegated to the
/// [`HeapBackend`] supplied at construction. A pool is destroyed the
/// instant its last block is freed; pools are not retained as a cache.
pub struct PoolEngine {
    /// Diagnostics-only name.
    name: String,
    /// Backing bytes requested per new pool.
    pool_bytes: usize,
    checks: DebugChecks,
    heap: Arc<dyn HeapBackend>,
    state: Mutex<EngineState>,
}

impl PoolEngine {
    /// Builds an engine from a validated configuration and a heap backend.
    pub fn new(config: EngineConfig, heap: Arc<dyn HeapBackend>) -> AllocResult<Self> {
        config.validate()?;
        Ok(Self {
            name: config.name,
            pool_bytes: config.pool_bytes,
            checks: config.checks,
            heap,
            state: Mutex::new(EngineState {
                table: SizeClassTable::new(&config.classes),
                spans: SpanRegistry::new(),
            }),
        })
    }

    /// The engine's diagnostics name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of currently live pools across all size classes.
    pub fn live_pools(&self) -> usize {
        self.state.lock().spans.live()
    }

    /// The size class a request of `size` bytes would resolve to today,
    /// without growing a dynamic table.
    pub fn class_for(&self, size: usize) -> Option<usize> {
        let state = self.state.lock();
        state
            .table
            .find(size.max(1))
            .map(|idx| state.table.get(idx).size)
    }

    /// Blocks a freshly created pool of the class serving `size` would
    /// hold.
    pub fn blocks_per_pool(&self, size: usize) -> Option<usize> {
        self.class_for(size)
            .map(|class| pool::geometry(self.pool_bytes, class, &self.checks).num_items)
    }

    /// Allocates `size` bytes.
    ///
    /// Requests that fit a size class come from a pool (created on demand
    /// when no pool of the class has room); larger requests go straight to
    /// the heap backend. Fails only when the backend fails.
    pub fn allocate(&self, size: usize, flags: AllocFlags) -> AllocResult<NonNull<u8>> {
        let size = size.max(1);
        let mut state = self.state.lock();

        let Some(idx) = state.table.find_or_grow(size) else {
            // Too large for any pool; the backend is called unlocked.
            drop(state);
            return self
                .heap
                .malloc(size, flags)
                .ok_or(AllocError::out_of_memory(size));
        };
        let class_size = state.table.get(idx).size;

        // Walk the chain for a pool with a free block. The head is
        // heuristically a pool with room, so this usually stops at once.
        let mut candidate = state.table.get(idx).head;
        // SAFETY: chain pointers are live pools of this engine; the lock
        // is held for the whole walk.
        unsafe {
            while !candidate.is_null() && (*candidate).num_free == 0 {
                candidate = (*candidate).next;
            }
        }

        if candidate.is_null() {
            drop(state);
            return self.create_pool_and_pop(class_size, flags);
        }

        // SAFETY: candidate is live with num_free > 0; lock held.
        let block = unsafe {
            let block = pool::pop_block(candidate, &self.checks)
                .expect("chain walk found a pool with a free block");
            // Bias future lookups: if the pool still has room and is not
            // already the head, relink it to the front.
            if (*candidate).num_free > 0 {
                let class = state.table.get_mut(idx);
                if class.head != candidate {
                    pool::unlink(&mut class.head, candidate);
                    pool::link_front(&mut class.head, candidate);
                }
            }
            block
        };
        Ok(block)
    }

    /// Creates a pool for `class_size`, links it at the chain head, and
    /// pops its first block.
    fn create_pool_and_pop(
        &self,
        class_size: usize,
        flags: AllocFlags,
    ) -> AllocResult<NonNull<u8>> {
        let geo = pool::geometry(self.pool_bytes, class_size, &self.checks);
        // Backing store comes from the backend with the lock released,
        // tagged as engine bookkeeping so trackers skip it.
        let region = self
            .heap
            .malloc(geo.region_len, flags | AllocFlags::INTERNAL_ALLOC)
            .ok_or(AllocError::out_of_memory(geo.region_len))?;

        let mut state = self.state.lock();
        // Re-resolve by size: dynamic growth on another thread may have
        // shifted indices while the lock was released. Classes are never
        // removed, so this cannot miss.
        let idx = state
            .table
            .index_of(class_size)
            .expect("size class vanished while creating a pool");

        // SAFETY: region is a fresh, exclusively owned allocation of
        // geo.region_len bytes at backend alignment (>= 16).
        let block = unsafe {
            let header = pool::init(region, class_size, geo, &self.checks);
            let start = region.as_ptr() as usize;
            state.spans.insert(start, start + geo.region_len, header);
            pool::link_front(&mut state.table.get_mut(idx).head, header);
            pool::pop_block(header, &self.checks).expect("fresh pool has free blocks")
        };
        trace!(
            engine = %self.name,
            class_size,
            blocks = geo.num_items,
            "created pool"
        );
        Ok(block)
    }

    /// Releases an allocation.
    ///
    /// Pool blocks go back on their pool's free list; when that leaves the
    /// pool completely empty the pool itself is destroyed and its span
    /// removed. Pointers outside every span are handed to the heap
    /// backend.
    ///
    /// # Safety
    /// `ptr` must have been returned by this engine (or its backend) and
    /// not yet deallocated.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>, flags: AllocFlags) {
        let mut state = self.state.lock();
        let addr = ptr.as_ptr() as usize;

        let Some(owner) = state.spans.find(addr) else {
            drop(state);
            // SAFETY: not carved from any pool, so per the caller's
            // contract it came from the heap backend.
            unsafe { self.heap.free(ptr, flags) };
            return;
        };

        // SAFETY: owner is live; lock held; push_block panics on any
        // block-boundary or guard violation before touching state.
        let emptied = unsafe {
            pool::push_block(owner, ptr, &self.checks);
            (*owner).num_free == (*owner).num_items
        };
        if !emptied {
            return;
        }

        // Every block came back: destroy the pool immediately.
        // SAFETY: owner is live; lock held.
        let (start, class_size) = unsafe {
            let start = owner as usize;
            let class_size = (*owner).alloc_size;
            let idx = state
                .table
                .index_of(class_size)
                .expect("live pool's size class must exist");
            pool::unlink(&mut state.table.get_mut(idx).head, owner);
            state.spans.remove(start);
            (start, class_size)
        };
        drop(state);
        trace!(engine = %self.name, class_size, "destroyed empty pool");
        // SAFETY: the region is unreachable from every chain and span, so
        // exclusive ownership ends here; `start` is a pool base, non-null.
        unsafe {
            self.heap.free(
                NonNull::new_unchecked(start as *mut u8),
                flags | AllocFlags::INTERNAL_ALLOC,
            )
        };
    }

    /// Resizes an allocation, preserving contents up to the smaller of the
    /// old usable size and `new_size`.
    ///
    /// When the new size maps to the same size class as the current pool
    /// the pointer is returned unchanged. A heap-backed allocation whose
    /// new size still fits no pool is delegated to the backend's realloc
    /// wholesale.
    ///
    /// # Safety
    /// `ptr` must have been returned by this engine (or its backend) and
    /// not yet deallocated.
    pub unsafe fn reallocate(
        &self,
        ptr: NonNull<u8>,
        new_size: usize,
        flags: AllocFlags,
    ) -> AllocResult<NonNull<u8>> {
        let new_size = new_size.max(1);
        let mut state = self.state.lock();
        let owner = state.spans.find(ptr.as_ptr() as usize);
        let new_class = state.table.find_or_grow(new_size);

        match (owner, new_class) {
            (Some(owner), Some(idx)) => {
                // SAFETY: owner is live under the lock.
                let current = unsafe { (*owner).alloc_size };
                if state.table.get(idx).size == current {
                    // Same class: the block already fits, no data moves.
                    return Ok(ptr);
                }
                drop(state);
                // SAFETY: forwarded caller contract.
                unsafe { self.move_allocation(ptr, current, new_size, flags) }
            }
            (Some(owner), None) => {
                // SAFETY: owner is live under the lock.
                let current = unsafe { (*owner).alloc_size };
                drop(state);
                // SAFETY: forwarded caller contract.
                unsafe { self.move_allocation(ptr, current, new_size, flags) }
            }
            (None, Some(_)) => {
                drop(state);
                // SAFETY: non-pool pointer came from the heap backend.
                let current = unsafe { self.heap.memsize(ptr) };
                // SAFETY: forwarded caller contract.
                unsafe { self.move_allocation(ptr, current, new_size, flags) }
            }
            (None, None) => {
                drop(state);
                // Heap-backed on both ends: delegate wholesale.
                // SAFETY: non-pool pointer came from the heap backend.
                unsafe { self.heap.realloc(ptr, new_size, flags) }
                    .ok_or(AllocError::out_of_memory(new_size))
            }
        }
    }

    /// Allocate-copy-free path for cross-class reallocation.
    ///
    /// # Safety
    /// `ptr` must be live with at least `current` usable bytes.
    unsafe fn move_allocation(
        &self,
        ptr: NonNull<u8>,
        current: usize,
        new_size: usize,
        flags: AllocFlags,
    ) -> AllocResult<NonNull<u8>> {
        let new_ptr = self.allocate(new_size, flags)?;
        let copy = current.min(new_size);
        // SAFETY: both regions are live and disjoint (the old block is
        // freed only after the copy).
        unsafe {
            core::ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), copy);
            self.deallocate(ptr, flags);
        }
        Ok(new_ptr)
    }

    /// Usable size if `ptr` is pool-backed, `None` otherwise.
    ///
    /// # Safety
    /// `ptr` must have been returned by this engine (or its backend) and
    /// not yet deallocated.
    pub unsafe fn pooled_size(&self, ptr: NonNull<u8>) -> Option<usize> {
        let state = self.state.lock();
        state
            .spans
            .find(ptr.as_ptr() as usize)
            // SAFETY: span hit means a live pool; lock held.
            .map(|owner| unsafe { (*owner).alloc_size })
    }

    /// Usable size of a live allocation: the size class for pool blocks,
    /// the backend's notion of size for heap blocks.
    ///
    /// # Safety
    /// `ptr` must have been returned by this engine (or its backend) and
    /// not yet deallocated.
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        // SAFETY: forwarded caller contract.
        match unsafe { self.pooled_size(ptr) } {
            Some(size) => size,
            // SAFETY: not pool memory, so it came from the heap backend.
            None => unsafe { self.heap.memsize(ptr) },
        }
    }
}

impl Drop for PoolEngine {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let regions: Vec<usize> = state.spans.iter_live().map(|(start, _)| start).collect();
        if !regions.is_empty() {
            tracing::debug!(
                engine = %self.name,
                pools = regions.len(),
                "engine dropped with live pools"
            );
        }
        for start in regions {
            // SAFETY: each live span is a backing region still owned by
            // this engine; nothing can reach it after drop.
            unsafe {
                self.heap.free(
                    NonNull::new_unchecked(start as *mut u8),
                    AllocFlags::INTERNAL_ALLOC,
                )
            };
        }
    }
}

impl fmt::Debug for PoolEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolEngine")
            .field("name", &self.name)
            .field("pool_bytes", &self.pool_bytes)
            .field("live_pools", &self.state.lock().spans.live())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::SystemHeap;

    fn engine(sizes: Vec<usize>, pool_bytes: usize) -> PoolEngine {
        let config = EngineConfig::fixed("test-engine", pool_bytes, sizes)
            .with_checks(DebugChecks::debug());
        PoolEngine::new(config, Arc::new(SystemHeap::new())).expect("valid config")
    }

    #[test]
    fn rejects_invalid_config() {
        let config = EngineConfig::fixed("bad", 4096, vec![]);
        assert!(PoolEngine::new(config, Arc::new(SystemHeap::new())).is_err());
    }

    #[test]
    fn pooled_roundtrip() {
        let engine = engine(vec![16, 32, 64], 4096);
        let ptr = engine.allocate(20, AllocFlags::empty()).expect("alloc");

        unsafe {
            assert_eq!(engine.pooled_size(ptr), Some(32));
            assert_eq!(engine.usable_size(ptr), 32);
            std::ptr::write_bytes(ptr.as_ptr(), 0x5A, 32);
            assert_eq!(*ptr.as_ptr().add(31), 0x5A);
            engine.deallocate(ptr, AllocFlags::empty());
        }
        assert_eq!(engine.live_pools(), 0);
    }

    #[test]
    fn oversized_request_skips_pools() {
        let engine = engine(vec![16, 32, 64], 4096);
        let ptr = engine.allocate(65, AllocFlags::empty()).expect("alloc");

        assert_eq!(engine.live_pools(), 0, "no pool chain may be touched");
        unsafe {
            assert_eq!(engine.pooled_size(ptr), None);
            assert_eq!(engine.usable_size(ptr), 65);
            engine.deallocate(ptr, AllocFlags::empty());
        }
    }

    #[test]
    fn freed_block_satisfies_next_request() {
        let engine = engine(vec![64], 4096);
        let first = engine.allocate(64, AllocFlags::empty()).expect("alloc");
        // Keep the pool alive so the freed block stays available.
        let keeper = engine.allocate(64, AllocFlags::empty()).expect("alloc");

        unsafe {
            engine.deallocate(first, AllocFlags::empty());
            let again = engine.allocate(64, AllocFlags::empty()).expect("alloc");
            assert_eq!(first.as_ptr(), again.as_ptr(), "freed block must be reused");
            assert_eq!(engine.live_pools(), 1);
            engine.deallocate(again, AllocFlags::empty());
            engine.deallocate(keeper, AllocFlags::empty());
        }
    }

    #[test]
    fn realloc_same_class_keeps_pointer() {
        let engine = engine(vec![16, 32, 64], 4096);
        let ptr = engine.allocate(20, AllocFlags::empty()).expect("alloc");

        unsafe {
            let same = engine
                .reallocate(ptr, 30, AllocFlags::empty())
                .expect("realloc");
            assert_eq!(ptr.as_ptr(), same.as_ptr());
            engine.deallocate(same, AllocFlags::empty());
        }
    }

    #[test]
    fn realloc_across_classes_preserves_contents() {
        let engine = engine(vec![16, 64], 4096);
        let ptr = engine.allocate(16, AllocFlags::empty()).expect("alloc");

        unsafe {
            for i in 0..16u8 {
                *ptr.as_ptr().add(i as usize) = i;
            }
            let grown = engine
                .reallocate(ptr, 48, AllocFlags::empty())
                .expect("realloc");
            assert_ne!(ptr.as_ptr(), grown.as_ptr());
            for i in 0..16u8 {
                assert_eq!(*grown.as_ptr().add(i as usize), i);
            }
            engine.deallocate(grown, AllocFlags::empty());
        }
    }

    #[test]
    fn realloc_pool_to_heap_and_back() {
        let engine = engine(vec![32], 4096);
        let ptr = engine.allocate(32, AllocFlags::empty()).expect("alloc");

        unsafe {
            std::ptr::write_bytes(ptr.as_ptr(), 0x11, 32);
            let on_heap = engine
                .reallocate(ptr, 1024, AllocFlags::empty())
                .expect("realloc to heap");
            assert_eq!(engine.pooled_size(on_heap), None);
            assert_eq!(*on_heap.as_ptr().add(31), 0x11);

            let back = engine
                .reallocate(on_heap, 8, AllocFlags::empty())
                .expect("realloc to pool");
            assert_eq!(engine.pooled_size(back), Some(32));
            assert_eq!(*back.as_ptr().add(7), 0x11);
            engine.deallocate(back, AllocFlags::empty());
        }
    }

    #[test]
    fn dynamic_mode_grows_classes_on_demand() {
        let config = EngineConfig::dynamic("dyn", 4096, 128)
            .with_checks(DebugChecks::debug());
        let engine = PoolEngine::new(config, Arc::new(SystemHeap::new())).expect("valid");

        let small = engine.allocate(24, AllocFlags::empty()).expect("alloc");
        let large = engine.allocate(100, AllocFlags::empty()).expect("alloc");
        let over = engine.allocate(129, AllocFlags::empty()).expect("alloc");

        unsafe {
            assert_eq!(engine.pooled_size(small), Some(24));
            assert_eq!(engine.pooled_size(large), Some(100));
            assert_eq!(engine.pooled_size(over), None);
            engine.deallocate(small, AllocFlags::empty());
            engine.deallocate(large, AllocFlags::empty());
            engine.deallocate(over, AllocFlags::empty());
        }
        assert_eq!(engine.live_pools(), 0);
    }

    #[test]
    fn drop_releases_live_regions() {
        let engine = engine(vec![16], 1024);
        // Leak two blocks deliberately; Drop must still return the pool
        // backing to the heap (leak policy is the facade's business).
        let _a = engine.allocate(16, AllocFlags::empty()).expect("alloc");
        let _b = engine.allocate(16, AllocFlags::empty()).expect("alloc");
        assert_eq!(engine.live_pools(), 1);
        drop(engine);
    }
}
