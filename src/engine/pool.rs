//! Raw pool regions: in-place header, fixed-size blocks, intrusive free
//! list.
//!
//! # Safety
//!
//! A pool is one contiguous region obtained from the heap backend. The
//! [`PoolHeader`] lives at the region's base address and the blocks follow
//! it; a free block's first word stores the address of the next free block,
//! so the free list occupies no storage of its own.
//!
//! ## Invariants
//!
//! - `0 <= num_free <= num_items`, and `first_free` is null exactly when
//!   `num_free == 0`
//! - the free list only threads through blocks of this pool
//! - every block starts `stride` bytes after the previous one, `stride` is
//!   word-aligned, and `stride >= alloc_size` (+ guard when enabled)
//! - all functions here are called with the engine lock held; nothing in
//!   this module synchronizes on its own
//!
//! # Memory Layout
//! ```text
//! [PoolHeader|pad][Block0|guard][Block1|guard]...[BlockN|guard]
//!                     ↓             ↓
//!                  [free] ──────→ [free] ──→ null
//! ```

use core::ptr::{self, NonNull};

use crate::config::DebugChecks;
use crate::utils::{align_up, WORD_SIZE};

/// Bytes of trailing sentinel per block when the bounds guard is enabled.
pub(crate) const GUARD_SIZE: usize = 4;

/// Sentinel written after each block's usable bytes.
pub(crate) const GUARD_PATTERN: u32 = 0xF0AD_C0DE;

/// Header stored at the base address of every pool region.
#[repr(C)]
pub(crate) struct PoolHeader {
    /// Usable bytes per block; equals this pool's size class.
    pub(crate) alloc_size: usize,
    /// Distance between consecutive blocks (usable bytes + guard, aligned
    /// up to a word).
    pub(crate) stride: usize,
    /// Total blocks carved from this region.
    pub(crate) num_items: usize,
    /// Blocks currently on the free list.
    pub(crate) num_free: usize,
    /// Head of the intrusive free list; null when the pool is full.
    pub(crate) first_free: *mut FreeBlock,
    /// Chain links for this pool's size class.
    pub(crate) prev: *mut PoolHeader,
    pub(crate) next: *mut PoolHeader,
}

/// A free block's view of its own first word.
#[repr(C)]
pub(crate) struct FreeBlock {
    pub(crate) next: *mut FreeBlock,
}

/// Bytes reserved at the region base for the header, padded so the first
/// block starts 16-aligned.
pub(crate) const HEADER_SIZE: usize = align_up(core::mem::size_of::<PoolHeader>(), 16);

/// Block geometry for one pool of a given size class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PoolGeometry {
    /// Total backing bytes to request from the heap backend.
    pub(crate) region_len: usize,
    /// Whole blocks that fit, minimum one.
    pub(crate) num_items: usize,
    /// Per-block stride.
    pub(crate) stride: usize,
}

/// Computes the geometry for a pool serving `alloc_size`-byte blocks out
/// of a `pool_bytes` backing allocation.
///
/// `alloc_size` must already be clamped to at least one machine word. When
/// `pool_bytes` is too small for even one block the region grows to fit
/// exactly one.
pub(crate) fn geometry(pool_bytes: usize, alloc_size: usize, checks: &DebugChecks) -> PoolGeometry {
    debug_assert!(alloc_size >= WORD_SIZE);
    let body = if checks.bounds_guard {
        alloc_size + GUARD_SIZE
    } else {
        alloc_size
    };
    let stride = align_up(body, WORD_SIZE);
    let num_items = (pool_bytes.saturating_sub(HEADER_SIZE) / stride).max(1);
    PoolGeometry {
        region_len: HEADER_SIZE + num_items * stride,
        num_items,
        stride,
    }
}

/// Initializes a fresh region as a pool: writes the header, threads the
/// free list front-to-back, and lays down guards.
///
/// # Safety
/// `region` must point to at least `geo.region_len` writable bytes,
/// exclusively owned by the caller and aligned to 16.
pub(crate) unsafe fn init(
    region: NonNull<u8>,
    alloc_size: usize,
    geo: PoolGeometry,
    checks: &DebugChecks,
) -> *mut PoolHeader {
    let base = region.as_ptr();
    // SAFETY: the region has room for the header (region_len >=
    // HEADER_SIZE + stride) and the caller guarantees 16-alignment.
    unsafe {
        let blocks = base.add(HEADER_SIZE);
        for i in 0..geo.num_items {
            let block = blocks.add(i * geo.stride);
            let next: *mut FreeBlock = if i + 1 < geo.num_items {
                blocks.add((i + 1) * geo.stride).cast()
            } else {
                ptr::null_mut()
            };
            // Each block is at least a word, so the link fits.
            block.cast::<FreeBlock>().write(FreeBlock { next });
            if checks.bounds_guard {
                block.add(alloc_size).cast::<u32>().write_unaligned(GUARD_PATTERN);
            }
        }

        let header = base.cast::<PoolHeader>();
        header.write(PoolHeader {
            alloc_size,
            stride: geo.stride,
            num_items: geo.num_items,
            num_free: geo.num_items,
            first_free: blocks.cast(),
            prev: ptr::null_mut(),
            next: ptr::null_mut(),
        });
        header
    }
}

/// Pops the head of the free list, or returns `None` when the pool is
/// full.
///
/// # Safety
/// `pool` must be live and the engine lock held.
pub(crate) unsafe fn pop_block(pool: *mut PoolHeader, checks: &DebugChecks) -> Option<NonNull<u8>> {
    // SAFETY: header and free-list blocks are inside the live region; the
    // lock gives us exclusive access.
    unsafe {
        let head = (*pool).first_free;
        if head.is_null() {
            debug_assert_eq!((*pool).num_free, 0);
            return None;
        }
        // The next-pointer word is valid even for the last entry (null).
        (*pool).first_free = (*head).next;
        (*pool).num_free -= 1;

        let block = head.cast::<u8>();
        if checks.bounds_guard {
            verify_guard(pool, block);
        }
        if let Some(pattern) = checks.alloc_pattern {
            ptr::write_bytes(block, pattern, (*pool).alloc_size);
        }
        NonNull::new(block)
    }
}

/// Pushes a block back onto the free list.
///
/// Panics if the pointer does not land on a block boundary of this pool,
/// if the bounds guard was overwritten, or if the push would exceed the
/// pool's capacity (a double-free signature). These are corruption states,
/// not recoverable errors.
///
/// # Safety
/// `pool` must be live, `block` must lie inside this pool's span, and the
/// engine lock must be held.
pub(crate) unsafe fn push_block(pool: *mut PoolHeader, block: NonNull<u8>, checks: &DebugChecks) {
    // SAFETY: same region/lock reasoning as pop_block; the boundary
    // asserts below run before any write through `block`.
    unsafe {
        let addr = block.as_ptr() as usize;
        let blocks_start = pool as usize + HEADER_SIZE;
        let offset = match addr.checked_sub(blocks_start) {
            Some(offset) if offset % (*pool).stride == 0 => offset,
            _ => panic!(
                "pointer {:p} is inside pool {:p} but not on a block boundary",
                block.as_ptr(),
                pool
            ),
        };
        assert!(
            offset / (*pool).stride < (*pool).num_items,
            "pointer {:p} is past the last block of pool {:p}",
            block.as_ptr(),
            pool
        );

        if checks.bounds_guard {
            verify_guard(pool, block.as_ptr());
        }
        if let Some(pattern) = checks.dealloc_pattern {
            // First word stays reserved for the free-list link.
            let body = (*pool).alloc_size;
            if body > WORD_SIZE {
                ptr::write_bytes(block.as_ptr().add(WORD_SIZE), pattern, body - WORD_SIZE);
            }
        }

        assert!(
            (*pool).num_free < (*pool).num_items,
            "double free: pool {:p} already has every block free",
            pool
        );
        let entry = block.as_ptr().cast::<FreeBlock>();
        entry.write(FreeBlock {
            next: (*pool).first_free,
        });
        (*pool).first_free = entry;
        (*pool).num_free += 1;
    }
}

/// Checks the trailing sentinel of one block.
///
/// # Safety
/// `block` must be a block of the live pool `pool`.
unsafe fn verify_guard(pool: *mut PoolHeader, block: *mut u8) {
    // SAFETY: the guard word sits inside the block's stride, which is part
    // of the region.
    unsafe {
        let found = block.add((*pool).alloc_size).cast::<u32>().read_unaligned();
        if found != GUARD_PATTERN {
            panic!(
                "bounds guard corrupted at {:p}: wrote past {} usable bytes (found {:#010x})",
                block,
                (*pool).alloc_size,
                found
            );
        }
    }
}

/// Links `pool` at the front of a chain.
///
/// # Safety
/// `pool` must be live and unlinked; `head` must be the chain head slot
/// for `pool`'s size class; engine lock held.
pub(crate) unsafe fn link_front(head: &mut *mut PoolHeader, pool: *mut PoolHeader) {
    // SAFETY: both headers (if non-null) are live pools of this class.
    unsafe {
        (*pool).prev = ptr::null_mut();
        (*pool).next = *head;
        if !head.is_null() {
            (**head).prev = pool;
        }
        *head = pool;
    }
}

/// Unlinks `pool` from its chain, rewiring the head if needed.
///
/// # Safety
/// `pool` must be linked into the chain rooted at `head`; engine lock
/// held.
pub(crate) unsafe fn unlink(head: &mut *mut PoolHeader, pool: *mut PoolHeader) {
    // SAFETY: neighbors are live pools of the same chain.
    unsafe {
        let prev = (*pool).prev;
        let next = (*pool).next;
        if prev.is_null() {
            debug_assert_eq!(*head, pool);
            *head = next;
        } else {
            (*prev).next = next;
        }
        if !next.is_null() {
            (*next).prev = prev;
        }
        (*pool).prev = ptr::null_mut();
        (*pool).next = ptr::null_mut();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::AllocFlags;
    use crate::heap::{HeapBackend, SystemHeap};

    fn checks() -> DebugChecks {
        DebugChecks::debug()
    }

    fn make_pool(
        heap: &SystemHeap,
        pool_bytes: usize,
        alloc_size: usize,
        checks: &DebugChecks,
    ) -> (NonNull<u8>, *mut PoolHeader, PoolGeometry) {
        let geo = geometry(pool_bytes, alloc_size, checks);
        let region = heap
            .malloc(geo.region_len, AllocFlags::INTERNAL_ALLOC)
            .expect("backing allocation failed");
        let pool = unsafe { init(region, alloc_size, geo, checks) };
        (region, pool, geo)
    }

    #[test]
    fn geometry_fits_whole_blocks() {
        let checks = DebugChecks::production();
        let geo = geometry(4096, 64, &checks);
        assert_eq!(geo.stride, 64);
        assert_eq!(geo.num_items, (4096 - HEADER_SIZE) / 64);
        assert_eq!(geo.region_len, HEADER_SIZE + geo.num_items * 64);
    }

    #[test]
    fn geometry_guard_widens_stride() {
        let geo = geometry(4096, 16, &checks());
        assert_eq!(geo.stride, align_up(16 + GUARD_SIZE, WORD_SIZE));
    }

    #[test]
    fn geometry_single_block_minimum() {
        let checks = DebugChecks::production();
        let geo = geometry(8, 256, &checks);
        assert_eq!(geo.num_items, 1);
        assert_eq!(geo.region_len, HEADER_SIZE + 256);
    }

    #[test]
    fn pop_drains_then_push_refills() {
        let heap = SystemHeap::new();
        let checks = checks();
        let (region, pool, geo) = make_pool(&heap, 1024, 32, &checks);

        unsafe {
            let mut blocks = Vec::new();
            for _ in 0..geo.num_items {
                blocks.push(pop_block(pool, &checks).expect("pool should have room"));
            }
            assert_eq!((*pool).num_free, 0);
            assert!(pop_block(pool, &checks).is_none());

            for block in blocks {
                push_block(pool, block, &checks);
            }
            assert_eq!((*pool).num_free, geo.num_items);

            heap.free(region, AllocFlags::INTERNAL_ALLOC);
        }
    }

    #[test]
    fn single_block_pool_terminates() {
        let heap = SystemHeap::new();
        let checks = checks();
        // Region smaller than one block forces the one-block minimum.
        let (region, pool, _geo) = make_pool(&heap, 1, 64, &checks);

        unsafe {
            assert_eq!((*pool).num_items, 1);
            let block = pop_block(pool, &checks).expect("single block");
            assert!(pop_block(pool, &checks).is_none());
            push_block(pool, block, &checks);
            assert_eq!((*pool).num_free, 1);
            heap.free(region, AllocFlags::INTERNAL_ALLOC);
        }
    }

    #[test]
    fn freed_block_is_reused_lifo() {
        let heap = SystemHeap::new();
        let checks = checks();
        let (region, pool, _geo) = make_pool(&heap, 1024, 48, &checks);

        unsafe {
            let first = pop_block(pool, &checks).unwrap();
            push_block(pool, first, &checks);
            let again = pop_block(pool, &checks).unwrap();
            assert_eq!(first.as_ptr(), again.as_ptr());
            push_block(pool, again, &checks);
            heap.free(region, AllocFlags::INTERNAL_ALLOC);
        }
    }

    #[test]
    #[should_panic(expected = "bounds guard corrupted")]
    fn overrun_trips_guard() {
        let heap = SystemHeap::new();
        let checks = checks();
        let (_region, pool, _geo) = make_pool(&heap, 1024, 24, &checks);

        unsafe {
            let block = pop_block(pool, &checks).unwrap();
            // One byte past the usable size lands on the sentinel.
            *block.as_ptr().add(24) = 0;
            push_block(pool, block, &checks);
        }
    }

    #[test]
    #[should_panic(expected = "not on a block boundary")]
    fn misaligned_pointer_is_fatal() {
        let heap = SystemHeap::new();
        let checks = checks();
        let (_region, pool, _geo) = make_pool(&heap, 1024, 32, &checks);

        unsafe {
            let block = pop_block(pool, &checks).unwrap();
            let inside = NonNull::new_unchecked(block.as_ptr().add(1));
            push_block(pool, inside, &checks);
        }
    }

    #[test]
    fn chain_link_unlink() {
        let heap = SystemHeap::new();
        let checks = DebugChecks::production();
        let (r1, p1, _) = make_pool(&heap, 512, 32, &checks);
        let (r2, p2, _) = make_pool(&heap, 512, 32, &checks);
        let (r3, p3, _) = make_pool(&heap, 512, 32, &checks);

        unsafe {
            let mut head: *mut PoolHeader = ptr::null_mut();
            link_front(&mut head, p1);
            link_front(&mut head, p2);
            link_front(&mut head, p3);
            assert_eq!(head, p3);
            assert_eq!((*p3).next, p2);
            assert_eq!((*p2).prev, p3);

            // Middle, then head, then last.
            unlink(&mut head, p2);
            assert_eq!((*p3).next, p1);
            assert_eq!((*p1).prev, p3);

            unlink(&mut head, p3);
            assert_eq!(head, p1);
            assert!((*p1).prev.is_null());

            unlink(&mut head, p1);
            assert!(head.is_null());

            heap.free(r1, AllocFlags::INTERNAL_ALLOC);
            heap.free(r2, AllocFlags::INTERNAL_ALLOC);
            heap.free(r3, AllocFlags::INTERNAL_ALLOC);
        }
    }
}
