//! Heap backend boundary and the default system-allocator implementation.
//!
//! The pool engine never calls the operating system directly. Everything
//! too large for a pool, plus the engine's own backing allocations, goes
//! through a [`HeapBackend`] supplied once at construction. The default
//! backend, [`SystemHeap`], delegates to [`std::alloc::System`] and keeps a
//! small per-allocation header so `memsize` and `free` work without any
//! external layout bookkeeping.
//!
//! # Safety
//!
//! Backend pointers are raw. Callers own the usual allocator contracts:
//! `free`/`realloc`/`memsize` only accept pointers previously returned by
//! the same backend, exactly once.

use core::fmt;
use core::ptr::NonNull;
use std::alloc::{GlobalAlloc, Layout, System};

use crate::flags::AllocFlags;
use crate::utils::is_power_of_two;

/// Minimum alignment served by [`SystemHeap`], matching what callers expect
/// from a general-purpose `malloc`.
pub const DEFAULT_ALIGN: usize = 16;

/// The heap-backend hook bundle.
///
/// One implementation is supplied per engine at construction time. Every
/// call threads an [`AllocFlags`] word; backends may ignore it, but the
/// engine uses it to mark its own bookkeeping traffic
/// ([`AllocFlags::INTERNAL_ALLOC`]) so external trackers can filter it out.
///
/// Implementations must be independently thread-safe: the engine releases
/// its own lock before every backend call.
pub trait HeapBackend: Send + Sync {
    /// Allocates `size` bytes at the backend's default alignment.
    ///
    /// Returns `None` when the underlying allocator fails.
    fn malloc(&self, size: usize, flags: AllocFlags) -> Option<NonNull<u8>>;

    /// Allocates `size` bytes aligned to `align` (a power of two).
    fn malloc_aligned(&self, size: usize, align: usize, flags: AllocFlags) -> Option<NonNull<u8>>;

    /// Releases an allocation.
    ///
    /// # Safety
    /// `ptr` must have been returned by this backend and not yet freed.
    unsafe fn free(&self, ptr: NonNull<u8>, flags: AllocFlags);

    /// Resizes an allocation, preserving contents up to the smaller size.
    ///
    /// On failure the original allocation is untouched and still owned by
    /// the caller.
    ///
    /// # Safety
    /// `ptr` must have been returned by this backend and not yet freed.
    unsafe fn realloc(
        &self,
        ptr: NonNull<u8>,
        new_size: usize,
        flags: AllocFlags,
    ) -> Option<NonNull<u8>>;

    /// Resizes an allocation to a new size and alignment.
    ///
    /// # Safety
    /// `ptr` must have been returned by this backend and not yet freed.
    unsafe fn realloc_aligned(
        &self,
        ptr: NonNull<u8>,
        new_size: usize,
        align: usize,
        flags: AllocFlags,
    ) -> Option<NonNull<u8>>;

    /// Returns the usable size of a live allocation.
    ///
    /// # Safety
    /// `ptr` must have been returned by this backend and not yet freed.
    unsafe fn memsize(&self, ptr: NonNull<u8>) -> usize;
}

/// Per-allocation bookkeeping stored immediately before the user pointer.
#[repr(C)]
struct HeapHeader {
    size: usize,
    align: usize,
}

const HEADER_SIZE: usize = core::mem::size_of::<HeapHeader>();

/// Wrapper for the system's default allocator.
///
/// Each allocation is laid out as `[padding][header][user bytes]` where
/// the header occupies the last bytes of the prefix and the prefix length
/// equals the (clamped) alignment. The header records the user size and
/// alignment, which is enough to reconstruct the full [`Layout`] for
/// `free`, `realloc`, and `memsize`.
///
/// # Thread Safety
/// The system allocator is inherently thread-safe; the header is written
/// once before the pointer is published and read only by the thread that
/// owns the allocation's lifecycle calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemHeap;

impl SystemHeap {
    /// Creates a new `SystemHeap`. Zero-cost, the backend holds no state.
    #[inline]
    pub const fn new() -> Self {
        SystemHeap
    }

    /// Prefix length in front of the user bytes for a given alignment.
    ///
    /// The alignment is clamped to [`DEFAULT_ALIGN`], so the prefix always
    /// has room for the header and the user pointer lands on an `align`
    /// boundary.
    #[inline]
    fn prefix(align: usize) -> usize {
        align.max(DEFAULT_ALIGN)
    }

    /// Full backing layout for a clamped alignment and user size.
    fn backing_layout(size: usize, align: usize) -> Option<Layout> {
        let total = Self::prefix(align).checked_add(size)?;
        Layout::from_size_align(total, align.max(DEFAULT_ALIGN)).ok()
    }

    /// Reads the header sitting just below `user`.
    ///
    /// # Safety
    /// `user` must be a live pointer previously returned by this backend.
    #[inline]
    unsafe fn header(user: NonNull<u8>) -> HeapHeader {
        // SAFETY: every allocation reserves HEADER_SIZE bytes directly
        // below the user pointer; the user pointer is at least
        // DEFAULT_ALIGN-aligned so the header read is aligned.
        unsafe {
            let header_ptr = user.as_ptr().sub(HEADER_SIZE).cast::<HeapHeader>();
            HeapHeader {
                size: (*header_ptr).size,
                align: (*header_ptr).align,
            }
        }
    }

    /// Writes the header for a freshly placed allocation.
    ///
    /// # Safety
    /// `user` must point `prefix(align)` bytes into a live backing region.
    #[inline]
    unsafe fn write_header(user: *mut u8, size: usize, align: usize) {
        // SAFETY: caller guarantees the prefix bytes below `user` belong
        // to this allocation; the write stays inside the backing region.
        unsafe {
            let header_ptr = user.sub(HEADER_SIZE).cast::<HeapHeader>();
            header_ptr.write(HeapHeader { size, align });
        }
    }
}

impl HeapBackend for SystemHeap {
    fn malloc(&self, size: usize, flags: AllocFlags) -> Option<NonNull<u8>> {
        self.malloc_aligned(size, DEFAULT_ALIGN, flags)
    }

    fn malloc_aligned(&self, size: usize, align: usize, _flags: AllocFlags) -> Option<NonNull<u8>> {
        assert!(
            is_power_of_two(align),
            "heap alignment {align} is not a power of two"
        );
        let size = size.max(1);
        let align = align.max(DEFAULT_ALIGN);
        let layout = Self::backing_layout(size, align)?;

        // SAFETY: layout has non-zero size (prefix >= DEFAULT_ALIGN).
        let base = unsafe { System.alloc(layout) };
        if base.is_null() {
            return None;
        }

        let user = unsafe {
            // SAFETY: the prefix is part of the freshly allocated region,
            // so both the offset and the header write are in bounds.
            let user = base.add(Self::prefix(align));
            Self::write_header(user, size, align);
            user
        };
        NonNull::new(user)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, _flags: AllocFlags) {
        // SAFETY: caller guarantees ptr is live and from this backend, so
        // the header below it is intact and describes the backing layout.
        unsafe {
            let header = Self::header(ptr);
            let layout = Self::backing_layout(header.size, header.align)
                .expect("heap header describes a valid layout");
            let base = ptr.as_ptr().sub(Self::prefix(header.align));
            System.dealloc(base, layout);
        }
    }

    unsafe fn realloc(
        &self,
        ptr: NonNull<u8>,
        new_size: usize,
        flags: AllocFlags,
    ) -> Option<NonNull<u8>> {
        let new_size = new_size.max(1);
        // SAFETY: caller guarantees ptr is live and from this backend.
        let header = unsafe { Self::header(ptr) };

        if header.align == DEFAULT_ALIGN {
            let old_layout = Self::backing_layout(header.size, header.align)?;
            let new_total = Self::prefix(header.align).checked_add(new_size)?;
            // SAFETY: base/old_layout describe the original allocation;
            // System.realloc preserves contents up to the smaller size.
            let new_base = unsafe {
                let base = ptr.as_ptr().sub(Self::prefix(header.align));
                System.realloc(base, old_layout, new_total)
            };
            if new_base.is_null() {
                return None;
            }
            let user = unsafe {
                // SAFETY: the moved region still begins with the prefix.
                let user = new_base.add(Self::prefix(header.align));
                Self::write_header(user, new_size, header.align);
                user
            };
            return NonNull::new(user);
        }

        // Over-aligned allocations go through allocate + copy + free.
        // SAFETY: forwarded contracts match the caller's.
        unsafe { self.realloc_aligned(ptr, new_size, header.align, flags) }
    }

    unsafe fn realloc_aligned(
        &self,
        ptr: NonNull<u8>,
        new_size: usize,
        align: usize,
        flags: AllocFlags,
    ) -> Option<NonNull<u8>> {
        let new_size = new_size.max(1);
        // SAFETY: caller guarantees ptr is live and from this backend.
        let header = unsafe { Self::header(ptr) };

        let new_ptr = self.malloc_aligned(new_size, align, flags)?;
        let copy = header.size.min(new_size);
        // SAFETY: both regions are live, disjoint, and at least `copy`
        // bytes long.
        unsafe {
            core::ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), copy);
            self.free(ptr, flags);
        }
        Some(new_ptr)
    }

    unsafe fn memsize(&self, ptr: NonNull<u8>) -> usize {
        // SAFETY: caller guarantees ptr is live and from this backend.
        unsafe { Self::header(ptr).size }
    }
}

impl fmt::Display for SystemHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("system heap")
    }
}
