//! Process-wide allocator façade.
//!
//! The façade is the `malloc`-shaped surface of the crate: raw pointers in
//! and out, null for "no memory", a lazily initialized process-wide
//! context behind it. Every call routes to the pool engine when pooling is
//! enabled, or straight to the heap backend otherwise, and optionally
//! reports to an attached [`AllocTracker`].
//!
//! The lazy one-time initialization uses [`OnceLock`], so two threads
//! racing into the first `allocate` observe a fully constructed context,
//! never a half-initialized one.

use core::ptr::{self, NonNull};
use std::alloc::Layout;
use std::sync::Arc;
use std::sync::OnceLock;

use parking_lot::RwLock;
use tracing::{error, warn};

use crate::config::EngineConfig;
use crate::engine::PoolEngine;
use crate::error::{AllocError, AllocResult};
use crate::flags::AllocFlags;
use crate::heap::{HeapBackend, SystemHeap, DEFAULT_ALIGN};
use crate::tracker::AllocTracker;

/// Default backing bytes per pool for the global context.
pub const DEFAULT_POOL_BYTES: usize = 16 * 1024;

/// Default largest block size the global context will pool.
pub const DEFAULT_GROWTH_CEILING: usize = 512;

/// Out-of-memory recovery policy.
///
/// Invoked with the failed request size; returning `true` asks the façade
/// to retry the allocation, `false` gives up (the call returns null).
pub type OomHandler = fn(usize) -> bool;

/// Construction-time configuration for a [`MemoryContext`].
pub struct FacadeConfig {
    /// Pool engine configuration.
    pub engine: EngineConfig,
    /// Route small requests through the pool engine. When `false` every
    /// call goes straight to the heap backend.
    pub pooling: bool,
    /// Optional usage tracker receiving every tracked event.
    pub tracker: Option<Arc<dyn AllocTracker>>,
    /// Report still-live allocations when [`MemoryContext::leak_check`]
    /// runs at shutdown.
    pub report_on_exit: bool,
    /// Abort the process on leaks, in addition to reporting. Only
    /// meaningful together with `report_on_exit`.
    pub crash_on_leak: bool,
}

impl Default for FacadeConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::dynamic("segalloc", DEFAULT_POOL_BYTES, DEFAULT_GROWTH_CEILING),
            pooling: true,
            tracker: None,
            report_on_exit: cfg!(debug_assertions),
            crash_on_leak: false,
        }
    }
}

/// Explicitly constructed allocator context.
///
/// The process-wide functions in this module run against a lazily built
/// global instance; embedders and tests can also hold their own.
pub struct MemoryContext {
    engine: PoolEngine,
    heap: Arc<dyn HeapBackend>,
    pooling: bool,
    tracker: Option<Arc<dyn AllocTracker>>,
    report_on_exit: bool,
    crash_on_leak: bool,
    oom_handler: RwLock<Option<OomHandler>>,
}

impl MemoryContext {
    /// Builds a context over the system heap.
    pub fn new(config: FacadeConfig) -> AllocResult<Self> {
        Self::with_backend(config, Arc::new(SystemHeap::new()))
    }

    /// Builds a context over a caller-supplied heap backend.
    pub fn with_backend(config: FacadeConfig, heap: Arc<dyn HeapBackend>) -> AllocResult<Self> {
        let engine = PoolEngine::new(config.engine, heap.clone())?;
        Ok(Self {
            engine,
            heap,
            pooling: config.pooling,
            tracker: config.tracker,
            report_on_exit: config.report_on_exit,
            crash_on_leak: config.crash_on_leak,
            oom_handler: RwLock::new(None),
        })
    }

    /// The pool engine behind this context.
    pub fn engine(&self) -> &PoolEngine {
        &self.engine
    }

    /// The attached tracker, if any.
    pub fn tracker(&self) -> Option<&Arc<dyn AllocTracker>> {
        self.tracker.as_ref()
    }

    /// Installs the out-of-memory recovery policy.
    pub fn set_oom_handler(&self, handler: OomHandler) {
        *self.oom_handler.write() = Some(handler);
    }

    /// Removes the out-of-memory recovery policy.
    pub fn clear_oom_handler(&self) {
        *self.oom_handler.write() = None;
    }

    /// Allocates `size` bytes, pool-tracked.
    ///
    /// Returns null only when an installed [`OomHandler`] declined a
    /// retry; with no handler installed an allocation failure is fatal.
    pub fn allocate(&self, size: usize) -> *mut u8 {
        let flags = AllocFlags::empty();
        loop {
            let got = if self.pooling {
                self.engine.allocate(size, flags).ok()
            } else {
                self.heap.malloc(size, flags)
            };
            if let Some(ptr) = got {
                self.report_alloc(ptr, flags);
                return ptr.as_ptr();
            }
            if !self.oom_policy(size) {
                return ptr::null_mut();
            }
        }
    }

    /// Releases an allocation. No-op on null.
    ///
    /// # Safety
    /// `ptr` must be null or a live pointer previously returned by this
    /// context.
    pub unsafe fn deallocate(&self, ptr: *mut u8) {
        let Some(ptr) = NonNull::new(ptr) else { return };
        let flags = AllocFlags::empty();
        // SAFETY: ptr is live per the caller's contract.
        unsafe {
            self.report_free(ptr, flags);
            if self.pooling {
                self.engine.deallocate(ptr, flags);
            } else {
                self.heap.free(ptr, flags);
            }
        }
    }

    /// Resizes an allocation; null behaves as [`allocate`](Self::allocate).
    ///
    /// May return a different address; contents are preserved up to the
    /// smaller of the old usable size and `new_size`. On failure the
    /// original allocation stays live and the out-of-memory policy runs.
    ///
    /// # Safety
    /// `ptr` must be null or a live pointer previously returned by this
    /// context.
    pub unsafe fn reallocate(&self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        let Some(old) = NonNull::new(ptr) else {
            return self.allocate(new_size);
        };
        let flags = AllocFlags::empty();
        // Describe the old allocation up front: once the move succeeds the
        // old address is dead and must not be inspected again.
        // SAFETY: old is live per the caller's contract.
        let old_report = self
            .tracker
            .as_ref()
            .map(|_| unsafe { self.describe(old, flags) });
        loop {
            // SAFETY: old is live per the caller's contract (still live
            // after a failed attempt).
            let moved = unsafe {
                if self.pooling {
                    self.engine.reallocate(old, new_size, flags).ok()
                } else {
                    self.heap.realloc(old, new_size, flags)
                }
            };
            if let Some(new_ptr) = moved {
                if new_ptr != old {
                    if let (Some(tracker), Some((size, old_flags))) =
                        (&self.tracker, old_report)
                    {
                        if old_flags.is_tracked() {
                            tracker.record_free(old.as_ptr() as usize, size, old_flags);
                        }
                    }
                    self.report_alloc(new_ptr, flags);
                }
                return new_ptr.as_ptr();
            }
            if !self.oom_policy(new_size) {
                return ptr::null_mut();
            }
        }
    }

    /// Usable size of a live allocation; 0 for null.
    ///
    /// # Safety
    /// `ptr` must be null or a live pointer previously returned by this
    /// context.
    pub unsafe fn memory_size(&self, ptr: *mut u8) -> usize {
        let Some(ptr) = NonNull::new(ptr) else { return 0 };
        // SAFETY: ptr is live per the caller's contract.
        unsafe {
            if self.pooling {
                self.engine.usable_size(ptr)
            } else {
                self.heap.memsize(ptr)
            }
        }
    }

    /// Allocates straight from the heap backend, bypassing every pool.
    pub fn heap_allocate(&self, size: usize) -> *mut u8 {
        self.heap_allocate_aligned(size, DEFAULT_ALIGN)
    }

    /// Heap allocation with a caller-chosen alignment (a power of two).
    pub fn heap_allocate_aligned(&self, size: usize, align: usize) -> *mut u8 {
        let flags = AllocFlags::empty();
        loop {
            if let Some(ptr) = self.heap.malloc_aligned(size, align, flags) {
                self.report_alloc(ptr, flags);
                return ptr.as_ptr();
            }
            if !self.oom_policy(size) {
                return ptr::null_mut();
            }
        }
    }

    /// Releases a heap allocation. No-op on null.
    ///
    /// # Safety
    /// `ptr` must be null or live memory from this context's heap entry
    /// points.
    pub unsafe fn heap_deallocate(&self, ptr: *mut u8) {
        let Some(ptr) = NonNull::new(ptr) else { return };
        let flags = AllocFlags::empty();
        // SAFETY: ptr is live heap memory per the caller's contract.
        unsafe {
            self.report_free(ptr, flags);
            self.heap.free(ptr, flags);
        }
    }

    /// Resizes a heap allocation, never involving a pool.
    ///
    /// # Safety
    /// `ptr` must be null or live memory from this context's heap entry
    /// points.
    pub unsafe fn heap_reallocate(&self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        // SAFETY: forwarded caller contract.
        unsafe { self.heap_reallocate_aligned(ptr, new_size, DEFAULT_ALIGN) }
    }

    /// Heap reallocation with a caller-chosen alignment.
    ///
    /// # Safety
    /// `ptr` must be null or live memory from this context's heap entry
    /// points.
    pub unsafe fn heap_reallocate_aligned(
        &self,
        ptr: *mut u8,
        new_size: usize,
        align: usize,
    ) -> *mut u8 {
        let Some(old) = NonNull::new(ptr) else {
            return self.heap_allocate_aligned(new_size, align);
        };
        let flags = AllocFlags::empty();
        // SAFETY: old is live per the caller's contract; described before
        // the move can consume it.
        let old_size = self
            .tracker
            .as_ref()
            .map(|_| unsafe { self.heap.memsize(old) });
        loop {
            // SAFETY: old is live per the caller's contract.
            let moved = unsafe { self.heap.realloc_aligned(old, new_size, align, flags) };
            if let Some(new_ptr) = moved {
                if new_ptr != old {
                    if let (Some(tracker), Some(size)) = (&self.tracker, old_size) {
                        tracker.record_free(old.as_ptr() as usize, size, flags);
                    }
                    self.report_alloc(new_ptr, flags);
                }
                return new_ptr.as_ptr();
            }
            if !self.oom_policy(new_size) {
                return ptr::null_mut();
            }
        }
    }

    /// Shutdown leak check.
    ///
    /// Returns the number of tracked allocations still live. When
    /// `report_on_exit` is set the count is reported; when `crash_on_leak`
    /// is also set and anything leaked, the process aborts.
    pub fn leak_check(&self) -> usize {
        let Some(tracker) = &self.tracker else { return 0 };
        let leaked = tracker.live_allocations();
        if self.report_on_exit && leaked > 0 {
            warn!(
                leaked,
                bytes = tracker.live_bytes(),
                "allocations still live at shutdown"
            );
            if self.crash_on_leak {
                error!("aborting: leak detected with crash_on_leak set");
                std::process::abort();
            }
        }
        leaked
    }

    /// Runs the out-of-memory policy for a failed request.
    ///
    /// Returns whether the caller should retry. With no handler installed
    /// the failure is unrecoverable and the process terminates.
    fn oom_policy(&self, requested: usize) -> bool {
        let handler = *self.oom_handler.read();
        match handler {
            Some(handler) => {
                warn!(requested, "allocation failed, invoking out-of-memory handler");
                handler(requested)
            }
            None => {
                let layout = Layout::from_size_align(requested.max(1), DEFAULT_ALIGN)
                    .unwrap_or(Layout::new::<usize>());
                std::alloc::handle_alloc_error(layout)
            }
        }
    }

    /// Reports a fresh allocation to the tracker, if tracked.
    fn report_alloc(&self, ptr: NonNull<u8>, flags: AllocFlags) {
        let Some(tracker) = &self.tracker else { return };
        if !flags.is_tracked() {
            return;
        }
        // SAFETY: ptr was just produced by this context and is live.
        let (size, flags) = unsafe { self.describe(ptr, flags) };
        tracker.record_alloc(ptr.as_ptr() as usize, size, flags);
    }

    /// Reports a deallocation to the tracker, if tracked.
    ///
    /// # Safety
    /// `ptr` must still be live; the report runs before the memory is
    /// released.
    unsafe fn report_free(&self, ptr: NonNull<u8>, flags: AllocFlags) {
        let Some(tracker) = &self.tracker else { return };
        if !flags.is_tracked() {
            return;
        }
        // SAFETY: forwarded caller contract.
        let (size, flags) = unsafe { self.describe(ptr, flags) };
        tracker.record_free(ptr.as_ptr() as usize, size, flags);
    }

    /// Usable size and origin flags of a live allocation.
    ///
    /// # Safety
    /// `ptr` must be live.
    unsafe fn describe(&self, ptr: NonNull<u8>, flags: AllocFlags) -> (usize, AllocFlags) {
        // SAFETY: forwarded caller contract.
        unsafe {
            if self.pooling {
                match self.engine.pooled_size(ptr) {
                    Some(size) => (size, flags | AllocFlags::POOL_ALLOC),
                    None => (self.heap.memsize(ptr), flags),
                }
            } else {
                (self.heap.memsize(ptr), flags)
            }
        }
    }
}

impl core::fmt::Debug for MemoryContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MemoryContext")
            .field("engine", &self.engine)
            .field("pooling", &self.pooling)
            .field("tracked", &self.tracker.is_some())
            .finish_non_exhaustive()
    }
}

static GLOBAL: OnceLock<MemoryContext> = OnceLock::new();

/// Explicitly initializes the process-wide context.
///
/// Idempotence is first-caller-wins: a second call (or a call after a lazy
/// first allocation) fails with [`AllocError::InvalidState`].
pub fn init(config: FacadeConfig) -> AllocResult<()> {
    let context = MemoryContext::new(config)?;
    GLOBAL
        .set(context)
        .map_err(|_| AllocError::InvalidState("global allocator already initialized"))
}

/// Initializes the process-wide context with the default configuration,
/// the same one a lazy first allocation would build.
pub fn init_default() -> AllocResult<()> {
    init(FacadeConfig::default())
}

/// Whether the process-wide context exists yet.
pub fn is_initialized() -> bool {
    GLOBAL.get().is_some()
}

fn global() -> &'static MemoryContext {
    GLOBAL.get_or_init(|| {
        MemoryContext::new(FacadeConfig::default()).expect("default configuration is valid")
    })
}

/// Process-wide [`MemoryContext::allocate`]; initializes the context on
/// first use.
pub fn allocate(size: usize) -> *mut u8 {
    global().allocate(size)
}

/// Process-wide [`MemoryContext::deallocate`].
///
/// # Safety
/// `ptr` must be null or a live pointer from this module's entry points.
pub unsafe fn deallocate(ptr: *mut u8) {
    // SAFETY: forwarded caller contract.
    unsafe { global().deallocate(ptr) }
}

/// Process-wide [`MemoryContext::reallocate`].
///
/// # Safety
/// `ptr` must be null or a live pointer from this module's entry points.
pub unsafe fn reallocate(ptr: *mut u8, new_size: usize) -> *mut u8 {
    // SAFETY: forwarded caller contract.
    unsafe { global().reallocate(ptr, new_size) }
}

/// Process-wide [`MemoryContext::memory_size`].
///
/// # Safety
/// `ptr` must be null or a live pointer from this module's entry points.
pub unsafe fn memory_size(ptr: *mut u8) -> usize {
    // SAFETY: forwarded caller contract.
    unsafe { global().memory_size(ptr) }
}

/// Process-wide [`MemoryContext::heap_allocate`].
pub fn heap_allocate(size: usize) -> *mut u8 {
    global().heap_allocate(size)
}

/// Process-wide [`MemoryContext::heap_allocate_aligned`].
pub fn heap_allocate_aligned(size: usize, align: usize) -> *mut u8 {
    global().heap_allocate_aligned(size, align)
}

/// Process-wide [`MemoryContext::heap_deallocate`].
///
/// # Safety
/// `ptr` must be null or live memory from this module's heap entry points.
pub unsafe fn heap_deallocate(ptr: *mut u8) {
    // SAFETY: forwarded caller contract.
    unsafe { global().heap_deallocate(ptr) }
}

/// Process-wide [`MemoryContext::heap_reallocate`].
///
/// # Safety
/// `ptr` must be null or live memory from this module's heap entry points.
pub unsafe fn heap_reallocate(ptr: *mut u8, new_size: usize) -> *mut u8 {
    // SAFETY: forwarded caller contract.
    unsafe { global().heap_reallocate(ptr, new_size) }
}

/// Process-wide [`MemoryContext::heap_reallocate_aligned`].
///
/// # Safety
/// `ptr` must be null or live memory from this module's heap entry points.
pub unsafe fn heap_reallocate_aligned(ptr: *mut u8, new_size: usize, align: usize) -> *mut u8 {
    // SAFETY: forwarded caller contract.
    unsafe { global().heap_reallocate_aligned(ptr, new_size, align) }
}

/// Installs the process-wide out-of-memory handler.
pub fn set_oom_handler(handler: OomHandler) {
    global().set_oom_handler(handler);
}

/// Removes the process-wide out-of-memory handler.
pub fn clear_oom_handler() {
    global().clear_oom_handler();
}

/// Shutdown leak check against the process-wide context.
///
/// Returns the leaked-allocation count (0 when the context was never
/// created or has no tracker). The context itself stays alive for the rest
/// of the process, like any process-wide allocator.
pub fn fini() -> usize {
    GLOBAL.get().map_or(0, MemoryContext::leak_check)
}
