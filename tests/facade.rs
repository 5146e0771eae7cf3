//! Integration test for the process-wide façade.
//!
//! The global context initializes once per process, so everything that
//! touches it lives in a single test function.

use std::sync::Arc;

use segalloc::config::{DebugChecks, EngineConfig};
use segalloc::facade::{self, FacadeConfig};
use segalloc::tracker::{AllocTracker, StatsTracker};

#[test]
fn global_facade_lifecycle() {
    let tracker = Arc::new(StatsTracker::new());
    let config = FacadeConfig {
        engine: EngineConfig::fixed("global-test", 4096, vec![16, 32, 64])
            .with_checks(DebugChecks::debug()),
        pooling: true,
        tracker: Some(tracker.clone()),
        report_on_exit: true,
        crash_on_leak: false,
    };

    assert!(!facade::is_initialized());
    facade::init(config).expect("first init succeeds");
    assert!(facade::is_initialized());

    // Second explicit init is rejected; first caller wins.
    assert!(facade::init(FacadeConfig::default()).is_err());

    // Pool-tracked round trip.
    let ptr = facade::allocate(20);
    assert!(!ptr.is_null());
    unsafe {
        assert_eq!(facade::memory_size(ptr), 32);
        std::ptr::write_bytes(ptr, 0xC3, 20);
        assert_eq!(*ptr.add(19), 0xC3);
    }
    assert_eq!(tracker.live_allocations(), 1);

    // Same class: the address survives reallocation.
    let same = unsafe { facade::reallocate(ptr, 32) };
    assert_eq!(ptr, same);

    // Cross-class: contents move.
    let moved = unsafe { facade::reallocate(same, 64) };
    assert!(!moved.is_null());
    unsafe {
        assert_eq!(*moved.add(19), 0xC3);
        assert_eq!(facade::memory_size(moved), 64);
        facade::deallocate(moved);
    }
    assert_eq!(tracker.live_allocations(), 0);

    // Null handling mirrors the C contract.
    unsafe {
        facade::deallocate(std::ptr::null_mut());
        assert_eq!(facade::memory_size(std::ptr::null_mut()), 0);
        let from_null = facade::reallocate(std::ptr::null_mut(), 16);
        assert!(!from_null.is_null());
        facade::deallocate(from_null);
    }

    // Heap entry points bypass pooling entirely.
    let big = facade::heap_allocate(1000);
    let aligned = facade::heap_allocate_aligned(64, 256);
    assert!(!big.is_null());
    assert_eq!(aligned as usize % 256, 0);
    unsafe {
        assert_eq!(facade::memory_size(big), 1000);
        let grown = facade::heap_reallocate(big, 2000);
        assert_eq!(facade::memory_size(grown), 2000);
        facade::heap_deallocate(grown);
        facade::heap_deallocate(aligned);
    }

    // A retry-declining handler turns OOM into a null return rather than
    // a fatal error; installing and clearing it must not disturb anything.
    facade::set_oom_handler(|_| false);
    facade::clear_oom_handler();

    // Everything returned: shutdown sees no leaks.
    assert_eq!(facade::fini(), 0);

    // Leak one block and re-check.
    let leaked = facade::allocate(16);
    assert!(!leaked.is_null());
    assert_eq!(facade::fini(), 1);
    unsafe { facade::deallocate(leaked) };
    assert_eq!(facade::fini(), 0);
}
