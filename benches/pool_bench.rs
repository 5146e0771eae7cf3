//! Pooled vs heap-fallback allocation throughput.

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use segalloc::config::{DebugChecks, EngineConfig};
use segalloc::engine::PoolEngine;
use segalloc::flags::AllocFlags;
use segalloc::heap::SystemHeap;

fn alloc_free(c: &mut Criterion) {
    let config = EngineConfig::fixed("bench", 64 * 1024, vec![16, 32, 64, 128])
        .with_checks(DebugChecks::production());
    let engine = PoolEngine::new(config, Arc::new(SystemHeap::new())).unwrap();

    // Keep one block live so the benched pool is not destroyed and
    // recreated on every iteration.
    let keeper = engine.allocate(64, AllocFlags::empty()).unwrap();

    c.bench_function("pooled_alloc_free_64", |b| {
        b.iter(|| {
            let ptr = engine.allocate(64, AllocFlags::empty()).unwrap();
            unsafe { engine.deallocate(ptr, AllocFlags::empty()) };
        })
    });

    c.bench_function("heap_fallback_alloc_free_4096", |b| {
        b.iter(|| {
            let ptr = engine.allocate(4096, AllocFlags::empty()).unwrap();
            unsafe { engine.deallocate(ptr, AllocFlags::empty()) };
        })
    });

    unsafe { engine.deallocate(keeper, AllocFlags::empty()) };
}

criterion_group!(benches, alloc_free);
criterion_main!(benches);
