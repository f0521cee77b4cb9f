#![allow(clippy::expect_used)]

use std::time::Duration;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use tokio::runtime::Runtime;
use touno_core_storage::{
    ExpiringCache,
    testutil::{ManualClock, memory_cache},
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const TTL: Duration = Duration::from_secs(3600);

fn rt() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime")
}

fn make_key(idx: usize) -> String {
    format!("{idx:08x}-0000-4000-8000-000000000000")
}

/// A cache pre-populated with `count` entries of `value_size` bytes.
fn populated_cache(
    rt: &Runtime,
    clock: &ManualClock,
    count: usize,
    value_size: usize,
) -> ExpiringCache {
    let (_db, cache) = memory_cache("bench", clock);
    let value = vec![0xAB; value_size];
    rt.block_on(async {
        for i in 0..count {
            cache.set(&make_key(i), &value, TTL).await.expect("populate set failed");
        }
    });
    cache
}

// ---------------------------------------------------------------------------
// 1. get_operations
// ---------------------------------------------------------------------------

fn get_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("get_operations");
    let rt = rt();
    let clock = ManualClock::default();

    // A DER-encoded RSA-2048 public key is 270 bytes.
    for &value_size in &[270, 4096] {
        let cache = populated_cache(&rt, &clock, 1, value_size);
        let key = make_key(0);
        group.throughput(Throughput::Bytes(value_size as u64));
        group.bench_with_input(BenchmarkId::new("hit", value_size), &value_size, |b, _| {
            b.to_async(&rt).iter(|| {
                let cache = cache.clone();
                let key = key.clone();
                async move {
                    cache.get(&key).await.expect("get failed");
                }
            });
        });
    }

    {
        let cache = populated_cache(&rt, &clock, 1, 270);
        group.bench_function("miss", |b| {
            b.to_async(&rt).iter(|| {
                let cache = cache.clone();
                async move {
                    let result = cache.get("missing").await.expect("get failed");
                    assert!(result.is_none());
                }
            });
        });
    }

    group.finish();
}

// ---------------------------------------------------------------------------
// 2. set_operations
// ---------------------------------------------------------------------------

fn set_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("set_operations");
    let rt = rt();
    let clock = ManualClock::default();

    {
        let (_db, cache) = memory_cache("bench", &clock);
        let counter = std::sync::atomic::AtomicUsize::new(0);
        group.bench_function("new_key", |b| {
            b.to_async(&rt).iter(|| {
                let cache = cache.clone();
                let idx = counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                async move {
                    cache.set(&make_key(idx), &[0xAB; 270], TTL).await.expect("set failed");
                }
            });
        });
    }

    {
        let cache = populated_cache(&rt, &clock, 1, 270);
        let key = make_key(0);
        group.bench_function("overwrite_existing", |b| {
            b.to_async(&rt).iter(|| {
                let cache = cache.clone();
                let key = key.clone();
                async move {
                    cache.set(&key, &[0xCD; 270], TTL).await.expect("set failed");
                }
            });
        });
    }

    group.finish();
}

// ---------------------------------------------------------------------------
// 3. gc_operations
// ---------------------------------------------------------------------------

fn gc_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("gc_operations");
    let rt = rt();

    for &count in &[100, 1_000] {
        group.bench_with_input(BenchmarkId::new("nothing_expired", count), &count, |b, &count| {
            let clock = ManualClock::default();
            let cache = populated_cache(&rt, &clock, count, 270);
            b.to_async(&rt).iter(|| {
                let cache = cache.clone();
                async move {
                    let removed = cache.gc().await.expect("gc failed");
                    assert_eq!(removed, 0);
                }
            });
        });
    }

    group.finish();
}

// ---------------------------------------------------------------------------
// Group registration
// ---------------------------------------------------------------------------

criterion_group!(benches, get_operations, set_operations, gc_operations);
criterion_main!(benches);
