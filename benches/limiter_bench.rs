//! Benchmarks for the capacity limiter.
//!
//! Covers the uncontended fast paths: non-blocking reservation, the
//! suspending reserve when capacity is plentiful, reconciliation, and stats
//! snapshots.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;

use tokio::runtime::Runtime;

use workload_governor::config::CapacityConfig;
use workload_governor::core::CapacityLimiter;

/// A limiter generous enough that reservations never wait.
fn uncontended_limiter() -> CapacityLimiter {
    CapacityLimiter::new(CapacityConfig {
        max_tokens_per_minute: 1e12,
        max_requests_per_minute: 1e12,
        burst_capacity: 1e12,
        penalty_seconds: None,
    })
    .unwrap()
}

fn bench_try_reserve(c: &mut Criterion) {
    let mut group = c.benchmark_group("try_reserve");

    for count in [100_u64, 1_000, 10_000] {
        group.throughput(Throughput::Elements(count));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| {
                let limiter = uncontended_limiter();
                for _ in 0..count {
                    black_box(limiter.try_reserve(1.0));
                }
            });
        });
    }
    group.finish();
}

fn bench_reserve_fast_path(c: &mut Criterion) {
    let mut group = c.benchmark_group("reserve_fast_path");

    for count in [100_u64, 1_000] {
        group.throughput(Throughput::Elements(count));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.to_async(Runtime::new().unwrap()).iter(|| async move {
                let limiter = uncontended_limiter();
                for _ in 0..count {
                    limiter.reserve(1.0).await;
                }
            });
        });
    }
    group.finish();
}

fn bench_reserve_reconcile_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("reserve_reconcile_cycle");

    group.bench_function("estimate_then_settle", |b| {
        b.to_async(Runtime::new().unwrap()).iter(|| async {
            let limiter = uncontended_limiter();
            for i in 0..500_u64 {
                limiter.reserve(10.0).await;
                // Settle at a different actual than the estimate.
                limiter.reconcile(if i % 2 == 0 { 4.0 } else { 14.0 });
            }
        });
    });
    group.finish();
}

fn bench_usage_stats(c: &mut Criterion) {
    let mut group = c.benchmark_group("usage_stats");

    group.bench_function("snapshot", |b| {
        let limiter = uncontended_limiter();
        for _ in 0..32 {
            assert!(limiter.try_reserve(5.0));
        }
        b.iter(|| {
            black_box(limiter.usage_stats());
        });
    });
    group.finish();
}

criterion_group!(
    limiter_benches,
    bench_try_reserve,
    bench_reserve_fast_path,
    bench_reserve_reconcile_cycle,
    bench_usage_stats
);

criterion_main!(limiter_benches);
