//! Run-loop benchmarks using criterion.
//!
//! Benchmarks for map fusion, bind chains, async boundaries, and
//! cancellation stacks.
//!
//! Run with: cargo bench --bench run_loop_bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ember_runtime::{Connection, Deferred, IO};

/// Benchmark chains of `map`
fn bench_map_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("map_chain");

    for size in [100u64, 1_000, 10_000] {
        group.throughput(Throughput::Elements(size));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let mut io = IO::pure(0u64);
                for _ in 0..size {
                    io = io.map(|n| n + 1);
                }
                black_box(io.unsafe_run_sync().unwrap())
            });
        });
    }

    group.finish();
}

/// Benchmark chains of `flat_map`
fn bench_flat_map_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("flat_map_chain");

    for size in [100u64, 1_000, 10_000] {
        group.throughput(Throughput::Elements(size));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let mut io = IO::pure(0u64);
                for _ in 0..size {
                    io = io.flat_map(|n| IO::pure(n + 1));
                }
                black_box(io.unsafe_run_sync().unwrap())
            });
        });
    }

    group.finish();
}

/// Benchmark async boundaries resumed through the trampoline
fn bench_async_boundaries(c: &mut Criterion) {
    let mut group = c.benchmark_group("async_boundaries");

    group.bench_function("sync_callback_x1000", |b| {
        b.iter(|| {
            let mut io = IO::pure(0u64);
            for _ in 0..1_000 {
                io = io.flat_map(|n| {
                    IO::async_(move |cb| {
                        cb.complete(n + 1);
                    })
                });
            }
            black_box(io.unsafe_run_sync().unwrap())
        });
    });

    group.bench_function("deferred_get_set", |b| {
        b.iter(|| {
            let d = Deferred::<u64>::new();
            let reader = d.get();
            d.try_complete(7);
            black_box(reader.unsafe_run_sync().unwrap())
        });
    });

    group.bench_function("shift", |b| {
        b.iter(|| black_box(IO::shift().as_(1).unsafe_run_sync().unwrap()));
    });

    group.finish();
}

/// Benchmark connection push/pop and cancel
fn bench_connection(c: &mut Criterion) {
    let mut group = c.benchmark_group("connection");

    group.bench_function("push_pop", |b| {
        let conn = Connection::new();
        b.iter(|| {
            conn.push(IO::unit());
            black_box(conn.pop())
        });
    });

    group.bench_function("cancel_100_tokens", |b| {
        b.iter(|| {
            let conn = Connection::new();
            for _ in 0..100 {
                conn.push(IO::unit());
            }
            black_box(conn.cancel().unsafe_run_sync().unwrap())
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_map_chain,
    bench_flat_map_chain,
    bench_async_boundaries,
    bench_connection,
);

criterion_main!(benches);
