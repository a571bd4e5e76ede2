// Benchmark upstream selection and probe bookkeeping at different pool sizes

use balancer::UpstreamSet;
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use std::path::PathBuf;
use std::time::{Duration, Instant};

fn ready_set(size: usize) -> UpstreamSet {
    let mut set = UpstreamSet::new();
    for i in 0..size {
        let socket = PathBuf::from(format!("/tmp/rip-bench-{}.sock", i));
        set.insert(socket.clone());
        set.set_ready(&socket, true);
    }
    set
}

fn bench_acquire_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("acquire_release");

    for size in [4, 16, 64] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let mut set = ready_set(size);
            let now = Instant::now();
            b.iter(|| {
                if let Some(socket) = set.acquire_next(black_box(now)) {
                    set.release(&socket);
                }
            });
        });
    }

    group.finish();
}

fn bench_mostly_busy(c: &mut Criterion) {
    let mut group = c.benchmark_group("mostly_busy");

    // Every socket but the last is quarantined, so each scan walks the table
    for size in [16, 64] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let mut set = ready_set(size);
            let now = Instant::now();
            for i in 0..size - 1 {
                let socket = PathBuf::from(format!("/tmp/rip-bench-{}.sock", i));
                set.quarantine(&socket, now + Duration::from_secs(3600));
            }
            b.iter(|| {
                if let Some(socket) = set.acquire_next(black_box(now)) {
                    set.release(&socket);
                }
            });
        });
    }

    group.finish();
}

fn bench_probe_targets(c: &mut Criterion) {
    let set = ready_set(64);
    let now = Instant::now();
    c.bench_function("probe_targets_64", |b| {
        b.iter(|| black_box(set.probe_targets(black_box(now))));
    });
}

criterion_group!(
    benches,
    bench_acquire_release,
    bench_mostly_busy,
    bench_probe_targets
);
criterion_main!(benches);
