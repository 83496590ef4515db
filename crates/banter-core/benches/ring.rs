//! Event ring benchmarks for banter-core.

use banter_core::EventRing;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

fn bench_publish_consume(c: &mut Criterion) {
    let ring = EventRing::with_capacity(1024);

    let mut group = c.benchmark_group("ring");
    group.throughput(Throughput::Elements(1));
    group.bench_function("publish_consume", |b| {
        b.iter(|| {
            ring.try_publish(black_box(42u64)).unwrap();
            ring.try_consume().unwrap()
        })
    });
    group.finish();
}

fn bench_burst_drain(c: &mut Criterion) {
    let ring = EventRing::with_capacity(1024);

    let mut group = c.benchmark_group("ring");
    group.throughput(Throughput::Elements(1024));
    group.bench_function("burst_1024", |b| {
        b.iter(|| {
            for i in 0..1024u64 {
                ring.try_publish(black_box(i)).unwrap();
            }
            for _ in 0..1024 {
                ring.try_consume().unwrap();
            }
        })
    });
    group.finish();
}

criterion_group!(benches, bench_publish_consume, bench_burst_drain);
criterion_main!(benches);
