//! Replication backlog performance benchmarks

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tidekv_core::replication::Backlog;
use tidekv_core::resp::encode_command;

fn bench_backlog_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("backlog_append");
    let record = encode_command(&["SET", "benchmark_key", "benchmark_value"]);
    group.throughput(Throughput::Bytes(record.len() as u64));

    for capacity in [64 * 1024, 1024 * 1024].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(capacity), capacity, |b, &capacity| {
            let mut backlog = Backlog::new(capacity, 0).unwrap();
            b.iter(|| backlog.append(black_box(&record)).unwrap());
        });
    }

    group.finish();
}

fn bench_backlog_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("backlog_read");
    let mut backlog = Backlog::new(1024 * 1024, 0).unwrap();
    let record = encode_command(&["SET", "benchmark_key", "benchmark_value"]);
    while backlog.histlen() < backlog.capacity() as u64 * 2 {
        backlog.append(&record).unwrap();
    }

    for chunk in [4 * 1024, 64 * 1024].iter() {
        group.throughput(Throughput::Bytes(*chunk as u64));
        group.bench_with_input(BenchmarkId::new("chunk", chunk), chunk, |b, &chunk| {
            let from = backlog.low_water();
            b.iter(|| backlog.read(black_box(from), chunk));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_backlog_append, bench_backlog_read);
criterion_main!(benches);
