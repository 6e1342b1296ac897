//! WAL append and replay benchmarks

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tempfile::TempDir;
use tidekv_core::keyspace::Keyspace;
use tidekv_core::resp::encode_command;
use tidekv_core::wal::{replay_segments, FsyncPolicy, Wal, WalConfig};

fn wal_config(dir: &TempDir, fsync: FsyncPolicy) -> WalConfig {
    WalConfig {
        dir: dir.path().to_path_buf(),
        fsync,
        ..Default::default()
    }
}

fn bench_wal_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("wal_append");
    let record = encode_command(&["SET", "benchmark_key", "benchmark_value"]);

    for (name, fsync) in [("no", FsyncPolicy::No), ("everysec", FsyncPolicy::Everysec)] {
        group.bench_function(BenchmarkId::new("fsync", name), |b| {
            let dir = TempDir::new().unwrap();
            let wal = Wal::open(wal_config(&dir, fsync), 0).unwrap();
            b.iter(|| wal.append(black_box(&record)).unwrap());
            wal.quit().unwrap();
        });
    }

    group.finish();
}

fn bench_wal_replay(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let wal = Wal::open(wal_config(&dir, FsyncPolicy::No), 0).unwrap();
    for i in 0..10_000 {
        let key = format!("key_{}", i % 1000);
        wal.append(&encode_command(&["SET", key.as_str(), "value"])).unwrap();
    }
    wal.quit().unwrap();

    c.bench_function("wal_replay_10k", |b| {
        b.iter(|| {
            let keyspace = Keyspace::new(16);
            replay_segments(dir.path(), 0, &keyspace).unwrap()
        });
    });
}

criterion_group!(benches, bench_wal_append, bench_wal_replay);
criterion_main!(benches);
