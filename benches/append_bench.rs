// Append throughput under concurrent producers, in the style of the
// teacher's pin/unpin benchmarks: a fresh log per benchmark group, varying
// payload size.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use durable_log::{Log, LogConfig};
use tempfile::TempDir;

fn open_log(rt: &tokio::runtime::Runtime) -> (std::sync::Arc<Log>, TempDir) {
    let dir = TempDir::new().unwrap();
    let log = rt.block_on(Log::open(LogConfig {
        directory: dir.path().to_path_buf(),
        page_size_bits: 20, // 1 MiB pages, roomy enough to avoid rotation noise
        pages_in_memory: 8,
        ..LogConfig::default()
    }))
    .unwrap();
    (log, dir)
}

fn bench_single_threaded_append(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("append_single_threaded");

    for payload_size in [64usize, 256, 4096] {
        let (log, _dir) = open_log(&rt);
        let payload = vec![0xABu8; payload_size];
        group.bench_with_input(
            BenchmarkId::from_parameter(payload_size),
            &payload,
            |b, payload| {
                b.iter(|| {
                    black_box(log.enqueue(payload));
                });
            },
        );
    }
    group.finish();
}

fn bench_append_then_commit(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("append_then_commit");
    let (log, _dir) = open_log(&rt);
    let payload = vec![0xCDu8; 256];

    group.bench_function("enqueue_and_wait_for_commit", |b| {
        b.to_async(&rt).iter(|| async {
            black_box(log.enqueue_and_wait_for_commit(&payload).await.unwrap());
        });
    });
    group.finish();
}

criterion_group!(benches, bench_single_threaded_append, bench_append_then_commit);
criterion_main!(benches);
