use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use detexec::canonical;
use detexec::cas::CasStore;
use detexec::{Digest, ExecutionRequest};

fn bench_digest(c: &mut Criterion) {
    let mut group = c.benchmark_group("blake3");
    for size in [64usize, 4096, 1 << 20] {
        let data = vec![0xA5u8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| black_box(Digest::of(data)));
        });
    }
    group.finish();
}

fn bench_canonical_request(c: &mut Criterion) {
    let mut req = ExecutionRequest::new("/usr/bin/env", (0..32).map(|i| format!("arg-{i}")).collect());
    req.env = (0..32).map(|i| (format!("KEY_{i}"), format!("value-{i}"))).collect();
    c.bench_function("request_digest", |b| {
        b.iter(|| black_box(canonical::request_digest(black_box(&req))));
    });
}

fn bench_cas_put_get(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = CasStore::open(dir.path()).unwrap();
    let data = vec![7u8; 64 * 1024];
    let digest = store.put(&data).unwrap();
    c.bench_function("cas_put_existing_64k", |b| {
        b.iter(|| black_box(store.put(&data).unwrap()));
    });
    c.bench_function("cas_get_verified_64k", |b| {
        b.iter(|| black_box(store.get(&digest).unwrap()));
    });
}

criterion_group!(benches, bench_digest, bench_canonical_request, bench_cas_put_get);
criterion_main!(benches);
