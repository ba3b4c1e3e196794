//! Filter throughput benchmarks
//!
//! Run with: `cargo bench --bench filters`
//! Compare baselines: `cargo bench --bench filters -- --baseline main`
//!
//! Measures whole-object passes through the fetch and delivery filters
//! for a few body sizes, plus the cost of flush points on compress.

use bytes::Bytes;
use cache_gzip::{
    DeliveryFilter, Fetch, FetchFilter, FetchMode, GzipConfig, InMemoryObject, Pull, ScriptedBackend,
};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

fn body(len: usize) -> Vec<u8> {
    b"<li class=\"item\">cached fragment with some repetition</li>\n"
        .iter()
        .copied()
        .cycle()
        .take(len)
        .collect()
}

/// One complete fetch, returning the stored object
fn fetch(mode: FetchMode, config: &GzipConfig, data: &[u8], align_every: Option<usize>) -> InMemoryObject {
    let mut fetch = Fetch::new(InMemoryObject::new(config.segment_size));
    let mut backend = ScriptedBackend::chunked(data, config.chunk_size);
    let mut filter: FetchFilter = FetchFilter::begin(mode, config).unwrap();
    let budget = align_every.unwrap_or(config.chunk_size);
    while filter.bytes(&mut fetch, &mut backend, budget).unwrap() == Pull::Budget {
        if align_every.is_some() {
            filter.align(&mut fetch).unwrap();
        }
    }
    filter.end(&mut fetch).unwrap();
    fetch.into_object()
}

/// Benchmark compress-on-fetch
fn bench_fetch_gzip(c: &mut Criterion) {
    let mut group = c.benchmark_group("fetch_gzip");
    let config = GzipConfig::default();

    for len in [4 * 1024, 64 * 1024, 1024 * 1024] {
        let data = body(len);
        group.throughput(Throughput::Bytes(len as u64));
        group.bench_function(format!("bytes_{}", len), |b| {
            b.iter(|| fetch(FetchMode::Gzip, &config, black_box(&data), None))
        });
    }

    // Flush point every 16KB (resumable compressed objects)
    let data = body(1024 * 1024);
    group.throughput(Throughput::Bytes(data.len() as u64));
    group.bench_function("align_16k", |b| {
        b.iter(|| fetch(FetchMode::Gzip, &config, black_box(&data), Some(16 * 1024)))
    });

    group.finish();
}

/// Benchmark decompress-on-fetch against validate-on-fetch
fn bench_fetch_gunzip(c: &mut Criterion) {
    let mut group = c.benchmark_group("fetch_gunzip");
    let config = GzipConfig::default();

    for len in [64 * 1024, 1024 * 1024] {
        let compressed = fetch(FetchMode::Gzip, &config, &body(len), None).body();
        group.throughput(Throughput::Bytes(len as u64));

        group.bench_function(format!("gunzip_{}", len), |b| {
            b.iter(|| fetch(FetchMode::Gunzip, &config, black_box(&compressed), None))
        });
        group.bench_function(format!("test_gunzip_{}", len), |b| {
            b.iter(|| fetch(FetchMode::TestGunzip, &config, black_box(&compressed), None))
        });
    }

    group.finish();
}

/// Benchmark gunzip on delivery for various scratch buffer sizes
fn bench_delivery_gunzip(c: &mut Criterion) {
    let mut group = c.benchmark_group("delivery_gunzip");
    let len = 1024 * 1024;
    let object = fetch(FetchMode::Gzip, &GzipConfig::default(), &body(len), None);
    let chunks: Vec<Bytes> = object.chunks().to_vec();
    group.throughput(Throughput::Bytes(len as u64));

    for buffer_size in [4 * 1024, 32 * 1024, 128 * 1024] {
        let config = GzipConfig {
            buffer_size,
            ..GzipConfig::default()
        };
        group.bench_function(format!("buffer_{}", buffer_size), |b| {
            b.iter(|| {
                let mut filter: DeliveryFilter = DeliveryFilter::gunzip(&config).unwrap();
                let mut sink = Vec::with_capacity(len);
                for chunk in &chunks {
                    filter.bytes(chunk.clone(), &mut sink).unwrap();
                }
                filter.end(&mut sink, false).unwrap();
                black_box(sink)
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_fetch_gzip,
    bench_fetch_gunzip,
    bench_delivery_gunzip,
);
criterion_main!(benches);
