//! Certificate forging and proxy head parsing benchmarks

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use relayscope::http_head::parse_request;
use relayscope::mitm::HostIdentifier;
use relayscope::{CaConfig, CertificateAuthority};
use std::sync::atomic::{AtomicU64, Ordering};

fn bench_certificate_forging(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let ca = CertificateAuthority::new(CaConfig::default()).unwrap();
    let mut group = c.benchmark_group("certificate_forging");

    group.bench_function("forge_uncached", |b| {
        let host = HostIdentifier::from_hostname("bench.example.com");
        b.iter(|| ca.forge(black_box(&host), &[]).unwrap())
    });

    // Each iteration a new hostname, so every lookup misses
    let counter = AtomicU64::new(0);
    group.bench_function("get_or_forge_cold", |b| {
        b.to_async(&runtime).iter(|| {
            let host = format!("cold-{}.example.com", counter.fetch_add(1, Ordering::Relaxed));
            let ca = &ca;
            async move { ca.get_or_forge(&host).await.unwrap() }
        })
    });

    runtime.block_on(async { ca.get_or_forge("warm.example.com").await.unwrap() });
    group.bench_function("get_or_forge_cached", |b| {
        b.to_async(&runtime)
            .iter(|| async { ca.get_or_forge(black_box("warm.example.com")).await.unwrap() })
    });

    group.finish();
}

fn bench_request_head_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("request_head_parsing");

    let connect = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\nProxy-Authorization: Basic dXNlcjpwYXNz\r\n\r\n";
    group.bench_function("connect", |b| {
        b.iter(|| parse_request(black_box(connect)).unwrap())
    });

    let absolute = b"GET http://example.com/api/users?id=123 HTTP/1.1\r\nHost: example.com\r\nUser-Agent: bench\r\nAccept: application/json\r\nProxy-Connection: keep-alive\r\n\r\n";
    group.bench_function("absolute_form_get", |b| {
        b.iter(|| parse_request(black_box(absolute)).unwrap())
    });

    group.finish();
}

criterion_group!(benches, bench_certificate_forging, bench_request_head_parsing);
criterion_main!(benches);
