use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use http::header::HeaderName;
use http::Method;
use tokio::runtime::Runtime;

use dedup_engine::fingerprint::ContentFingerprint;
use dedup_engine::key_extractor::KeyExtractor;
use dedup_engine::observability::mask_key;
use dedup_engine::request::RequestContext;
use dedup_engine::store::{CapturedResponse, InMemoryRecordStore, RecordStore};

fn benchmark_fingerprint(c: &mut Criterion) {
    let mut group = c.benchmark_group("fingerprint");
    group.measurement_time(Duration::from_secs(10));

    for size in [100, 1000, 10000].iter() {
        group.bench_with_input(BenchmarkId::new("compute_with_body", size), size, |b, &size| {
            let body = "x".repeat(size);
            let request = RequestContext::new(Method::POST, "/orders").with_body(body);

            b.iter(|| {
                let fingerprint = ContentFingerprint::compute(black_box(&request), true);
                black_box(fingerprint)
            });
        });
    }

    group.bench_function("compute_identity_only", |b| {
        let request = RequestContext::new(Method::POST, "/orders").with_body("x".repeat(1000));
        b.iter(|| {
            let fingerprint = ContentFingerprint::compute(black_box(&request), false);
            black_box(fingerprint)
        });
    });

    group.finish();
}

fn benchmark_claim_cycle(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");
    let mut group = c.benchmark_group("claim_cycle");

    group.bench_function("claim_commit_replay", |b| {
        let store = Arc::new(InMemoryRecordStore::new());
        let request = RequestContext::new(Method::POST, "/orders").with_body(r#"{"sku":"X"}"#);
        let fingerprint = ContentFingerprint::compute(&request, true);
        let sequence = AtomicU64::new(0);

        b.to_async(&rt).iter(|| {
            let store = Arc::clone(&store);
            let fingerprint = fingerprint.clone();
            let key = format!("bench-{}", sequence.fetch_add(1, Ordering::Relaxed));
            async move {
                let outcome = store.try_create(&key, &fingerprint, 60).await.unwrap();
                store
                    .commit(&key, &CapturedResponse::json(201, "{}"))
                    .await
                    .unwrap();
                let replay = store.get_completed(&key).await.unwrap();
                black_box((outcome, replay))
            }
        });
    });

    group.bench_function("replay_hot_key", |b| {
        let store = Arc::new(InMemoryRecordStore::new());
        let request = RequestContext::new(Method::POST, "/orders").with_body(r#"{"sku":"X"}"#);
        let fingerprint = ContentFingerprint::compute(&request, true);

        rt.block_on(async {
            store.try_create("hot", &fingerprint, 3600).await.unwrap();
            store
                .commit("hot", &CapturedResponse::json(201, r#"{"id":"tx-1"}"#))
                .await
                .unwrap();
        });

        b.to_async(&rt).iter(|| {
            let store = Arc::clone(&store);
            async move {
                let replay = store.get_completed("hot").await.unwrap();
                black_box(replay)
            }
        });
    });

    group.finish();
}

fn benchmark_key_extraction(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_extraction");

    group.bench_function("from_header", |b| {
        let extractor = KeyExtractor::default();
        let request = RequestContext::new(Method::POST, "/orders")
            .with_header(HeaderName::from_static("idempotency-key"), "order-4711");

        b.iter(|| {
            let key = extractor.extract(black_box(&request));
            black_box(key)
        });
    });

    group.bench_function("from_body_field", |b| {
        let extractor = KeyExtractor::from_body_field("request_id");
        let request = RequestContext::new(Method::POST, "/orders")
            .with_body(r#"{"request_id":"order-4711","sku":"X"}"#);

        b.iter(|| {
            let key = extractor.extract(black_box(&request));
            black_box(key)
        });
    });

    group.finish();
}

fn benchmark_key_masking(c: &mut Criterion) {
    let mut group = c.benchmark_group("masking");

    group.bench_function("mask_key", |b| {
        b.iter(|| {
            let masked = mask_key(black_box("order-2026-08-06-4711"));
            black_box(masked)
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_fingerprint,
    benchmark_claim_cycle,
    benchmark_key_extraction,
    benchmark_key_masking,
);

criterion_main!(benches);
