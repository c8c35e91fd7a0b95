//! Benchmarks for the inbound hot path
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use sweep_push::network::envelope::{decode, encode_at, ClientCommand};
use sweep_push::network::{BackoffPolicy, Event, EventBus, EventKind};

const PRICE_FRAME: &str =
    r#"{"type":"price_update","data":{"token":"ETH","chain":"base","priceUsd":3120.55},"timestamp":1700000000000}"#;

/// Decode and classify one inbound frame
fn bench_decode(c: &mut Criterion) {
    c.bench_function("decode_price_update", |b| {
        b.iter(|| {
            let env = decode(black_box(PRICE_FRAME)).unwrap();
            black_box(Event::from_envelope(env))
        })
    });
}

/// Encode a subscription command
fn bench_encode(c: &mut Criterion) {
    let cmd = ClientCommand::SubscribeConsolidation {
        consolidation_id: "5b0f7c2e-3d6a-4c1e-9f3e-2a8d1c0b7e44".to_string(),
    };
    c.bench_function("encode_subscribe", |b| {
        b.iter(|| black_box(encode_at(black_box(&cmd), 1_700_000_000_000).unwrap()))
    });
}

/// Fan-out cost by listener count
fn bench_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch");
    let env = decode(PRICE_FRAME).unwrap();
    let event = Event::from_envelope(env).unwrap();

    for listeners in [1usize, 8, 64] {
        let bus = EventBus::new(16);
        let hits = Arc::new(AtomicU64::new(0));
        let _disposers: Vec<_> = (0..listeners)
            .map(|_| {
                let hits = hits.clone();
                bus.on(EventKind::PriceUpdate, move |_| {
                    hits.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                })
            })
            .collect();

        group.bench_with_input(BenchmarkId::from_parameter(listeners), &listeners, |b, _| {
            b.iter(|| black_box(bus.dispatch(black_box(&event))))
        });
    }
    group.finish();
}

fn bench_backoff(c: &mut Criterion) {
    let policy = BackoffPolicy::default().with_jitter(0.1);
    c.bench_function("backoff_jittered_delay", |b| {
        b.iter(|| black_box(policy.jittered_delay(black_box(7))))
    });
}

criterion_group!(benches, bench_decode, bench_encode, bench_dispatch, bench_backoff);
criterion_main!(benches);
