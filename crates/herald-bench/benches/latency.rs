//! Latency benchmarks for Herald.
//!
//! These benchmarks focus on measuring submit-to-receive latency.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use herald_bench::{event, Fixture};
use herald_protocol::{Payload, SecretKey, TokenCodec};
use std::time::Instant;

/// Benchmark dispatch + receive latency.
fn bench_dispatch_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch_latency");

    group.bench_function("single_subscriber", |b| {
        b.iter_custom(|iters| {
            let fixture = Fixture::new(16);
            let subscribers = fixture.subscribers(1, "test");

            let start = Instant::now();
            for _ in 0..iters {
                let _ = fixture.dispatcher.dispatch_one(event("test", 64));
                let _ = subscribers[0].try_recv();
            }
            start.elapsed()
        });
    });

    group.bench_function("ten_subscribers", |b| {
        b.iter_custom(|iters| {
            let fixture = Fixture::new(16);
            let subscribers = fixture.subscribers(10, "test");

            let start = Instant::now();
            for _ in 0..iters {
                let _ = fixture.dispatcher.dispatch_one(event("test", 64));
                for subscriber in &subscribers {
                    let _ = subscriber.try_recv();
                }
            }
            start.elapsed()
        });
    });

    group.finish();
}

/// Benchmark a parked reader being woken by a dispatch.
fn bench_wakeup_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("wakeup_latency");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();

    group.bench_function("recv_await", |b| {
        b.to_async(&runtime).iter_custom(|iters| async move {
            let fixture = Fixture::new(16);
            let subscriber = fixture
                .subscribers(1, "test")
                .pop()
                .unwrap();

            let start = Instant::now();
            for _ in 0..iters {
                let _ = fixture.dispatcher.dispatch_one(event("test", 64));
                black_box(subscriber.recv().await);
            }
            start.elapsed()
        });
    });

    group.finish();
}

/// Benchmark the token check paid by every request.
fn bench_token_open(c: &mut Criterion) {
    let mut group = c.benchmark_group("token_open");

    let codec = TokenCodec::new(SecretKey::from_bytes(&[7u8; 32]).unwrap(), 3600);
    let subscribe = codec.encode(&Payload::subscribe(["todo", "news"])).unwrap();
    let submit = codec
        .encode(&Payload::submit((0..10).map(|_| event("todo", 256))))
        .unwrap();

    group.bench_function("subscribe", |b| {
        b.iter(|| codec.decode_subscribe(black_box(&subscribe)))
    });

    group.bench_function("submit_10_events", |b| {
        b.iter(|| codec.decode_submit(black_box(&submit)))
    });

    group.finish();
}

/// Benchmark subscription lookup across many topics.
fn bench_subscription_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("subscription_lookup");

    // Setup: 1000 topics with 10 subscribers each
    let fixture = Fixture::new(16);
    let _subscribers: Vec<_> = (0..1000)
        .flat_map(|i| fixture.subscribers(10, &format!("topic:{}", i)))
        .collect();
    let registry = fixture.connections.registry();

    group.bench_function("topic_exists", |b| {
        let mut i = 0;
        b.iter(|| {
            let topic = format!("topic:{}", i % 1000);
            i += 1;
            registry.topic_exists(black_box(&topic))
        });
    });

    group.bench_function("subscriber_count", |b| {
        let mut i = 0;
        b.iter(|| {
            let topic = format!("topic:{}", i % 1000);
            i += 1;
            registry.subscriber_count(black_box(&topic))
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_dispatch_latency,
    bench_wakeup_latency,
    bench_token_open,
    bench_subscription_lookup,
);
criterion_main!(benches);
