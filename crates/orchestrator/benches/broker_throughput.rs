//! Broker throughput benchmark
//!
//! Measures end-to-end cost of the two hot paths over the in-memory
//! substrate: fire-and-forget events fanned out across many lanes, and
//! request/response round trips.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use tokio::runtime::Runtime;

use switchyard_orchestrator::broker::HandlerError;
use switchyard_orchestrator::prelude::*;

fn broker() -> MessageBroker {
    MessageBroker::new(
        Arc::new(InMemorySubstrate::new()),
        Arc::new(InMemoryStateStore::new()),
        BrokerConfig::default().with_max_in_flight(256),
    )
}

fn bench_event_fan_in(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("events");

    for lanes in [1usize, 16, 128] {
        let messages = 1_000u64;
        group.throughput(Throughput::Elements(messages));
        group.bench_with_input(BenchmarkId::new("publish_and_drain", lanes), &lanes, |b, &lanes| {
            b.to_async(&rt).iter(|| async move {
                let broker = broker();
                let handled = Arc::new(AtomicU64::new(0));
                let counter = handled.clone();
                broker
                    .subscribe_fn("bench.tick", MessagePattern::Event, move |_msg: Message| {
                        counter.fetch_add(1, Ordering::Relaxed);
                        async { Ok::<_, HandlerError>(json!(null)) }
                    })
                    .unwrap();

                for i in 0..messages {
                    let msg = Message::event("bench.tick", json!({ "i": i }))
                        .with_ordering_key(format!("lane-{}", i as usize % lanes));
                    broker.publish(msg).await.unwrap();
                }

                while handled.load(Ordering::Relaxed) < messages {
                    tokio::task::yield_now().await;
                }
            });
        });
    }

    group.finish();
}

fn bench_request_response(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let broker = broker();
    rt.block_on(async {
        broker
            .subscribe_fn("bench.echo", MessagePattern::RequestResponse, |msg: Message| async move {
                Ok::<_, HandlerError>(msg.payload)
            })
            .unwrap();
    });

    let mut group = c.benchmark_group("requests");
    group.throughput(Throughput::Elements(1));
    group.bench_function("round_trip", |b| {
        b.to_async(&rt).iter(|| {
            let broker = broker.clone();
            async move {
                let request = Message::new("bench.echo", MessagePattern::RequestResponse, json!(1));
                broker.request(request, Duration::from_secs(5)).await.unwrap()
            }
        });
    });
    group.finish();
}

criterion_group!(benches, bench_event_fan_in, bench_request_response);
criterion_main!(benches);
