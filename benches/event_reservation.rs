//! Event reservation throughput.
//!
//! Benchmarks the critical path the scheduler's consumer-prepare step
//! depends on: publish a batch of pending events, then reserve them all
//! for one run.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::runtime::Runtime;
use uuid::Uuid;

use execmodel::model::CausedBy;
use execmodel::store::{InMemoryStore, PublishRequest, ReservationRequest, Store};

fn bench_publish(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("event_reservation/publish");
    group.throughput(Throughput::Elements(1));

    for batch_size in [10, 100, 1_000] {
        group.bench_with_input(
            BenchmarkId::new("batch", batch_size),
            &batch_size,
            |b, &batch_size| {
                b.to_async(&rt).iter(|| async move {
                    let store = InMemoryStore::new();
                    let workflow_id = Uuid::now_v7();
                    for i in 0..batch_size {
                        store
                            .publish_event(
                                workflow_id,
                                PublishRequest {
                                    topic: "inbox".into(),
                                    message_id: format!("m-{i}"),
                                    payload: serde_json::json!({ "i": i }),
                                    caused_by: CausedBy::new(),
                                },
                                None,
                            )
                            .await
                            .unwrap();
                    }
                });
            },
        );
    }

    group.finish();
}

fn bench_reserve(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("event_reservation/reserve");
    group.throughput(Throughput::Elements(1));

    for batch_size in [10, 100, 1_000] {
        group.bench_with_input(
            BenchmarkId::new("batch", batch_size),
            &batch_size,
            |b, &batch_size| {
                b.to_async(&rt).iter_custom(|iters| async move {
                    let store = InMemoryStore::new();
                    let workflow_id = Uuid::now_v7();
                    let mut ids = Vec::with_capacity(batch_size);
                    for i in 0..batch_size {
                        let event = store
                            .publish_event(
                                workflow_id,
                                PublishRequest {
                                    topic: "inbox".into(),
                                    message_id: format!("m-{i}"),
                                    payload: serde_json::json!({ "i": i }),
                                    caused_by: CausedBy::new(),
                                },
                                None,
                            )
                            .await
                            .unwrap();
                        ids.push(event.id);
                    }

                    let start = std::time::Instant::now();
                    for _ in 0..iters {
                        let run_id = Uuid::now_v7();
                        store
                            .reserve_events(
                                run_id,
                                &[ReservationRequest {
                                    topic: "inbox".into(),
                                    ids: ids.clone(),
                                }],
                            )
                            .await
                            .unwrap();
                        store.release_events(run_id).await.unwrap();
                    }
                    start.elapsed()
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_publish, bench_reserve);
criterion_main!(benches);
