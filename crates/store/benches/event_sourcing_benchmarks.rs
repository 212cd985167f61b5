use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use chrono::Utc;
use kura_core::{Payload, UserId};
use kura_events::{EventStore, JobQueue, NewEvent, NewJob};
use kura_store::{InMemoryEventStore, InMemoryJobQueue};
use serde_json::json;
use tokio::runtime::Runtime;

fn rt() -> Runtime {
    Runtime::new().expect("tokio runtime")
}

fn bench_event_append_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("event_append_throughput");

    for batch_size in [1, 10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*batch_size as u64));
        group.bench_with_input(BenchmarkId::new("sequential_append", batch_size), batch_size, |b, &size| {
            let runtime = rt();
            let store = InMemoryEventStore::new();
            let user_id = UserId::new();

            b.iter(|| {
                runtime.block_on(async {
                    for i in 0..size {
                        let event = NewEvent::new(user_id, Utc::now(), "set.logged", Payload::new(json!({"rep": i})), Payload::empty());
                        black_box(store.append(event).await.unwrap());
                    }
                });
            });
        });
    }

    group.finish();
}

fn bench_query_by_type_with_history(c: &mut Criterion) {
    let mut group = c.benchmark_group("query_by_type_with_history");

    for event_count in [10, 100, 1000, 10000].iter() {
        group.bench_with_input(BenchmarkId::new("query_by_type", event_count), event_count, |b, &count| {
            let runtime = rt();
            let store = InMemoryEventStore::new();
            let user_id = UserId::new();

            runtime.block_on(async {
                for i in 0..count {
                    let event_type = if i % 5 == 0 { "session.completed" } else { "set.logged" };
                    let event = NewEvent::new(user_id, Utc::now(), event_type, Payload::new(json!({"rep": i})), Payload::empty());
                    store.append(event).await.unwrap();
                }
            });

            b.iter(|| {
                runtime.block_on(async {
                    black_box(store.query_by_type(user_id, &["set.logged"]).await.unwrap());
                });
            });
        });
    }

    group.finish();
}

fn bench_job_claim_batch_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("job_claim_batch_throughput");

    for batch_size in [1i64, 10, 100].iter() {
        group.throughput(Throughput::Elements(*batch_size as u64));
        group.bench_with_input(BenchmarkId::new("claim_batch", batch_size), batch_size, |b, &size| {
            let runtime = rt();

            b.iter(|| {
                runtime.block_on(async {
                    let queue = InMemoryJobQueue::new();
                    let user_id = UserId::new();
                    let now = Utc::now();
                    for _ in 0..(size * 2) {
                        queue.enqueue(NewJob::immediate(user_id, "projection.update", Payload::empty(), now, 3)).await.unwrap();
                    }
                    black_box(queue.claim_batch(size, now).await.unwrap());
                });
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_event_append_throughput, bench_query_by_type_with_history, bench_job_claim_batch_throughput);
criterion_main!(benches);
