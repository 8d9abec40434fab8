use std::sync::Arc;
use std::time::Duration;

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use bazaar_core::{AggregateId, NewOutboxEvent, RelayId};
use bazaar_events::{HandlerRegistry, InMemoryBroker, PublishingHandler, aggregates};
use bazaar_infra::outbox_store::{ClaimRequest, InMemoryOutboxStore, OutboxStore};
use bazaar_infra::relay::OutboxRelay;
use bazaar_infra::{RecordingAlertSink, RelayConfig};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_time()
        .build()
        .expect("tokio runtime")
}

/// Fresh store holding `rows` pending events spread over `aggregate_count` aggregates.
async fn seeded_store(rows: usize, aggregate_count: usize) -> Arc<InMemoryOutboxStore> {
    let store = Arc::new(InMemoryOutboxStore::new());
    for i in 0..rows {
        let event = NewOutboxEvent::new(
            aggregates::AUCTION,
            AggregateId::from((i % aggregate_count) as i64),
            "BID_PLACED",
            &serde_json::json!({"amount": i}),
        )
        .expect("event");
        store.append(event).await.expect("append");
    }
    store
}

async fn seeded_relay(rows: usize, aggregate_count: usize) -> OutboxRelay<InMemoryOutboxStore> {
    let store = seeded_store(rows, aggregate_count).await;
    let broker = Arc::new(InMemoryBroker::new());
    let registry = HandlerRegistry::new()
        .with(Arc::new(PublishingHandler::for_aggregate(aggregates::AUCTION, broker)))
        .expect("registry");
    let config = RelayConfig::default()
        .with_batch_size(rows)
        .with_max_concurrency(16);

    OutboxRelay::new(store, registry, config)
        .expect("relay")
        .with_alerts(Arc::new(RecordingAlertSink::new()))
}

fn bench_tick(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("relay_tick");

    for &(rows, aggregate_count) in &[(100usize, 1usize), (100, 100), (1_000, 10), (1_000, 1_000)] {
        group.throughput(Throughput::Elements(rows as u64));
        group.bench_with_input(
            BenchmarkId::new(format!("{aggregate_count}_aggregates"), rows),
            &(rows, aggregate_count),
            |b, &(rows, aggregate_count)| {
                b.iter_batched(
                    || rt.block_on(seeded_relay(rows, aggregate_count)),
                    |relay| {
                        let report = rt.block_on(relay.tick()).expect("tick");
                        black_box(report)
                    },
                    criterion::BatchSize::SmallInput,
                );
            },
        );
    }

    group.finish();
}

fn bench_claim(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("claim_due");
    let owner = RelayId::new("relay-bench").expect("relay id");

    for &rows in &[100usize, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(rows), &rows, |b, &rows| {
            b.iter_batched(
                || rt.block_on(seeded_store(rows, 16)),
                |store| {
                    let request = ClaimRequest {
                        owner: owner.clone(),
                        batch_size: 100,
                        max_retries: 5,
                        now: chrono::Utc::now(),
                        lease_for: Duration::from_secs(60),
                    };
                    black_box(rt.block_on(store.claim_due(&request)).expect("claim"))
                },
                criterion::BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

criterion_group!(benches, bench_tick, bench_claim);
criterion_main!(benches);
