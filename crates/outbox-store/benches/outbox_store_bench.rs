use std::time::Duration;

use common::AggregateId;
use criterion::{Criterion, criterion_group, criterion_main};
use outbox_store::{InMemoryStore, OutboxMessage, RetryPolicy, TransactionalStore};

fn make_message(aggregate_id: AggregateId) -> OutboxMessage {
    OutboxMessage::builder()
        .aggregate_id(aggregate_id)
        .aggregate_type("Order")
        .event_type("OrderCreated")
        .payload_raw(serde_json::json!({
            "order_id": aggregate_id.to_string(),
            "customer_id": "00000000-0000-0000-0000-000000000001",
            "total_cents": 1999
        }))
        .build()
}

fn bench_commit_with_outbox(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = InMemoryStore::new();

    c.bench_function("outbox_store/commit_write_and_outbox", |b| {
        b.iter(|| {
            rt.block_on(async {
                let aggregate_id = AggregateId::new();
                let tx = store.begin().await.unwrap();
                store
                    .write(
                        tx,
                        "orders",
                        &aggregate_id.to_string(),
                        serde_json::json!({"status": "placed"}),
                    )
                    .await
                    .unwrap();
                store
                    .enqueue_outbox(tx, make_message(aggregate_id))
                    .await
                    .unwrap();
                store.commit(tx).await.unwrap();
            });
        });
    });
}

fn bench_fetch_pending(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = InMemoryStore::new();

    // Pre-populate with 1000 pending rows
    rt.block_on(async {
        let tx = store.begin().await.unwrap();
        for _ in 0..1000 {
            store
                .enqueue_outbox(tx, make_message(AggregateId::new()))
                .await
                .unwrap();
        }
        store.commit(tx).await.unwrap();
    });

    c.bench_function("outbox_store/get_pending_50_of_1000", |b| {
        b.iter(|| {
            rt.block_on(async {
                store.get_pending_outbox(50).await.unwrap();
            });
        });
    });
}

fn bench_lease_and_publish(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = InMemoryStore::new();

    c.bench_function("outbox_store/lease_and_mark_published", |b| {
        b.iter(|| {
            rt.block_on(async {
                let message = make_message(AggregateId::new());
                let id = message.id();
                let tx = store.begin().await.unwrap();
                store.enqueue_outbox(tx, message).await.unwrap();
                store.commit(tx).await.unwrap();

                let mut leased = store
                    .try_lease(id, Duration::from_secs(30))
                    .await
                    .unwrap()
                    .unwrap();
                leased.mark_as_published(store.now()).unwrap();
                store
                    .update_outbox_status(id, leased.to_update())
                    .await
                    .unwrap();
            });
        });
    });
}

fn bench_backoff(c: &mut Criterion) {
    let policy = RetryPolicy::default();

    c.bench_function("retry_policy/delay_for", |b| {
        b.iter(|| {
            for retry in 0..10 {
                std::hint::black_box(policy.delay_for(retry));
            }
        });
    });
}

criterion_group!(
    benches,
    bench_commit_with_outbox,
    bench_fetch_pending,
    bench_lease_and_publish,
    bench_backoff
);
criterion_main!(benches);
