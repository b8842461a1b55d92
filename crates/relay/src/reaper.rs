//! Reclaims leases whose worker died or stalled.

use std::sync::Arc;
use std::time::Duration;

use outbox_store::{MessageId, TransactionalStore};
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::stats::RelayStats;

/// Periodically moves expired `processing` rows back to `pending`.
///
/// A reclaimed row keeps its retry count; the worker that lost the lease
/// finds out through a version conflict when it tries to record its outcome.
pub struct LeaseReaper<S: ?Sized> {
    store: Arc<S>,
    stats: Arc<RelayStats>,
    batch_size: usize,
}

impl<S: TransactionalStore + ?Sized> LeaseReaper<S> {
    pub fn new(store: Arc<S>, stats: Arc<RelayStats>, batch_size: usize) -> Self {
        Self {
            store,
            stats,
            batch_size: batch_size.max(1),
        }
    }

    /// Reclaims every lease that has expired by now.
    #[tracing::instrument(skip(self))]
    pub async fn reap(&self) -> Result<Vec<MessageId>> {
        let mut reclaimed = Vec::new();
        loop {
            let ids = self.store.reclaim_expired_leases(self.batch_size).await?;
            let done = ids.len() < self.batch_size;
            reclaimed.extend(ids);
            if done {
                break;
            }
        }

        if !reclaimed.is_empty() {
            self.stats.record_leases_reclaimed(reclaimed.len() as u64);
            tracing::warn!(count = reclaimed.len(), ids = ?reclaimed, "reclaimed expired leases");
        }
        Ok(reclaimed)
    }

    /// Runs `reap` every `interval` until `token` is cancelled.
    pub async fn run(self, interval: Duration, token: CancellationToken) {
        tracing::info!(interval_ms = interval.as_millis() as u64, "lease reaper started");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            if let Err(e) = self.reap().await {
                tracing::error!(error = %e, "lease reaper pass failed");
            }
        }
        tracing::info!("lease reaper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::AggregateId;
    use outbox_store::{InMemoryStore, ManualClock, OutboxMessage, OutboxStatus};

    async fn leased_rows(store: &InMemoryStore, count: usize) -> Vec<MessageId> {
        let tx = store.begin().await.unwrap();
        let mut ids = Vec::new();
        for _ in 0..count {
            let message = OutboxMessage::builder()
                .aggregate_id(AggregateId::new())
                .aggregate_type("Order")
                .event_type("OrderCreated")
                .payload_raw(serde_json::json!({}))
                .build();
            ids.push(message.id());
            store.enqueue_outbox(tx, message).await.unwrap();
        }
        store.commit(tx).await.unwrap();
        for id in &ids {
            store
                .try_lease(*id, Duration::from_secs(10))
                .await
                .unwrap()
                .unwrap();
        }
        ids
    }

    #[tokio::test]
    async fn reap_drains_in_batches() {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(InMemoryStore::with_clock(clock.clone()));
        let stats = Arc::new(RelayStats::new());
        let ids = leased_rows(&store, 5).await;
        let reaper = LeaseReaper::new(store.clone(), stats.clone(), 2);

        assert!(reaper.reap().await.unwrap().is_empty());

        clock.advance(chrono::Duration::seconds(11));
        let mut reclaimed = reaper.reap().await.unwrap();
        reclaimed.sort();
        let mut expected = ids.clone();
        expected.sort();
        assert_eq!(reclaimed, expected);
        assert_eq!(stats.snapshot().leases_reclaimed, 5);

        for id in ids {
            let row = store.get_outbox_message(id).await.unwrap().unwrap();
            assert_eq!(row.status(), OutboxStatus::Pending);
        }
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let store = Arc::new(InMemoryStore::new());
        let reaper = LeaseReaper::new(store, Arc::new(RelayStats::new()), 10);
        let token = CancellationToken::new();
        let handle = tokio::spawn(reaper.run(Duration::from_millis(5), token.clone()));

        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
