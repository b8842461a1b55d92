use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    CommitReceipt, MessageId, OutboxMessage, OutboxQuery, OutboxStatus, OutboxUpdate, Partition,
    Result, StoreError, TxId,
};

/// Row counts per outbox status.
///
/// `failed_transient` is the subset of `pending` rows that have failed at
/// least once and are waiting for their retry time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub processing: u64,
    pub published: u64,
    pub dead: u64,
    pub failed_transient: u64,
}

impl StatusCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.published + self.dead
    }

    pub fn get(&self, status: OutboxStatus) -> u64 {
        match status {
            OutboxStatus::Pending => self.pending,
            OutboxStatus::Processing => self.processing,
            OutboxStatus::Published => self.published,
            OutboxStatus::Dead => self.dead,
        }
    }

    pub(crate) fn record(&mut self, message: &OutboxMessage) {
        match message.status {
            OutboxStatus::Pending => {
                self.pending += 1;
                if message.retry_count > 0 {
                    self.failed_transient += 1;
                }
            }
            OutboxStatus::Processing => self.processing += 1,
            OutboxStatus::Published => self.published += 1,
            OutboxStatus::Dead => self.dead += 1,
        }
    }
}

/// ACID storage for business rows and the outbox table.
///
/// Business writes and outbox inserts buffered in one transaction become
/// visible together on `commit`, or not at all. The relay side only touches
/// outbox rows, through `try_lease` and `update_outbox_status`.
#[async_trait]
pub trait TransactionalStore: Send + Sync {
    /// Current time according to the store. Leases, retry times and retention
    /// cutoffs are all computed against it.
    fn now(&self) -> DateTime<Utc>;

    /// Opens an isolated write buffer.
    async fn begin(&self) -> Result<TxId>;

    /// Buffers a business mutation. A rejected write aborts the transaction.
    ///
    /// Fails with `TransactionNotFound` if `tx` is unknown.
    async fn write(
        &self,
        tx: TxId,
        table: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<()>;

    /// Buffers an outbox insert in the same transaction as the business writes.
    ///
    /// A message id that already exists is rejected no later than `commit`,
    /// and the whole transaction aborts.
    async fn enqueue_outbox(&self, tx: TxId, message: OutboxMessage) -> Result<()>;

    /// Atomically applies everything buffered in `tx`.
    ///
    /// On failure the transaction stays registered as aborted and the caller
    /// must call `rollback`.
    async fn commit(&self, tx: TxId) -> Result<CommitReceipt>;

    /// Discards everything buffered in `tx`.
    async fn rollback(&self, tx: TxId) -> Result<()>;

    /// Committed value of a business row.
    async fn read(&self, table: &str, key: &str) -> Result<Option<serde_json::Value>>;

    /// Up to `limit` pending rows whose retry time has passed, oldest first.
    async fn get_pending_outbox(&self, limit: usize) -> Result<Vec<OutboxMessage>> {
        self.get_pending_outbox_for_partition(limit, Partition::single())
            .await
    }

    /// Like `get_pending_outbox`, restricted to aggregates owned by `partition`.
    async fn get_pending_outbox_for_partition(
        &self,
        limit: usize,
        partition: Partition,
    ) -> Result<Vec<OutboxMessage>>;

    /// Compare-and-swap pending -> processing.
    ///
    /// Returns the leased row, or `None` if the row is missing, not pending or
    /// not yet due. No other actor can lease the same row until it leaves
    /// `processing`.
    async fn try_lease(
        &self,
        id: MessageId,
        lease_timeout: std::time::Duration,
    ) -> Result<Option<OutboxMessage>>;

    /// Persists a status transition guarded by `update.expected_version`.
    ///
    /// Returns the row as stored afterwards.
    async fn update_outbox_status(
        &self,
        id: MessageId,
        update: OutboxUpdate,
    ) -> Result<OutboxMessage>;

    /// Moves up to `limit` processing rows with an expired lease back to
    /// pending without touching their retry count.
    async fn reclaim_expired_leases(&self, limit: usize) -> Result<Vec<MessageId>>;

    /// Forces one processing row back to pending. Returns false if the row was
    /// not processing.
    async fn release_lease(&self, id: MessageId) -> Result<bool>;

    async fn get_outbox_message(&self, id: MessageId) -> Result<Option<OutboxMessage>>;

    async fn query_outbox(&self, query: OutboxQuery) -> Result<Vec<OutboxMessage>>;

    async fn status_counts(&self) -> Result<StatusCounts>;

    /// Deletes published rows processed before `older_than`. Returns how many
    /// rows were removed.
    async fn purge_published(&self, older_than: DateTime<Utc>) -> Result<u64>;

    /// Rolls back transactions begun before `older_than` that were never
    /// committed or rolled back. Returns how many were discarded.
    async fn abandon_stale_transactions(&self, older_than: DateTime<Utc>) -> Result<usize>;
}

/// Extension trait providing convenience methods for transactional stores.
#[async_trait]
pub trait TransactionalStoreExt: TransactionalStore {
    /// Serializes `value` and buffers it as a business write.
    async fn write_json<T>(&self, tx: TxId, table: &str, key: &str, value: &T) -> Result<()>
    where
        T: Serialize + Sync + ?Sized,
    {
        let value = serde_json::to_value(value)?;
        self.write(tx, table, key, value).await
    }

    /// Reads and deserializes a business row.
    async fn read_json<T>(&self, table: &str, key: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        match self.read(table, key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Buffers several outbox inserts, keeping their order.
    async fn enqueue_all(&self, tx: TxId, messages: Vec<OutboxMessage>) -> Result<()> {
        for message in messages {
            self.enqueue_outbox(tx, message).await?;
        }
        Ok(())
    }

    /// Commits, rolling back if the commit fails. The commit error is returned.
    async fn commit_or_rollback(&self, tx: TxId) -> Result<CommitReceipt> {
        match self.commit(tx).await {
            Ok(receipt) => Ok(receipt),
            Err(err) => {
                if let Err(rollback_err) = self.rollback(tx).await {
                    tracing::warn!(tx_id = %tx, error = %rollback_err, "rollback after failed commit failed");
                }
                Err(err)
            }
        }
    }

    /// Re-enqueues the payload of a dead message as a new pending message.
    ///
    /// The dead row is left as it is; the new one points back at it through
    /// its causation id.
    async fn replay_dead_letter(&self, id: MessageId) -> Result<OutboxMessage> {
        let dead = self
            .get_outbox_message(id)
            .await?
            .ok_or(StoreError::MessageNotFound(id))?;
        if dead.status() != OutboxStatus::Dead {
            return Err(StoreError::NotDeadLettered {
                id,
                status: dead.status(),
            });
        }

        let replay = dead.replay();
        let replay_id = replay.id();

        let tx = self.begin().await?;
        if let Err(err) = self.enqueue_outbox(tx, replay.clone()).await {
            self.rollback(tx).await?;
            return Err(err);
        }
        self.commit_or_rollback(tx).await?;

        tracing::info!(dead_id = %id, replay_id = %replay_id, "dead letter replayed");
        Ok(self.get_outbox_message(replay_id).await?.unwrap_or(replay))
    }
}

// Blanket implementation for all TransactionalStore implementations
impl<T: TransactionalStore + ?Sized> TransactionalStoreExt for T {}

/// Rejects business writes that cannot be addressed later.
pub fn validate_write(table: &str, key: &str) -> Result<()> {
    if table.trim().is_empty() {
        return Err(StoreError::InvalidWrite("table name is empty".to_string()));
    }
    if key.trim().is_empty() {
        return Err(StoreError::InvalidWrite(format!(
            "empty key for table '{table}'"
        )));
    }
    Ok(())
}

/// Rejects outbox inserts that are not fresh pending messages.
pub fn validate_enqueue(message: &OutboxMessage) -> Result<()> {
    if message.status() != OutboxStatus::Pending {
        return Err(StoreError::InvalidWrite(format!(
            "message {} must be enqueued as pending, not {}",
            message.id(),
            message.status()
        )));
    }
    if message.event_type().trim().is_empty() {
        return Err(StoreError::InvalidWrite(format!(
            "message {} has an empty event type",
            message.id()
        )));
    }
    Ok(())
}

/// Checks a relay update against the row currently stored.
///
/// Terminal rows are rejected first, then stale versions, then transitions
/// that are not edges of the state machine.
pub fn check_update(current: &OutboxMessage, update: &OutboxUpdate) -> Result<()> {
    if current.status().is_terminal() {
        return Err(StoreError::TerminalState {
            id: current.id(),
            status: current.status(),
        });
    }
    if current.version() != update.expected_version {
        return Err(StoreError::ConcurrencyConflict {
            id: current.id(),
            expected: update.expected_version,
            actual: current.version(),
        });
    }
    if !current.status().can_transition_to(update.status) {
        return Err(StoreError::InvalidTransition {
            id: current.id(),
            from: current.status(),
            to: update.status,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AggregateId;
    use std::time::Duration;

    fn message() -> OutboxMessage {
        OutboxMessage::builder()
            .aggregate_id(AggregateId::new())
            .aggregate_type("Order")
            .event_type("OrderCreated")
            .payload_raw(serde_json::json!({}))
            .build()
    }

    #[test]
    fn validate_write_rejects_blank_names() {
        assert!(validate_write("orders", "o-1").is_ok());
        assert!(matches!(
            validate_write("", "o-1"),
            Err(StoreError::InvalidWrite(_))
        ));
        assert!(matches!(
            validate_write("orders", " "),
            Err(StoreError::InvalidWrite(_))
        ));
    }

    #[test]
    fn validate_enqueue_requires_pending() {
        let mut msg = message();
        assert!(validate_enqueue(&msg).is_ok());

        msg.mark_as_processing(Utc::now(), Duration::from_secs(1))
            .unwrap();
        assert!(matches!(
            validate_enqueue(&msg),
            Err(StoreError::InvalidWrite(_))
        ));
    }

    #[test]
    fn check_update_detects_stale_version() {
        let stored = message();
        let mut leased = stored.clone();
        leased
            .mark_as_processing(Utc::now(), Duration::from_secs(1))
            .unwrap();
        let mut update = leased.to_update();
        update.expected_version = 7;

        assert!(matches!(
            check_update(&stored, &update),
            Err(StoreError::ConcurrencyConflict {
                expected: 7,
                actual: 0,
                ..
            })
        ));
    }

    #[test]
    fn check_update_rejects_non_edges() {
        let stored = message();
        let mut update = stored.to_update();
        update.status = OutboxStatus::Published;

        assert!(matches!(
            check_update(&stored, &update),
            Err(StoreError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn status_counts_track_failed_transient_within_pending() {
        let mut counts = StatusCounts::default();
        let fresh = message();
        let mut retried = message();
        retried.retry_count = 2;

        counts.record(&fresh);
        counts.record(&retried);

        assert_eq!(counts.pending, 2);
        assert_eq!(counts.failed_transient, 1);
        assert_eq!(counts.total(), 2);
        assert_eq!(counts.get(OutboxStatus::Pending), 2);
    }
}
