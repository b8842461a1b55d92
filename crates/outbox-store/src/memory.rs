use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

use crate::{
    Clock, CommitReceipt, MessageId, OutboxMessage, OutboxQuery, OutboxStatus, OutboxUpdate,
    Partition, Result, StoreError, SystemClock, TxId,
    store::{
        StatusCounts, TransactionalStore, check_update, validate_enqueue, validate_write,
    },
    transaction::{Transaction, TransactionState},
};

#[derive(Debug, Default)]
struct Tables {
    business: HashMap<String, HashMap<String, serde_json::Value>>,
    outbox: HashMap<MessageId, OutboxMessage>,
    next_sequence: i64,
}

impl Tables {
    fn sorted_outbox(&self, filter: impl Fn(&OutboxMessage) -> bool) -> Vec<&OutboxMessage> {
        let mut rows: Vec<_> = self.outbox.values().filter(|&m| filter(m)).collect();
        rows.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.sequence.cmp(&b.sequence))
        });
        rows
    }
}

/// In-memory transactional store for tests and local runs.
///
/// Transactions buffer their writes privately; `commit` applies them under a
/// single write lock so readers see all of a transaction or none of it.
#[derive(Clone)]
pub struct InMemoryStore {
    tables: Arc<RwLock<Tables>>,
    transactions: Arc<Mutex<HashMap<TxId, Transaction>>>,
    clock: Arc<dyn Clock>,
    fail_next_commit: Arc<AtomicBool>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Creates an empty store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates an empty store that reads time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            tables: Arc::new(RwLock::new(Tables::default())),
            transactions: Arc::new(Mutex::new(HashMap::new())),
            clock,
            fail_next_commit: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Makes the next `commit` fail as if the storage engine had aborted it.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Number of transactions that were begun and not yet committed or rolled back.
    pub async fn open_transaction_count(&self) -> usize {
        self.transactions.lock().await.len()
    }

    /// Total number of outbox rows, in any status.
    pub async fn outbox_len(&self) -> usize {
        self.tables.read().await.outbox.len()
    }

    fn ensure_open(tx_id: TxId, tx: &Transaction) -> Result<()> {
        match &tx.state {
            TransactionState::Open => Ok(()),
            TransactionState::Aborted(reason) => Err(StoreError::TransactionAborted {
                tx_id,
                reason: reason.clone(),
            }),
        }
    }
}

#[async_trait]
impl TransactionalStore for InMemoryStore {
    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    async fn begin(&self) -> Result<TxId> {
        let tx_id = TxId::new();
        self.transactions
            .lock()
            .await
            .insert(tx_id, Transaction::new(self.clock.now()));
        tracing::trace!(tx_id = %tx_id, "transaction begun");
        Ok(tx_id)
    }

    async fn write(
        &self,
        tx: TxId,
        table: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<()> {
        let mut transactions = self.transactions.lock().await;
        let transaction = transactions
            .get_mut(&tx)
            .ok_or(StoreError::TransactionNotFound(tx))?;
        Self::ensure_open(tx, transaction)?;

        if let Err(err) = validate_write(table, key) {
            transaction.abort(err.to_string());
            return Err(err);
        }

        transaction
            .writes
            .entry(table.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn enqueue_outbox(&self, tx: TxId, message: OutboxMessage) -> Result<()> {
        let mut transactions = self.transactions.lock().await;
        let transaction = transactions
            .get_mut(&tx)
            .ok_or(StoreError::TransactionNotFound(tx))?;
        Self::ensure_open(tx, transaction)?;

        if let Err(err) = validate_enqueue(&message) {
            transaction.abort(err.to_string());
            return Err(err);
        }
        if transaction.outbox.iter().any(|m| m.id == message.id) {
            let err = StoreError::DuplicateMessage(message.id);
            transaction.abort(err.to_string());
            return Err(err);
        }

        transaction.outbox.push(message);
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn commit(&self, tx: TxId) -> Result<CommitReceipt> {
        let mut transactions = self.transactions.lock().await;
        let transaction = transactions
            .get_mut(&tx)
            .ok_or(StoreError::TransactionNotFound(tx))?;
        Self::ensure_open(tx, transaction)?;

        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            let reason = "storage engine aborted the commit".to_string();
            transaction.abort(reason.clone());
            return Err(StoreError::TransactionAborted { tx_id: tx, reason });
        }

        let mut tables = self.tables.write().await;
        let duplicate = transaction
            .outbox
            .iter()
            .map(|m| m.id)
            .find(|id| tables.outbox.contains_key(id));
        if let Some(duplicate) = duplicate {
            let err = StoreError::DuplicateMessage(duplicate);
            transaction.abort(err.to_string());
            return Err(err);
        }

        let Some(transaction) = transactions.remove(&tx) else {
            return Err(StoreError::TransactionNotFound(tx));
        };
        let receipt = CommitReceipt {
            tx_id: tx,
            writes: transaction.write_count(),
            outbox_messages: transaction.outbox.len(),
        };

        for (table, rows) in transaction.writes {
            tables.business.entry(table).or_default().extend(rows);
        }
        for mut message in transaction.outbox {
            tables.next_sequence += 1;
            message.sequence = tables.next_sequence;
            message.version = 0;
            tables.outbox.insert(message.id, message);
        }

        metrics::counter!("outbox_messages_enqueued_total")
            .increment(receipt.outbox_messages as u64);
        tracing::debug!(
            writes = receipt.writes,
            outbox_messages = receipt.outbox_messages,
            "transaction committed"
        );
        Ok(receipt)
    }

    async fn rollback(&self, tx: TxId) -> Result<()> {
        self.transactions
            .lock()
            .await
            .remove(&tx)
            .ok_or(StoreError::TransactionNotFound(tx))?;
        tracing::debug!(tx_id = %tx, "transaction rolled back");
        Ok(())
    }

    async fn read(&self, table: &str, key: &str) -> Result<Option<serde_json::Value>> {
        let tables = self.tables.read().await;
        Ok(tables
            .business
            .get(table)
            .and_then(|rows| rows.get(key))
            .cloned())
    }

    async fn get_pending_outbox_for_partition(
        &self,
        limit: usize,
        partition: Partition,
    ) -> Result<Vec<OutboxMessage>> {
        let now = self.clock.now();
        let tables = self.tables.read().await;
        Ok(tables
            .sorted_outbox(|m| m.is_eligible(now) && partition.owns(&m.aggregate_id))
            .into_iter()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn try_lease(
        &self,
        id: MessageId,
        lease_timeout: std::time::Duration,
    ) -> Result<Option<OutboxMessage>> {
        let now = self.clock.now();
        let mut tables = self.tables.write().await;
        let Some(message) = tables.outbox.get_mut(&id) else {
            return Ok(None);
        };
        if !message.is_eligible(now) {
            return Ok(None);
        }

        message.mark_as_processing(now, lease_timeout)?;
        message.version += 1;
        Ok(Some(message.clone()))
    }

    async fn update_outbox_status(
        &self,
        id: MessageId,
        update: OutboxUpdate,
    ) -> Result<OutboxMessage> {
        let mut tables = self.tables.write().await;
        let message = tables
            .outbox
            .get_mut(&id)
            .ok_or(StoreError::MessageNotFound(id))?;
        check_update(message, &update)?;
        message.apply_update(update);
        Ok(message.clone())
    }

    async fn reclaim_expired_leases(&self, limit: usize) -> Result<Vec<MessageId>> {
        let now = self.clock.now();
        let mut tables = self.tables.write().await;

        let mut expired: Vec<_> = tables
            .outbox
            .values()
            .filter(|m| m.lease_expired(now))
            .map(|m| (m.lease_expires_at, m.sequence, m.id))
            .collect();
        expired.sort();

        let mut reclaimed = Vec::new();
        for (_, _, id) in expired.into_iter().take(limit) {
            if let Some(message) = tables.outbox.get_mut(&id) {
                message.reclaim_lease()?;
                message.version += 1;
                reclaimed.push(id);
            }
        }
        Ok(reclaimed)
    }

    async fn release_lease(&self, id: MessageId) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables.outbox.get_mut(&id) {
            Some(message) if message.status == OutboxStatus::Processing => {
                message.reclaim_lease()?;
                message.version += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_outbox_message(&self, id: MessageId) -> Result<Option<OutboxMessage>> {
        Ok(self.tables.read().await.outbox.get(&id).cloned())
    }

    async fn query_outbox(&self, query: OutboxQuery) -> Result<Vec<OutboxMessage>> {
        let tables = self.tables.read().await;
        let rows = tables
            .sorted_outbox(|m| query.matches(m))
            .into_iter()
            .skip(query.offset.unwrap_or(0))
            .cloned();

        Ok(match query.limit {
            Some(limit) => rows.take(limit).collect(),
            None => rows.collect(),
        })
    }

    async fn status_counts(&self) -> Result<StatusCounts> {
        let tables = self.tables.read().await;
        let mut counts = StatusCounts::default();
        for message in tables.outbox.values() {
            counts.record(message);
        }
        Ok(counts)
    }

    async fn purge_published(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut tables = self.tables.write().await;
        let before = tables.outbox.len();
        tables.outbox.retain(|_, m| {
            !(m.status == OutboxStatus::Published
                && m.processed_at.is_some_and(|at| at < older_than))
        });
        Ok((before - tables.outbox.len()) as u64)
    }

    async fn abandon_stale_transactions(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let mut transactions = self.transactions.lock().await;
        let before = transactions.len();
        transactions.retain(|_, tx| tx.begun_at >= older_than);
        let abandoned = before - transactions.len();
        if abandoned > 0 {
            tracing::warn!(abandoned, %older_than, "discarded abandoned transactions");
        }
        Ok(abandoned)
    }
}
