use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    AggregateId, Clock, CommitReceipt, CorrelationId, MessageId, OutboxMessage, OutboxQuery,
    OutboxStatus, OutboxUpdate, Partition, Result, StoreError, SystemClock, TxId,
    message::lease_expiry,
    store::{
        StatusCounts, TransactionalStore, check_update, validate_enqueue, validate_write,
    },
};

const OUTBOX_COLUMNS: &str = "id, aggregate_id, aggregate_type, event_type, payload, status, \
     created_at, processed_at, retry_count, max_retries, next_retry_at, last_error, \
     correlation_id, causation_id, lease_expires_at, version, sequence";

/// A registered transaction. The database transaction lives inside the slot
/// so its writes stay invisible until COMMIT.
enum TxSlot {
    Open {
        tx: sqlx::Transaction<'static, Postgres>,
        writes: BTreeSet<(String, String)>,
        outbox: usize,
    },
    Aborted(String),
}

type SlotHandle = Arc<tokio::sync::Mutex<TxSlot>>;

struct Registered {
    begun_at: DateTime<Utc>,
    slot: SlotHandle,
}

/// PostgreSQL-backed transactional store.
///
/// Business rows go to `business_rows`, outbox rows to `outbox_messages`.
/// Lease and status updates are single conditional UPDATE statements, so
/// several relay processes can share one database.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    transactions: Arc<Mutex<HashMap<TxId, Registered>>>,
    clock: Arc<dyn Clock>,
}

impl PostgresStore {
    /// Creates a new PostgreSQL store on the system clock.
    pub fn new(pool: PgPool) -> Self {
        Self::with_clock(pool, Arc::new(SystemClock))
    }

    pub fn with_clock(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            transactions: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }

    /// Connects to `database_url` with a pool of at most `max_connections`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, HashMap<TxId, Registered>> {
        self.transactions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, tx: TxId) -> Result<SlotHandle> {
        self.registry()
            .get(&tx)
            .map(|r| Arc::clone(&r.slot))
            .ok_or(StoreError::TransactionNotFound(tx))
    }

    fn aborted(tx_id: TxId, reason: &str) -> StoreError {
        StoreError::TransactionAborted {
            tx_id,
            reason: reason.to_string(),
        }
    }

    fn row_to_message(row: PgRow) -> Result<OutboxMessage> {
        let status: String = row.try_get("status")?;
        let retry_count: i32 = row.try_get("retry_count")?;
        let max_retries: i32 = row.try_get("max_retries")?;
        let correlation_id: Option<String> = row.try_get("correlation_id")?;

        Ok(OutboxMessage {
            id: MessageId::from_uuid(row.try_get::<Uuid, _>("id")?),
            aggregate_id: AggregateId::from_uuid(row.try_get::<Uuid, _>("aggregate_id")?),
            aggregate_type: row.try_get("aggregate_type")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            status: status.parse()?,
            created_at: row.try_get("created_at")?,
            processed_at: row.try_get("processed_at")?,
            retry_count: u32::try_from(retry_count)
                .map_err(|_| StoreError::CorruptRow(format!("retry_count {retry_count}")))?,
            max_retries: u32::try_from(max_retries)
                .map_err(|_| StoreError::CorruptRow(format!("max_retries {max_retries}")))?,
            next_retry_at: row.try_get("next_retry_at")?,
            last_error: row.try_get("last_error")?,
            correlation_id: correlation_id.map(CorrelationId::from),
            causation_id: row.try_get("causation_id")?,
            lease_expires_at: row.try_get("lease_expires_at")?,
            version: row.try_get("version")?,
            sequence: row.try_get("sequence")?,
        })
    }

    fn status_names(statuses: &[OutboxStatus]) -> Vec<String> {
        statuses.iter().map(|s| s.as_str().to_string()).collect()
    }
}

#[async_trait]
impl TransactionalStore for PostgresStore {
    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    async fn begin(&self) -> Result<TxId> {
        let db_tx = self.pool.begin().await?;
        let tx_id = TxId::new();
        let slot = TxSlot::Open {
            tx: db_tx,
            writes: BTreeSet::new(),
            outbox: 0,
        };
        let registered = Registered {
            begun_at: self.clock.now(),
            slot: Arc::new(tokio::sync::Mutex::new(slot)),
        };
        self.registry().insert(tx_id, registered);
        Ok(tx_id)
    }

    async fn write(
        &self,
        tx: TxId,
        table: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<()> {
        let handle = self.slot(tx)?;
        let mut slot = handle.lock().await;
        let now = self.clock.now();

        let result = match &mut *slot {
            TxSlot::Aborted(reason) => return Err(Self::aborted(tx, reason)),
            TxSlot::Open { tx: db_tx, writes, .. } => {
                if let Err(err) = validate_write(table, key) {
                    Err(err)
                } else {
                    sqlx::query(
                        r#"
                        INSERT INTO business_rows (table_name, row_key, value, updated_at)
                        VALUES ($1, $2, $3, $4)
                        ON CONFLICT (table_name, row_key) DO UPDATE SET
                            value = EXCLUDED.value,
                            updated_at = EXCLUDED.updated_at
                        "#,
                    )
                    .bind(table)
                    .bind(key)
                    .bind(&value)
                    .bind(now)
                    .execute(&mut **db_tx)
                    .await
                    .map(|_| {
                        writes.insert((table.to_string(), key.to_string()));
                    })
                    .map_err(StoreError::from)
                }
            }
        };

        if let Err(err) = result {
            *slot = TxSlot::Aborted(err.to_string());
            return Err(err);
        }
        Ok(())
    }

    async fn enqueue_outbox(&self, tx: TxId, message: OutboxMessage) -> Result<()> {
        let handle = self.slot(tx)?;
        let mut slot = handle.lock().await;

        let result = match &mut *slot {
            TxSlot::Aborted(reason) => return Err(Self::aborted(tx, reason)),
            TxSlot::Open {
                tx: db_tx, outbox, ..
            } => {
                if let Err(err) = validate_enqueue(&message) {
                    Err(err)
                } else {
                    sqlx::query(
                        r#"
                        INSERT INTO outbox_messages (
                            id, aggregate_id, aggregate_type, event_type, payload, status,
                            created_at, retry_count, max_retries, correlation_id, causation_id,
                            partition_key, version
                        )
                        VALUES ($1, $2, $3, $4, $5, 'pending', $6, 0, $7, $8, $9, $10, 0)
                        "#,
                    )
                    .bind(message.id().as_uuid())
                    .bind(message.aggregate_id().as_uuid())
                    .bind(message.aggregate_type())
                    .bind(message.event_type())
                    .bind(message.payload())
                    .bind(message.created_at())
                    .bind(i32::try_from(message.max_retries()).unwrap_or(i32::MAX))
                    .bind(message.correlation_id().map(|c| c.as_str()))
                    .bind(message.causation_id())
                    .bind(message.partition_key())
                    .execute(&mut **db_tx)
                    .await
                    .map(|_| *outbox += 1)
                    .map_err(|e| {
                        if let sqlx::Error::Database(ref db_err) = e
                            && db_err.constraint() == Some("outbox_messages_pkey")
                        {
                            return StoreError::DuplicateMessage(message.id());
                        }
                        StoreError::Database(e)
                    })
                }
            }
        };

        if let Err(err) = result {
            *slot = TxSlot::Aborted(err.to_string());
            return Err(err);
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn commit(&self, tx: TxId) -> Result<CommitReceipt> {
        let handle = self.slot(tx)?;
        let mut slot = handle.lock().await;

        let taken = std::mem::replace(&mut *slot, TxSlot::Aborted("commit in progress".into()));
        let (db_tx, writes, outbox) = match taken {
            TxSlot::Open {
                tx: db_tx,
                writes,
                outbox,
            } => (db_tx, writes, outbox),
            TxSlot::Aborted(reason) => {
                let err = Self::aborted(tx, &reason);
                *slot = TxSlot::Aborted(reason);
                return Err(err);
            }
        };

        if let Err(e) = db_tx.commit().await {
            let reason = e.to_string();
            *slot = TxSlot::Aborted(reason.clone());
            return Err(StoreError::TransactionAborted { tx_id: tx, reason });
        }

        drop(slot);
        self.registry().remove(&tx);

        metrics::counter!("outbox_messages_enqueued_total").increment(outbox as u64);
        tracing::debug!(writes = writes.len(), outbox_messages = outbox, "transaction committed");
        Ok(CommitReceipt {
            tx_id: tx,
            writes: writes.len(),
            outbox_messages: outbox,
        })
    }

    async fn rollback(&self, tx: TxId) -> Result<()> {
        let handle = self
            .registry()
            .remove(&tx)
            .map(|r| r.slot)
            .ok_or(StoreError::TransactionNotFound(tx))?;
        let mut slot = handle.lock().await;
        let taken = std::mem::replace(&mut *slot, TxSlot::Aborted("rolled back".into()));
        if let TxSlot::Open { tx: db_tx, .. } = taken {
            db_tx.rollback().await?;
        }
        tracing::debug!(tx_id = %tx, "transaction rolled back");
        Ok(())
    }

    async fn read(&self, table: &str, key: &str) -> Result<Option<serde_json::Value>> {
        let value: Option<serde_json::Value> = sqlx::query_scalar(
            "SELECT value FROM business_rows WHERE table_name = $1 AND row_key = $2",
        )
        .bind(table)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(value)
    }

    async fn get_pending_outbox_for_partition(
        &self,
        limit: usize,
        partition: Partition,
    ) -> Result<Vec<OutboxMessage>> {
        let sql = format!(
            r#"
            SELECT {OUTBOX_COLUMNS}
            FROM outbox_messages
            WHERE status = 'pending'
              AND (next_retry_at IS NULL OR next_retry_at <= $1)
              AND partition_key % $2 = $3
            ORDER BY created_at ASC, sequence ASC
            LIMIT $4
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(self.clock.now())
            .bind(partition.count() as i32)
            .bind(partition.index() as i32)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Self::row_to_message).collect()
    }

    #[tracing::instrument(skip(self))]
    async fn try_lease(
        &self,
        id: MessageId,
        lease_timeout: std::time::Duration,
    ) -> Result<Option<OutboxMessage>> {
        let now = self.clock.now();
        let sql = format!(
            r#"
            UPDATE outbox_messages
            SET status = 'processing',
                processed_at = $2,
                next_retry_at = NULL,
                lease_expires_at = $3,
                version = version + 1
            WHERE id = $1
              AND status = 'pending'
              AND (next_retry_at IS NULL OR next_retry_at <= $2)
            RETURNING {OUTBOX_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(now)
            .bind(lease_expiry(now, lease_timeout))
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_message).transpose()
    }

    async fn update_outbox_status(
        &self,
        id: MessageId,
        update: OutboxUpdate,
    ) -> Result<OutboxMessage> {
        let sql = format!(
            r#"
            UPDATE outbox_messages
            SET status = $3,
                processed_at = $4,
                retry_count = LEAST($5, max_retries),
                next_retry_at = $6,
                last_error = $7,
                lease_expires_at = $8,
                version = version + 1
            WHERE id = $1
              AND version = $2
              AND status = ANY($9)
            RETURNING {OUTBOX_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(update.expected_version)
            .bind(update.status.as_str())
            .bind(update.processed_at)
            .bind(i32::try_from(update.retry_count).unwrap_or(i32::MAX))
            .bind(update.next_retry_at)
            .bind(update.last_error.as_deref())
            .bind(update.lease_expires_at)
            .bind(Self::status_names(update.status.predecessors()))
            .fetch_optional(&self.pool)
            .await?;

        if let Some(row) = row {
            return Self::row_to_message(row);
        }

        // Nothing matched: work out why.
        let current = self
            .get_outbox_message(id)
            .await?
            .ok_or(StoreError::MessageNotFound(id))?;
        check_update(&current, &update)?;
        Err(StoreError::ConcurrencyConflict {
            id,
            expected: update.expected_version,
            actual: current.version(),
        })
    }

    #[tracing::instrument(skip(self))]
    async fn reclaim_expired_leases(&self, limit: usize) -> Result<Vec<MessageId>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE outbox_messages
            SET status = 'pending',
                lease_expires_at = NULL,
                version = version + 1
            WHERE id IN (
                SELECT id FROM outbox_messages
                WHERE status = 'processing' AND lease_expires_at < $1
                ORDER BY lease_expires_at ASC, sequence ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            AND status = 'processing'
            RETURNING id
            "#,
        )
        .bind(self.clock.now())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.into_iter().map(MessageId::from_uuid).collect())
    }

    async fn release_lease(&self, id: MessageId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET status = 'pending',
                lease_expires_at = NULL,
                version = version + 1
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id.as_uuid())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_outbox_message(&self, id: MessageId) -> Result<Option<OutboxMessage>> {
        let sql = format!("SELECT {OUTBOX_COLUMNS} FROM outbox_messages WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_message).transpose()
    }

    async fn query_outbox(&self, query: OutboxQuery) -> Result<Vec<OutboxMessage>> {
        let mut sql = format!("SELECT {OUTBOX_COLUMNS} FROM outbox_messages WHERE 1=1");
        let mut param_count = 0;

        if query.aggregate_id.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND aggregate_id = ${}", param_count));
        }
        if query.aggregate_type.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND aggregate_type = ${}", param_count));
        }
        if query.event_types.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND event_type = ANY(${})", param_count));
        }
        if query.statuses.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND status = ANY(${})", param_count));
        }
        if query.from_created_at.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND created_at >= ${}", param_count));
        }
        if query.to_created_at.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND created_at <= ${}", param_count));
        }

        sql.push_str(" ORDER BY created_at ASC, sequence ASC");

        if query.limit.is_some() {
            param_count += 1;
            sql.push_str(&format!(" LIMIT ${}", param_count));
        }
        if query.offset.is_some() {
            param_count += 1;
            sql.push_str(&format!(" OFFSET ${}", param_count));
        }

        let mut sqlx_query = sqlx::query(&sql);

        if let Some(id) = query.aggregate_id {
            sqlx_query = sqlx_query.bind(id.as_uuid());
        }
        if let Some(ref aggregate_type) = query.aggregate_type {
            sqlx_query = sqlx_query.bind(aggregate_type);
        }
        if let Some(ref event_types) = query.event_types {
            sqlx_query = sqlx_query.bind(event_types.clone());
        }
        if let Some(ref statuses) = query.statuses {
            sqlx_query = sqlx_query.bind(Self::status_names(statuses));
        }
        if let Some(from) = query.from_created_at {
            sqlx_query = sqlx_query.bind(from);
        }
        if let Some(to) = query.to_created_at {
            sqlx_query = sqlx_query.bind(to);
        }
        if let Some(limit) = query.limit {
            sqlx_query = sqlx_query.bind(limit as i64);
        }
        if let Some(offset) = query.offset {
            sqlx_query = sqlx_query.bind(offset as i64);
        }

        let rows = sqlx_query.fetch_all(&self.pool).await?;
        rows.into_iter().map(Self::row_to_message).collect()
    }

    async fn status_counts(&self) -> Result<StatusCounts> {
        let rows = sqlx::query(
            r#"
            SELECT status,
                   COUNT(*) AS total,
                   COUNT(*) FILTER (WHERE retry_count > 0) AS retried
            FROM outbox_messages
            GROUP BY status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let total = row.try_get::<i64, _>("total")? as u64;
            match status.parse::<OutboxStatus>()? {
                OutboxStatus::Pending => {
                    counts.pending = total;
                    counts.failed_transient = row.try_get::<i64, _>("retried")? as u64;
                }
                OutboxStatus::Processing => counts.processing = total,
                OutboxStatus::Published => counts.published = total,
                OutboxStatus::Dead => counts.dead = total,
            }
        }
        Ok(counts)
    }

    #[tracing::instrument(skip(self))]
    async fn purge_published(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM outbox_messages WHERE status = 'published' AND processed_at < $1",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn abandon_stale_transactions(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let stale: Vec<(TxId, SlotHandle)> = {
            let mut registry = self.registry();
            let ids: Vec<TxId> = registry
                .iter()
                .filter(|(_, r)| r.begun_at < older_than)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| registry.remove(&id).map(|r| (id, r.slot)))
                .collect()
        };

        for (tx, handle) in &stale {
            let mut slot = handle.lock().await;
            let taken = std::mem::replace(&mut *slot, TxSlot::Aborted("abandoned".into()));
            if let TxSlot::Open { tx: db_tx, .. } = taken {
                if let Err(e) = db_tx.rollback().await {
                    tracing::warn!(tx_id = %tx, error = %e, "rollback of abandoned transaction failed");
                }
            }
        }
        if !stale.is_empty() {
            tracing::warn!(abandoned = stale.len(), %older_than, "discarded abandoned transactions");
        }
        Ok(stale.len())
    }
}
