//! Demo order service.
//!
//! Writes the order row and its `OrderCreated` outbox message in one
//! transaction, so the event reaches the broker only if the order exists.
//!
//! Requests carrying an idempotency key also record the key in that
//! transaction. The event's message id is derived from the key, so two racing
//! requests with one key cannot both commit: the loser's commit fails as a
//! duplicate message and it returns the winner's order.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::{AggregateId, CorrelationId};
use outbox_store::{
    MessageId, OutboxMessage, RetryPolicy, StoreError, TransactionalStore, TransactionalStoreExt,
    TxId,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Business table holding orders.
pub const ORDERS_TABLE: &str = "orders";

/// Business table mapping idempotency keys to the order they created.
pub const IDEMPOTENCY_TABLE: &str = "idempotency_keys";

const IDEMPOTENCY_NAMESPACE: Uuid = Uuid::from_u128(0x6f1d_2c3a_9b4e_4f57_a0c8_5e21_d7b9_3a64);

pub const ORDER_AGGREGATE_TYPE: &str = "Order";

pub const ORDER_CREATED: &str = "OrderCreated";

#[derive(Debug, Error)]
pub enum OrderError {
    #[error("Order must contain at least one item")]
    NoItems,

    #[error("Invalid quantity {quantity} for product {product_id}")]
    InvalidQuantity { product_id: String, quantity: u32 },

    #[error("Invalid price {price_cents} for product {product_id}")]
    InvalidPrice { product_id: String, price_cents: i64 },

    #[error("Order total does not fit in 64 bits")]
    TotalOverflow,

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub product_id: String,
    pub quantity: u32,
    pub unit_price_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: AggregateId,
    pub customer_id: String,
    pub items: Vec<OrderItem>,
    pub total_cents: i64,
    pub created_at: DateTime<Utc>,
}

/// Result of an idempotent create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderCreation {
    Created(Order),
    /// The key was seen before; this is the order it created.
    Existing(Order),
}

impl OrderCreation {
    pub fn order(&self) -> &Order {
        match self {
            OrderCreation::Created(order) | OrderCreation::Existing(order) => order,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, OrderCreation::Created(_))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct IdempotencyRecord {
    order_id: AggregateId,
}

/// Payload of the `OrderCreated` integration event.
#[derive(Debug, Serialize)]
struct OrderCreated<'a> {
    order_id: AggregateId,
    customer_id: &'a str,
    items: &'a [OrderItem],
    total_cents: i64,
}

fn validate(items: &[OrderItem]) -> Result<(), OrderError> {
    if items.is_empty() {
        return Err(OrderError::NoItems);
    }
    for item in items {
        if item.quantity == 0 {
            return Err(OrderError::InvalidQuantity {
                product_id: item.product_id.clone(),
                quantity: item.quantity,
            });
        }
        if item.unit_price_cents < 0 {
            return Err(OrderError::InvalidPrice {
                product_id: item.product_id.clone(),
                price_cents: item.unit_price_cents,
            });
        }
    }
    Ok(())
}

fn order_total(items: &[OrderItem]) -> Result<i64, OrderError> {
    items.iter().try_fold(0i64, |total, item| {
        item.unit_price_cents
            .checked_mul(i64::from(item.quantity))
            .and_then(|line| total.checked_add(line))
            .ok_or(OrderError::TotalOverflow)
    })
}

fn event_id_for_key(key: &str) -> MessageId {
    MessageId::from_uuid(Uuid::new_v5(&IDEMPOTENCY_NAMESPACE, key.as_bytes()))
}

pub struct OrderService {
    store: Arc<dyn TransactionalStore>,
    /// Source of the retry budget stamped on each enqueued event.
    retry: RetryPolicy,
}

impl OrderService {
    pub fn new(store: Arc<dyn TransactionalStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Creates an order and enqueues `OrderCreated` atomically.
    #[tracing::instrument(skip(self, items), fields(item_count = items.len()))]
    pub async fn create_order(
        &self,
        customer_id: String,
        items: Vec<OrderItem>,
        correlation_id: CorrelationId,
    ) -> Result<Order, OrderError> {
        self.insert(customer_id, items, correlation_id, None).await
    }

    /// Like `create_order`, but a repeated `key` returns the order the first
    /// request created without writing anything.
    #[tracing::instrument(skip(self, items), fields(item_count = items.len()))]
    pub async fn create_order_idempotent(
        &self,
        key: &str,
        customer_id: String,
        items: Vec<OrderItem>,
        correlation_id: CorrelationId,
    ) -> Result<OrderCreation, OrderError> {
        if let Some(order) = self.find_by_idempotency_key(key).await? {
            tracing::info!(order_id = %order.id, "idempotency key replayed");
            return Ok(OrderCreation::Existing(order));
        }

        match self
            .insert(customer_id, items, correlation_id, Some(key))
            .await
        {
            Ok(order) => Ok(OrderCreation::Created(order)),
            Err(OrderError::Store(err @ StoreError::DuplicateMessage(_))) => {
                match self.find_by_idempotency_key(key).await? {
                    Some(order) => Ok(OrderCreation::Existing(order)),
                    None => Err(err.into()),
                }
            }
            Err(err) => Err(err),
        }
    }

    async fn insert(
        &self,
        customer_id: String,
        items: Vec<OrderItem>,
        correlation_id: CorrelationId,
        idempotency_key: Option<&str>,
    ) -> Result<Order, OrderError> {
        validate(&items)?;

        let order = Order {
            id: AggregateId::new(),
            customer_id,
            total_cents: order_total(&items)?,
            items,
            created_at: self.store.now(),
        };

        let tx = self.store.begin().await?;
        if let Err(e) = self
            .stage(tx, &order, correlation_id, idempotency_key)
            .await
        {
            if let Err(rollback) = self.store.rollback(tx).await {
                tracing::warn!(tx_id = %tx, error = %rollback, "rollback after failed write");
            }
            return Err(e);
        }
        self.store.commit_or_rollback(tx).await?;

        metrics::counter!("orders_created_total").increment(1);
        tracing::info!(order_id = %order.id, total_cents = order.total_cents, "order created");
        Ok(order)
    }

    async fn stage(
        &self,
        tx: TxId,
        order: &Order,
        correlation_id: CorrelationId,
        idempotency_key: Option<&str>,
    ) -> Result<(), OrderError> {
        self.store
            .write_json(tx, ORDERS_TABLE, &order.id.to_string(), order)
            .await?;

        let mut event = OutboxMessage::builder();
        if let Some(key) = idempotency_key {
            self.store
                .write_json(
                    tx,
                    IDEMPOTENCY_TABLE,
                    key,
                    &IdempotencyRecord { order_id: order.id },
                )
                .await?;
            event = event.id(event_id_for_key(key));
        }

        let event = event
            .aggregate_id(order.id)
            .aggregate_type(ORDER_AGGREGATE_TYPE)
            .event_type(ORDER_CREATED)
            .payload(&OrderCreated {
                order_id: order.id,
                customer_id: &order.customer_id,
                items: &order.items,
                total_cents: order.total_cents,
            })
            .map_err(StoreError::from)?
            .retry_policy(&self.retry)
            .correlation_id(correlation_id)
            .build();
        self.store.enqueue_outbox(tx, event).await?;
        Ok(())
    }

    pub async fn get_order(&self, id: AggregateId) -> Result<Option<Order>, OrderError> {
        Ok(self
            .store
            .read_json(ORDERS_TABLE, &id.to_string())
            .await?)
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Order>, OrderError> {
        let record: Option<IdempotencyRecord> =
            self.store.read_json(IDEMPOTENCY_TABLE, key).await?;
        match record {
            Some(record) => self.get_order(record.order_id).await,
            None => Ok(None),
        }
    }
}
