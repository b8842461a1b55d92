//! Broker trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use common::{AggregateId, CorrelationId};
use outbox_store::{MessageId, OutboxMessage};
use serde::Serialize;

use crate::error::BrokerError;

/// What the broker receives for one outbox message.
///
/// Delivery is at-least-once, so consumers deduplicate on `message_id` (or on
/// `aggregate_id` + `topic`, or `correlation_id`).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BrokerEnvelope {
    /// Destination topic; the event type of the message.
    pub topic: String,
    pub message_id: MessageId,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,
    pub payload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
}

impl From<&OutboxMessage> for BrokerEnvelope {
    fn from(message: &OutboxMessage) -> Self {
        Self {
            topic: message.event_type().to_string(),
            message_id: message.id(),
            aggregate_id: message.aggregate_id(),
            aggregate_type: message.aggregate_type().to_string(),
            payload: message.payload().clone(),
            correlation_id: message.correlation_id().cloned(),
            causation_id: message.causation_id().map(str::to_string),
        }
    }
}

/// Endpoint the relay publishes to.
///
/// `Ok(())` means the broker accepted the message.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    async fn publish(&self, envelope: &BrokerEnvelope) -> Result<(), BrokerError>;
}

#[derive(Debug, Default)]
struct InMemoryBrokerState {
    published: Vec<BrokerEnvelope>,
    attempts: HashMap<MessageId, u32>,
    fail_always: bool,
    failures_remaining: u32,
    rejected_event_types: HashMap<String, bool>,
    publish_delay: Option<Duration>,
}

/// In-memory broker for tests and local runs.
///
/// Failure injection mirrors what real brokers do: outages, a number of
/// transient failures, and per-topic rejections.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<RwLock<InMemoryBrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, InMemoryBrokerState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, InMemoryBrokerState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fails every publish with `Unavailable` while set.
    pub fn set_fail_always(&self, fail: bool) {
        self.write().fail_always = fail;
    }

    /// Fails the next `count` publishes with `Unavailable`.
    pub fn fail_next(&self, count: u32) {
        self.write().failures_remaining = count;
    }

    /// Rejects every message published to `event_type`.
    pub fn reject_event_type(&self, event_type: impl Into<String>, permanent: bool) {
        self.write()
            .rejected_event_types
            .insert(event_type.into(), permanent);
    }

    /// Makes every publish take `delay` before answering.
    pub fn set_publish_delay(&self, delay: Option<Duration>) {
        self.write().publish_delay = delay;
    }

    /// Messages accepted so far, in publish order.
    pub fn published(&self) -> Vec<BrokerEnvelope> {
        self.read().published.clone()
    }

    pub fn publish_count(&self) -> usize {
        self.read().published.len()
    }

    /// How many times `id` was handed to the broker, successful or not.
    pub fn attempts(&self, id: MessageId) -> u32 {
        self.read().attempts.get(&id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn publish(&self, envelope: &BrokerEnvelope) -> Result<(), BrokerError> {
        let delay = self.read().publish_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.write();
        *state.attempts.entry(envelope.message_id).or_insert(0) += 1;

        if state.fail_always {
            return Err(BrokerError::unavailable("broker is down"));
        }
        if state.failures_remaining > 0 {
            state.failures_remaining -= 1;
            return Err(BrokerError::unavailable("transient broker failure"));
        }
        if let Some(&permanent) = state.rejected_event_types.get(&envelope.topic) {
            return Err(BrokerError::Rejected {
                reason: format!("topic '{}' refused the message", envelope.topic),
                permanent,
            });
        }

        tracing::debug!(
            topic = %envelope.topic,
            message_id = %envelope.message_id,
            "message published"
        );
        state.published.push(envelope.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(topic: &str) -> BrokerEnvelope {
        let message = OutboxMessage::builder()
            .aggregate_id(AggregateId::new())
            .aggregate_type("Order")
            .event_type(topic)
            .payload_raw(serde_json::json!({"n": 1}))
            .correlation_id("req-7")
            .build();
        BrokerEnvelope::from(&message)
    }

    #[test]
    fn envelope_carries_dedup_keys() {
        let env = envelope("OrderCreated");
        assert_eq!(env.topic, "OrderCreated");
        assert_eq!(env.aggregate_type, "Order");
        assert_eq!(env.correlation_id.as_ref().map(|c| c.as_str()), Some("req-7"));

        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["message_id"], env.message_id.to_string());
        assert!(json.get("causation_id").is_none());
    }

    #[tokio::test]
    async fn publish_records_message() {
        let broker = InMemoryBroker::new();
        let env = envelope("OrderCreated");

        broker.publish(&env).await.unwrap();

        assert_eq!(broker.publish_count(), 1);
        assert_eq!(broker.published()[0], env);
        assert_eq!(broker.attempts(env.message_id), 1);
    }

    #[tokio::test]
    async fn fail_next_then_recover() {
        let broker = InMemoryBroker::new();
        broker.fail_next(2);
        let env = envelope("OrderCreated");

        assert!(matches!(
            broker.publish(&env).await,
            Err(BrokerError::Unavailable(_))
        ));
        assert!(broker.publish(&env).await.is_err());
        assert!(broker.publish(&env).await.is_ok());
        assert_eq!(broker.attempts(env.message_id), 3);
        assert_eq!(broker.publish_count(), 1);
    }

    #[tokio::test]
    async fn rejected_topic() {
        let broker = InMemoryBroker::new();
        broker.reject_event_type("Poison", true);

        let err = broker.publish(&envelope("Poison")).await.unwrap_err();
        assert!(err.is_permanent());
        assert!(broker.publish(&envelope("Fine")).await.is_ok());
    }

    #[tokio::test]
    async fn fail_always_until_cleared() {
        let broker = InMemoryBroker::new();
        broker.set_fail_always(true);
        assert!(broker.publish(&envelope("A")).await.is_err());

        broker.set_fail_always(false);
        assert!(broker.publish(&envelope("A")).await.is_ok());
    }
}
