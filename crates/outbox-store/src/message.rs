//! The outbox row and its status state machine.
//!
//! ```text
//!            try_lease                 publish ok
//! Pending ───────────────► Processing ───────────► Published (terminal)
//!    ▲                        │  │
//!    │  failure, budget left  │  │ failure, budget exhausted / permanent rejection
//!    └────────────────────────┘  └───────────────► Dead (terminal)
//!    ▲                        │
//!    └──── lease reclaimed ───┘
//! ```

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::retry::{DEFAULT_MAX_RETRIES, RetryPolicy};
use crate::{AggregateId, CorrelationId};

/// Unique identifier for an outbox message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Creates a new random message ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a message ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl From<Uuid> for MessageId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Delivery status of an outbox message.
///
/// A recoverable failure returns the row to `Pending` with a `next_retry_at`;
/// such rows are reported as "failed transient" in [`StatusCounts`](crate::StatusCounts).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    /// Waiting to be leased.
    Pending,
    /// Leased by exactly one relay worker.
    Processing,
    /// Delivered to the broker (terminal).
    Published,
    /// Retry budget exhausted or permanently rejected (terminal).
    Dead,
}

impl OutboxStatus {
    pub const ALL: [OutboxStatus; 4] = [
        OutboxStatus::Pending,
        OutboxStatus::Processing,
        OutboxStatus::Published,
        OutboxStatus::Dead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Processing => "processing",
            OutboxStatus::Published => "published",
            OutboxStatus::Dead => "dead",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboxStatus::Published | OutboxStatus::Dead)
    }

    /// Whether `self -> next` is an edge of the state machine.
    pub fn can_transition_to(&self, next: OutboxStatus) -> bool {
        matches!(
            (self, next),
            (OutboxStatus::Pending, OutboxStatus::Processing)
                | (OutboxStatus::Processing, OutboxStatus::Pending)
                | (OutboxStatus::Processing, OutboxStatus::Published)
                | (OutboxStatus::Processing, OutboxStatus::Dead)
        )
    }

    /// Statuses a row may be in right before moving to `self`.
    pub fn predecessors(&self) -> &'static [OutboxStatus] {
        match self {
            OutboxStatus::Pending => &[OutboxStatus::Processing],
            OutboxStatus::Processing => &[OutboxStatus::Pending],
            OutboxStatus::Published | OutboxStatus::Dead => &[OutboxStatus::Processing],
        }
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(OutboxStatus::Pending),
            "processing" => Ok(OutboxStatus::Processing),
            "published" => Ok(OutboxStatus::Published),
            "dead" => Ok(OutboxStatus::Dead),
            other => Err(StoreError::CorruptRow(format!("unknown status '{other}'"))),
        }
    }
}

/// `now + lease_timeout`, saturating at the latest representable instant.
pub(crate) fn lease_expiry(now: DateTime<Utc>, lease_timeout: std::time::Duration) -> DateTime<Utc> {
    let lease =
        chrono::Duration::milliseconds(lease_timeout.as_millis().min(i64::MAX as u128) as i64);
    now.checked_add_signed(lease)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// What `mark_as_failed` decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Back to pending, eligible again at `next_retry_at`.
    Retry { next_retry_at: DateTime<Utc> },
    /// Retry budget exhausted.
    Dead,
}

/// Status fields persisted by `update_outbox_status`.
///
/// `expected_version` is the version the caller read; the store only applies
/// the update if the row still has it.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxUpdate {
    pub expected_version: i64,
    pub status: OutboxStatus,
    pub processed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
}

/// One integration event waiting in (or resolved from) the outbox.
///
/// The payload is fixed at construction; only the delivery bookkeeping changes,
/// and only through the `mark_*` transitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub(crate) id: MessageId,
    pub(crate) aggregate_id: AggregateId,
    pub(crate) aggregate_type: String,
    pub(crate) event_type: String,
    pub(crate) payload: serde_json::Value,
    pub(crate) status: OutboxStatus,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) processed_at: Option<DateTime<Utc>>,
    pub(crate) retry_count: u32,
    pub(crate) max_retries: u32,
    pub(crate) next_retry_at: Option<DateTime<Utc>>,
    pub(crate) last_error: Option<String>,
    pub(crate) correlation_id: Option<CorrelationId>,
    pub(crate) causation_id: Option<String>,
    pub(crate) lease_expires_at: Option<DateTime<Utc>>,
    pub(crate) version: i64,
    pub(crate) sequence: i64,
}

impl OutboxMessage {
    /// Creates a new outbox message builder.
    pub fn builder() -> OutboxMessageBuilder {
        OutboxMessageBuilder::default()
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn aggregate_id(&self) -> AggregateId {
        self.aggregate_id
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn status(&self) -> OutboxStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn processed_at(&self) -> Option<DateTime<Utc>> {
        self.processed_at
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        self.next_retry_at
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        self.correlation_id.as_ref()
    }

    pub fn causation_id(&self) -> Option<&str> {
        self.causation_id.as_deref()
    }

    pub fn lease_expires_at(&self) -> Option<DateTime<Utc>> {
        self.lease_expires_at
    }

    /// Optimistic-concurrency version, bumped by the store on every transition.
    pub fn version(&self) -> i64 {
        self.version
    }

    /// Commit order assigned by the store; breaks `created_at` ties.
    pub fn sequence(&self) -> i64 {
        self.sequence
    }

    pub fn partition_key(&self) -> i32 {
        self.aggregate_id.partition_key()
    }

    /// Pending and past its retry time.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == OutboxStatus::Pending && self.next_retry_at.is_none_or(|at| at <= now)
    }

    /// Processing with a lease that ran out before `now`.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == OutboxStatus::Processing && self.lease_expires_at.is_some_and(|at| at < now)
    }

    fn transition(&self, to: OutboxStatus) -> Result<()> {
        if self.status.is_terminal() {
            return Err(StoreError::TerminalState {
                id: self.id,
                status: self.status,
            });
        }
        if !self.status.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                id: self.id,
                from: self.status,
                to,
            });
        }
        Ok(())
    }

    /// Takes the lease: pending -> processing until `now + lease_timeout`.
    pub fn mark_as_processing(
        &mut self,
        now: DateTime<Utc>,
        lease_timeout: std::time::Duration,
    ) -> Result<()> {
        self.transition(OutboxStatus::Processing)?;
        self.status = OutboxStatus::Processing;
        self.processed_at = Some(now);
        self.next_retry_at = None;
        self.lease_expires_at = Some(lease_expiry(now, lease_timeout));
        Ok(())
    }

    /// Records a successful publish.
    pub fn mark_as_published(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(OutboxStatus::Published)?;
        self.status = OutboxStatus::Published;
        self.processed_at = Some(now);
        self.lease_expires_at = None;
        Ok(())
    }

    /// Records a failed publish and either schedules a retry or dead-letters.
    pub fn mark_as_failed(
        &mut self,
        error: impl Into<String>,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome> {
        self.transition(OutboxStatus::Pending)?;
        self.retry_count = (self.retry_count + 1).min(self.max_retries);
        self.last_error = Some(error.into());
        self.lease_expires_at = None;

        if RetryPolicy::can_retry(self.retry_count, self.max_retries) {
            let next_retry_at = policy.next_retry_at(self.retry_count, now);
            self.status = OutboxStatus::Pending;
            self.next_retry_at = Some(next_retry_at);
            Ok(FailureOutcome::Retry { next_retry_at })
        } else {
            self.status = OutboxStatus::Dead;
            self.next_retry_at = None;
            Ok(FailureOutcome::Dead)
        }
    }

    /// Dead-letters immediately, for rejections that retrying cannot fix.
    pub fn mark_as_dead_lettered(&mut self, error: impl Into<String>) -> Result<()> {
        self.transition(OutboxStatus::Dead)?;
        self.retry_count = (self.retry_count + 1).min(self.max_retries);
        self.last_error = Some(error.into());
        self.status = OutboxStatus::Dead;
        self.next_retry_at = None;
        self.lease_expires_at = None;
        Ok(())
    }

    /// Gives an unresolved lease back without counting it as a failure.
    pub fn reclaim_lease(&mut self) -> Result<()> {
        self.transition(OutboxStatus::Pending)?;
        self.status = OutboxStatus::Pending;
        self.lease_expires_at = None;
        Ok(())
    }

    /// Status fields to persist, guarded by the current version.
    pub fn to_update(&self) -> OutboxUpdate {
        OutboxUpdate {
            expected_version: self.version,
            status: self.status,
            processed_at: self.processed_at,
            retry_count: self.retry_count,
            next_retry_at: self.next_retry_at,
            last_error: self.last_error.clone(),
            lease_expires_at: self.lease_expires_at,
        }
    }

    /// Copies the persisted status fields onto this row and bumps its version.
    pub(crate) fn apply_update(&mut self, update: OutboxUpdate) {
        self.status = update.status;
        self.processed_at = update.processed_at;
        self.retry_count = update.retry_count.min(self.max_retries);
        self.next_retry_at = update.next_retry_at;
        self.last_error = update.last_error;
        self.lease_expires_at = update.lease_expires_at;
        self.version += 1;
    }

    /// A fresh pending message carrying this one's payload, caused by it.
    pub fn replay(&self) -> OutboxMessage {
        let mut builder = OutboxMessage::builder()
            .aggregate_id(self.aggregate_id)
            .aggregate_type(self.aggregate_type.clone())
            .event_type(self.event_type.clone())
            .payload_raw(self.payload.clone())
            .max_retries(self.max_retries)
            .causation_id(self.id.to_string());
        if let Some(correlation_id) = &self.correlation_id {
            builder = builder.correlation_id(correlation_id.clone());
        }
        builder.build()
    }
}

/// Builder for constructing outbox messages.
#[derive(Debug, Default)]
pub struct OutboxMessageBuilder {
    id: Option<MessageId>,
    aggregate_id: Option<AggregateId>,
    aggregate_type: Option<String>,
    event_type: Option<String>,
    payload: Option<serde_json::Value>,
    created_at: Option<DateTime<Utc>>,
    max_retries: Option<u32>,
    correlation_id: Option<CorrelationId>,
    causation_id: Option<String>,
}

impl OutboxMessageBuilder {
    /// Sets the message ID. If not set, a new ID will be generated.
    pub fn id(mut self, id: MessageId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn aggregate_id(mut self, id: AggregateId) -> Self {
        self.aggregate_id = Some(id);
        self
    }

    pub fn aggregate_type(mut self, aggregate_type: impl Into<String>) -> Self {
        self.aggregate_type = Some(aggregate_type.into());
        self
    }

    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    /// Sets the payload from a serializable value.
    pub fn payload<T: Serialize>(mut self, payload: &T) -> std::result::Result<Self, serde_json::Error> {
        self.payload = Some(serde_json::to_value(payload)?);
        Ok(self)
    }

    /// Sets the payload from a raw JSON value.
    pub fn payload_raw(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Sets the creation time. If not set, the current time will be used.
    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// Sets the retry budget. Values below 1 are raised to 1.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Takes the retry budget for this message's event type from `policy`.
    ///
    /// Call after `event_type`.
    pub fn retry_policy(mut self, policy: &RetryPolicy) -> Self {
        let event_type = self.event_type.as_deref().unwrap_or_default();
        self.max_retries = Some(policy.max_retries_for(event_type));
        self
    }

    pub fn correlation_id(mut self, correlation_id: impl Into<CorrelationId>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn causation_id(mut self, causation_id: impl Into<String>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }

    /// Builds the message in `Pending` state.
    ///
    /// # Panics
    ///
    /// Panics if required fields (aggregate_id, aggregate_type, event_type, payload)
    /// are not set.
    pub fn build(self) -> OutboxMessage {
        OutboxMessage {
            id: self.id.unwrap_or_default(),
            aggregate_id: self.aggregate_id.expect("aggregate_id is required"),
            aggregate_type: self.aggregate_type.expect("aggregate_type is required"),
            event_type: self.event_type.expect("event_type is required"),
            payload: self.payload.expect("payload is required"),
            status: OutboxStatus::Pending,
            created_at: self.created_at.unwrap_or_else(Utc::now),
            processed_at: None,
            retry_count: 0,
            max_retries: self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES).max(1),
            next_retry_at: None,
            last_error: None,
            correlation_id: self.correlation_id,
            causation_id: self.causation_id,
            lease_expires_at: None,
            version: 0,
            sequence: 0,
        }
    }

    /// Tries to build the message, returning None if required fields are missing.
    pub fn try_build(self) -> Option<OutboxMessage> {
        Some(OutboxMessage {
            id: self.id.unwrap_or_default(),
            aggregate_id: self.aggregate_id?,
            aggregate_type: self.aggregate_type?,
            event_type: self.event_type?,
            payload: self.payload?,
            status: OutboxStatus::Pending,
            created_at: self.created_at.unwrap_or_else(Utc::now),
            processed_at: None,
            retry_count: 0,
            max_retries: self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES).max(1),
            next_retry_at: None,
            last_error: None,
            correlation_id: self.correlation_id,
            causation_id: self.causation_id,
            lease_expires_at: None,
            version: 0,
            sequence: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn message(max_retries: u32) -> OutboxMessage {
        OutboxMessage::builder()
            .aggregate_id(AggregateId::new())
            .aggregate_type("Order")
            .event_type("OrderCreated")
            .payload_raw(serde_json::json!({"total_cents": 1999}))
            .max_retries(max_retries)
            .build()
    }

    fn leased(max_retries: u32) -> OutboxMessage {
        let mut msg = message(max_retries);
        msg.mark_as_processing(Utc::now(), Duration::from_secs(30))
            .unwrap();
        msg
    }

    #[test]
    fn message_id_new_creates_unique_ids() {
        assert_ne!(MessageId::new(), MessageId::new());
    }

    #[test]
    fn builder_starts_pending() {
        let msg = OutboxMessage::builder()
            .aggregate_id(AggregateId::new())
            .aggregate_type("Order")
            .event_type("OrderCreated")
            .payload_raw(serde_json::json!({}))
            .correlation_id("req-1")
            .causation_id("cmd-9")
            .build();

        assert_eq!(msg.status(), OutboxStatus::Pending);
        assert_eq!(msg.retry_count(), 0);
        assert_eq!(msg.max_retries(), DEFAULT_MAX_RETRIES);
        assert_eq!(msg.correlation_id().map(|c| c.as_str()), Some("req-1"));
        assert_eq!(msg.causation_id(), Some("cmd-9"));
        assert!(msg.is_eligible(Utc::now()));
    }

    #[test]
    fn try_build_returns_none_on_missing_fields() {
        assert!(OutboxMessage::builder().event_type("X").try_build().is_none());
    }

    #[test]
    fn max_retries_has_a_floor_of_one() {
        assert_eq!(message(0).max_retries(), 1);
    }

    #[test]
    fn retry_policy_sets_budget_for_event_type() {
        let policy = RetryPolicy::default().with_max_retries_for("OrderCreated", 9);
        let msg = OutboxMessage::builder()
            .aggregate_id(AggregateId::new())
            .aggregate_type("Order")
            .event_type("OrderCreated")
            .retry_policy(&policy)
            .payload_raw(serde_json::json!({}))
            .build();
        assert_eq!(msg.max_retries(), 9);
    }

    #[test]
    fn processing_sets_lease() {
        let now = Utc::now();
        let mut msg = message(3);
        msg.mark_as_processing(now, Duration::from_secs(10)).unwrap();

        assert_eq!(msg.status(), OutboxStatus::Processing);
        assert_eq!(msg.processed_at(), Some(now));
        assert_eq!(
            msg.lease_expires_at(),
            Some(now + chrono::Duration::seconds(10))
        );
        assert!(!msg.lease_expired(now));
        assert!(msg.lease_expired(now + chrono::Duration::seconds(11)));
    }

    #[test]
    fn lease_expiry_saturates() {
        let now = Utc::now();
        assert_eq!(lease_expiry(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn publish_requires_processing() {
        let mut msg = message(3);
        let err = msg.mark_as_published(Utc::now()).unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[test]
    fn published_is_terminal() {
        let mut msg = leased(3);
        msg.mark_as_published(Utc::now()).unwrap();

        assert!(matches!(
            msg.mark_as_processing(Utc::now(), Duration::from_secs(1)),
            Err(StoreError::TerminalState { .. })
        ));
        assert!(matches!(
            msg.reclaim_lease(),
            Err(StoreError::TerminalState { .. })
        ));
        assert_eq!(msg.status(), OutboxStatus::Published);
    }

    #[test]
    fn failure_with_budget_left_goes_back_to_pending() {
        let now = Utc::now();
        let policy = RetryPolicy::new(Duration::from_millis(100), Duration::from_secs(10), 0.0, 3);
        let mut msg = leased(3);

        let outcome = msg.mark_as_failed("broker down", &policy, now).unwrap();

        let expected = now + chrono::Duration::milliseconds(200);
        assert_eq!(
            outcome,
            FailureOutcome::Retry {
                next_retry_at: expected
            }
        );
        assert_eq!(msg.status(), OutboxStatus::Pending);
        assert_eq!(msg.retry_count(), 1);
        assert_eq!(msg.last_error(), Some("broker down"));
        assert_eq!(msg.lease_expires_at(), None);
        assert!(!msg.is_eligible(now));
        assert!(msg.is_eligible(expected));
    }

    #[test]
    fn failure_exhausting_budget_is_dead() {
        let policy = RetryPolicy::immediate(2);
        let mut msg = leased(2);
        assert!(matches!(
            msg.mark_as_failed("e1", &policy, Utc::now()).unwrap(),
            FailureOutcome::Retry { .. }
        ));

        msg.mark_as_processing(Utc::now(), Duration::from_secs(1))
            .unwrap();
        let outcome = msg.mark_as_failed("e2", &policy, Utc::now()).unwrap();

        assert_eq!(outcome, FailureOutcome::Dead);
        assert_eq!(msg.status(), OutboxStatus::Dead);
        assert_eq!(msg.retry_count(), 2);
        assert_eq!(msg.last_error(), Some("e2"));
        assert_eq!(msg.next_retry_at(), None);
        assert!(matches!(
            msg.mark_as_failed("e3", &policy, Utc::now()),
            Err(StoreError::TerminalState { .. })
        ));
        assert_eq!(msg.retry_count(), 2);
    }

    #[test]
    fn dead_lettering_skips_remaining_budget() {
        let mut msg = leased(5);
        msg.mark_as_dead_lettered("schema rejected").unwrap();

        assert_eq!(msg.status(), OutboxStatus::Dead);
        assert_eq!(msg.retry_count(), 1);
        assert_eq!(msg.last_error(), Some("schema rejected"));
    }

    #[test]
    fn reclaim_does_not_count_as_failure() {
        let mut msg = leased(3);
        msg.reclaim_lease().unwrap();

        assert_eq!(msg.status(), OutboxStatus::Pending);
        assert_eq!(msg.retry_count(), 0);
        assert_eq!(msg.lease_expires_at(), None);
    }

    #[test]
    fn reclaim_of_pending_is_rejected() {
        let mut msg = message(3);
        assert!(matches!(
            msg.reclaim_lease(),
            Err(StoreError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn apply_update_bumps_version() {
        let mut stored = message(3);
        let mut copy = stored.clone();
        copy.mark_as_processing(Utc::now(), Duration::from_secs(5))
            .unwrap();

        let update = copy.to_update();
        assert_eq!(update.expected_version, 0);
        stored.apply_update(update);

        assert_eq!(stored.version(), 1);
        assert_eq!(stored.status(), OutboxStatus::Processing);
        assert_eq!(stored.payload(), copy.payload());
    }

    #[test]
    fn replay_creates_new_message_caused_by_the_dead_one() {
        let mut dead = leased(1);
        dead.mark_as_failed("nope", &RetryPolicy::immediate(1), Utc::now())
            .unwrap();

        let replay = dead.replay();

        assert_ne!(replay.id(), dead.id());
        assert_eq!(replay.status(), OutboxStatus::Pending);
        assert_eq!(replay.retry_count(), 0);
        assert_eq!(replay.payload(), dead.payload());
        assert_eq!(replay.causation_id(), Some(dead.id().to_string().as_str()));
        assert_eq!(dead.status(), OutboxStatus::Dead);
    }

    #[test]
    fn status_transitions_table() {
        use OutboxStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Pending));
        assert!(Processing.can_transition_to(Published));
        assert!(Processing.can_transition_to(Dead));
        assert!(!Pending.can_transition_to(Published));
        assert!(!Published.can_transition_to(Pending));
        assert!(!Dead.can_transition_to(Pending));
    }

    #[test]
    fn status_parses_from_storage_names() {
        for status in OutboxStatus::ALL {
            assert_eq!(status.as_str().parse::<OutboxStatus>().unwrap(), status);
        }
        assert!(matches!(
            "failed".parse::<OutboxStatus>(),
            Err(StoreError::CorruptRow(_))
        ));
    }
}
