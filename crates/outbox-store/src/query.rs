use chrono::{DateTime, Utc};

use crate::error::{Result, StoreError};
use crate::{AggregateId, OutboxMessage, OutboxStatus};

/// Builder for filtering outbox messages.
///
/// Used by operators to inspect the outbox (dead letters, one aggregate's
/// history). Results come back in commit order.
#[derive(Debug, Clone, Default)]
pub struct OutboxQuery {
    /// Filter by aggregate ID.
    pub aggregate_id: Option<AggregateId>,

    /// Filter by aggregate type.
    pub aggregate_type: Option<String>,

    /// Filter by event types (any of these types).
    pub event_types: Option<Vec<String>>,

    /// Filter by statuses (any of these).
    pub statuses: Option<Vec<OutboxStatus>>,

    /// Filter by messages created at or after this timestamp.
    pub from_created_at: Option<DateTime<Utc>>,

    /// Filter by messages created at or before this timestamp.
    pub to_created_at: Option<DateTime<Utc>>,

    /// Maximum number of messages to return.
    pub limit: Option<usize>,

    /// Number of messages to skip.
    pub offset: Option<usize>,
}

impl OutboxQuery {
    /// Creates a new empty query.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a query for a specific aggregate.
    pub fn for_aggregate(aggregate_id: AggregateId) -> Self {
        Self {
            aggregate_id: Some(aggregate_id),
            ..Default::default()
        }
    }

    /// Creates a query for messages in one status.
    pub fn for_status(status: OutboxStatus) -> Self {
        Self {
            statuses: Some(vec![status]),
            ..Default::default()
        }
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
        self.event_types = Some(vec![event_type.into()]);
        self
    }

    pub fn event_types(mut self, event_types: Vec<String>) -> Self {
        self.event_types = Some(event_types);
        self
    }

    pub fn status(mut self, status: OutboxStatus) -> Self {
        self.statuses = Some(vec![status]);
        self
    }

    pub fn statuses(mut self, statuses: Vec<OutboxStatus>) -> Self {
        self.statuses = Some(statuses);
        self
    }

    pub fn from_created_at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.from_created_at = Some(timestamp);
        self
    }

    pub fn to_created_at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.to_created_at = Some(timestamp);
        self
    }

    /// Limits the number of messages returned.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skips this many messages before returning results.
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Whether a message passes every filter (limit/offset not applied).
    pub fn matches(&self, message: &OutboxMessage) -> bool {
        if let Some(id) = self.aggregate_id
            && message.aggregate_id != id
        {
            return false;
        }
        if let Some(ref aggregate_type) = self.aggregate_type
            && &message.aggregate_type != aggregate_type
        {
            return false;
        }
        if let Some(ref event_types) = self.event_types
            && !event_types.contains(&message.event_type)
        {
            return false;
        }
        if let Some(ref statuses) = self.statuses
            && !statuses.contains(&message.status)
        {
            return false;
        }
        if let Some(from) = self.from_created_at
            && message.created_at < from
        {
            return false;
        }
        if let Some(to) = self.to_created_at
            && message.created_at > to
        {
            return false;
        }
        true
    }
}

/// Slice of the aggregate keyspace owned by one relay worker.
///
/// Every aggregate belongs to exactly one partition, so per-aggregate order
/// holds across workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    index: u32,
    count: u32,
}

impl Partition {
    pub fn new(index: u32, count: u32) -> Result<Self> {
        if count == 0 || index >= count {
            return Err(StoreError::InvalidPartition { index, count });
        }
        Ok(Self { index, count })
    }

    /// The whole keyspace.
    pub fn single() -> Self {
        Self { index: 0, count: 1 }
    }

    /// All partitions for `count` workers.
    pub fn all(count: u32) -> Vec<Partition> {
        (0..count.max(1))
            .map(|index| Partition {
                index,
                count: count.max(1),
            })
            .collect()
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn owns(&self, aggregate_id: &AggregateId) -> bool {
        self.owns_key(aggregate_id.partition_key())
    }

    pub fn owns_key(&self, partition_key: i32) -> bool {
        (partition_key as u32) % self.count == self.index
    }
}

impl Default for Partition {
    fn default() -> Self {
        Self::single()
    }
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.index, self.count)
    }
}
