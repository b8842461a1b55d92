use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::OutboxMessage;

/// Handle to an open unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxId(Uuid);

impl TxId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TxId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TxId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle of a registered transaction.
///
/// Committed and rolled-back transactions are removed from the registry, so
/// only these two states are ever observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionState {
    Open,
    /// A write, enqueue or commit failed. Only `rollback` is accepted now.
    Aborted(String),
}

/// Business writes staged for one table, keyed by row key.
pub type TableWrites = BTreeMap<String, serde_json::Value>;

/// Buffered effects of an in-memory transaction.
#[derive(Debug, Clone)]
pub(crate) struct Transaction {
    pub(crate) state: TransactionState,
    pub(crate) begun_at: DateTime<Utc>,
    pub(crate) writes: BTreeMap<String, TableWrites>,
    pub(crate) outbox: Vec<OutboxMessage>,
}

impl Transaction {
    pub(crate) fn new(begun_at: DateTime<Utc>) -> Self {
        Self {
            state: TransactionState::Open,
            begun_at,
            writes: BTreeMap::new(),
            outbox: Vec::new(),
        }
    }

    pub(crate) fn abort(&mut self, reason: impl Into<String>) {
        self.state = TransactionState::Aborted(reason.into());
    }

    pub(crate) fn write_count(&self) -> usize {
        self.writes.values().map(BTreeMap::len).sum()
    }
}

/// What a successful commit made visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitReceipt {
    pub tx_id: TxId,
    /// Business rows written (a key written twice counts once).
    pub writes: usize,
    pub outbox_messages: usize,
}
