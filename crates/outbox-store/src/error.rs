use thiserror::Error;

use crate::{MessageId, OutboxStatus, TxId};

/// Errors that can occur when interacting with the transactional store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The transaction id is unknown (never opened, or already committed/rolled back).
    #[error("Transaction not found: {0}")]
    TransactionNotFound(TxId),

    /// The transaction failed before or during commit. Nothing it buffered is
    /// visible; the caller must call `rollback` to release it.
    #[error("Transaction {tx_id} aborted: {reason}")]
    TransactionAborted { tx_id: TxId, reason: String },

    /// A business write was rejected before reaching storage.
    #[error("Invalid write: {0}")]
    InvalidWrite(String),

    /// An outbox message with this id already exists.
    #[error("Duplicate outbox message: {0}")]
    DuplicateMessage(MessageId),

    /// The outbox message does not exist.
    #[error("Outbox message not found: {0}")]
    MessageNotFound(MessageId),

    /// The requested status change is not an edge of the outbox state machine.
    #[error("Invalid transition for message {id}: {from} -> {to}")]
    InvalidTransition {
        id: MessageId,
        from: OutboxStatus,
        to: OutboxStatus,
    },

    /// The message is published or dead and can no longer change.
    #[error("Message {id} is in terminal state {status}")]
    TerminalState { id: MessageId, status: OutboxStatus },

    /// The row changed since it was read; the caller's lease is gone.
    #[error("Concurrency conflict for message {id}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        id: MessageId,
        expected: i64,
        actual: i64,
    },

    /// Only dead-lettered messages can be replayed.
    #[error("Message {id} is {status}, only dead messages can be replayed")]
    NotDeadLettered { id: MessageId, status: OutboxStatus },

    /// A relay partition was configured with an index outside its count.
    #[error("Invalid partition {index}/{count}")]
    InvalidPartition { index: u32, count: u32 },

    /// A persisted row could not be mapped back to an outbox message.
    #[error("Corrupt outbox row: {0}")]
    CorruptRow(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// True when the error means another actor now owns the row.
    pub fn is_lease_lost(&self) -> bool {
        matches!(
            self,
            StoreError::ConcurrencyConflict { .. } | StoreError::TerminalState { .. }
        )
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
