//! Relay error types.

use outbox_store::{MessageId, OutboxStatus, StoreError};
use thiserror::Error;

/// Why a broker refused a message.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    /// The broker could not be reached or is overloaded. Always retried.
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    /// The broker received the message and refused it.
    ///
    /// Retried like an outage unless `permanent`, in which case the message is
    /// dead-lettered at once.
    #[error("Broker rejected message: {reason}")]
    Rejected { reason: String, permanent: bool },
}

impl BrokerError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        BrokerError::Unavailable(reason.into())
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        BrokerError::Rejected {
            reason: reason.into(),
            permanent: false,
        }
    }

    pub fn rejected_permanently(reason: impl Into<String>) -> Self {
        BrokerError::Rejected {
            reason: reason.into(),
            permanent: true,
        }
    }

    /// Retrying cannot succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            BrokerError::Rejected {
                permanent: true,
                ..
            }
        )
    }
}

/// Errors that can occur while relaying outbox messages.
#[derive(Debug, Error)]
pub enum RelayError {
    /// An error occurred in the transactional store.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The broker call failed.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// The lease was reclaimed and the row moved on without us.
    #[error("Lease lost for message {0}")]
    LeaseLost(MessageId),

    /// `process` was handed a row that was never leased.
    #[error("Message {id} is {status}, not leased for publishing")]
    NotLeased { id: MessageId, status: OutboxStatus },

    /// The message used its whole retry budget and was dead-lettered.
    #[error("Message {id} exceeded its retry budget after {retry_count} attempts")]
    MaxRetriesExceeded { id: MessageId, retry_count: u32 },

    #[error("Relay is already running")]
    AlreadyRunning,

    #[error("Relay is not running")]
    NotRunning,

    /// Workers did not finish within the shutdown timeout. Their leases were
    /// released back to pending.
    #[error("Relay shutdown timed out, {released} leases released")]
    ShutdownTimeout { released: usize },
}

/// Result type for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
