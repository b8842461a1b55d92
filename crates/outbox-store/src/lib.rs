pub mod clock;
pub mod error;
pub mod memory;
pub mod message;
pub mod postgres;
pub mod query;
pub mod retry;
pub mod store;
pub mod transaction;

pub use clock::{Clock, ManualClock, SystemClock};
pub use common::{AggregateId, CorrelationId};
pub use error::{Result, StoreError};
pub use memory::InMemoryStore;
pub use message::{
    FailureOutcome, MessageId, OutboxMessage, OutboxMessageBuilder, OutboxStatus, OutboxUpdate,
};
pub use postgres::PostgresStore;
pub use query::{OutboxQuery, Partition};
pub use retry::RetryPolicy;
pub use store::{StatusCounts, TransactionalStore, TransactionalStoreExt};
pub use transaction::{CommitReceipt, TransactionState, TxId};
