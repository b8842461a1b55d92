//! Message relay for the transactional outbox.
//!
//! The relay is the only component that talks to the broker. It reads rows
//! that committed business transactions left in the outbox, leases them,
//! publishes them and records the outcome, retrying with backoff and
//! dead-lettering rows that exhaust their budget.

pub mod broker;
pub mod config;
pub mod error;
pub mod reaper;
pub mod relay;
pub mod stats;
pub mod webhook;

pub use broker::{BrokerEnvelope, InMemoryBroker, MessageBroker};
pub use config::RelayConfig;
pub use error::{BrokerError, RelayError, Result};
pub use reaper::LeaseReaper;
pub use relay::{MessageRelay, ProcessOutcome, TickReport};
pub use stats::{OutboxStats, RelayStats, RelayStatsSnapshot};
pub use webhook::WebhookBroker;
