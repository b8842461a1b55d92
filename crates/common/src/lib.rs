//! Identifier types shared across the outbox workspace.

pub mod types;

pub use types::{AggregateId, CorrelationId, ParseIdError};
