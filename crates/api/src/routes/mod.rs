//! HTTP route handlers and the state they share.

pub mod health;
pub mod metrics;
pub mod orders;
pub mod outbox;

use std::sync::Arc;

use outbox_store::TransactionalStore;
use relay::{MessageBroker, MessageRelay};

use crate::orders::OrderService;

/// Relay over whichever store and broker the server was configured with.
pub type OutboxRelay = MessageRelay<dyn TransactionalStore, dyn MessageBroker>;

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub order_service: OrderService,
    pub store: Arc<dyn TransactionalStore>,
    pub relay: Arc<OutboxRelay>,
}
