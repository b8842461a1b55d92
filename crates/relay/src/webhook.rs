//! HTTP webhook broker.
//!
//! Each envelope is POSTed as JSON to `{base_url}/{topic}`, with the topic
//! percent-encoded as a single path segment.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};

use crate::broker::{BrokerEnvelope, MessageBroker};
use crate::error::BrokerError;

/// Header carrying the message id so receivers can deduplicate.
pub const MESSAGE_ID_HEADER: &str = "x-outbox-message-id";

/// Header carrying the correlation id, when the message has one.
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

/// Publishes envelopes to an HTTP endpoint.
#[derive(Debug, Clone)]
pub struct WebhookBroker {
    client: reqwest::Client,
    base_url: Url,
}

impl WebhookBroker {
    /// Creates a broker posting to `base_url` with the given request timeout.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, BrokerError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BrokerError::unavailable(format!("http client: {e}")))?;
        Self::with_client(client, base_url)
    }

    /// Fails if `base_url` is not an absolute URL with a path.
    pub fn with_client(client: reqwest::Client, base_url: &str) -> Result<Self, BrokerError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| BrokerError::unavailable(format!("webhook url {base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(BrokerError::unavailable(format!(
                "webhook url {base_url} cannot take a path"
            )));
        }
        Ok(Self { client, base_url })
    }

    /// URL a message for `topic` is posted to.
    pub fn url_for(&self, topic: &str) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(topic);
        }
        url
    }
}

/// Maps a non-success HTTP status to a broker error.
///
/// Server errors, timeouts and throttling are outages; any other client error
/// means the receiver will never accept this message.
pub fn classify_status(status: StatusCode) -> BrokerError {
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        BrokerError::unavailable(format!("webhook answered {status}"))
    } else {
        BrokerError::rejected_permanently(format!("webhook answered {status}"))
    }
}

#[async_trait]
impl MessageBroker for WebhookBroker {
    async fn publish(&self, envelope: &BrokerEnvelope) -> Result<(), BrokerError> {
        let mut request = self
            .client
            .post(self.url_for(&envelope.topic))
            .header(MESSAGE_ID_HEADER, envelope.message_id.to_string())
            .json(envelope);
        if let Some(correlation_id) = &envelope.correlation_id {
            request = request.header(CORRELATION_ID_HEADER, correlation_id.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| BrokerError::unavailable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            tracing::debug!(%status, topic = %envelope.topic, "webhook refused message");
            Err(classify_status(status))
        }
    }
}
