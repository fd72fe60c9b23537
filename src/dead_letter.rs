//! Dead-letter hand-off for messages that failed permanently

use crate::observability::metrics::metrics;
use crate::protocol::{DeadLetterEnvelope, Delivery, PublishRequest};
use crate::publisher::{PublishError, Publisher};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub const ORIGINAL_EXCHANGE_HEADER: &str = "x-original-exchange";
pub const ORIGINAL_ROUTING_KEY_HEADER: &str = "x-original-routing-key";

/// Where dead-letter envelopes are published
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterDestination {
    #[serde(default)]
    pub exchange: String,
    pub routing_key: String,
    #[serde(default = "default_content_type")]
    pub content_type: String,
}

fn default_content_type() -> String {
    "application/json".to_string()
}

impl DeadLetterDestination {
    pub fn new<E: Into<String>, K: Into<String>>(exchange: E, routing_key: K) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            content_type: default_content_type(),
        }
    }
}

/// Publishes a [`DeadLetterEnvelope`] for each delivery handed to it
#[derive(Clone)]
pub struct DeadLetterSink {
    publisher: Publisher,
    destination: DeadLetterDestination,
}

impl DeadLetterSink {
    pub fn new(publisher: Publisher, destination: DeadLetterDestination) -> Self {
        Self {
            publisher,
            destination,
        }
    }

    pub fn destination(&self) -> &DeadLetterDestination {
        &self.destination
    }

    /// Record `delivery` as failed with `error` after `attempt_count` attempts.
    ///
    /// The send error is returned so the caller can decide whether the
    /// original delivery may be acknowledged.
    pub async fn publish_failure(
        &self,
        cancel: &CancellationToken,
        delivery: &Delivery,
        error: &str,
        attempt_count: u32,
    ) -> Result<(), PublishError> {
        let request = self.build_request(delivery, error.to_string(), attempt_count);

        match self.publisher.publish(cancel, request).await {
            Ok(()) => {
                metrics().record_dead_lettered();
                info!(
                    delivery_tag = delivery.delivery_tag,
                    routing_key = %delivery.routing_key,
                    dlq_routing_key = %self.destination.routing_key,
                    attempt_count,
                    error,
                    "delivery dead-lettered"
                );
                Ok(())
            }
            Err(e) => {
                metrics().record_dead_letter_failure();
                Err(e)
            }
        }
    }

    /// Build the envelope request (pure apart from the timestamp)
    fn build_request(
        &self,
        delivery: &Delivery,
        error_text: String,
        attempt_count: u32,
    ) -> PublishRequest {
        let envelope = DeadLetterEnvelope::from_delivery(delivery, error_text, attempt_count);
        let (payload, encoded) = envelope.encode(&delivery.body);
        if !encoded {
            error!(
                delivery_tag = delivery.delivery_tag,
                routing_key = %delivery.routing_key,
                "failed to encode dead-letter envelope, sending fallback payload"
            );
        }

        PublishRequest::new(
            self.destination.exchange.clone(),
            self.destination.routing_key.clone(),
            payload,
        )
        .with_content_type(self.destination.content_type.clone())
        .with_header(ORIGINAL_EXCHANGE_HEADER, delivery.exchange.clone())
        .with_header(ORIGINAL_ROUTING_KEY_HEADER, delivery.routing_key.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_defaults_to_json() {
        let destination: DeadLetterDestination =
            toml::from_str(r#"routing_key = "orders.dlq""#).unwrap();
        assert_eq!(destination.exchange, "");
        assert_eq!(destination.content_type, "application/json");
    }
}
