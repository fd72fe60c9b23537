//! Message types exchanged with the broker
//!
//! [`Delivery`] is what handlers see, [`PublishRequest`] is what the publisher
//! sends, and [`DeadLetterEnvelope`] is the record written for messages whose
//! processing failed for good.

use super::topology::{validate_exchange_name, validate_short_string};
use crate::error::BrokerError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Header carrying the broker's delivery count on quorum queues
pub const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";

/// A message received from a subscription
///
/// Plain data: cloning is cheap and the acknowledgement handle stays with the
/// consumer pool.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub body: Bytes,
    pub exchange: String,
    pub routing_key: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub headers: BTreeMap<String, String>,
    pub content_type: Option<String>,
    pub message_id: Option<String>,
}

impl Delivery {
    pub fn new<K: Into<String>>(routing_key: K, body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            exchange: String::new(),
            routing_key: routing_key.into(),
            delivery_tag: 0,
            redelivered: false,
            headers: BTreeMap::new(),
            content_type: None,
            message_id: None,
        }
    }

    /// How many times the broker has delivered this message before, when it
    /// reports it.
    pub fn redelivery_count(&self) -> Option<u32> {
        self.headers
            .get(DELIVERY_COUNT_HEADER)
            .and_then(|count| count.parse().ok())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// An outbound message
///
/// # Examples
/// ```
/// use resilient_amqp::protocol::PublishRequest;
/// use std::time::Duration;
///
/// let request = PublishRequest::new("events", "orders.created", "{\"id\":1}")
///     .with_content_type("application/json")
///     .with_header("tenant", "acme")
///     .with_expiration(Duration::from_secs(30));
///
/// assert!(request.validate().is_ok());
/// assert_eq!(request.expiration_millis().as_deref(), Some("30000"));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct PublishRequest {
    pub exchange: String,
    pub routing_key: String,
    pub body: Bytes,
    pub headers: BTreeMap<String, String>,
    pub expiration: Option<Duration>,
    pub content_type: Option<String>,
    pub message_id: Option<String>,
    pub persistent: bool,
}

impl PublishRequest {
    pub fn new<E: Into<String>, K: Into<String>>(
        exchange: E,
        routing_key: K,
        body: impl Into<Bytes>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            body: body.into(),
            headers: BTreeMap::new(),
            expiration: None,
            content_type: None,
            message_id: None,
            persistent: true,
        }
    }

    pub fn with_header<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }

    /// Per-message TTL; a zero duration leaves the expiration unset
    pub fn with_expiration(mut self, ttl: Duration) -> Self {
        self.expiration = (!ttl.is_zero()).then_some(ttl);
        self
    }

    pub fn with_content_type<S: Into<String>>(mut self, content_type: S) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_message_id<S: Into<String>>(mut self, message_id: S) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn transient(mut self) -> Self {
        self.persistent = false;
        self
    }

    /// Expiration in the wire form: milliseconds as a decimal string
    pub fn expiration_millis(&self) -> Option<String> {
        self.expiration.map(|ttl| ttl.as_millis().to_string())
    }

    /// Reject requests the broker would refuse, before anything is sent
    pub fn validate(&self) -> Result<(), BrokerError> {
        validate_exchange_name(&self.exchange)?;
        validate_short_string("routing key", &self.routing_key)?;
        if self.exchange.is_empty() && self.routing_key.is_empty() {
            return Err(BrokerError::invalid_request(
                "routing key must name a queue when publishing to the default exchange",
            ));
        }
        if let Some(content_type) = &self.content_type {
            validate_short_string("content type", content_type)?;
        }
        if let Some(message_id) = &self.message_id {
            validate_short_string("message id", message_id)?;
        }
        for key in self.headers.keys() {
            if key.is_empty() {
                return Err(BrokerError::invalid_request("header names must not be empty"));
            }
            validate_short_string("header name", key)?;
        }
        Ok(())
    }
}

/// Record of a message whose processing failed permanently
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEnvelope {
    pub original_topic: String,
    #[serde(default)]
    pub original_exchange: String,
    #[serde(rename = "error")]
    pub error_text: String,
    #[serde(rename = "attempt")]
    pub attempt_count: u32,
    #[serde(rename = "timestamp")]
    pub timestamp_utc: DateTime<Utc>,
    #[serde(rename = "data_base64")]
    pub body_base64: String,
}

impl DeadLetterEnvelope {
    pub fn from_delivery(delivery: &Delivery, error_text: String, attempt_count: u32) -> Self {
        Self {
            original_topic: delivery.routing_key.clone(),
            original_exchange: delivery.exchange.clone(),
            error_text,
            attempt_count,
            timestamp_utc: Utc::now(),
            body_base64: BASE64.encode(&delivery.body),
        }
    }

    pub fn decode_body(&self) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64.decode(&self.body_base64)
    }

    /// Serialise as JSON, or as the minimal fallback payload if that fails
    pub fn encode(&self, raw_body: &[u8]) -> (Vec<u8>, bool) {
        match serde_json::to_vec(self) {
            Ok(payload) => (payload, true),
            Err(err) => (
                fallback_payload(&self.error_text, raw_body, &err.to_string()),
                false,
            ),
        }
    }
}

/// Payload written when the envelope itself cannot be serialised
pub fn fallback_payload(error_text: &str, raw_body: &[u8], encode_error: &str) -> Vec<u8> {
    serde_json::json!({
        "status": "marshal_error",
        "raw_data": String::from_utf8_lossy(raw_body),
        "error": error_text,
        "encode_error": encode_error,
    })
    .to_string()
    .into_bytes()
}
