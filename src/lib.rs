//! Resilient AMQP client
//!
//! A connection-supervising AMQP 0-9-1 client that keeps a single broker
//! connection alive across failures and layers bounded retries, a
//! worker-pool consumer and a dead-letter sink on top of it.
//!
//! # Overview
//!
//! - [`ConnectionSupervisor`] owns the connection and reconnects with backoff
//! - [`Publisher`] retries transient publish failures with the same message id
//! - [`ConsumerPool`] fans deliveries out to a fixed set of workers
//! - [`RetryExecutor`] is the shared retry loop behind both
//! - [`DeadLetterSink`] records deliveries whose retries were exhausted
//!
//! # Quick Start
//!
//! ```rust
//! use resilient_amqp::protocol::{DeadLetterEnvelope, Delivery, PublishRequest};
//! use std::time::Duration;
//!
//! let request = PublishRequest::new("events", "orders.created", r#"{"id":42}"#)
//!     .with_header("tenant", "acme")
//!     .with_expiration(Duration::from_secs(60));
//! assert!(request.validate().is_ok());
//!
//! let delivery = Delivery::new("orders.created", &b"not json"[..]);
//! let envelope = DeadLetterEnvelope::from_delivery(&delivery, "handler failed".to_string(), 3);
//! assert_eq!(envelope.attempt_count, 3);
//! ```

pub mod config;
pub mod consumer;
pub mod dead_letter;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod publisher;
pub mod retry;
pub mod supervisor;
pub mod testing;
pub mod transport;

pub use config::{ClientConfig, ConfigError};
pub use consumer::{
    handler_fn, ConsumeError, ConsumerConfig, ConsumerPool, ExhaustedAction, Handler,
    HandlerError,
};
pub use dead_letter::{DeadLetterDestination, DeadLetterSink};
pub use error::{BrokerError, Classify, ErrorClass};
pub use protocol::*;
pub use publisher::{PublishError, Publisher};
pub use retry::{ReconnectPolicy, RetryError, RetryExecutor, RetryPolicy};
pub use supervisor::{ConnectionState, ConnectionSupervisor, Session};
pub use transport::amqp::AmqpConnector;
pub use transport::BrokerEndpoint;
