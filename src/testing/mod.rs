//! Testing utilities
//!
//! An in-memory broker that implements the transport traits, so the
//! supervisor, publisher and consumer pool can be exercised without RabbitMQ.

pub mod mocks;

pub use mocks::{MockBroker, MockConnector};
