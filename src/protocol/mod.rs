//! Broker-facing data types
//!
//! Message shapes for publishing, consuming and dead-lettering, and the
//! declarative topology types used to provision exchanges and queues.

pub mod messages;
pub mod topology;

pub use messages::*;
pub use topology::*;
