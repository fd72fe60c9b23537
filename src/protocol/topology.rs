//! Exchange, queue and binding declarations plus AMQP name rules

use crate::error::BrokerError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// AMQP short strings are limited to 255 bytes
pub const MAX_SHORT_STRING: usize = 255;

/// Exchange type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeSpec {
    pub name: String,
    #[serde(default)]
    pub kind: ExchangeKind,
    #[serde(default = "default_true")]
    pub durable: bool,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub internal: bool,
    #[serde(default)]
    pub arguments: BTreeMap<String, String>,
}

impl ExchangeSpec {
    pub fn new<S: Into<String>>(name: S, kind: ExchangeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            durable: true,
            auto_delete: false,
            internal: false,
            arguments: BTreeMap::new(),
        }
    }

    pub fn validate(&self) -> Result<(), BrokerError> {
        if self.name.is_empty() {
            return Err(BrokerError::invalid_request(
                "the default exchange cannot be declared",
            ));
        }
        validate_exchange_name(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindingSpec {
    pub exchange: String,
    #[serde(default)]
    pub routing_key: String,
    #[serde(default)]
    pub arguments: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSpec {
    pub name: String,
    #[serde(default = "default_true")]
    pub durable: bool,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub arguments: BTreeMap<String, String>,
    #[serde(default)]
    pub bindings: Vec<BindingSpec>,
}

impl QueueSpec {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            durable: true,
            exclusive: false,
            auto_delete: false,
            arguments: BTreeMap::new(),
            bindings: Vec::new(),
        }
    }

    /// Bind the queue to `exchange` with `routing_key` after declaring it
    pub fn bind<E: Into<String>, K: Into<String>>(mut self, exchange: E, routing_key: K) -> Self {
        self.bindings.push(BindingSpec {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            arguments: BTreeMap::new(),
        });
        self
    }

    pub fn validate(&self) -> Result<(), BrokerError> {
        if self.name.is_empty() {
            return Err(BrokerError::invalid_request("queue name must not be empty"));
        }
        validate_short_string("queue name", &self.name)?;
        for binding in &self.bindings {
            validate_exchange_name(&binding.exchange)?;
            validate_short_string("routing key", &binding.routing_key)?;
        }
        Ok(())
    }
}

/// A set of declarations applied together: exchanges first, then queues
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    #[serde(default)]
    pub exchanges: Vec<ExchangeSpec>,
    #[serde(default)]
    pub queues: Vec<QueueSpec>,
}

impl Topology {
    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty() && self.queues.is_empty()
    }

    pub fn validate(&self) -> Result<(), BrokerError> {
        for exchange in &self.exchanges {
            exchange.validate()?;
        }
        for queue in &self.queues {
            queue.validate()?;
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

pub(crate) fn validate_short_string(what: &str, value: &str) -> Result<(), BrokerError> {
    if value.len() > MAX_SHORT_STRING {
        return Err(BrokerError::invalid_request(format!(
            "{what} is {} bytes, limit is {MAX_SHORT_STRING}",
            value.len()
        )));
    }
    Ok(())
}

/// Exchange names are limited to letters, digits, `-`, `_`, `.` and `:`
pub fn validate_exchange_name(name: &str) -> Result<(), BrokerError> {
    validate_short_string("exchange name", name)?;
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'));
    if !valid_chars {
        return Err(BrokerError::invalid_request(format!(
            "exchange name '{name}' must match [a-zA-Z0-9-_.:]*"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_name_rules() {
        assert!(validate_exchange_name("").is_ok());
        assert!(validate_exchange_name("orders.events:v1").is_ok());
        assert!(validate_exchange_name("orders events").is_err());
        assert!(validate_exchange_name(&"x".repeat(256)).is_err());
    }

    #[test]
    fn test_default_exchange_cannot_be_declared() {
        let exchange = ExchangeSpec::new("", ExchangeKind::Direct);
        assert!(exchange.validate().is_err());
    }

    #[test]
    fn test_queue_spec_with_bindings() {
        let queue = QueueSpec::new("orders").bind("events", "orders.created");

        assert!(queue.validate().is_ok());
        assert_eq!(queue.bindings.len(), 1);
        assert_eq!(queue.bindings[0].routing_key, "orders.created");
        assert!(queue.durable);
    }

    #[test]
    fn test_exchange_kind_parses_lowercase() {
        let exchange: ExchangeSpec = toml::from_str(
            r#"
name = "events"
kind = "topic"
"#,
        )
        .unwrap();
        assert_eq!(exchange.kind, ExchangeKind::Topic);
        assert!(exchange.durable);
        assert!(!exchange.auto_delete);
    }

    #[test]
    fn test_topology_validates_every_declaration() {
        let topology = Topology {
            exchanges: vec![ExchangeSpec::new("events", ExchangeKind::Topic)],
            queues: vec![QueueSpec::new("orders").bind("bad name", "orders.#")],
        };
        assert!(!topology.is_empty());
        assert!(topology.validate().is_err());
        assert!(Topology::default().is_empty());
    }
}
