//! TOML configuration for the client
//!
//! One file describes the broker endpoint, the three backoff policies, the
//! consumer, an optional dead-letter destination and optional topology.
//! Policies are validated while parsing; everything else by
//! [`ClientConfig::validate`]. Credentials never live in the file: they are
//! read from the environment variables it names when the endpoint is built.

use crate::consumer::ConsumerConfig;
use crate::dead_letter::DeadLetterDestination;
use crate::error::redact_credentials;
use crate::protocol::{validate_exchange_name, Topology};
use crate::retry::{ReconnectPolicy, RetryPolicy};
use crate::transport::BrokerEndpoint;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Complete client configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    pub broker: BrokerSection,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
    #[serde(default)]
    pub publish_retry: RetryPolicy,
    #[serde(default)]
    pub consume_retry: RetryPolicy,
    pub consumer: Option<ConsumerConfig>,
    pub dead_letter: Option<DeadLetterDestination>,
    #[serde(default)]
    pub topology: Topology,
}

/// Broker section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    /// `amqp://` or `amqps://` URL, without credentials
    pub url: String,
    /// Name shown in the broker's management UI
    pub connection_name: Option<String>,
    /// Environment variable containing the username
    pub username_env: Option<String>,
    /// Environment variable containing the password
    pub password_env: Option<String>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_publisher_confirms")]
    pub publisher_confirms: bool,
    /// How long `connect` waits for the first connection
    #[serde(default = "default_initial_connect_timeout_ms")]
    pub initial_connect_timeout_ms: u64,
    /// Content type for published messages that do not set one
    pub default_content_type: Option<String>,
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_heartbeat_secs() -> u64 {
    10
}

fn default_publisher_confirms() -> bool {
    true
}

fn default_initial_connect_timeout_ms() -> u64 {
    30_000
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ClientConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        parse_broker_url(&self.broker.url)?;

        if self.broker.connect_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "broker.connect_timeout_ms must be greater than zero".to_string(),
            ));
        }

        if let Some(consumer) = &self.consumer {
            consumer
                .validate()
                .map_err(|e| ConfigError::InvalidConfig(e.to_string()))?;
        }

        if let Some(dead_letter) = &self.dead_letter {
            validate_exchange_name(&dead_letter.exchange)
                .map_err(|e| ConfigError::InvalidConfig(format!("dead_letter: {e}")))?;
            if dead_letter.routing_key.is_empty() {
                return Err(ConfigError::InvalidConfig(
                    "dead_letter.routing_key must not be empty".to_string(),
                ));
            }
        }

        self.topology
            .validate()
            .map_err(|e| ConfigError::InvalidConfig(format!("topology: {e}")))?;

        Ok(())
    }

    /// Build the broker endpoint, resolving credentials from the environment
    pub fn endpoint(&self) -> Result<BrokerEndpoint, ConfigError> {
        let mut url = parse_broker_url(&self.broker.url)?;

        if let Some(username) = get_env_var_optional(self.broker.username_env.as_deref())? {
            url.set_username(&username).map_err(|_| {
                ConfigError::InvalidBrokerUrl("URL cannot carry a username".to_string())
            })?;
        }
        if let Some(password) = get_env_var_optional(self.broker.password_env.as_deref())? {
            url.set_password(Some(&password)).map_err(|_| {
                ConfigError::InvalidBrokerUrl("URL cannot carry a password".to_string())
            })?;
        }

        let mut endpoint = BrokerEndpoint::new(url.as_str())
            .map_err(|e| ConfigError::InvalidBrokerUrl(e.to_string()))?
            .with_connect_timeout(Duration::from_millis(self.broker.connect_timeout_ms))
            .with_heartbeat(Duration::from_secs(self.broker.heartbeat_secs))
            .with_publisher_confirms(self.broker.publisher_confirms);
        if let Some(name) = &self.broker.connection_name {
            endpoint = endpoint.with_connection_name(name.clone());
        }
        Ok(endpoint)
    }

    pub fn initial_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.broker.initial_connect_timeout_ms)
    }
}

/// Parse and check an AMQP URL (pure function)
fn parse_broker_url(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw)
        .map_err(|e| ConfigError::InvalidBrokerUrl(format!("{}: {e}", redact_credentials(raw))))?;

    if !matches!(url.scheme(), "amqp" | "amqps") {
        return Err(ConfigError::InvalidBrokerUrl(format!(
            "unsupported scheme '{}', expected amqp or amqps",
            url.scheme()
        )));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(ConfigError::InvalidBrokerUrl(format!(
            "{} has no host",
            redact_credentials(raw)
        )));
    }
    Ok(url)
}

/// A named variable must exist; no name means no value
fn get_env_var_optional(name: Option<&str>) -> Result<Option<String>, ConfigError> {
    match name {
        Some(name) => std::env::var(name)
            .map(Some)
            .map_err(|_| ConfigError::EnvVarNotFound(name.to_string())),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[broker]
url = "amqp://localhost:5672/%2f"
"#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = ClientConfig::parse(MINIMAL).unwrap();

        assert_eq!(config.broker.connect_timeout_ms, 10_000);
        assert_eq!(config.broker.heartbeat_secs, 10);
        assert!(config.broker.publisher_confirms);
        assert_eq!(config.publish_retry, RetryPolicy::default());
        assert_eq!(config.reconnect, ReconnectPolicy::default());
        assert!(config.consumer.is_none());
        assert!(config.dead_letter.is_none());
        assert!(config.topology.is_empty());
    }

    #[test]
    fn test_rejects_non_amqp_scheme() {
        let result = ClientConfig::parse(
            r#"
[broker]
url = "mqtt://localhost:1883"
"#,
        );
        assert!(matches!(result, Err(ConfigError::InvalidBrokerUrl(_))));
    }

    #[test]
    fn test_rejects_invalid_policy_while_parsing() {
        let result = ClientConfig::parse(
            r#"
[broker]
url = "amqp://localhost"

[publish_retry]
max_attempts = 0
"#,
        );
        assert!(matches!(result, Err(ConfigError::TomlParse(_))));
    }

    #[test]
    fn test_invalid_url_error_is_redacted() {
        let error = parse_broker_url("amqp://user:s3cret@").unwrap_err();
        assert!(!error.to_string().contains("s3cret"));
    }

    #[test]
    fn test_endpoint_carries_timeouts() {
        let config = ClientConfig::parse(
            r#"
[broker]
url = "amqps://broker.internal:5671/orders"
connection_name = "billing"
connect_timeout_ms = 2500
heartbeat_secs = 30
publisher_confirms = false
"#,
        )
        .unwrap();

        let endpoint = config.endpoint().unwrap();
        assert_eq!(endpoint.connect_timeout, Duration::from_millis(2500));
        assert_eq!(endpoint.heartbeat, Duration::from_secs(30));
        assert!(!endpoint.publisher_confirms);
        assert_eq!(endpoint.connection_name.as_deref(), Some("billing"));
    }

    #[test]
    fn test_missing_credential_variable() {
        let config = ClientConfig::parse(
            r#"
[broker]
url = "amqp://localhost"
username_env = "RAMQP_TEST_UNSET_USERNAME_VARIABLE"
"#,
        )
        .unwrap();

        assert!(matches!(
            config.endpoint(),
            Err(ConfigError::EnvVarNotFound(name)) if name == "RAMQP_TEST_UNSET_USERNAME_VARIABLE"
        ));
    }
}
