//! Configuration loading and validation tests
//!
//! Tests focus on BEHAVIOR of configuration loading, validation, and error handling.

use resilient_amqp::config::{ClientConfig, ConfigError};
use resilient_amqp::consumer::ExhaustedAction;
use resilient_amqp::protocol::ExchangeKind;
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    write!(temp_file, "{content}").unwrap();
    temp_file
}

#[test]
fn test_full_config_loads_from_file() {
    let temp_file = write_config(
        r#"
[broker]
url = "amqp://rabbit.internal:5672/orders"
connection_name = "billing-worker"
heartbeat_secs = 20
default_content_type = "application/json"

[reconnect]
base_delay_ms = 250
max_delay_ms = 10000
multiplier = 1.5

[publish_retry]
max_attempts = 5
base_delay_ms = 20
max_delay_ms = 500
jitter = false

[consumer]
queue = "orders"
workers = 8
prefetch_count = 16
exhausted_action = "ack"
max_redeliveries = 3

[dead_letter]
exchange = "dlx"
routing_key = "orders.dead"

[[topology.exchanges]]
name = "events"
kind = "topic"

[[topology.queues]]
name = "orders"
bindings = [{ exchange = "events", routing_key = "orders.created" }]
"#,
    );

    let config = ClientConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.broker.connection_name.as_deref(), Some("billing-worker"));
    assert_eq!(config.reconnect.base_delay(), Duration::from_millis(250));
    assert_eq!(config.publish_retry.max_attempts(), 5);
    assert!(!config.publish_retry.jitter());
    assert_eq!(config.consume_retry.max_attempts(), 3);

    let consumer = config.consumer.as_ref().unwrap();
    assert_eq!(consumer.workers, 8);
    assert_eq!(consumer.prefetch_count, 16);
    assert_eq!(consumer.exhausted_action, ExhaustedAction::Ack);
    assert_eq!(consumer.max_redeliveries, Some(3));

    let dead_letter = config.dead_letter.as_ref().unwrap();
    assert_eq!(dead_letter.exchange, "dlx");
    assert_eq!(dead_letter.content_type, "application/json");

    assert_eq!(config.topology.exchanges[0].kind, ExchangeKind::Topic);
    assert_eq!(config.topology.queues[0].bindings.len(), 1);

    let endpoint = config.endpoint().unwrap();
    assert_eq!(endpoint.heartbeat, Duration::from_secs(20));
}

#[test]
fn test_missing_file_is_read_error() {
    let result = ClientConfig::load_from_file(Path::new("/nonexistent/ramqp.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_malformed_toml_is_parse_error() {
    let temp_file = write_config("[broker\nurl = ");
    let result = ClientConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_missing_broker_section_is_rejected() {
    let temp_file = write_config(
        r#"
[consumer]
queue = "orders"
"#,
    );
    assert!(matches!(
        ClientConfig::load_from_file(temp_file.path()),
        Err(ConfigError::TomlParse(_))
    ));
}

#[test]
fn test_zero_workers_is_invalid() {
    let temp_file = write_config(
        r#"
[broker]
url = "amqp://localhost"

[consumer]
queue = "orders"
workers = 0
"#,
    );
    assert!(matches!(
        ClientConfig::load_from_file(temp_file.path()),
        Err(ConfigError::InvalidConfig(_))
    ));
}

#[test]
fn test_dead_letter_needs_routing_key() {
    let temp_file = write_config(
        r#"
[broker]
url = "amqp://localhost"

[dead_letter]
exchange = "dlx"
routing_key = ""
"#,
    );
    assert!(matches!(
        ClientConfig::load_from_file(temp_file.path()),
        Err(ConfigError::InvalidConfig(_))
    ));
}

#[test]
fn test_reconnect_policy_validated_while_parsing() {
    let temp_file = write_config(
        r#"
[broker]
url = "amqp://localhost"

[reconnect]
base_delay_ms = 5000
max_delay_ms = 100
"#,
    );
    assert!(matches!(
        ClientConfig::load_from_file(temp_file.path()),
        Err(ConfigError::TomlParse(_))
    ));
}

#[test]
fn test_credentials_come_from_environment() {
    std::env::set_var("RAMQP_TEST_CONFIG_USER", "billing");
    std::env::set_var("RAMQP_TEST_CONFIG_PASS", "hunter2");
    let temp_file = write_config(
        r#"
[broker]
url = "amqp://localhost:5672/%2f"
username_env = "RAMQP_TEST_CONFIG_USER"
password_env = "RAMQP_TEST_CONFIG_PASS"
"#,
    );

    let config = ClientConfig::load_from_file(temp_file.path()).unwrap();
    let endpoint = config.endpoint().unwrap();

    assert!(endpoint.url().contains("billing:hunter2@"));
    assert!(!endpoint.display_url().contains("hunter2"));
}

#[test]
fn test_config_round_trips_through_toml() {
    let temp_file = write_config(
        r#"
[broker]
url = "amqp://localhost"

[consumer]
queue = "orders"
workers = 2
"#,
    );
    let config = ClientConfig::load_from_file(temp_file.path()).unwrap();

    let rendered = toml::to_string_pretty(&config).unwrap();
    let reparsed = ClientConfig::parse(&rendered).unwrap();
    assert_eq!(reparsed, config);
}
