//! Pure translation between crate types and `lapin` types

use crate::error::BrokerError;
use crate::protocol::{Delivery, ExchangeKind as KindSpec, PublishRequest};
use crate::transport::BrokerEndpoint;
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, ConnectionProperties, ExchangeKind};
use std::collections::BTreeMap;
use url::Url;

/// Persistent delivery mode
const PERSISTENT: u8 = 2;

/// Build the dial URI: validates the scheme and carries heartbeat and connect
/// timeout as the query parameters lapin understands. Parameters already
/// present in the URL win.
pub fn connection_uri(endpoint: &BrokerEndpoint) -> Result<String, BrokerError> {
    let mut url = Url::parse(endpoint.url()).map_err(|e| {
        BrokerError::invalid_request(format!("invalid broker URL {}: {e}", endpoint.display_url()))
    })?;

    if !matches!(url.scheme(), "amqp" | "amqps") {
        return Err(BrokerError::invalid_request(format!(
            "unsupported broker URL scheme '{}', expected amqp or amqps",
            url.scheme()
        )));
    }
    if url.host_str().is_none() {
        return Err(BrokerError::invalid_request(format!(
            "broker URL {} has no host",
            endpoint.display_url()
        )));
    }

    let has_param = |name: &str| url.query_pairs().any(|(key, _)| key == name);
    let add_heartbeat = !has_param("heartbeat");
    let add_timeout = !has_param("connection_timeout");

    if add_heartbeat || add_timeout {
        let mut pairs = url.query_pairs_mut();
        if add_heartbeat {
            pairs.append_pair("heartbeat", &endpoint.heartbeat.as_secs().to_string());
        }
        if add_timeout {
            pairs.append_pair(
                "connection_timeout",
                &endpoint.connect_timeout.as_millis().to_string(),
            );
        }
    }

    Ok(url.to_string())
}

pub fn connection_properties(endpoint: &BrokerEndpoint) -> ConnectionProperties {
    let properties = ConnectionProperties::default();
    match &endpoint.connection_name {
        Some(name) => properties.with_connection_name(LongString::from(name.clone())),
        None => properties,
    }
}

pub fn publish_properties(request: &PublishRequest) -> BasicProperties {
    let mut properties = BasicProperties::default();

    if let Some(content_type) = &request.content_type {
        properties = properties.with_content_type(ShortString::from(content_type.clone()));
    }
    if let Some(expiration) = request.expiration_millis() {
        properties = properties.with_expiration(ShortString::from(expiration));
    }
    if let Some(message_id) = &request.message_id {
        properties = properties.with_message_id(ShortString::from(message_id.clone()));
    }
    if !request.headers.is_empty() {
        properties = properties.with_headers(field_table(&request.headers));
    }
    if request.persistent {
        properties = properties.with_delivery_mode(PERSISTENT);
    }

    properties
}

pub fn field_table(values: &BTreeMap<String, String>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in values {
        table.insert(
            ShortString::from(key.clone()),
            AMQPValue::LongString(LongString::from(value.clone())),
        );
    }
    table
}

/// Flatten header values to strings; nested tables and arrays are skipped
pub fn header_map(table: &FieldTable) -> BTreeMap<String, String> {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| header_value(value).map(|v| (key.as_str().to_string(), v)))
        .collect()
}

fn header_value(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::ShortString(s) => Some(s.as_str().to_string()),
        AMQPValue::Boolean(b) => Some(b.to_string()),
        AMQPValue::ShortShortInt(n) => Some(n.to_string()),
        AMQPValue::ShortShortUInt(n) => Some(n.to_string()),
        AMQPValue::ShortInt(n) => Some(n.to_string()),
        AMQPValue::ShortUInt(n) => Some(n.to_string()),
        AMQPValue::LongInt(n) => Some(n.to_string()),
        AMQPValue::LongUInt(n) => Some(n.to_string()),
        AMQPValue::LongLongInt(n) => Some(n.to_string()),
        AMQPValue::Timestamp(n) => Some(n.to_string()),
        AMQPValue::Float(n) => Some(n.to_string()),
        AMQPValue::Double(n) => Some(n.to_string()),
        _ => None,
    }
}

pub fn delivery_from_lapin(delivery: &lapin::message::Delivery) -> Delivery {
    let properties = &delivery.properties;
    Delivery {
        body: delivery.data.clone().into(),
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        delivery_tag: delivery.delivery_tag,
        redelivered: delivery.redelivered,
        headers: properties.headers().as_ref().map(header_map).unwrap_or_default(),
        content_type: properties
            .content_type()
            .as_ref()
            .map(|s| s.as_str().to_string()),
        message_id: properties
            .message_id()
            .as_ref()
            .map(|s| s.as_str().to_string()),
    }
}

pub fn exchange_kind(kind: &KindSpec) -> ExchangeKind {
    match kind {
        KindSpec::Direct => ExchangeKind::Direct,
        KindSpec::Fanout => ExchangeKind::Fanout,
        KindSpec::Topic => ExchangeKind::Topic,
        KindSpec::Headers => ExchangeKind::Headers,
    }
}

/// Map a lapin error onto the crate's classified error
pub fn map_lapin_error(err: lapin::Error) -> BrokerError {
    match err {
        lapin::Error::ProtocolError(amqp) => BrokerError::Protocol {
            code: amqp.get_id(),
            message: amqp.get_message().as_str().to_string(),
        },
        lapin::Error::IOError(io) => BrokerError::ConnectionLost(io.to_string()),
        lapin::Error::MissingHeartbeatError => {
            BrokerError::connection_lost("missed broker heartbeats")
        }
        e @ (lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_)) => {
            BrokerError::ConnectionLost(e.to_string())
        }
        other => BrokerError::Transport(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn endpoint(url: &str) -> BrokerEndpoint {
        BrokerEndpoint::new(url)
            .unwrap()
            .with_heartbeat(Duration::from_secs(15))
            .with_connect_timeout(Duration::from_secs(3))
    }

    #[test]
    fn test_connection_uri_adds_heartbeat_and_timeout() {
        let uri = connection_uri(&endpoint("amqp://localhost:5672/%2f")).unwrap();
        assert!(uri.contains("heartbeat=15"));
        assert!(uri.contains("connection_timeout=3000"));
    }

    #[test]
    fn test_connection_uri_keeps_explicit_params() {
        let uri = connection_uri(&endpoint("amqps://rabbit/%2f?heartbeat=60")).unwrap();
        assert!(uri.contains("heartbeat=60"));
        assert!(!uri.contains("heartbeat=15"));
        assert!(uri.contains("connection_timeout=3000"));
    }

    #[test]
    fn test_connection_uri_rejects_other_schemes() {
        assert!(connection_uri(&endpoint("mqtt://localhost:1883")).is_err());
        assert!(connection_uri(&endpoint("not a url")).is_err());
    }

    #[test]
    fn test_publish_properties() {
        let request = PublishRequest::new("events", "orders", "x")
            .with_content_type("application/json")
            .with_expiration(Duration::from_millis(1500))
            .with_header("tenant", "acme");
        let properties = publish_properties(&request);

        assert_eq!(
            properties.content_type().as_ref().map(|s| s.as_str()),
            Some("application/json")
        );
        assert_eq!(
            properties.expiration().as_ref().map(|s| s.as_str()),
            Some("1500")
        );
        assert_eq!(*properties.delivery_mode(), Some(PERSISTENT));

        let headers = header_map(properties.headers().as_ref().unwrap());
        assert_eq!(headers.get("tenant").map(String::as_str), Some("acme"));
    }

    #[test]
    fn test_header_map_flattens_scalars() {
        let mut table = FieldTable::default();
        table.insert("x-delivery-count".into(), AMQPValue::LongLongInt(3));
        table.insert("flag".into(), AMQPValue::Boolean(true));
        table.insert("nested".into(), AMQPValue::FieldTable(FieldTable::default()));

        let headers = header_map(&table);
        assert_eq!(headers.get("x-delivery-count").map(String::as_str), Some("3"));
        assert_eq!(headers.get("flag").map(String::as_str), Some("true"));
        assert!(!headers.contains_key("nested"));
    }
}
