//! Test helpers and utilities for integration tests

use resilient_amqp::retry::{ReconnectPolicy, RetryPolicy};
use resilient_amqp::supervisor::ConnectionSupervisor;
use resilient_amqp::testing::MockBroker;
use resilient_amqp::transport::BrokerEndpoint;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Endpoint used with the in-memory broker; never dialed for real
#[allow(dead_code)]
pub fn test_endpoint() -> BrokerEndpoint {
    BrokerEndpoint::new("amqp://localhost:5672/%2f").unwrap()
}

/// Reconnect backoff short enough that tests never wait on it
#[allow(dead_code)]
pub fn fast_reconnect() -> ReconnectPolicy {
    ReconnectPolicy::new(
        Duration::from_millis(1),
        Duration::from_millis(10),
        2.0,
        false,
    )
    .unwrap()
}

#[allow(dead_code)]
pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::builder()
        .max_attempts(max_attempts)
        .base_delay(Duration::from_millis(1))
        .max_delay(Duration::from_millis(5))
        .jitter(false)
        .build()
        .unwrap()
}

/// Supervisor connected to `broker`
#[allow(dead_code)]
pub async fn connected_supervisor(broker: &MockBroker) -> ConnectionSupervisor {
    ConnectionSupervisor::connect(
        test_endpoint(),
        Arc::new(broker.connector()),
        fast_reconnect(),
        Duration::from_secs(5),
    )
    .await
    .expect("mock broker accepts connections")
}

/// Poll `condition` until it holds or `timeout` elapses
#[allow(dead_code)]
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(5)).await;
    }
}
