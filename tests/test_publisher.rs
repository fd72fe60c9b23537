//! Publisher behavior across broker failures
//!
//! Publishing retries through connection loss, stops promptly on cancellation
//! and supervisor shutdown, and gives up after the configured attempts.

mod test_helpers;

use resilient_amqp::error::BrokerError;
use resilient_amqp::protocol::PublishRequest;
use resilient_amqp::publisher::Publisher;
use resilient_amqp::retry::{RetryError, RetryPolicy};
use resilient_amqp::testing::MockBroker;
use std::time::{Duration, Instant};
use test_helpers::{connected_supervisor, fast_retry, wait_until};
use tokio_util::sync::CancellationToken;

fn slow_policy() -> RetryPolicy {
    RetryPolicy::builder()
        .max_attempts(100)
        .base_delay(Duration::from_millis(500))
        .max_delay(Duration::from_secs(5))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_publish_survives_connection_drop() {
    let broker = MockBroker::new();
    let supervisor = connected_supervisor(&broker).await;
    let publisher = Publisher::new(supervisor.clone(), fast_retry(50));

    broker.fail_next_connects(3);
    broker.drop_connections();

    publisher
        .publish(
            &CancellationToken::new(),
            PublishRequest::new("", "orders", "after the drop"),
        )
        .await
        .unwrap();

    assert_eq!(broker.published_to("orders").len(), 1);
    assert_eq!(broker.queue_depth("orders"), 1);
    assert!(supervisor.generation() >= 2);
    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_cancel_returns_promptly() {
    let broker = MockBroker::new();
    let supervisor = connected_supervisor(&broker).await;
    let publisher = Publisher::new(supervisor.clone(), slow_policy());

    broker.fail_next_connects(u32::MAX);
    broker.drop_connections();
    assert!(wait_until(Duration::from_secs(1), || !supervisor.is_healthy()).await);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let result = publisher
        .publish(&cancel, PublishRequest::new("", "orders", "never sent"))
        .await;

    assert!(matches!(result, Err(RetryError::Cancelled { .. })));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(broker.published().is_empty());
    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_aborts_in_flight_publish() {
    let broker = MockBroker::new();
    let supervisor = connected_supervisor(&broker).await;
    let publisher = Publisher::new(supervisor.clone(), slow_policy());

    broker.fail_next_connects(u32::MAX);
    broker.drop_connections();
    assert!(wait_until(Duration::from_secs(1), || !supervisor.is_healthy()).await);

    let closer = supervisor.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        closer.shutdown().await;
    });

    let started = Instant::now();
    let result = publisher
        .publish(
            &CancellationToken::new(),
            PublishRequest::new("", "orders", "never sent"),
        )
        .await;

    assert!(matches!(
        result,
        Err(RetryError::Aborted {
            source: BrokerError::Closed,
            ..
        })
    ));
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_exhausts_against_unavailable_destination() {
    let broker = MockBroker::new();
    let supervisor = connected_supervisor(&broker).await;
    let publisher = Publisher::new(supervisor.clone(), fast_retry(4));

    broker.fail_publishes_to("audit", "records");

    let result = publisher
        .publish(
            &CancellationToken::new(),
            PublishRequest::new("audit", "records", "{}"),
        )
        .await;

    match result {
        Err(RetryError::Exhausted { attempts, last }) => {
            assert_eq!(attempts, 4);
            assert!(matches!(last, BrokerError::Protocol { code: 506, .. }));
        }
        other => panic!("expected exhaustion, got {other:?}"),
    }
    assert_eq!(broker.publish_attempts().len(), 4);
    assert!(broker.published().is_empty());

    // the same destination works again once restored
    broker.restore_publishes_to("audit", "records");
    publisher
        .publish(
            &CancellationToken::new(),
            PublishRequest::new("audit", "records", "{}"),
        )
        .await
        .unwrap();
    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_publishers_share_one_connection() {
    let broker = MockBroker::new();
    let supervisor = connected_supervisor(&broker).await;
    let publisher = Publisher::new(supervisor.clone(), fast_retry(3));

    let mut tasks = Vec::new();
    for i in 0..16 {
        let publisher = publisher.clone();
        tasks.push(tokio::spawn(async move {
            publisher
                .publish(
                    &CancellationToken::new(),
                    PublishRequest::new("", "orders", format!("message {i}")),
                )
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(broker.queue_depth("orders"), 16);
    assert_eq!(broker.max_open_connections(), 1);
    assert!(wait_until(Duration::from_secs(1), || broker.open_sessions() == 0).await);
    supervisor.shutdown().await;
}
