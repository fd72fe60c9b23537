//! Retrying publisher
//!
//! Every publish call runs under the publish [`RetryPolicy`]. Each attempt
//! leases its own session from the supervisor and releases it before the
//! next attempt, so a connection swap between attempts is picked up.

use crate::error::BrokerError;
use crate::observability::metrics::metrics;
use crate::protocol::PublishRequest;
use crate::retry::{RetryError, RetryExecutor, RetryPolicy};
use crate::supervisor::ConnectionSupervisor;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, Instrument};
use uuid::Uuid;

/// Terminal error of [`Publisher::publish`]
pub type PublishError = RetryError<BrokerError>;

/// Publishes messages through a [`ConnectionSupervisor`] with bounded retries.
///
/// Cheap to clone and safe to share between tasks.
#[derive(Clone)]
pub struct Publisher {
    supervisor: ConnectionSupervisor,
    executor: RetryExecutor,
    default_content_type: Option<String>,
}

impl Publisher {
    pub fn new(supervisor: ConnectionSupervisor, policy: RetryPolicy) -> Self {
        Self {
            supervisor,
            executor: RetryExecutor::new(policy).with_operation("publish"),
            default_content_type: None,
        }
    }

    /// Content type applied to requests that do not set one
    pub fn with_content_type<S: Into<String>>(mut self, content_type: S) -> Self {
        self.default_content_type = Some(content_type.into());
        self
    }

    pub fn supervisor(&self) -> &ConnectionSupervisor {
        &self.supervisor
    }

    pub fn policy(&self) -> &RetryPolicy {
        self.executor.policy()
    }

    /// Publish `request`, retrying transient failures.
    ///
    /// A malformed request fails with `Aborted { attempt: 0 }` and nothing is
    /// sent. Cancellation and supervisor shutdown are observed even while an
    /// attempt is in flight. One message id is assigned per call, so every
    /// retry of the same message carries the same id.
    pub async fn publish(
        &self,
        cancel: &CancellationToken,
        request: PublishRequest,
    ) -> Result<(), PublishError> {
        if let Err(e) = request.validate() {
            metrics().record_publish_failure();
            return Err(RetryError::Aborted {
                attempt: 0,
                source: e,
            });
        }
        let request = self.prepare(request);

        let span = crate::publish_span!(
            exchange = %request.exchange,
            routing_key = %request.routing_key,
            message_id = request.message_id.as_deref().unwrap_or_default()
        );
        let result = self.publish_prepared(cancel, &request).instrument(span).await;

        match &result {
            Ok(()) => metrics().record_published(),
            Err(e) => {
                metrics().record_publish_failure();
                if e.is_cancelled() {
                    debug!(
                        exchange = %request.exchange,
                        routing_key = %request.routing_key,
                        attempts = e.attempts(),
                        "publish cancelled"
                    );
                } else {
                    error!(
                        exchange = %request.exchange,
                        routing_key = %request.routing_key,
                        message_id = request.message_id.as_deref().unwrap_or_default(),
                        error = %e,
                        "publish failed"
                    );
                }
            }
        }
        result
    }

    fn prepare(&self, mut request: PublishRequest) -> PublishRequest {
        if request.content_type.is_none() {
            request.content_type = self.default_content_type.clone();
        }
        if request.message_id.is_none() {
            request.message_id = Some(Uuid::new_v4().to_string());
        }
        request
    }

    async fn publish_prepared(
        &self,
        cancel: &CancellationToken,
        request: &PublishRequest,
    ) -> Result<(), PublishError> {
        let shutdown = self.supervisor.shutdown_token();
        let attempts = AtomicU32::new(0);

        let send = self.executor.execute(cancel, |attempt| {
            attempts.store(attempt, Ordering::SeqCst);
            self.send_once(request, attempt)
        });

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RetryError::Cancelled {
                attempts: attempts.load(Ordering::SeqCst),
            }),
            _ = shutdown.cancelled() => Err(RetryError::Aborted {
                attempt: attempts.load(Ordering::SeqCst),
                source: BrokerError::Closed,
            }),
            result = send => result,
        }
    }

    async fn send_once(&self, request: &PublishRequest, attempt: u32) -> Result<(), BrokerError> {
        let mut session = self.supervisor.acquire_session().await?;
        let generation = session.generation();
        let result = session.publish(request).await;
        session.release().await;

        if result.is_ok() {
            debug!(attempt, generation, "message published");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::ReconnectPolicy;
    use crate::testing::mocks::MockBroker;
    use crate::transport::BrokerEndpoint;
    use std::sync::Arc;
    use std::time::Duration;

    async fn connected_publisher(broker: &MockBroker) -> Publisher {
        let supervisor = ConnectionSupervisor::connect(
            BrokerEndpoint::new("amqp://localhost:5672/%2f").unwrap(),
            Arc::new(broker.connector()),
            ReconnectPolicy::default(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        Publisher::new(supervisor, RetryPolicy::default())
    }

    #[tokio::test]
    async fn test_publish_assigns_message_id_and_content_type() {
        let broker = MockBroker::new();
        let publisher = connected_publisher(&broker)
            .await
            .with_content_type("application/json");
        let cancel = CancellationToken::new();

        publisher
            .publish(&cancel, PublishRequest::new("events", "orders.created", "{}"))
            .await
            .unwrap();

        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert!(published[0].message_id.is_some());
        assert_eq!(published[0].content_type.as_deref(), Some("application/json"));
        publisher.supervisor().shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_request_is_not_sent() {
        let broker = MockBroker::new();
        let publisher = connected_publisher(&broker).await;
        let cancel = CancellationToken::new();

        let result = publisher
            .publish(&cancel, PublishRequest::new("", "", "orphan"))
            .await;

        assert!(matches!(
            result,
            Err(RetryError::Aborted {
                attempt: 0,
                source: BrokerError::InvalidRequest(_)
            })
        ));
        assert!(broker.published().is_empty());
        publisher.supervisor().shutdown().await;
    }

    #[tokio::test]
    async fn test_retries_share_one_message_id() {
        let broker = MockBroker::new();
        broker.fail_publishes(2);
        let publisher = connected_publisher(&broker).await;
        let cancel = CancellationToken::new();

        publisher
            .publish(&cancel, PublishRequest::new("events", "orders.created", "{}"))
            .await
            .unwrap();

        let attempts = broker.publish_attempts();
        assert_eq!(attempts.len(), 3);
        assert!(attempts
            .iter()
            .all(|request| request.message_id == attempts[0].message_id));
        publisher.supervisor().shutdown().await;
    }

    #[tokio::test]
    async fn test_publish_after_shutdown_is_aborted() {
        let broker = MockBroker::new();
        let publisher = connected_publisher(&broker).await;
        publisher.supervisor().shutdown().await;

        let result = publisher
            .publish(
                &CancellationToken::new(),
                PublishRequest::new("events", "orders.created", "{}"),
            )
            .await;

        assert!(matches!(
            result,
            Err(RetryError::Aborted {
                source: BrokerError::Closed,
                ..
            })
        ));
    }
}
