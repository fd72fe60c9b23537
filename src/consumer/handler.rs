//! Message handler contract

use crate::error::{Classify, ErrorClass};
use crate::protocol::Delivery;
use async_trait::async_trait;
use std::future::Future;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failure reported by a [`Handler`]
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Worth retrying: a downstream dependency was unavailable, a timeout hit
    #[error("transient handler failure: {0}")]
    Transient(BoxError),

    /// Retrying cannot help: the message is malformed or rejected by the handler
    #[error("permanent handler failure: {0}")]
    Permanent(BoxError),
}

impl HandlerError {
    pub fn transient<E: Into<BoxError>>(error: E) -> Self {
        HandlerError::Transient(error.into())
    }

    pub fn permanent<E: Into<BoxError>>(error: E) -> Self {
        HandlerError::Permanent(error.into())
    }
}

impl Classify for HandlerError {
    fn class(&self) -> ErrorClass {
        match self {
            HandlerError::Transient(_) => ErrorClass::Retryable,
            HandlerError::Permanent(_) => ErrorClass::Fatal,
        }
    }
}

/// Processes one delivery.
///
/// Called once per attempt; a delivery that keeps failing transiently is
/// handed to the same handler again after a backoff sleep. `cancel` fires when
/// the consumer pool is shutting down.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(
        &self,
        cancel: &CancellationToken,
        delivery: &Delivery,
    ) -> Result<(), HandlerError>;
}

/// Adapter that turns an async closure into a [`Handler`]
pub struct HandlerFn<F> {
    f: F,
}

/// Wrap `f` as a [`Handler`]; the closure receives owned copies of the
/// cancellation token and delivery.
///
/// # Examples
/// ```
/// use resilient_amqp::consumer::{handler_fn, HandlerError};
///
/// let handler = handler_fn(|_cancel, delivery| async move {
///     if delivery.body.is_empty() {
///         return Err(HandlerError::permanent("empty body"));
///     }
///     Ok(())
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(CancellationToken, Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(CancellationToken, Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(
        &self,
        cancel: &CancellationToken,
        delivery: &Delivery,
    ) -> Result<(), HandlerError> {
        (self.f)(cancel.clone(), delivery.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_error_classification() {
        assert!(HandlerError::transient("downstream timeout").is_retryable());
        assert!(!HandlerError::permanent("malformed payload").is_retryable());
    }

    #[tokio::test]
    async fn test_handler_fn_receives_delivery() {
        let handler = handler_fn(|_cancel, delivery: Delivery| async move {
            if delivery.routing_key == "orders.created" {
                Ok(())
            } else {
                Err(HandlerError::permanent(format!(
                    "unexpected key {}",
                    delivery.routing_key
                )))
            }
        });
        let cancel = CancellationToken::new();

        assert!(handler
            .handle(&cancel, &Delivery::new("orders.created", "{}"))
            .await
            .is_ok());
        assert!(handler
            .handle(&cancel, &Delivery::new("orders.deleted", "{}"))
            .await
            .is_err());
    }
}
