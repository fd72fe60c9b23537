//! Bounded retry loop with cancellable backoff sleeps

use super::policy::RetryPolicy;
use crate::error::Classify;
use crate::observability::metrics::metrics;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Terminal outcome of a retried operation that did not succeed
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Every attempt failed with a retryable error
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    /// An attempt failed with an error that is not worth retrying
    #[error("non-retryable failure on attempt {attempt}: {source}")]
    Aborted { attempt: u32, source: E },

    /// The caller cancelled before the operation succeeded
    #[error("cancelled after {attempts} attempts")]
    Cancelled { attempts: u32 },
}

impl<E> RetryError<E> {
    /// Number of times the operation was invoked
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } => *attempts,
            RetryError::Aborted { attempt, .. } => *attempt,
            RetryError::Cancelled { attempts } => *attempts,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled { .. })
    }

    /// The last operation error, if the operation ran and failed
    pub fn last_error(&self) -> Option<&E> {
        match self {
            RetryError::Exhausted { last, .. } => Some(last),
            RetryError::Aborted { source, .. } => Some(source),
            RetryError::Cancelled { .. } => None,
        }
    }
}

/// Runs an operation under a [`RetryPolicy`]
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    operation: &'static str,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            operation: "operation",
        }
    }

    /// Name used in retry log lines
    pub fn with_operation(mut self, operation: &'static str) -> Self {
        self.operation = operation;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Invoke `operation` until it succeeds, fails fatally, runs out of
    /// attempts, or `cancel` fires.
    ///
    /// The closure receives the 1-based attempt number. Cancellation is
    /// observed before each attempt and during every backoff sleep; an attempt
    /// that is already running is allowed to finish.
    pub async fn execute<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + fmt::Display,
    {
        let max_attempts = self.policy.max_attempts();
        let mut backoff = self.policy.backoff();
        let mut attempt = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled { attempts: attempt });
            }
            attempt += 1;

            let error = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !error.is_retryable() {
                debug!(
                    operation = self.operation,
                    attempt,
                    error = %error,
                    "non-retryable failure"
                );
                return Err(RetryError::Aborted {
                    attempt,
                    source: error,
                });
            }
            if attempt >= max_attempts {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: error,
                });
            }

            let delay = backoff.next_delay();
            metrics().record_retry();
            warn!(
                operation = self.operation,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "attempt failed, retrying"
            );

            if !interruptible_sleep(cancel, delay).await {
                return Err(RetryError::Cancelled { attempts: attempt });
            }
        }
    }
}

/// Sleep for `delay` unless `cancel` fires first.
/// Returns true if the sleep completed, false if cancelled.
pub async fn interruptible_sleep(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
