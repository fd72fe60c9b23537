//! Worker-pool consumer
//!
//! [`ConsumerPool::start`] subscribes to one queue and fans deliveries out to
//! a fixed number of worker tasks. Each delivery is handled under the consume
//! [`RetryPolicy`], then acknowledged, dead-lettered or rejected. The
//! subscription is re-established after every connection loss until the
//! caller cancels or the supervisor shuts down.
//!
//! - [`handler`] - the [`Handler`] trait and closure adapter
//! - [`worker`] - per-delivery processing and settlement rules

pub mod handler;
pub mod worker;

pub use handler::{handler_fn, BoxError, Handler, HandlerError, HandlerFn};
pub use worker::{ExhaustionDecision, Settlement};

use crate::dead_letter::DeadLetterSink;
use crate::error::{redact_credentials, BrokerError};
use crate::retry::{ReconnectPolicy, RetryExecutor, RetryPolicy};
use crate::supervisor::ConnectionSupervisor;
use crate::transport::Subscription;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};
use worker::{run_worker, WorkerContext};

/// Why [`ConsumerPool::start`] returned
#[derive(Debug, Error, PartialEq)]
pub enum ConsumeError {
    /// No connection became ready before the first subscription
    #[error("broker unavailable: not ready within {0:?}")]
    Unavailable(Duration),

    #[error("connection supervisor shut down")]
    Closed,

    #[error("consumer cancelled")]
    Cancelled,

    #[error("invalid consumer configuration: {0}")]
    InvalidConfig(String),
}

/// Settlement of a delivery whose handler failed when there is no
/// dead-letter destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExhaustedAction {
    /// Acknowledge and drop
    Ack,
    /// Negative acknowledgement without requeue
    #[default]
    Reject,
}

/// Consumer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    pub queue: String,
    #[serde(default = "default_consumer_tag")]
    pub consumer_tag: String,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Broker-side prefetch; 0 leaves QoS unset
    #[serde(default)]
    pub prefetch_count: u16,
    #[serde(default)]
    pub auto_ack: bool,
    #[serde(default)]
    pub ack_multiple: bool,
    #[serde(default)]
    pub nack_multiple: bool,
    #[serde(default)]
    pub exhausted_action: ExhaustedAction,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    /// Bound on waiting for the first connection; unbounded when unset
    #[serde(default)]
    pub ready_timeout_ms: Option<u64>,
    /// Reject instead of withholding once a delivery that cannot be
    /// dead-lettered has been redelivered this many times
    #[serde(default)]
    pub max_redeliveries: Option<u32>,
    #[serde(default)]
    pub arguments: BTreeMap<String, String>,
    /// Backoff between subscription attempts
    #[serde(default)]
    pub restart: ReconnectPolicy,
}

fn default_consumer_tag() -> String {
    "consumer".to_string()
}

fn default_workers() -> usize {
    1
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}

impl ConsumerConfig {
    pub fn new<S: Into<String>>(queue: S) -> Self {
        Self {
            queue: queue.into(),
            consumer_tag: default_consumer_tag(),
            workers: default_workers(),
            prefetch_count: 0,
            auto_ack: false,
            ack_multiple: false,
            nack_multiple: false,
            exhausted_action: ExhaustedAction::default(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            ready_timeout_ms: None,
            max_redeliveries: None,
            arguments: BTreeMap::new(),
            restart: ReconnectPolicy::default(),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_prefetch(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }

    pub fn with_consumer_tag<S: Into<String>>(mut self, consumer_tag: S) -> Self {
        self.consumer_tag = consumer_tag.into();
        self
    }

    pub fn with_auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }

    pub fn with_exhausted_action(mut self, action: ExhaustedAction) -> Self {
        self.exhausted_action = action;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace_ms = grace.as_millis() as u64;
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_max_redeliveries(mut self, max_redeliveries: u32) -> Self {
        self.max_redeliveries = Some(max_redeliveries);
        self
    }

    pub fn with_restart(mut self, restart: ReconnectPolicy) -> Self {
        self.restart = restart;
        self
    }

    /// Worker count, at least one
    pub fn worker_count(&self) -> usize {
        self.workers.max(1)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn ready_timeout(&self) -> Option<Duration> {
        self.ready_timeout_ms.map(Duration::from_millis)
    }

    pub fn subscription(&self) -> Subscription {
        Subscription {
            queue: self.queue.clone(),
            consumer_tag: self.consumer_tag.clone(),
            prefetch_count: self.prefetch_count,
            auto_ack: self.auto_ack,
            arguments: self.arguments.clone(),
        }
    }

    pub fn validate(&self) -> Result<(), BrokerError> {
        if self.queue.is_empty() {
            return Err(BrokerError::invalid_request("consumer queue must not be empty"));
        }
        if self.workers == 0 {
            return Err(BrokerError::invalid_request("consumer needs at least one worker"));
        }
        Ok(())
    }
}

/// How one consume generation ended
enum GenerationOutcome {
    Cancelled,
    Closed,
    Failed { subscribed: bool, error: BrokerError },
}

/// Consumes one queue with a pool of workers
pub struct ConsumerPool {
    supervisor: ConnectionSupervisor,
    config: ConsumerConfig,
    executor: RetryExecutor,
    dead_letter: Option<DeadLetterSink>,
}

impl ConsumerPool {
    pub fn new(supervisor: ConnectionSupervisor, config: ConsumerConfig, policy: RetryPolicy) -> Self {
        Self {
            supervisor,
            config,
            executor: RetryExecutor::new(policy).with_operation("handle"),
            dead_letter: None,
        }
    }

    /// Publish envelopes for deliveries whose handler failed
    pub fn with_dead_letter(mut self, sink: DeadLetterSink) -> Self {
        self.dead_letter = Some(sink);
        self
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Consume until `cancel` fires or the supervisor shuts down.
    ///
    /// Fails with `InvalidConfig` before touching the broker if the queue name
    /// is empty or no workers are configured. Otherwise returns `Cancelled` or
    /// `Closed` accordingly. `Unavailable` is returned
    /// only when `ready_timeout` is set and no connection became ready before
    /// the first subscription; later outages are waited out indefinitely.
    pub async fn start<H: Handler>(
        &self,
        cancel: &CancellationToken,
        handler: H,
    ) -> Result<(), ConsumeError> {
        self.config
            .validate()
            .map_err(|e| ConsumeError::InvalidConfig(e.to_string()))?;

        let handler: Arc<dyn Handler> = Arc::new(handler);
        let shutdown = self.supervisor.shutdown_token();
        let mut backoff = self.config.restart.backoff();
        let mut subscribed_once = false;

        info!(
            queue = %self.config.queue,
            workers = self.config.worker_count(),
            auto_ack = self.config.auto_ack,
            "starting consumer pool"
        );

        loop {
            if cancel.is_cancelled() {
                return Err(ConsumeError::Cancelled);
            }
            if shutdown.is_cancelled() {
                return Err(ConsumeError::Closed);
            }

            self.wait_for_connection(cancel, subscribed_once).await?;

            let error = match self.consume_once(cancel, &handler).await {
                GenerationOutcome::Cancelled => return Err(ConsumeError::Cancelled),
                GenerationOutcome::Closed => return Err(ConsumeError::Closed),
                GenerationOutcome::Failed { subscribed, error } => {
                    if subscribed {
                        subscribed_once = true;
                        backoff.reset();
                    }
                    error
                }
            };

            let delay = backoff.next_delay();
            warn!(
                queue = %self.config.queue,
                delay_ms = delay.as_millis() as u64,
                error = %redact_credentials(&error.to_string()),
                "consumer interrupted, resubscribing"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ConsumeError::Cancelled),
                _ = shutdown.cancelled() => return Err(ConsumeError::Closed),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn wait_for_connection(
        &self,
        cancel: &CancellationToken,
        subscribed_once: bool,
    ) -> Result<(), ConsumeError> {
        let ready = self.supervisor.wait_ready(cancel);
        let result = match (subscribed_once, self.config.ready_timeout()) {
            (false, Some(timeout)) => match tokio::time::timeout(timeout, ready).await {
                Ok(result) => result,
                Err(_) => return Err(ConsumeError::Unavailable(timeout)),
            },
            _ => ready.await,
        };

        match result {
            Ok(()) => Ok(()),
            Err(BrokerError::Cancelled) => Err(ConsumeError::Cancelled),
            Err(_) => Err(ConsumeError::Closed),
        }
    }

    /// Subscribe once and run workers until the subscription ends
    async fn consume_once(
        &self,
        cancel: &CancellationToken,
        handler: &Arc<dyn Handler>,
    ) -> GenerationOutcome {
        let mut session = match self.supervisor.acquire_session().await {
            Ok(session) => session,
            Err(BrokerError::Closed) => return GenerationOutcome::Closed,
            Err(error) => {
                return GenerationOutcome::Failed {
                    subscribed: false,
                    error,
                }
            }
        };
        let generation = session.generation();

        let mut stream = match session.consume(&self.config.subscription()).await {
            Ok(stream) => stream,
            Err(error) => {
                session.release().await;
                return GenerationOutcome::Failed {
                    subscribed: false,
                    error,
                };
            }
        };

        let worker_count = self.config.worker_count();
        info!(
            queue = %self.config.queue,
            consumer_tag = %self.config.consumer_tag,
            generation,
            workers = worker_count,
            "consumer subscribed"
        );

        let stop = cancel.child_token();
        let ctx = Arc::new(WorkerContext {
            executor: self.executor.clone(),
            dead_letter: self.dead_letter.clone(),
            handler: handler.clone(),
            cancel: cancel.clone(),
            stop: stop.clone(),
            auto_ack: self.config.auto_ack,
            ack_multiple: self.config.ack_multiple,
            nack_multiple: self.config.nack_multiple,
            exhausted_action: self.config.exhausted_action,
            max_redeliveries: self.config.max_redeliveries,
        });

        let (tx, rx) = mpsc::channel(worker_count);
        let rx = Arc::new(Mutex::new(rx));
        let mut workers = JoinSet::new();
        for worker_id in 0..worker_count {
            let span = tracing::info_span!("consumer_worker", generation, worker_id);
            workers.spawn(run_worker(worker_id, ctx.clone(), rx.clone()).instrument(span));
        }

        let shutdown = self.supervisor.shutdown_token();
        let outcome = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break GenerationOutcome::Cancelled,
                _ = shutdown.cancelled() => break GenerationOutcome::Closed,
                next = stream.next() => next,
            };

            let inbound = match next {
                Some(Ok(inbound)) => inbound,
                Some(Err(error)) => {
                    break GenerationOutcome::Failed {
                        subscribed: true,
                        error,
                    }
                }
                None => {
                    break GenerationOutcome::Failed {
                        subscribed: true,
                        error: BrokerError::connection_lost("delivery stream ended"),
                    }
                }
            };

            // waits while every worker is busy
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break GenerationOutcome::Cancelled,
                _ = shutdown.cancelled() => break GenerationOutcome::Closed,
                sent = tx.send(inbound) => {
                    if sent.is_err() {
                        break GenerationOutcome::Failed {
                            subscribed: true,
                            error: BrokerError::Transport("all consumer workers exited".to_string()),
                        };
                    }
                }
            }
        };

        stop.cancel();
        drop(tx);
        drop(stream);
        self.drain_workers(&mut workers).await;
        session.release().await;
        debug!(generation, "consume generation finished");

        outcome
    }

    /// Let in-flight deliveries finish within the shutdown grace, then abort
    async fn drain_workers(&self, workers: &mut JoinSet<()>) {
        let grace = self.config.shutdown_grace();
        let drained = tokio::time::timeout(grace, async {
            while workers.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                grace_ms = grace.as_millis() as u64,
                remaining = workers.len(),
                "workers still busy after shutdown grace, aborting"
            );
            workers.abort_all();
            while workers.join_next().await.is_some() {}
        }
    }
}
