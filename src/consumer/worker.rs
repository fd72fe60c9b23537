//! Worker tasks: run the handler under retry, then settle the delivery

use super::handler::Handler;
use super::ExhaustedAction;
use crate::dead_letter::DeadLetterSink;
use crate::observability::metrics::metrics;
use crate::protocol::Delivery;
use crate::retry::{RetryError, RetryExecutor};
use crate::transport::InboundDelivery;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn, Instrument};

pub(crate) type SharedReceiver = Arc<Mutex<mpsc::Receiver<InboundDelivery>>>;

/// What to do with a delivery once its handler has run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    /// Negative acknowledgement without requeue
    Reject,
    /// Leave unacknowledged; the broker redelivers it when the session closes
    Withhold,
}

/// Settlement rules for deliveries whose handler never succeeded
pub struct ExhaustionDecision;

impl ExhaustionDecision {
    /// No dead-letter sink configured (pure function)
    pub fn without_dead_letter(action: ExhaustedAction) -> Settlement {
        match action {
            ExhaustedAction::Ack => Settlement::Ack,
            ExhaustedAction::Reject => Settlement::Reject,
        }
    }

    /// After trying to dead-letter the delivery (pure function)
    ///
    /// A delivery is only acknowledged once its envelope is safely published.
    /// If that failed it is withheld for redelivery, unless it has already
    /// been redelivered `max_redeliveries` times.
    pub fn after_dead_letter(
        dead_lettered: bool,
        redeliveries: u32,
        max_redeliveries: Option<u32>,
    ) -> Settlement {
        if dead_lettered {
            return Settlement::Ack;
        }
        match max_redeliveries {
            Some(max) if redeliveries >= max => Settlement::Reject,
            _ => Settlement::Withhold,
        }
    }

    /// Redeliveries seen so far: the broker's delivery count when it sends one,
    /// otherwise 1 for a redelivered message (pure function)
    pub fn redeliveries(delivery: &Delivery) -> u32 {
        delivery
            .redelivery_count()
            .unwrap_or(u32::from(delivery.redelivered))
    }
}

/// Shared by every worker of one consume generation
pub(crate) struct WorkerContext {
    pub executor: RetryExecutor,
    pub dead_letter: Option<DeadLetterSink>,
    pub handler: Arc<dyn Handler>,
    /// Caller's token, handed to the handler
    pub cancel: CancellationToken,
    /// Cancelled when the generation ends; stops fetching and retry sleeps
    pub stop: CancellationToken,
    pub auto_ack: bool,
    pub ack_multiple: bool,
    pub nack_multiple: bool,
    pub exhausted_action: ExhaustedAction,
    pub max_redeliveries: Option<u32>,
}

/// Take deliveries one at a time until the channel closes or the generation stops
pub(crate) async fn run_worker(worker_id: usize, ctx: Arc<WorkerContext>, rx: SharedReceiver) {
    debug!(worker_id, "worker started");
    loop {
        let next = {
            let mut rx = rx.lock().await;
            tokio::select! {
                biased;
                _ = ctx.stop.cancelled() => None,
                next = rx.recv() => next,
            }
        };
        let Some(inbound) = next else {
            break;
        };

        let span = crate::delivery_span!(
            worker_id,
            delivery_tag = inbound.delivery().delivery_tag,
            routing_key = %inbound.delivery().routing_key
        );
        process_delivery(&ctx, inbound).instrument(span).await;
    }
    debug!(worker_id, "worker stopped");
}

pub(crate) async fn process_delivery(ctx: &WorkerContext, inbound: InboundDelivery) {
    metrics().record_delivery_received();
    let started = Instant::now();

    let delivery = inbound.delivery();
    let result = ctx
        .executor
        .execute(&ctx.stop, |_| ctx.handler.handle(&ctx.cancel, delivery))
        .await;

    match result {
        Ok(()) => {
            debug!("delivery handled");
            if !ctx.auto_ack {
                settle(ctx, inbound, Settlement::Ack).await;
            }
        }
        Err(RetryError::Cancelled { attempts }) => {
            if ctx.auto_ack {
                warn!(attempts, "handling cancelled, auto-acknowledged delivery abandoned");
            } else {
                debug!(attempts, "handling cancelled, delivery left for redelivery");
            }
        }
        Err(failure) => {
            let settlement = handle_failure(ctx, delivery, &failure).await;
            if !ctx.auto_ack {
                settle(ctx, inbound, settlement).await;
            }
        }
    }

    metrics().record_delivery_finished(started.elapsed());
}

/// Dead-letter or log a failed delivery and decide its settlement
async fn handle_failure<E: std::fmt::Display>(
    ctx: &WorkerContext,
    delivery: &Delivery,
    failure: &RetryError<E>,
) -> Settlement {
    let attempts = failure.attempts();
    let error_text = match failure.last_error() {
        Some(last) => last.to_string(),
        None => failure.to_string(),
    };

    let Some(sink) = &ctx.dead_letter else {
        if ctx.auto_ack {
            warn!(attempts, error = %error_text, "handler failed on auto-acknowledged delivery");
            return Settlement::Ack;
        }
        let settlement = ExhaustionDecision::without_dead_letter(ctx.exhausted_action);
        warn!(
            attempts,
            error = %error_text,
            action = ?settlement,
            "handler failed, no dead-letter destination"
        );
        return settlement;
    };

    let dead_lettered = match sink
        .publish_failure(&ctx.stop, delivery, &error_text, attempts)
        .await
    {
        Ok(()) => true,
        Err(e) => {
            error!(
                attempts,
                error = %error_text,
                dlq_error = %e,
                "failed to dead-letter delivery"
            );
            false
        }
    };

    if ctx.auto_ack {
        return Settlement::Ack;
    }

    let redeliveries = ExhaustionDecision::redeliveries(delivery);
    let settlement =
        ExhaustionDecision::after_dead_letter(dead_lettered, redeliveries, ctx.max_redeliveries);
    match settlement {
        Settlement::Withhold => error!(
            redeliveries,
            "delivery left unacknowledged until it can be dead-lettered"
        ),
        Settlement::Reject => error!(
            redeliveries,
            max_redeliveries = ctx.max_redeliveries,
            "redelivery limit reached, dropping delivery without a dead-letter record"
        ),
        Settlement::Ack => {}
    }
    settlement
}

async fn settle(ctx: &WorkerContext, inbound: InboundDelivery, settlement: Settlement) {
    let result = match settlement {
        Settlement::Ack => inbound.ack(ctx.ack_multiple).await.map(|()| {
            metrics().record_acked();
        }),
        Settlement::Reject => inbound.nack(ctx.nack_multiple, false).await.map(|()| {
            metrics().record_rejected();
        }),
        Settlement::Withhold => return,
    };

    if let Err(e) = result {
        warn!(settlement = ?settlement, error = %e, "failed to settle delivery");
    }
}
