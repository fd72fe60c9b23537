//! In-memory broker for tests
//!
//! [`MockBroker`] implements the transport traits without a network. It keeps
//! queues, routes publishes through direct bindings or the default exchange,
//! tracks unacknowledged deliveries per session and requeues them (flagged as
//! redelivered) when their session or connection goes away. Failures can be
//! injected: refused dials, failing publishes, a dead destination, and
//! dropping every open connection at once.

use crate::error::{reply_code, BrokerError};
use crate::protocol::{Delivery, ExchangeSpec, PublishRequest, QueueSpec};
use crate::transport::{
    Acknowledger, BrokerConnection, BrokerEndpoint, BrokerSession, CloseNotify, Connector,
    DeliveryStream, InboundDelivery, Subscription,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch, Notify};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct QueueState {
    messages: VecDeque<Delivery>,
    notify: Arc<Notify>,
}

struct Unacked {
    queue: String,
    delivery: Delivery,
    session_id: u64,
}

struct SessionState {
    connection_id: u64,
    token: CancellationToken,
}

#[derive(Default)]
struct BrokerState {
    connect_attempts: u32,
    connect_failures_remaining: u32,
    next_connection_id: u64,
    connections: HashMap<u64, watch::Sender<Option<BrokerError>>>,
    max_open_connections: usize,

    next_session_id: u64,
    sessions: HashMap<u64, SessionState>,

    publish_failures_remaining: u32,
    failing_destinations: HashSet<(String, String)>,
    publish_attempts: Vec<PublishRequest>,
    published: Vec<PublishRequest>,

    exchanges: Vec<String>,
    bindings: HashMap<(String, String), Vec<String>>,
    queues: HashMap<String, QueueState>,

    next_delivery_tag: u64,
    unacked: BTreeMap<u64, Unacked>,
    acked: Vec<u64>,
    nacked: Vec<(u64, bool)>,
}

impl BrokerState {
    fn queue(&mut self, name: &str) -> &mut QueueState {
        self.queues.entry(name.to_string()).or_default()
    }

    fn push(&mut self, queue: &str, delivery: Delivery) {
        let queue = self.queue(queue);
        queue.messages.push_back(delivery);
        queue.notify.notify_waiters();
    }

    /// Put an unacknowledged delivery back at the head of its queue
    fn requeue(&mut self, tag: u64) {
        if let Some(Unacked {
            queue,
            mut delivery,
            ..
        }) = self.unacked.remove(&tag)
        {
            delivery.redelivered = true;
            let queue = self.queue(&queue);
            queue.messages.push_front(delivery);
            queue.notify.notify_waiters();
        }
    }

    fn close_session(&mut self, session_id: u64) {
        let Some(session) = self.sessions.remove(&session_id) else {
            return;
        };
        session.token.cancel();

        let tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, unacked)| unacked.session_id == session_id)
            .map(|(tag, _)| *tag)
            .collect();
        // requeue in reverse so the original order is kept at the queue head
        for tag in tags.into_iter().rev() {
            self.requeue(tag);
        }
    }

    fn close_connection(&mut self, connection_id: u64, reason: BrokerError) {
        let Some(close_tx) = self.connections.remove(&connection_id) else {
            return;
        };
        let sessions: Vec<u64> = self
            .sessions
            .iter()
            .filter(|(_, session)| session.connection_id == connection_id)
            .map(|(id, _)| *id)
            .collect();
        for session_id in sessions {
            self.close_session(session_id);
        }
        let _ = close_tx.send(Some(reason));
    }

    fn route(&mut self, request: &PublishRequest) {
        let queues = if request.exchange.is_empty() {
            vec![request.routing_key.clone()]
        } else {
            self.bindings
                .get(&(request.exchange.clone(), request.routing_key.clone()))
                .cloned()
                .unwrap_or_default()
        };

        for queue in queues {
            let delivery = Delivery {
                body: request.body.clone(),
                exchange: request.exchange.clone(),
                routing_key: request.routing_key.clone(),
                delivery_tag: 0,
                redelivered: false,
                headers: request.headers.clone(),
                content_type: request.content_type.clone(),
                message_id: request.message_id.clone(),
            };
            self.push(&queue, delivery);
        }
    }

    fn session_unacked(&self, session_id: u64) -> usize {
        self.unacked
            .values()
            .filter(|unacked| unacked.session_id == session_id)
            .count()
    }
}

/// Result of one pump step
enum Take {
    Delivery(Delivery),
    Empty,
    Closed,
}

/// In-memory broker. Clones share the same state.
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // a panicking test thread must not hide the state from the others
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn connector(&self) -> MockConnector {
        MockConnector {
            broker: self.clone(),
        }
    }

    /// Refuse the next `count` dial attempts
    pub fn fail_next_connects(&self, count: u32) {
        self.lock().connect_failures_remaining = count;
    }

    pub fn connect_attempts(&self) -> u32 {
        self.lock().connect_attempts
    }

    pub fn open_connections(&self) -> usize {
        self.lock().connections.len()
    }

    /// Highest number of simultaneously open connections seen
    pub fn max_open_connections(&self) -> usize {
        self.lock().max_open_connections
    }

    pub fn open_sessions(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Kill every open connection as if the network dropped
    pub fn drop_connections(&self) {
        let mut state = self.lock();
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in ids {
            state.close_connection(
                id,
                BrokerError::connection_lost("connection reset by peer"),
            );
        }
    }

    /// Fail the next `count` publishes with a negative confirm
    pub fn fail_publishes(&self, count: u32) {
        self.lock().publish_failures_remaining = count;
    }

    /// Fail every publish to `exchange` / `routing_key` until restored
    pub fn fail_publishes_to(&self, exchange: &str, routing_key: &str) {
        self.lock()
            .failing_destinations
            .insert((exchange.to_string(), routing_key.to_string()));
    }

    pub fn restore_publishes_to(&self, exchange: &str, routing_key: &str) {
        self.lock()
            .failing_destinations
            .remove(&(exchange.to_string(), routing_key.to_string()));
    }

    /// Every publish the broker saw, including failed ones
    pub fn publish_attempts(&self) -> Vec<PublishRequest> {
        self.lock().publish_attempts.clone()
    }

    /// Publishes the broker accepted
    pub fn published(&self) -> Vec<PublishRequest> {
        self.lock().published.clone()
    }

    pub fn published_to(&self, routing_key: &str) -> Vec<PublishRequest> {
        self.lock()
            .published
            .iter()
            .filter(|request| request.routing_key == routing_key)
            .cloned()
            .collect()
    }

    /// Put a message on `queue` directly
    pub fn enqueue(&self, queue: &str, body: impl Into<Bytes>) {
        self.enqueue_delivery(queue, Delivery::new(queue, body));
    }

    pub fn enqueue_delivery(&self, queue: &str, delivery: Delivery) {
        self.lock().push(queue, delivery);
    }

    /// Ready (not yet delivered) messages on `queue`
    pub fn queued(&self, queue: &str) -> Vec<Delivery> {
        self.lock()
            .queues
            .get(queue)
            .map(|queue| queue.messages.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn queue_depth(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map_or(0, |queue| queue.messages.len())
    }

    pub fn unacked_count(&self) -> usize {
        self.lock().unacked.len()
    }

    pub fn acked(&self) -> Vec<u64> {
        self.lock().acked.clone()
    }

    /// Negative acknowledgements as (delivery tag, requeue)
    pub fn nacked(&self) -> Vec<(u64, bool)> {
        self.lock().nacked.clone()
    }

    pub fn declared_exchanges(&self) -> Vec<String> {
        self.lock().exchanges.clone()
    }

    pub fn declared_queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = self.lock().queues.keys().cloned().collect();
        queues.sort();
        queues
    }

    fn queue_notify(&self, queue: &str) -> Arc<Notify> {
        self.lock().queue(queue).notify.clone()
    }

    fn take(&self, session_id: u64, subscription: &Subscription) -> Take {
        let mut state = self.lock();
        if !state.sessions.contains_key(&session_id) {
            return Take::Closed;
        }
        if !subscription.auto_ack
            && subscription.prefetch_count > 0
            && state.session_unacked(session_id) >= usize::from(subscription.prefetch_count)
        {
            return Take::Empty;
        }

        let Some(mut delivery) = state.queue(&subscription.queue).messages.pop_front() else {
            return Take::Empty;
        };
        state.next_delivery_tag += 1;
        delivery.delivery_tag = state.next_delivery_tag;
        if !subscription.auto_ack {
            state.unacked.insert(
                delivery.delivery_tag,
                Unacked {
                    queue: subscription.queue.clone(),
                    delivery: delivery.clone(),
                    session_id,
                },
            );
        }
        Take::Delivery(delivery)
    }

    fn settle(
        &self,
        session_id: u64,
        tag: u64,
        multiple: bool,
        nack: Option<bool>,
    ) -> Result<(), BrokerError> {
        let mut state = self.lock();
        if !state.sessions.contains_key(&session_id) {
            return Err(BrokerError::connection_lost("channel closed"));
        }

        let tags: Vec<u64> = state
            .unacked
            .iter()
            .filter(|(t, unacked)| {
                unacked.session_id == session_id && (**t == tag || (multiple && **t < tag))
            })
            .map(|(t, _)| *t)
            .collect();
        if tags.is_empty() {
            return Err(BrokerError::Protocol {
                code: reply_code::PRECONDITION_FAILED,
                message: format!("unknown delivery tag {tag}"),
            });
        }

        for t in tags {
            match nack {
                None => {
                    if let Some(unacked) = state.unacked.remove(&t) {
                        state.acked.push(t);
                        state.queue(&unacked.queue).notify.notify_waiters();
                    }
                }
                Some(true) => {
                    state.nacked.push((t, true));
                    state.requeue(t);
                }
                Some(false) => {
                    if let Some(unacked) = state.unacked.remove(&t) {
                        state.nacked.push((t, false));
                        state.queue(&unacked.queue).notify.notify_waiters();
                    }
                }
            }
        }
        Ok(())
    }
}

/// Dials a [`MockBroker`]
#[derive(Clone)]
pub struct MockConnector {
    broker: MockBroker,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        _endpoint: &BrokerEndpoint,
    ) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let mut state = self.broker.lock();
        state.connect_attempts += 1;
        if state.connect_failures_remaining > 0 {
            state.connect_failures_remaining -= 1;
            return Err(BrokerError::ConnectFailed("connection refused".to_string()));
        }

        state.next_connection_id += 1;
        let id = state.next_connection_id;
        let (close_tx, close_rx) = watch::channel(None);
        state.connections.insert(id, close_tx);
        state.max_open_connections = state.max_open_connections.max(state.connections.len());

        Ok(Arc::new(MockConnection {
            broker: self.broker.clone(),
            id,
            close_rx,
        }))
    }
}

struct MockConnection {
    broker: MockBroker,
    id: u64,
    close_rx: CloseNotify,
}

#[async_trait]
impl BrokerConnection for MockConnection {
    async fn open_session(&self) -> Result<Box<dyn BrokerSession>, BrokerError> {
        let mut state = self.broker.lock();
        if !state.connections.contains_key(&self.id) {
            return Err(BrokerError::connection_lost("connection closed"));
        }
        state.next_session_id += 1;
        let session_id = state.next_session_id;
        state.sessions.insert(
            session_id,
            SessionState {
                connection_id: self.id,
                token: CancellationToken::new(),
            },
        );

        Ok(Box::new(MockSession {
            broker: self.broker.clone(),
            id: session_id,
        }))
    }

    fn close_notify(&self) -> CloseNotify {
        self.close_rx.clone()
    }

    fn is_open(&self) -> bool {
        self.broker.lock().connections.contains_key(&self.id)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.broker
            .lock()
            .close_connection(self.id, BrokerError::connection_lost("closed by client"));
        Ok(())
    }
}

struct MockSession {
    broker: MockBroker,
    id: u64,
}

impl MockSession {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.broker.lock().sessions.contains_key(&self.id) {
            Ok(())
        } else {
            Err(BrokerError::connection_lost("channel closed"))
        }
    }
}

#[async_trait]
impl BrokerSession for MockSession {
    async fn publish(&mut self, request: &PublishRequest) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        if !state.sessions.contains_key(&self.id) {
            return Err(BrokerError::connection_lost("channel closed"));
        }
        state.publish_attempts.push(request.clone());

        if state.publish_failures_remaining > 0 {
            state.publish_failures_remaining -= 1;
            return Err(BrokerError::PublishNacked);
        }
        let destination = (request.exchange.clone(), request.routing_key.clone());
        if state.failing_destinations.contains(&destination) {
            return Err(BrokerError::Protocol {
                code: reply_code::RESOURCE_ERROR,
                message: "destination unavailable".to_string(),
            });
        }

        state.published.push(request.clone());
        state.route(request);
        Ok(())
    }

    async fn consume(&mut self, subscription: &Subscription) -> Result<DeliveryStream, BrokerError> {
        let token = {
            let mut state = self.broker.lock();
            let Some(session) = state.sessions.get(&self.id) else {
                return Err(BrokerError::connection_lost("channel closed"));
            };
            let token = session.token.clone();
            state.queue(&subscription.queue);
            token
        };

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(pump(
            self.broker.clone(),
            self.id,
            subscription.clone(),
            token,
            tx,
        ));

        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }

    async fn declare_exchange(&mut self, exchange: &ExchangeSpec) -> Result<(), BrokerError> {
        self.ensure_open()?;
        exchange.validate()?;
        let mut state = self.broker.lock();
        if !state.exchanges.contains(&exchange.name) {
            state.exchanges.push(exchange.name.clone());
        }
        Ok(())
    }

    async fn declare_queue(&mut self, queue: &QueueSpec) -> Result<(), BrokerError> {
        self.ensure_open()?;
        queue.validate()?;
        let mut state = self.broker.lock();
        state.queue(&queue.name);
        for binding in &queue.bindings {
            let bound = state
                .bindings
                .entry((binding.exchange.clone(), binding.routing_key.clone()))
                .or_default();
            if !bound.contains(&queue.name) {
                bound.push(queue.name.clone());
            }
        }
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), BrokerError> {
        self.broker.lock().close_session(self.id);
        Ok(())
    }
}

impl Drop for MockSession {
    fn drop(&mut self) {
        self.broker.lock().close_session(self.id);
    }
}

/// Move deliveries from the queue into the subscription stream until the
/// session closes or the stream is dropped
async fn pump(
    broker: MockBroker,
    session_id: u64,
    subscription: Subscription,
    token: CancellationToken,
    tx: mpsc::UnboundedSender<Result<InboundDelivery, BrokerError>>,
) {
    let notify = broker.queue_notify(&subscription.queue);
    loop {
        // register interest before looking, so a push in between is not missed
        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        match broker.take(session_id, &subscription) {
            Take::Closed => return,
            Take::Delivery(delivery) => {
                let tag = delivery.delivery_tag;
                let acker = MockAcker {
                    broker: broker.clone(),
                    session_id,
                    tag,
                };
                if tx.send(Ok(InboundDelivery::new(delivery, Box::new(acker)))).is_err() {
                    broker.lock().requeue(tag);
                    return;
                }
            }
            Take::Empty => {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tx.closed() => return,
                    _ = &mut notified => {}
                }
            }
        }
    }
}

struct MockAcker {
    broker: MockBroker,
    session_id: u64,
    tag: u64,
}

#[async_trait]
impl Acknowledger for MockAcker {
    async fn ack(&self, multiple: bool) -> Result<(), BrokerError> {
        self.broker.settle(self.session_id, self.tag, multiple, None)
    }

    async fn nack(&self, multiple: bool, requeue: bool) -> Result<(), BrokerError> {
        self.broker
            .settle(self.session_id, self.tag, multiple, Some(requeue))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> BrokerEndpoint {
        BrokerEndpoint::new("amqp://localhost:5672/%2f").unwrap()
    }

    #[tokio::test]
    async fn test_injected_connect_failures() {
        let broker = MockBroker::new();
        broker.fail_next_connects(1);
        let connector = broker.connector();

        assert!(connector.connect(&endpoint()).await.is_err());
        assert!(connector.connect(&endpoint()).await.is_ok());
        assert_eq!(broker.connect_attempts(), 2);
        assert_eq!(broker.open_connections(), 1);
    }

    #[tokio::test]
    async fn test_unacked_deliveries_requeued_on_session_close() {
        let broker = MockBroker::new();
        broker.enqueue("orders", "first");
        broker.enqueue("orders", "second");

        let connection = broker.connector().connect(&endpoint()).await.unwrap();
        let mut session = connection.open_session().await.unwrap();
        let mut stream = session
            .consume(&Subscription {
                queue: "orders".to_string(),
                consumer_tag: "test".to_string(),
                prefetch_count: 0,
                auto_ack: false,
                arguments: BTreeMap::new(),
            })
            .await
            .unwrap();

        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();
        first.ack(false).await.unwrap();
        assert_eq!(broker.unacked_count(), 1);

        session.close().await.unwrap();
        assert!(second.ack(false).await.is_err());

        let queued = broker.queued("orders");
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].body, Bytes::from("second"));
        assert!(queued[0].redelivered);
    }

    #[tokio::test]
    async fn test_publish_routes_through_bindings() {
        let broker = MockBroker::new();
        let connection = broker.connector().connect(&endpoint()).await.unwrap();
        let mut session = connection.open_session().await.unwrap();

        session
            .declare_queue(&QueueSpec::new("orders").bind("events", "orders.created"))
            .await
            .unwrap();
        session
            .publish(&PublishRequest::new("events", "orders.created", "{}"))
            .await
            .unwrap();
        session
            .publish(&PublishRequest::new("events", "orders.deleted", "{}"))
            .await
            .unwrap();

        assert_eq!(broker.queue_depth("orders"), 1);
        assert_eq!(broker.published().len(), 2);
    }

    #[tokio::test]
    async fn test_drop_connections_signals_close() {
        let broker = MockBroker::new();
        let connection = broker.connector().connect(&endpoint()).await.unwrap();
        let mut notify = connection.close_notify();

        broker.drop_connections();

        notify.wait_for(Option::is_some).await.unwrap();
        assert!(!connection.is_open());
        assert!(connection.open_session().await.is_err());
    }
}
