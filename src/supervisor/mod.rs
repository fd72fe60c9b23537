//! Supervised logical connection to the broker
//!
//! [`ConnectionSupervisor`] owns the single current connection. It dials with
//! unbounded backoff, watches the current connection for loss, swaps in a
//! replacement, and leases [`Session`]s to publishers and consumers.
//!
//! - [`state`] - the connection lifecycle states
//! - [`health_monitor`] - pure reconnection decisions and health metrics
//!
//! Each connection carries a generation number. Only the watcher of the
//! current generation can trigger a reconnect, so concurrent loss signals
//! start at most one connect loop and never produce two open connections.

pub mod health_monitor;
pub mod state;

pub use health_monitor::{
    ConnectionEvent, ConnectionQuality, HealthMetrics, HealthMonitor, ReconnectionDecision,
};
pub use state::ConnectionState;

use crate::error::{redact_credentials, BrokerError};
use crate::observability::metrics::metrics;
use crate::protocol::{ExchangeSpec, PublishRequest, QueueSpec, Topology};
use crate::retry::{interruptible_sleep, ReconnectPolicy};
use crate::transport::{
    BrokerConnection, BrokerEndpoint, BrokerSession, CloseNotify, Connector, DeliveryStream,
    Subscription,
};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

#[derive(Clone)]
struct CurrentConnection {
    generation: u64,
    connection: Arc<dyn BrokerConnection>,
}

struct Inner {
    endpoint: BrokerEndpoint,
    connector: Arc<dyn Connector>,
    reconnect: ReconnectPolicy,
    current: RwLock<Option<CurrentConnection>>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown: CancellationToken,
    closed: AtomicBool,
    generation: AtomicU64,
    reconnect_count: AtomicU32,
    connected_at: Mutex<Option<Instant>>,
}

/// Owner of the single logical broker connection.
///
/// Cheap to clone; all clones share one connection. Background tasks keep the
/// supervisor alive until [`ConnectionSupervisor::shutdown`] is called.
#[derive(Clone)]
pub struct ConnectionSupervisor {
    inner: Arc<Inner>,
}

impl ConnectionSupervisor {
    /// Start supervising without waiting for the first connection.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        endpoint: BrokerEndpoint,
        connector: Arc<dyn Connector>,
        reconnect: ReconnectPolicy,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        let inner = Arc::new(Inner {
            endpoint,
            connector,
            reconnect,
            current: RwLock::new(None),
            state_tx,
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            reconnect_count: AtomicU32::new(0),
            connected_at: Mutex::new(None),
        });

        info!(url = %inner.endpoint.display_url(), "starting connection supervisor");
        Inner::spawn_connect_loop(&inner);
        Self { inner }
    }

    /// Start supervising and wait until the first connection is open.
    ///
    /// Fails with [`BrokerError::ConnectTimeout`] if no connection opens within
    /// `initial_timeout`; the supervisor is shut down in that case.
    pub async fn connect(
        endpoint: BrokerEndpoint,
        connector: Arc<dyn Connector>,
        reconnect: ReconnectPolicy,
        initial_timeout: Duration,
    ) -> Result<Self, BrokerError> {
        let supervisor = Self::start(endpoint, connector, reconnect);
        // never cancelled; the timeout and shutdown end the wait
        let never = CancellationToken::new();
        let ready = supervisor.wait_ready(&never);

        match tokio::time::timeout(initial_timeout, ready).await {
            Ok(Ok(())) => Ok(supervisor),
            Ok(Err(e)) => {
                supervisor.shutdown().await;
                Err(e)
            }
            Err(_) => {
                supervisor.shutdown().await;
                Err(BrokerError::ConnectTimeout(initial_timeout))
            }
        }
    }

    pub fn endpoint(&self) -> &BrokerEndpoint {
        &self.inner.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Generation of the most recently established connection (0 before the first)
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Token cancelled when the supervisor shuts down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Open, and the transport agrees the current connection is alive
    pub fn is_healthy(&self) -> bool {
        if !HealthMonitor::can_lease(self.state()) {
            return false;
        }
        match self.inner.current.try_read() {
            Ok(current) => current
                .as_ref()
                .is_some_and(|current| current.connection.is_open()),
            // a writer holds the slot: a swap or shutdown is in progress
            Err(_) => false,
        }
    }

    pub fn health(&self) -> HealthMetrics {
        let connected_at = self
            .inner
            .connected_at
            .lock()
            .map(|guard| *guard)
            .unwrap_or(None);
        HealthMonitor::calculate_health_metrics(
            self.state(),
            self.generation(),
            connected_at,
            self.inner.reconnect_count.load(Ordering::SeqCst),
        )
    }

    /// Wait until a connection is open.
    ///
    /// Returns `Cancelled` if `cancel` fires first and `Closed` if the
    /// supervisor shuts down.
    pub async fn wait_ready(&self, cancel: &CancellationToken) -> Result<(), BrokerError> {
        let mut state_rx = self.inner.state_tx.subscribe();
        let reached = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BrokerError::Cancelled),
            state = wait_until_settled(&mut state_rx) => state,
        };

        match reached {
            ConnectionState::Open => Ok(()),
            _ => Err(BrokerError::Closed),
        }
    }

    /// Lease a session on the current connection.
    ///
    /// `Closed` after shutdown, `NotReady` while reconnecting. A connection-loss
    /// error from the transport also starts reconnection right away rather than
    /// waiting for the watcher.
    pub async fn acquire_session(&self) -> Result<Session, BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }

        let current = self.inner.current.read().await.clone();
        let Some(current) = current else {
            return Err(BrokerError::NotReady);
        };

        match current.connection.open_session().await {
            Ok(session) => Ok(Session::new(session, current.generation)),
            Err(e) => {
                if e.is_connection_loss() {
                    Inner::connection_lost(&self.inner, current.generation, e.clone()).await;
                }
                Err(e)
            }
        }
    }

    pub async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<(), BrokerError> {
        let mut session = self.acquire_session().await?;
        let result = session.declare_exchange(exchange).await;
        session.release().await;
        result
    }

    pub async fn declare_queue(&self, queue: &QueueSpec) -> Result<(), BrokerError> {
        let mut session = self.acquire_session().await?;
        let result = session.declare_queue(queue).await;
        session.release().await;
        result
    }

    /// Declare exchanges first, then queues with their bindings, on one session
    pub async fn declare_topology(&self, topology: &Topology) -> Result<(), BrokerError> {
        topology.validate()?;
        let mut session = self.acquire_session().await?;
        let result = async {
            for exchange in &topology.exchanges {
                session.declare_exchange(exchange).await?;
                debug!(exchange = %exchange.name, "exchange declared");
            }
            for queue in &topology.queues {
                session.declare_queue(queue).await?;
                debug!(queue = %queue.name, bindings = queue.bindings.len(), "queue declared");
            }
            Ok::<(), BrokerError>(())
        }
        .await;
        session.release().await;
        result
    }

    /// Stop reconnecting and close the current connection. Idempotent.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.cancel();

        let current = self.inner.current.write().await.take();
        self.inner.transition(ConnectionEvent::ShutdownRequested);
        metrics().set_connected(false);

        if let Some(current) = current {
            if let Err(e) = current.connection.close().await {
                debug!(error = %e, "error closing connection during shutdown");
            }
        }
        info!("connection supervisor shut down");
    }
}

impl Inner {
    fn transition(&self, event: ConnectionEvent) {
        let mut previous = ConnectionState::Closed;
        let mut next = ConnectionState::Closed;
        self.state_tx.send_if_modified(|state| {
            previous = *state;
            next = HealthMonitor::determine_next_state(*state, &event);
            *state = next;
            previous != next
        });
        HealthMonitor::log_state_transition(previous, next, &event);
    }

    fn spawn_connect_loop(inner: &Arc<Self>) {
        let span = crate::connection_span!(url = %inner.endpoint.display_url());
        tokio::spawn(Self::run_connect_loop(inner.clone()).instrument(span));
    }

    /// Dial until a connection is installed or the supervisor shuts down
    async fn run_connect_loop(inner: Arc<Self>) {
        let mut backoff = inner.reconnect.backoff();
        let mut failed_attempts = 0u32;
        let connect_timeout = inner.endpoint.connect_timeout;

        loop {
            if inner.shutdown.is_cancelled() {
                return;
            }
            metrics().record_connection_attempt();

            let dial = tokio::time::timeout(connect_timeout, inner.connector.connect(&inner.endpoint));
            let outcome = tokio::select! {
                biased;
                _ = inner.shutdown.cancelled() => return,
                outcome = dial => outcome,
            };

            let error = match outcome {
                Ok(Ok(connection)) => {
                    Self::install(&inner, connection).await;
                    return;
                }
                Ok(Err(e)) => e,
                Err(_) => BrokerError::ConnectTimeout(connect_timeout),
            };
            metrics().record_connection_failure();

            match HealthMonitor::next_reconnect_step(
                failed_attempts,
                &mut backoff,
                inner.shutdown.is_cancelled(),
            ) {
                ReconnectionDecision::AbortShutdownRequested => return,
                ReconnectionDecision::Proceed { attempt, delay } => {
                    failed_attempts = attempt;
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %redact_credentials(&error.to_string()),
                        "broker connection attempt failed"
                    );
                    if !interruptible_sleep(&inner.shutdown, delay).await {
                        return;
                    }
                }
            }
        }
    }

    /// Make `connection` current and start watching it
    async fn install(inner: &Arc<Self>, connection: Arc<dyn BrokerConnection>) {
        let notify = connection.close_notify();
        let generation;
        let previous = {
            let mut current = inner.current.write().await;
            if inner.shutdown.is_cancelled() {
                drop(current);
                let _ = connection.close().await;
                return;
            }
            generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
            let previous = current.replace(CurrentConnection {
                generation,
                connection,
            });
            inner.transition(ConnectionEvent::Established { generation });
            previous
        };

        if let Ok(mut connected_at) = inner.connected_at.lock() {
            *connected_at = Some(Instant::now());
        }
        metrics().record_connection_established();
        metrics().set_connected(true);
        if generation > 1 {
            inner.reconnect_count.fetch_add(1, Ordering::SeqCst);
            metrics().record_reconnect();
        }

        if let Some(previous) = previous {
            Self::close_in_background(previous);
        }

        let span = crate::connection_span!(generation);
        tokio::spawn(Self::watch_connection(inner.clone(), generation, notify).instrument(span));
    }

    async fn watch_connection(inner: Arc<Self>, generation: u64, mut notify: CloseNotify) {
        let reason = tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => return,
            reason = wait_for_close(&mut notify) => reason,
        };
        Self::connection_lost(&inner, generation, reason).await;
    }

    /// Retire `generation` if it is still current and start reconnecting.
    /// Stale generations are ignored.
    async fn connection_lost(inner: &Arc<Self>, generation: u64, reason: BrokerError) {
        let lost = {
            let mut current = inner.current.write().await;
            let is_current = current
                .as_ref()
                .is_some_and(|current| current.generation == generation);
            if !is_current || inner.shutdown.is_cancelled() {
                return;
            }
            inner.transition(ConnectionEvent::Lost(redact_credentials(&reason.to_string())));
            current.take()
        };

        if let Ok(mut connected_at) = inner.connected_at.lock() {
            *connected_at = None;
        }
        metrics().set_connected(false);

        if let Some(lost) = lost {
            Self::close_in_background(lost);
        }
        Self::spawn_connect_loop(inner);
    }

    fn close_in_background(retired: CurrentConnection) {
        tokio::spawn(async move {
            if let Err(e) = retired.connection.close().await {
                debug!(generation = retired.generation, error = %e, "error closing retired connection");
            }
        });
    }
}

async fn wait_until_settled(state_rx: &mut watch::Receiver<ConnectionState>) -> ConnectionState {
    match state_rx.wait_for(|state| *state != ConnectionState::Connecting).await {
        Ok(state) => *state,
        Err(_) => ConnectionState::Closed,
    }
}

async fn wait_for_close(notify: &mut CloseNotify) -> BrokerError {
    match notify.wait_for(Option::is_some).await {
        Ok(reason) => reason
            .clone()
            .unwrap_or_else(|| BrokerError::connection_lost("connection closed")),
        Err(_) => BrokerError::connection_lost("connection dropped"),
    }
}

/// A channel leased from the supervisor.
///
/// Release it with [`Session::close`] or [`Session::release`]. A session that
/// is dropped unreleased, because its owner was cancelled or panicked, is
/// closed on a background task.
pub struct Session {
    inner: Option<Box<dyn BrokerSession>>,
    generation: u64,
}

impl Session {
    fn new(session: Box<dyn BrokerSession>, generation: u64) -> Self {
        Self {
            inner: Some(session),
            generation,
        }
    }

    /// Generation of the connection this session was leased from
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn session(&mut self) -> Result<&mut Box<dyn BrokerSession>, BrokerError> {
        self.inner.as_mut().ok_or(BrokerError::Closed)
    }

    pub async fn publish(&mut self, request: &PublishRequest) -> Result<(), BrokerError> {
        self.session()?.publish(request).await
    }

    pub async fn consume(
        &mut self,
        subscription: &Subscription,
    ) -> Result<DeliveryStream, BrokerError> {
        self.session()?.consume(subscription).await
    }

    pub async fn declare_exchange(&mut self, exchange: &ExchangeSpec) -> Result<(), BrokerError> {
        self.session()?.declare_exchange(exchange).await
    }

    pub async fn declare_queue(&mut self, queue: &QueueSpec) -> Result<(), BrokerError> {
        self.session()?.declare_queue(queue).await
    }

    pub async fn close(mut self) -> Result<(), BrokerError> {
        match self.inner.take() {
            Some(session) => session.close().await,
            None => Ok(()),
        }
    }

    /// Close, logging rather than returning any error
    pub async fn release(self) {
        let generation = self.generation;
        if let Err(e) = self.close().await {
            debug!(generation, error = %e, "error releasing session");
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(session) = self.inner.take() {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    let _ = session.close().await;
                });
            }
        }
    }
}
