//! Pure reconnection decisions, state transitions and health metrics
//!
//! Nothing here performs I/O; the supervisor feeds events in and acts on the
//! returned decisions.

use super::state::ConnectionState;
use crate::retry::Backoff;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Pure health monitoring and reconnection decision logic
pub struct HealthMonitor;

impl HealthMonitor {
    /// Decide whether to sleep and dial again after a failed attempt (pure function)
    pub fn next_reconnect_step(
        failed_attempts: u32,
        backoff: &mut Backoff,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        ReconnectionDecision::Proceed {
            attempt: failed_attempts + 1,
            delay: backoff.next_delay(),
        }
    }

    /// Determine next state after connection event (pure function)
    ///
    /// `Closed` is terminal: no event leaves it.
    pub fn determine_next_state(
        current: ConnectionState,
        event: &ConnectionEvent,
    ) -> ConnectionState {
        if current.is_closed() {
            return ConnectionState::Closed;
        }

        match event {
            ConnectionEvent::Established { .. } => ConnectionState::Open,
            ConnectionEvent::Lost(_) => ConnectionState::Connecting,
            ConnectionEvent::ShutdownRequested => ConnectionState::Closed,
        }
    }

    /// Check if connection state allows leasing sessions (pure function)
    pub fn can_lease(state: ConnectionState) -> bool {
        state.is_open()
    }

    /// Calculate health metrics for connection (pure function)
    pub fn calculate_health_metrics(
        state: ConnectionState,
        generation: u64,
        connected_at: Option<Instant>,
        reconnect_count: u32,
    ) -> HealthMetrics {
        let uptime = connected_at.map(|t| t.elapsed());
        let is_healthy = state.is_open() && uptime.is_some();

        let mut metrics = HealthMetrics {
            state,
            generation,
            uptime,
            reconnect_count,
            is_healthy,
            quality: ConnectionQuality::Critical,
        };
        metrics.quality = Self::assess_connection_quality(&metrics);
        metrics
    }

    /// Assess connection quality based on metrics (pure function)
    pub fn assess_connection_quality(metrics: &HealthMetrics) -> ConnectionQuality {
        if !metrics.is_healthy {
            return ConnectionQuality::Critical;
        }

        match (metrics.reconnect_count, metrics.uptime) {
            (0, Some(uptime)) if uptime > Duration::from_secs(3600) => ConnectionQuality::Excellent,
            (0, Some(_)) => ConnectionQuality::Good,

            (1..=2, Some(uptime)) if uptime > Duration::from_secs(1800) => ConnectionQuality::Good,
            (1..=2, Some(_)) => ConnectionQuality::Fair,

            (3..=5, _) => ConnectionQuality::Fair,
            (6..=10, _) => ConnectionQuality::Poor,

            _ => ConnectionQuality::Critical,
        }
    }

    /// Log connection state transition (pure logging function)
    pub fn log_state_transition(
        from: ConnectionState,
        to: ConnectionState,
        event: &ConnectionEvent,
    ) {
        match (from, to, event) {
            (ConnectionState::Connecting, ConnectionState::Open, ConnectionEvent::Established { generation }) => {
                info!(generation, "broker connection established");
            }
            (ConnectionState::Open, ConnectionState::Connecting, ConnectionEvent::Lost(reason)) => {
                warn!(reason = %reason, "broker connection lost");
            }
            (_, ConnectionState::Closed, _) if from != to => {
                info!("broker connection closed");
            }
            _ if from == to => {}
            _ => {
                error!(from = %from, to = %to, "unexpected connection state transition");
            }
        }
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    /// Sleep `delay`, then dial again
    Proceed { attempt: u32, delay: Duration },
    /// Stop: shutdown requested
    AbortShutdownRequested,
}

/// Connection events that trigger state transitions
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A new connection became current
    Established { generation: u64 },
    /// The current connection died
    Lost(String),
    /// Explicit shutdown
    ShutdownRequested,
}

/// Health snapshot of the supervised connection
#[derive(Debug, Clone, Serialize)]
pub struct HealthMetrics {
    pub state: ConnectionState,
    pub generation: u64,
    /// Time since the current connection was established
    pub uptime: Option<Duration>,
    /// Number of connections established after the first
    pub reconnect_count: u32,
    pub is_healthy: bool,
    pub quality: ConnectionQuality,
}

/// Connection quality assessment
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    /// Stable for over an hour without reconnects
    Excellent,
    Good,
    /// Some reconnections, but working
    Fair,
    /// Frequent reconnections
    Poor,
    /// Down, or failing constantly
    Critical,
}
