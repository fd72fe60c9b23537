//! Thread-safe metrics collection
//!
//! Atomic counters for connection, publish and consume activity, plus a
//! bounded window of handler durations for percentiles.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const MAX_HANDLER_SAMPLES: usize = 1000;

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

/// Thread-safe metrics collector using atomics and a mutex-protected window
pub struct MetricsCollector {
    // Connection
    connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    reconnects: AtomicU64,
    connected_since: AtomicU64,

    // Publish
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
    retries: AtomicU64,

    // Consume
    deliveries_received: AtomicU64,
    deliveries_in_flight: AtomicU64,
    acked: AtomicU64,
    rejected: AtomicU64,
    dead_lettered: AtomicU64,
    dead_letter_failures: AtomicU64,
    handler_times: Mutex<VecDeque<u64>>,

    started_at: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            connected_since: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            deliveries_received: AtomicU64::new(0),
            deliveries_in_flight: AtomicU64::new(0),
            acked: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            dead_letter_failures: AtomicU64::new(0),
            handler_times: Mutex::new(VecDeque::new()),
            started_at: AtomicU64::new(current_timestamp()),
        }
    }

    // Connection metrics
    pub fn record_connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_failure(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_connected(&self, connected: bool) {
        let was_connected = self.connected.swap(connected, Ordering::Relaxed);
        if connected && !was_connected {
            self.connected_since
                .store(current_timestamp(), Ordering::Relaxed);
        } else if !connected {
            self.connected_since.store(0, Ordering::Relaxed);
        }
    }

    // Publish metrics
    pub fn record_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish_failure(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// One retry sleep taken by any retry executor
    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    // Consume metrics
    pub fn record_delivery_received(&self) {
        self.deliveries_received.fetch_add(1, Ordering::Relaxed);
        self.deliveries_in_flight.fetch_add(1, Ordering::Relaxed);
    }

    /// Delivery left the worker, settled or not
    pub fn record_delivery_finished(&self, handler_time: Duration) {
        let _ = self
            .deliveries_in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));

        if let Ok(mut times) = self.handler_times.lock() {
            times.push_back(handler_time.as_millis() as u64);
            if times.len() > MAX_HANDLER_SAMPLES {
                times.pop_front();
            }
        }
    }

    pub fn record_acked(&self) {
        self.acked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_letter_failure(&self) {
        self.dead_letter_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Reset all metrics (useful for testing)
    pub fn reset(&self) {
        for counter in [
            &self.connection_attempts,
            &self.connections_established,
            &self.connection_failures,
            &self.reconnects,
            &self.connected_since,
            &self.messages_published,
            &self.publish_failures,
            &self.retries,
            &self.deliveries_received,
            &self.deliveries_in_flight,
            &self.acked,
            &self.rejected,
            &self.dead_lettered,
            &self.dead_letter_failures,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.connected.store(false, Ordering::Relaxed);
        self.started_at
            .store(current_timestamp(), Ordering::Relaxed);
        if let Ok(mut times) = self.handler_times.lock() {
            times.clear();
        }
    }

    /// Handler time statistics: (avg, p50, p95, p99) in milliseconds
    fn handler_time_statistics(&self) -> (f64, f64, f64, f64) {
        let Ok(times) = self.handler_times.lock() else {
            return (0.0, 0.0, 0.0, 0.0);
        };
        if times.is_empty() {
            return (0.0, 0.0, 0.0, 0.0);
        }

        let mut sorted: Vec<u64> = times.iter().copied().collect();
        drop(times);
        sorted.sort_unstable();

        let avg = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
        (
            avg,
            percentile(&sorted, 50.0),
            percentile(&sorted, 95.0),
            percentile(&sorted, 99.0),
        )
    }

    /// Get complete metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let connected = self.connected.load(Ordering::Relaxed);
        let connected_since = self.connected_since.load(Ordering::Relaxed);
        let connection_duration_seconds = if connected && connected_since > 0 {
            now.saturating_sub(connected_since)
        } else {
            0
        };
        let (avg, p50, p95, p99) = self.handler_time_statistics();

        MetricsSnapshot {
            connection: ConnectionMetrics {
                connected,
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connection_failures: self.connection_failures.load(Ordering::Relaxed),
                reconnects: self.reconnects.load(Ordering::Relaxed),
                connection_duration_seconds,
            },
            publish: PublishMetrics {
                messages_published: self.messages_published.load(Ordering::Relaxed),
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
                retries: self.retries.load(Ordering::Relaxed),
            },
            consume: ConsumeMetrics {
                deliveries_received: self.deliveries_received.load(Ordering::Relaxed),
                deliveries_in_flight: self.deliveries_in_flight.load(Ordering::Relaxed),
                acked: self.acked.load(Ordering::Relaxed),
                rejected: self.rejected.load(Ordering::Relaxed),
                dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
                dead_letter_failures: self.dead_letter_failures.load(Ordering::Relaxed),
                avg_handler_time_ms: avg,
                handler_time_p50_ms: p50,
                handler_time_p95_ms: p95,
                handler_time_p99_ms: p99,
            },
            uptime_seconds: now.saturating_sub(self.started_at.load(Ordering::Relaxed)),
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub connection: ConnectionMetrics,
    pub publish: PublishMetrics,
    pub consume: ConsumeMetrics,
    pub uptime_seconds: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub reconnects: u64,
    pub connection_duration_seconds: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishMetrics {
    pub messages_published: u64,
    pub publish_failures: u64,
    pub retries: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsumeMetrics {
    pub deliveries_received: u64,
    pub deliveries_in_flight: u64,
    pub acked: u64,
    pub rejected: u64,
    pub dead_lettered: u64,
    pub dead_letter_failures: u64,
    pub avg_handler_time_ms: f64,
    pub handler_time_p50_ms: f64,
    pub handler_time_p95_ms: f64,
    pub handler_time_p99_ms: f64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let index = (percentile / 100.0) * (sorted_data.len() - 1) as f64;
    let lower = sorted_data[index.floor() as usize] as f64;
    let upper = sorted_data[index.ceil() as usize] as f64;
    lower + (upper - lower) * index.fract()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_connection_metrics() {
        let collector = MetricsCollector::new();

        collector.record_connection_attempt();
        collector.record_connection_failure();
        collector.record_connection_attempt();
        collector.record_connection_established();
        collector.set_connected(true);

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.connection.connection_attempts, 2);
        assert_eq!(snapshot.connection.connection_failures, 1);
        assert_eq!(snapshot.connection.connections_established, 1);
        assert!(snapshot.connection.connected);

        collector.set_connected(false);
        assert!(!collector.snapshot().connection.connected);
    }

    #[test]
    fn test_consume_metrics() {
        let collector = MetricsCollector::new();

        collector.record_delivery_received();
        collector.record_delivery_received();
        collector.record_delivery_finished(Duration::from_millis(40));
        collector.record_acked();

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.consume.deliveries_received, 2);
        assert_eq!(snapshot.consume.deliveries_in_flight, 1);
        assert_eq!(snapshot.consume.acked, 1);
        assert!(snapshot.consume.avg_handler_time_ms >= 40.0);
    }

    #[test]
    fn test_in_flight_never_underflows() {
        let collector = MetricsCollector::new();
        collector.record_delivery_finished(Duration::ZERO);
        assert_eq!(collector.snapshot().consume.deliveries_in_flight, 0);
    }

    #[test]
    fn test_handler_window_is_bounded() {
        let collector = MetricsCollector::new();
        for i in 0..1500 {
            collector.record_delivery_finished(Duration::from_millis(i));
        }
        assert_eq!(
            collector.handler_times.lock().unwrap().len(),
            MAX_HANDLER_SAMPLES
        );
    }

    #[test]
    fn test_thread_safety() {
        let collector = Arc::new(MetricsCollector::new());

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let collector = Arc::clone(&collector);
                thread::spawn(move || {
                    for _ in 0..100 {
                        collector.record_published();
                        collector.record_retry();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.publish.messages_published, 1000);
        assert_eq!(snapshot.publish.retries, 1000);
    }

    #[test]
    fn test_percentile_calculation() {
        let data = vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10];

        assert!((percentile(&data, 50.0) - 5.5).abs() < 0.1);
        assert!((percentile(&data, 95.0) - 9.55).abs() < 0.1);
        assert!((percentile(&data, 0.0) - 1.0).abs() < 0.1);
        assert!((percentile(&data, 100.0) - 10.0).abs() < 0.1);
        assert_eq!(percentile(&[], 50.0), 0.0);
    }

    #[test]
    fn test_reset_functionality() {
        let collector = MetricsCollector::new();

        collector.record_published();
        collector.set_connected(true);
        collector.record_delivery_finished(Duration::from_millis(5));

        collector.reset();

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.publish.messages_published, 0);
        assert!(!snapshot.connection.connected);
        assert_eq!(snapshot.consume.avg_handler_time_ms, 0.0);
    }
}
