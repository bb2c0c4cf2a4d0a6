//! Thread-safe metrics for one device client
//!
//! Atomic counters for high-frequency events plus a bounded, mutex-protected
//! sample of throttle waits. One collector is created per device connection
//! and shared through `Arc`; there is no process-wide instance.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Throttle wait samples kept for percentile calculation
const MAX_WAIT_SAMPLES: usize = 1000;

/// Counters for one device connection
pub struct ClientMetrics {
    // Publish path
    publishes_attempted: AtomicU64,
    publishes_succeeded: AtomicU64,
    publishes_failed: AtomicU64,
    throttled_publishes: AtomicU64,
    throttle_wait_total_ms: AtomicU64,
    throttle_waits: Mutex<Vec<u64>>,

    // Command path
    commands_received: AtomicU64,
    decode_errors: AtomicU64,
    acks_dispatched: AtomicU64,
    acks_dropped: AtomicU64,
    acks_failed: AtomicU64,

    // Connection
    connected: AtomicBool,
    connection_losses: AtomicU64,

    started_at: u64,
}

impl ClientMetrics {
    pub fn new() -> Self {
        Self {
            publishes_attempted: AtomicU64::new(0),
            publishes_succeeded: AtomicU64::new(0),
            publishes_failed: AtomicU64::new(0),
            throttled_publishes: AtomicU64::new(0),
            throttle_wait_total_ms: AtomicU64::new(0),
            throttle_waits: Mutex::new(Vec::new()),
            commands_received: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            acks_dispatched: AtomicU64::new(0),
            acks_dropped: AtomicU64::new(0),
            acks_failed: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            connection_losses: AtomicU64::new(0),
            started_at: current_timestamp(),
        }
    }

    // Publish metrics
    pub fn publish_attempted(&self) {
        self.publishes_attempted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publish_succeeded(&self) {
        self.publishes_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publish_failed(&self) {
        self.publishes_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record time a caller spent suspended by the rate regulator
    pub fn throttle_waited(&self, wait: Duration) {
        let millis = wait.as_millis() as u64;
        self.throttled_publishes.fetch_add(1, Ordering::Relaxed);
        self.throttle_wait_total_ms
            .fetch_add(millis, Ordering::Relaxed);

        if let Ok(mut waits) = self.throttle_waits.lock() {
            waits.push(millis);
            if waits.len() > MAX_WAIT_SAMPLES {
                waits.remove(0);
            }
        }
    }

    // Command metrics
    pub fn command_received(&self) {
        self.commands_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ack_dispatched(&self) {
        self.acks_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ack_dropped(&self) {
        self.acks_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ack_failed(&self) {
        self.acks_failed.fetch_add(1, Ordering::Relaxed);
    }

    // Connection metrics
    pub fn connection_established(&self) {
        self.connected.store(true, Ordering::Relaxed);
    }

    pub fn connection_lost(&self) {
        self.connected.store(false, Ordering::Relaxed);
        self.connection_losses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connected.store(false, Ordering::Relaxed);
    }

    /// Throttle wait statistics as (p50, p95, max) in milliseconds
    fn throttle_wait_statistics(&self) -> (f64, f64, u64) {
        let Ok(waits) = self.throttle_waits.lock() else {
            return (0.0, 0.0, 0);
        };
        if waits.is_empty() {
            return (0.0, 0.0, 0);
        }

        let mut sorted = waits.clone();
        sorted.sort_unstable();
        let max = sorted.last().copied().unwrap_or_default();
        (percentile(&sorted, 50.0), percentile(&sorted, 95.0), max)
    }

    /// Get complete metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let (wait_p50, wait_p95, wait_max) = self.throttle_wait_statistics();

        MetricsSnapshot {
            publish: PublishMetrics {
                attempted: self.publishes_attempted.load(Ordering::Relaxed),
                succeeded: self.publishes_succeeded.load(Ordering::Relaxed),
                failed: self.publishes_failed.load(Ordering::Relaxed),
                throttled: self.throttled_publishes.load(Ordering::Relaxed),
                throttle_wait_total_ms: self.throttle_wait_total_ms.load(Ordering::Relaxed),
                throttle_wait_p50_ms: wait_p50,
                throttle_wait_p95_ms: wait_p95,
                throttle_wait_max_ms: wait_max,
            },
            commands: CommandMetrics {
                received: self.commands_received.load(Ordering::Relaxed),
                decode_errors: self.decode_errors.load(Ordering::Relaxed),
                acks_dispatched: self.acks_dispatched.load(Ordering::Relaxed),
                acks_dropped: self.acks_dropped.load(Ordering::Relaxed),
                acks_failed: self.acks_failed.load(Ordering::Relaxed),
            },
            connection: ConnectionMetrics {
                connected: self.connected.load(Ordering::Relaxed),
                losses: self.connection_losses.load(Ordering::Relaxed),
            },
            uptime_seconds: now.saturating_sub(self.started_at),
            timestamp: now,
        }
    }
}

impl Default for ClientMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub publish: PublishMetrics,
    pub commands: CommandMetrics,
    pub connection: ConnectionMetrics,
    pub uptime_seconds: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishMetrics {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub throttled: u64,
    pub throttle_wait_total_ms: u64,
    pub throttle_wait_p50_ms: f64,
    pub throttle_wait_p95_ms: f64,
    pub throttle_wait_max_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandMetrics {
    pub received: u64,
    pub decode_errors: u64,
    pub acks_dispatched: u64,
    pub acks_dropped: u64,
    pub acks_failed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionMetrics {
    pub connected: bool,
    pub losses: u64,
}

// Helper functions
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

    let len = sorted_data.len();
    let index = (percentile / 100.0) * (len - 1) as f64;

    if index.fract() == 0.0 {
        sorted_data[index as usize] as f64
    } else {
        let lower_index = index.floor() as usize;
        let upper_index = index.ceil() as usize;
        let lower_value = sorted_data[lower_index] as f64;
        let upper_value = sorted_data[upper_index] as f64;

        lower_value + (upper_value - lower_value) * index.fract()
    }
}
