//! Per-connection counters and command latency tracking
//!
//! Each [`HsmConnection`](crate::connection::HsmConnection) owns one
//! [`ConnectionMetrics`]; nothing here is global.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

const MAX_LATENCY_SAMPLES: usize = 1000;

/// Thread-safe counters using atomics, latencies behind a mutex
#[derive(Debug, Default)]
pub struct ConnectionMetrics {
    connect_attempts: AtomicU64,
    connections_established: AtomicU64,
    link_failures: AtomicU64,
    reconnect_attempts: AtomicU64,
    reconnect_successes: AtomicU64,
    reconnect_exhaustions: AtomicU64,
    state_transitions: AtomicU64,
    commands_sent: AtomicU64,
    commands_failed: AtomicU64,
    command_latencies: Mutex<Vec<u64>>, // microseconds
}

impl ConnectionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect_attempt(&self) {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
    }

    pub fn link_failed(&self) {
        self.link_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconnect_succeeded(&self) {
        self.reconnect_successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconnect_exhausted(&self) {
        self.reconnect_exhaustions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn state_changed(&self) {
        self.state_transitions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_completed(&self, latency: Duration) {
        self.commands_sent.fetch_add(1, Ordering::Relaxed);
        self.record_latency(latency);
    }

    pub fn command_failed(&self) {
        self.commands_failed.fetch_add(1, Ordering::Relaxed);
    }

    fn record_latency(&self, latency: Duration) {
        if let Ok(mut samples) = self.command_latencies.lock() {
            samples.push(latency.as_micros() as u64);
            if samples.len() > MAX_LATENCY_SAMPLES {
                samples.remove(0);
            }
        }
    }

    fn latency_statistics(&self) -> LatencyStats {
        let Ok(samples) = self.command_latencies.lock() else {
            return LatencyStats::default();
        };
        if samples.is_empty() {
            return LatencyStats::default();
        }

        let mut sorted = samples.clone();
        drop(samples);
        sorted.sort_unstable();

        LatencyStats {
            avg_us: sorted.iter().sum::<u64>() as f64 / sorted.len() as f64,
            p50_us: percentile(&sorted, 50.0),
            p95_us: percentile(&sorted, 95.0),
            p99_us: percentile(&sorted, 99.0),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            connections_established: self.connections_established.load(Ordering::Relaxed),
            link_failures: self.link_failures.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            reconnect_successes: self.reconnect_successes.load(Ordering::Relaxed),
            reconnect_exhaustions: self.reconnect_exhaustions.load(Ordering::Relaxed),
            state_transitions: self.state_transitions.load(Ordering::Relaxed),
            commands_sent: self.commands_sent.load(Ordering::Relaxed),
            commands_failed: self.commands_failed.load(Ordering::Relaxed),
            latency: self.latency_statistics(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LatencyStats {
    pub avg_us: f64,
    pub p50_us: f64,
    pub p95_us: f64,
    pub p99_us: f64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub connect_attempts: u64,
    pub connections_established: u64,
    pub link_failures: u64,
    pub reconnect_attempts: u64,
    pub reconnect_successes: u64,
    pub reconnect_exhaustions: u64,
    pub state_transitions: u64,
    pub commands_sent: u64,
    pub commands_failed: u64,
    pub latency: LatencyStats,
    pub timestamp: DateTime<Utc>,
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
