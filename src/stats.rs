//! Statistics tracking for the proxy.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Atomic counters updated by per-query tasks.
pub struct Stats {
    started: Instant,
    requests: AtomicU64,
    cached: AtomicU64,
    forwarded: AtomicU64,
    dropped: AtomicU64,
    /// Cumulative response time in microseconds for averaging.
    total_response_time_us: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            requests: AtomicU64::new(0),
            cached: AtomicU64::new(0),
            forwarded: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            total_response_time_us: AtomicU64::new(0),
        }
    }

    pub fn record_cached(&self, elapsed: Duration) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.cached.fetch_add(1, Ordering::Relaxed);
        self.add_response_time(elapsed);
    }

    pub fn record_forwarded(&self, elapsed: Duration) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.forwarded.fetch_add(1, Ordering::Relaxed);
        self.add_response_time(elapsed);
    }

    /// A query that never got an answer (no upstreams, or all timed out).
    pub fn record_dropped(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    fn add_response_time(&self, elapsed: Duration) {
        self.total_response_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.build_snapshot(|counter| counter.load(Ordering::Relaxed))
    }

    pub fn snapshot_and_reset(&self) -> StatsSnapshot {
        self.build_snapshot(|counter| counter.swap(0, Ordering::Relaxed))
    }

    fn build_snapshot(&self, read: impl Fn(&AtomicU64) -> u64) -> StatsSnapshot {
        let requests = read(&self.requests);
        let cached = read(&self.cached);
        let forwarded = read(&self.forwarded);
        let dropped = read(&self.dropped);
        let total_us = read(&self.total_response_time_us);

        let answered = cached + forwarded;
        let avg_response_ms = if answered > 0 {
            (total_us as f64 / answered as f64) / 1000.0
        } else {
            0.0
        };

        StatsSnapshot {
            uptime_secs: self.started.elapsed().as_secs(),
            requests,
            cached,
            forwarded,
            dropped,
            avg_response_ms,
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsSnapshot {
    pub uptime_secs: u64,
    pub requests: u64,
    pub cached: u64,
    pub forwarded: u64,
    pub dropped: u64,
    /// Mean time to answer, over answered queries only.
    pub avg_response_ms: f64,
}
