//! Engine counters

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub connections_attempted: AtomicU64,
    pub connections_succeeded: AtomicU64,
    pub connections_failed: AtomicU64,
    pub recoveries: AtomicU64,
    pub breaker_trips: AtomicU64,
    pub heartbeat_timeouts: AtomicU64,
    pub device_invalidations: AtomicU64,
    pub simulator_failures: AtomicU64,
    pub total_downtime_ms: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_connect_attempt(&self) {
        self.connections_attempted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_connect_success(&self) {
        self.connections_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_connect_failure(&self) {
        self.connections_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_recovery(&self) {
        self.recoveries.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_breaker_trip(&self) {
        self.breaker_trips.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_heartbeat_timeout(&self) {
        self.heartbeat_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_device_invalidation(&self) {
        self.device_invalidations.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_simulator_failure(&self) {
        self.simulator_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_downtime(&self, duration: Duration) {
        self.total_downtime_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    /// Summary string for logging
    pub fn summary(&self) -> String {
        format!(
            "connects={}/{} failed={} recoveries={} trips={} hb_timeouts={} invalidations={} sim_failures={} downtime_ms={}",
            self.connections_succeeded.load(Ordering::Relaxed),
            self.connections_attempted.load(Ordering::Relaxed),
            self.connections_failed.load(Ordering::Relaxed),
            self.recoveries.load(Ordering::Relaxed),
            self.breaker_trips.load(Ordering::Relaxed),
            self.heartbeat_timeouts.load(Ordering::Relaxed),
            self.device_invalidations.load(Ordering::Relaxed),
            self.simulator_failures.load(Ordering::Relaxed),
            self.total_downtime_ms.load(Ordering::Relaxed),
        )
    }
}
