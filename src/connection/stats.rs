//! Connection statistics tracking

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Atomic counters for connection lifecycle events
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Connections registered by the manager
    total_accepted: AtomicU64,
    /// Connections unregistered again
    released: AtomicU64,
    /// Connections refused by the acceptance policy
    rejected: AtomicU64,
    /// Read or write deadlines that expired
    timeouts: AtomicU64,
    /// Connections dropped for exceeding the packet budget
    rate_limited: AtomicU64,
}

impl ConnectionStats {
    /// Create new connection statistics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_accepted(&self) {
        self.total_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_released(&self) {
        self.released.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    /// Total connections ever registered
    #[must_use]
    pub fn total_accepted(&self) -> u64 {
        self.total_accepted.load(Ordering::Relaxed)
    }

    /// Total connections unregistered
    #[must_use]
    pub fn released(&self) -> u64 {
        self.released.load(Ordering::Relaxed)
    }

    /// Connections refused by the acceptance policy
    #[must_use]
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Expired read or write deadlines
    #[must_use]
    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    /// Connections dropped by the rate limiter
    #[must_use]
    pub fn rate_limited(&self) -> u64 {
        self.rate_limited.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all counters
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_accepted: self.total_accepted(),
            released: self.released(),
            rejected: self.rejected(),
            timeouts: self.timeouts(),
            rate_limited: self.rate_limited(),
        }
    }
}

/// Snapshot of connection statistics at a point in time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Total connections registered
    pub total_accepted: u64,
    /// Total connections unregistered
    pub released: u64,
    /// Connections refused by policy
    pub rejected: u64,
    /// Expired deadlines
    pub timeouts: u64,
    /// Rate-limiter drops
    pub rate_limited: u64,
}
