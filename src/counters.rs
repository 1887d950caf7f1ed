//! Served-traffic counters reported in heartbeats

use std::sync::atomic::{AtomicU64, Ordering};

/// Source of the heartbeat payload.
///
/// Both counts are non-decreasing within a reporting period. The provider
/// may reset them on rollover; the session treats a drop as a new period.
pub trait Counters: Send + Sync {
    fn current_hit_count(&self) -> u64;
    fn current_byte_count(&self) -> u64;
}

/// Counters fed by the serving layer
#[derive(Debug, Default)]
pub struct ServeCounters {
    hits: AtomicU64,
    bytes: AtomicU64,
}

impl ServeCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one served object
    pub fn record(&self, bytes: u64) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }
}

impl Counters for ServeCounters {
    fn current_hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    fn current_byte_count(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}
