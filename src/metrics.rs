// src/metrics.rs
use std::sync::atomic::{AtomicU64, Ordering};

/// Engine-wide counters, updated from reactor and pool threads.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub active_conns: AtomicU64,
    pub total_requests: AtomicU64,
    pub bytes_sent: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_conn(&self) {
        self.active_conns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_conn(&self) {
        self.active_conns.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inc_req(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.active_conns.load(Ordering::Relaxed),
            self.total_requests.load(Ordering::Relaxed),
            self.bytes_sent.load(Ordering::Relaxed),
        )
    }
}
