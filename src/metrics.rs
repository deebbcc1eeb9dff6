use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of the admission counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AdmissionMetrics {
    pub total_requests: u64,
    pub admitted_requests: u64,
    pub throttled_requests: u64,
    pub exempt_requests: u64,
    pub fail_open_requests: u64,
    pub fail_closed_requests: u64,
}

/// Lock-free admission counters shared by every request.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    total: AtomicU64,
    admitted: AtomicU64,
    throttled: AtomicU64,
    exempt: AtomicU64,
    fail_open: AtomicU64,
    fail_closed: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_admitted(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.admitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_throttled(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.throttled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_exempt(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.exempt.fetch_add(1, Ordering::Relaxed);
    }

    /// Store failure resolved by admitting.
    pub fn record_fail_open(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.fail_open.fetch_add(1, Ordering::Relaxed);
    }

    /// Store failure resolved by denying.
    pub fn record_fail_closed(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.fail_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> AdmissionMetrics {
        AdmissionMetrics {
            total_requests: self.total.load(Ordering::Relaxed),
            admitted_requests: self.admitted.load(Ordering::Relaxed),
            throttled_requests: self.throttled.load(Ordering::Relaxed),
            exempt_requests: self.exempt.load(Ordering::Relaxed),
            fail_open_requests: self.fail_open.load(Ordering::Relaxed),
            fail_closed_requests: self.fail_closed.load(Ordering::Relaxed),
        }
    }
}
