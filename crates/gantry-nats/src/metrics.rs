//! Counters for the NATS adapters.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct NatsMetrics {
    pub events_published: AtomicU64,
    pub publish_failures: AtomicU64,
    pub bytes_published: AtomicU64,
    pub evaluations_enqueued: AtomicU64,
    pub evaluations_dequeued: AtomicU64,
    pub messages_dlq: AtomicU64,
    pub locks_acquired: AtomicU64,
    /// Acquisitions refused because another holder had a live lease.
    pub locks_contended: AtomicU64,
    /// Current connection state (0 = disconnected, 1 = connected).
    pub connected: AtomicU64,
}

impl NatsMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_publish(&self, bytes: u64) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
        self.bytes_published.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_publish_failure(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_enqueue(&self) {
        self.evaluations_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dequeue(&self) {
        self.evaluations_dequeued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dlq(&self) {
        self.messages_dlq.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock(&self, acquired: bool) {
        if acquired {
            self.locks_acquired.fetch_add(1, Ordering::Relaxed);
        } else {
            self.locks_contended.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_published: self.events_published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            bytes_published: self.bytes_published.load(Ordering::Relaxed),
            evaluations_enqueued: self.evaluations_enqueued.load(Ordering::Relaxed),
            evaluations_dequeued: self.evaluations_dequeued.load(Ordering::Relaxed),
            messages_dlq: self.messages_dlq.load(Ordering::Relaxed),
            locks_acquired: self.locks_acquired.load(Ordering::Relaxed),
            locks_contended: self.locks_contended.load(Ordering::Relaxed),
            connected: self.connected.load(Ordering::Relaxed) == 1,
        }
    }
}

/// A point-in-time snapshot of metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub events_published: u64,
    pub publish_failures: u64,
    pub bytes_published: u64,
    pub evaluations_enqueued: u64,
    pub evaluations_dequeued: u64,
    pub messages_dlq: u64,
    pub locks_acquired: u64,
    pub locks_contended: u64,
    pub connected: bool,
}
