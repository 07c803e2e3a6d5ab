//! Logging setup and in-process counters

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber. `RUST_LOG` overrides the default `info` level.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Metrics handle for recording counters
#[derive(Debug, Default)]
pub struct Metrics {
    events_published: AtomicU64,
    events_rejected: AtomicU64,
    publish_failures: AtomicU64,
    messages_acked: AtomicU64,
    messages_nacked: AtomicU64,
    bytes_downloaded: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_published(&self) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "events_published", "Metric incremented");
    }

    pub fn event_rejected(&self) {
        self.events_rejected.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "events_rejected", "Metric incremented");
    }

    pub fn publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "publish_failures", "Metric incremented");
    }

    pub fn message_acked(&self) {
        self.messages_acked.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "messages_acked", "Metric incremented");
    }

    pub fn message_nacked(&self) {
        self.messages_nacked.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "messages_nacked", "Metric incremented");
    }

    pub fn bytes_downloaded(&self, bytes: u64) {
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_published: self.events_published.load(Ordering::Relaxed),
            events_rejected: self.events_rejected.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            messages_acked: self.messages_acked.load(Ordering::Relaxed),
            messages_nacked: self.messages_nacked.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub events_published: u64,
    pub events_rejected: u64,
    pub publish_failures: u64,
    pub messages_acked: u64,
    pub messages_nacked: u64,
    pub bytes_downloaded: u64,
}
