use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub webhooks_received: u64,
    pub webhooks_rejected: u64,
    pub messages_ingested: u64,
    pub duplicates_skipped: u64,
    pub events_forwarded: u64,
    pub relay_failures: u64,
    pub sends_succeeded: u64,
    pub sends_failed: u64,
}

#[derive(Debug)]
pub struct MetricsStore {
    start_time: Instant,
    webhooks_received: AtomicU64,
    webhooks_rejected: AtomicU64,
    messages_ingested: AtomicU64,
    duplicates_skipped: AtomicU64,
    events_forwarded: AtomicU64,
    relay_failures: AtomicU64,
    sends_succeeded: AtomicU64,
    sends_failed: AtomicU64,
}

impl MetricsStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Instant::now(),
            webhooks_received: AtomicU64::new(0),
            webhooks_rejected: AtomicU64::new(0),
            messages_ingested: AtomicU64::new(0),
            duplicates_skipped: AtomicU64::new(0),
            events_forwarded: AtomicU64::new(0),
            relay_failures: AtomicU64::new(0),
            sends_succeeded: AtomicU64::new(0),
            sends_failed: AtomicU64::new(0),
        })
    }

    pub fn inc_webhooks_received(&self) {
        self.webhooks_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Authenticated webhook deliveries that could not be read or parsed.
    pub fn inc_webhooks_rejected(&self) {
        self.webhooks_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_messages_ingested(&self) {
        self.messages_ingested.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_duplicates_skipped(&self) {
        self.duplicates_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_relay(&self, forwarded: bool) {
        if forwarded {
            self.events_forwarded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.relay_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_send(&self, success: bool) {
        if success {
            self.sends_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.sends_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.start_time.elapsed().as_secs(),
            webhooks_received: self.webhooks_received.load(Ordering::Relaxed),
            webhooks_rejected: self.webhooks_rejected.load(Ordering::Relaxed),
            messages_ingested: self.messages_ingested.load(Ordering::Relaxed),
            duplicates_skipped: self.duplicates_skipped.load(Ordering::Relaxed),
            events_forwarded: self.events_forwarded.load(Ordering::Relaxed),
            relay_failures: self.relay_failures.load(Ordering::Relaxed),
            sends_succeeded: self.sends_succeeded.load(Ordering::Relaxed),
            sends_failed: self.sends_failed.load(Ordering::Relaxed),
        }
    }
}
