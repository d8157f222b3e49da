/// Monitoring Module
///
/// In-process metrics for the networking core. Counters are plain atomics
/// updated from hot paths; `snapshot()` produces a serializable view for
/// logs, diagnostics or an external exposer. The core deliberately does not
/// serve HTTP itself.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Running latency aggregate (count / total / min / max).
#[derive(Debug, Default)]
struct LatencyAccumulator {
    count: u64,
    total_micros: u64,
    min_micros: u64,
    max_micros: u64,
}

impl LatencyAccumulator {
    fn observe(&mut self, latency: Duration) {
        let micros = latency.as_micros() as u64;
        self.count += 1;
        self.total_micros += micros;
        self.max_micros = self.max_micros.max(micros);
        self.min_micros = if self.count == 1 {
            micros
        } else {
            self.min_micros.min(micros)
        };
    }

    fn summary(&self) -> LatencySummary {
        LatencySummary {
            count: self.count,
            avg_micros: if self.count == 0 {
                0
            } else {
                self.total_micros / self.count
            },
            min_micros: self.min_micros,
            max_micros: self.max_micros,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LatencySummary {
    pub count: u64,
    pub avg_micros: u64,
    pub min_micros: u64,
    pub max_micros: u64,
}

/// Counters produced by the networking core.
#[derive(Debug, Default)]
pub struct MeshMetrics {
    pub publishes: AtomicU64,
    pub resolves: AtomicU64,
    pub resolve_local_hits: AtomicU64,
    pub resolve_failures: AtomicU64,
    pub verification_failures: AtomicU64,
    pub fetches_served: AtomicU64,
    pub fetch_misses_served: AtomicU64,
    pub gossip_published: AtomicU64,
    pub gossip_received: AtomicU64,
    pub gossip_validation_failures: AtomicU64,
    pub messages_delivered: AtomicU64,
    pub messages_dropped: AtomicU64,
    pub acks_sent: AtomicU64,
    pub provider_refreshes: AtomicU64,
    pub provider_refresh_failures: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    resolve_latency: Mutex<LatencyAccumulator>,
    gossip_latency: Mutex<LatencyAccumulator>,
}

impl MeshMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn observe_resolve_latency(&self, latency: Duration) {
        if let Ok(mut acc) = self.resolve_latency.lock() {
            acc.observe(latency);
        }
    }

    /// Publish-to-receive latency of gossip messages.
    pub fn observe_gossip_latency(&self, latency: Duration) {
        if let Ok(mut acc) = self.gossip_latency.lock() {
            acc.observe(latency);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            publishes: self.publishes.load(Ordering::Relaxed),
            resolves: self.resolves.load(Ordering::Relaxed),
            resolve_local_hits: self.resolve_local_hits.load(Ordering::Relaxed),
            resolve_failures: self.resolve_failures.load(Ordering::Relaxed),
            verification_failures: self.verification_failures.load(Ordering::Relaxed),
            fetches_served: self.fetches_served.load(Ordering::Relaxed),
            fetch_misses_served: self.fetch_misses_served.load(Ordering::Relaxed),
            gossip_published: self.gossip_published.load(Ordering::Relaxed),
            gossip_received: self.gossip_received.load(Ordering::Relaxed),
            gossip_validation_failures: self.gossip_validation_failures.load(Ordering::Relaxed),
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            acks_sent: self.acks_sent.load(Ordering::Relaxed),
            provider_refreshes: self.provider_refreshes.load(Ordering::Relaxed),
            provider_refresh_failures: self.provider_refresh_failures.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            resolve_latency: self
                .resolve_latency
                .lock()
                .map(|acc| acc.summary())
                .unwrap_or_default(),
            gossip_latency: self
                .gossip_latency
                .lock()
                .map(|acc| acc.summary())
                .unwrap_or_default(),
            captured_at: Utc::now(),
        }
    }
}

/// Serializable point-in-time view of every counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub publishes: u64,
    pub resolves: u64,
    pub resolve_local_hits: u64,
    pub resolve_failures: u64,
    pub verification_failures: u64,
    pub fetches_served: u64,
    pub fetch_misses_served: u64,
    pub gossip_published: u64,
    pub gossip_received: u64,
    pub gossip_validation_failures: u64,
    pub messages_delivered: u64,
    pub messages_dropped: u64,
    pub acks_sent: u64,
    pub provider_refreshes: u64,
    pub provider_refresh_failures: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub resolve_latency: LatencySummary,
    pub gossip_latency: LatencySummary,
    pub captured_at: DateTime<Utc>,
}
