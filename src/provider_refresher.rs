/// Provider Refresher Module
///
/// DHT provider records expire after their TTL, so a node that keeps
/// content must republish its provider records before then. The refresher
/// tracks every active record, wakes on a ticker, and republishes whatever
/// is due. A failed republish keeps the record due, so it is retried on the
/// next tick rather than dropped.
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::content_id::ContentId;
use crate::error::{MeshError, MeshResult};
use crate::monitoring::MeshMetrics;

/// Production floor for refresh intervals
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Publishes provider records into the DHT. Production wraps the network
/// handle; tests inject fakes.
#[async_trait]
pub trait ProvideBackend: Send + Sync {
    async fn provide(&self, cid: &ContentId) -> MeshResult<()>;
}

/// Tracked state of one provider record.
#[derive(Debug, Clone)]
pub struct ProviderRecord {
    pub cid: ContentId,
    pub provided_at: Instant,
    pub last_refresh: Option<Instant>,
    pub next_refresh: Instant,
    pub refresh_interval: Duration,
    pub refresh_count: u64,
    pub failed_refreshes: u64,
}

/// Periodic republisher of provider records.
pub struct ProviderRefresher {
    backend: Arc<dyn ProvideBackend>,
    refresh_interval: Duration,
    tick: Duration,
    records: RwLock<HashMap<ContentId, ProviderRecord>>,
    metrics: Arc<MeshMetrics>,
}

impl ProviderRefresher {
    pub fn new(
        backend: Arc<dyn ProvideBackend>,
        refresh_interval: Duration,
        metrics: Arc<MeshMetrics>,
    ) -> Self {
        let refresh_interval = refresh_interval.max(MIN_REFRESH_INTERVAL);
        let tick = (refresh_interval / 2).clamp(Duration::from_secs(1), Duration::from_secs(60));
        Self {
            backend,
            refresh_interval,
            tick,
            records: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    /// Test-only constructor accepting intervals below the production floor.
    pub fn with_intervals(
        backend: Arc<dyn ProvideBackend>,
        refresh_interval: Duration,
        tick: Duration,
        metrics: Arc<MeshMetrics>,
    ) -> Self {
        Self {
            backend,
            refresh_interval,
            tick,
            records: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    /// Publish a provider record and start tracking it. Calling twice for
    /// the same content id does not create a duplicate record.
    pub async fn provide(&self, cid: ContentId) -> MeshResult<()> {
        self.backend.provide(&cid).await?;

        let mut records = self.records.write().await;
        records.entry(cid).or_insert_with(|| {
            let now = Instant::now();
            ProviderRecord {
                cid,
                provided_at: now,
                last_refresh: None,
                next_refresh: now + self.refresh_interval,
                refresh_interval: self.refresh_interval,
                refresh_count: 0,
                failed_refreshes: 0,
            }
        });
        Ok(())
    }

    /// Stop tracking a content id.
    pub async fn unprovide(&self, cid: &ContentId) {
        if self.records.write().await.remove(cid).is_some() {
            debug!("stopped refreshing {}", cid);
        }
    }

    /// Republish one record immediately.
    pub async fn force_refresh(&self, cid: &ContentId) -> MeshResult<()> {
        if !self.records.read().await.contains_key(cid) {
            return Err(MeshError::NotFound(format!("{} is not provided", cid)));
        }
        self.refresh_one(cid).await
    }

    /// Change a record's refresh interval. Rejected below the production
    /// floor.
    pub async fn update_interval(&self, cid: &ContentId, interval: Duration) -> MeshResult<()> {
        if interval < MIN_REFRESH_INTERVAL {
            return Err(MeshError::BadRequest(format!(
                "refresh interval {:?} below {:?} floor",
                interval, MIN_REFRESH_INTERVAL
            )));
        }
        let mut records = self.records.write().await;
        let record = records
            .get_mut(cid)
            .ok_or_else(|| MeshError::NotFound(format!("{} is not provided", cid)))?;
        record.refresh_interval = interval;
        record.next_refresh = Instant::now() + interval;
        Ok(())
    }

    pub async fn record(&self, cid: &ContentId) -> Option<ProviderRecord> {
        self.records.read().await.get(cid).cloned()
    }

    pub async fn tracked(&self) -> usize {
        self.records.read().await.len()
    }

    async fn refresh_one(&self, cid: &ContentId) -> MeshResult<()> {
        let result = self.backend.provide(cid).await;

        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(cid) {
            match &result {
                Ok(()) => {
                    let now = Instant::now();
                    record.last_refresh = Some(now);
                    record.next_refresh = now + record.refresh_interval;
                    record.refresh_count += 1;
                    MeshMetrics::incr(&self.metrics.provider_refreshes);
                }
                Err(e) => {
                    // Leave the record due so the next tick retries.
                    record.failed_refreshes += 1;
                    MeshMetrics::incr(&self.metrics.provider_refresh_failures);
                    warn!("refresh of {} failed: {}", cid, e);
                }
            }
        }
        result
    }

    /// Republish every record whose `next_refresh` has passed.
    pub async fn refresh_due(&self) {
        let due: Vec<ContentId> = {
            let now = Instant::now();
            let records = self.records.read().await;
            records
                .values()
                .filter(|record| record.next_refresh <= now)
                .map(|record| record.cid)
                .collect()
        };

        for cid in due {
            // Failures were already recorded; the sweep itself never fails.
            let _ = self.refresh_one(&cid).await;
        }
    }

    /// Spawn the republish ticker; stops when `shutdown` flips.
    pub fn spawn_refresher(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let refresher = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(refresher.tick);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => refresher.refresh_due().await,
                    _ = shutdown.changed() => break,
                }
            }
        })
    }
}
