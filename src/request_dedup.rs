/// Request Deduplication Module
///
/// Single-flight cache for expensive lookups. Concurrent calls for the same
/// key coalesce onto one underlying computation through a broadcast slot;
/// completed values live in a TTL cache until they expire or the cache hits
/// its size cap, at which point the soonest-expiring entry is evicted.
/// Errors are broadcast to waiting callers but never cached, so the next
/// caller retries the computation.
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::time::Instant;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::DedupConfig;
use crate::error::{MeshError, MeshResult};

struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
    hits: u64,
}

/// Statistics snapshot for observability and tests.
#[derive(Debug, Clone, Default)]
pub struct DedupStats {
    pub cached_entries: usize,
    pub in_flight: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Single-flight request coalescer with a TTL result cache.
pub struct RequestDeduplicator<V: Clone + Send + 'static> {
    ttl: Duration,
    max_size: usize,
    cleanup_interval: Duration,
    cache: Mutex<HashMap<String, CacheEntry<V>>>,
    in_flight: Mutex<HashMap<String, broadcast::Sender<Result<V, String>>>>,
    stats: Mutex<DedupStats>,
}

impl<V: Clone + Send + 'static> RequestDeduplicator<V> {
    pub fn new(config: &DedupConfig) -> Self {
        Self {
            ttl: Duration::from_secs(config.ttl_secs),
            max_size: config.max_size.max(1),
            cleanup_interval: Duration::from_secs(config.cleanup_interval_secs.max(1)),
            cache: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            stats: Mutex::new(DedupStats::default()),
        }
    }

    /// Run `compute` for `key` unless a cached value is live or another call
    /// for the same key is already in flight, in which case the shared
    /// result is returned.
    ///
    /// Cancellation-safe for waiters: a follower that is dropped simply
    /// stops listening; the in-flight computation is owned by the first
    /// caller.
    pub async fn run<F, Fut>(&self, key: &str, compute: F) -> MeshResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = MeshResult<V>>,
    {
        // Fast path: live cache entry.
        if let Some(value) = self.cached(key).await {
            return Ok(value);
        }

        // Either join an in-flight computation or become its leader.
        let mut receiver = {
            let mut in_flight = self.in_flight.lock().await;

            // The leader may have completed between the cache check and
            // taking the lock.
            if let Some(value) = self.cached(key).await {
                return Ok(value);
            }

            match in_flight.get(key) {
                Some(sender) => Some(sender.subscribe()),
                None => {
                    let (sender, _) = broadcast::channel(1);
                    in_flight.insert(key.to_string(), sender);
                    None
                }
            }
        };

        if let Some(receiver) = receiver.as_mut() {
            return match receiver.recv().await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(message)) => Err(MeshError::Generic(message)),
                Err(_) => Err(MeshError::Cancelled(format!(
                    "in-flight computation for {:?} abandoned",
                    key
                ))),
            };
        }

        self.stats.lock().await.misses += 1;
        let result = compute().await;

        // Publish to followers and settle the cache before releasing the key.
        let broadcast_payload = match &result {
            Ok(value) => Ok(value.clone()),
            Err(e) => Err(e.to_string()),
        };
        if let Ok(value) = &result {
            self.insert(key, value.clone()).await;
        }
        if let Some(sender) = self.in_flight.lock().await.remove(key) {
            let _ = sender.send(broadcast_payload);
        }

        result
    }

    async fn cached(&self, key: &str) -> Option<V> {
        let mut cache = self.cache.lock().await;
        let entry = cache.get_mut(key)?;
        if Instant::now() >= entry.expires_at {
            cache.remove(key);
            return None;
        }
        entry.hits += 1;
        let value = entry.value.clone();
        drop(cache);
        self.stats.lock().await.hits += 1;
        Some(value)
    }

    async fn insert(&self, key: &str, value: V) {
        let mut cache = self.cache.lock().await;
        if cache.len() >= self.max_size && !cache.contains_key(key) {
            // Evict the entry closest to expiry.
            if let Some(soonest) = cache
                .iter()
                .min_by_key(|(_, entry)| entry.expires_at)
                .map(|(k, _)| k.clone())
            {
                debug!("dedup cache full, evicting {:?}", soonest);
                cache.remove(&soonest);
            }
        }
        cache.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: Instant::now() + self.ttl,
                hits: 0,
            },
        );
    }

    /// Drop one cached key.
    pub async fn invalidate(&self, key: &str) {
        self.cache.lock().await.remove(key);
    }

    /// Drop every cached key starting with `prefix`.
    pub async fn invalidate_prefix(&self, prefix: &str) {
        self.cache
            .lock()
            .await
            .retain(|key, _| !key.starts_with(prefix));
    }

    /// Remove expired entries. Called by the background sweeper.
    pub async fn cleanup_expired(&self) -> usize {
        let mut cache = self.cache.lock().await;
        let before = cache.len();
        let now = Instant::now();
        cache.retain(|_, entry| entry.expires_at > now);
        before - cache.len()
    }

    pub async fn stats(&self) -> DedupStats {
        let mut stats = self.stats.lock().await.clone();
        stats.cached_entries = self.cache.lock().await.len();
        stats.in_flight = self.in_flight.lock().await.len();
        stats
    }

    /// Spawn the periodic expired-entry sweep; stops when `shutdown` flips.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let dedup = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(dedup.cleanup_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = dedup.cleanup_expired().await;
                        if removed > 0 {
                            debug!("dedup sweep removed {} expired entries", removed);
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }
}
