/// Bandwidth QoS Module
///
/// Per-peer byte accounting with burst token buckets and a strict-priority
/// work queue. `check_bandwidth` debits a peer's token allowance and simply
/// answers no when the allowance is exhausted; queued work is drained
/// high-before-normal-before-low, and a full per-priority channel surfaces
/// as a `queue-full` error plus a drop counter rather than backpressure.
use libp2p::PeerId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tracing::debug;

use crate::config::BandwidthConfig;
use crate::error::{MeshError, MeshResult};

/// Smoothing factor for observed byte rates
const RATE_EMA_ALPHA: f64 = 0.3;
/// Cadence of observed-rate recomputation
const RATE_WINDOW: Duration = Duration::from_secs(1);

/// Strict ordering levels for queued work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    High,
    Normal,
    Low,
}

/// Three-level strict-priority queue.
///
/// Dequeue drains high, then normal, then low, and suspends when all three
/// are empty. The suspension is cancellable: dropping the dequeue future
/// (e.g. under `tokio::select!` with a shutdown signal) leaves the queue
/// intact.
pub struct PriorityQueue<T> {
    high: (mpsc::Sender<T>, Mutex<mpsc::Receiver<T>>),
    normal: (mpsc::Sender<T>, Mutex<mpsc::Receiver<T>>),
    low: (mpsc::Sender<T>, Mutex<mpsc::Receiver<T>>),
    item_ready: Notify,
    drops: AtomicU64,
}

impl<T> PriorityQueue<T> {
    pub fn new(depth: usize) -> Self {
        let depth = depth.max(1);
        let (high_tx, high_rx) = mpsc::channel(depth);
        let (normal_tx, normal_rx) = mpsc::channel(depth);
        let (low_tx, low_rx) = mpsc::channel(depth);
        Self {
            high: (high_tx, Mutex::new(high_rx)),
            normal: (normal_tx, Mutex::new(normal_rx)),
            low: (low_tx, Mutex::new(low_rx)),
            item_ready: Notify::new(),
            drops: AtomicU64::new(0),
        }
    }

    fn channel(&self, priority: Priority) -> &mpsc::Sender<T> {
        match priority {
            Priority::High => &self.high.0,
            Priority::Normal => &self.normal.0,
            Priority::Low => &self.low.0,
        }
    }

    /// Enqueue without waiting; a full channel drops the item.
    pub fn enqueue(&self, priority: Priority, item: T) -> MeshResult<()> {
        match self.channel(priority).try_send(item) {
            Ok(()) => {
                self.item_ready.notify_one();
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.drops.fetch_add(1, Ordering::Relaxed);
                Err(MeshError::QueueFull(format!("{:?} queue full", priority)))
            }
            Err(TrySendError::Closed(_)) => {
                Err(MeshError::BadRequest("queue closed".to_string()))
            }
        }
    }

    async fn try_dequeue(&self) -> Option<T> {
        for receiver in [&self.high.1, &self.normal.1, &self.low.1] {
            match receiver.lock().await.try_recv() {
                Ok(item) => return Some(item),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => continue,
            }
        }
        None
    }

    /// Dequeue the next item in strict priority order, suspending while all
    /// levels are empty.
    pub async fn dequeue(&self) -> T {
        loop {
            // Register interest before checking so an enqueue between the
            // check and the await is not lost.
            let notified = self.item_ready.notified();
            if let Some(item) = self.try_dequeue().await {
                return item;
            }
            notified.await;
        }
    }

    /// Items dropped because their channel was full.
    pub fn drop_count(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }
}

struct PeerBandwidth {
    tokens: f64,
    last_refill: Instant,
    upload_rate: f64,
    download_rate: f64,
    window_uploaded: u64,
    window_downloaded: u64,
    window_started: Instant,
    total_uploaded: u64,
    total_downloaded: u64,
}

impl PeerBandwidth {
    fn new(burst: u64) -> Self {
        Self {
            tokens: burst as f64,
            last_refill: Instant::now(),
            upload_rate: 0.0,
            download_rate: 0.0,
            window_uploaded: 0,
            window_downloaded: 0,
            window_started: Instant::now(),
            total_uploaded: 0,
            total_downloaded: 0,
        }
    }
}

/// Snapshot of one peer's bandwidth accounting.
#[derive(Debug, Clone)]
pub struct BandwidthStats {
    pub upload_rate: f64,
    pub download_rate: f64,
    pub total_uploaded: u64,
    pub total_downloaded: u64,
    pub tokens: u64,
}

/// Per-peer bandwidth limiter with observed-rate accounting and a
/// strict-priority outbound work queue.
pub struct BandwidthQoS {
    limit: u64,
    burst: u64,
    refill_interval: Duration,
    peers: RwLock<HashMap<PeerId, Mutex<PeerBandwidth>>>,
    queue: PriorityQueue<QueuedSend>,
}

/// A unit of outbound work held until a sender drains it.
#[derive(Debug)]
pub struct QueuedSend {
    pub peer: PeerId,
    pub bytes: Vec<u8>,
    pub priority: Priority,
}

impl BandwidthQoS {
    pub fn new(config: &BandwidthConfig) -> Self {
        Self {
            limit: config.limit,
            burst: config.burst,
            refill_interval: Duration::from_millis(config.refill_interval_ms.max(1)),
            peers: RwLock::new(HashMap::new()),
            queue: PriorityQueue::new(config.queue_depth),
        }
    }

    async fn ensure_peer(&self, peer: &PeerId) {
        if self.peers.read().await.contains_key(peer) {
            return;
        }
        self.peers
            .write()
            .await
            .entry(*peer)
            .or_insert_with(|| Mutex::new(PeerBandwidth::new(self.burst)));
    }

    fn refill(&self, state: &mut PeerBandwidth) {
        let elapsed = state.last_refill.elapsed();
        if elapsed >= self.refill_interval {
            let ticks = elapsed.as_secs_f64() / self.refill_interval.as_secs_f64();
            let per_tick = self.limit as f64 * self.refill_interval.as_secs_f64();
            state.tokens = (state.tokens + ticks * per_tick).min(self.burst as f64);
            state.last_refill = Instant::now();
        }
    }

    fn roll_rate_window(state: &mut PeerBandwidth) {
        let elapsed = state.window_started.elapsed();
        if elapsed >= RATE_WINDOW {
            let secs = elapsed.as_secs_f64();
            let up = state.window_uploaded as f64 / secs;
            let down = state.window_downloaded as f64 / secs;
            state.upload_rate = (1.0 - RATE_EMA_ALPHA) * state.upload_rate + RATE_EMA_ALPHA * up;
            state.download_rate =
                (1.0 - RATE_EMA_ALPHA) * state.download_rate + RATE_EMA_ALPHA * down;
            state.window_uploaded = 0;
            state.window_downloaded = 0;
            state.window_started = Instant::now();
        }
    }

    /// Debit `n` bytes against the peer's allowance. Returns false when the
    /// allowance is exhausted; the caller decides whether to queue or drop.
    pub async fn check_bandwidth(&self, peer: &PeerId, n: u64) -> bool {
        self.ensure_peer(peer).await;
        let peers = self.peers.read().await;
        let mut state = match peers.get(peer) {
            Some(state) => state.lock().await,
            None => return false,
        };
        self.refill(&mut state);
        if state.tokens >= n as f64 {
            state.tokens -= n as f64;
            true
        } else {
            debug!("bandwidth exhausted for {} ({} requested)", peer, n);
            false
        }
    }

    /// Record bytes sent to a peer.
    pub async fn record_upload(&self, peer: &PeerId, n: u64) {
        self.ensure_peer(peer).await;
        let peers = self.peers.read().await;
        if let Some(state) = peers.get(peer) {
            let mut state = state.lock().await;
            state.total_uploaded += n;
            state.window_uploaded += n;
            Self::roll_rate_window(&mut state);
        }
    }

    /// Record bytes received from a peer.
    pub async fn record_download(&self, peer: &PeerId, n: u64) {
        self.ensure_peer(peer).await;
        let peers = self.peers.read().await;
        if let Some(state) = peers.get(peer) {
            let mut state = state.lock().await;
            state.total_downloaded += n;
            state.window_downloaded += n;
            Self::roll_rate_window(&mut state);
        }
    }

    /// Queue outbound work at a priority level.
    pub fn enqueue(&self, work: QueuedSend) -> MeshResult<()> {
        let priority = work.priority;
        self.queue.enqueue(priority, work)
    }

    /// Drain the next queued work item in strict priority order.
    pub async fn dequeue(&self) -> QueuedSend {
        self.queue.dequeue().await
    }

    pub fn queue_drops(&self) -> u64 {
        self.queue.drop_count()
    }

    pub async fn stats(&self, peer: &PeerId) -> Option<BandwidthStats> {
        let peers = self.peers.read().await;
        let state = peers.get(peer)?;
        let mut state = state.lock().await;
        self.refill(&mut state);
        Some(BandwidthStats {
            upload_rate: state.upload_rate,
            download_rate: state.download_rate,
            total_uploaded: state.total_uploaded,
            total_downloaded: state.total_downloaded,
            tokens: state.tokens as u64,
        })
    }

    /// Drop accounting state for a peer.
    pub async fn remove_peer(&self, peer: &PeerId) {
        self.peers.write().await.remove(peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::time::timeout;

    fn config(limit: u64, burst: u64, depth: usize) -> BandwidthConfig {
        BandwidthConfig {
            limit,
            burst,
            refill_interval_ms: 100,
            queue_depth: depth,
        }
    }

    #[tokio::test]
    async fn test_burst_then_exhaustion() {
        let qos = BandwidthQoS::new(&config(1000, 500, 10));
        let peer = PeerId::random();

        assert!(qos.check_bandwidth(&peer, 500).await);
        assert!(!qos.check_bandwidth(&peer, 100).await);
    }

    #[tokio::test]
    async fn test_tokens_refill_over_time() {
        let qos = BandwidthQoS::new(&config(1000, 500, 10));
        let peer = PeerId::random();

        assert!(qos.check_bandwidth(&peer, 500).await);
        tokio::time::sleep(Duration::from_millis(250)).await;
        // ~250ms at 1000 B/s is ~250 tokens.
        assert!(qos.check_bandwidth(&peer, 100).await);
    }

    #[tokio::test]
    async fn test_strict_priority_ordering() {
        let queue: PriorityQueue<&str> = PriorityQueue::new(10);
        queue.enqueue(Priority::Low, "low-1").unwrap();
        queue.enqueue(Priority::High, "high-1").unwrap();
        queue.enqueue(Priority::Normal, "normal-1").unwrap();
        queue.enqueue(Priority::High, "high-2").unwrap();

        assert_eq!(queue.dequeue().await, "high-1");
        assert_eq!(queue.dequeue().await, "high-2");
        assert_eq!(queue.dequeue().await, "normal-1");
        assert_eq!(queue.dequeue().await, "low-1");
    }

    #[tokio::test]
    async fn test_full_queue_reports_and_counts_drop() {
        let queue: PriorityQueue<u32> = PriorityQueue::new(2);
        queue.enqueue(Priority::Normal, 1).unwrap();
        queue.enqueue(Priority::Normal, 2).unwrap();

        let err = queue.enqueue(Priority::Normal, 3).unwrap_err();
        assert!(matches!(err, MeshError::QueueFull(_)));
        assert_eq!(queue.drop_count(), 1);

        // Other levels are unaffected.
        queue.enqueue(Priority::High, 4).unwrap();
    }

    #[tokio::test]
    async fn test_dequeue_waits_for_enqueue() {
        let queue: Arc<PriorityQueue<u32>> = Arc::new(PriorityQueue::new(4));

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        queue.enqueue(Priority::Low, 7).unwrap();
        let item = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(item, 7);
    }

    #[tokio::test]
    async fn test_qos_queue_drains_sends_in_priority_order() {
        let qos = BandwidthQoS::new(&config(1_000_000, 1_000_000, 4));
        let peer = PeerId::random();

        qos.enqueue(QueuedSend {
            peer,
            bytes: b"background".to_vec(),
            priority: Priority::Low,
        })
        .unwrap();
        qos.enqueue(QueuedSend {
            peer,
            bytes: b"urgent".to_vec(),
            priority: Priority::High,
        })
        .unwrap();

        assert_eq!(qos.dequeue().await.bytes, b"urgent");
        assert_eq!(qos.dequeue().await.bytes, b"background");
        assert_eq!(qos.queue_drops(), 0);
    }

    #[tokio::test]
    async fn test_rate_accounting_snapshot() {
        let qos = BandwidthQoS::new(&config(1_000_000, 1_000_000, 10));
        let peer = PeerId::random();

        qos.record_upload(&peer, 4096).await;
        qos.record_download(&peer, 1024).await;

        let stats = qos.stats(&peer).await.unwrap();
        assert_eq!(stats.total_uploaded, 4096);
        assert_eq!(stats.total_downloaded, 1024);
    }
}
