/// Flow Control Module
///
/// Rate limiting and in-flight bounding for outbound traffic. Two
/// primitives compose into the per-node flow controller:
///
/// - `TokenBucket`: a refillable credit pool. `take(n)` suspends on a fixed
///   refill tick until enough credit accumulates; dropping the returned
///   future (e.g. via `tokio::time::timeout`) cancels the wait.
/// - `SendWindow`: a cap on outstanding un-acknowledged messages per peer,
///   with a monotonic message-id counter tracking each in-flight send.
///
/// `FlowController` owns one global bucket plus lazily-created per-peer
/// buckets and windows. A send that returns success has already reserved
/// its bytes against both the global and the per-peer bucket, in that
/// order.
use libp2p::PeerId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::debug;

use crate::config::FlowConfig;
use crate::error::{MeshError, MeshResult};

/// Fixed refill tick for token buckets
const REFILL_TICK: Duration = Duration::from_millis(100);

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Refillable credit pool shaping a byte rate with burst tolerance.
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// A bucket that starts full.
    pub fn new(capacity: u64, refill_rate: u64) -> Self {
        Self {
            capacity: capacity as f64,
            refill_rate: refill_rate as f64,
            state: Mutex::new(BucketState {
                tokens: capacity as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill_locked(&self, state: &mut BucketState) {
        let elapsed = state.last_refill.elapsed();
        if elapsed >= REFILL_TICK {
            state.tokens =
                (state.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.capacity);
            state.last_refill = Instant::now();
        }
    }

    /// Take `n` tokens, suspending on the refill tick until available.
    ///
    /// Cancellation is cooperative: dropping the future (for example from a
    /// surrounding `tokio::time::timeout`) abandons the wait without
    /// consuming tokens.
    pub async fn take(&self, n: u64) -> MeshResult<()> {
        let needed = n as f64;
        if needed > self.capacity {
            return Err(MeshError::FlowLimit(format!(
                "request of {} exceeds bucket capacity {}",
                n, self.capacity
            )));
        }

        loop {
            {
                let mut state = self.state.lock().await;
                self.refill_locked(&mut state);
                if state.tokens >= needed {
                    state.tokens -= needed;
                    return Ok(());
                }
            }
            tokio::time::sleep(REFILL_TICK).await;
        }
    }

    /// Non-blocking take.
    pub async fn try_take(&self, n: u64) -> bool {
        let needed = n as f64;
        let mut state = self.state.lock().await;
        self.refill_locked(&mut state);
        if state.tokens >= needed {
            state.tokens -= needed;
            true
        } else {
            false
        }
    }

    /// Current token count, after refill.
    pub async fn available(&self) -> u64 {
        let mut state = self.state.lock().await;
        self.refill_locked(&mut state);
        state.tokens as u64
    }
}

struct WindowState {
    in_flight: u32,
    next_id: u64,
    outstanding: HashMap<u64, Instant>,
}

/// Cap on outstanding un-acknowledged messages.
pub struct SendWindow {
    window_size: Mutex<u32>,
    state: Mutex<WindowState>,
    slot_freed: Notify,
}

impl SendWindow {
    pub fn new(window_size: u32) -> Self {
        Self {
            window_size: Mutex::new(window_size.max(1)),
            state: Mutex::new(WindowState {
                in_flight: 0,
                next_id: 0,
                outstanding: HashMap::new(),
            }),
            slot_freed: Notify::new(),
        }
    }

    /// Claim a slot without waiting; fails when the window is full.
    pub async fn send(&self) -> MeshResult<u64> {
        let window = *self.window_size.lock().await;
        let mut state = self.state.lock().await;
        if state.in_flight >= window {
            return Err(MeshError::FlowLimit(format!(
                "send window full ({} in flight)",
                state.in_flight
            )));
        }
        Ok(Self::issue(&mut state))
    }

    /// Claim a slot, suspending until one frees. Cancellable by dropping the
    /// future.
    pub async fn acquire(&self) -> u64 {
        loop {
            {
                let window = *self.window_size.lock().await;
                let mut state = self.state.lock().await;
                if state.in_flight < window {
                    return Self::issue(&mut state);
                }
            }
            self.slot_freed.notified().await;
        }
    }

    fn issue(state: &mut WindowState) -> u64 {
        let id = state.next_id;
        state.next_id += 1;
        state.in_flight += 1;
        state.outstanding.insert(id, Instant::now());
        id
    }

    /// Acknowledge a previously issued message id, freeing its slot.
    pub async fn ack(&self, id: u64) -> MeshResult<()> {
        let mut state = self.state.lock().await;
        if state.outstanding.remove(&id).is_none() {
            return Err(MeshError::BadRequest(format!("unknown message id {}", id)));
        }
        state.in_flight -= 1;
        drop(state);
        self.slot_freed.notify_one();
        Ok(())
    }

    /// Resize the window. Only positive sizes are accepted; growing the
    /// window wakes waiting senders.
    pub async fn adjust_window(&self, new_size: u32) -> MeshResult<()> {
        if new_size == 0 {
            return Err(MeshError::BadRequest(
                "window size must be positive".to_string(),
            ));
        }
        *self.window_size.lock().await = new_size;
        self.slot_freed.notify_waiters();
        Ok(())
    }

    pub async fn in_flight(&self) -> u32 {
        self.state.lock().await.in_flight
    }
}

struct PeerFlow {
    bucket: Arc<TokenBucket>,
    window: Arc<SendWindow>,
}

/// Per-peer and global rate limiting plus in-flight bounding.
pub struct FlowController {
    global: Arc<TokenBucket>,
    per_peer_rate: u64,
    bucket_capacity: u64,
    window_size: u32,
    peers: RwLock<HashMap<PeerId, PeerFlow>>,
}

impl FlowController {
    pub fn new(config: &FlowConfig) -> Self {
        Self {
            global: Arc::new(TokenBucket::new(config.bucket_capacity, config.global_rate)),
            per_peer_rate: config.per_peer_rate,
            bucket_capacity: config.bucket_capacity,
            window_size: config.window_size,
            peers: RwLock::new(HashMap::new()),
        }
    }

    async fn peer_bucket(&self, peer: &PeerId) -> Arc<TokenBucket> {
        if let Some(flow) = self.peers.read().await.get(peer) {
            return Arc::clone(&flow.bucket);
        }
        let mut peers = self.peers.write().await;
        let flow = peers.entry(*peer).or_insert_with(|| PeerFlow {
            bucket: Arc::new(TokenBucket::new(self.bucket_capacity, self.per_peer_rate)),
            window: Arc::new(SendWindow::new(self.window_size)),
        });
        Arc::clone(&flow.bucket)
    }

    async fn peer_window(&self, peer: &PeerId) -> Arc<SendWindow> {
        if let Some(flow) = self.peers.read().await.get(peer) {
            return Arc::clone(&flow.window);
        }
        let mut peers = self.peers.write().await;
        let flow = peers.entry(*peer).or_insert_with(|| PeerFlow {
            bucket: Arc::new(TokenBucket::new(self.bucket_capacity, self.per_peer_rate)),
            window: Arc::new(SendWindow::new(self.window_size)),
        });
        Arc::clone(&flow.window)
    }

    /// Reserve `n_bytes` against the global bucket, then the peer bucket.
    /// Suspends until both grants succeed; cancel by dropping the future.
    pub async fn allow_send(&self, peer: &PeerId, n_bytes: u64) -> MeshResult<()> {
        self.global.take(n_bytes).await?;
        self.peer_bucket(peer).await.take(n_bytes).await
    }

    /// Claim an in-flight slot toward `peer`, returning the message id.
    pub async fn acquire_window(&self, peer: &PeerId) -> u64 {
        self.peer_window(peer).await.acquire().await
    }

    /// Release a previously acquired in-flight slot.
    pub async fn release_window(&self, peer: &PeerId, id: u64) -> MeshResult<()> {
        self.peer_window(peer).await.ack(id).await
    }

    /// Drop all flow state for a peer.
    pub async fn remove_peer(&self, peer: &PeerId) {
        if self.peers.write().await.remove(peer).is_some() {
            debug!("removed flow state for {}", peer);
        }
    }

    /// Number of peers with live flow state.
    pub async fn tracked_peers(&self) -> usize {
        self.peers.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn flow_config(per_peer_rate: u64, capacity: u64) -> FlowConfig {
        FlowConfig {
            global_rate: 10 * 1024 * 1024,
            per_peer_rate,
            bucket_capacity: capacity,
            window_size: 4,
        }
    }

    #[tokio::test]
    async fn test_bucket_starts_full_and_drains() {
        let bucket = TokenBucket::new(1000, 100);
        assert!(bucket.try_take(600).await);
        assert!(bucket.try_take(400).await);
        assert!(!bucket.try_take(1).await);
    }

    #[tokio::test]
    async fn test_take_waits_for_refill() {
        let bucket = TokenBucket::new(100, 1000);
        bucket.take(100).await.unwrap();

        // 100 more tokens need ~100ms at 1000/s.
        let start = Instant::now();
        bucket.take(100).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_take_beyond_capacity_rejected() {
        let bucket = TokenBucket::new(100, 1000);
        assert!(bucket.take(101).await.is_err());
    }

    #[tokio::test]
    async fn test_conservation_over_window() {
        // Over any window, grants never exceed capacity + rate * elapsed.
        let bucket = TokenBucket::new(200, 1000);
        let start = Instant::now();
        let mut granted: u64 = 0;
        while start.elapsed() < Duration::from_millis(300) {
            if bucket.try_take(50).await {
                granted += 50;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let budget = 200 + (start.elapsed().as_secs_f64() * 1000.0) as u64 + 50;
        assert!(granted <= budget, "granted {} > budget {}", granted, budget);
    }

    #[tokio::test]
    async fn test_send_window_bound() {
        let window = SendWindow::new(2);
        let id1 = window.send().await.unwrap();
        let _id2 = window.send().await.unwrap();
        assert!(window.send().await.is_err());
        assert_eq!(window.in_flight().await, 2);

        window.ack(id1).await.unwrap();
        assert_eq!(window.in_flight().await, 1);
        assert!(window.send().await.is_ok());
    }

    #[tokio::test]
    async fn test_ack_unknown_id_rejected() {
        let window = SendWindow::new(2);
        assert!(window.ack(42).await.is_err());
    }

    #[tokio::test]
    async fn test_adjust_window_rejects_zero() {
        let window = SendWindow::new(2);
        assert!(window.adjust_window(0).await.is_err());
        assert!(window.adjust_window(8).await.is_ok());
    }

    #[tokio::test]
    async fn test_acquire_waits_until_ack() {
        let window = Arc::new(SendWindow::new(1));
        let id = window.acquire().await;

        let waiter = {
            let window = Arc::clone(&window);
            tokio::spawn(async move { window.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        window.ack(id).await.unwrap();
        timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_throttled_second_send_times_out() {
        // 500 B/s with a 500 B burst: the burst goes through, the next 100
        // bytes cannot arrive within a 100 ms deadline.
        let controller = FlowController::new(&flow_config(500, 500));
        let peer = PeerId::random();

        controller.allow_send(&peer, 500).await.unwrap();
        let second = timeout(
            Duration::from_millis(100),
            controller.allow_send(&peer, 100),
        )
        .await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn test_remove_peer_frees_state() {
        let controller = FlowController::new(&flow_config(1000, 1000));
        let peer = PeerId::random();
        controller.allow_send(&peer, 10).await.unwrap();
        assert_eq!(controller.tracked_peers().await, 1);

        controller.remove_peer(&peer).await;
        assert_eq!(controller.tracked_peers().await, 0);
    }
}
