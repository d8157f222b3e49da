/// Connection Pool Module
///
/// Per-peer table of reusable stream slots with idle eviction. The actual
/// transport connection lives inside the libp2p swarm; what the pool owns
/// is the stream handles layered on top, keyed by peer and protocol so a
/// pooled content-exchange stream is never handed to a caller asking for
/// the Q-routing protocol. Opening goes through an injectable
/// `StreamFactory`, which in production wraps the swarm's stream control
/// and in tests is a fake, making reuse observable through the pool's
/// counters.
use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncWrite};
use libp2p::PeerId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::PoolConfig;
use crate::error::{MeshError, MeshResult};

/// Object-safe alias for pooled byte streams.
pub trait PoolableStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> PoolableStream for T {}

/// A pooled (or freshly opened) stream handle.
pub type MeshStream = Box<dyn PoolableStream>;

/// Opens protocol streams to peers. Production wraps
/// `libp2p_stream::Control`; tests inject fakes.
#[async_trait]
pub trait StreamFactory: Send + Sync {
    async fn open_stream(&self, peer: PeerId, protocol: &str) -> MeshResult<MeshStream>;
}

struct PooledConnection {
    idle: HashMap<String, Vec<MeshStream>>,
    last_used: Instant,
}

impl PooledConnection {
    fn new() -> Self {
        Self {
            idle: HashMap::new(),
            last_used: Instant::now(),
        }
    }

    fn idle_count(&self) -> usize {
        self.idle.values().map(Vec::len).sum()
    }
}

/// Counter snapshot for observability and tests.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub peers: usize,
    pub idle_streams: usize,
    pub streams_opened: u64,
    pub streams_reused: u64,
    pub streams_discarded: u64,
    pub connections_evicted: u64,
}

/// Peer connection table with reusable stream slots and idle eviction.
pub struct ConnectionPool {
    factory: Arc<dyn StreamFactory>,
    max_idle: Duration,
    max_streams_per_conn: usize,
    cleanup_interval: Duration,
    connections: Mutex<HashMap<PeerId, PooledConnection>>,
    closed: AtomicBool,
    streams_opened: AtomicU64,
    streams_reused: AtomicU64,
    streams_discarded: AtomicU64,
    connections_evicted: AtomicU64,
}

impl ConnectionPool {
    pub fn new(factory: Arc<dyn StreamFactory>, config: &PoolConfig) -> Self {
        Self {
            factory,
            max_idle: Duration::from_secs(config.max_idle_secs),
            max_streams_per_conn: config.max_streams_per_conn.max(1),
            cleanup_interval: Duration::from_secs(config.cleanup_interval_secs.max(1)),
            connections: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            streams_opened: AtomicU64::new(0),
            streams_reused: AtomicU64::new(0),
            streams_discarded: AtomicU64::new(0),
            connections_evicted: AtomicU64::new(0),
        }
    }

    /// Get a stream to `peer` speaking `protocol`, reusing an idle one when
    /// available.
    pub async fn get_stream(&self, peer: &PeerId, protocol: &str) -> MeshResult<MeshStream> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MeshError::BadRequest("connection pool is closed".to_string()));
        }

        {
            let mut connections = self.connections.lock().await;
            let conn = connections.entry(*peer).or_insert_with(PooledConnection::new);
            conn.last_used = Instant::now();
            if let Some(stream) = conn.idle.get_mut(protocol).and_then(Vec::pop) {
                self.streams_reused.fetch_add(1, Ordering::Relaxed);
                debug!("reusing pooled stream to {} for {}", peer, protocol);
                return Ok(stream);
            }
        }

        // No idle stream; open outside the lock.
        let stream = self.factory.open_stream(*peer, protocol).await?;
        self.streams_opened.fetch_add(1, Ordering::Relaxed);
        Ok(stream)
    }

    /// Return a still-usable stream to the pool. Streams beyond the
    /// per-connection cap are dropped (closing them).
    pub async fn release_stream(&self, peer: &PeerId, protocol: &str, stream: MeshStream) {
        if self.closed.load(Ordering::SeqCst) {
            self.streams_discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let mut connections = self.connections.lock().await;
        let conn = connections.entry(*peer).or_insert_with(PooledConnection::new);
        conn.last_used = Instant::now();
        if conn.idle_count() < self.max_streams_per_conn {
            conn.idle.entry(protocol.to_string()).or_default().push(stream);
        } else {
            self.streams_discarded.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drop a peer's pooled state entirely.
    pub async fn remove_peer(&self, peer: &PeerId) {
        if self.connections.lock().await.remove(peer).is_some() {
            debug!("removed pooled connection for {}", peer);
        }
    }

    /// Evict connections idle longer than `max_idle`. Called by the sweeper.
    pub async fn evict_idle(&self) -> usize {
        let mut connections = self.connections.lock().await;
        let before = connections.len();
        let max_idle = self.max_idle;
        connections.retain(|peer, conn| {
            let keep = conn.last_used.elapsed() <= max_idle;
            if !keep {
                debug!("evicting idle connection to {}", peer);
            }
            keep
        });
        let evicted = before - connections.len();
        self.connections_evicted
            .fetch_add(evicted as u64, Ordering::Relaxed);
        evicted
    }

    /// Close the pool: drops every pooled stream exactly once and refuses
    /// further use.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut connections = self.connections.lock().await;
        let peers = connections.len();
        connections.clear();
        info!("connection pool closed ({} peers)", peers);
    }

    pub async fn stats(&self) -> PoolStats {
        let connections = self.connections.lock().await;
        PoolStats {
            peers: connections.len(),
            idle_streams: connections.values().map(PooledConnection::idle_count).sum(),
            streams_opened: self.streams_opened.load(Ordering::Relaxed),
            streams_reused: self.streams_reused.load(Ordering::Relaxed),
            streams_discarded: self.streams_discarded.load(Ordering::Relaxed),
            connections_evicted: self.connections_evicted.load(Ordering::Relaxed),
        }
    }

    /// Spawn the periodic idle sweep; stops when `shutdown` flips.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.cleanup_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = pool.evict_idle().await;
                        if evicted > 0 {
                            debug!("pool sweep evicted {} idle connections", evicted);
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// Inert stream used to exercise pooling logic.
    struct FakeStream;

    impl AsyncRead for FakeStream {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut [u8],
        ) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Ok(0))
        }
    }

    impl AsyncWrite for FakeStream {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }
        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    struct FakeFactory {
        opened: AtomicU64,
    }

    impl FakeFactory {
        fn new() -> Self {
            Self {
                opened: AtomicU64::new(0),
            }
        }
    }

    #[async_trait]
    impl StreamFactory for FakeFactory {
        async fn open_stream(&self, _peer: PeerId, _protocol: &str) -> MeshResult<MeshStream> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeStream))
        }
    }

    fn pool_config(max_streams: usize) -> PoolConfig {
        PoolConfig {
            max_idle_secs: 300,
            max_streams_per_conn: max_streams,
            cleanup_interval_secs: 60,
        }
    }

    #[tokio::test]
    async fn test_released_stream_is_reused() {
        let factory = Arc::new(FakeFactory::new());
        let pool = ConnectionPool::new(factory.clone(), &pool_config(10));
        let peer = PeerId::random();

        let stream = pool.get_stream(&peer, "/proto/1").await.unwrap();
        pool.release_stream(&peer, "/proto/1", stream).await;

        let _again = pool.get_stream(&peer, "/proto/1").await.unwrap();
        let stats = pool.stats().await;
        assert_eq!(stats.streams_opened, 1);
        assert_eq!(stats.streams_reused, 1);
        assert_eq!(factory.opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reuse_is_per_protocol() {
        let pool = ConnectionPool::new(Arc::new(FakeFactory::new()), &pool_config(10));
        let peer = PeerId::random();

        let stream = pool.get_stream(&peer, "/proto/a").await.unwrap();
        pool.release_stream(&peer, "/proto/a", stream).await;

        // Different protocol must not receive the pooled stream.
        let _other = pool.get_stream(&peer, "/proto/b").await.unwrap();
        let stats = pool.stats().await;
        assert_eq!(stats.streams_opened, 2);
        assert_eq!(stats.streams_reused, 0);
    }

    #[tokio::test]
    async fn test_release_beyond_capacity_discards() {
        let pool = ConnectionPool::new(Arc::new(FakeFactory::new()), &pool_config(1));
        let peer = PeerId::random();

        let first = pool.get_stream(&peer, "/proto/1").await.unwrap();
        let second = pool.get_stream(&peer, "/proto/1").await.unwrap();
        pool.release_stream(&peer, "/proto/1", first).await;
        pool.release_stream(&peer, "/proto/1", second).await;

        let stats = pool.stats().await;
        assert_eq!(stats.idle_streams, 1);
        assert_eq!(stats.streams_discarded, 1);
    }

    #[tokio::test]
    async fn test_idle_eviction() {
        let factory = Arc::new(FakeFactory::new());
        let config = PoolConfig {
            max_idle_secs: 0,
            max_streams_per_conn: 10,
            cleanup_interval_secs: 60,
        };
        let pool = ConnectionPool::new(factory, &config);
        let peer = PeerId::random();

        let stream = pool.get_stream(&peer, "/proto/1").await.unwrap();
        pool.release_stream(&peer, "/proto/1", stream).await;

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.evict_idle().await, 1);
        assert_eq!(pool.stats().await.peers, 0);
    }

    #[tokio::test]
    async fn test_close_is_exactly_once_and_final() {
        let pool = ConnectionPool::new(Arc::new(FakeFactory::new()), &pool_config(10));
        let peer = PeerId::random();
        let stream = pool.get_stream(&peer, "/proto/1").await.unwrap();
        pool.release_stream(&peer, "/proto/1", stream).await;

        pool.close().await;
        pool.close().await; // idempotent
        assert!(pool.get_stream(&peer, "/proto/1").await.is_err());
    }
}
