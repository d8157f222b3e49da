/// Health Monitor Module
///
/// Heartbeat-based failure detector for monitored peers. A check simply
/// confirms the transport still holds an active connection to the peer (the
/// probe is injected, so tests can fail peers at will). Consecutive failures
/// past the threshold mark a peer unhealthy; recovery is automatic on the
/// next successful check. Latency is tracked as an exponential moving
/// average of probe round-trips.
use async_trait::async_trait;
use futures::future::join_all;
use libp2p::PeerId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::HealthConfig;
use crate::error::MeshResult;

/// Smoothing factor for probe latency
const LATENCY_EMA_ALPHA: f64 = 0.2;

/// Confirms an active transport connection to a peer exists.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn probe(&self, peer: &PeerId) -> MeshResult<()>;
}

/// Tracked health state for one monitored peer.
#[derive(Debug, Clone)]
pub struct PeerHealth {
    pub peer_id: PeerId,
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub last_check: Option<Instant>,
    pub last_success: Option<Instant>,
    pub avg_latency: Duration,
    pub total_checks: u64,
}

impl PeerHealth {
    fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            healthy: true,
            consecutive_failures: 0,
            last_check: None,
            last_success: None,
            avg_latency: Duration::ZERO,
            total_checks: 0,
        }
    }
}

/// Aggregate snapshot across all monitored peers.
#[derive(Debug, Clone, Default)]
pub struct HealthStats {
    pub monitored: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub total_checks: u64,
}

/// Per-peer heartbeat with a consecutive-failure threshold.
pub struct HealthMonitor {
    probe: Arc<dyn ConnectivityProbe>,
    interval: Duration,
    check_timeout: Duration,
    failure_threshold: u32,
    peers: RwLock<HashMap<PeerId, PeerHealth>>,
}

impl HealthMonitor {
    pub fn new(probe: Arc<dyn ConnectivityProbe>, config: &HealthConfig) -> Self {
        Self {
            probe,
            interval: Duration::from_secs(config.heartbeat_secs.max(1)),
            check_timeout: Duration::from_secs(config.check_timeout_secs.max(1)),
            failure_threshold: config.failure_threshold.max(1),
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Test-only constructor taking raw durations below the config floor.
    pub fn with_intervals(
        probe: Arc<dyn ConnectivityProbe>,
        interval: Duration,
        check_timeout: Duration,
        failure_threshold: u32,
    ) -> Self {
        Self {
            probe,
            interval,
            check_timeout,
            failure_threshold: failure_threshold.max(1),
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Begin monitoring a peer. Peers start healthy until proven otherwise.
    pub async fn monitor_peer(&self, peer: PeerId) {
        self.peers
            .write()
            .await
            .entry(peer)
            .or_insert_with(|| PeerHealth::new(peer));
    }

    /// Stop monitoring a peer and drop its state.
    pub async fn unmonitor_peer(&self, peer: &PeerId) {
        self.peers.write().await.remove(peer);
    }

    /// Run one check against a peer and fold the outcome into its state.
    pub async fn check_peer(&self, peer: &PeerId) {
        let started = Instant::now();
        let outcome = tokio::time::timeout(self.check_timeout, self.probe.probe(peer)).await;
        let latency = started.elapsed();
        let success = matches!(outcome, Ok(Ok(())));

        let mut peers = self.peers.write().await;
        let entry = match peers.get_mut(peer) {
            Some(entry) => entry,
            None => return, // unmonitored between snapshot and completion
        };
        entry.total_checks += 1;
        entry.last_check = Some(Instant::now());

        if success {
            entry.consecutive_failures = 0;
            entry.last_success = Some(Instant::now());
            entry.avg_latency = if entry.avg_latency.is_zero() {
                latency
            } else {
                Duration::from_secs_f64(
                    (1.0 - LATENCY_EMA_ALPHA) * entry.avg_latency.as_secs_f64()
                        + LATENCY_EMA_ALPHA * latency.as_secs_f64(),
                )
            };
            if !entry.healthy {
                debug!("peer {} recovered", peer);
            }
            entry.healthy = true;
        } else {
            entry.consecutive_failures += 1;
            if entry.consecutive_failures >= self.failure_threshold && entry.healthy {
                warn!(
                    "peer {} marked unhealthy after {} consecutive failures",
                    peer, entry.consecutive_failures
                );
                entry.healthy = false;
            }
        }
    }

    /// Run one check round over every monitored peer.
    pub async fn check_all(&self) {
        let peers: Vec<PeerId> = self.peers.read().await.keys().copied().collect();
        join_all(peers.iter().map(|peer| self.check_peer(peer))).await;
    }

    pub async fn get_health(&self, peer: &PeerId) -> Option<PeerHealth> {
        self.peers.read().await.get(peer).cloned()
    }

    pub async fn get_healthy_peers(&self) -> Vec<PeerId> {
        self.peers
            .read()
            .await
            .values()
            .filter(|h| h.healthy)
            .map(|h| h.peer_id)
            .collect()
    }

    pub async fn get_unhealthy_peers(&self) -> Vec<PeerId> {
        self.peers
            .read()
            .await
            .values()
            .filter(|h| !h.healthy)
            .map(|h| h.peer_id)
            .collect()
    }

    pub async fn stats(&self) -> HealthStats {
        let peers = self.peers.read().await;
        let healthy = peers.values().filter(|h| h.healthy).count();
        HealthStats {
            monitored: peers.len(),
            healthy,
            unhealthy: peers.len() - healthy,
            total_checks: peers.values().map(|h| h.total_checks).sum(),
        }
    }

    /// Spawn the periodic heartbeat loop; stops when `shutdown` flips.
    pub fn spawn_monitor(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => monitor.check_all().await,
                    _ = shutdown.changed() => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MeshError;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Probe whose outcome is flipped by the test.
    struct SwitchProbe {
        up: AtomicBool,
    }

    impl SwitchProbe {
        fn new(up: bool) -> Self {
            Self {
                up: AtomicBool::new(up),
            }
        }
        fn set_up(&self, up: bool) {
            self.up.store(up, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ConnectivityProbe for SwitchProbe {
        async fn probe(&self, _peer: &PeerId) -> MeshResult<()> {
            if self.up.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(MeshError::Transport("no active connection".to_string()))
            }
        }
    }

    fn monitor(probe: Arc<SwitchProbe>, threshold: u32) -> HealthMonitor {
        HealthMonitor::with_intervals(
            probe,
            Duration::from_millis(50),
            Duration::from_millis(100),
            threshold,
        )
    }

    #[tokio::test]
    async fn test_failures_cross_threshold() {
        let probe = Arc::new(SwitchProbe::new(false));
        let monitor = monitor(Arc::clone(&probe), 2);
        let peer = PeerId::random();
        monitor.monitor_peer(peer).await;

        monitor.check_peer(&peer).await;
        assert!(monitor.get_health(&peer).await.unwrap().healthy);

        monitor.check_peer(&peer).await;
        let health = monitor.get_health(&peer).await.unwrap();
        assert!(!health.healthy);
        assert_eq!(health.consecutive_failures, 2);
        assert_eq!(monitor.get_unhealthy_peers().await, vec![peer]);
    }

    #[tokio::test]
    async fn test_single_success_recovers() {
        let probe = Arc::new(SwitchProbe::new(false));
        let monitor = monitor(Arc::clone(&probe), 2);
        let peer = PeerId::random();
        monitor.monitor_peer(peer).await;

        monitor.check_peer(&peer).await;
        monitor.check_peer(&peer).await;
        assert!(!monitor.get_health(&peer).await.unwrap().healthy);

        probe.set_up(true);
        monitor.check_peer(&peer).await;
        let health = monitor.get_health(&peer).await.unwrap();
        assert!(health.healthy);
        assert_eq!(health.consecutive_failures, 0);
        assert!(health.last_success.is_some());
    }

    #[tokio::test]
    async fn test_background_monitor_detects_disconnect() {
        let probe = Arc::new(SwitchProbe::new(true));
        let monitor = Arc::new(HealthMonitor::with_intervals(
            Arc::clone(&probe) as Arc<dyn ConnectivityProbe>,
            Duration::from_millis(50),
            Duration::from_millis(100),
            2,
        ));
        let peer = PeerId::random();
        monitor.monitor_peer(peer).await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = monitor.spawn_monitor(shutdown_rx);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(monitor.get_health(&peer).await.unwrap().healthy);

        // Disconnect: within ~150ms the threshold of 2 is crossed.
        probe.set_up(false);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!monitor.get_health(&peer).await.unwrap().healthy);

        let _ = shutdown_tx.send(true);
        let _ = handle.await;
    }

    #[tokio::test]
    async fn test_stats_snapshot() {
        let probe = Arc::new(SwitchProbe::new(true));
        let monitor = monitor(probe, 3);
        let a = PeerId::random();
        let b = PeerId::random();
        monitor.monitor_peer(a).await;
        monitor.monitor_peer(b).await;

        monitor.check_all().await;
        let stats = monitor.stats().await;
        assert_eq!(stats.monitored, 2);
        assert_eq!(stats.healthy, 2);
        assert_eq!(stats.total_checks, 2);

        monitor.unmonitor_peer(&a).await;
        assert_eq!(monitor.stats().await.monitored, 1);
    }
}
