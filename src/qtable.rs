/// Q-Routing Table Module
///
/// Single authority for learned peer selection. Each peer accumulates a
/// bounded EMA score fed by observed latency and success/failure of real
/// interactions; whenever several peers could serve a request, the highest
/// score wins. Rows decay out of the table when untouched for too long, so
/// a peer that disappears stops being chosen without explicit removal.
use libp2p::PeerId;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

/// Learning rate of the score EMA
const ALPHA: f64 = 0.2;
/// Latency considered "as bad as it gets" when normalizing rewards
const LATENCY_HORIZON: Duration = Duration::from_secs(1);
/// Score assigned to peers the table has never seen
const NEUTRAL_SCORE: f64 = 0.0;

/// Per-peer learned routing state.
#[derive(Debug, Clone)]
pub struct QEntry {
    pub score: f64,
    pub smoothed_latency: Duration,
    pub success_rate: f64,
    pub bytes_transferred: u64,
    pub last_update: Instant,
    pub updates: u64,
}

impl QEntry {
    fn new() -> Self {
        Self {
            score: NEUTRAL_SCORE,
            smoothed_latency: Duration::ZERO,
            success_rate: 1.0,
            bytes_transferred: 0,
            last_update: Instant::now(),
            updates: 0,
        }
    }
}

/// Reinforcement-learned peer score table.
pub struct QTable {
    entries: RwLock<HashMap<PeerId, QEntry>>,
}

impl QTable {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Feed an observed interaction back into the table.
    ///
    /// Reward is `1 − latency/horizon` (clamped to [0, 1]) on success and
    /// `−1` on failure; the score is a bounded EMA of rewards.
    pub async fn update_route(&self, peer: &PeerId, latency: Duration, success: bool, bytes: u64) {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(*peer).or_insert_with(QEntry::new);

        let reward = if success {
            1.0 - (latency.as_secs_f64() / LATENCY_HORIZON.as_secs_f64()).min(1.0)
        } else {
            -1.0
        };
        entry.score = ((1.0 - ALPHA) * entry.score + ALPHA * reward).clamp(-1.0, 1.0);

        if entry.updates == 0 {
            entry.smoothed_latency = latency;
            entry.success_rate = if success { 1.0 } else { 0.0 };
        } else {
            let prev = entry.smoothed_latency.as_secs_f64();
            entry.smoothed_latency =
                Duration::from_secs_f64((1.0 - ALPHA) * prev + ALPHA * latency.as_secs_f64());
            let outcome = if success { 1.0 } else { 0.0 };
            entry.success_rate = (1.0 - ALPHA) * entry.success_rate + ALPHA * outcome;
        }

        entry.bytes_transferred += bytes;
        entry.last_update = Instant::now();
        entry.updates += 1;

        debug!(
            "route update for {}: score {:.3} success {} latency {:?}",
            peer, entry.score, success, latency
        );
    }

    /// Pick the best-scored candidate; unseen peers carry the neutral prior.
    /// Ties go to the most recently updated entry.
    pub async fn select_best_peer(&self, candidates: &[PeerId]) -> Option<PeerId> {
        if candidates.is_empty() {
            return None;
        }
        let entries = self.entries.read().await;

        let mut best: Option<(&PeerId, f64, Option<Instant>)> = None;
        for candidate in candidates {
            let (score, updated) = match entries.get(candidate) {
                Some(entry) => (entry.score, Some(entry.last_update)),
                None => (NEUTRAL_SCORE, None),
            };
            let better = match &best {
                None => true,
                Some((_, best_score, best_updated)) => {
                    score > *best_score || (score == *best_score && updated > *best_updated)
                }
            };
            if better {
                best = Some((candidate, score, updated));
            }
        }
        best.map(|(peer, _, _)| *peer)
    }

    /// The `n` highest-scored known peers.
    pub async fn get_top_peers(&self, n: usize) -> Vec<(PeerId, f64)> {
        let entries = self.entries.read().await;
        let mut scored: Vec<(PeerId, f64)> =
            entries.iter().map(|(peer, e)| (*peer, e.score)).collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(n);
        scored
    }

    /// Drop rows untouched for longer than `max_age`.
    pub async fn prune_stale(&self, max_age: Duration) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.last_update.elapsed() <= max_age);
        before - entries.len()
    }

    pub async fn get(&self, peer: &PeerId) -> Option<QEntry> {
        self.entries.read().await.get(peer).cloned()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl Default for QTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_successes_raise_score_monotonically() {
        let table = QTable::new();
        let peer = PeerId::random();
        let latency = Duration::from_millis(100);

        table.update_route(&peer, latency, true, 100).await;
        let first = table.get(&peer).await.unwrap().score;

        table.update_route(&peer, latency, true, 100).await;
        let second = table.get(&peer).await.unwrap().score;

        assert!(first > NEUTRAL_SCORE);
        assert!(second >= first);
    }

    #[tokio::test]
    async fn test_failure_lowers_score() {
        let table = QTable::new();
        let peer = PeerId::random();

        table.update_route(&peer, Duration::from_millis(50), true, 0).await;
        let before = table.get(&peer).await.unwrap().score;

        table.update_route(&peer, Duration::from_millis(50), false, 0).await;
        let after = table.get(&peer).await.unwrap().score;

        assert!(after < before);
    }

    #[tokio::test]
    async fn test_score_stays_bounded() {
        let table = QTable::new();
        let peer = PeerId::random();

        for _ in 0..100 {
            table.update_route(&peer, Duration::ZERO, true, 0).await;
        }
        assert!(table.get(&peer).await.unwrap().score <= 1.0);

        for _ in 0..100 {
            table.update_route(&peer, Duration::ZERO, false, 0).await;
        }
        assert!(table.get(&peer).await.unwrap().score >= -1.0);
    }

    #[tokio::test]
    async fn test_select_prefers_higher_score() {
        let table = QTable::new();
        let good = PeerId::random();
        let bad = PeerId::random();

        table.update_route(&good, Duration::from_millis(10), true, 0).await;
        table.update_route(&bad, Duration::from_millis(10), false, 0).await;

        let selected = table.select_best_peer(&[bad, good]).await;
        assert_eq!(selected, Some(good));
    }

    #[tokio::test]
    async fn test_select_with_unknown_candidates() {
        let table = QTable::new();
        let unknown_a = PeerId::random();
        let unknown_b = PeerId::random();

        // Unseen peers carry the neutral prior; someone is still chosen.
        let selected = table.select_best_peer(&[unknown_a, unknown_b]).await;
        assert!(selected == Some(unknown_a) || selected == Some(unknown_b));

        assert_eq!(table.select_best_peer(&[]).await, None);

        // A failing peer scores below the neutral prior, so the unknown wins.
        let failing = PeerId::random();
        table.update_route(&failing, Duration::ZERO, false, 0).await;
        assert_eq!(table.select_best_peer(&[failing, unknown_a]).await, Some(unknown_a));
    }

    #[tokio::test]
    async fn test_top_peers_sorted() {
        let table = QTable::new();
        let peers: Vec<PeerId> = (0..3).map(|_| PeerId::random()).collect();

        table.update_route(&peers[0], Duration::from_millis(500), true, 0).await;
        table.update_route(&peers[1], Duration::from_millis(10), true, 0).await;
        table.update_route(&peers[2], Duration::from_millis(10), false, 0).await;

        let top = table.get_top_peers(2).await;
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].0, peers[1]);
        assert!(top[0].1 >= top[1].1);
    }

    #[tokio::test]
    async fn test_prune_stale_rows() {
        let table = QTable::new();
        let peer = PeerId::random();
        table.update_route(&peer, Duration::from_millis(10), true, 0).await;

        assert_eq!(table.prune_stale(Duration::from_secs(60)).await, 0);
        assert_eq!(table.len().await, 1);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(table.prune_stale(Duration::from_millis(10)).await, 1);
        assert!(table.is_empty().await);
    }
}
