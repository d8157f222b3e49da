/// Vector Clock Module
///
/// Descriptor updates travel over gossip with no total order, so causal
/// ordering between two updates is decided by a per-record vector clock: a
/// map from peer id to monotonically non-decreasing logical time. Update A
/// happened before update B iff every component of A is <= the matching
/// component of B and at least one is strictly smaller. Updates where
/// neither dominates are concurrent; those are real conflicts and get
/// recorded as such before last-writer-wins resolution picks a survivor.
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Per-record causal ordering clock.
///
/// `version` is a single monotonic counter bumped on every local mutation;
/// it is not part of the causal comparison, it exists so callers can cheaply
/// detect "something changed".
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VectorClock {
    entries: HashMap<String, u64>,
    version: u64,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Logical time recorded for a peer, zero if absent.
    pub fn get(&self, peer: &str) -> u64 {
        self.entries.get(peer).copied().unwrap_or(0)
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Advance our own component by one.
    pub fn increment(&mut self, self_id: &str) {
        *self.entries.entry(self_id.to_string()).or_insert(0) += 1;
        self.version += 1;
    }

    /// Merge a received clock: pointwise max, then increment our component.
    pub fn update(&mut self, self_id: &str, received: &VectorClock) {
        for (peer, &time) in &received.entries {
            let entry = self.entries.entry(peer.clone()).or_insert(0);
            if time > *entry {
                *entry = time;
            }
        }
        self.increment(self_id);
    }

    /// Pointwise-max merge without advancing any component.
    pub fn merge(&self, other: &VectorClock) -> VectorClock {
        let mut merged = self.clone();
        for (peer, &time) in &other.entries {
            let entry = merged.entries.entry(peer.clone()).or_insert(0);
            if time > *entry {
                *entry = time;
            }
        }
        merged.version = self.version.max(other.version);
        merged
    }

    /// True iff `self` causally precedes `other`.
    pub fn happens_before(&self, other: &VectorClock) -> bool {
        let mut strictly_smaller = false;
        for (peer, &time) in &self.entries {
            let other_time = other.get(peer);
            if time > other_time {
                return false;
            }
            if time < other_time {
                strictly_smaller = true;
            }
        }
        // Components present only in `other` make it strictly larger there.
        if !strictly_smaller {
            strictly_smaller = other
                .entries
                .iter()
                .any(|(peer, &time)| time > 0 && self.get(peer) < time);
        }
        strictly_smaller
    }

    /// True iff neither clock causally precedes the other.
    pub fn concurrent_with(&self, other: &VectorClock) -> bool {
        !self.happens_before(other) && !other.happens_before(self) && self.entries != other.entries
    }
}

/// A single descriptor mutation as carried on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescriptorUpdate {
    /// Updated descriptor payload
    pub payload: Vec<u8>,
    /// Causal position of this update
    pub clock: VectorClock,
    /// Hex hash of the update this one supersedes, empty for the first
    pub previous_hash: String,
    /// Hex signature over the payload by the updater
    pub signature: String,
    /// Peer id of the updater
    pub updater_id: String,
    /// Unix seconds at creation
    pub timestamp: i64,
}

impl DescriptorUpdate {
    /// Last-writer-wins comparison: larger timestamp wins, ties broken by
    /// lexicographically larger updater id so every replica converges on the
    /// same survivor.
    fn wins_over(&self, other: &DescriptorUpdate) -> bool {
        match self.timestamp.cmp(&other.timestamp) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => self.updater_id > other.updater_id,
        }
    }
}

/// Outcome of offering an update to an [`UpdateHistory`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The update causally superseded the previous latest.
    Applied,
    /// The update was causally older than the current latest and was dropped.
    Stale,
    /// The update was concurrent with the current latest; the conflict was
    /// recorded and last-writer-wins picked the survivor.
    ConflictResolved,
}

/// Tracks the latest accepted update for one descriptor plus every detected
/// conflict pair.
#[derive(Debug, Default)]
pub struct UpdateHistory {
    latest: Option<DescriptorUpdate>,
    conflicts: Vec<(DescriptorUpdate, DescriptorUpdate)>,
}

impl UpdateHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self) -> Option<&DescriptorUpdate> {
        self.latest.as_ref()
    }

    pub fn conflicts(&self) -> &[(DescriptorUpdate, DescriptorUpdate)] {
        &self.conflicts
    }

    /// Offer an update; decides causally, falling back to last-writer-wins
    /// for concurrent updates.
    pub fn apply(&mut self, update: DescriptorUpdate) -> ApplyOutcome {
        let current = match self.latest.take() {
            None => {
                self.latest = Some(update);
                return ApplyOutcome::Applied;
            }
            Some(current) => current,
        };

        if current.clock.happens_before(&update.clock) {
            self.latest = Some(update);
            ApplyOutcome::Applied
        } else if update.clock.happens_before(&current.clock) {
            self.latest = Some(current);
            ApplyOutcome::Stale
        } else {
            let winner = if update.wins_over(&current) {
                update.clone()
            } else {
                current.clone()
            };
            self.conflicts.push((current, update));
            self.latest = Some(winner);
            ApplyOutcome::ConflictResolved
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(updater: &str, clock: VectorClock, timestamp: i64) -> DescriptorUpdate {
        DescriptorUpdate {
            payload: b"descriptor".to_vec(),
            clock,
            previous_hash: String::new(),
            signature: String::new(),
            updater_id: updater.to_string(),
            timestamp,
        }
    }

    #[test]
    fn test_update_establishes_happens_before() {
        let mut a = VectorClock::new();
        a.increment("a");

        let mut b = VectorClock::new();
        b.increment("b");
        b.update("b", &a);

        assert!(a.happens_before(&b));
        assert!(!b.happens_before(&a));
    }

    #[test]
    fn test_clock_is_not_before_itself() {
        let mut a = VectorClock::new();
        a.increment("a");
        assert!(!a.happens_before(&a));
        assert!(!a.concurrent_with(&a));
    }

    #[test]
    fn test_concurrent_clocks() {
        let mut a = VectorClock::new();
        a.increment("a");
        let mut b = VectorClock::new();
        b.increment("b");

        assert!(a.concurrent_with(&b));
        assert!(b.concurrent_with(&a));
    }

    #[test]
    fn test_merge_commutative_and_associative() {
        let mut a = VectorClock::new();
        a.increment("a");
        a.increment("a");
        let mut b = VectorClock::new();
        b.increment("b");
        let mut c = VectorClock::new();
        c.increment("c");

        let ab = a.merge(&b);
        let ba = b.merge(&a);
        assert_eq!(ab.entries, ba.entries);

        let ab_c = a.merge(&b).merge(&c);
        let a_bc = a.merge(&b.merge(&c));
        assert_eq!(ab_c.entries, a_bc.entries);
    }

    #[test]
    fn test_history_applies_causal_successor() {
        let mut history = UpdateHistory::new();

        let mut clock1 = VectorClock::new();
        clock1.increment("a");
        assert_eq!(history.apply(update("a", clock1.clone(), 100)), ApplyOutcome::Applied);

        let mut clock2 = clock1.clone();
        clock2.update("b", &clock1);
        assert_eq!(history.apply(update("b", clock2, 101)), ApplyOutcome::Applied);
        assert_eq!(history.latest().unwrap().updater_id, "b");

        // Replaying the old update is stale.
        assert_eq!(history.apply(update("a", clock1, 100)), ApplyOutcome::Stale);
        assert!(history.conflicts().is_empty());
    }

    #[test]
    fn test_concurrent_updates_resolve_by_timestamp() {
        let mut history = UpdateHistory::new();

        let mut clock_a = VectorClock::new();
        clock_a.increment("a");
        let mut clock_b = VectorClock::new();
        clock_b.increment("b");

        history.apply(update("a", clock_a, 100));
        assert_eq!(
            history.apply(update("b", clock_b, 200)),
            ApplyOutcome::ConflictResolved
        );
        assert_eq!(history.latest().unwrap().updater_id, "b");
        assert_eq!(history.conflicts().len(), 1);
    }

    #[test]
    fn test_timestamp_tie_breaks_lexicographically() {
        let mut history = UpdateHistory::new();

        let mut clock_a = VectorClock::new();
        clock_a.increment("aaa");
        let mut clock_b = VectorClock::new();
        clock_b.increment("zzz");

        history.apply(update("aaa", clock_a, 100));
        history.apply(update("zzz", clock_b, 100));
        // Same second, so the lexicographically larger updater id survives.
        assert_eq!(history.latest().unwrap().updater_id, "zzz");
    }
}
