use rand::seq::SliceRandom as _;
use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use super::session::PeerKey;
use crate::config::Config;

/// Choke and interest flags of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChokingState {
    /// We refuse to serve the peer.
    pub am_choking: bool,
    /// We want pieces the peer has.
    pub am_interested: bool,
    /// The peer refuses to serve us.
    pub peer_choking: bool,
    /// The peer wants pieces we have.
    pub peer_interested: bool,
}

impl Default for ChokingState {
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

/// A peer as seen by the choker at one round.
#[derive(Debug, Clone, Copy)]
pub struct ChokeCandidate {
    pub key: PeerKey,
    /// Whether the peer is interested in us.
    pub interested: bool,
    pub am_choking: bool,
    /// Bytes exchanged since the previous round: received while
    /// downloading, sent while seeding.
    pub rate: u64,
}

/// Tit-for-tat choker with optimistic unchoke slots.
#[derive(Debug)]
pub struct Choker {
    unchoked_peers: usize,
    optimistic_peers: usize,
    unchoke_interval: Duration,
    optimistic_interval: Duration,
    next_round: Instant,
    next_optimistic: Instant,
    optimistic: BTreeSet<PeerKey>,
}

impl Choker {
    /// Creates a choker whose first round is due at `now`.
    pub fn new(config: &Config, now: Instant) -> Self {
        Self {
            unchoked_peers: config.unchoked_peers,
            optimistic_peers: config.optimistic_unchoked_peers,
            unchoke_interval: config.unchoke_interval,
            optimistic_interval: config.optimistic_unchoke_interval,
            next_round: now,
            next_optimistic: now,
            optimistic: BTreeSet::new(),
        }
    }

    /// Drops a disconnected peer from the optimistic set.
    pub fn remove_peer(&mut self, key: PeerKey) {
        self.optimistic.remove(&key);
    }

    /// Runs a round if one is due, returning `(peer, unchoke)` only for peers
    /// whose state must flip. `None` means no round was due.
    pub fn tick(
        &mut self,
        now: Instant,
        candidates: &[ChokeCandidate],
    ) -> Option<Vec<(PeerKey, bool)>> {
        if now < self.next_round {
            return None;
        }
        self.next_round = now + self.unchoke_interval;

        let mut interested: Vec<&ChokeCandidate> =
            candidates.iter().filter(|c| c.interested).collect();
        interested.sort_by(|a, b| b.rate.cmp(&a.rate).then(a.key.cmp(&b.key)));

        let regular: BTreeSet<PeerKey> = interested
            .iter()
            .take(self.unchoked_peers)
            .map(|c| c.key)
            .collect();

        self.optimistic
            .retain(|key| interested.iter().any(|c| c.key == *key) && !regular.contains(key));
        if now >= self.next_optimistic {
            self.next_optimistic = now + self.optimistic_interval;
            let mut pool: Vec<PeerKey> = interested
                .iter()
                .map(|c| c.key)
                .filter(|key| !regular.contains(key))
                .collect();
            pool.shuffle(&mut rand::rng());
            self.optimistic = pool.into_iter().take(self.optimistic_peers).collect();
        }

        let flips = candidates
            .iter()
            .filter_map(|c| {
                let unchoke = regular.contains(&c.key) || self.optimistic.contains(&c.key);
                (unchoke == c.am_choking).then_some((c.key, unchoke))
            })
            .collect();
        Some(flips)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(key: PeerKey, interested: bool, rate: u64) -> ChokeCandidate {
        ChokeCandidate {
            key,
            interested,
            am_choking: true,
            rate,
        }
    }

    #[test]
    fn test_fastest_interested_peers_are_unchoked() {
        let config = Config {
            unchoked_peers: 2,
            optimistic_unchoked_peers: 0,
            ..Config::default()
        };
        let now = Instant::now();
        let mut choker = Choker::new(&config, now);
        let keys: Vec<PeerKey> = (0..4).map(|_| PeerKey::next()).collect();
        let candidates = [
            candidate(keys[0], true, 10),
            candidate(keys[1], true, 500),
            candidate(keys[2], false, 900),
            candidate(keys[3], true, 300),
        ];

        let mut decisions = choker.tick(now, &candidates).unwrap();
        decisions.sort();
        assert_eq!(decisions, vec![(keys[1], true), (keys[3], true)]);

        // Not due yet.
        assert!(choker.tick(now + Duration::from_secs(1), &candidates).is_none());
    }

    #[test]
    fn test_only_flips_are_reported() {
        let config = Config {
            unchoked_peers: 1,
            optimistic_unchoked_peers: 0,
            ..Config::default()
        };
        let now = Instant::now();
        let mut choker = Choker::new(&config, now);
        let a = PeerKey::next();
        let b = PeerKey::next();

        let candidates = [
            ChokeCandidate {
                key: a,
                interested: true,
                am_choking: false,
                rate: 1,
            },
            candidate(b, true, 100),
        ];
        let mut decisions = choker.tick(now, &candidates).unwrap();
        decisions.sort();
        assert_eq!(decisions, vec![(a, false), (b, true)]);
    }

    #[test]
    fn test_optimistic_slot_goes_to_a_choked_interested_peer() {
        let config = Config {
            unchoked_peers: 1,
            optimistic_unchoked_peers: 1,
            ..Config::default()
        };
        let now = Instant::now();
        let mut choker = Choker::new(&config, now);
        let a = PeerKey::next();
        let b = PeerKey::next();
        let decisions = choker
            .tick(now, &[candidate(a, true, 100), candidate(b, true, 0)])
            .unwrap();
        assert_eq!(decisions.len(), 2);
        assert!(decisions.iter().all(|(_, unchoke)| *unchoke));
    }
}
