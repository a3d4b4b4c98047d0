// The choking round: every ten seconds, pick who gets to download from us.

use std::collections::HashSet;

use rand::seq::SliceRandom;

use crate::type_aliases::PeerHandle;

pub const CHOKE_INTERVAL_SECS: u64 = 10;
/// Every third round the optimistic slot moves.
pub const OPTIMISTIC_ROTATIONS: u64 = 3;

/// Tracks the optimistic unchoke across rounds.
#[derive(Default)]
pub struct Choker {
    round: u64,
    optimistic: Option<PeerHandle>,
}

/// A candidate is an interested peer with its contribution over the last
/// window: bytes they sent us while leeching, bytes we sent them while
/// seeding.
pub struct Candidate {
    pub addr: PeerHandle,
    pub contribution: u64,
}

impl Choker {
    /// Run one round; returns the set of peers that should be unchoked.
    pub fn run_round(&mut self, mut candidates: Vec<Candidate>, slots: usize) -> HashSet<PeerHandle> {
        let rotate = self.round % OPTIMISTIC_ROTATIONS == 0;
        self.round += 1;

        candidates.sort_by_key(|c| std::cmp::Reverse(c.contribution));
        let mut unchoked: HashSet<PeerHandle> =
            candidates.iter().take(slots).map(|c| c.addr).collect();

        // The optimistic slot goes to somebody outside the top ranks, so
        // unknown peers get a chance to prove themselves.
        let rest: Vec<PeerHandle> = candidates
            .iter()
            .skip(slots)
            .map(|c| c.addr)
            .collect();
        let keep_current = self
            .optimistic
            .filter(|o| !rotate && rest.contains(o));
        self.optimistic = keep_current
            .or_else(|| rest.choose(&mut rand::thread_rng()).copied());
        if let Some(opt) = self.optimistic {
            unchoked.insert(opt);
        }
        unchoked
    }

    pub fn optimistic(&self) -> Option<PeerHandle> {
        self.optimistic
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> PeerHandle {
        format!("10.2.0.{n}:1").parse().unwrap()
    }

    fn candidates(contribs: &[(u8, u64)]) -> Vec<Candidate> {
        contribs
            .iter()
            .map(|(n, c)| Candidate {
                addr: addr(*n),
                contribution: *c,
            })
            .collect()
    }

    #[test]
    fn test_top_contributors_unchoked() {
        let mut choker = Choker::default();
        let unchoked = choker.run_round(
            candidates(&[(1, 100), (2, 900), (3, 50), (4, 500), (5, 700), (6, 10)]),
            4,
        );
        for n in [2, 4, 5] {
            assert!(unchoked.contains(&addr(n)), "peer {n} should be unchoked");
        }
        // 4 by rank + at most 1 optimistic.
        assert!(unchoked.len() <= 5);
    }

    #[test]
    fn test_optimistic_rotates_over_time() {
        let mut choker = Choker::default();
        let mut optimistic_seen = HashSet::new();
        // 20 rounds = 200 virtual seconds; the optimistic slot must visit
        // at least 2 distinct low-contribution peers.
        for _ in 0..20 {
            let cands = candidates(&[
                (1, 1000),
                (2, 900),
                (3, 800),
                (4, 700),
                (5, 0),
                (6, 0),
                (7, 0),
                (8, 0),
                (9, 0),
                (10, 0),
            ]);
            let unchoked = choker.run_round(cands, 4);
            if let Some(opt) = choker.optimistic() {
                optimistic_seen.insert(opt);
                assert!(unchoked.contains(&opt));
            }
        }
        assert!(
            optimistic_seen.len() >= 2,
            "optimistic visited only {optimistic_seen:?}"
        );
    }

    #[test]
    fn test_optimistic_stable_between_rotations() {
        let mut choker = Choker::default();
        let cands = || candidates(&[(1, 100), (2, 90), (3, 0), (4, 0), (5, 0), (6, 0)]);
        choker.run_round(cands(), 2); // round 0: rotation
        let first = choker.optimistic().unwrap();
        choker.run_round(cands(), 2); // round 1: keep
        assert_eq!(choker.optimistic(), Some(first));
        choker.run_round(cands(), 2); // round 2: keep
        assert_eq!(choker.optimistic(), Some(first));
    }

    #[test]
    fn test_fewer_candidates_than_slots() {
        let mut choker = Choker::default();
        let unchoked = choker.run_round(candidates(&[(1, 5)]), 4);
        assert_eq!(unchoked.len(), 1);
    }
}
