//! The connection manager's choking algorithm: periodic Tit-for-Tat rounds
//! with a randomized optimistic unchoke, snub detection and the trust
//! penalties fed by piece hash failures.
//!
//! The choker is pure bookkeeping: the torrent control loop samples per
//! session counters into [`RoundPeer`] views, runs a round, and forwards the
//! returned flips to the sessions. Only state changes are emitted.

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    time::{Duration, Instant},
};

use rand::seq::SliceRandom;

use crate::conf::TorrentConf;

/// Every third round is an optimistic round.
const OPTIMISTIC_ROUND_EVERY: u64 = 3;

/// A hash failure halves the peer's score for this many rounds.
const TRUST_PENALTY_ROUNDS: u32 = 3;

/// Hash failures are counted against a peer within this window.
const TRUST_WINDOW: Duration = Duration::from_secs(60 * 60);

/// The torrent loop's per round view of one connected peer.
#[derive(Clone, Debug)]
pub(crate) struct RoundPeer {
    pub addr: SocketAddr,
    /// Whether the remote is interested in our pieces.
    pub interested: bool,
    /// Smoothed rate at which the peer uploads to us, bytes per second.
    pub download_rate: f64,
    /// Smoothed rate at which we upload to the peer, bytes per second.
    pub upload_rate: f64,
    /// When the peer last delivered payload to us.
    pub last_delivery: Option<Instant>,
}

/// A choke state flip to forward to a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Decision {
    Choke(SocketAddr),
    Unchoke(SocketAddr),
}

#[derive(Debug, Default)]
struct Trust {
    /// Rounds left in which the peer's score is halved.
    penalty_rounds: u32,
    /// Recent hash failures attributed to the peer.
    failures: Vec<Instant>,
}

pub(crate) struct Choker {
    /// Total slots; one is reserved for the optimistic unchoke.
    upload_slot_count: usize,
    snub_threshold: Duration,
    ban_failure_count: usize,
    round: u64,
    /// The current optimistic pick. It is re-rolled on optimistic rounds and
    /// competes on merit in between.
    optimistic: Option<SocketAddr>,
    /// Peers we currently have unchoked, with the time of the unchoke.
    unchoked: HashMap<SocketAddr, Instant>,
    trust: HashMap<SocketAddr, Trust>,
}

impl Choker {
    pub fn new(conf: &TorrentConf) -> Self {
        Self {
            upload_slot_count: conf.upload_slot_count,
            snub_threshold: conf.snub_threshold,
            ban_failure_count: conf.ban_hash_failure_count,
            round: 0,
            optimistic: None,
            unchoked: HashMap::new(),
            trust: HashMap::new(),
        }
    }

    /// Records a hash failure attributed to the peer. Returns true when the
    /// peer crossed the ban threshold and must be disconnected for good.
    pub fn record_hash_failure(
        &mut self,
        addr: SocketAddr,
        now: Instant,
    ) -> bool {
        let trust = self.trust.entry(addr).or_default();
        trust.failures.push(now);
        trust
            .failures
            .retain(|at| now.duration_since(*at) < TRUST_WINDOW);
        trust.penalty_rounds = TRUST_PENALTY_ROUNDS;
        trust.failures.len() >= self.ban_failure_count
    }

    /// Forgets all state about a disconnected peer.
    pub fn peer_gone(&mut self, addr: SocketAddr) {
        self.unchoked.remove(&addr);
        self.trust.remove(&addr);
        if self.optimistic == Some(addr) {
            self.optimistic = None;
        }
    }

    /// Runs one choke round and returns the state flips to apply. `seeding`
    /// selects the scoring side: reciprocation is measured by what peers
    /// give us while we leech and by what they take while we seed.
    pub fn run_round(
        &mut self,
        peers: &[RoundPeer],
        seeding: bool,
        now: Instant,
    ) -> Vec<Decision> {
        self.round += 1;
        let optimistic_round =
            (self.round - 1) % OPTIMISTIC_ROUND_EVERY == 0;

        // an unchoked peer that stopped delivering payload is snubbed and
        // loses its slot for this round (while seeding there is nothing to
        // be snubbed out of)
        let snubbed: HashSet<SocketAddr> = if seeding {
            HashSet::new()
        } else {
            peers
                .iter()
                .filter(|peer| {
                    let since = match self.unchoked.get(&peer.addr) {
                        Some(since) => *since,
                        None => return false,
                    };
                    let last = peer.last_delivery.unwrap_or(since);
                    now.duration_since(last) >= self.snub_threshold
                })
                .map(|peer| peer.addr)
                .collect()
        };

        let mut ranked: Vec<(f64, SocketAddr)> = peers
            .iter()
            .filter(|peer| {
                peer.interested && !snubbed.contains(&peer.addr)
            })
            .map(|peer| (self.score(peer, seeding), peer.addr))
            .collect();
        // highest score first; ties resolved by address for determinism
        ranked.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.cmp(&b.1))
        });

        let regular_slots = self.upload_slot_count.saturating_sub(1);
        let mut unchoke: HashSet<SocketAddr> =
            ranked.iter().take(regular_slots).map(|(_, a)| *a).collect();

        if optimistic_round {
            // one uniformly random pick among the interested peers left out
            // on merit
            let pool: Vec<SocketAddr> = peers
                .iter()
                .filter(|peer| {
                    peer.interested && !unchoke.contains(&peer.addr)
                })
                .map(|peer| peer.addr)
                .collect();
            self.optimistic = pool.choose(&mut rand::thread_rng()).copied();
        }
        if optimistic_round {
            if let Some(optimistic) = self.optimistic {
                unchoke.insert(optimistic);
            }
        }

        // age out trust penalties once per round
        for trust in self.trust.values_mut() {
            trust.penalty_rounds = trust.penalty_rounds.saturating_sub(1);
        }

        // emit only the changes
        let mut decisions = Vec::new();
        for peer in peers {
            let is_unchoked = self.unchoked.contains_key(&peer.addr);
            let should_unchoke = unchoke.contains(&peer.addr);
            if should_unchoke && !is_unchoked {
                self.unchoked.insert(peer.addr, now);
                decisions.push(Decision::Unchoke(peer.addr));
            } else if !should_unchoke && is_unchoked {
                self.unchoked.remove(&peer.addr);
                decisions.push(Decision::Choke(peer.addr));
            }
        }
        // drop unchoke entries for peers that disappeared without a
        // SessionClosed (belt and braces; peer_gone normally handles it)
        let present: HashSet<SocketAddr> =
            peers.iter().map(|p| p.addr).collect();
        self.unchoked.retain(|addr, _| present.contains(addr));

        decisions
    }

    fn score(&self, peer: &RoundPeer, seeding: bool) -> f64 {
        let mut score = if seeding {
            peer.upload_rate
        } else {
            peer.download_rate
        };
        if let Some(trust) = self.trust.get(&peer.addr) {
            if trust.penalty_rounds > 0 {
                score /= 2.0;
            }
        }
        score
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn choker() -> Choker {
        Choker::new(&TorrentConf::new("/tmp"))
    }

    /// Four interested peers at 100/80/60/40 KiB/s, all having delivered
    /// recently.
    fn four_peers(now: Instant) -> Vec<RoundPeer> {
        [100.0, 80.0, 60.0, 40.0]
            .iter()
            .enumerate()
            .map(|(i, rate)| RoundPeer {
                addr: addr(i as u16 + 1),
                interested: true,
                download_rate: rate * 1024.0,
                upload_rate: 0.0,
                last_delivery: Some(now),
            })
            .collect()
    }

    #[test]
    fn test_top_three_by_rate_are_unchoked() {
        let mut choker = choker();
        let now = Instant::now();
        let peers = four_peers(now);

        // skip the initial optimistic round so the first observed round is
        // a regular one
        choker.round = 1;
        let mut decisions = choker.run_round(&peers, false, now);
        decisions.sort_by_key(|d| match d {
            Decision::Unchoke(a) | Decision::Choke(a) => *a,
        });
        assert_eq!(
            decisions,
            vec![
                Decision::Unchoke(addr(1)),
                Decision::Unchoke(addr(2)),
                Decision::Unchoke(addr(3)),
            ]
        );
    }

    #[test]
    fn test_optimistic_round_additionally_unchokes_fourth_then_reverts() {
        let mut choker = choker();
        let now = Instant::now();
        let peers = four_peers(now);

        choker.round = 1;
        choker.run_round(&peers, false, now);

        // round 3 isn't optimistic either: nothing changes
        assert!(choker.run_round(&peers, false, now).is_empty());

        // round 4 is optimistic: the only peer outside the top three is the
        // slowest one, so the "random" pick is forced
        let decisions = choker.run_round(&peers, false, now);
        assert_eq!(decisions, vec![Decision::Unchoke(addr(4))]);

        // the next regular round takes the slot back
        let decisions = choker.run_round(&peers, false, now);
        assert_eq!(decisions, vec![Decision::Choke(addr(4))]);
    }

    #[test]
    fn test_not_interested_peers_stay_choked() {
        let mut choker = choker();
        let now = Instant::now();
        let mut peers = four_peers(now);
        peers[0].interested = false;

        choker.round = 1;
        let decisions = choker.run_round(&peers, false, now);
        assert!(!decisions.contains(&Decision::Unchoke(addr(1))));
        assert!(decisions.contains(&Decision::Unchoke(addr(4))));
    }

    #[test]
    fn test_snubbed_peer_loses_slot() {
        let mut choker = choker();
        let now = Instant::now();
        let mut peers = four_peers(now);

        choker.round = 1;
        choker.run_round(&peers, false, now);

        // the fastest peer goes quiet for longer than the snub threshold
        peers[0].last_delivery =
            Some(now - Duration::from_secs(31));
        let later = now + Duration::from_secs(10);
        let decisions = choker.run_round(&peers, false, later);
        assert!(decisions.contains(&Decision::Choke(addr(1))));
        assert!(decisions.contains(&Decision::Unchoke(addr(4))));
    }

    #[test]
    fn test_hash_failure_halves_score_for_three_rounds() {
        let mut choker = choker();
        let now = Instant::now();
        let mut peers = four_peers(now);
        // the runner-up is close enough that a halved score falls behind it
        peers[3].download_rate = 55.0 * 1024.0;

        choker.round = 1;
        choker.run_round(&peers, false, now);

        // 100 KiB/s halved is 50 KiB/s, below every rival
        assert!(!choker.record_hash_failure(addr(1), now));
        let decisions = choker.run_round(&peers, false, now);
        assert!(decisions.contains(&Decision::Choke(addr(1))));
        assert!(decisions.contains(&Decision::Unchoke(addr(4))));

        // after the penalty rounds the peer earns its slot back (rounds 4, 5
        // and 6; round 4 is optimistic but the top three are merit picks)
        choker.run_round(&peers, false, now);
        choker.run_round(&peers, false, now);
        let decisions = choker.run_round(&peers, false, now);
        assert!(decisions.contains(&Decision::Unchoke(addr(1))));
    }

    #[test]
    fn test_three_hash_failures_within_hour_ban() {
        let mut choker = choker();
        let now = Instant::now();
        assert!(!choker.record_hash_failure(addr(1), now));
        assert!(!choker
            .record_hash_failure(addr(1), now + Duration::from_secs(60)));
        assert!(choker
            .record_hash_failure(addr(1), now + Duration::from_secs(120)));
    }

    #[test]
    fn test_spread_out_hash_failures_do_not_ban() {
        let mut choker = choker();
        let now = Instant::now();
        assert!(!choker.record_hash_failure(addr(1), now));
        assert!(!choker
            .record_hash_failure(addr(1), now + TRUST_WINDOW));
        assert!(!choker
            .record_hash_failure(addr(1), now + TRUST_WINDOW * 2));
    }

    #[test]
    fn test_seeding_scores_by_upload_rate() {
        let mut choker = choker();
        let now = Instant::now();
        let mut peers = four_peers(now);
        // reverse the ranking on the upload side
        for (i, peer) in peers.iter_mut().enumerate() {
            peer.download_rate = 0.0;
            peer.upload_rate = (i as f64 + 1.0) * 1024.0;
        }

        choker.round = 1;
        let decisions = choker.run_round(&peers, true, now);
        assert!(decisions.contains(&Decision::Unchoke(addr(4))));
        assert!(decisions.contains(&Decision::Unchoke(addr(3))));
        assert!(decisions.contains(&Decision::Unchoke(addr(2))));
        assert!(!decisions.contains(&Decision::Unchoke(addr(1))));
    }

    #[test]
    fn test_unchanged_round_emits_nothing() {
        let mut choker = choker();
        let now = Instant::now();
        let peers = four_peers(now);
        choker.round = 1;
        choker.run_round(&peers, false, now);
        assert!(choker.run_round(&peers, false, now).is_empty());
    }
}
