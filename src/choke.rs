//! The choking algorithm: periodically decides which interested peers get
//! unchoked, plus an optimistic slot and snub detection (spec.md §4.8).
//!
//! Grounded on the peer-scoring and choke/unchoke bookkeeping in
//! `dog4ik-media-server`'s `scheduler.rs` (`choke_peer`, `handle_peer_choke`,
//! `handle_peer_unchoke`, `available_peers`/`choked_peers` iterators), here
//! generalized into a standalone, timer-driven component that scores peers
//! by throughput rather than reacting only to peer-initiated state changes.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use rand::thread_rng;

use crate::PeerId;

/// The number of peers kept unchoked via the regular algorithm, including
/// the optimistic slot (spec.md §4.8 default `U=4`).
const MAX_UNCHOKED: usize = 4;

/// How long a newly connected peer is weighted for the optimistic unchoke
/// pick.
const NEW_PEER_WINDOW: Duration = Duration::from_secs(60);

/// The weight multiplier applied to peers within `NEW_PEER_WINDOW`.
const NEW_PEER_WEIGHT: usize = 3;

/// How long an unchoked peer may go without delivering data before being
/// marked snubbed.
const SNUB_TIMEOUT: Duration = Duration::from_secs(60);

/// Whether we're scoring peers by download rate (leeching) or upload rate
/// (seeding), per spec.md §4.8's mode switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    Leech,
    Seed,
}

/// Per-peer bookkeeping the choker needs: whether it's interested in us,
/// whether we have it choked, when it connected, and its recent rates.
#[derive(Debug, Clone)]
pub(crate) struct PeerState {
    pub is_interested: bool,
    pub is_choked: bool,
    pub connected_at: Instant,
    pub download_rate: u64,
    pub upload_rate: u64,
    pub last_data_at: Instant,
    pub is_snubbed: bool,
}

impl PeerState {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            is_interested: false,
            is_choked: true,
            connected_at: now,
            download_rate: 0,
            upload_rate: 0,
            last_data_at: now,
            is_snubbed: false,
        }
    }
}

impl Default for PeerState {
    fn default() -> Self {
        Self::new()
    }
}

/// An action the choker wants the caller to apply to a peer's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChokeAction {
    Choke(PeerId),
    Unchoke(PeerId),
    Snubbed(PeerId),
}

/// Runs the regular and optimistic unchoke rounds over a set of peers,
/// returning the choke/unchoke/snub transitions to apply.
pub(crate) struct Choker {
    mode: Mode,
    /// The peer currently holding the optimistic-unchoke slot, if any. The
    /// next regular-unchoke round must not re-choke it, or the slot would
    /// never survive to see the throughput it was given a chance to prove
    /// (spec.md §8 #6's "rotation advances at least every T_opt").
    optimistic: Option<PeerId>,
}

impl Choker {
    pub fn new(mode: Mode) -> Self {
        Self { mode, optimistic: None }
    }

    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    /// Runs the 10s regular unchoke round: scores all interested,
    /// non-snubbed peers and keeps the top `MAX_UNCHOKED - 1`, leaving the
    /// last slot for the next optimistic round. The current optimistic pick
    /// is exempted from being re-choked here; only the optimistic round
    /// itself may replace it.
    pub fn regular_unchoke(
        &mut self,
        peers: &mut HashMap<PeerId, PeerState>,
    ) -> Vec<ChokeAction> {
        if let Some(id) = self.optimistic {
            if !peers.contains_key(&id) {
                self.optimistic = None;
            }
        }

        let mut candidates: Vec<(PeerId, u64)> = peers
            .iter()
            .filter(|(id, p)| {
                p.is_interested && !p.is_snubbed && Some(**id) != self.optimistic
            })
            .map(|(id, p)| {
                let rate = match self.mode {
                    Mode::Leech => p.download_rate,
                    Mode::Seed => p.upload_rate,
                };
                (*id, rate)
            })
            .collect();
        candidates.sort_by(|a, b| b.1.cmp(&a.1));

        let slots = MAX_UNCHOKED.saturating_sub(1 + self.optimistic.is_some() as usize);
        let mut keep: std::collections::HashSet<PeerId> = candidates
            .iter()
            .take(slots)
            .map(|(id, _)| *id)
            .collect();
        if let Some(id) = self.optimistic {
            keep.insert(id);
        }

        let mut actions = Vec::new();
        for (id, peer) in peers.iter_mut() {
            if keep.contains(id) {
                if peer.is_choked {
                    peer.is_choked = false;
                    actions.push(ChokeAction::Unchoke(*id));
                }
            } else if peer.is_interested && !peer.is_choked {
                peer.is_choked = true;
                actions.push(ChokeAction::Choke(*id));
            }
        }
        actions
    }

    /// Runs the 30s optimistic unchoke round: picks one interested, choked
    /// peer at random (peers connected within the last minute are weighted
    /// 3x), unchoking it regardless of its rate, and remembers it so the
    /// next regular-unchoke round leaves it alone.
    pub fn optimistic_unchoke(
        &mut self,
        peers: &mut HashMap<PeerId, PeerState>,
    ) -> Option<ChokeAction> {
        let now = Instant::now();
        let mut pool = Vec::new();
        for (id, peer) in peers.iter() {
            if !peer.is_interested || !peer.is_choked {
                continue;
            }
            let weight = if now.duration_since(peer.connected_at) < NEW_PEER_WINDOW
            {
                NEW_PEER_WEIGHT
            } else {
                1
            };
            for _ in 0..weight {
                pool.push(*id);
            }
        }
        let chosen = *pool.choose(&mut thread_rng())?;
        let peer = peers.get_mut(&chosen)?;
        peer.is_choked = false;
        self.optimistic = Some(chosen);
        Some(ChokeAction::Unchoke(chosen))
    }

    /// Checks every unchoked, mutually-interested peer for a data timeout,
    /// marking it snubbed (spec.md §4.8's 60s rule) so it's excluded from
    /// future regular-unchoke scoring until it sends data again.
    pub fn detect_snubs(
        &self,
        peers: &mut HashMap<PeerId, PeerState>,
    ) -> Vec<ChokeAction> {
        let now = Instant::now();
        let mut actions = Vec::new();
        for (id, peer) in peers.iter_mut() {
            if !peer.is_choked
                && !peer.is_snubbed
                && now.duration_since(peer.last_data_at) >= SNUB_TIMEOUT
            {
                peer.is_snubbed = true;
                actions.push(ChokeAction::Snubbed(*id));
            }
        }
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer_id(n: u8) -> PeerId {
        let mut id = [0u8; 20];
        id[0] = n;
        id
    }

    #[test]
    fn test_regular_unchoke_keeps_top_rates() {
        let mut peers = HashMap::new();
        for (n, rate) in [(1, 1), (2, 2), (3, 3), (4, 4), (5, 5), (6, 6)] {
            let mut p = PeerState::new();
            p.is_interested = true;
            p.download_rate = rate;
            peers.insert(peer_id(n), p);
        }
        let mut choker = Choker::new(Mode::Leech);
        choker.regular_unchoke(&mut peers);

        assert!(!peers[&peer_id(6)].is_choked);
        assert!(!peers[&peer_id(5)].is_choked);
        assert!(!peers[&peer_id(4)].is_choked);
        assert!(peers[&peer_id(1)].is_choked);
        assert!(peers[&peer_id(2)].is_choked);
    }

    #[test]
    fn test_optimistic_unchoke_picks_choked_interested_peer() {
        let mut peers = HashMap::new();
        let mut choked = PeerState::new();
        choked.is_interested = true;
        peers.insert(peer_id(1), choked);

        let mut choker = Choker::new(Mode::Leech);
        let action = choker.optimistic_unchoke(&mut peers);
        assert_eq!(action, Some(ChokeAction::Unchoke(peer_id(1))));
        assert!(!peers[&peer_id(1)].is_choked);
        assert_eq!(choker.optimistic, Some(peer_id(1)));
    }

    #[test]
    fn test_regular_unchoke_exempts_optimistic_pick() {
        let mut peers = HashMap::new();
        for (n, rate) in [(1, 1), (2, 2), (3, 3), (4, 4)] {
            let mut p = PeerState::new();
            p.is_interested = true;
            p.download_rate = rate;
            peers.insert(peer_id(n), p);
        }
        let mut choker = Choker::new(Mode::Leech);
        // Peer 1 has the lowest rate and would normally be choked, but it
        // holds the optimistic slot.
        choker.optimistic = Some(peer_id(1));
        peers.get_mut(&peer_id(1)).unwrap().is_choked = false;

        choker.regular_unchoke(&mut peers);
        assert!(!peers[&peer_id(1)].is_choked);
    }

    #[test]
    fn test_snub_detection_marks_stale_unchoked_peers() {
        let mut peers = HashMap::new();
        let mut peer = PeerState::new();
        peer.is_choked = false;
        peer.last_data_at = Instant::now() - Duration::from_secs(61);
        peers.insert(peer_id(1), peer);

        let choker = Choker::new(Mode::Leech);
        let actions = choker.detect_snubs(&mut peers);
        assert_eq!(actions, vec![ChokeAction::Snubbed(peer_id(1))]);
        assert!(peers[&peer_id(1)].is_snubbed);
    }
}
