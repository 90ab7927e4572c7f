//! Peer discovery sources (spec.md §4.10): DHT and PEX are out of scope as
//! full implementations, but the Engine's candidate queue needs a stable
//! interface to feed from, tagged by source for dedup and blacklisting.
//!
//! No teacher module covers peer discovery at all (cratetorrent only ever
//! dialed tracker-provided peers directly); this trait is grounded on the
//! tracker response shape already in `tracker::Response` (a flat peer list)
//! generalized into a pluggable source so DHT/PEX can be added later
//! without touching the Engine's candidate handling.

use std::collections::HashSet;
use std::net::SocketAddr;

/// Where a peer candidate was learned from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum DiscoverySource {
    Tracker,
    Dht,
    Pex,
}

/// A candidate peer endpoint with its provenance, used by the Engine to
/// deduplicate across sources and blacklist repeat-offenders per source.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct PeerCandidate {
    pub addr: SocketAddr,
    pub source: DiscoverySource,
}

/// A source of peer candidates that feeds the Engine's candidate queue.
///
/// DHT and DHT/PEX implementations are sibling components outside this
/// engine's critical path (spec.md §4.10); this trait exists so the Engine
/// can treat them uniformly once they're wired in.
pub(crate) trait Discovery: Send {
    /// Returns newly discovered candidates since the last poll, if any.
    fn poll_candidates(&mut self) -> Vec<PeerCandidate>;

    /// Whether this source should be consulted at all, e.g. DHT/PEX are
    /// disabled for private torrents (spec.md §3, §4.10).
    fn is_enabled(&self) -> bool {
        true
    }
}

/// A no-op discovery source used when a feature is disabled (private
/// torrents, or DHT/PEX turned off in `Conf`).
pub(crate) struct NullDiscovery;

impl Discovery for NullDiscovery {
    fn poll_candidates(&mut self) -> Vec<PeerCandidate> {
        Vec::new()
    }

    fn is_enabled(&self) -> bool {
        false
    }
}

/// Deduplicates a batch of freshly discovered candidates against the set of
/// addresses already known to the Engine, keeping the first source a peer
/// was seen from.
pub(crate) fn dedup_candidates(
    known: &HashSet<SocketAddr>,
    candidates: Vec<PeerCandidate>,
) -> Vec<PeerCandidate> {
    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .filter(|c| !known.contains(&c.addr) && seen.insert(c.addr))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        ([127, 0, 0, 1], port).into()
    }

    #[test]
    fn test_null_discovery_yields_nothing() {
        let mut d = NullDiscovery;
        assert!(!d.is_enabled());
        assert!(d.poll_candidates().is_empty());
    }

    #[test]
    fn test_dedup_candidates_drops_known_and_duplicate() {
        let mut known = HashSet::new();
        known.insert(addr(1));
        let candidates = vec![
            PeerCandidate { addr: addr(1), source: DiscoverySource::Tracker },
            PeerCandidate { addr: addr(2), source: DiscoverySource::Dht },
            PeerCandidate { addr: addr(2), source: DiscoverySource::Pex },
        ];
        let deduped = dedup_candidates(&known, candidates);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].addr, addr(2));
        assert_eq!(deduped[0].source, DiscoverySource::Dht);
    }
}
