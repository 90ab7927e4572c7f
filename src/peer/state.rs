//! Per-session connection state machine and bookkeeping, split out of
//! `peer::mod` the way the teacher's own retrieved `peer.rs` snapshot kept
//! `State`/`Status`/`PeerInfo` as small, separate structs rather than fields
//! inlined directly on `PeerSession`.

use std::net::SocketAddr;
use std::time::Instant;

use crate::{Bitfield, PeerId};

/// The connection lifecycle state of a single peer session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum State {
    Disconnected,
    Connecting,
    Handshaking,
    AvailabilityExchange,
    Connected,
    Disconnecting,
}

impl Default for State {
    fn default() -> Self {
        Self::Disconnected
    }
}

/// The four-way choke/interest flags BEP 3 defines for each direction of a
/// connection.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Status {
    /// Whether the peer is choking us (we may not request blocks from it).
    pub is_choked: bool,
    /// Whether we are interested in the peer (it has pieces we lack).
    pub is_interested: bool,
    /// Whether we are choking the peer.
    pub is_peer_choked: bool,
    /// Whether the peer is interested in us.
    pub is_peer_interested: bool,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            is_choked: true,
            is_interested: false,
            is_peer_choked: true,
            is_peer_interested: false,
        }
    }
}

/// Everything the engine and choking algorithm need to know about a
/// connected peer, independent of the session's internal wire-protocol
/// state.
#[derive(Debug)]
pub(crate) struct PeerInfo {
    pub addr: SocketAddr,
    pub id: Option<PeerId>,
    /// The peer's last-announced piece bitfield, kept around so its
    /// contribution to piece availability can be reversed on disconnect
    /// (see `piece_picker::PiecePicker::forget_peer`).
    pub pieces: Option<Bitfield>,
    pub connected_at: Instant,
    pub downloaded: u64,
    pub uploaded: u64,
}

impl PeerInfo {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            id: None,
            pieces: None,
            connected_at: Instant::now(),
            downloaded: 0,
            uploaded: 0,
        }
    }
}
