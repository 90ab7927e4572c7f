//! The engine-wide typed event bus (spec.md §4.11).
//!
//! Generalizes the teacher's narrow disk `Alert`/`TorrentAlert` pair (which
//! only ever reported allocation/write outcomes, see `disk::Alert`) into the
//! full `engine:*`/`torrent:*`/`piece:*`/`peer:*`/`tracker:*` event set,
//! fanned out with `tokio::sync::broadcast` -- the crate already depends on
//! `tokio`'s `sync` feature for the disk actor's `mpsc` channels, so this
//! reuses the same dependency rather than reaching for a new one.

use std::net::SocketAddr;

use tokio::sync::broadcast;

use crate::{PeerId, PieceIndex, TorrentId};

/// The engine-wide event envelope published on the bus.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum Alert {
    Engine(EngineAlert),
    Torrent(TorrentId, TorrentAlert),
    Piece(TorrentId, PieceAlert),
    Peer(TorrentId, PeerAlert),
    Tracker(TorrentId, TrackerAlert),
}

/// Events concerning the engine as a whole.
#[derive(Debug, Clone)]
pub enum EngineAlert {
    Ready,
    Started,
    Stopped,
    Error(String),
}

/// Per-torrent lifecycle events.
#[derive(Debug, Clone)]
pub enum TorrentAlert {
    Added,
    Removed,
    Started,
    Paused,
    Resumed,
    Completed,
    Error(String),
    /// Throttled to at most one per second per torrent (spec.md §4.11).
    Progress { downloaded: u64, uploaded: u64, total: u64 },
}

/// Per-piece verification outcomes.
#[derive(Debug, Clone)]
pub enum PieceAlert {
    Verified(PieceIndex),
    Failed(PieceIndex),
}

/// Peer connection lifecycle and choking events.
#[derive(Debug, Clone)]
pub enum PeerAlert {
    Connected(SocketAddr),
    Disconnected(SocketAddr),
    /// Emitted by a regular or optimistic unchoke round (spec.md §4.8).
    Choked(PeerId),
    Unchoked(PeerId),
    Snubbed(PeerId),
}

/// Tracker announce outcomes.
#[derive(Debug, Clone)]
pub enum TrackerAlert {
    Announce { url: String, peers: usize, seeds: usize, leechers: usize },
    Error { url: String, reason: String },
}

/// The sending half of the bus, held by whichever component originates
/// events (the engine loop, per-torrent tasks, the disk actor via a bridge).
#[derive(Clone)]
pub(crate) struct AlertSender {
    chan: broadcast::Sender<Alert>,
}

/// The receiving half of the bus, handed out to frontend consumers.
pub struct AlertReceiver {
    chan: broadcast::Receiver<Alert>,
}

/// Creates a new alert bus with the given backlog capacity: how many
/// not-yet-observed alerts a lagging subscriber may fall behind by before
/// it starts missing events.
pub(crate) fn channel(capacity: usize) -> (AlertSender, AlertReceiver) {
    let (tx, rx) = broadcast::channel(capacity);
    (AlertSender { chan: tx }, AlertReceiver { chan: rx })
}

impl AlertSender {
    /// Publishes an alert to all current subscribers. Per spec.md §4.11,
    /// subscribers must not block; since this is a fire-and-forget
    /// broadcast, publication itself never blocks on a subscriber.
    pub fn send(&self, alert: Alert) {
        // an error here just means there are no subscribers right now,
        // which isn't a failure worth propagating
        let _ = self.chan.send(alert);
    }

    pub fn subscribe(&self) -> AlertReceiver {
        AlertReceiver {
            chan: self.chan.subscribe(),
        }
    }
}

impl AlertReceiver {
    /// Awaits the next alert, skipping over a lagged gap if the receiver
    /// fell behind.
    pub async fn recv(&mut self) -> Option<Alert> {
        loop {
            match self.chan.recv().await {
                Ok(alert) => return Some(alert),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!(
                        "Alert receiver lagged, skipped {} alerts",
                        skipped
                    );
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Waits for the next alert matching `pred`, discarding non-matching
    /// alerts in between (spec.md §4.11's `waitFor(event)`).
    pub async fn next_matching(
        &mut self,
        mut pred: impl FnMut(&Alert) -> bool,
    ) -> Option<Alert> {
        while let Some(alert) = self.recv().await {
            if pred(&alert) {
                return Some(alert);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_published_alert() {
        let (tx, mut rx) = channel(8);
        tx.send(Alert::Engine(EngineAlert::Ready));
        let alert = rx.recv().await.unwrap();
        assert!(matches!(alert, Alert::Engine(EngineAlert::Ready)));
    }

    #[tokio::test]
    async fn test_next_matching_skips_unrelated_alerts() {
        let (tx, mut rx) = channel(8);
        tx.send(Alert::Engine(EngineAlert::Started));
        tx.send(Alert::Torrent(1, TorrentAlert::Added));
        let alert = rx
            .next_matching(|a| matches!(a, Alert::Torrent(_, TorrentAlert::Added)))
            .await
            .unwrap();
        assert!(matches!(alert, Alert::Torrent(1, TorrentAlert::Added)));
    }

    #[tokio::test]
    async fn test_multiple_subscribers_each_get_the_alert() {
        let (tx, mut rx1) = channel(8);
        let mut rx2 = tx.subscribe();
        tx.send(Alert::Engine(EngineAlert::Stopped));
        assert!(rx1.recv().await.is_some());
        assert!(rx2.recv().await.is_some());
    }
}
