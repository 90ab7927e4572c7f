//! Rarest-first piece selection with random-first-K and endgame duplication
//! (spec.md §4.7).
//!
//! No module in the teacher repo covers this (its retrieved `peer.rs`
//! snapshot already calls into a `piece_picker` it never got to commit).
//! The rarity-counting and selection shape is grounded on
//! `dog4ik-media-server`'s `scheduler.rs` (`available_pieces`, its
//! weighted peer selection), generalized here into a single piece-level
//! picker shared by every `PeerSession` of a torrent, as the `Arc<RwLock<_>>`
//! in `peer::PeerSession` implies.

use std::collections::HashSet;

use rand::seq::SliceRandom;
use rand::thread_rng;

use crate::error::{Error, Result};
use crate::{Bitfield, PieceIndex};

/// The number of initial pieces picked uniformly at random rather than by
/// rarity, to get the client participating in the swarm quickly (spec.md
/// §4.7 point 3).
const RANDOM_FIRST_PIECES: usize = 4;

/// Below this many pieces remain incomplete, switch to endgame duplication
/// (spec.md §4.7 point 4).
const ENDGAME_THRESHOLD: usize = 5;

/// Tracks piece ownership and availability for one torrent, and picks the
/// next piece a session should download.
pub(crate) struct PiecePicker {
    /// Pieces we already have.
    own: Bitfield,
    /// Pieces some session already picked and is downloading. Excluded from
    /// further picks unless we're in endgame.
    picked: HashSet<PieceIndex>,
    /// Number of peers, by piece index, known to have that piece.
    availability: Vec<usize>,
}

impl PiecePicker {
    /// Creates a new picker for a torrent with no pieces yet, of the given
    /// piece count.
    pub fn new(piece_count: usize) -> Self {
        Self {
            own: Bitfield::repeat(false, piece_count),
            picked: HashSet::new(),
            availability: vec![0; piece_count],
        }
    }

    /// Creates a picker that already owns the pieces set in `own` (e.g.
    /// when resuming a torrent from a saved bitfield).
    pub fn with_own_pieces(own: Bitfield) -> Self {
        let piece_count = own.len();
        Self {
            own,
            picked: HashSet::new(),
            availability: vec![0; piece_count],
        }
    }

    /// Registers a peer's full piece bitfield, bumping the availability
    /// count of each piece it has, and returns whether we're interested in
    /// this peer, i.e. whether it has at least one piece we lack.
    pub fn register_availability(&mut self, bitfield: &Bitfield) -> Result<bool> {
        if bitfield.len() != self.own.len() {
            return Err(Error::InvalidMessage(format!(
                "bitfield has {} pieces, torrent has {}",
                bitfield.len(),
                self.own.len()
            )));
        }
        let mut interested = false;
        for index in 0..self.own.len() {
            if bitfield[index] {
                self.availability[index] += 1;
                if !self.own[index] {
                    interested = true;
                }
            }
        }
        Ok(interested)
    }

    /// Registers a single `Have` announcement from a peer.
    pub fn received_have(&mut self, index: PieceIndex) -> Result<bool> {
        if index >= self.own.len() {
            return Err(Error::InvalidMessage(format!(
                "have message for out of range piece {}",
                index
            )));
        }
        self.availability[index] += 1;
        Ok(!self.own[index])
    }

    /// Reverses the availability counts registered for a peer, e.g. on
    /// disconnect. `bitfield` is `None` if the peer never completed the
    /// availability exchange.
    pub fn forget_peer(&mut self, bitfield: Option<&Bitfield>) {
        if let Some(bitfield) = bitfield {
            for index in 0..self.own.len().min(bitfield.len()) {
                if bitfield[index] {
                    if let Some(count) = self.availability.get_mut(index) {
                        *count = count.saturating_sub(1);
                    }
                }
            }
        }
    }

    /// Picks the next piece to start downloading: strict priority isn't
    /// meaningful here since in-progress pieces are tracked per-session via
    /// `PieceDownload`, so this only ever hands out untouched pieces
    /// (rarest-first, with a random-first-K warmup), or, in endgame,
    /// re-hands out a piece another session already picked.
    pub fn pick_piece(&mut self) -> Option<PieceIndex> {
        let untouched: Vec<PieceIndex> = (0..self.own.len())
            .filter(|&i| !self.own[i] && !self.picked.contains(&i))
            .collect();

        let chosen = if !untouched.is_empty() {
            if self.completed_count() < RANDOM_FIRST_PIECES {
                untouched.choose(&mut thread_rng()).copied()
            } else {
                self.rarest(&untouched)
            }
        } else if self.is_endgame() {
            // endgame: every remaining piece is already being downloaded by
            // someone, so duplicate a request for the rarest still-missing
            // piece
            let missing: Vec<PieceIndex> =
                (0..self.own.len()).filter(|&i| !self.own[i]).collect();
            if missing.is_empty() {
                None
            } else {
                self.rarest(&missing)
            }
        } else {
            None
        };

        if let Some(index) = chosen {
            self.picked.insert(index);
        }
        chosen
    }

    fn rarest(&self, candidates: &[PieceIndex]) -> Option<PieceIndex> {
        let min_availability = candidates
            .iter()
            .map(|&i| self.availability.get(i).copied().unwrap_or(0))
            .min()?;
        let rarest: Vec<PieceIndex> = candidates
            .iter()
            .copied()
            .filter(|&i| self.availability.get(i).copied().unwrap_or(0) == min_availability)
            .collect();
        rarest.choose(&mut thread_rng()).copied()
    }

    /// Marks a piece as fully received and verified, removing it from the
    /// in-progress set.
    pub fn received_piece(&mut self, index: PieceIndex) {
        if index < self.own.len() {
            self.own.set(index, true);
        }
        self.picked.remove(&index);
    }

    /// Releases a piece back into the untouched pool, e.g. when its hash
    /// fails to verify or its session disconnects mid-download. Also clears
    /// the piece's own-bit, since a session only ever calls this before the
    /// piece has been confirmed on disk (only `received_piece` may set it).
    pub fn release_piece(&mut self, index: PieceIndex) {
        self.picked.remove(&index);
        if index < self.own.len() {
            self.own.set(index, false);
        }
    }

    pub fn completed_count(&self) -> usize {
        self.own.count_ones()
    }

    pub fn piece_count(&self) -> usize {
        self.own.len()
    }

    pub fn is_seed(&self) -> bool {
        self.own.all()
    }

    fn is_endgame(&self) -> bool {
        let remaining = self.own.len() - self.completed_count();
        remaining > 0 && remaining < ENDGAME_THRESHOLD
    }

    /// Projects our own completion state into a packed, MSB-first bitfield
    /// suitable for sending in a `Bitfield` message.
    pub fn own_bitfield(&self) -> Bitfield {
        self.own.clone()
    }

    /// Replaces the own-pieces bitfield with one loaded from a resume file,
    /// e.g. after the engine restores a torrent's saved progress. Pieces set
    /// to `true` are removed from the in-progress set, since they're no
    /// longer something to pick.
    pub fn restore_own(&mut self, own: Bitfield) {
        for index in 0..self.own.len().min(own.len()) {
            if own[index] {
                self.own.set(index, true);
                self.picked.remove(&index);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed_bitfield(piece_count: usize) -> Bitfield {
        Bitfield::repeat(true, piece_count)
    }

    #[test]
    fn test_register_availability_reports_interest() {
        let mut picker = PiecePicker::new(4);
        let interested = picker.register_availability(&seed_bitfield(4)).unwrap();
        assert!(interested);
    }

    #[test]
    fn test_register_availability_rejects_mismatched_len() {
        let mut picker = PiecePicker::new(4);
        assert!(picker.register_availability(&seed_bitfield(5)).is_err());
    }

    #[test]
    fn test_pick_piece_excludes_already_picked() {
        let mut picker = PiecePicker::new(2);
        picker.register_availability(&seed_bitfield(2)).unwrap();
        let first = picker.pick_piece().unwrap();
        let second = picker.pick_piece().unwrap();
        assert_ne!(first, second);
        assert_eq!(picker.pick_piece(), None);
    }

    #[test]
    fn test_received_piece_marks_own_and_frees_slot() {
        let mut picker = PiecePicker::new(1);
        picker.register_availability(&seed_bitfield(1)).unwrap();
        let index = picker.pick_piece().unwrap();
        picker.received_piece(index);
        assert!(picker.is_seed());
        assert_eq!(picker.pick_piece(), None);
    }

    #[test]
    fn test_endgame_duplicates_picked_piece() {
        let mut picker = PiecePicker::new(ENDGAME_THRESHOLD - 1);
        picker
            .register_availability(&seed_bitfield(ENDGAME_THRESHOLD - 1))
            .unwrap();
        let first = picker.pick_piece();
        assert!(first.is_some());
        // every piece is now "picked"; in endgame a re-pick should still
        // hand one back out rather than returning None
        let second = picker.pick_piece();
        assert!(second.is_some());
    }
}
