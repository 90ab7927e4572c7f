//! Tracks one peer session's in-flight download of a single piece: which
//! blocks have been requested and which have arrived (spec.md §4.3's
//! `BlockState`, §4.6's pipelining rules).
//!
//! No teacher module covers this either (same gap as `piece_picker`); the
//! block-indexed state vector mirrors `disk::io::Piece`'s own
//! `blocks: BTreeMap<u32, Vec<u8>>` bookkeeping, but here only status is
//! tracked since the actual bytes are handed straight to the disk task.

use crate::{block_count, block_len, BlockInfo, PieceIndex, BLOCK_LEN};

/// The state of a single block within a piece download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockState {
    Missing,
    Requested,
    Received,
}

/// One session's view of an in-progress piece download.
pub(crate) struct PieceDownload {
    piece_index: PieceIndex,
    piece_len: u32,
    blocks: Vec<BlockState>,
}

impl PieceDownload {
    pub fn new(piece_index: PieceIndex, piece_len: u32) -> Self {
        Self {
            piece_index,
            piece_len,
            blocks: vec![BlockState::Missing; block_count(piece_len)],
        }
    }

    pub fn piece_index(&self) -> PieceIndex {
        self.piece_index
    }

    /// Appends up to `count` new block requests to `out`, picking the next
    /// blocks not yet requested.
    pub fn pick_blocks(&mut self, count: usize, out: &mut Vec<BlockInfo>) {
        let mut picked = 0;
        for (index, state) in self.blocks.iter_mut().enumerate() {
            if picked >= count {
                break;
            }
            if *state == BlockState::Missing {
                *state = BlockState::Requested;
                out.push(BlockInfo {
                    piece_index: self.piece_index,
                    offset: index as u32 * BLOCK_LEN,
                    len: block_len(self.piece_len, index),
                });
                picked += 1;
            }
        }
    }

    /// Marks the block identified by `block_info` as received.
    pub fn received_block(&mut self, block_info: BlockInfo) {
        debug_assert_eq!(block_info.piece_index, self.piece_index);
        let index = block_info.index_in_piece();
        if let Some(state) = self.blocks.get_mut(index) {
            *state = BlockState::Received;
        }
    }

    /// The number of blocks not yet received (missing or outstanding).
    pub fn count_missing_blocks(&self) -> usize {
        self.blocks
            .iter()
            .filter(|s| **s != BlockState::Received)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pick_blocks_respects_count() {
        let mut download = PieceDownload::new(0, BLOCK_LEN * 4);
        let mut out = Vec::new();
        download.pick_blocks(2, &mut out);
        assert_eq!(out.len(), 2);
        assert_eq!(download.count_missing_blocks(), 4);

        let mut more = Vec::new();
        download.pick_blocks(2, &mut more);
        assert_eq!(more.len(), 2);
        // all blocks now requested, none left to pick
        let mut none = Vec::new();
        download.pick_blocks(1, &mut none);
        assert!(none.is_empty());
    }

    #[test]
    fn test_received_block_reduces_missing_count() {
        let mut download = PieceDownload::new(0, BLOCK_LEN * 2);
        let mut out = Vec::new();
        download.pick_blocks(2, &mut out);
        assert_eq!(download.count_missing_blocks(), 2);
        download.received_block(out[0]);
        assert_eq!(download.count_missing_blocks(), 1);
        download.received_block(out[1]);
        assert_eq!(download.count_missing_blocks(), 0);
    }

    #[test]
    fn test_last_block_shorter_than_block_len() {
        let piece_len = BLOCK_LEN + 100;
        let mut download = PieceDownload::new(0, piece_len);
        let mut out = Vec::new();
        download.pick_blocks(2, &mut out);
        assert_eq!(out[1].len, 100);
    }
}
