//! Helpers for splitting a set of byte buffers into chunks for vectored I/O,
//! used when writing a piece's blocks across the one or more files it
//! overlaps with (spec.md §4.4).
//!
//! Grounded on the call sites in `disk::io::Piece::write`
//! (`IoVecs::unbounded`/`IoVecs::bounded`, `.buffers()`, `.advance()`,
//! `.into_tail()`), built atop `nix::sys::uio::IoVec` as expected by
//! `nix::sys::uio::pwritev` (the teacher's existing dependency for
//! vectored writes).

use nix::sys::uio::IoVec as NixIoVec;

/// A thin wrapper around a byte slice for use in vectored I/O, convertible
/// to `nix::sys::uio::IoVec`.
#[derive(Debug)]
pub(crate) struct IoVec<'a>(&'a [u8]);

impl<'a> IoVec<'a> {
    pub fn from_slice(buf: &'a [u8]) -> Self {
        Self(buf)
    }

    pub fn as_slice(&self) -> &'a [u8] {
        self.0
    }
}

/// A mutable run of `IoVec`s, optionally bounded to a maximum total length
/// smaller than the sum of its buffers.
///
/// This lets a piece's block buffers (which may together be longer than a
/// single file's remaining bytes, when the piece spans multiple files) be
/// split into per-file vectored writes without copying. Buffers are stored
/// as plain byte slices rather than pre-built `IoSlice`s, so that advancing
/// past a short write only needs to adjust offsets, never reallocate.
pub(crate) struct IoVecs<'a, 'b> {
    /// The buffers not yet consumed, as raw slices. The first entry may be a
    /// suffix of the corresponding `IoVec` once `advance` has trimmed it.
    slices: Vec<&'a [u8]>,
    /// The original buffer slice, used to compute the tail once the bound
    /// has been consumed.
    bufs: &'b mut [IoVec<'a>],
    /// The total length, in bytes, this `IoVecs` is allowed to cover. `None`
    /// means unbounded (use the entirety of `bufs`).
    bound: Option<usize>,
}

impl<'a, 'b> IoVecs<'a, 'b> {
    /// Creates an `IoVecs` covering the entirety of `bufs`.
    pub fn unbounded(bufs: &'b mut [IoVec<'a>]) -> Self {
        let slices = bufs.iter().map(IoVec::as_slice).collect();
        Self {
            slices,
            bufs,
            bound: None,
        }
    }

    /// Creates an `IoVecs` covering at most `bound` bytes of `bufs`,
    /// truncating the last included buffer if necessary.
    pub fn bounded(bufs: &'b mut [IoVec<'a>], bound: usize) -> Self {
        let mut slices = Vec::with_capacity(bufs.len());
        let mut remaining = bound;
        for buf in bufs.iter() {
            if remaining == 0 {
                break;
            }
            let len = buf.as_slice().len().min(remaining);
            slices.push(&buf.as_slice()[..len]);
            remaining -= len;
        }
        Self {
            slices,
            bufs,
            bound: Some(bound),
        }
    }

    /// Returns the buffers ready for a vectored write syscall.
    pub fn buffers(&self) -> Vec<NixIoVec<&'a [u8]>> {
        self.slices.iter().map(|s| NixIoVec::from_slice(s)).collect()
    }

    /// Advances past `n` written bytes, dropping or truncating buffers from
    /// the front as needed. Mirrors the semantics required by a `pwritev`
    /// loop that may perform a short write.
    pub fn advance(&mut self, mut n: usize) {
        while n > 0 {
            if self.slices.is_empty() {
                break;
            }
            let first_len = self.slices[0].len();
            if n < first_len {
                self.slices[0] = &self.slices[0][n..];
                n = 0;
            } else {
                n -= first_len;
                self.slices.remove(0);
            }
        }
    }

    /// Consumes `self`, returning the portion of the original `bufs` slice
    /// that lies beyond whatever this `IoVecs` covered (i.e. the blocks that
    /// belong to the next file, when a piece spans multiple files).
    pub fn into_tail(self) -> &'b mut [IoVec<'a>] {
        match self.bound {
            None => &mut [],
            Some(bound) => {
                let mut consumed = 0;
                let mut split_at = self.bufs.len();
                for (i, buf) in self.bufs.iter().enumerate() {
                    let len = buf.as_slice().len();
                    if consumed + len >= bound {
                        split_at = if consumed + len == bound { i + 1 } else { i };
                        break;
                    }
                    consumed += len;
                }
                &mut self.bufs[split_at..]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unbounded_covers_all_buffers() {
        let a = vec![1u8, 2, 3];
        let b = vec![4u8, 5];
        let mut bufs = vec![IoVec::from_slice(&a), IoVec::from_slice(&b)];
        let iovecs = IoVecs::unbounded(&mut bufs);
        assert_eq!(iovecs.buffers().len(), 2);
    }

    #[test]
    fn test_bounded_splits_mid_piece() {
        let a = vec![1u8, 2, 3, 4];
        let b = vec![5u8, 6, 7, 8];
        let mut bufs = vec![IoVec::from_slice(&a), IoVec::from_slice(&b)];
        let iovecs = IoVecs::bounded(&mut bufs, 4);
        let total: usize =
            iovecs.buffers().iter().map(|s| s.as_slice().len()).sum();
        assert_eq!(total, 4);
    }

    #[test]
    fn test_into_tail_returns_remaining_buffers() {
        let a = vec![1u8, 2, 3, 4];
        let b = vec![5u8, 6, 7, 8];
        let mut bufs = vec![IoVec::from_slice(&a), IoVec::from_slice(&b)];
        let iovecs = IoVecs::bounded(&mut bufs, 4);
        let tail = iovecs.into_tail();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].as_slice(), &[5, 6, 7, 8]);
    }
}
