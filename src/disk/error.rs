//! Errors specific to the disk IO actor (spec.md §4.4, §4.7).

use std::fmt;
use std::io;

pub(crate) type Result<T, E = crate::error::Error> = std::result::Result<T, E>;

/// Failures that can occur while allocating a new torrent's on-disk
/// structure.
#[derive(Debug)]
#[non_exhaustive]
pub enum NewTorrentError {
    /// A torrent with this id has already been allocated.
    AlreadyExists,
    /// An IO error occurred while creating directories or opening files.
    Io(io::Error),
    /// The volume backing the download directory doesn't have enough free
    /// space for the torrent's full content length.
    InsufficientSpace,
}

impl fmt::Display for NewTorrentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NewTorrentError::AlreadyExists => {
                write!(f, "torrent already allocated")
            }
            NewTorrentError::Io(e) => write!(f, "io error: {}", e),
            NewTorrentError::InsufficientSpace => {
                write!(f, "not enough free disk space for torrent")
            }
        }
    }
}

impl std::error::Error for NewTorrentError {}

impl From<io::Error> for NewTorrentError {
    fn from(e: io::Error) -> Self {
        NewTorrentError::Io(e)
    }
}

/// Failures that can occur while writing a block or piece to disk.
#[derive(Debug)]
#[non_exhaustive]
pub enum WriteError {
    /// The referenced piece index does not exist in this torrent.
    InvalidPieceIndex,
    /// An IO error occurred during the write.
    Io(io::Error),
    /// The volume backing the download directory has no space left
    /// (spec.md §4.7 distinguished disk-full condition).
    DiskFull,
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteError::InvalidPieceIndex => write!(f, "invalid piece index"),
            WriteError::Io(e) => write!(f, "io error: {}", e),
            WriteError::DiskFull => write!(f, "disk full"),
        }
    }
}

impl std::error::Error for WriteError {}

impl From<io::Error> for WriteError {
    fn from(e: io::Error) -> Self {
        match e.raw_os_error() {
            // ENOSPC
            Some(28) => WriteError::DiskFull,
            _ => WriteError::Io(e),
        }
    }
}

/// Failures that can occur while reading a block or piece back from disk.
#[derive(Debug)]
#[non_exhaustive]
pub enum ReadError {
    /// The referenced piece index does not exist in this torrent.
    InvalidPieceIndex,
    /// The requested block lies outside of the piece it's claimed to belong
    /// to.
    InvalidBlockRange,
    /// An IO error occurred during the read.
    Io(io::Error),
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadError::InvalidPieceIndex => write!(f, "invalid piece index"),
            ReadError::InvalidBlockRange => write!(f, "invalid block range"),
            ReadError::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for ReadError {}

impl From<io::Error> for ReadError {
    fn from(e: io::Error) -> Self {
        ReadError::Io(e)
    }
}
