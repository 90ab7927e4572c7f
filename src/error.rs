//! Crate-wide error type.
//!
//! Each component defines its own closed error enum (see `disk::error`,
//! `metainfo::MetainfoError`, `mse::EncryptionError`, `tracker::TrackerError`,
//! `persistence::PersistError`); this module aggregates them into a single
//! `Error` for call sites that bridge components (the engine loop, peer
//! session I/O), mirroring the teacher's existing `crate::error::*` glob
//! imports in `disk/io.rs` and `peer.rs`.

use std::fmt;
use std::io;

use crate::disk::error::{NewTorrentError, ReadError, WriteError};
use crate::metainfo::MetainfoError;
use crate::mse::EncryptionError;
use crate::persistence::PersistError;
use crate::storage_info::InvalidPieceIndex;

/// The master result type used throughout the engine.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The aggregate error type for cross-component failures.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// Wraps a `std::io::Error`, e.g. arising from socket or channel I/O.
    Io(io::Error),
    /// A send on a channel failed because the receiving end was dropped.
    Channel,
    /// The peer's handshake carried an info hash that doesn't match ours.
    InvalidPeerInfoHash,
    /// We expected this peer to be a seed (we don't support serving yet
    /// beyond Have broadcasts) but it isn't.
    PeerNotSeed,
    /// Peer sent a bitfield message outside of the availability exchange
    /// state.
    BitfieldNotAfterHandshake,
    /// Peer violated the wire protocol (oversized frame, bad message id,
    /// request while choking, etc).
    InvalidMessage(String),
    /// Peer's handshake protocol string wasn't the expected "BitTorrent
    /// protocol".
    InvalidProtocolString,
    /// A command referenced a torrent id we don't have.
    InvalidTorrentId,
    /// Metainfo parsing failed.
    Metainfo(MetainfoError),
    /// Disk allocation failed.
    NewTorrent(NewTorrentError),
    /// A disk write failed.
    Write(WriteError),
    /// A disk read failed.
    Read(ReadError),
    /// The MSE/PE handshake failed.
    Encryption(EncryptionError),
    /// A piece index fell outside the torrent's piece count.
    InvalidPieceIndex,
    /// Loading or saving a resume file or `config.json` failed.
    Persist(PersistError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "io error: {}", e),
            Error::Channel => write!(f, "channel closed"),
            Error::InvalidPeerInfoHash => {
                write!(f, "peer handshake info hash mismatch")
            }
            Error::PeerNotSeed => write!(f, "peer is not a seed"),
            Error::BitfieldNotAfterHandshake => {
                write!(f, "bitfield message received outside of handshake")
            }
            Error::InvalidMessage(reason) => {
                write!(f, "invalid peer message: {}", reason)
            }
            Error::InvalidProtocolString => {
                write!(f, "invalid handshake protocol string")
            }
            Error::InvalidTorrentId => write!(f, "invalid torrent id"),
            Error::Metainfo(e) => write!(f, "metainfo error: {}", e),
            Error::NewTorrent(e) => write!(f, "torrent allocation error: {}", e),
            Error::Write(e) => write!(f, "disk write error: {}", e),
            Error::Read(e) => write!(f, "disk read error: {}", e),
            Error::Encryption(e) => write!(f, "encryption error: {}", e),
            Error::InvalidPieceIndex => write!(f, "invalid piece index"),
            Error::Persist(e) => write!(f, "persistence error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::Channel
    }
}

impl From<MetainfoError> for Error {
    fn from(e: MetainfoError) -> Self {
        Error::Metainfo(e)
    }
}

impl From<NewTorrentError> for Error {
    fn from(e: NewTorrentError) -> Self {
        Error::NewTorrent(e)
    }
}

impl From<WriteError> for Error {
    fn from(e: WriteError) -> Self {
        Error::Write(e)
    }
}

impl From<ReadError> for Error {
    fn from(e: ReadError) -> Self {
        Error::Read(e)
    }
}

impl From<EncryptionError> for Error {
    fn from(e: EncryptionError) -> Self {
        Error::Encryption(e)
    }
}

impl From<InvalidPieceIndex> for Error {
    fn from(_: InvalidPieceIndex) -> Self {
        Error::InvalidPieceIndex
    }
}

impl From<PersistError> for Error {
    fn from(e: PersistError) -> Self {
        Error::Persist(e)
    }
}
