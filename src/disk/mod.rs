//! The disk IO actor: an independent task that owns all file handles and
//! performs block writes, piece verification, and resume-file style reads on
//! behalf of every torrent in the engine (spec.md §4.4).
//!
//! `Disk` itself lives in `io` and runs the event loop; this module defines
//! the command/alert vocabulary and `DiskHandle`, the cheaply cloneable
//! façade other components (`peer`, `torrent`) use to talk to it, mirroring
//! how the teacher splits `PeerSession` (actor) from its channel-based
//! collaborators.

pub mod error;
mod io;

use std::ops::Range;

use tokio::sync::mpsc;
use tokio::task;

use crate::conf::AllocationStrategy;
use crate::error::Error;
use crate::storage_info::StorageInfo;
use crate::{BlockInfo, FileIndex, PieceIndex, TorrentId};

use error::{NewTorrentError, ReadError, WriteError};

pub(crate) type CommandSender = mpsc::UnboundedSender<Command>;
pub(crate) type CommandReceiver = mpsc::UnboundedReceiver<Command>;
pub(crate) type AlertSender = mpsc::UnboundedSender<Alert>;
pub(crate) type AlertReceiver = mpsc::UnboundedReceiver<Alert>;
pub(crate) type TorrentAlertSender = mpsc::UnboundedSender<TorrentAlert>;
pub(crate) type TorrentAlertReceiver = mpsc::UnboundedReceiver<TorrentAlert>;

/// Commands sent to the disk task.
pub(crate) enum Command {
    /// Allocates a new torrent's on-disk file structure.
    NewTorrent {
        id: TorrentId,
        info: StorageInfo,
        piece_hashes: Vec<u8>,
        allocation: AllocationStrategy,
    },
    /// Queues a downloaded block for writing; once a piece's blocks are all
    /// present, the piece is hashed and, if valid, flushed to its files.
    WriteBlock {
        id: TorrentId,
        info: BlockInfo,
        data: Vec<u8>,
    },
    /// Reads a single block back from disk (e.g. to serve an upload
    /// request).
    ReadBlock {
        id: TorrentId,
        info: BlockInfo,
        notify: mpsc::UnboundedSender<Result<Vec<u8>, ReadError>>,
    },
    /// Reads an entire piece back from disk, verifying it against its
    /// expected hash as it's read (used when resuming from a partial
    /// download, spec.md §4.12).
    ReadPiece {
        id: TorrentId,
        piece_index: PieceIndex,
        notify: mpsc::UnboundedSender<Result<PieceReadOutcome, ReadError>>,
    },
    /// Re-verifies every piece of a torrent already on disk against its
    /// expected hashes, reporting the resulting bitfield of valid pieces.
    VerifyFiles {
        id: TorrentId,
        notify: mpsc::UnboundedSender<Result<Vec<bool>, ReadError>>,
    },
    /// Deletes all files (and any now-empty directories) belonging to a
    /// torrent.
    DeleteAll {
        id: TorrentId,
        notify: mpsc::UnboundedSender<std::io::Result<()>>,
    },
    /// Shuts down the disk task's event loop.
    Shutdown,
}

/// The outcome of reading back a whole piece from disk.
pub(crate) struct PieceReadOutcome {
    pub data: Vec<u8>,
    pub is_valid: bool,
}

/// Alerts sent by the disk task to the engine, not tied to a specific
/// torrent (e.g. allocation results, which gate whether a torrent can even
/// be registered).
pub(crate) enum Alert {
    /// The result of allocating a new torrent's file structure.
    TorrentAllocation(Result<TorrentAllocation, NewTorrentError>),
}

/// Returned alongside a successful torrent allocation: the id (echoed back
/// so the caller can correlate it) and the receiving end of that torrent's
/// private alert channel.
pub(crate) struct TorrentAllocation {
    pub id: TorrentId,
    pub alert_port: TorrentAlertReceiver,
}

/// Alerts scoped to a single torrent, delivered on its private channel.
pub(crate) enum TorrentAlert {
    /// The result of writing a batch of blocks (ultimately a whole piece)
    /// to disk.
    BatchWrite(Result<BatchWrite, WriteError>),
}

/// Reports which blocks were written as part of completing a piece, and
/// whether the piece turned out to be valid.
pub(crate) struct BatchWrite {
    pub blocks: Vec<BlockInfo>,
    pub is_piece_valid: Option<bool>,
}

/// A cheaply cloneable handle to the disk task, used by every other
/// component that needs to read or write torrent data.
#[derive(Clone)]
pub(crate) struct DiskHandle {
    cmd_chan: CommandSender,
}

impl DiskHandle {
    /// Spawns the disk task on a blocking-friendly thread and returns a
    /// handle to it along with the engine-wide alert receiver.
    pub fn spawn() -> crate::error::Result<(Self, AlertReceiver)> {
        let (mut disk, cmd_chan, alert_port) = io::Disk::new()?;
        task::spawn(async move {
            if let Err(e) = disk.start().await {
                log::error!("Disk task exited with error: {}", e);
            }
        });
        Ok((Self { cmd_chan }, alert_port))
    }

    pub fn allocate_new_torrent(
        &self,
        id: TorrentId,
        info: StorageInfo,
        piece_hashes: Vec<u8>,
        allocation: AllocationStrategy,
    ) -> Result<(), Error> {
        Ok(self.cmd_chan.send(Command::NewTorrent {
            id,
            info,
            piece_hashes,
            allocation,
        })?)
    }

    pub fn write_block(
        &self,
        id: TorrentId,
        info: BlockInfo,
        data: Vec<u8>,
    ) -> Result<(), Error> {
        Ok(self.cmd_chan.send(Command::WriteBlock { id, info, data })?)
    }

    pub async fn read_block(
        &self,
        id: TorrentId,
        info: BlockInfo,
    ) -> Result<Vec<u8>, Error> {
        let (notify, mut port) = mpsc::unbounded_channel();
        self.cmd_chan
            .send(Command::ReadBlock { id, info, notify })?;
        port.recv()
            .await
            .ok_or(Error::Channel)?
            .map_err(Error::Read)
    }

    pub async fn read_piece(
        &self,
        id: TorrentId,
        piece_index: PieceIndex,
    ) -> Result<PieceReadOutcome, Error> {
        let (notify, mut port) = mpsc::unbounded_channel();
        self.cmd_chan.send(Command::ReadPiece {
            id,
            piece_index,
            notify,
        })?;
        port.recv()
            .await
            .ok_or(Error::Channel)?
            .map_err(Error::Read)
    }

    pub async fn verify_files(&self, id: TorrentId) -> Result<Vec<bool>, Error> {
        let (notify, mut port) = mpsc::unbounded_channel();
        self.cmd_chan.send(Command::VerifyFiles { id, notify })?;
        port.recv()
            .await
            .ok_or(Error::Channel)?
            .map_err(Error::Read)
    }

    pub async fn delete_all(&self, id: TorrentId) -> Result<(), Error> {
        let (notify, mut port) = mpsc::unbounded_channel();
        self.cmd_chan.send(Command::DeleteAll { id, notify })?;
        port.recv().await.ok_or(Error::Channel)?.map_err(Error::Io)
    }

    pub fn shutdown(&self) -> Result<(), Error> {
        Ok(self.cmd_chan.send(Command::Shutdown)?)
    }
}

/// A left-inclusive range of file indices a piece overlaps with, used to
/// slice into a torrent's file handle vector.
pub(crate) type FileRange = Range<FileIndex>;
