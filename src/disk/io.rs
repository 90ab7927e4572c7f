use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::ops::Range;
use std::os::unix::io::AsRawFd;
use std::sync::{Arc, Mutex};

use nix::sys::statvfs::statvfs;
use nix::sys::uio::pwritev;
use sha1::{Digest, Sha1};
use tokio::sync::{mpsc, RwLock};
use tokio::task;

use super::error::{NewTorrentError, ReadError, Result, WriteError};
use super::{
    Alert, AlertReceiver, AlertSender, BatchWrite, Command, CommandReceiver,
    CommandSender, PieceReadOutcome, TorrentAlert, TorrentAlertReceiver,
    TorrentAlertSender, TorrentAllocation,
};
use crate::conf::AllocationStrategy;
use crate::error::Error;
use crate::iovecs::{IoVec, IoVecs};
use crate::storage_info::{FsStructure, StorageInfo};
use crate::{block_count, BlockInfo, FileInfo, PieceIndex, Sha1Hash, TorrentId};

/// The entity responsible for saving downloaded file blocks to disk and
/// verifying whether downloaded pieces are valid.
pub(super) struct Disk {
    /// Each torrent in engine has a corresponding entry in this hashmap, which
    /// includes various metadata about torrent and the torrent specific alert
    /// channel.
    torrents: HashMap<TorrentId, RwLock<Torrent>>,
    /// Port on which disk IO commands are received.
    cmd_port: CommandReceiver,
    /// Channel on which `Disk` sends alerts to the torrent engine.
    alert_chan: AlertSender,
}

impl Disk {
    /// Creates a new `Disk` instance and returns a command sender and an alert
    /// receiver.
    pub(super) fn new() -> Result<(Self, CommandSender, AlertReceiver)> {
        let (alert_chan, alert_port) = mpsc::unbounded_channel();
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        Ok((
            Self {
                torrents: HashMap::new(),
                cmd_port,
                alert_chan,
            },
            cmd_chan,
            alert_port,
        ))
    }

    /// Starts the disk event loop which is run until shutdown or an
    /// unrecoverable error occurs (e.g. mpsc channel failure).
    pub(super) async fn start(&mut self) -> Result<()> {
        log::info!("Starting disk IO event loop");
        while let Some(cmd) = self.cmd_port.recv().await {
            log::debug!("Disk received command");
            match cmd {
                Command::NewTorrent {
                    id,
                    info,
                    piece_hashes,
                    allocation,
                } => {
                    if self.torrents.contains_key(&id) {
                        log::warn!("Torrent {} already allocated", id);
                        self.alert_chan.send(Alert::TorrentAllocation(Err(
                            NewTorrentError::AlreadyExists,
                        )))?;
                        continue;
                    }

                    let required = required_space(&info);
                    match available_space(&nearest_existing_ancestor(
                        &info.download_path,
                    )) {
                        Ok(available) if available < required => {
                            log::warn!(
                                "Torrent {} needs {} bytes, only {} available",
                                id,
                                required,
                                available
                            );
                            self.alert_chan.send(Alert::TorrentAllocation(
                                Err(NewTorrentError::InsufficientSpace),
                            ))?;
                            continue;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            log::warn!(
                                "Failed to check free space for torrent {}: {}",
                                id,
                                e
                            );
                        }
                    }

                    // NOTE: Do _NOT_ return on failure, we don't want to kill
                    // the disk task due to potential disk IO errors: we just
                    // want to log it and notify engine of it.
                    let torrent_res = Torrent::new(info, piece_hashes, allocation);
                    match torrent_res {
                        Ok((torrent, alert_port)) => {
                            log::info!("Torrent {} successfully allocated", id);
                            self.torrents.insert(id, RwLock::new(torrent));
                            self.alert_chan.send(Alert::TorrentAllocation(
                                Ok(TorrentAllocation { id, alert_port }),
                            ))?;
                        }
                        Err(e) => {
                            log::warn!(
                                "Torrent {} allocation failure: {}",
                                id,
                                e
                            );
                            self.alert_chan
                                .send(Alert::TorrentAllocation(Err(e)))?;
                        }
                    }
                }
                Command::WriteBlock { id, info, data } => {
                    self.write_block(id, info, data).await?;
                }
                Command::ReadBlock { id, info, notify } => {
                    let result = self.read_block(id, info).await;
                    let _ = notify.send(result);
                }
                Command::ReadPiece {
                    id,
                    piece_index,
                    notify,
                } => {
                    let result = self.read_piece(id, piece_index).await;
                    let _ = notify.send(result);
                }
                Command::VerifyFiles { id, notify } => {
                    let result = self.verify_files(id).await;
                    let _ = notify.send(result);
                }
                Command::DeleteAll { id, notify } => {
                    let result = self.delete_all(id).await;
                    let _ = notify.send(result);
                }
                Command::Shutdown => {
                    log::info!("Shutting down disk event loop");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Queues a block for writing and fails if the torrent id is invalid.
    ///
    /// If the block could not be written due to IO failure, the torrent is
    /// notified of it.
    async fn write_block(
        &self,
        id: TorrentId,
        info: BlockInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        log::trace!("Saving torrent {} block {:?} to disk", id, info);

        let torrent = self.torrents.get(&id).ok_or_else(|| {
            log::warn!("Torrent {} not found", id);
            Error::InvalidTorrentId
        })?;
        torrent.write().await.write_block(info, data).await
    }

    /// Reads a single block back from disk, e.g. to serve an upload request.
    async fn read_block(
        &self,
        id: TorrentId,
        info: BlockInfo,
    ) -> std::result::Result<Vec<u8>, ReadError> {
        let torrent = self
            .torrents
            .get(&id)
            .ok_or(ReadError::InvalidPieceIndex)?;
        let torrent = torrent.read().await;
        let piece_len = torrent
            .info
            .piece_len(info.piece_index)
            .map_err(|_| ReadError::InvalidPieceIndex)?;
        if info.offset + info.len > piece_len {
            return Err(ReadError::InvalidBlockRange);
        }
        let torrent_offset = info.piece_index as u64
            * torrent.info.piece_len as u64
            + info.offset as u64;
        let files = Arc::clone(&torrent.files);
        let len = info.len;
        task::spawn_blocking(move || read_bytes(&files, torrent_offset, len))
            .await
            .expect("disk IO read task panicked")
    }

    /// Reads an entire piece back from disk and checks it against its
    /// expected hash, used when recovering state from a resume file.
    async fn read_piece(
        &self,
        id: TorrentId,
        piece_index: PieceIndex,
    ) -> std::result::Result<PieceReadOutcome, ReadError> {
        let torrent = self
            .torrents
            .get(&id)
            .ok_or(ReadError::InvalidPieceIndex)?;
        let torrent = torrent.read().await;
        let piece_len = torrent
            .info
            .piece_len(piece_index)
            .map_err(|_| ReadError::InvalidPieceIndex)?;
        let expected_hash = torrent
            .piece_hash(piece_index)
            .ok_or(ReadError::InvalidPieceIndex)?;
        let torrent_offset = piece_index as u64 * torrent.info.piece_len as u64;
        let files = Arc::clone(&torrent.files);
        task::spawn_blocking(move || {
            let data = read_bytes(&files, torrent_offset, piece_len)?;
            let mut hasher = Sha1::new();
            hasher.input(&data);
            let hash = hasher.result();
            let is_valid = hash.as_slice() == expected_hash;
            Ok(PieceReadOutcome { data, is_valid })
        })
        .await
        .expect("disk IO read task panicked")
    }

    /// Checks every piece of a torrent already present on disk for whether
    /// its backing files exist and are at least as long as expected, used on
    /// startup to recover from a resume file (spec.md §4.12). This is a
    /// cheap existence+size check, not a rehash: a corrupt but correctly
    /// sized file is only caught later, when the piece it belongs to is
    /// actually downloaded and hashed, or via an explicit `Command::Verify`.
    async fn verify_files(
        &self,
        id: TorrentId,
    ) -> std::result::Result<Vec<bool>, ReadError> {
        let torrent = self
            .torrents
            .get(&id)
            .ok_or(ReadError::InvalidPieceIndex)?;
        let torrent = torrent.read().await;
        let piece_count = torrent.piece_hashes.len() / 20;

        let file_ok: Vec<bool> = match &torrent.info.structure {
            FsStructure::File(file) => vec![file_is_present(file)],
            FsStructure::Archive { files } => {
                files.iter().map(file_is_present).collect()
            }
        };

        let mut valid = Vec::with_capacity(piece_count);
        for piece_index in 0..piece_count {
            let files = torrent
                .info
                .files_intersecting_piece(piece_index)
                .map_err(|_| ReadError::InvalidPieceIndex)?;
            valid.push(file_ok[files].iter().all(|ok| *ok));
        }
        Ok(valid)
    }

    /// Deletes all files belonging to a torrent from disk, and drops its
    /// entry so a later command referencing this id cleanly reports
    /// `InvalidTorrentId` instead of operating on a torrent whose files are
    /// gone.
    async fn delete_all(&mut self, id: TorrentId) -> std::io::Result<()> {
        let torrent = match self.torrents.remove(&id) {
            Some(torrent) => torrent,
            None => return Ok(()),
        };
        let torrent = torrent.read().await;
        for file in torrent.files.iter() {
            let file = file.lock().unwrap();
            let _ = fs::remove_file(&file.info.path);
        }
        // Only remove the torrent's own directory tree for archive
        // downloads: a single-file torrent's `download_path` is the shared
        // download directory itself, not a per-torrent subdirectory.
        if torrent.info.structure.is_archive() {
            let _ = fs::remove_dir_all(&torrent.info.download_path);
        }
        Ok(())
    }
}

/// Reads `len` bytes starting at `torrent_offset`, spanning as many of
/// `files` as necessary. A file shorter than its expected slice (a normal
/// state for a torrent that isn't fully downloaded yet) contributes zeroes
/// for its missing tail rather than failing the read; a caller that cares
/// about completeness (piece hash verification) finds out from the hash
/// mismatch, not from an IO error.
fn read_bytes(
    files: &[Mutex<TorrentFile>],
    torrent_offset: u64,
    len: u32,
) -> std::result::Result<Vec<u8>, ReadError> {
    use std::io::{Read, Seek, SeekFrom};

    let mut out = vec![0u8; len as usize];
    let mut remaining = len as u64;
    let mut offset = torrent_offset;
    let mut out_pos = 0usize;
    for file in files.iter() {
        if remaining == 0 {
            break;
        }
        let mut file = file.lock().unwrap();
        let slice = file.info.get_slice(offset, remaining);
        if slice.len == 0 {
            continue;
        }
        let slice_len = slice.len as usize;
        file.handle.seek(SeekFrom::Start(slice.offset))?;
        let mut read_so_far = 0;
        while read_so_far < slice_len {
            let n = file
                .handle
                .read(&mut out[out_pos + read_so_far..out_pos + slice_len])?;
            if n == 0 {
                // past EOF: leave the rest of this slice zeroed
                break;
            }
            read_so_far += n;
        }
        out_pos += slice_len;
        offset += slice.len;
        remaining -= slice.len;
    }
    Ok(out)
}

/// Whether a file exists and is at least as long as expected, for the cheap
/// resume-time check in `Disk::verify_files`.
fn file_is_present(file: &FileInfo) -> bool {
    fs::metadata(&file.path)
        .map(|meta| meta.len() >= file.len)
        .unwrap_or(false)
}

/// The disk space a torrent's full content requires.
fn required_space(info: &StorageInfo) -> u64 {
    info.download_len
}

/// The free space available on the volume backing `path`.
fn available_space(path: &std::path::Path) -> std::io::Result<u64> {
    let stat = statvfs(path).map_err(|e| {
        std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
    })?;
    Ok(stat.blocks_available() * stat.fragment_size())
}

/// Walks up from `path` to the nearest ancestor that actually exists, since
/// a torrent's download directory may not have been created yet when the
/// free-space check runs.
fn nearest_existing_ancestor(path: &std::path::Path) -> std::path::PathBuf {
    let mut current = path;
    loop {
        if current.exists() {
            return current.to_path_buf();
        }
        match current.parent() {
            Some(parent) => current = parent,
            None => return std::path::PathBuf::from("/"),
        }
    }
}

/// Grows `handle` to `target_len` per the torrent's allocation strategy,
/// never touching a file that's already at least that long (e.g. a resumed
/// download).
fn allocate_file(
    handle: &mut File,
    target_len: u64,
    allocation: AllocationStrategy,
) -> std::io::Result<()> {
    let current_len = handle.metadata()?.len();
    if current_len >= target_len {
        return Ok(());
    }
    match allocation {
        AllocationStrategy::Sparse => Ok(()),
        AllocationStrategy::Compact => handle.set_len(target_len),
        AllocationStrategy::Full => {
            handle.set_len(target_len)?;
            zero_fill(handle, current_len, target_len)
        }
    }
}

/// Zero-fills `handle` from `from` up to (excluding) `to`.
fn zero_fill(handle: &mut File, mut from: u64, to: u64) -> std::io::Result<()> {
    use std::io::{Seek, SeekFrom, Write};

    const CHUNK_LEN: usize = 64 * 1024;
    let zeros = [0u8; CHUNK_LEN];
    handle.seek(SeekFrom::Start(from))?;
    while from < to {
        let chunk_len = CHUNK_LEN.min((to - from) as usize);
        handle.write_all(&zeros[..chunk_len])?;
        from += chunk_len as u64;
    }
    Ok(())
}

/// Torrent information related to disk IO.
///
/// Contains the in-progress pieces (i.e. the write buffer), metadata about
/// torrent's download and piece sizes, etc.
struct Torrent {
    /// All information concerning this torrent's storage.
    info: StorageInfo,
    /// The channel used to alert a torrent that a block has been written to
    /// disk and/or a piece was completed.
    alert_chan: TorrentAlertSender,
    /// The in-progress piece downloads and disk writes. This is the torrent's
    /// disk write buffer. Each piece is mapped to its index for faster
    /// lookups.
    pieces: HashMap<PieceIndex, Piece>,
    /// Handles of all files in torrent, opened in advance during torrent
    /// creation.
    files: Arc<Vec<Mutex<TorrentFile>>>,
    /// The concatenation of all expected piece hashes.
    piece_hashes: Vec<u8>,
    /// Disk IO statistics.
    stats: Stats,
}

impl Torrent {
    /// Creates the file system structure of the torrent and opens the file
    /// handles.
    fn new(
        info: StorageInfo,
        piece_hashes: Vec<u8>,
        allocation: AllocationStrategy,
    ) -> Result<(Self, TorrentAlertReceiver), NewTorrentError> {
        let open_file = |info: FileInfo| {
            let mut handle = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(&info.path)
                .map_err(|e| {
                    log::warn!("Failed to open file {:?}", &info.path);
                    NewTorrentError::Io(e)
                })?;
            allocate_file(&mut handle, info.len, allocation).map_err(|e| {
                log::warn!("Failed to allocate file {:?}", &info.path);
                NewTorrentError::Io(e)
            })?;
            Ok(Mutex::new(TorrentFile { info, handle }))
        };

        let files = match &info.structure {
            FsStructure::File(file) => {
                log::debug!(
                    "Torrent is single {} bytes long file {:?}",
                    file.len,
                    file.path
                );
                vec![open_file(file.clone())?]
            }
            FsStructure::Archive { files } => {
                debug_assert!(!files.is_empty());
                log::debug!("Torrent is multi file: {:?}", files);
                let mut torrent_files = Vec::with_capacity(files.len());
                for file in files.iter() {
                    let path = info.download_path.join(&file.path);
                    if let Some(subdir) = path.parent() {
                        if !subdir.exists() {
                            log::info!("Creating torrent subdir {:?}", subdir);
                            fs::create_dir_all(&subdir).map_err(|e| {
                                log::warn!(
                                    "Failed to create subdir {:?}",
                                    subdir
                                );
                                NewTorrentError::Io(e)
                            })?;
                        }
                    }

                    let file = FileInfo {
                        path,
                        torrent_offset: file.torrent_offset,
                        len: file.len,
                    };
                    torrent_files.push(open_file(file)?);
                }
                torrent_files
            }
        };

        let (alert_chan, alert_port) = mpsc::unbounded_channel();

        Ok((
            Self {
                info,
                alert_chan,
                pieces: HashMap::new(),
                files: Arc::new(files),
                piece_hashes,
                stats: Stats::default(),
            },
            alert_port,
        ))
    }

    fn piece_hash(&self, index: PieceIndex) -> Option<Sha1Hash> {
        let start = index * 20;
        let slice = self.piece_hashes.get(start..start + 20)?;
        let mut hash = [0u8; 20];
        hash.copy_from_slice(slice);
        Some(hash)
    }

    async fn write_block(
        &mut self,
        info: BlockInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        log::trace!("Saving block {:?} to disk", info);

        let piece_index = info.piece_index;
        if !self.pieces.contains_key(&piece_index) {
            if let Err(e) = self.start_new_piece(info) {
                self.alert_chan.send(TorrentAlert::BatchWrite(Err(e)))?;
                return Ok(());
            }
        }
        let piece = self
            .pieces
            .get_mut(&piece_index)
            .expect("Newly inserted piece not present");

        piece.enqueue_block(info.offset, data);

        if piece.is_complete() {
            let piece = self.pieces.remove(&piece_index).unwrap();
            let piece_len = self.info.piece_len;
            let files = Arc::clone(&self.files);

            let write_result = task::spawn_blocking(move || {
                let is_piece_valid = piece.matches_hash();

                let (write_count, blocks) = if is_piece_valid {
                    log::info!("Piece {} is valid", piece_index);
                    let piece_torrent_offset =
                        piece_index as u64 * piece_len as u64;
                    let write_count = piece.write(piece_torrent_offset, &files)?;

                    let blocks = piece
                        .blocks
                        .iter()
                        .map(|(offset, block)| BlockInfo {
                            piece_index,
                            offset: *offset,
                            len: block.len() as u32,
                        })
                        .collect();

                    (Some(write_count), blocks)
                } else {
                    log::warn!("Piece {} is NOT valid", piece_index);
                    (None, Vec::new())
                };

                Ok((is_piece_valid, write_count, blocks))
            })
            .await
            .expect("disk IO write task panicked");

            match write_result {
                Ok((is_piece_valid, write_count, blocks)) => {
                    if is_piece_valid {
                        if let Some(write_count) = write_count {
                            self.stats.write_count += write_count as u64;
                        }
                    }

                    self.alert_chan.send(TorrentAlert::BatchWrite(Ok(
                        BatchWrite {
                            blocks,
                            is_piece_valid: Some(is_piece_valid),
                        },
                    )))?;
                }
                Err(e) => {
                    log::warn!("Disk write error: {}", e);
                    self.stats.write_failure_count += 1;

                    self.alert_chan.send(TorrentAlert::BatchWrite(Err(e)))?;
                }
            }
        }

        Ok(())
    }

    /// Starts a new in-progress piece, creating metadata for it in self.
    fn start_new_piece(&mut self, info: BlockInfo) -> Result<(), WriteError> {
        log::trace!("Creating piece {} write buffer", info.piece_index);

        let hash_pos = info.piece_index * 20;
        if hash_pos + 20 > self.piece_hashes.len() {
            log::warn!("Piece index {} is invalid", info.piece_index);
            return Err(WriteError::InvalidPieceIndex);
        }

        let hash_slice = &self.piece_hashes[hash_pos..hash_pos + 20];
        let mut expected_hash = [0; 20];
        expected_hash.copy_from_slice(hash_slice);
        log::debug!(
            "Piece {} expected hash {}",
            info.piece_index,
            hex::encode(&expected_hash)
        );

        let len = self
            .info
            .piece_len(info.piece_index)
            .map_err(|_| WriteError::InvalidPieceIndex)?;
        log::debug!("Piece {} is {} bytes long", info.piece_index, len);

        let files = self
            .info
            .files_intersecting_piece(info.piece_index)
            .map_err(|_| WriteError::InvalidPieceIndex)?;
        log::debug!(
            "Piece {} intersects files: {:?}",
            info.piece_index,
            files
        );

        let piece = Piece {
            expected_hash,
            len,
            blocks: BTreeMap::new(),
            files,
        };
        self.pieces.insert(info.piece_index, piece);

        Ok(())
    }
}

struct TorrentFile {
    info: FileInfo,
    handle: File,
}

impl TorrentFile {
    fn write_vectored_at(
        &self,
        iovecs: &mut IoVecs<'_, '_>,
        offset: u64,
    ) -> Result<usize, WriteError> {
        let mut total_write_count = 0;
        loop {
            let buffers = iovecs.buffers();
            if buffers.is_empty() {
                break;
            }
            let write_count = pwritev(
                self.handle.as_raw_fd(),
                buffers.as_slice(),
                offset as i64,
            )
            .map_err(|e| {
                log::warn!("File {:?} write error: {}", self.info.path, e);
                WriteError::Io(std::io::Error::last_os_error())
            })?;
            iovecs.advance(write_count);
            total_write_count += write_count;
        }
        Ok(total_write_count)
    }
}

#[derive(Default)]
struct Stats {
    /// The number of bytes successfully written to disk.
    write_count: u64,
    /// The number of times we failed to write to disk.
    write_failure_count: usize,
}

/// An in-progress piece download that keeps in memory the so far downloaded
/// blocks and the expected hash of the piece.
struct Piece {
    expected_hash: Sha1Hash,
    len: u32,
    blocks: BTreeMap<u32, Vec<u8>>,
    files: Range<crate::FileIndex>,
}

impl Piece {
    fn enqueue_block(&mut self, offset: u32, data: Vec<u8>) {
        if self.blocks.contains_key(&offset) {
            log::warn!("Duplicate piece block at offset {}", offset);
        } else {
            self.blocks.insert(offset, data);
        }
    }

    fn is_complete(&self) -> bool {
        self.blocks.len() == block_count(self.len)
    }

    fn matches_hash(&self) -> bool {
        debug_assert_eq!(self.blocks.len(), block_count(self.len));
        let mut hasher = Sha1::new();
        for block in self.blocks.values() {
            hasher.input(&block);
        }
        let hash = hasher.result();
        log::debug!("Piece hash: {:x}", hash);
        hash.as_slice() == self.expected_hash
    }

    fn write(
        &self,
        piece_torrent_offset: u64,
        files: &[Mutex<TorrentFile>],
    ) -> Result<usize, WriteError> {
        let mut total_write_count = 0;

        let mut blocks: Vec<_> = self
            .blocks
            .values()
            .map(|b| IoVec::from_slice(b))
            .collect();
        let mut bufs = blocks.as_mut_slice();
        let mut write_torrent_offset = piece_torrent_offset;

        let files = &files[self.files.clone()];
        debug_assert!(!files.is_empty());
        if files.len() == 1 {
            let file = files.first().unwrap().lock().unwrap();
            let slice =
                file.info.get_slice(write_torrent_offset, self.len as u64);
            let mut iovecs = IoVecs::unbounded(bufs);
            total_write_count +=
                file.write_vectored_at(&mut iovecs, slice.offset)?;
            bufs = iovecs.into_tail();
        } else {
            for file in files.iter() {
                let file = file.lock().unwrap();
                let slice =
                    file.info.get_slice(write_torrent_offset, self.len as u64);
                debug_assert!(slice.len > 0);
                debug_assert!(!bufs.is_empty());

                let mut iovecs = IoVecs::bounded(bufs, slice.len as usize);
                let write_count =
                    file.write_vectored_at(&mut iovecs, slice.offset)?;
                bufs = iovecs.into_tail();

                write_torrent_offset += write_count as u64;
                total_write_count += write_count;
            }
        }

        debug_assert!(bufs.is_empty());

        Ok(total_write_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_piece_completion_tracking() {
        let mut piece = Piece {
            expected_hash: [0u8; 20],
            len: crate::BLOCK_LEN,
            blocks: BTreeMap::new(),
            files: 0..1,
        };
        assert!(!piece.is_complete());
        piece.enqueue_block(0, vec![0u8; crate::BLOCK_LEN as usize]);
        assert!(piece.is_complete());
    }
}
