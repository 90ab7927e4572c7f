//! A single peer connection's session loop: handshake, availability
//! exchange, then request pipelining and block transfer (spec.md §4.6).
//!
//! Grounded on the teacher's own `peer.rs` session loop (`PeerSession::
//! start`/`run`, its `Framed<TcpStream, HandshakeCodec>` then `PeerCodec`
//! switch-over via `FramedParts`), generalized to drive the shared
//! `piece_picker::PiecePicker` and per-session `download::PieceDownload`
//! that the teacher's own code already called into before this module was
//! split up.

pub(crate) mod codec;
pub(crate) mod state;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::codec::{Framed, FramedParts};

use crate::alert::{Alert, PeerAlert};
use crate::choke::{self, PeerState};
use crate::download::PieceDownload;
use crate::error::{Error, Result};
use crate::piece_picker::PiecePicker;
use crate::storage_info::StorageInfo;
use crate::{disk::DiskHandle, Bitfield, BlockInfo, PeerId, Sha1Hash, TorrentId};

/// A choking decision the torrent actor's choke rounds hand down to a
/// session, since `PeerSession` owns the socket and the torrent actor
/// doesn't.
pub(crate) enum PeerCommand {
    Choke,
    Unchoke,
    /// A piece the torrent just verified, to be announced to this peer.
    Have(crate::PieceIndex),
}

/// What woke up the session's message loop: a wire message, or a choke
/// verdict from the torrent actor.
enum Next {
    Wire(Option<std::result::Result<Message, Error>>),
    Choke(Option<PeerCommand>),
}

use codec::{Handshake, HandshakeCodec, Message, PeerCodec, PROTOCOL_STRING};
use state::{State, Status};

pub(crate) use state::PeerInfo;

/// Request queue length used before any throughput sample exists yet, e.g.
/// right after a peer is unchoked (spec.md §4.6).
const DEFAULT_REQUEST_QUEUE_LEN: usize = 16;

/// Floor and ceiling for the adaptive request queue length, regardless of
/// what the bandwidth-delay product estimate comes out to.
const MIN_REQUEST_QUEUE_LEN: usize = 2;
const MAX_REQUEST_QUEUE_LEN: usize = 500;

/// Everything shared by every session of one torrent: the engine hands this
/// out as an `Arc` so sessions never need to go back through the torrent
/// actor for piece coordination or disk access.
pub(crate) struct SharedStatus {
    pub id: TorrentId,
    pub info_hash: Sha1Hash,
    pub client_id: PeerId,
    pub storage: StorageInfo,
    pub piece_picker: RwLock<PiecePicker>,
    pub disk: DiskHandle,
    pub alerts: crate::alert::AlertSender,
    /// Per-peer choke bookkeeping the torrent actor's choke rounds read and
    /// mutate (spec.md §4.8); sessions update their own entry's interest
    /// flag and throughput as messages and blocks arrive.
    pub peer_states: Mutex<HashMap<PeerId, PeerState>>,
    /// Where a choke round delivers its verdict for a connected peer. Keyed
    /// by peer id rather than address since that's what `choke::Choker`
    /// scores by.
    pub peer_commands: StdMutex<HashMap<PeerId, mpsc::UnboundedSender<PeerCommand>>>,
    /// Live session count, tracked separately from `peer_states` since it's
    /// bumped the moment a session registers and dropped unconditionally on
    /// cleanup, giving `Torrent::connect_peers` a cheap, always-current cap
    /// check without awaiting the peer state lock.
    pub active_peers: std::sync::atomic::AtomicUsize,
}

pub(crate) struct PeerSession {
    torrent: Arc<SharedStatus>,
    state: State,
    addr: SocketAddr,
    is_outbound: bool,
    peer_id: Option<PeerId>,
    status: Status,
    /// Pieces the session is currently requesting blocks for.
    downloads: HashMap<crate::PieceIndex, PieceDownload>,
    /// Blocks requested but not yet received, used to enforce
    /// `MAX_REQUEST_QUEUE_LEN` and to cancel on disconnect.
    outstanding_requests: Vec<BlockInfo>,
    /// Smoothed download rate, fed to `choke::PeerState` for unchoke scoring.
    download_rate: crate::counter::ThruputCounter,
    /// Smoothed upload rate, fed to `choke::PeerState` for unchoke scoring
    /// while seeding.
    upload_rate: crate::counter::ThruputCounter,
    /// The receiving half of this session's choke command channel, set up
    /// once the peer id is known and the session registers itself with the
    /// torrent's shared choke bookkeeping.
    choke_commands: Option<mpsc::UnboundedReceiver<PeerCommand>>,
}

impl PeerSession {
    pub fn peer_id(&self) -> Option<PeerId> {
        self.peer_id
    }

    pub fn outbound(torrent: Arc<SharedStatus>, addr: SocketAddr) -> Self {
        Self {
            torrent,
            state: State::default(),
            addr,
            is_outbound: true,
            peer_id: None,
            status: Status::default(),
            downloads: HashMap::new(),
            outstanding_requests: Vec::new(),
            download_rate: crate::counter::ThruputCounter::new(),
            upload_rate: crate::counter::ThruputCounter::new(),
            choke_commands: None,
        }
    }

    /// Connects to the peer, performs the handshake and availability
    /// exchange, then drives the message loop until disconnection.
    pub async fn start(&mut self) -> Result<()> {
        log::info!("Connecting to peer {}", self.addr);
        self.state = State::Connecting;
        let socket = TcpStream::connect(self.addr).await?;
        log::info!("Connected to peer {}", self.addr);

        let mut socket = Framed::new(socket, HandshakeCodec);

        self.state = State::Handshaking;
        let handshake =
            Handshake::new(self.torrent.info_hash, self.torrent.client_id);
        log::debug!("Sending handshake to {}", self.addr);
        socket.send(handshake).await?;

        let peer_handshake = socket
            .next()
            .await
            .ok_or(Error::Channel)??;
        debug_assert_eq!(peer_handshake.prot, PROTOCOL_STRING.as_bytes());
        if peer_handshake.info_hash != self.torrent.info_hash {
            log::warn!("Peer {} sent mismatched info hash", self.addr);
            return Err(Error::InvalidPeerInfoHash);
        }
        let peer_id = peer_handshake.peer_id;
        self.peer_id = Some(peer_id);

        let (choke_tx, choke_rx) = mpsc::unbounded_channel();
        self.choke_commands = Some(choke_rx);
        self.torrent
            .peer_states
            .lock()
            .await
            .insert(peer_id, PeerState::new());
        self.torrent
            .peer_commands
            .lock()
            .unwrap()
            .insert(peer_id, choke_tx);
        self.torrent
            .active_peers
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        self.state = State::AvailabilityExchange;
        self.torrent.alerts.send(Alert::Peer(
            self.torrent.id,
            PeerAlert::Connected(self.addr),
        ));

        let parts = socket.into_parts();
        let mut parts = FramedParts::new(parts.io, PeerCodec);
        parts.read_buf = parts.read_buf;
        parts.write_buf = parts.write_buf;
        let mut socket = Framed::from_parts(parts);

        let own_bitfield =
            self.torrent.piece_picker.read().await.own_bitfield();
        if own_bitfield.count_ones() > 0 {
            socket.send(Message::Bitfield(own_bitfield)).await?;
        }

        let result = self.run(&mut socket).await;

        if let Some(peer_id) = self.peer_id {
            self.torrent.peer_states.lock().await.remove(&peer_id);
            self.torrent.peer_commands.lock().unwrap().remove(&peer_id);
            self.torrent
                .active_peers
                .fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
        }
        self.torrent.alerts.send(Alert::Peer(
            self.torrent.id,
            PeerAlert::Disconnected(self.addr),
        ));
        self.state = State::Disconnected;

        result
    }

    async fn run(
        &mut self,
        socket: &mut Framed<TcpStream, PeerCodec>,
    ) -> Result<()> {
        self.state = State::Connected;
        loop {
            let mut choke_commands = self.choke_commands.take();
            let next = match &mut choke_commands {
                Some(rx) => {
                    tokio::select! {
                        msg = socket.next() => Next::Wire(msg),
                        cmd = rx.recv() => Next::Choke(cmd),
                    }
                }
                None => Next::Wire(socket.next().await),
            };
            self.choke_commands = choke_commands;

            match next {
                Next::Wire(Some(msg)) => {
                    self.handle_msg(socket, msg?).await?;
                    if !self.status.is_choked {
                        self.make_requests(socket).await?;
                    }
                }
                Next::Wire(None) => break,
                Next::Choke(Some(cmd)) => self.apply_command(socket, cmd).await?,
                Next::Choke(None) => {}
            }
        }
        log::info!("Peer {} closed connection", self.addr);
        self.release_unfinished_pieces().await;
        Ok(())
    }

    /// Applies a verdict or announcement handed down from the torrent actor:
    /// a Choke/Unchoke from a choke round, or a Have for a piece it just
    /// verified.
    async fn apply_command(
        &mut self,
        socket: &mut Framed<TcpStream, PeerCodec>,
        cmd: PeerCommand,
    ) -> Result<()> {
        match cmd {
            PeerCommand::Choke => {
                self.status.is_peer_choked = true;
                socket.send(Message::Choke).await?;
            }
            PeerCommand::Unchoke => {
                self.status.is_peer_choked = false;
                socket.send(Message::Unchoke).await?;
            }
            PeerCommand::Have(piece_index) => {
                socket.send(Message::Have { piece_index }).await?;
            }
        }
        Ok(())
    }

    async fn handle_msg(
        &mut self,
        socket: &mut Framed<TcpStream, PeerCodec>,
        msg: Message,
    ) -> Result<()> {
        match msg {
            Message::KeepAlive => {}
            Message::Choke => {
                self.status.is_choked = true;
                self.release_unfinished_pieces().await;
            }
            Message::Unchoke => {
                self.status.is_choked = false;
            }
            Message::Interested => {
                self.status.is_peer_interested = true;
                self.set_shared_interest(true).await;
            }
            Message::NotInterested => {
                self.status.is_peer_interested = false;
                self.set_shared_interest(false).await;
            }
            Message::Have { piece_index } => {
                let interested = self
                    .torrent
                    .piece_picker
                    .write()
                    .await
                    .received_have(piece_index)?;
                if interested && !self.status.is_interested {
                    self.status.is_interested = true;
                    socket.send(Message::Interested).await?;
                }
            }
            Message::Bitfield(bitfield) => {
                if self.state != State::AvailabilityExchange
                    && self.state != State::Connected
                {
                    return Err(Error::BitfieldNotAfterHandshake);
                }
                self.handle_bitfield_msg(socket, bitfield).await?;
            }
            Message::Request(info) => {
                self.serve_request(socket, info).await?;
            }
            Message::Cancel(_) => {}
            Message::Block { block_info, data } => {
                self.handle_block_msg(block_info, data).await?;
            }
        }
        Ok(())
    }

    async fn handle_bitfield_msg(
        &mut self,
        socket: &mut Framed<TcpStream, PeerCodec>,
        bitfield: Bitfield,
    ) -> Result<()> {
        let interested = self
            .torrent
            .piece_picker
            .write()
            .await
            .register_availability(&bitfield)?;
        self.state = State::Connected;
        if interested {
            self.status.is_interested = true;
            socket.send(Message::Interested).await?;
        }
        Ok(())
    }

    /// Serves a block request from the peer, reading it back from disk and
    /// sending it, unless we currently have this peer choked (spec.md §4.6,
    /// §4.8: choking a peer must invalidate any request fulfilment, so a
    /// request arriving while choked is silently dropped rather than
    /// queued).
    async fn serve_request(
        &mut self,
        socket: &mut Framed<TcpStream, PeerCodec>,
        info: BlockInfo,
    ) -> Result<()> {
        if self.status.is_peer_choked {
            log::debug!(
                "Ignoring request from {} while it's choked",
                self.addr
            );
            return Ok(());
        }
        let data = match self.torrent.disk.read_block(self.torrent.id, info).await {
            Ok(data) => data,
            Err(e) => {
                log::warn!(
                    "Failed to read block {:?} requested by {}: {}",
                    info,
                    self.addr,
                    e
                );
                return Ok(());
            }
        };
        let len = data.len() as u32;
        socket
            .send(Message::Block { block_info: info, data })
            .await?;
        self.upload_rate.update(len);
        self.record_upload().await;
        Ok(())
    }

    /// The number of requests to keep outstanding at once, raised
    /// adaptively with the bandwidth-delay product of the current download
    /// rate (spec.md §4.6) so a fast peer isn't starved waiting on a fixed,
    /// small pipeline depth.
    fn best_request_queue_len(&self) -> usize {
        let rate = self.download_rate.rate();
        if rate == 0 {
            return DEFAULT_REQUEST_QUEUE_LEN;
        }
        let blocks_per_sec = (rate / u64::from(crate::BLOCK_LEN)) as usize;
        blocks_per_sec.clamp(MIN_REQUEST_QUEUE_LEN, MAX_REQUEST_QUEUE_LEN)
    }

    /// Tops up the outstanding request queue, picking new pieces from the
    /// shared picker as previous ones run out of blocks to request.
    async fn make_requests(
        &mut self,
        socket: &mut Framed<TcpStream, PeerCodec>,
    ) -> Result<()> {
        let mut to_send = Vec::new();
        let queue_len = self.best_request_queue_len();

        while self.outstanding_requests.len() + to_send.len() < queue_len {
            let needed =
                queue_len - self.outstanding_requests.len() - to_send.len();

            let mut picked_any = false;
            for download in self.downloads.values_mut() {
                if to_send.len() >= needed {
                    break;
                }
                let before = to_send.len();
                download.pick_blocks(needed - to_send.len(), &mut to_send);
                if to_send.len() > before {
                    picked_any = true;
                }
            }
            if picked_any {
                continue;
            }

            let picked = self.torrent.piece_picker.write().await.pick_piece();
            match picked {
                Some(piece_index) => {
                    let piece_len =
                        self.torrent.storage.piece_len(piece_index)?;
                    let mut download = PieceDownload::new(piece_index, piece_len);
                    download.pick_blocks(needed, &mut to_send);
                    self.downloads.insert(piece_index, download);
                }
                None => break,
            }
        }

        for info in &to_send {
            socket.send(Message::Request(*info)).await?;
        }
        self.outstanding_requests.extend(to_send);
        Ok(())
    }

    async fn handle_block_msg(
        &mut self,
        block_info: BlockInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        self.outstanding_requests.retain(|r| *r != block_info);

        if let Some(download) = self.downloads.get_mut(&block_info.piece_index)
        {
            download.received_block(block_info);
            let is_piece_done = download.count_missing_blocks() == 0;
            let len = data.len() as u32;

            self.torrent
                .disk
                .write_block(self.torrent.id, block_info, data)?;

            self.download_rate.update(len);
            self.record_block_arrival().await;

            if is_piece_done {
                // Don't mark the piece owned here: the disk actor still has
                // to hash and write it, and only a verified match may flip
                // the picker's own bit (`Torrent::handle_batch_write`). The
                // piece stays in the picker's in-progress set until that
                // verdict comes back, so no other session re-picks it
                // meanwhile.
                self.downloads.remove(&block_info.piece_index);
            }
        } else {
            log::warn!(
                "Peer {} sent unrequested block for piece {}",
                self.addr,
                block_info.piece_index
            );
        }
        Ok(())
    }

    /// Mirrors the peer's interest flag into the torrent-wide choke
    /// bookkeeping, so a choke round sees it without going through us.
    async fn set_shared_interest(&self, is_interested: bool) {
        if let Some(peer_id) = self.peer_id {
            if let Some(state) = self.torrent.peer_states.lock().await.get_mut(&peer_id) {
                state.is_interested = is_interested;
            }
        }
    }

    /// Updates the shared choke bookkeeping with this session's latest
    /// smoothed upload rate, used to score peers while seeding (spec.md
    /// §4.8's `Mode::Seed`).
    async fn record_upload(&self) {
        if let Some(peer_id) = self.peer_id {
            if let Some(state) = self.torrent.peer_states.lock().await.get_mut(&peer_id) {
                state.upload_rate = self.upload_rate.rate();
            }
        }
    }

    /// Updates the shared choke bookkeeping with this session's latest
    /// smoothed download rate and last-data timestamp, for the next choke
    /// round's scoring and snub detection.
    async fn record_block_arrival(&self) {
        if let Some(peer_id) = self.peer_id {
            if let Some(state) = self.torrent.peer_states.lock().await.get_mut(&peer_id) {
                state.download_rate = self.download_rate.rate();
                state.last_data_at = std::time::Instant::now();
                state.is_snubbed = false;
            }
        }
    }

    /// Releases every piece this session had picked back to the shared
    /// picker, e.g. because the peer choked us or disconnected mid-download.
    async fn release_unfinished_pieces(&mut self) {
        if self.downloads.is_empty() {
            return;
        }
        let mut picker = self.torrent.piece_picker.write().await;
        for index in self.downloads.keys() {
            picker.release_piece(*index);
        }
        self.downloads.clear();
        self.outstanding_requests.clear();
    }
}
