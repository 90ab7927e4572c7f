//! The per-torrent actor: owns the lifecycle state machine, the tracker
//! announce schedule, and the set of peer sessions for one torrent
//! (spec.md §4.13).
//!
//! Grounded on the teacher's `disk::DiskHandle` command/alert actor
//! pattern, lifted one level up: `Torrent` plays the role `Disk` plays for
//! file IO, but for a single torrent's swarm; `SharedStatus` (in
//! `peer::mod`) is the equivalent of a cheaply cloned `Arc` handle threaded
//! through every `PeerSession` the way `DiskHandle` is threaded through
//! every caller needing disk access.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use rand::Rng;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{delay_for, interval};

use crate::alert::{Alert, AlertSender, PeerAlert, PieceAlert, TorrentAlert as TorrentAlertEvent};
use crate::choke::{self, Choker};
use crate::conf::TorrentConf;
use crate::disk::{self, DiskHandle};
use crate::discovery::{self, Discovery, NullDiscovery, PeerCandidate};
use crate::error::Result;
use crate::metainfo::Metainfo;
use crate::peer::{PeerCommand, PeerSession, SharedStatus as PeerSharedStatus};
use crate::piece_picker::PiecePicker;
use crate::storage_info::StorageInfo;
use crate::tracker::{Announce, Event as TrackerEvent, TrackerClient};
use crate::{PeerId, Sha1Hash, TorrentId};

/// Default announce interval used when a tracker's response carries neither
/// `interval` nor `min interval` (spec.md §4.9).
const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(1800);

/// Floor under any tracker-supplied announce interval, so a misbehaving or
/// malicious tracker can't force a hammering announce loop.
const MIN_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(60);

/// Starting point for the announce failure backoff (spec.md §4.9).
const BASE_ANNOUNCE_BACKOFF: Duration = Duration::from_secs(15);

/// Ceiling the announce failure backoff is doubled up to.
const MAX_ANNOUNCE_BACKOFF: Duration = Duration::from_secs(30 * 60);

/// Number of consecutive piece-hash failures on a single piece before the
/// torrent gives up and transitions to `Error` (spec.md §4.13's
/// "hash-mismatch exceeds threshold"; the exact count isn't specified
/// upstream, resolved in DESIGN.md).
const HASH_MISMATCH_THRESHOLD: usize = 5;

/// Lifecycle state, following the transition table of spec.md §4.13.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TorrentState {
    Queued,
    Checking,
    Downloading,
    Seeding,
    Paused,
    Error(String),
}

impl TorrentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TorrentState::Queued => "Queued",
            TorrentState::Checking => "Checking",
            TorrentState::Downloading => "Downloading",
            TorrentState::Seeding => "Seeding",
            TorrentState::Paused => "Paused",
            TorrentState::Error(_) => "Error",
        }
    }
}

/// Commands the engine sends to a running torrent actor.
pub(crate) enum Command {
    Start,
    Pause,
    Verify,
    Stop,
    PeerCandidates(Vec<PeerCandidate>),
}

pub(crate) type CommandSender = mpsc::UnboundedSender<Command>;
pub(crate) type CommandReceiver = mpsc::UnboundedReceiver<Command>;

/// A live torrent's actor state. Spawned and owned by `engine::Engine`.
pub(crate) struct Torrent {
    id: TorrentId,
    shared: Arc<PeerSharedStatus>,
    state: TorrentState,
    conf: TorrentConf,
    /// BEP 12 announce tiers: tried left to right within a tier, falling
    /// through to the next tier only once every tracker in the current one
    /// has failed. A tracker that answers is swapped to the front of its
    /// tier so it's tried first next time.
    trackers: Vec<Vec<TrackerClient>>,
    /// How long to wait before the next scheduled announce, last set from
    /// either a tracker's `interval`/`min interval` or the failure backoff.
    next_announce_delay: Duration,
    /// Current failure backoff, doubled (up to `MAX_ANNOUNCE_BACKOFF`) each
    /// time every tier fails, and reset to `BASE_ANNOUNCE_BACKOFF` on the
    /// next success.
    announce_backoff: Duration,
    alerts: AlertSender,
    downloaded: u64,
    uploaded: u64,
    total_len: u64,
    consecutive_hash_failures: HashMap<crate::PieceIndex, usize>,
    started_at: Option<Instant>,
    last_progress_alert_at: Option<Instant>,
    choker: Choker,
    /// DHT/PEX candidate feed (spec.md §4.10); `NullDiscovery` until a real
    /// source is configured, polled on the same tick as tracker re-announce.
    discovery: Box<dyn Discovery>,
    /// Addresses already seen from any source, so a later discovery poll
    /// doesn't re-dial a peer the tracker (or a prior poll) already handed
    /// us.
    known_peer_addrs: HashSet<SocketAddr>,
}

impl Torrent {
    /// Builds a new torrent actor for an already disk-allocated torrent.
    /// `own_pieces` is the resume bitfield if one was loaded, otherwise an
    /// all-false bitfield for a brand new download.
    pub fn new(
        id: TorrentId,
        metainfo: &Metainfo,
        download_dir: std::path::PathBuf,
        client_id: PeerId,
        info_hash: Sha1Hash,
        disk: DiskHandle,
        alerts: AlertSender,
        conf: TorrentConf,
    ) -> Self {
        let storage = StorageInfo::new(metainfo, download_dir);
        let total_len = storage.download_len;
        let piece_picker = PiecePicker::new(metainfo.piece_count());
        let trackers = Self::build_tracker_tiers(metainfo);

        let shared = Arc::new(PeerSharedStatus {
            id,
            info_hash,
            client_id,
            storage,
            piece_picker: RwLock::new(piece_picker),
            disk,
            alerts: alerts.clone(),
            peer_states: tokio::sync::Mutex::new(HashMap::new()),
            peer_commands: std::sync::Mutex::new(HashMap::new()),
            active_peers: std::sync::atomic::AtomicUsize::new(0),
        });

        Self {
            id,
            shared,
            state: TorrentState::Queued,
            conf,
            trackers,
            next_announce_delay: DEFAULT_ANNOUNCE_INTERVAL,
            announce_backoff: BASE_ANNOUNCE_BACKOFF,
            alerts,
            downloaded: 0,
            uploaded: 0,
            total_len,
            consecutive_hash_failures: HashMap::new(),
            started_at: None,
            last_progress_alert_at: None,
            choker: Choker::new(choke::Mode::Leech),
            discovery: Box::new(NullDiscovery),
            known_peer_addrs: HashSet::new(),
        }
    }

    /// Builds the BEP 12 tier list from `announce-list`, falling back to a
    /// single tier holding `announce` if the torrent predates BEP 12 or the
    /// list is empty. Each tier is shuffled once up front (BEP 12's "peers
    /// should use a random tracker within the tier"); a success later
    /// promotes that tracker to the front instead of reshuffling.
    fn build_tracker_tiers(metainfo: &Metainfo) -> Vec<Vec<TrackerClient>> {
        if let Some(tiers) = &metainfo.announce_list {
            let built: Vec<Vec<TrackerClient>> = tiers
                .iter()
                .map(|tier| {
                    let mut clients: Vec<TrackerClient> = tier
                        .iter()
                        .filter_map(|url| url::Url::parse(url).ok())
                        .filter_map(TrackerClient::from_url)
                        .collect();
                    clients.shuffle(&mut rand::thread_rng());
                    clients
                })
                .filter(|tier| !tier.is_empty())
                .collect();
            if !built.is_empty() {
                return built;
            }
        }
        metainfo
            .announce
            .iter()
            .filter_map(|url| url::Url::parse(url).ok())
            .filter_map(TrackerClient::from_url)
            .map(|client| vec![client])
            .collect()
    }

    pub fn state(&self) -> &TorrentState {
        &self.state
    }

    /// Seeds this torrent's state from a loaded resume file: the completion
    /// bitfield, byte counters, and persisted lifecycle state (spec.md
    /// §4.12). Called by the engine right after `new`, before the actor's
    /// command loop starts.
    pub async fn restore(&mut self, resume: &crate::persistence::ResumeState) -> Result<()> {
        if let Some(bitfield) = resume.bitfield() {
            self.shared.piece_picker.write().await.restore_own(bitfield);
        }
        self.downloaded = resume.downloaded;
        self.uploaded = resume.uploaded;
        self.state = match resume.state.as_str() {
            "Paused" => TorrentState::Paused,
            "Seeding" => TorrentState::Seeding,
            "Error" => TorrentState::Error(
                resume.error.clone().unwrap_or_else(|| "resumed in error state".to_string()),
            ),
            _ => TorrentState::Queued,
        };
        Ok(())
    }

    /// Drives the actor's command loop, tracker announce schedule, and disk
    /// alert stream until told to stop.
    pub async fn run(
        &mut self,
        mut commands: CommandReceiver,
        mut disk_alerts: disk::TorrentAlertReceiver,
    ) {
        // spec.md §4.8's 10s regular / 30s optimistic unchoke cadence.
        let mut choke_tick = interval(Duration::from_secs(10));
        let mut optimistic_tick = interval(Duration::from_secs(30));
        let mut discovery_tick = interval(Duration::from_secs(30));
        // Re-armed after every fire with whatever `announce()` just decided
        // `next_announce_delay` should be, since that varies with the
        // tracker's requested interval and the failure backoff.
        let mut announce_delay = delay_for(self.next_announce_delay);
        loop {
            tokio::select! {
                cmd = commands.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if !self.handle_command(cmd).await {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                alert = disk_alerts.recv() => {
                    match alert {
                        Some(disk::TorrentAlert::BatchWrite(result)) => {
                            self.handle_batch_write(result).await;
                        }
                        None => break,
                    }
                }
                _ = &mut announce_delay => {
                    if matches!(self.state, TorrentState::Downloading | TorrentState::Seeding) {
                        self.announce(TrackerEvent::Started).await;
                    }
                    announce_delay = delay_for(self.next_announce_delay);
                }
                _ = choke_tick.tick() => {
                    self.run_choke_round().await;
                }
                _ = optimistic_tick.tick() => {
                    self.run_optimistic_round().await;
                }
                _ = discovery_tick.tick() => {
                    self.poll_discovery();
                }
            }
        }
    }

    /// Pulls newly discovered candidates from whatever `Discovery` source is
    /// configured (spec.md §4.10), deduplicated against peers already known
    /// from any source, and feeds them into the same connection path a
    /// tracker announce uses.
    fn poll_discovery(&mut self) {
        if !self.discovery.is_enabled() {
            return;
        }
        let found = self.discovery.poll_candidates();
        if found.is_empty() {
            return;
        }
        let candidates = discovery::dedup_candidates(&self.known_peer_addrs, found);
        self.connect_peers(candidates);
    }

    /// Runs the 10s regular unchoke round plus a snub scan over every
    /// connected peer, dispatching any resulting choke/unchoke/snub actions
    /// (spec.md §4.8).
    async fn run_choke_round(&mut self) {
        let mut peers = self.shared.peer_states.lock().await;
        if peers.is_empty() {
            return;
        }
        let mut actions = self.choker.detect_snubs(&mut peers);
        actions.extend(self.choker.regular_unchoke(&mut peers));
        drop(peers);
        self.dispatch_choke_actions(actions).await;
    }

    /// Runs the 30s optimistic unchoke round.
    async fn run_optimistic_round(&mut self) {
        let mut peers = self.shared.peer_states.lock().await;
        if peers.is_empty() {
            return;
        }
        let action = self.choker.optimistic_unchoke(&mut peers);
        drop(peers);
        self.dispatch_choke_actions(action.into_iter().collect()).await;
    }

    /// Sends each choke verdict to the peer session's own command channel
    /// and publishes the corresponding alert.
    async fn dispatch_choke_actions(&self, actions: Vec<choke::ChokeAction>) {
        for action in actions {
            let (peer_id, cmd, event) = match action {
                choke::ChokeAction::Choke(id) => {
                    (id, Some(PeerCommand::Choke), PeerAlert::Choked(id))
                }
                choke::ChokeAction::Unchoke(id) => {
                    (id, Some(PeerCommand::Unchoke), PeerAlert::Unchoked(id))
                }
                choke::ChokeAction::Snubbed(id) => (id, None, PeerAlert::Snubbed(id)),
            };
            if let Some(cmd) = cmd {
                let sender = self
                    .shared
                    .peer_commands
                    .lock()
                    .unwrap()
                    .get(&peer_id)
                    .cloned();
                if let Some(sender) = sender {
                    let _ = sender.send(cmd);
                }
            }
            self.alerts.send(Alert::Peer(self.id, event));
        }
    }

    /// Tells every connected session to send `Have` for a piece that just
    /// verified, so peers who already asked for our bitfield learn about it
    /// without waiting for their next re-connect (spec.md §4.6).
    fn broadcast_have(&self, piece_index: crate::PieceIndex) {
        let senders: Vec<_> = self
            .shared
            .peer_commands
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect();
        for sender in senders {
            let _ = sender.send(PeerCommand::Have(piece_index));
        }
    }

    /// Applies a command to the state machine. Returns `false` if the
    /// torrent should shut down its actor loop.
    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Start => self.start().await,
            Command::Pause => self.pause(),
            Command::Verify => self.verify().await,
            Command::Stop => {
                self.announce(TrackerEvent::Stopped).await;
                return false;
            }
            Command::PeerCandidates(candidates) => self.connect_peers(candidates),
        }
        true
    }

    async fn start(&mut self) {
        match self.state {
            TorrentState::Queued => {
                self.state = TorrentState::Checking;
                self.started_at = Some(Instant::now());
                self.run_check().await;
            }
            TorrentState::Paused => {
                self.state = TorrentState::Checking;
                self.run_check().await;
            }
            TorrentState::Error(_) => {
                self.state = TorrentState::Checking;
                self.consecutive_hash_failures.clear();
                self.run_check().await;
            }
            _ => {}
        }
    }

    fn pause(&mut self) {
        match self.state {
            TorrentState::Paused | TorrentState::Error(_) => {}
            _ => {
                self.state = TorrentState::Paused;
                self.alerts.send(Alert::Torrent(
                    self.id,
                    TorrentAlertEvent::Paused,
                ));
            }
        }
    }

    async fn verify(&mut self) {
        if matches!(self.state, TorrentState::Error(_)) {
            return;
        }
        self.state = TorrentState::Checking;
        self.run_check().await;
    }

    /// Re-verifies every piece on disk against its expected hash, seeding
    /// the shared piece picker with the result and transitioning per
    /// spec.md §4.13's Checking row.
    async fn run_check(&mut self) {
        match self.shared.disk.verify_files(self.id).await {
            Ok(valid) => {
                let is_complete = valid.iter().all(|v| *v);
                {
                    let mut picker = self.shared.piece_picker.write().await;
                    for (index, has_piece) in valid.iter().enumerate() {
                        if *has_piece {
                            picker.received_piece(index);
                        }
                    }
                }
                if is_complete {
                    self.transition_to_seeding();
                } else {
                    self.state = TorrentState::Downloading;
                    self.choker.set_mode(choke::Mode::Leech);
                    self.announce(TrackerEvent::Started).await;
                }
            }
            Err(e) => self.fail(format!("verification failed: {}", e)),
        }
    }

    fn transition_to_seeding(&mut self) {
        let was_downloading = self.state != TorrentState::Seeding;
        self.state = TorrentState::Seeding;
        self.choker.set_mode(choke::Mode::Seed);
        if was_downloading {
            self.alerts
                .send(Alert::Torrent(self.id, TorrentAlertEvent::Completed));
        }
    }

    fn fail(&mut self, reason: String) {
        self.state = TorrentState::Error(reason.clone());
        self.alerts
            .send(Alert::Torrent(self.id, TorrentAlertEvent::Error(reason)));
    }

    /// Processes a disk alert reporting the outcome of flushing a piece's
    /// blocks, tracking hash-mismatch counts and disk-full errors per
    /// spec.md §4.13.
    async fn handle_batch_write(
        &mut self,
        result: std::result::Result<disk::BatchWrite, disk::error::WriteError>,
    ) {
        match result {
            Ok(batch) => {
                self.downloaded += batch
                    .blocks
                    .iter()
                    .map(|b| b.len as u64)
                    .sum::<u64>();
                self.maybe_send_progress();

                match batch.is_piece_valid {
                    Some(true) => {
                        if let Some(&piece_index) =
                            batch.blocks.first().map(|b| &b.piece_index)
                        {
                            self.consecutive_hash_failures.remove(&piece_index);
                            let is_seed = {
                                let mut picker = self.shared.piece_picker.write().await;
                                picker.received_piece(piece_index);
                                picker.is_seed()
                            };
                            self.alerts.send(Alert::Piece(
                                self.id,
                                PieceAlert::Verified(piece_index),
                            ));
                            self.broadcast_have(piece_index);
                            if is_seed {
                                self.transition_to_seeding();
                            }
                        }
                    }
                    Some(false) => {
                        if let Some(&piece_index) =
                            batch.blocks.first().map(|b| &b.piece_index)
                        {
                            self.shared
                                .piece_picker
                                .write()
                                .await
                                .release_piece(piece_index);
                            self.alerts.send(Alert::Piece(
                                self.id,
                                PieceAlert::Failed(piece_index),
                            ));
                            let failures = self
                                .consecutive_hash_failures
                                .entry(piece_index)
                                .or_insert(0);
                            *failures += 1;
                            if *failures >= HASH_MISMATCH_THRESHOLD {
                                self.fail(format!(
                                    "piece {} failed verification {} times",
                                    piece_index, failures
                                ));
                            }
                        }
                    }
                    None => {}
                }
            }
            Err(disk::error::WriteError::DiskFull) => {
                self.fail("disk is full".to_string());
            }
            Err(e) => {
                log::warn!("Torrent {} write error: {}", self.id, e);
            }
        }
    }

    fn maybe_send_progress(&mut self) {
        let now = Instant::now();
        let should_send = match self.last_progress_alert_at {
            Some(last) => now.duration_since(last) >= Duration::from_secs(1),
            None => true,
        };
        if should_send {
            self.last_progress_alert_at = Some(now);
            self.alerts.send(Alert::Torrent(
                self.id,
                TorrentAlertEvent::Progress {
                    downloaded: self.downloaded,
                    uploaded: self.uploaded,
                    total: self.total_len,
                },
            ));
        }
    }

    fn connect_peers(&mut self, candidates: Vec<PeerCandidate>) {
        if !matches!(
            self.state,
            TorrentState::Downloading | TorrentState::Seeding
        ) {
            return;
        }
        let mut active = self
            .shared
            .active_peers
            .load(std::sync::atomic::Ordering::Relaxed);
        for candidate in candidates {
            if active >= self.conf.max_connected_peer_count {
                break;
            }
            self.known_peer_addrs.insert(candidate.addr);
            self.spawn_peer(candidate.addr);
            active += 1;
        }
    }

    fn spawn_peer(&self, addr: SocketAddr) {
        let shared = Arc::clone(&self.shared);
        tokio::task::spawn(async move {
            let mut session = PeerSession::outbound(shared, addr);
            if let Err(e) = session.start().await {
                log::warn!("Peer session with {} ended: {}", addr, e);
            }
        });
    }

    /// Announces to the first tier that yields a response, trying each
    /// tracker within a tier left to right and falling through to the next
    /// tier only once the whole current one has failed (BEP 12). A tracker
    /// that answers is promoted to the front of its tier. Schedules the next
    /// announce from the response's `interval`/`min interval` on success, or
    /// from the failure backoff if every tier was exhausted.
    async fn announce(&mut self, event: TrackerEvent) {
        let params = Announce {
            info_hash: self.shared.info_hash,
            peer_id: self.shared.client_id,
            port: 6881,
            ip: None,
            downloaded: self.downloaded,
            uploaded: self.uploaded,
            left: self.total_len.saturating_sub(self.downloaded),
            peer_count: Some(self.conf.min_requested_peer_count),
            tracker_id: None,
            event: Some(event),
        };

        let mut outcome = None;
        'tiers: for tier in &mut self.trackers {
            for i in 0..tier.len() {
                match tier[i].announce(params.clone()).await {
                    Ok(resp) => {
                        self.alerts.send(Alert::Tracker(
                            self.id,
                            crate::alert::TrackerAlert::Announce {
                                url: tier[i].to_string(),
                                peers: resp.peers.len(),
                                seeds: resp.seeder_count.unwrap_or(0),
                                leechers: resp.leecher_count.unwrap_or(0),
                            },
                        ));
                        if i != 0 {
                            tier.swap(0, i);
                        }
                        outcome = Some(resp);
                        break 'tiers;
                    }
                    Err(e) => {
                        self.alerts.send(Alert::Tracker(
                            self.id,
                            crate::alert::TrackerAlert::Error {
                                url: tier[i].to_string(),
                                reason: e.to_string(),
                            },
                        ));
                    }
                }
            }
        }

        match outcome {
            Some(resp) => {
                let candidates: Vec<PeerCandidate> = resp
                    .peers
                    .into_iter()
                    .map(|addr| PeerCandidate {
                        addr,
                        source: crate::discovery::DiscoverySource::Tracker,
                    })
                    .collect();
                self.connect_peers(candidates);

                let tracker_interval = resp.interval.unwrap_or(DEFAULT_ANNOUNCE_INTERVAL);
                let tracker_min_interval = resp.min_interval.unwrap_or(MIN_ANNOUNCE_INTERVAL);
                self.next_announce_delay = tracker_interval
                    .max(tracker_min_interval)
                    .max(MIN_ANNOUNCE_INTERVAL);
                self.announce_backoff = BASE_ANNOUNCE_BACKOFF;
            }
            None => {
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..1000));
                self.next_announce_delay = self.announce_backoff + jitter;
                self.announce_backoff =
                    (self.announce_backoff * 2).min(MAX_ANNOUNCE_BACKOFF);
            }
        }
    }
}
