//! The multi-torrent, collaborator-facing API (spec.md §6): `add`, `remove`,
//! `start`, `pause`, `verify`, `get`, `list`, `on`, plus the engine-wide
//! `start_engine`/`stop_engine` lifecycle.
//!
//! Grounded on `disk::DiskHandle`'s command/actor pattern, extended one
//! level up: `Engine` owns a single `DiskHandle` and demuxes its
//! `disk::Alert::TorrentAllocation` results by id, handing each spawned
//! `torrent::Torrent` actor its own private `disk::TorrentAlertReceiver` the
//! same way `DiskHandle` already hands a private channel to every caller.

use std::collections::HashMap;
use std::path::PathBuf;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::alert::{self, Alert, AlertReceiver};
use crate::conf::Conf;
use crate::disk::{self, DiskHandle};
use crate::error::{Error, Result};
use crate::metainfo::Metainfo;
use crate::persistence::{needs_autosave, EngineConfigFile, PersistenceDir, ResumeState};
use crate::torrent::{self, Torrent, TorrentState};
use crate::{PeerId, Sha1Hash, TorrentId};

/// How many in-flight alerts a subscriber may lag behind by before it starts
/// missing events (spec.md §4.11).
const ALERT_BUS_CAPACITY: usize = 1024;

/// How often a running torrent is checked for whether it needs an autosave
/// pass (spec.md §4.12).
const AUTOSAVE_TICK: std::time::Duration = std::time::Duration::from_secs(30);

/// A handle to one torrent the engine is managing.
struct TorrentEntry {
    commands: torrent::CommandSender,
    metainfo: Metainfo,
    info_hash: Sha1Hash,
    download_dir: PathBuf,
    task: JoinHandle<()>,
    /// Latest counters observed via `TorrentAlert::Progress`, and the
    /// lifecycle state implied by the most recent lifecycle alert. Neither
    /// is authoritative the way the torrent actor's own fields are, but it's
    /// all the engine can see without going back through the command
    /// channel, so it's what autosave snapshots are built from.
    downloaded: u64,
    uploaded: u64,
    downloaded_at_last_save: u64,
    state: String,
    error: Option<String>,
}

/// The engine-wide swarm coordinator. Owns the disk actor, the torrent
/// registry, the alert bus, and the resume/config persistence layer.
pub struct Engine {
    conf: Conf,
    disk: DiskHandle,
    torrents: HashMap<TorrentId, TorrentEntry>,
    alerts: alert::AlertSender,
    alert_bus: AlertReceiver,
    persistence: PersistenceDir,
    next_id: TorrentId,
    /// Relays the disk actor's per-allocation results from the background
    /// bridge task spawned in `new` to whichever `add` call is awaiting one.
    alloc_alerts: mpsc::UnboundedReceiver<disk::Alert>,
}

impl Engine {
    /// Creates a new engine, spawning the disk actor and bridging its
    /// allocation alerts to each torrent's private channel as torrents are
    /// added. `state_dir` is where resume files and `config.json` live.
    pub fn new(conf: Conf, state_dir: impl Into<PathBuf>) -> Result<Self> {
        let (disk, mut disk_alerts) = DiskHandle::spawn()?;
        let (alerts, alert_bus) = alert::channel(ALERT_BUS_CAPACITY);
        let persistence = PersistenceDir::new(state_dir);

        // The disk actor's allocation alerts need to reach the specific
        // torrent that requested them; we park them here and each `add`
        // call pulls its own result out as it arrives.
        let (alloc_tx, alloc_rx) = mpsc::unbounded_channel();
        tokio::task::spawn(async move {
            while let Some(alert) = disk_alerts.recv().await {
                if alloc_tx.send(alert).is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            conf,
            disk,
            torrents: HashMap::new(),
            alerts,
            alert_bus,
            persistence,
            next_id: 1,
            alloc_alerts: alloc_rx,
        })
    }

    /// Registers a new torrent from parsed metainfo, allocating its files on
    /// disk and spawning its actor task. The torrent starts in `Queued`
    /// state; call [`Engine::start`] to begin checking/downloading.
    pub async fn add(
        &mut self,
        metainfo: Metainfo,
        download_dir: impl Into<PathBuf>,
    ) -> Result<TorrentId> {
        let download_dir = download_dir.into();
        let info_hash = metainfo.create_info_hash()?;
        let id = self.next_id;
        self.next_id += 1;

        let storage = crate::storage_info::StorageInfo::new(&metainfo, download_dir.clone());
        let piece_hashes = metainfo.info.pieces.clone();
        self.disk.allocate_new_torrent(
            id,
            storage,
            piece_hashes,
            self.conf.torrent.disk.allocation,
        )?;

        let disk_alert = self.alloc_alerts.recv().await.ok_or(Error::Channel)?;
        let disk::Alert::TorrentAllocation(result) = disk_alert;
        let allocation = result.map_err(Error::NewTorrent)?;

        let client_id = self.conf.engine.client_id;
        let torrent_conf = self.conf.torrent.clone();
        let mut torrent = Torrent::new(
            id,
            &metainfo,
            download_dir.clone(),
            client_id,
            info_hash,
            self.disk.clone(),
            self.alerts.clone(),
            torrent_conf,
        );

        if let Some(resume) = self.persistence.load_torrent(&info_hash).await? {
            torrent.restore(&resume).await?;
        }

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let disk_alerts = allocation.alert_port;
        let task = tokio::task::spawn(async move {
            torrent.run(cmd_rx, disk_alerts).await;
        });

        self.torrents.insert(
            id,
            TorrentEntry {
                commands: cmd_tx,
                metainfo,
                info_hash,
                download_dir,
                task,
                downloaded: 0,
                uploaded: 0,
                downloaded_at_last_save: 0,
                state: TorrentState::Queued.as_str().to_string(),
                error: None,
            },
        );

        self.alerts.send(Alert::Torrent(id, crate::alert::TorrentAlert::Added));
        Ok(id)
    }

    /// Removes a torrent, stopping its actor and optionally deleting its
    /// downloaded files.
    pub async fn remove(&mut self, id: TorrentId, delete_files: bool) -> Result<()> {
        let entry = self.torrents.remove(&id).ok_or(Error::InvalidTorrentId)?;
        let _ = entry.commands.send(torrent::Command::Stop);
        entry.task.abort();
        if delete_files {
            self.disk.delete_all(id).await?;
        }
        self.alerts
            .send(Alert::Torrent(id, crate::alert::TorrentAlert::Removed));
        Ok(())
    }

    pub fn start(&self, id: TorrentId) -> Result<()> {
        self.send(id, torrent::Command::Start)
    }

    pub fn pause(&self, id: TorrentId) -> Result<()> {
        self.send(id, torrent::Command::Pause)
    }

    pub fn verify(&self, id: TorrentId) -> Result<()> {
        self.send(id, torrent::Command::Verify)
    }

    fn send(&self, id: TorrentId, cmd: torrent::Command) -> Result<()> {
        let entry = self.torrents.get(&id).ok_or(Error::InvalidTorrentId)?;
        entry.commands.send(cmd).map_err(Into::into)
    }

    /// Returns a snapshot of a single torrent's metainfo, for collaborators
    /// that need to inspect it without going through the actor's channel.
    pub fn get(&self, id: TorrentId) -> Option<&Metainfo> {
        self.torrents.get(&id).map(|e| &e.metainfo)
    }

    pub fn list(&self) -> Vec<TorrentId> {
        self.torrents.keys().copied().collect()
    }

    /// Subscribes to the engine-wide alert bus (spec.md §4.11's `on(event)`).
    pub fn on(&self) -> AlertReceiver {
        self.alerts.subscribe()
    }

    /// Marks the engine as started, publishing `EngineAlert::Started`.
    /// Callers should also spawn [`Engine::run`] to drive the autosave loop.
    pub fn start_engine(&self) {
        self.alerts
            .send(Alert::Engine(crate::alert::EngineAlert::Started));
    }

    /// Drives the engine's background bookkeeping: listens for per-torrent
    /// progress alerts to track bytes downloaded since the last save, and
    /// autosaves torrents that cross the `needs_autosave` threshold on a
    /// fixed tick (spec.md §4.12). Runs until the alert bus is closed.
    pub async fn run(&mut self) {
        let mut autosave_tick = interval(AUTOSAVE_TICK);
        loop {
            tokio::select! {
                alert = self.alert_bus.recv() => {
                    match alert {
                        Some(Alert::Torrent(id, torrent_alert)) => {
                            self.track_torrent_alert(id, torrent_alert);
                        }
                        Some(_) => {}
                        None => break,
                    }
                }
                _ = autosave_tick.tick() => {
                    self.autosave_due_torrents().await;
                }
            }
        }
    }

    /// Folds a torrent alert into the cached counters/state `TorrentEntry`
    /// keeps for autosave, since the engine has no other view into the
    /// actor's own state past this point.
    fn track_torrent_alert(&mut self, id: TorrentId, alert: crate::alert::TorrentAlert) {
        use crate::alert::TorrentAlert;
        let entry = match self.torrents.get_mut(&id) {
            Some(entry) => entry,
            None => return,
        };
        match alert {
            TorrentAlert::Progress { downloaded, uploaded, .. } => {
                entry.downloaded = downloaded;
                entry.uploaded = uploaded;
            }
            TorrentAlert::Started | TorrentAlert::Resumed => {
                entry.state = TorrentState::Downloading.as_str().to_string();
            }
            TorrentAlert::Paused => {
                entry.state = TorrentState::Paused.as_str().to_string();
            }
            TorrentAlert::Completed => {
                entry.state = TorrentState::Seeding.as_str().to_string();
            }
            TorrentAlert::Error(reason) => {
                entry.state = "Error".to_string();
                entry.error = Some(reason);
            }
            TorrentAlert::Added | TorrentAlert::Removed => {}
        }
    }

    /// Saves every torrent whose progress since its last save warrants an
    /// autosave pass, per `persistence::needs_autosave`, then resets their
    /// counters.
    async fn autosave_due_torrents(&mut self) {
        let due_ids: Vec<TorrentId> = self
            .torrents
            .iter()
            .filter(|(_, entry)| {
                needs_autosave(
                    entry.downloaded - entry.downloaded_at_last_save,
                    entry.metainfo.info.piece_length as u32,
                    entry.state == TorrentState::Downloading.as_str(),
                )
            })
            .map(|(id, _)| *id)
            .collect();
        if due_ids.is_empty() {
            return;
        }
        let due: Vec<ResumeState> = due_ids
            .iter()
            .filter_map(|id| self.torrents.get(id).map(resume_state_snapshot))
            .collect();
        if let Err(e) = self.persistence.save_all(&due).await {
            log::warn!("Autosave failed: {}", e);
            return;
        }
        for id in due_ids {
            if let Some(entry) = self.torrents.get_mut(&id) {
                entry.downloaded_at_last_save = entry.downloaded;
            }
        }
    }

    /// Gracefully shuts down: persists every torrent's resume state, tells
    /// every torrent actor to stop, and shuts down the disk actor.
    pub async fn stop_engine(&mut self) -> Result<()> {
        self.save_all().await?;
        for (_, entry) in self.torrents.drain() {
            let _ = entry.commands.send(torrent::Command::Stop);
            entry.task.abort();
        }
        self.disk.shutdown()?;
        self.alerts
            .send(Alert::Engine(crate::alert::EngineAlert::Stopped));
        Ok(())
    }

    /// Persists every torrent's resume state and the engine's own
    /// `config.json`, for graceful shutdown or a periodic autosave tick.
    async fn save_all(&self) -> Result<()> {
        let mut states = Vec::with_capacity(self.torrents.len());
        for (_, entry) in &self.torrents {
            states.push(resume_state_snapshot(entry));
        }
        self.persistence.save_all(&states).await?;
        self.persistence
            .save_config(&EngineConfigFile {
                schema_version: 1,
                listen_port: 6881,
                download_dir: self
                    .torrents
                    .values()
                    .next()
                    .map(|e| e.download_dir.clone())
                    .unwrap_or_default(),
            })
            .await?;
        Ok(())
    }
}

/// Builds a resume snapshot from what the engine has observed of a torrent
/// via its alert stream. Byte counters and lifecycle state are real, but the
/// per-piece completion bitfield isn't: `Torrent` never publishes one, so a
/// resumed torrent always re-verifies from an empty bitfield via
/// `Command::Verify` rather than trusting a stale one.
fn resume_state_snapshot(entry: &TorrentEntry) -> ResumeState {
    ResumeState {
        schema_version: 1,
        info_hash: entry.info_hash,
        name: entry.metainfo.info.name.clone(),
        state: entry.state.clone(),
        download_path: entry.download_dir.clone(),
        bitfield: base64::encode(vec![0u8; (entry.metainfo.piece_count() + 7) / 8]),
        downloaded: entry.downloaded,
        uploaded: entry.uploaded,
        total_len: entry.metainfo.info.total_len(),
        piece_len: entry.metainfo.info.piece_length as u32,
        piece_count: entry.metainfo.piece_count(),
        added_at: chrono::Utc::now(),
        completed_at: None,
        error: entry.error.clone(),
        saved_at: chrono::Utc::now(),
        raw_torrent: None,
        magnet_uri: None,
    }
}

/// Generates a random 20-byte peer id with the azureus-style prefix
/// convention, for engines that don't want to hardcode
/// [`crate::conf::CRATETORRENT_CLIENT_ID`].
pub fn random_peer_id() -> PeerId {
    let mut id = [0u8; 20];
    id[..8].copy_from_slice(b"-CT0001-");
    rand::thread_rng().fill(&mut id[8..]);
    id
}
