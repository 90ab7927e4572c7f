//! This module defines types used to configure the engine and its parts.

use std::{path::PathBuf, time::Duration};

use crate::mse::EncryptionPolicy;
use crate::PeerId;

/// The default cratetorrent client id.
pub const CRATETORRENT_CLIENT_ID: &PeerId = b"cbt-0000000000000000";

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user. It uses the default cratetorrent client id,
    /// [`CRATETORRENT_CLIENT_ID`].
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf {
                client_id: *CRATETORRENT_CLIENT_ID,
            },
            torrent: TorrentConf::new(download_dir),
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to trackers and other peers.
    pub client_id: PeerId,
}

/// Configuration of the disk IO subsystem.
#[derive(Clone, Debug)]
pub(crate) struct DiskConf {
    /// The number of blocking worker threads `Disk` may use concurrently for
    /// file IO.
    pub write_buffer_capacity: usize,
    /// How new torrent files are allocated on disk before any data arrives.
    pub allocation: AllocationStrategy,
}

impl Default for DiskConf {
    fn default() -> Self {
        Self {
            write_buffer_capacity: 4,
            allocation: AllocationStrategy::Sparse,
        }
    }
}

/// How a torrent's files are allocated on disk ahead of receiving data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AllocationStrategy {
    /// Files are created but left unallocated; holes are filled in as
    /// blocks arrive.
    Sparse,
    /// Files are allocated to their final size up front, without writing
    /// zeroes (where the platform supports it).
    Compact,
    /// Files are allocated to their final size and zero-filled up front.
    Full,
}

/// Configuration of the MSE/PE obfuscation layer (spec.md §4.5).
#[derive(Clone, Copy, Debug)]
pub(crate) struct EncryptionConf {
    pub policy: EncryptionPolicy,
}

impl Default for EncryptionConf {
    fn default() -> Self {
        Self {
            policy: EncryptionPolicy::default(),
        }
    }
}

/// Configuration for a torrent.
///
/// The engine will have a default instance of this applied to all torrents by
/// default, but individual torrents may override this configuration.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory in which a torrent's files are placed upon download and
    /// from which they are seeded.
    pub download_dir: PathBuf,

    /// The minimum number of peers we want to keep in torrent at all times.
    /// This will be configurable later.
    pub min_requested_peer_count: usize,

    /// The max number of connected peers the torrent should have.
    pub max_connected_peer_count: usize,

    /// If the tracker doesn't provide a minimum announce interval, we default
    /// to announcing every 30 seconds.
    pub announce_interval: Duration,

    /// After this many attempts, the torrent stops announcing to a tracker.
    pub tracker_error_threshold: usize,

    /// Disk IO tuning for this torrent.
    pub(crate) disk: DiskConf,

    /// The MSE/PE obfuscation policy used for this torrent's connections.
    pub(crate) encryption: EncryptionConf,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            // We always request at least 10 peers as anything less is a waste
            // of network round trip and it allows us to buffer up a bit more
            // than needed.
            min_requested_peer_count: 10,
            // This value is mostly picked for performance while keeping in mind
            // not to overwhelm the host.
            max_connected_peer_count: 50,
            // needs teting
            announce_interval: Duration::from_secs(60 * 60),
            // needs testing
            tracker_error_threshold: 15,
            disk: DiskConf::default(),
            encryption: EncryptionConf::default(),
        }
    }
}
