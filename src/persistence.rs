//! Per-torrent resume files and the engine-wide `config.json` (spec.md
//! §4.12).
//!
//! No teacher module covers this (cratetorrent never implemented resume);
//! the atomic tmp-then-rename write protocol is grounded on the
//! allocate-then-open sequencing already used by `disk::io::Torrent::new`,
//! generalized here with `tokio::fs` instead of blocking `std::fs`, since
//! this runs on the async engine loop rather than inside `spawn_blocking`.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Bitfield, Sha1Hash};

/// The current resume file schema version. Bumped whenever a
/// backwards-incompatible field change is made.
const SCHEMA_VERSION: u32 = 1;

/// Errors that can occur while loading or saving persisted state.
#[derive(Debug)]
#[non_exhaustive]
pub enum PersistError {
    Io(std::io::Error),
    Json(serde_json::Error),
    /// The resume file's schema version doesn't match ours.
    SchemaMismatch { found: u32, expected: u32 },
}

impl fmt::Display for PersistError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistError::Io(e) => write!(f, "io error: {}", e),
            PersistError::Json(e) => write!(f, "json error: {}", e),
            PersistError::SchemaMismatch { found, expected } => write!(
                f,
                "resume file schema version {} doesn't match expected {}",
                found, expected
            ),
        }
    }
}

impl std::error::Error for PersistError {}

impl From<std::io::Error> for PersistError {
    fn from(e: std::io::Error) -> Self {
        PersistError::Io(e)
    }
}

impl From<serde_json::Error> for PersistError {
    fn from(e: serde_json::Error) -> Self {
        PersistError::Json(e)
    }
}

/// The persisted state of a single torrent, keyed by its info hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ResumeState {
    pub schema_version: u32,
    #[serde(with = "hex_info_hash")]
    pub info_hash: Sha1Hash,
    pub name: String,
    pub state: String,
    pub download_path: PathBuf,
    /// Base64 of the MSB-first packed completion bitfield.
    pub bitfield: String,
    pub downloaded: u64,
    pub uploaded: u64,
    pub total_len: u64,
    pub piece_len: u32,
    pub piece_count: usize,
    pub added_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub saved_at: DateTime<Utc>,
    /// The original `.torrent` file's bytes, for torrents added without a
    /// magnet link (so we can always recompute the info hash verbatim).
    pub raw_torrent: Option<String>,
    pub magnet_uri: Option<String>,
}

impl ResumeState {
    pub fn bitfield(&self) -> Option<Bitfield> {
        let bytes = base64::decode(&self.bitfield).ok()?;
        let mut bits = Bitfield::from_vec(bytes);
        bits.truncate(self.piece_count);
        Some(bits)
    }

    pub fn with_bitfield(mut self, bitfield: &Bitfield) -> Self {
        self.bitfield = base64::encode(bitfield.clone().into_vec());
        self
    }
}

mod hex_info_hash {
    use super::Sha1Hash;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(
        hash: &Sha1Hash,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(hash))
    }

    pub fn deserialize<'de, D>(
        deserializer: D,
    ) -> Result<Sha1Hash, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        if bytes.len() != 20 {
            return Err(serde::de::Error::custom(
                "info hash hex must decode to 20 bytes",
            ));
        }
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&bytes);
        Ok(hash)
    }
}

/// Engine-wide options persisted alongside per-torrent resume files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct EngineConfigFile {
    pub schema_version: u32,
    pub listen_port: u16,
    pub download_dir: PathBuf,
}

/// Where resume files and `config.json` are kept.
pub(crate) struct PersistenceDir {
    root: PathBuf,
}

impl PersistenceDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resume_path(&self, info_hash: &Sha1Hash) -> PathBuf {
        self.root.join(format!("{}.resume.json", hex::encode(info_hash)))
    }

    fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }

    /// Serializes `state` and atomically writes it to its resume file:
    /// write to a sibling `.tmp`, then rename over the target. On failure
    /// the temp file is removed rather than left behind.
    pub async fn save_torrent(&self, state: &ResumeState) -> Result<(), PersistError> {
        let path = self.resume_path(&state.info_hash);
        let json = serde_json::to_vec_pretty(state)?;
        atomic_write(&path, &json).await
    }

    /// Loads a torrent's resume state. Returns `Ok(None)` (with a warning
    /// logged) if the file is absent or its schema doesn't match, per
    /// spec.md §4.12's "reject on schema mismatch, return null" contract.
    pub async fn load_torrent(
        &self,
        info_hash: &Sha1Hash,
    ) -> Result<Option<ResumeState>, PersistError> {
        let path = self.resume_path(info_hash);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice::<ResumeState>(&bytes) {
            Ok(state) if state.schema_version == SCHEMA_VERSION => Ok(Some(state)),
            Ok(state) => {
                log::warn!(
                    "Resume file {} has schema version {}, expected {}; ignoring",
                    path.display(),
                    state.schema_version,
                    SCHEMA_VERSION
                );
                Ok(None)
            }
            Err(e) => {
                log::warn!("Resume file {} is corrupt: {}", path.display(), e);
                Ok(None)
            }
        }
    }

    pub async fn save_config(&self, config: &EngineConfigFile) -> Result<(), PersistError> {
        let json = serde_json::to_vec_pretty(config)?;
        atomic_write(&self.config_path(), &json).await
    }

    pub async fn load_config(&self) -> Result<Option<EngineConfigFile>, PersistError> {
        match tokio::fs::read(self.config_path()).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Saves every torrent in `states`, for graceful shutdown (spec.md
    /// §4.12's `save_all()`).
    pub async fn save_all(
        &self,
        states: &[ResumeState],
    ) -> Result<(), PersistError> {
        for state in states {
            self.save_torrent(state).await?;
        }
        Ok(())
    }
}

async fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), PersistError> {
    let tmp_path = path.with_extension("tmp");
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if let Err(e) = tokio::fs::write(&tmp_path, bytes).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e.into());
    }
    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e.into());
    }
    Ok(())
}

/// Whether a torrent has progressed enough since its last save to warrant
/// another autosave pass (spec.md §4.12: at least one `piece_length` of
/// new data, or a non-`Downloading` state).
pub(crate) fn needs_autosave(
    downloaded_since_last_save: u64,
    piece_len: u32,
    state_is_downloading: bool,
) -> bool {
    !state_is_downloading || downloaded_since_last_save >= piece_len as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> ResumeState {
        ResumeState {
            schema_version: SCHEMA_VERSION,
            info_hash: [7u8; 20],
            name: "test.iso".into(),
            state: "Downloading".into(),
            download_path: PathBuf::from("/tmp/downloads"),
            bitfield: base64::encode(vec![0u8; 2]),
            downloaded: 0,
            uploaded: 0,
            total_len: 1024,
            piece_len: 16384,
            piece_count: 8,
            added_at: Utc::now(),
            completed_at: None,
            error: None,
            saved_at: Utc::now(),
            raw_torrent: None,
            magnet_uri: None,
        }
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let dir = tempfile_dir();
        let persistence = PersistenceDir::new(&dir);
        let state = sample_state();
        persistence.save_torrent(&state).await.unwrap();

        let loaded = persistence
            .load_torrent(&state.info_hash)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.name, state.name);
        assert_eq!(loaded.info_hash, state.info_hash);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_load_missing_file_returns_none() {
        let dir = tempfile_dir();
        let persistence = PersistenceDir::new(&dir);
        let result = persistence.load_torrent(&[1u8; 20]).await.unwrap();
        assert!(result.is_none());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_needs_autosave_on_non_downloading_state() {
        assert!(needs_autosave(0, 16384, false));
        assert!(!needs_autosave(100, 16384, true));
        assert!(needs_autosave(16384, 16384, true));
    }

    fn tempfile_dir() -> PathBuf {
        std::env::temp_dir().join(format!(
            "swarmcore-test-{}",
            std::process::id()
        ))
    }
}
