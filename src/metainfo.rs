//! Parsing of `.torrent` metainfo files (bencoded) and info hash derivation.
//!
//! See spec.md §4.1 and §4.2. Field decoding is delegated to `serde_bencode`;
//! the raw byte span of the `info` dictionary is additionally recovered via
//! `crate::bencode` so the info hash is reproducible byte-for-byte
//! regardless of how our decoder would re-serialize the dictionary.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};

use crate::{bencode, Sha1Hash};

/// Errors that can occur while parsing or validating a torrent's metainfo.
#[derive(Debug)]
#[non_exhaustive]
pub enum MetainfoError {
    /// The top-level document or the `info` dictionary was not valid
    /// bencode.
    Bencode(serde_bencode::Error),
    /// `pieces` is not a multiple of 20 bytes (each SHA-1 hash is 20 bytes).
    InvalidPieceHashLength,
    /// The declared piece count doesn't match
    /// `ceil(total_length / piece_length)`.
    PieceCountMismatch { expected: usize, actual: usize },
    /// `piece_length` is zero.
    InvalidPieceLength,
    /// The top level `name` field is empty.
    EmptyName,
    /// A multi-file torrent's `files` list is empty.
    EmptyFileList,
    /// A file path contains an empty component, `.`, `..`, or an embedded
    /// path separator -- a would-be directory traversal (spec.md §4.2).
    InvalidPath { path: String },
    /// The raw `info` dictionary's byte span could not be located in the
    /// original document.
    MissingInfoSpan,
}

impl fmt::Display for MetainfoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetainfoError::Bencode(e) => write!(f, "bencode error: {}", e),
            MetainfoError::InvalidPieceHashLength => {
                write!(f, "pieces field length is not a multiple of 20")
            }
            MetainfoError::PieceCountMismatch { expected, actual } => write!(
                f,
                "piece count mismatch: expected {} from total length, got {}",
                expected, actual
            ),
            MetainfoError::InvalidPieceLength => {
                write!(f, "piece length must be positive")
            }
            MetainfoError::EmptyName => write!(f, "name must not be empty"),
            MetainfoError::EmptyFileList => {
                write!(f, "multi-file torrent must list at least one file")
            }
            MetainfoError::InvalidPath { path } => {
                write!(f, "invalid file path: {}", path)
            }
            MetainfoError::MissingInfoSpan => {
                write!(f, "could not locate the info dictionary's raw bytes")
            }
        }
    }
}

impl std::error::Error for MetainfoError {}

impl From<serde_bencode::Error> for MetainfoError {
    fn from(e: serde_bencode::Error) -> Self {
        MetainfoError::Bencode(e)
    }
}

/// A parsed and validated torrent metainfo document.
#[derive(Debug, Deserialize)]
pub struct Metainfo {
    pub info: Info,
    pub announce: Option<String>,
    #[serde(rename = "announce-list")]
    pub announce_list: Option<Vec<Vec<String>>>,
}

impl Metainfo {
    /// Parses and validates a `.torrent` file's contents.
    ///
    /// Validation enforces the invariants of spec.md §4.2: `pieces` length
    /// a multiple of 20, piece count consistent with `total_length`, no
    /// empty name, no empty multi-file list, and no escaping file paths.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, MetainfoError> {
        let metainfo: Self = serde_bencode::from_bytes(buf)?;
        metainfo.validate()?;
        Ok(metainfo)
    }

    fn validate(&self) -> Result<(), MetainfoError> {
        if self.info.pieces.len() % 20 != 0 {
            return Err(MetainfoError::InvalidPieceHashLength);
        }
        if self.info.piece_length == 0 {
            return Err(MetainfoError::InvalidPieceLength);
        }
        if self.info.name.is_empty() {
            return Err(MetainfoError::EmptyName);
        }

        let total_len = self.info.total_len();
        let expected_piece_count =
            ((total_len + self.info.piece_length - 1) / self.info.piece_length)
                .max(1) as usize;
        let actual_piece_count = self.piece_count();
        if expected_piece_count != actual_piece_count {
            return Err(MetainfoError::PieceCountMismatch {
                expected: expected_piece_count,
                actual: actual_piece_count,
            });
        }

        if let Some(files) = &self.info.files {
            if files.is_empty() {
                return Err(MetainfoError::EmptyFileList);
            }
            for file in files {
                validate_path_components(&file.path)?;
            }
        }

        Ok(())
    }

    /// Computes the SHA-1 info hash over the exact bencoded `info`
    /// dictionary as it appeared in the source document.
    ///
    /// We re-encode `info` via `serde_bencode` (stable key order since it's
    /// backed by a struct, not an arbitrary map) for the common path, which
    /// matches the teacher's original approach. As a defense against inputs
    /// whose `info` dict was bencoded with nonstandard key ordering, callers
    /// that have the original document bytes should prefer
    /// `Self::info_hash_from_raw`.
    pub fn create_info_hash(&self) -> Result<Sha1Hash, MetainfoError> {
        let info = serde_bencode::to_bytes(&self.info)?;
        Ok(sha1(&info))
    }

    /// Computes the SHA-1 info hash directly from the original document's
    /// bytes, by locating the `info` dictionary's raw span rather than
    /// re-encoding it. This is the reproducibility-guaranteeing path
    /// (spec.md §8 invariant #1).
    pub fn info_hash_from_raw(buf: &[u8]) -> Result<Sha1Hash, MetainfoError> {
        let (start, end) = bencode::raw_value_span(buf, b"info")
            .map_err(|_| MetainfoError::MissingInfoSpan)?;
        Ok(sha1(&buf[start..end]))
    }

    /// The number of pieces in the torrent.
    pub fn piece_count(&self) -> usize {
        self.info.pieces.len() / 20
    }

    /// Whether this torrent is marked private (spec.md §3): when true, peer
    /// discovery must exclude DHT/PEX/LSD.
    pub fn is_private(&self) -> bool {
        self.info.private.unwrap_or(0) != 0
    }

    /// Returns the expected SHA-1 hash of the piece at `index`.
    pub fn piece_hash(&self, index: usize) -> Option<&[u8]> {
        let start = index * 20;
        self.info.pieces.get(start..start + 20)
    }

    /// Returns the length, in bytes, of the piece at `index`, accounting for
    /// a possibly-shorter final piece.
    pub fn actual_piece_length(&self, index: usize) -> u64 {
        let piece_count = self.piece_count();
        if index + 1 == piece_count {
            let total = self.info.total_len();
            let rem = total % self.info.piece_length;
            if rem == 0 {
                self.info.piece_length
            } else {
                rem
            }
        } else {
            self.info.piece_length
        }
    }
}

/// Rejects path components that are empty, `.`, `..`, or otherwise not a
/// plain path segment -- a directory traversal defense (spec.md §4.2).
fn validate_path_components(path: &[String]) -> Result<(), MetainfoError> {
    if path.is_empty() {
        return Err(MetainfoError::InvalidPath { path: String::new() });
    }
    for component in path {
        if component.is_empty()
            || component == "."
            || component == ".."
            || component.contains('/')
            || component.contains('\\')
        {
            return Err(MetainfoError::InvalidPath {
                path: path.join("/"),
            });
        }
        // Double-check via `std::path::Component` so platform-specific
        // parsing (e.g. Windows drive prefixes) is also rejected.
        let as_path = PathBuf::from(component);
        if !matches!(
            as_path.components().next(),
            Some(Component::Normal(_))
        ) || as_path.components().count() != 1
        {
            return Err(MetainfoError::InvalidPath {
                path: path.join("/"),
            });
        }
    }
    Ok(())
}

fn sha1(buf: &[u8]) -> Sha1Hash {
    let digest = Sha1::digest(buf);
    let mut info_hash = [0; 20];
    info_hash.copy_from_slice(&digest);
    info_hash
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Info {
    pub name: String,
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,
    #[serde(rename = "piece length")]
    pub piece_length: u64,
    pub length: Option<u64>,
    pub files: Option<Vec<File>>,
    pub private: Option<u8>,
}

impl Info {
    /// The sum of the length of all files in the torrent, whether it's a
    /// single file or multi-file (archive) torrent.
    pub fn total_len(&self) -> u64 {
        match (&self.length, &self.files) {
            (Some(len), _) => *len,
            (None, Some(files)) => files.iter().map(|f| f.length as u64).sum(),
            (None, None) => 0,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct File {
    pub path: Vec<String>,
    pub length: i64,
}

impl File {
    /// Joins this file's path components into a single relative path.
    pub fn relative_path(&self) -> PathBuf {
        self.path.iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bencode_single_file(
        name: &str,
        piece_length: u64,
        pieces: &[u8],
        length: u64,
    ) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend(b"d4:infod6:lengthi");
        out.extend(length.to_string().as_bytes());
        out.extend(b"e4:name");
        out.extend(name.len().to_string().as_bytes());
        out.extend(b":");
        out.extend(name.as_bytes());
        out.extend(b"12:piece lengthi");
        out.extend(piece_length.to_string().as_bytes());
        out.extend(b"e6:pieces");
        out.extend(pieces.len().to_string().as_bytes());
        out.extend(b":");
        out.extend(pieces);
        out.extend(b"ee");
        out
    }

    #[test]
    fn test_parse_single_file() {
        let pieces = vec![0u8; 20];
        let buf = bencode_single_file("test.txt", 16384, &pieces, 1000);
        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        assert_eq!(metainfo.info.name, "test.txt");
        assert_eq!(metainfo.piece_count(), 1);
        assert_eq!(metainfo.actual_piece_length(0), 1000);
    }

    #[test]
    fn test_multi_piece_last_piece_length() {
        let pieces = vec![0u8; 20 * 4];
        let buf = bencode_single_file("test.txt", 16384, &pieces, 50000);
        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        assert_eq!(metainfo.piece_count(), 4);
        assert_eq!(metainfo.actual_piece_length(3), 50000 - 3 * 16384);
    }

    #[test]
    fn test_rejects_piece_count_mismatch() {
        let pieces = vec![0u8; 20 * 3];
        let buf = bencode_single_file("test.txt", 16384, &pieces, 50000);
        assert!(matches!(
            Metainfo::from_bytes(&buf),
            Err(MetainfoError::PieceCountMismatch { .. })
        ));
    }

    #[test]
    fn test_rejects_bad_pieces_length() {
        let pieces = vec![0u8; 19];
        let buf = bencode_single_file("test.txt", 16384, &pieces, 1000);
        assert!(matches!(
            Metainfo::from_bytes(&buf),
            Err(MetainfoError::InvalidPieceHashLength)
        ));
    }

    #[test]
    fn test_validate_path_components() {
        assert!(validate_path_components(&["a".into(), "b.txt".into()]).is_ok());
        assert!(validate_path_components(&["..".into()]).is_err());
        assert!(validate_path_components(&[".".into()]).is_err());
        assert!(validate_path_components(&["".into()]).is_err());
        assert!(validate_path_components(&["a/b".into()]).is_err());
    }

    #[test]
    fn test_info_hash_from_raw_matches_reencode() {
        let pieces = vec![0u8; 20];
        let buf = bencode_single_file("test.txt", 16384, &pieces, 1000);
        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        let reencoded = metainfo.create_info_hash().unwrap();
        let raw = Metainfo::info_hash_from_raw(&buf).unwrap();
        assert_eq!(reencoded, raw);
    }
}
