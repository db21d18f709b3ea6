//! # Metainfo Decoding
//!
//! This module parses .torrent files (bencoded metainfo) into the `Metainfo`
//! value the rest of the engine works from.
//!
//! ## Torrent File Format
//!
//! Torrent files contain metadata in bencoded format:
//!
//! - **announce / announce-list**: Tracker URLs for peer discovery
//! - **info**: Dictionary with file layout and piece hashes
//! - **pieces**: Concatenated 20-byte SHA-1 hashes, one per piece
//! - **piece length**: Size of each piece (except possibly the last)
//! - **length** or **files**: Single-file size, or the multi-file list
//!
//! ## Info Hash
//!
//! The torrent's identity is the SHA-1 of the bencoded info dictionary. To
//! reproduce it byte-exactly, the info dictionary is captured as a bencode
//! value (all keys preserved, including ones this client does not use) and
//! re-encoded for hashing. Bencode dictionaries are canonically sorted, so
//! the round trip is byte-identical for any valid metainfo.
//!
//! ## Validation
//!
//! Structural problems (missing fields, truncated hash string, empty file
//! list, path traversal attempts) fail with `MalformedMetainfo`. A metainfo
//! without a single tracker URL fails with `EmptyAnnounceList`.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_bencode::value::Value;
use serde_bytes::ByteBuf;

use crate::error::{ClientError, Result};
use crate::piece::sha1;

const SHA1_HASH_SIZE: usize = 20;

/// One file of the torrent's content.
///
/// For single-file torrents there is exactly one entry whose path is the
/// torrent name. For multi-file torrents the paths are relative to the
/// torrent's root directory (which is named after the torrent).
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// Path relative to the torrent root (or the bare name for single-file)
    pub path: PathBuf,
    /// Declared length in bytes
    pub length: u64,
    /// Byte offset of this file within the concatenated content stream
    pub offset: u64,
}

/// Decoded torrent metadata.
#[derive(Debug, Clone)]
pub struct Metainfo {
    /// Content name: output filename (single-file) or root directory name
    pub name: String,
    /// SHA-1 of the bencoded info dictionary
    pub info_hash: [u8; 20],
    /// Per-piece SHA-1 digests
    pub piece_hashes: Vec<[u8; 20]>,
    /// Nominal piece size in bytes (the last piece may be shorter)
    pub piece_length: u64,
    /// Sum of all file lengths
    pub total_length: u64,
    /// Ordered file list with prefix-sum offsets
    pub files: Vec<FileEntry>,
    /// Whether the torrent carries a `files` list (directory layout on disk)
    pub multi_file: bool,
    /// Tracker URLs in tier order, deduplicated
    pub trackers: Vec<String>,
}

/// BencodeFile structure.
#[derive(Debug, Deserialize, Serialize)]
struct BencodeFile {
    // Path components, the last of which is the actual file name
    path: Vec<String>,
    // Size of the file in bytes
    length: u64,
}

/// BencodeInfo structure.
#[derive(Debug, Deserialize, Serialize)]
struct BencodeInfo {
    // Concatenation of all pieces' 20-byte SHA-1 hashes
    pieces: ByteBuf,
    #[serde(rename = "piece length")]
    // Size of each piece in bytes
    piece_length: u64,
    // Size of the file in bytes (single-file torrents only)
    #[serde(default)]
    length: Option<u64>,
    // File list (multi-file torrents only)
    #[serde(default)]
    files: Option<Vec<BencodeFile>>,
    // Suggested name for the file or root directory
    name: String,
}

/// BencodeTorrent structure.
#[derive(Debug, Deserialize)]
struct BencodeTorrent {
    // URL of the tracker
    #[serde(default)]
    announce: Option<String>,
    #[serde(rename = "announce-list", default)]
    // Tiers of tracker URLs
    announce_list: Vec<Vec<String>>,
    // Information about the content
    info: BencodeInfo,
}

/// Side channel that captures the raw info dictionary for hashing.
#[derive(Debug, Deserialize)]
struct BencodeInfoCapture {
    info: Value,
}

impl Metainfo {
    /// Read and decode a torrent file from disk.
    pub fn open(path: &Path) -> Result<Metainfo> {
        let mut file = File::open(path)?;
        let mut buf = vec![];
        file.read_to_end(&mut buf)?;
        Metainfo::from_bytes(&buf)
    }

    /// Decode a torrent from its raw bytes.
    pub fn from_bytes(buf: &[u8]) -> Result<Metainfo> {
        let bencode: BencodeTorrent = serde_bencode::from_bytes(buf)
            .map_err(|e| ClientError::MalformedMetainfo(e.to_string()))?;

        // Capture the info dictionary verbatim so the hash covers every key,
        // including ones the typed struct above does not model.
        let capture: BencodeInfoCapture = serde_bencode::from_bytes(buf)
            .map_err(|e| ClientError::MalformedMetainfo(e.to_string()))?;
        let info_bytes = serde_bencode::to_bytes(&capture.info)
            .map_err(|e| ClientError::MalformedMetainfo(e.to_string()))?;
        let info_hash = sha1(&info_bytes);

        let info = bencode.info;

        validate_name(&info.name)?;

        // Check torrent pieces
        if info.pieces.is_empty() || info.pieces.len() % SHA1_HASH_SIZE != 0 {
            return Err(ClientError::MalformedMetainfo(
                "pieces string is not a multiple of 20 bytes".into(),
            ));
        }
        let piece_hashes = split_piece_hashes(&info.pieces);

        if info.piece_length == 0 {
            return Err(ClientError::MalformedMetainfo("piece length is zero".into()));
        }

        // Build the file list: exactly one of `length` and `files` is set
        let (files, multi_file) = match (info.length, &info.files) {
            (Some(_), Some(_)) => {
                return Err(ClientError::MalformedMetainfo(
                    "metainfo contains both `length` and `files`".into(),
                ));
            }
            (Some(length), None) => {
                if length == 0 {
                    return Err(ClientError::MalformedMetainfo("file length is zero".into()));
                }
                let entry = FileEntry {
                    path: PathBuf::from(&info.name),
                    length,
                    offset: 0,
                };
                (vec![entry], false)
            }
            (None, Some(raw_files)) => {
                if raw_files.is_empty() {
                    return Err(ClientError::MalformedMetainfo("files list is empty".into()));
                }
                let mut files = Vec::with_capacity(raw_files.len());
                let mut offset = 0u64;
                for raw in raw_files {
                    if raw.length == 0 {
                        return Err(ClientError::MalformedMetainfo(
                            "file length is zero".into(),
                        ));
                    }
                    let path = validate_path_components(&raw.path)?;
                    files.push(FileEntry {
                        path,
                        length: raw.length,
                        offset,
                    });
                    offset += raw.length;
                }
                (files, true)
            }
            (None, None) => {
                return Err(ClientError::MalformedMetainfo(
                    "metainfo contains neither `length` nor `files`".into(),
                ));
            }
        };

        let total_length: u64 = files.iter().map(|f| f.length).sum();

        // The hash count must agree with the derived piece count
        let expected_pieces = total_length.div_ceil(info.piece_length) as usize;
        if piece_hashes.len() != expected_pieces {
            return Err(ClientError::MalformedMetainfo(format!(
                "expected {} piece hashes, found {}",
                expected_pieces,
                piece_hashes.len()
            )));
        }

        let trackers = collect_trackers(&bencode.announce, &bencode.announce_list)?;

        Ok(Metainfo {
            name: info.name,
            info_hash,
            piece_hashes,
            piece_length: info.piece_length,
            total_length,
            files,
            multi_file,
            trackers,
        })
    }

    /// Number of pieces in the torrent.
    pub fn num_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Length of a specific piece. The last piece may be shorter.
    #[allow(dead_code)]
    pub fn piece_len(&self, index: usize) -> u32 {
        let begin = index as u64 * self.piece_length;
        let end = (begin + self.piece_length).min(self.total_length);
        (end - begin) as u32
    }
}

/// Split the concatenated hash string into per-piece digests.
fn split_piece_hashes(pieces: &[u8]) -> Vec<[u8; 20]> {
    pieces
        .chunks_exact(SHA1_HASH_SIZE)
        .map(|chunk| {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(chunk);
            hash
        })
        .collect()
}

/// Check that the torrent name is usable as a file or directory name.
fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
    {
        return Err(ClientError::MalformedMetainfo(format!(
            "unusable torrent name {:?}",
            name
        )));
    }
    Ok(())
}

/// Validate multi-file path components and join them.
///
/// Rejects empty components, parent-directory references, absolute path
/// markers, and NUL bytes so a hostile metainfo cannot escape the download
/// directory.
fn validate_path_components(components: &[String]) -> Result<PathBuf> {
    if components.is_empty() {
        return Err(ClientError::MalformedMetainfo("empty file path".into()));
    }
    let mut path = PathBuf::new();
    for component in components {
        if component.is_empty()
            || component == "."
            || component == ".."
            || component.contains('/')
            || component.contains('\\')
            || component.contains('\0')
        {
            return Err(ClientError::MalformedMetainfo(format!(
                "unsafe path component {:?}",
                component
            )));
        }
        path.push(component);
    }
    Ok(path)
}

/// Collect tracker URLs in tier order, deduplicated, announce-list first.
fn collect_trackers(
    announce: &Option<String>,
    announce_list: &[Vec<String>],
) -> Result<Vec<String>> {
    let mut trackers: Vec<String> = Vec::new();

    for tier in announce_list {
        for url in tier {
            if !url.trim().is_empty() && !trackers.contains(url) {
                trackers.push(url.clone());
            }
        }
    }

    if let Some(url) = announce {
        if !url.trim().is_empty() && !trackers.contains(url) {
            trackers.push(url.clone());
        }
    }

    if trackers.is_empty() {
        return Err(ClientError::EmptyAnnounceList);
    }

    Ok(trackers)
}
