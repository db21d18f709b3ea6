//! # Disk Storage
//!
//! This module maps pieces onto the file (or files) of the torrent content
//! and performs all disk I/O for them.
//!
//! ## Layout
//!
//! The torrent's content is one contiguous byte stream; files partition that
//! stream at prefix-sum offsets. Piece `i` occupies the byte range
//! `[i * piece_length, i * piece_length + piece_len(i))` and may straddle
//! file boundaries, so a single piece write can touch several files.
//!
//! Single-file torrents store the content at `<download_dir>/<name>`.
//! Multi-file torrents store it under `<download_dir>/<name>/<path...>`.
//!
//! ## Concurrency
//!
//! Each file handle is guarded by its own mutex. A piece write locks only
//! the files it overlaps, so writes to disjoint pieces in different files
//! proceed in parallel while overlapping writes are serialized.
//!
//! ## Failure Semantics
//!
//! All I/O errors surface to the caller; a read that cannot produce the
//! exact requested byte count fails rather than returning a short buffer.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::Result;
use crate::torrent::Metainfo;

/// One on-disk file of the torrent plus its open handle.
struct StoredFile {
    /// Absolute path of the file
    path: PathBuf,
    /// Declared length in bytes
    length: u64,
    /// Byte offset within the concatenated content stream
    offset: u64,
    /// Open read-write handle, guarded for seek+read/write sequences
    handle: Mutex<File>,
}

/// Maps pieces to byte ranges across the torrent's files.
pub struct FileStore {
    files: Vec<StoredFile>,
    piece_length: u64,
    total_length: u64,
}

/// Absolute paths of the torrent's files under the download directory.
fn resolve_paths(meta: &Metainfo, download_dir: &Path) -> Vec<(PathBuf, u64, u64)> {
    meta.files
        .iter()
        .map(|entry| {
            let path = if meta.multi_file {
                download_dir.join(&meta.name).join(&entry.path)
            } else {
                download_dir.join(&entry.path)
            };
            (path, entry.length, entry.offset)
        })
        .collect()
}

/// Whether every target file already exists at its declared length.
///
/// Checked before allocation: allocation extends files, which would make
/// this trivially true afterwards.
pub fn files_at_declared_lengths(meta: &Metainfo, download_dir: &Path) -> bool {
    resolve_paths(meta, download_dir)
        .iter()
        .all(|(path, length, _)| match fs::metadata(path) {
            Ok(md) => md.is_file() && md.len() == *length,
            Err(_) => false,
        })
}

impl FileStore {
    /// Create directories and open every content file read-write.
    ///
    /// Files smaller than their declared length are extended in place (the
    /// existing prefix is untouched); files that are larger are left as-is
    /// and only accessed up to the declared length.
    pub fn allocate(meta: &Metainfo, download_dir: &Path) -> Result<FileStore> {
        let mut files = Vec::with_capacity(meta.files.len());

        for (path, length, offset) in resolve_paths(meta, download_dir) {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }

            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&path)?;

            let on_disk = file.metadata()?.len();
            if on_disk < length {
                file.set_len(length)?;
                debug!("Allocated {:?} ({} bytes)", path, length);
            } else {
                debug!("Opened existing file {:?} ({} bytes on disk)", path, on_disk);
            }

            files.push(StoredFile {
                path,
                length,
                offset,
                handle: Mutex::new(file),
            });
        }

        info!(
            "Prepared {} file(s) for {:?} ({} bytes total)",
            files.len(),
            meta.name,
            meta.total_length
        );

        Ok(FileStore {
            files,
            piece_length: meta.piece_length,
            total_length: meta.total_length,
        })
    }

    /// Length of a specific piece. The last piece may be shorter.
    pub fn piece_len(&self, index: usize) -> u32 {
        let begin = index as u64 * self.piece_length;
        let end = (begin + self.piece_length).min(self.total_length);
        (end - begin) as u32
    }

    /// Write a complete piece and flush every touched file.
    pub fn write_piece(&self, index: usize, data: &[u8]) -> Result<()> {
        let piece_offset = index as u64 * self.piece_length;
        debug!(
            "Writing piece {} at offset {} ({} bytes)",
            index,
            piece_offset,
            data.len()
        );

        self.for_each_overlap(piece_offset, data.len() as u64, |file, file_off, range| {
            let mut handle = file.handle.lock().unwrap();
            handle.seek(SeekFrom::Start(file_off))?;
            handle.write_all(&data[range.0 as usize..range.1 as usize])?;
            // Flush before the piece can become observable as present
            handle.sync_data()?;
            Ok(())
        })
    }

    /// Read a contiguous subrange of a piece, spanning files as needed.
    ///
    /// Returns exactly `length` bytes or fails.
    pub fn read_range(&self, index: usize, begin: u32, length: u32) -> Result<Vec<u8>> {
        let piece_len = self.piece_len(index);
        if u64::from(begin) + u64::from(length) > u64::from(piece_len) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "range {}+{} exceeds piece {} length {}",
                    begin, length, index, piece_len
                ),
            )
            .into());
        }

        let abs_offset = index as u64 * self.piece_length + u64::from(begin);
        let mut buf = vec![0u8; length as usize];

        self.for_each_overlap(abs_offset, u64::from(length), |file, file_off, range| {
            let mut handle = file.handle.lock().unwrap();
            handle.seek(SeekFrom::Start(file_off))?;
            handle
                .read_exact(&mut buf[range.0 as usize..range.1 as usize])
                .map_err(|e| {
                    if e.kind() == io::ErrorKind::UnexpectedEof {
                        io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            format!("short read from {:?}", file.path),
                        )
                    } else {
                        e
                    }
                })?;
            Ok(())
        })?;

        Ok(buf)
    }

    /// Read a whole piece for verification.
    pub fn read_piece(&self, index: usize) -> Result<Vec<u8>> {
        self.read_range(index, 0, self.piece_len(index))
    }

    /// Walk the files overlapping `[abs_offset, abs_offset + len)` and hand
    /// each one its in-file offset plus the matching subrange of the buffer.
    fn for_each_overlap<F>(&self, abs_offset: u64, len: u64, mut op: F) -> Result<()>
    where
        F: FnMut(&StoredFile, u64, (u64, u64)) -> Result<()>,
    {
        let end = abs_offset + len;

        for file in &self.files {
            let file_end = file.offset + file.length;
            if abs_offset >= file_end {
                // The range starts after this file
                continue;
            }
            if end <= file.offset {
                // The range ends before this file
                break;
            }

            // Overlap of the requested range with this file, in buffer coords
            let start_in_buf = file.offset.saturating_sub(abs_offset);
            let end_in_buf = (file_end.min(end)) - abs_offset;
            let offset_in_file = abs_offset.saturating_sub(file.offset);

            op(file, offset_in_file, (start_in_buf, end_in_buf))?;

            if end_in_buf == len {
                break;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    use crate::torrent::FileEntry;

    fn single_file_meta(length: u64, piece_length: u64) -> Metainfo {
        let pieces = length.div_ceil(piece_length) as usize;
        Metainfo {
            name: "a.bin".into(),
            info_hash: [0; 20],
            piece_hashes: vec![[0; 20]; pieces],
            piece_length,
            total_length: length,
            files: vec![FileEntry {
                path: PathBuf::from("a.bin"),
                length,
                offset: 0,
            }],
            multi_file: false,
            trackers: vec!["http://tracker.test/ann".into()],
        }
    }

    fn multi_file_meta() -> Metainfo {
        Metainfo {
            name: "root".into(),
            info_hash: [0; 20],
            piece_hashes: vec![[0; 20]; 2],
            piece_length: 16384,
            total_length: 30000,
            files: vec![
                FileEntry {
                    path: PathBuf::from("x"),
                    length: 10000,
                    offset: 0,
                },
                FileEntry {
                    path: PathBuf::from("sub/y"),
                    length: 20000,
                    offset: 10000,
                },
            ],
            multi_file: true,
            trackers: vec!["http://tracker.test/ann".into()],
        }
    }

    #[test]
    fn allocation_extends_without_touching_prefix() {
        let dir = tempdir().unwrap();
        let meta = single_file_meta(40000, 16384);

        // Pre-existing partial file
        fs::write(dir.path().join("a.bin"), b"hello").unwrap();
        assert!(!files_at_declared_lengths(&meta, dir.path()));

        let store = FileStore::allocate(&meta, dir.path()).unwrap();
        assert_eq!(store.files.len(), 1);

        let on_disk = fs::read(dir.path().join("a.bin")).unwrap();
        assert_eq!(on_disk.len(), 40000);
        assert_eq!(&on_disk[..5], b"hello");
        assert!(files_at_declared_lengths(&meta, dir.path()));
    }

    #[test]
    fn piece_write_splits_across_files() {
        let dir = tempdir().unwrap();
        let meta = multi_file_meta();
        let store = FileStore::allocate(&meta, dir.path()).unwrap();

        // Piece 0: 10000 bytes into root/x, 6384 bytes into root/sub/y
        let piece0: Vec<u8> = (0..16384u32).map(|i| (i % 251) as u8).collect();
        store.write_piece(0, &piece0).unwrap();

        // Piece 1 (the last piece): 13616 bytes at offset 6384 of root/sub/y
        let piece1: Vec<u8> = (0..13616u32).map(|i| (i % 241) as u8).collect();
        store.write_piece(1, &piece1).unwrap();

        let x = fs::read(dir.path().join("root/x")).unwrap();
        let y = fs::read(dir.path().join("root/sub/y")).unwrap();
        assert_eq!(x.len(), 10000);
        assert_eq!(y.len(), 20000);
        assert_eq!(&x[..], &piece0[..10000]);
        assert_eq!(&y[..6384], &piece0[10000..]);
        assert_eq!(&y[6384..], &piece1[..]);
    }

    #[test]
    fn read_range_spans_file_boundary() {
        let dir = tempdir().unwrap();
        let meta = multi_file_meta();
        let store = FileStore::allocate(&meta, dir.path()).unwrap();

        let piece0: Vec<u8> = (0..16384u32).map(|i| (i % 251) as u8).collect();
        store.write_piece(0, &piece0).unwrap();

        // 200 bytes straddling the x/y boundary at offset 10000
        let range = store.read_range(0, 9900, 200).unwrap();
        assert_eq!(&range[..], &piece0[9900..10100]);

        let whole = store.read_piece(0).unwrap();
        assert_eq!(whole, piece0);
    }

    #[test]
    fn last_piece_respects_total_length() {
        let dir = tempdir().unwrap();
        let meta = single_file_meta(40000, 16384);
        let store = FileStore::allocate(&meta, dir.path()).unwrap();

        assert_eq!(store.piece_len(0), 16384);
        assert_eq!(store.piece_len(2), 7232);

        let last: Vec<u8> = vec![9; 7232];
        store.write_piece(2, &last).unwrap();
        let back = store.read_piece(2).unwrap();
        assert_eq!(back, last);

        // The file must not have grown past its declared length
        let on_disk = fs::metadata(dir.path().join("a.bin")).unwrap().len();
        assert_eq!(on_disk, 40000);
    }

    #[test]
    fn out_of_bounds_range_is_rejected() {
        let dir = tempdir().unwrap();
        let meta = single_file_meta(40000, 16384);
        let store = FileStore::allocate(&meta, dir.path()).unwrap();

        assert!(store.read_range(2, 0, 16384).is_err());
        assert!(store.read_range(0, 16380, 8).is_err());
    }

    #[test]
    fn truncated_file_yields_short_read() {
        let dir = tempdir().unwrap();
        let meta = single_file_meta(40000, 16384);
        let store = FileStore::allocate(&meta, dir.path()).unwrap();

        // Truncate behind the store's back
        let file = OpenOptions::new()
            .write(true)
            .open(dir.path().join("a.bin"))
            .unwrap();
        file.set_len(100).unwrap();

        assert!(store.read_piece(1).is_err());
    }
}
