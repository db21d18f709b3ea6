//! # Piece State Management
//!
//! Single source of truth for piece availability, shared by the download
//! workers and the seeder. Replaces separate download-queue and
//! seeding-bitfield bookkeeping with one state vector.
//!
//! ## Piece Lifecycle
//!
//! ```text
//! Missing ──claim──▶ Downloading ──mark_completed──▶ Have
//!    ▲                    │
//!    └──return_for_retry──┘
//! ```
//!
//! A piece that reached `Have` never regresses. A piece is `Downloading` in
//! at most one worker at a time: claims are serialized through the manager's
//! mutex.
//!
//! ## Resume State
//!
//! The set of `Have` pieces is persisted to a sidecar file
//! (`<download_dir>/<name>.state`, bits packed LSB-first) every few
//! completions and on shutdown. Bits are only ever written for verified
//! pieces, so after a crash the file is a subset of what is actually on
//! disk. On startup every candidate piece is re-verified against its hash
//! before it is trusted. The file is deleted once the torrent completes.
//!
//! ## Retry Budget
//!
//! A failing piece is re-queued with an incremented retry counter and is not
//! handed out again until a short pause has passed. Once the budget is
//! exhausted the manager latches a fatal error which every subsequent claim
//! surfaces, rather than silently giving up on the piece.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::error::{ClientError, Result};
use crate::piece::{check_integrity, PieceWork, MAX_RETRIES, RETRY_DELAY};
use crate::storage::FileStore;
use crate::torrent::Metainfo;

// Durably flush the resume bitmap every this many completions
const FLUSH_EVERY: usize = 10;

// Bounded wait inside next_piece before exit conditions are rechecked
const CLAIM_WAIT: Duration = Duration::from_millis(500);

/// The three states a piece can occupy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceState {
    /// Not on disk; queued for download
    Missing,
    /// Claimed by exactly one download worker
    Downloading,
    /// Verified on disk and available for seeding
    Have,
}

struct ManagerState {
    states: Vec<PieceState>,
    queue: VecDeque<PieceWork>,
    have_count: usize,
    have_bytes: u64,
    since_flush: usize,
    // Set when a piece exhausts its retry budget: (index, attempts)
    failed: Option<(usize, u32)>,
    shutdown: bool,
}

/// Authoritative piece-state vector plus the download queue.
pub struct PieceManager {
    piece_hashes: Vec<[u8; 20]>,
    piece_length: u64,
    total_length: u64,
    state_path: PathBuf,
    max_retries: u32,
    retry_delay: Duration,
    inner: Mutex<ManagerState>,
    changed: Condvar,
}

impl PieceManager {
    /// Build a manager for the torrent with default retry pacing.
    pub fn new(meta: &Metainfo, download_dir: &Path) -> PieceManager {
        PieceManager::with_retry_pacing(meta, download_dir, MAX_RETRIES, RETRY_DELAY)
    }

    /// Build a manager with explicit retry pacing (tests pass zero delay).
    pub fn with_retry_pacing(
        meta: &Metainfo,
        download_dir: &Path,
        max_retries: u32,
        retry_delay: Duration,
    ) -> PieceManager {
        let num_pieces = meta.num_pieces();
        PieceManager {
            piece_hashes: meta.piece_hashes.clone(),
            piece_length: meta.piece_length,
            total_length: meta.total_length,
            state_path: download_dir.join(format!("{}.state", meta.name)),
            max_retries,
            retry_delay,
            inner: Mutex::new(ManagerState {
                states: vec![PieceState::Missing; num_pieces],
                queue: VecDeque::new(),
                have_count: 0,
                have_bytes: 0,
                since_flush: 0,
                failed: None,
                shutdown: false,
            }),
            changed: Condvar::new(),
        }
    }

    /// Verify what is already on disk, then queue everything else.
    ///
    /// When all files were present at their declared lengths, every piece is
    /// verified. Otherwise only the pieces recorded in the resume sidecar
    /// are candidates, and each one must still match its hash to be
    /// accepted. Returns whether the torrent is already complete.
    pub fn initialize(&self, store: &FileStore, had_all_files: bool) -> Result<bool> {
        let num_pieces = self.piece_hashes.len();
        let mut verified = vec![false; num_pieces];
        let mut corrupted = 0usize;

        if had_all_files {
            info!(
                "All files exist at declared lengths, verifying {} pieces from disk...",
                num_pieces
            );
            for index in 0..num_pieces {
                if self.verify_from_disk(store, index) {
                    verified[index] = true;
                } else {
                    corrupted += 1;
                }
            }
        } else if let Some(candidates) = self.load_state_file() {
            info!("Resuming from previous state: {:?}", self.state_path);
            for index in candidates {
                if self.verify_from_disk(store, index) {
                    verified[index] = true;
                } else {
                    warn!("Previously completed piece {} no longer verifies", index);
                    corrupted += 1;
                }
            }
        } else {
            info!("No previous download state found");
        }

        let mut inner = self.inner.lock().unwrap();
        for (index, ok) in verified.iter().enumerate() {
            if *ok {
                inner.states[index] = PieceState::Have;
                inner.have_count += 1;
                inner.have_bytes += u64::from(self.piece_len(index));
            } else {
                inner.queue.push_back(PieceWork::new(
                    index,
                    self.piece_len(index),
                    self.piece_hashes[index],
                ));
            }
        }

        let complete = inner.have_count == num_pieces;
        info!(
            "Initialization done: {} verified, {} corrupted or missing, {} queued",
            inner.have_count,
            corrupted,
            inner.queue.len()
        );

        if complete {
            self.remove_state_file();
        } else if inner.have_count > 0 {
            self.write_state(&inner)?;
        }

        Ok(complete)
    }

    /// Claim some missing piece, marking it as downloading.
    ///
    /// Blocks while no piece is claimable. Returns `None` once the torrent
    /// is complete or the manager has been shut down, and surfaces the
    /// latched fatal error when the retry budget of a piece ran out.
    pub fn next_piece(&self) -> Result<Option<PieceWork>> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some((index, attempts)) = inner.failed {
                return Err(ClientError::RetryExhausted { index, attempts });
            }
            if inner.shutdown {
                return Ok(None);
            }
            if inner.have_count == self.piece_hashes.len() {
                return Ok(None);
            }

            let ready = inner
                .queue
                .iter()
                .position(|p| p.ready_for_claim(self.retry_delay));
            if let Some(pos) = ready {
                let piece = inner.queue.remove(pos).unwrap();
                inner.states[piece.index] = PieceState::Downloading;
                return Ok(Some(piece));
            }

            let (guard, _) = self.changed.wait_timeout(inner, CLAIM_WAIT).unwrap();
            inner = guard;
        }
    }

    /// Promote a downloaded and verified piece to `Have`.
    ///
    /// Idempotent: completing an already-present piece only logs. The
    /// caller must have written the piece to disk first, so that the piece
    /// is observably present only after its bytes are durable.
    pub fn mark_completed(&self, index: usize) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.states[index] {
            PieceState::Have => {
                debug!("Piece {} was already marked present", index);
                return Ok(());
            }
            PieceState::Missing => {
                warn!("Piece {} completed without an active claim", index);
            }
            PieceState::Downloading => {}
        }

        inner.states[index] = PieceState::Have;
        inner.have_count += 1;
        inner.have_bytes += u64::from(self.piece_len(index));
        inner.since_flush += 1;

        debug!(
            "Piece {} completed and available for seeding ({}/{})",
            index,
            inner.have_count,
            self.piece_hashes.len()
        );

        if inner.have_count == self.piece_hashes.len() {
            self.remove_state_file();
        } else if inner.since_flush >= FLUSH_EVERY {
            self.write_state(&inner)?;
            inner.since_flush = 0;
        }

        self.changed.notify_all();
        Ok(())
    }

    /// Return a claimed piece after a failed attempt.
    ///
    /// Re-queues with an incremented retry counter while budget remains;
    /// otherwise latches a fatal error that all claimers will observe.
    pub fn return_for_retry(&self, mut piece: PieceWork) {
        let mut inner = self.inner.lock().unwrap();
        if inner.states[piece.index] != PieceState::Downloading {
            debug!(
                "Ignoring retry return for piece {} in state {:?}",
                piece.index, inner.states[piece.index]
            );
            return;
        }

        inner.states[piece.index] = PieceState::Missing;

        if piece.retries() < self.max_retries {
            piece.record_attempt();
            debug!(
                "Returned piece {} for retry (attempt {})",
                piece.index,
                piece.retries()
            );
            inner.queue.push_back(piece);
        } else {
            warn!(
                "Piece {} exhausted its retry budget after {} attempts",
                piece.index,
                piece.retries()
            );
            inner.failed = Some((piece.index, piece.retries()));
        }

        self.changed.notify_all();
    }

    /// Put a claimed piece back untouched (the peer simply did not have it).
    ///
    /// Unlike `return_for_retry` this does not consume retry budget; it is
    /// used when a claim turns out to be unserviceable by the current peer.
    pub fn requeue(&self, piece: PieceWork) {
        let mut inner = self.inner.lock().unwrap();
        if inner.states[piece.index] != PieceState::Downloading {
            return;
        }
        inner.states[piece.index] = PieceState::Missing;
        inner.queue.push_back(piece);
        self.changed.notify_all();
    }

    /// Whether a piece is present and servable.
    pub fn has_piece(&self, index: usize) -> bool {
        let inner = self.inner.lock().unwrap();
        index < inner.states.len() && inner.states[index] == PieceState::Have
    }

    /// Whether every piece is present.
    pub fn is_complete(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.have_count == self.piece_hashes.len()
    }

    /// Number of pieces currently present.
    pub fn completed_count(&self) -> usize {
        self.inner.lock().unwrap().have_count
    }

    /// Total number of pieces.
    pub fn num_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Bytes still missing, for tracker `left` reporting.
    pub fn bytes_left(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        self.total_length - inner.have_bytes
    }

    /// The fatal error latched by an exhausted retry budget, if any.
    pub fn failure(&self) -> Option<ClientError> {
        let inner = self.inner.lock().unwrap();
        inner
            .failed
            .map(|(index, attempts)| ClientError::RetryExhausted { index, attempts })
    }

    /// Snapshot of the present set as a peer-wire bitfield payload.
    ///
    /// MSB-first within each byte: piece 0 is the high bit of byte 0.
    pub fn bitfield_payload(&self) -> Vec<u8> {
        let inner = self.inner.lock().unwrap();
        let num_pieces = inner.states.len();
        let mut payload = vec![0u8; num_pieces.div_ceil(8)];
        for (index, state) in inner.states.iter().enumerate() {
            if *state == PieceState::Have {
                payload[index / 8] |= 1 << (7 - (index % 8));
            }
        }
        payload
    }

    /// Flush state and stop handing out claims.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.shutdown = true;
        if inner.have_count < self.piece_hashes.len() {
            if let Err(e) = self.write_state(&inner) {
                warn!("Failed to flush resume state: {}", e);
            }
        }
        self.changed.notify_all();
        debug!("Piece manager shut down");
    }

    fn piece_len(&self, index: usize) -> u32 {
        let begin = index as u64 * self.piece_length;
        let end = (begin + self.piece_length).min(self.total_length);
        (end - begin) as u32
    }

    /// Read a piece from disk and compare it to its expected digest.
    fn verify_from_disk(&self, store: &FileStore, index: usize) -> bool {
        if index >= self.piece_hashes.len() {
            return false;
        }
        match store.read_piece(index) {
            Ok(data) => {
                let ok = check_integrity(&self.piece_hashes[index], &data);
                if ok {
                    trace!("Piece {} read from disk and verified", index);
                }
                ok
            }
            Err(e) => {
                warn!("Error reading piece {} for verification: {}", index, e);
                false
            }
        }
    }

    /// Persist the present set, bits packed LSB-first per byte.
    fn write_state(&self, inner: &ManagerState) -> Result<()> {
        let mut bytes = vec![0u8; inner.states.len().div_ceil(8)];
        for (index, state) in inner.states.iter().enumerate() {
            if *state == PieceState::Have {
                bytes[index / 8] |= 1 << (index % 8);
            }
        }
        fs::write(&self.state_path, &bytes)?;
        debug!(
            "Saved resume state: {}/{} pieces",
            inner.have_count,
            inner.states.len()
        );
        Ok(())
    }

    /// Load the piece indices recorded in the resume sidecar, if readable.
    fn load_state_file(&self) -> Option<Vec<usize>> {
        if !self.state_path.exists() {
            return None;
        }
        match fs::read(&self.state_path) {
            Ok(bytes) => {
                let mut candidates = Vec::new();
                for index in 0..self.piece_hashes.len() {
                    let byte = index / 8;
                    if byte < bytes.len() && bytes[byte] & (1 << (index % 8)) != 0 {
                        candidates.push(index);
                    }
                }
                Some(candidates)
            }
            Err(e) => {
                warn!("Could not read resume state, starting fresh: {}", e);
                None
            }
        }
    }

    fn remove_state_file(&self) {
        if self.state_path.exists() {
            match fs::remove_file(&self.state_path) {
                Ok(()) => info!("Removed resume state file"),
                Err(e) => warn!("Failed to remove resume state file: {}", e),
            }
        }
    }
}
