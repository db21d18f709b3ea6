//! # Piece Bookkeeping
//!
//! This module defines the unit of work exchanged between the piece manager
//! and the download workers. Pieces are the verification units of the torrent
//! data, identified by a SHA-1 hash in the metainfo; they are transferred in
//! smaller blocks (16KB) on the peer wire.
//!
//! ## Retry Tracking
//!
//! A `PieceWork` carries its own retry counter and last-attempt timestamp.
//! The piece manager uses these to pace re-downloads of failing pieces and to
//! detect when the retry budget is exhausted.

use std::time::{Duration, Instant};

use boring::sha::Sha1;

// Standard block size for piece transfers (16KB)
pub const BLOCK_SIZE: u32 = 16384;

// Give up on a piece after this many failed attempts
pub const MAX_RETRIES: u32 = 5;

// Minimum pause before a returned piece may be claimed again
pub const RETRY_DELAY: Duration = Duration::from_secs(2);

/// A piece that needs to be downloaded.
///
/// Claimed from the piece manager by one worker at a time, and returned to it
/// on failure with an incremented retry counter.
#[derive(Debug, Clone)]
pub struct PieceWork {
    /// Zero-based index of this piece in the torrent
    pub index: usize,
    /// Total length of the piece in bytes
    pub length: u32,
    /// Expected SHA-1 digest of the piece data
    pub hash: [u8; 20],
    /// Number of failed download attempts so far
    retries: u32,
    /// When the piece was last returned after a failed attempt
    last_attempt: Option<Instant>,
}

impl PieceWork {
    /// Build a fresh work item with no retry history.
    pub fn new(index: usize, length: u32, hash: [u8; 20]) -> PieceWork {
        PieceWork {
            index,
            length,
            hash,
            retries: 0,
            last_attempt: None,
        }
    }

    /// Number of failed attempts recorded so far.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Record a failed attempt: bump the counter and stamp the time.
    pub fn record_attempt(&mut self) {
        self.retries += 1;
        self.last_attempt = Some(Instant::now());
    }

    /// Whether the retry pause has elapsed and the piece may be claimed.
    pub fn ready_for_claim(&self, delay: Duration) -> bool {
        match self.last_attempt {
            Some(at) => at.elapsed() >= delay,
            None => true,
        }
    }
}

/// Hash a byte buffer with SHA-1.
pub fn sha1(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finish()
}

/// Compare piece data against its expected digest.
pub fn check_integrity(expected: &[u8; 20], data: &[u8]) -> bool {
    sha1(data) == *expected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_piece_is_claimable() {
        let pw = PieceWork::new(0, 16384, [0; 20]);
        assert!(pw.ready_for_claim(RETRY_DELAY));
        assert_eq!(pw.retries(), 0);
    }

    #[test]
    fn recorded_attempt_delays_claim() {
        let mut pw = PieceWork::new(3, 16384, [0; 20]);
        pw.record_attempt();
        assert_eq!(pw.retries(), 1);
        assert!(!pw.ready_for_claim(RETRY_DELAY));
        assert!(pw.ready_for_claim(Duration::ZERO));
    }

    #[test]
    fn sha1_matches_known_digest() {
        // SHA-1("abc")
        let expected: [u8; 20] = [
            0xa9, 0x99, 0x3e, 0x36, 0x47, 0x06, 0x81, 0x6a, 0xba, 0x3e, 0x25, 0x71, 0x78, 0x50,
            0xc2, 0x6c, 0x9c, 0xd0, 0xd8, 0x9d,
        ];
        assert_eq!(sha1(b"abc"), expected);
        assert!(check_integrity(&expected, b"abc"));
        assert!(!check_integrity(&expected, b"abd"));
    }
}
