//! # Error Taxonomy
//!
//! This module defines the error type shared by the whole engine. Errors are
//! grouped by how they are recovered from:
//!
//! - Peer-local errors (`PeerProtocol`) drop the offending peer; the worker
//!   moves on.
//! - Piece-local errors (`PieceVerification`) return the piece for retry.
//! - Tracker errors (`TrackerFailure`, `MalformedTrackerResponse`) are logged
//!   and retried at the next announce tick.
//! - Torrent-local errors (`MalformedMetainfo`, `EmptyAnnounceList`,
//!   `FileSystem`, `RetryExhausted`) abort the torrent they belong to and
//!   nothing else.
//! - `Shutdown` is cooperative and lets every component release its
//!   resources.

use std::io;

use thiserror::Error;

pub type Result<T, E = ClientError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ClientError {
    /// Structural failure while decoding a metainfo file.
    #[error("malformed metainfo: {0}")]
    MalformedMetainfo(String),

    /// Neither `announce` nor `announce-list` yielded a tracker URL.
    #[error("metainfo contains no tracker URLs")]
    EmptyAnnounceList,

    /// File allocation, read, or write failure.
    #[error("filesystem error: {0}")]
    FileSystem(#[from] io::Error),

    /// The tracker reported a failure reason, or the transport failed.
    #[error("tracker failure: {0}")]
    TrackerFailure(String),

    /// The tracker answered with bytes we could not decode.
    #[error("malformed tracker response: {0}")]
    MalformedTrackerResponse(String),

    /// Handshake mismatch, malformed or oversize frame, out-of-order piece.
    #[error("peer protocol error: {0}")]
    PeerProtocol(String),

    /// A fully received piece did not hash to the expected digest.
    #[error("piece {index} failed hash verification")]
    PieceVerification { index: usize },

    /// A piece could not be obtained within the retry budget.
    #[error("piece {index} could not be obtained after {attempts} attempts")]
    RetryExhausted { index: usize, attempts: u32 },

    /// Cooperative shutdown was requested.
    #[error("shutdown requested")]
    Shutdown,
}

impl ClientError {
    /// Build a peer protocol error from anything printable.
    pub fn peer<S: Into<String>>(msg: S) -> ClientError {
        ClientError::PeerProtocol(msg.into())
    }

    /// Build a tracker transport failure from anything printable.
    pub fn tracker<S: Into<String>>(msg: S) -> ClientError {
        ClientError::TrackerFailure(msg.into())
    }
}
