//! # BitTorrent Handshake Protocol
//!
//! This module implements the fixed 68-byte handshake exchanged immediately
//! after a peer TCP connection is established, in both directions.
//!
//! ## Message Format
//!
//! ```text
//! <pstrlen><pstr><reserved><info_hash><peer_id>
//! ```
//!
//! - **pstrlen**: 1 byte - Length of the protocol string (always 19)
//! - **pstr**: 19 bytes - Protocol identifier ("BitTorrent protocol")
//! - **reserved**: 8 bytes - All zeros (extension bits are not used here)
//! - **info_hash**: 20 bytes - SHA-1 of the torrent's info dictionary
//! - **peer_id**: 20 bytes - Unique identifier of the sending peer
//!
//! The info hash is what ties a connection to a torrent: a peer answering
//! with a different info hash is talking about different content and the
//! connection must be dropped.

use std::io::{Read, Write};

use crate::error::{ClientError, Result};

const PROTOCOL_ID: &[u8; 19] = b"BitTorrent protocol";

/// Full length of a serialized handshake.
pub const HANDSHAKE_LEN: usize = 68;

/// A BitTorrent handshake message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    /// SHA-1 hash of the torrent's info dictionary
    pub info_hash: [u8; 20],
    /// Unique identifier of the sending peer
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Build a handshake for the given torrent and local peer id.
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Handshake {
        Handshake { info_hash, peer_id }
    }

    /// Serialize the handshake into its 68-byte wire form.
    pub fn serialize(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = PROTOCOL_ID.len() as u8;
        buf[1..20].copy_from_slice(PROTOCOL_ID);
        // bytes 20..28 stay zero (reserved)
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /// Write the handshake to a stream.
    pub fn write_to<W: Write>(&self, stream: &mut W) -> Result<()> {
        stream
            .write_all(&self.serialize())
            .map_err(|e| ClientError::peer(format!("could not send handshake: {}", e)))?;
        stream
            .flush()
            .map_err(|e| ClientError::peer(format!("could not send handshake: {}", e)))
    }

    /// Read and validate a handshake from a stream.
    pub fn read_from<R: Read>(stream: &mut R) -> Result<Handshake> {
        let mut buf = [0u8; HANDSHAKE_LEN];
        stream
            .read_exact(&mut buf)
            .map_err(|e| ClientError::peer(format!("could not read handshake: {}", e)))?;

        if buf[0] as usize != PROTOCOL_ID.len() || &buf[1..20] != PROTOCOL_ID {
            return Err(ClientError::peer("unknown protocol string in handshake"));
        }

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);

        Ok(Handshake { info_hash, peer_id })
    }
}
