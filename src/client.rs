//! # Outbound Peer Connection
//!
//! This module wraps one TCP connection to a remote peer on the download
//! side: connection with timeout, handshake validation, tracking of the
//! choke state and of the peer's piece availability, and framed message
//! exchange.
//!
//! ## Connection States
//!
//! - **Choked**: the peer will not answer our block requests yet
//! - **Unchoked**: the peer answers block requests
//!
//! The peer's availability arrives as a `bitfield` message (MSB-first per
//! byte), or as `have all` / `have none`, and is refined by `have` messages
//! at any time afterwards.

use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use crate::error::{ClientError, Result};
use crate::handshake::Handshake;
use crate::message::{self, Message};

// TCP connect timeout towards a peer
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

// Read/write timeout once connected
const SOCKET_TIMEOUT: Duration = Duration::from_secs(30);

/// A connection to one remote peer.
pub struct PeerConnection {
    stream: TcpStream,
    addr: SocketAddr,
    /// Whether the peer currently chokes us
    choked: bool,
    /// The peer's piece availability, MSB-first per byte
    bitfield: Vec<u8>,
    /// Set when the peer declared `have all`
    have_all: bool,
}

impl PeerConnection {
    /// Open a TCP connection to the peer with connect and I/O timeouts.
    pub fn connect(addr: SocketAddr) -> Result<PeerConnection> {
        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
            .map_err(|e| ClientError::peer(format!("could not connect to {}: {}", addr, e)))?;
        stream
            .set_read_timeout(Some(SOCKET_TIMEOUT))
            .map_err(|e| ClientError::peer(format!("could not set read timeout: {}", e)))?;
        stream
            .set_write_timeout(Some(SOCKET_TIMEOUT))
            .map_err(|e| ClientError::peer(format!("could not set write timeout: {}", e)))?;

        debug!("Connected to peer {}", addr);

        Ok(PeerConnection {
            stream,
            addr,
            choked: true,
            bitfield: vec![],
            have_all: false,
        })
    }

    #[allow(dead_code)]
    pub fn is_choked(&self) -> bool {
        self.choked
    }

    /// Exchange handshakes and verify the peer serves the same torrent.
    pub fn handshake(&mut self, info_hash: [u8; 20], peer_id: [u8; 20]) -> Result<[u8; 20]> {
        Handshake::new(info_hash, peer_id).write_to(&mut self.stream)?;
        let remote = Handshake::read_from(&mut self.stream)?;

        if remote.info_hash != info_hash {
            return Err(ClientError::peer(format!(
                "info hash mismatch in handshake from {}",
                self.addr
            )));
        }

        debug!("Handshake completed with {}", self.addr);
        Ok(remote.peer_id)
    }

    /// Whether the peer claims to have a piece.
    pub fn has_piece(&self, index: usize) -> bool {
        if self.have_all {
            return true;
        }
        let byte_index = index / 8;
        if byte_index < self.bitfield.len() {
            return self.bitfield[byte_index] >> (7 - (index % 8)) & 1 != 0;
        }
        false
    }

    /// Record a piece announced via `have`, growing the bitfield if needed.
    fn set_piece(&mut self, index: usize) {
        let byte_index = index / 8;
        if byte_index >= self.bitfield.len() {
            self.bitfield.resize(byte_index + 1, 0);
        }
        self.bitfield[byte_index] |= 1 << (7 - (index % 8));
    }

    /// Read one message, applying choke and availability updates first.
    ///
    /// The returned message is also handed to the caller so that piece and
    /// unchoke handling stays in the worker's state machine.
    pub fn read_message(&mut self) -> Result<Message> {
        let msg = message::read_message(&mut self.stream)?;
        match msg.id {
            message::MESSAGE_CHOKE => {
                debug!("Peer {} choked us", self.addr);
                self.choked = true;
            }
            message::MESSAGE_UNCHOKE => {
                debug!("Peer {} unchoked us", self.addr);
                self.choked = false;
            }
            message::MESSAGE_HAVE => {
                let index = message::parse_have(&msg)?;
                self.set_piece(index as usize);
            }
            message::MESSAGE_HAVE_ALL => {
                self.have_all = true;
            }
            _ => {}
        }
        Ok(msg)
    }

    /// Send one framed message.
    pub fn send_message(&mut self, msg: &Message) -> Result<()> {
        use std::io::Write;
        self.stream
            .write_all(&msg.serialize())
            .map_err(|e| ClientError::peer(format!("could not send message: {}", e)))
    }

    /// Block until the peer has declared its piece availability.
    ///
    /// Satisfied by `bitfield`, `have all`, or `have none`; every other
    /// message is honored but keeps the wait going. A bitfield shorter than
    /// the torrent requires is a protocol error; a longer one is accepted
    /// with the excess bits ignored.
    pub fn await_bitfield(&mut self, num_pieces: usize) -> Result<()> {
        loop {
            let msg = self.read_message()?;
            match msg.id {
                message::MESSAGE_BITFIELD => {
                    if msg.payload.len() < num_pieces.div_ceil(8) {
                        return Err(ClientError::peer(format!(
                            "bitfield from {} is {} bytes, need at least {}",
                            self.addr,
                            msg.payload.len(),
                            num_pieces.div_ceil(8)
                        )));
                    }
                    self.bitfield = msg.payload;
                    return Ok(());
                }
                message::MESSAGE_HAVE_ALL => return Ok(()),
                message::MESSAGE_HAVE_NONE => {
                    self.bitfield = vec![0; num_pieces.div_ceil(8)];
                    return Ok(());
                }
                _ => {
                    trace!(
                        "Ignoring message {} from {} while awaiting bitfield",
                        msg.id,
                        self.addr
                    );
                }
            }
        }
    }

    /// Declare interest in downloading from this peer.
    pub fn send_interested(&mut self) -> Result<()> {
        debug!("Sending interested to {}", self.addr);
        self.send_message(&Message::new(message::MESSAGE_INTERESTED))
    }

    /// Block until the peer unchokes us.
    pub fn await_unchoke(&mut self) -> Result<()> {
        while self.choked {
            self.read_message()?;
        }
        Ok(())
    }

    /// Request one block of a piece.
    pub fn send_request(&mut self, index: u32, begin: u32, length: u32) -> Result<()> {
        trace!(
            "Requesting piece {} [{}..{}] from {}",
            index,
            begin,
            begin + length,
            self.addr
        );
        self.send_message(&Message::request(index, begin, length))
    }
}
