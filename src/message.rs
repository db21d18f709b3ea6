//! # BitTorrent Peer Wire Messages
//!
//! This module defines the message types and serialization for the BitTorrent
//! peer wire protocol. All communication between peers after the handshake
//! uses these messages.
//!
//! ## Message Structure
//!
//! Every message follows the same format:
//!
//! ```text
//! <length prefix><message ID><payload>
//! ```
//!
//! - **Length Prefix**: 4 bytes (big-endian u32) - Length of message ID + payload
//! - **Message ID**: 1 byte - Identifies the message type
//! - **Payload**: Variable length - Message-specific data
//!
//! ## Message Types
//!
//! | ID | Name | Payload |
//! |----|------|---------|
//! | 0 | CHOKE | none |
//! | 1 | UNCHOKE | none |
//! | 2 | INTERESTED | none |
//! | 3 | NOT INTERESTED | none |
//! | 4 | HAVE | piece index |
//! | 5 | BITFIELD | piece availability, MSB-first per byte |
//! | 6 | REQUEST | index, begin, length |
//! | 7 | PIECE | index, begin, block data |
//! | 8 | CANCEL | index, begin, length |
//! | 14 | HAVE ALL | none |
//! | 15 | HAVE NONE | none |
//! | 20 | EXTENDED | inner extended ID, then opaque payload |
//!
//! Unknown IDs are tolerated: their payload is consumed and the message is
//! handed to the caller, which normally ignores it. Messages whose payload
//! length contradicts the fixed size of their ID, and frames larger than
//! 1MB, are protocol errors.
//!
//! ## Keep-Alive Messages
//!
//! A keep-alive has length 0 and no ID or payload. It is surfaced with the
//! reserved pseudo-ID 255 so callers can skip it explicitly.

use std::io::Read;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{ClientError, Result};

pub type MessageId = u8;
type MessagePayload = Vec<u8>;

pub const MESSAGE_CHOKE: MessageId = 0;
pub const MESSAGE_UNCHOKE: MessageId = 1;
pub const MESSAGE_INTERESTED: MessageId = 2;
pub const MESSAGE_NOT_INTERESTED: MessageId = 3;
pub const MESSAGE_HAVE: MessageId = 4;
pub const MESSAGE_BITFIELD: MessageId = 5;
pub const MESSAGE_REQUEST: MessageId = 6;
pub const MESSAGE_PIECE: MessageId = 7;
pub const MESSAGE_CANCEL: MessageId = 8;
pub const MESSAGE_HAVE_ALL: MessageId = 14;
pub const MESSAGE_HAVE_NONE: MessageId = 15;
pub const MESSAGE_EXTENDED: MessageId = 20;
pub const MESSAGE_KEEPALIVE: MessageId = 255; // Special value for keep-alive (length 0)

// Largest frame we accept from a peer
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message type identifier
    pub id: MessageId,
    /// Message payload data
    pub payload: MessagePayload,
}

impl Message {
    /// Build a new message without payload.
    pub fn new(id: MessageId) -> Message {
        Message {
            id,
            payload: vec![],
        }
    }

    /// Build a new message with a payload.
    pub fn new_with_payload(id: MessageId, payload: MessagePayload) -> Message {
        Message { id, payload }
    }

    /// Build a REQUEST (or CANCEL) payload for one block.
    pub fn request(index: u32, begin: u32, length: u32) -> Message {
        let mut payload = Vec::with_capacity(12);
        payload.write_u32::<BigEndian>(index).unwrap();
        payload.write_u32::<BigEndian>(begin).unwrap();
        payload.write_u32::<BigEndian>(length).unwrap();
        Message::new_with_payload(MESSAGE_REQUEST, payload)
    }

    /// Build a PIECE message carrying one block.
    pub fn piece(index: u32, begin: u32, block: &[u8]) -> Message {
        let mut payload = Vec::with_capacity(8 + block.len());
        payload.write_u32::<BigEndian>(index).unwrap();
        payload.write_u32::<BigEndian>(begin).unwrap();
        payload.extend_from_slice(block);
        Message::new_with_payload(MESSAGE_PIECE, payload)
    }

    /// Build a HAVE message for one piece index.
    #[allow(dead_code)]
    pub fn have(index: u32) -> Message {
        let mut payload = Vec::with_capacity(4);
        payload.write_u32::<BigEndian>(index).unwrap();
        Message::new_with_payload(MESSAGE_HAVE, payload)
    }

    /// Build a BITFIELD message from a packed payload.
    pub fn bitfield(payload: Vec<u8>) -> Message {
        Message::new_with_payload(MESSAGE_BITFIELD, payload)
    }

    /// Serialize the message with its length prefix.
    pub fn serialize(&self) -> Vec<u8> {
        let message_len = 1 + self.payload.len();
        let mut serialized: Vec<u8> = Vec::with_capacity(4 + message_len);
        serialized
            .write_u32::<BigEndian>(message_len as u32)
            .unwrap();
        serialized.push(self.id);
        serialized.extend_from_slice(&self.payload);
        serialized
    }
}

/// Read one framed message from a stream.
///
/// Keep-alives come back with the `MESSAGE_KEEPALIVE` pseudo-ID. Extended
/// messages (ID 20) have their inner extended ID byte folded into the
/// payload head. Fixed-size messages are validated against their declared
/// payload length.
pub fn read_message<R: Read>(stream: &mut R) -> Result<Message> {
    let message_len = stream
        .read_u32::<BigEndian>()
        .map_err(|e| ClientError::peer(format!("could not read message length: {}", e)))?
        as usize;

    if message_len == 0 {
        return Ok(Message::new(MESSAGE_KEEPALIVE));
    }
    if message_len > MAX_FRAME_LEN {
        return Err(ClientError::peer(format!(
            "oversize frame of {} bytes",
            message_len
        )));
    }

    let mut buf = vec![0u8; message_len];
    stream
        .read_exact(&mut buf)
        .map_err(|e| ClientError::peer(format!("could not read message body: {}", e)))?;

    let id = buf[0];
    let payload = buf[1..].to_vec();

    if id == MESSAGE_EXTENDED {
        // The first payload byte is the inner extended ID; it stays at the
        // head of the payload and the rest is treated as opaque data.
        if payload.is_empty() {
            return Err(ClientError::peer("extended message without inner ID"));
        }
        return Ok(Message::new_with_payload(MESSAGE_EXTENDED, payload));
    }

    validate_payload_len(id, payload.len())?;
    Ok(Message::new_with_payload(id, payload))
}

/// Check a payload length against the fixed size of the message ID.
fn validate_payload_len(id: MessageId, len: usize) -> Result<()> {
    let expected = match id {
        MESSAGE_CHOKE | MESSAGE_UNCHOKE | MESSAGE_INTERESTED | MESSAGE_NOT_INTERESTED
        | MESSAGE_HAVE_ALL | MESSAGE_HAVE_NONE => Some(0),
        MESSAGE_HAVE => Some(4),
        MESSAGE_REQUEST | MESSAGE_CANCEL => Some(12),
        // PIECE needs at least index + begin; BITFIELD and unknown IDs are
        // variable-length
        _ => None,
    };

    match expected {
        Some(expected) if len != expected => Err(ClientError::peer(format!(
            "message {} carries {} payload bytes, expected {}",
            id, len, expected
        ))),
        _ if id == MESSAGE_PIECE && len < 8 => Err(ClientError::peer(format!(
            "piece message carries only {} payload bytes",
            len
        ))),
        _ => Ok(()),
    }
}

/// Parse the piece index out of a HAVE message.
pub fn parse_have(message: &Message) -> Result<u32> {
    if message.id != MESSAGE_HAVE || message.payload.len() != 4 {
        return Err(ClientError::peer("invalid have message"));
    }
    let mut cursor = &message.payload[..];
    Ok(cursor.read_u32::<BigEndian>().unwrap())
}

/// Parse (index, begin, length) out of a REQUEST or CANCEL message.
pub fn parse_request(message: &Message) -> Result<(u32, u32, u32)> {
    if (message.id != MESSAGE_REQUEST && message.id != MESSAGE_CANCEL)
        || message.payload.len() != 12
    {
        return Err(ClientError::peer("invalid request message"));
    }
    let mut cursor = &message.payload[..];
    let index = cursor.read_u32::<BigEndian>().unwrap();
    let begin = cursor.read_u32::<BigEndian>().unwrap();
    let length = cursor.read_u32::<BigEndian>().unwrap();
    Ok((index, begin, length))
}

/// Parse (index, begin, block) out of a PIECE message.
pub fn parse_piece(message: &Message) -> Result<(u32, u32, &[u8])> {
    if message.id != MESSAGE_PIECE || message.payload.len() < 8 {
        return Err(ClientError::peer("invalid piece message"));
    }
    let mut cursor = &message.payload[..];
    let index = cursor.read_u32::<BigEndian>().unwrap();
    let begin = cursor.read_u32::<BigEndian>().unwrap();
    Ok((index, begin, &message.payload[8..]))
}
