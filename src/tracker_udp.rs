//! # UDP Tracker Transport
//!
//! UDP announces are a two-phase exchange:
//!
//! 1. **Connect**: a 16-byte frame carrying the protocol magic, action 0,
//!    and a random transaction ID; the tracker answers with the same action
//!    and transaction ID plus an 8-byte connection ID.
//! 2. **Announce**: a 98-byte frame carrying the connection ID, action 1, a
//!    fresh transaction ID, the request fields, an event code, a random key,
//!    `num_want`, and our port. The answer starts with action, transaction
//!    ID, interval, leecher and seeder counts, followed by 6-byte peer
//!    records.
//!
//! A response whose action or transaction ID does not match is fatal for the
//! attempt; the announce scheduler simply retries at its next tick. Action 3
//! is an error frame whose remainder is a human-readable message.

use std::net::UdpSocket;
use std::time::Duration;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use rand::Rng;
use url::Url;

use crate::error::{ClientError, Result};
use crate::tracker::{
    dedupe_peers, usable_peer, AnnounceEvent, AnnounceRequest, AnnounceResponse, TrackerPeer,
};

const PROTOCOL_MAGIC: u64 = 0x41727101980;

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;

// Per-receive socket timeout
const SOCKET_TIMEOUT: Duration = Duration::from_secs(15);

const CONNECT_REQUEST_SIZE: usize = 16;
const CONNECT_RESPONSE_SIZE: usize = 16;
const ANNOUNCE_REQUEST_SIZE: usize = 98;
const PEER_SIZE: usize = 6;

/// Send one announce to a UDP tracker and parse its answer.
pub fn announce(
    url: &Url,
    request: &AnnounceRequest,
    event: AnnounceEvent,
) -> Result<AnnounceResponse> {
    let host = url
        .host_str()
        .ok_or_else(|| ClientError::tracker("udp tracker URL has no host"))?;
    let port = url
        .port()
        .ok_or_else(|| ClientError::tracker("udp tracker URL has no port"))?;

    let socket =
        UdpSocket::bind("0.0.0.0:0").map_err(|e| ClientError::tracker(e.to_string()))?;
    socket
        .set_read_timeout(Some(SOCKET_TIMEOUT))
        .map_err(|e| ClientError::tracker(e.to_string()))?;
    socket
        .connect((host, port))
        .map_err(|e| ClientError::tracker(e.to_string()))?;

    let connection_id = connect(&socket)?;
    send_announce(&socket, connection_id, request, event)
}

/// Phase one: obtain a connection ID from the tracker.
fn connect(socket: &UdpSocket) -> Result<u64> {
    let transaction_id: u32 = rand::thread_rng().gen();

    let mut frame = Vec::with_capacity(CONNECT_REQUEST_SIZE);
    frame.write_u64::<BigEndian>(PROTOCOL_MAGIC).unwrap();
    frame.write_u32::<BigEndian>(ACTION_CONNECT).unwrap();
    frame.write_u32::<BigEndian>(transaction_id).unwrap();

    socket
        .send(&frame)
        .map_err(|e| ClientError::tracker(format!("udp connect send failed: {}", e)))?;

    let mut response = [0u8; CONNECT_RESPONSE_SIZE];
    let received = socket
        .recv(&mut response)
        .map_err(|e| ClientError::tracker(format!("udp connect receive failed: {}", e)))?;
    if received < CONNECT_RESPONSE_SIZE {
        return Err(ClientError::MalformedTrackerResponse(format!(
            "udp connect response is {} bytes",
            received
        )));
    }

    let mut cursor = &response[..];
    let action = cursor.read_u32::<BigEndian>().unwrap();
    let response_transaction_id = cursor.read_u32::<BigEndian>().unwrap();

    if action != ACTION_CONNECT {
        return Err(ClientError::tracker(format!(
            "unexpected action {} in udp connect response",
            action
        )));
    }
    if response_transaction_id != transaction_id {
        return Err(ClientError::tracker(
            "transaction ID mismatch in udp connect response",
        ));
    }

    Ok(cursor.read_u64::<BigEndian>().unwrap())
}

/// Phase two: the announce proper.
fn send_announce(
    socket: &UdpSocket,
    connection_id: u64,
    request: &AnnounceRequest,
    event: AnnounceEvent,
) -> Result<AnnounceResponse> {
    let transaction_id: u32 = rand::thread_rng().gen();

    let mut frame = Vec::with_capacity(ANNOUNCE_REQUEST_SIZE);
    frame.write_u64::<BigEndian>(connection_id).unwrap();
    frame.write_u32::<BigEndian>(ACTION_ANNOUNCE).unwrap();
    frame.write_u32::<BigEndian>(transaction_id).unwrap();
    frame.extend_from_slice(&request.info_hash);
    frame.extend_from_slice(&request.peer_id);
    frame.write_u64::<BigEndian>(request.downloaded).unwrap();
    frame.write_u64::<BigEndian>(request.left).unwrap();
    frame.write_u64::<BigEndian>(request.uploaded).unwrap();
    frame.write_u32::<BigEndian>(event.udp_code()).unwrap();
    frame.write_u32::<BigEndian>(0).unwrap(); // IP address (default)
    frame
        .write_u32::<BigEndian>(rand::thread_rng().gen())
        .unwrap(); // key
    frame.write_u32::<BigEndian>(request.num_want).unwrap();
    frame.write_u16::<BigEndian>(request.port).unwrap();
    debug_assert_eq!(frame.len(), ANNOUNCE_REQUEST_SIZE);

    socket
        .send(&frame)
        .map_err(|e| ClientError::tracker(format!("udp announce send failed: {}", e)))?;

    let mut response = [0u8; 2048];
    let received = socket
        .recv(&mut response)
        .map_err(|e| ClientError::tracker(format!("udp announce receive failed: {}", e)))?;

    parse_announce_response(&response[..received], transaction_id)
}

/// Decode an announce response frame.
fn parse_announce_response(data: &[u8], expected_transaction_id: u32) -> Result<AnnounceResponse> {
    if data.len() < 8 {
        return Err(ClientError::MalformedTrackerResponse(
            "udp announce response too short".into(),
        ));
    }

    let mut cursor = &data[..];
    let action = cursor.read_u32::<BigEndian>().unwrap();
    let transaction_id = cursor.read_u32::<BigEndian>().unwrap();

    if transaction_id != expected_transaction_id {
        return Err(ClientError::tracker(
            "transaction ID mismatch in udp announce response",
        ));
    }

    if action == ACTION_ERROR {
        let message = String::from_utf8_lossy(&data[8..]).into_owned();
        return Err(ClientError::TrackerFailure(message));
    }
    if action != ACTION_ANNOUNCE {
        return Err(ClientError::tracker(format!(
            "unexpected action {} in udp announce response",
            action
        )));
    }
    if data.len() < 20 {
        return Err(ClientError::MalformedTrackerResponse(
            "udp announce response is missing counters".into(),
        ));
    }

    let interval = cursor.read_u32::<BigEndian>().unwrap();
    let leechers = cursor.read_u32::<BigEndian>().unwrap();
    let seeders = cursor.read_u32::<BigEndian>().unwrap();

    let peer_bytes = &data[20..];
    if peer_bytes.len() % PEER_SIZE != 0 {
        return Err(ClientError::MalformedTrackerResponse(format!(
            "udp peer records span {} bytes, not a multiple of 6",
            peer_bytes.len()
        )));
    }

    let mut peers = Vec::with_capacity(peer_bytes.len() / PEER_SIZE);
    for entry in peer_bytes.chunks_exact(PEER_SIZE) {
        let ip = std::net::Ipv4Addr::new(entry[0], entry[1], entry[2], entry[3]);
        let port = u16::from_be_bytes([entry[4], entry[5]]);
        if usable_peer(ip, port) {
            peers.push(TrackerPeer { ip, port });
        }
    }

    Ok(AnnounceResponse {
        interval: Some(u64::from(interval)),
        min_interval: None,
        seeders: Some(u64::from(seeders)),
        leechers: Some(u64::from(leechers)),
        peers: dedupe_peers(peers),
    })
}
