//! # Tracker Contract
//!
//! This module defines the announce request/response types shared by both
//! tracker transports, dispatches announces by URL scheme, and keeps the
//! per-torrent peer directory that announce responses feed.
//!
//! ## Announce Exchange
//!
//! An announce reports transfer progress (uploaded, downloaded, left) plus an
//! optional lifecycle event (started, completed, stopped) and receives back a
//! re-announce interval, swarm counts, and a list of peers.
//!
//! ## Peer Lists
//!
//! Peers are identified by (ip, port); duplicates within one announce are
//! dropped, as are unusable records (port 0 or the unspecified address).

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Mutex;

use rand::Rng;
use url::Url;

use crate::error::{ClientError, Result};
use crate::{tracker_http, tracker_udp};

// How many peers to ask for while downloading and while seeding
pub const NUM_WANT_DOWNLOADING: u32 = 200;
pub const NUM_WANT_SEEDING: u32 = 50;

// Client identifier prefix for generated peer ids
const CLIENT_ID: &[u8; 8] = b"-BT0001-";

/// Lifecycle events reported to trackers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    None,
    Started,
    Completed,
    Stopped,
}

impl AnnounceEvent {
    /// Value of the HTTP `event` query parameter, absent for `None`.
    pub fn query_value(&self) -> Option<&'static str> {
        match self {
            AnnounceEvent::None => None,
            AnnounceEvent::Started => Some("started"),
            AnnounceEvent::Completed => Some("completed"),
            AnnounceEvent::Stopped => Some("stopped"),
        }
    }

    /// Event code of the UDP announce frame.
    pub fn udp_code(&self) -> u32 {
        match self {
            AnnounceEvent::None => 0,
            AnnounceEvent::Completed => 1,
            AnnounceEvent::Started => 2,
            AnnounceEvent::Stopped => 3,
        }
    }
}

/// The fields every announce carries, independent of transport.
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    /// SHA-1 of the torrent's info dictionary, sent raw or percent-encoded
    pub info_hash: [u8; 20],
    /// Our peer id
    pub peer_id: [u8; 20],
    /// The port we accept inbound peer connections on
    pub port: u16,
    /// Cumulative bytes uploaded this session
    pub uploaded: u64,
    /// Cumulative bytes downloaded this session
    pub downloaded: u64,
    /// Bytes still missing from the content
    pub left: u64,
    /// How many peers we would like back
    pub num_want: u32,
}

/// A peer returned by a tracker, identified by (ip, port).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrackerPeer {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl TrackerPeer {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }
}

/// A tracker's answer to an announce.
#[derive(Debug, Default, Clone)]
pub struct AnnounceResponse {
    /// Seconds the tracker wants us to wait before re-announcing
    pub interval: Option<u64>,
    /// Lower bound the tracker enforces on re-announce spacing
    pub min_interval: Option<u64>,
    /// Seeder count reported by the tracker
    pub seeders: Option<u64>,
    /// Leecher count reported by the tracker
    pub leechers: Option<u64>,
    /// Usable, deduplicated peers
    pub peers: Vec<TrackerPeer>,
}

/// Announce to a single tracker, dispatching on the URL scheme.
pub fn announce(
    url: &str,
    request: &AnnounceRequest,
    event: AnnounceEvent,
) -> Result<AnnounceResponse> {
    let parsed =
        Url::parse(url).map_err(|e| ClientError::tracker(format!("bad tracker URL: {}", e)))?;

    match parsed.scheme() {
        "http" | "https" => tracker_http::announce(url, request, event),
        "udp" => tracker_udp::announce(&parsed, request, event),
        other => Err(ClientError::tracker(format!(
            "unsupported tracker scheme {:?}",
            other
        ))),
    }
}

/// Whether a peer record is worth keeping.
pub(crate) fn usable_peer(ip: Ipv4Addr, port: u16) -> bool {
    port > 0 && ip != Ipv4Addr::UNSPECIFIED
}

/// Drop duplicate (ip, port) pairs, keeping first occurrences in order.
pub(crate) fn dedupe_peers(peers: Vec<TrackerPeer>) -> Vec<TrackerPeer> {
    let mut seen = std::collections::HashSet::new();
    peers.into_iter().filter(|p| seen.insert(*p)).collect()
}

/// Generate a 20-byte peer id: "-BT0001-" plus 12 random alphanumerics.
pub fn generate_peer_id() -> [u8; 20] {
    const CHARS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    let mut peer_id = [0u8; 20];
    peer_id[..8].copy_from_slice(CLIENT_ID);
    for byte in peer_id[8..].iter_mut() {
        *byte = CHARS[rng.gen_range(0..CHARS.len())];
    }
    peer_id
}

/// The peers known for one torrent, merged from tracker responses.
///
/// Workers snapshot this directory before each connection attempt, so peers
/// discovered by a later announce become visible to them without restarts.
#[derive(Debug, Default)]
pub struct PeerDirectory {
    peers: Mutex<Vec<TrackerPeer>>,
}

impl PeerDirectory {
    pub fn new() -> PeerDirectory {
        PeerDirectory::default()
    }

    /// Merge newly announced peers, returning how many were actually new.
    pub fn merge(&self, incoming: &[TrackerPeer]) -> usize {
        let mut peers = self.peers.lock().unwrap();
        let mut added = 0;
        for peer in incoming {
            if !peers.contains(peer) {
                peers.push(*peer);
                added += 1;
            }
        }
        added
    }

    /// Copy of the current peer list.
    pub fn snapshot(&self) -> Vec<TrackerPeer> {
        self.peers.lock().unwrap().clone()
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.peers.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_has_client_prefix_and_printable_tail() {
        let id = generate_peer_id();
        assert_eq!(&id[..8], b"-BT0001-");
        assert!(id[8..].iter().all(|b| b.is_ascii_alphanumeric()));
    }

    #[test]
    fn udp_event_codes_match_protocol() {
        assert_eq!(AnnounceEvent::None.udp_code(), 0);
        assert_eq!(AnnounceEvent::Completed.udp_code(), 1);
        assert_eq!(AnnounceEvent::Started.udp_code(), 2);
        assert_eq!(AnnounceEvent::Stopped.udp_code(), 3);
    }

    #[test]
    fn unsupported_scheme_is_a_tracker_failure() {
        let request = AnnounceRequest {
            info_hash: [0; 20],
            peer_id: [0; 20],
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 0,
            num_want: 50,
        };
        assert!(matches!(
            announce("wss://tracker.test/ann", &request, AnnounceEvent::None),
            Err(ClientError::TrackerFailure(_))
        ));
    }

    #[test]
    fn directory_merge_deduplicates() {
        let directory = PeerDirectory::new();
        let a = TrackerPeer {
            ip: Ipv4Addr::new(1, 2, 3, 4),
            port: 6881,
        };
        let b = TrackerPeer {
            ip: Ipv4Addr::new(5, 6, 7, 8),
            port: 51413,
        };

        assert_eq!(directory.merge(&[a, b]), 2);
        assert_eq!(directory.merge(&[a]), 0);
        assert_eq!(directory.len(), 2);
        assert_eq!(directory.snapshot(), vec![a, b]);
    }

    #[test]
    fn unusable_peers_are_detected() {
        assert!(!usable_peer(Ipv4Addr::new(1, 2, 3, 4), 0));
        assert!(!usable_peer(Ipv4Addr::UNSPECIFIED, 6881));
        assert!(usable_peer(Ipv4Addr::new(1, 2, 3, 4), 6881));
    }
}
