//! # HTTP Tracker Transport
//!
//! Announces over HTTP(S) are a single GET whose query string carries the
//! request fields. The info hash and peer id are raw 20-byte strings and are
//! percent-encoded byte-by-byte; everything else is plain text.
//!
//! The response is a bencoded dictionary. Peers arrive either as a compact
//! binary string of 6-byte records (4-byte IPv4, 2-byte big-endian port) or
//! as a list of dictionaries with `ip` and `port` keys. A `failure reason`
//! key invalidates every other field.

use std::net::Ipv4Addr;
use std::time::Duration;

use serde::de;
use serde::Deserialize;

use crate::error::{ClientError, Result};
use crate::tracker::{
    dedupe_peers, usable_peer, AnnounceEvent, AnnounceRequest, AnnounceResponse, TrackerPeer,
};

// Give up on an unresponsive tracker after this long
const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

/// Send one announce to an HTTP tracker and parse its answer.
pub fn announce(
    url: &str,
    request: &AnnounceRequest,
    event: AnnounceEvent,
) -> Result<AnnounceResponse> {
    let full_url = build_announce_url(url, request, event);
    debug!("Sending HTTP tracker request: {}", full_url);

    let client = reqwest::blocking::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .map_err(|e| ClientError::tracker(e.to_string()))?;

    let response = client
        .get(&full_url)
        .send()
        .map_err(|e| ClientError::tracker(e.to_string()))?;
    let body = response
        .bytes()
        .map_err(|e| ClientError::tracker(e.to_string()))?;

    parse_response(&body)
}

/// Build the full announce URL with query parameters.
fn build_announce_url(base: &str, request: &AnnounceRequest, event: AnnounceEvent) -> String {
    let mut url = base.to_string();
    url.push(if base.contains('?') { '&' } else { '?' });

    url.push_str(&format!(
        "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1&numwant={}",
        percent_encode_binary(&request.info_hash),
        percent_encode_binary(&request.peer_id),
        request.port,
        request.uploaded,
        request.downloaded,
        request.left,
        request.num_want,
    ));

    if let Some(event) = event.query_value() {
        url.push_str("&event=");
        url.push_str(event);
    }

    url
}

/// Percent-encode arbitrary bytes, each as %XX.
fn percent_encode_binary(data: &[u8]) -> String {
    const HEX_DIGITS: &[u8] = b"0123456789ABCDEF";
    let mut encoded = String::with_capacity(data.len() * 3);

    for &byte in data {
        encoded.push('%');
        encoded.push(HEX_DIGITS[(byte >> 4) as usize] as char);
        encoded.push(HEX_DIGITS[(byte & 0x0F) as usize] as char);
    }

    encoded
}

/// BencodeTracker response structure.
#[derive(Debug, Deserialize)]
struct BencodeTrackerResponse {
    #[serde(rename = "failure reason", default)]
    failure_reason: Option<String>,
    // Interval in seconds to wait between announces
    #[serde(default)]
    interval: Option<u64>,
    #[serde(rename = "min interval", default)]
    min_interval: Option<u64>,
    // Seeders and leechers known to the tracker
    #[serde(default)]
    complete: Option<u64>,
    #[serde(default)]
    incomplete: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_peers")]
    peers: Vec<TrackerPeer>,
}

/// Decode a bencoded tracker response body.
fn parse_response(data: &[u8]) -> Result<AnnounceResponse> {
    let raw: BencodeTrackerResponse = serde_bencode::from_bytes(data)
        .map_err(|e| ClientError::MalformedTrackerResponse(e.to_string()))?;

    if let Some(reason) = raw.failure_reason {
        return Err(ClientError::TrackerFailure(reason));
    }

    Ok(AnnounceResponse {
        interval: raw.interval,
        min_interval: raw.min_interval,
        seeders: raw.complete,
        leechers: raw.incomplete,
        peers: dedupe_peers(raw.peers),
    })
}

/// Deserialize peers in either compact or dictionary form.
///
/// Compact form is a byte string of 6-byte records; dictionary form is a
/// list of dicts with `ip` and `port` keys (any `peer id` is discarded, we
/// identify peers by address). Unusable records are skipped.
fn deserialize_peers<'de, D>(deserializer: D) -> std::result::Result<Vec<TrackerPeer>, D::Error>
where
    D: de::Deserializer<'de>,
{
    struct Visitor;

    impl<'de> de::Visitor<'de> for Visitor {
        type Value = Vec<TrackerPeer>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a compact peer string or a list of peer dicts")
        }

        fn visit_bytes<E>(self, b: &[u8]) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            const ENTRY_LEN: usize = 6;

            if b.len() % ENTRY_LEN != 0 {
                return Err(E::custom("compact peer string is not a multiple of 6"));
            }

            let mut peers = Vec::with_capacity(b.len() / ENTRY_LEN);
            for entry in b.chunks_exact(ENTRY_LEN) {
                let ip = Ipv4Addr::new(entry[0], entry[1], entry[2], entry[3]);
                let port = u16::from_be_bytes([entry[4], entry[5]]);
                if usable_peer(ip, port) {
                    peers.push(TrackerPeer { ip, port });
                }
            }
            Ok(peers)
        }

        fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            #[derive(Debug, Deserialize)]
            struct RawPeer {
                ip: String,
                port: u16,
            }

            let mut peers = Vec::with_capacity(seq.size_hint().unwrap_or(0));
            while let Some(RawPeer { ip, port }) = seq.next_element()? {
                // IPv4 only; hostnames and IPv6 entries are skipped
                let ip: Ipv4Addr = match ip.parse() {
                    Ok(ip) => ip,
                    Err(_) => continue,
                };
                if usable_peer(ip, port) {
                    peers.push(TrackerPeer { ip, port });
                }
            }
            Ok(peers)
        }
    }

    deserializer.deserialize_any(Visitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> AnnounceRequest {
        AnnounceRequest {
            info_hash: *b"\x12\x34\xff\x00abcdefghijklmnop",
            peer_id: *b"-BT0001-abcdefghijkl",
            port: 6881,
            uploaded: 1,
            downloaded: 2,
            left: 3,
            num_want: 200,
        }
    }

    #[test]
    fn url_carries_percent_encoded_binary_fields() {
        let url = build_announce_url("http://tracker.test/ann", &request(), AnnounceEvent::Started);
        assert!(url.starts_with("http://tracker.test/ann?info_hash=%12%34%FF%00"));
        assert!(url.contains("&peer_id=%2D%42%54%30%30%30%31%2D"));
        assert!(url.contains("&port=6881"));
        assert!(url.contains("&uploaded=1&downloaded=2&left=3"));
        assert!(url.contains("&compact=1"));
        assert!(url.contains("&numwant=200"));
        assert!(url.ends_with("&event=started"));
    }

    #[test]
    fn periodic_announce_omits_event() {
        let url = build_announce_url("http://tracker.test/ann", &request(), AnnounceEvent::None);
        assert!(!url.contains("event="));
    }

    #[test]
    fn query_separator_respects_existing_query() {
        let url = build_announce_url(
            "http://tracker.test/ann?auth=1",
            &request(),
            AnnounceEvent::None,
        );
        assert!(url.starts_with("http://tracker.test/ann?auth=1&info_hash="));
    }

    #[test]
    fn parses_compact_peers() {
        let mut body = Vec::new();
        body.extend_from_slice(b"d8:completei5e10:incompletei3e8:intervali1800e5:peers12:");
        body.extend_from_slice(&[1, 2, 3, 4, 0x1A, 0xE1, 5, 6, 7, 8, 0xC8, 0xD5]);
        body.extend_from_slice(b"e");

        let response = parse_response(&body).unwrap();
        assert_eq!(response.interval, Some(1800));
        assert_eq!(response.seeders, Some(5));
        assert_eq!(response.leechers, Some(3));
        assert_eq!(
            response.peers,
            vec![
                TrackerPeer {
                    ip: Ipv4Addr::new(1, 2, 3, 4),
                    port: 6881,
                },
                TrackerPeer {
                    ip: Ipv4Addr::new(5, 6, 7, 8),
                    port: 51413,
                },
            ]
        );
    }

    #[test]
    fn drops_unusable_compact_records() {
        let mut body = Vec::new();
        body.extend_from_slice(b"d8:intervali60e5:peers18:");
        body.extend_from_slice(&[1, 2, 3, 4, 0x1A, 0xE1]);
        body.extend_from_slice(&[10, 0, 0, 1, 0, 0]); // port 0
        body.extend_from_slice(&[0, 0, 0, 0, 0x1A, 0xE1]); // 0.0.0.0
        body.extend_from_slice(b"e");

        let response = parse_response(&body).unwrap();
        assert_eq!(response.peers.len(), 1);
        assert_eq!(response.peers[0].ip, Ipv4Addr::new(1, 2, 3, 4));
    }

    #[test]
    fn rejects_compact_blob_not_divisible_by_six() {
        let mut body = Vec::new();
        body.extend_from_slice(b"d8:intervali60e5:peers7:");
        body.extend_from_slice(&[1, 2, 3, 4, 0x1A, 0xE1, 9]);
        body.extend_from_slice(b"e");

        assert!(matches!(
            parse_response(&body),
            Err(ClientError::MalformedTrackerResponse(_))
        ));
    }

    #[test]
    fn parses_dictionary_peers() {
        let body =
            b"d8:intervali900e5:peersld2:ip7:1.2.3.44:porti6881eed2:ip7:5.6.7.84:porti51413eeee";
        let response = parse_response(&body[..]).unwrap();
        assert_eq!(response.interval, Some(900));
        assert_eq!(response.peers.len(), 2);
        assert_eq!(response.peers[1].port, 51413);
    }

    #[test]
    fn duplicate_peers_within_one_announce_are_dropped() {
        let mut body = Vec::new();
        body.extend_from_slice(b"d8:intervali60e5:peers12:");
        body.extend_from_slice(&[1, 2, 3, 4, 0x1A, 0xE1, 1, 2, 3, 4, 0x1A, 0xE1]);
        body.extend_from_slice(b"e");

        let response = parse_response(&body).unwrap();
        assert_eq!(response.peers.len(), 1);
    }

    #[test]
    fn failure_reason_wins_over_everything() {
        let body = b"d14:failure reason15:unknown torrent8:intervali1800ee";
        assert!(matches!(
            parse_response(&body[..]),
            Err(ClientError::TrackerFailure(reason)) if reason == "unknown torrent"
        ));
    }
}
