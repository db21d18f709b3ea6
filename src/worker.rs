//! # Download Worker
//!
//! This module implements one member of the download worker pool. Each
//! worker owns at most one peer connection at a time and coordinates with
//! the piece manager through claims.
//!
//! ## Per-Peer Protocol
//!
//! 1. **Connect**: TCP with timeout; repeated failures rotate to another peer
//! 2. **Handshake**: info hash must match or the peer is dropped
//! 3. **Bitfield**: wait for `bitfield`, `have all`, or `have none`
//! 4. **Interest**: send `interested`, wait for `unchoke`
//! 5. **Download**: claim a piece, request it block by block, verify SHA-1,
//!    write to disk, then mark it present
//!
//! A `choke` received at any point suspends the transfer: the claimed piece
//! is returned and the worker waits for the next `unchoke`. A `piece`
//! response that does not match the next expected request is a protocol
//! error and drops the peer.
//!
//! ## Error Handling
//!
//! - Peer failures increment a counter; after 3 the worker moves on to the
//!   next peer in the directory, with a pause between attempts
//! - Hash mismatches return the piece for retry and keep the connection
//! - A fatal manager error (exhausted retry budget) stops the worker

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;

use crate::client::PeerConnection;
use crate::error::{ClientError, Result};
use crate::manager::PieceManager;
use crate::message::{self, MESSAGE_CHOKE, MESSAGE_PIECE};
use crate::meter::TransferMeter;
use crate::piece::{check_integrity, PieceWork, BLOCK_SIZE};
use crate::shutdown::Shutdown;
use crate::storage::FileStore;
use crate::tracker::PeerDirectory;

// Consecutive failures against one peer before rotating to the next
const MAX_PEER_FAILURES: u32 = 3;

// Pause after a failed peer attempt
const PEER_RETRY_DELAY: Duration = Duration::from_secs(5);

// Pause while the peer directory is still empty
const NO_PEERS_DELAY: Duration = Duration::from_secs(2);

/// Notification to the session that a piece landed on disk.
#[derive(Debug, Clone, Copy)]
pub struct PieceCompletion {
    pub index: usize,
    pub length: u32,
}

/// Outcome of transferring one piece over an unchoked connection.
enum FetchOutcome {
    Complete(Vec<u8>),
    Choked,
}

/// One member of the download worker pool.
pub struct DownloadWorker {
    worker_id: usize,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    peers: Arc<PeerDirectory>,
    manager: Arc<PieceManager>,
    store: Arc<FileStore>,
    meter: Arc<TransferMeter>,
    completions: Sender<PieceCompletion>,
    shutdown: Arc<Shutdown>,
}

impl DownloadWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worker_id: usize,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        peers: Arc<PeerDirectory>,
        manager: Arc<PieceManager>,
        store: Arc<FileStore>,
        meter: Arc<TransferMeter>,
        completions: Sender<PieceCompletion>,
        shutdown: Arc<Shutdown>,
    ) -> DownloadWorker {
        DownloadWorker {
            worker_id,
            info_hash,
            peer_id,
            peers,
            manager,
            store,
            meter,
            completions,
            shutdown,
        }
    }

    /// Worker loop: rotate through peers until the torrent completes, the
    /// session shuts down, or the manager reports a fatal error.
    pub fn run(&self) {
        debug!("Worker {} started", self.worker_id);

        let mut rotation = 0usize;
        let mut failures = 0u32;

        loop {
            if self.shutdown.is_set()
                || self.manager.is_complete()
                || self.manager.failure().is_some()
            {
                break;
            }

            let peers = self.peers.snapshot();
            if peers.is_empty() {
                trace!("Worker {} has no peers yet", self.worker_id);
                if self.shutdown.wait_timeout(NO_PEERS_DELAY) {
                    break;
                }
                continue;
            }

            let peer = peers[(self.worker_id + rotation) % peers.len()];
            match self.download_from_peer(peer.addr()) {
                Ok(()) => {
                    failures = 0;
                }
                Err(ClientError::Shutdown) => break,
                Err(ClientError::RetryExhausted { .. }) => break,
                Err(e) => {
                    debug!(
                        "Worker {} failed with peer {}: {}",
                        self.worker_id,
                        peer.addr(),
                        e
                    );
                    failures += 1;
                    if failures >= MAX_PEER_FAILURES {
                        debug!(
                            "Worker {} giving up on peer {}, rotating",
                            self.worker_id,
                            peer.addr()
                        );
                        rotation += 1;
                        failures = 0;
                    }
                    if self.shutdown.wait_timeout(PEER_RETRY_DELAY) {
                        break;
                    }
                }
            }
        }

        debug!("Worker {} finished", self.worker_id);
    }

    /// Run the full per-peer state machine against one peer.
    fn download_from_peer(&self, addr: SocketAddr) -> Result<()> {
        let mut conn = PeerConnection::connect(addr)?;
        conn.handshake(self.info_hash, self.peer_id)?;
        conn.await_bitfield(self.manager.num_pieces())?;
        conn.send_interested()?;
        conn.await_unchoke()?;

        loop {
            if self.shutdown.is_set() {
                return Err(ClientError::Shutdown);
            }

            let piece = match self.manager.next_piece()? {
                Some(piece) => piece,
                // Torrent complete or shutting down
                None => return Ok(()),
            };

            if !conn.has_piece(piece.index) {
                let index = piece.index;
                self.manager.requeue(piece);
                return Err(ClientError::peer(format!(
                    "peer {} does not have piece {}",
                    addr, index
                )));
            }

            match self.fetch_piece(&mut conn, &piece) {
                Ok(FetchOutcome::Complete(data)) => {
                    if !check_integrity(&piece.hash, &data) {
                        let err = ClientError::PieceVerification { index: piece.index };
                        warn!("{} (from {}), returning for retry", err, addr);
                        self.manager.return_for_retry(piece);
                        continue;
                    }

                    // The piece becomes observable only after its bytes are
                    // written and flushed.
                    let completion = PieceCompletion {
                        index: piece.index,
                        length: piece.length,
                    };
                    if let Err(e) = self.store.write_piece(piece.index, &data) {
                        error!("Failed to write piece {}: {}", piece.index, e);
                        self.manager.return_for_retry(piece);
                        return Err(e);
                    }
                    self.manager.mark_completed(piece.index)?;
                    self.meter.add_downloaded(u64::from(completion.length));
                    let _ = self.completions.send(completion);

                    debug!(
                        "Worker {} completed piece {} from {} ({} bytes)",
                        self.worker_id, completion.index, addr, completion.length
                    );
                }
                Ok(FetchOutcome::Choked) => {
                    debug!(
                        "Peer {} choked us mid-piece, returning piece {}",
                        addr, piece.index
                    );
                    self.manager.return_for_retry(piece);
                    conn.await_unchoke()?;
                }
                Err(e) => {
                    self.manager.return_for_retry(piece);
                    return Err(e);
                }
            }
        }
    }

    /// Request all blocks of a piece and collect the responses in order.
    fn fetch_piece(&self, conn: &mut PeerConnection, piece: &PieceWork) -> Result<FetchOutcome> {
        // Send every block request up front
        let mut begin = 0u32;
        while begin < piece.length {
            let block_len = BLOCK_SIZE.min(piece.length - begin);
            conn.send_request(piece.index as u32, begin, block_len)?;
            begin += block_len;
        }

        // Collect the responses in request order
        let mut data = vec![0u8; piece.length as usize];
        let mut expected_begin = 0u32;

        while expected_begin < piece.length {
            let msg = conn.read_message()?;
            match msg.id {
                MESSAGE_CHOKE => return Ok(FetchOutcome::Choked),
                MESSAGE_PIECE => {
                    let (index, block_begin, block) = message::parse_piece(&msg)?;
                    let expected_len = BLOCK_SIZE.min(piece.length - expected_begin) as usize;

                    if index as usize != piece.index
                        || block_begin != expected_begin
                        || block.len() != expected_len
                    {
                        return Err(ClientError::peer(format!(
                            "unexpected block {}+{} ({} bytes), expected {}+{} ({} bytes)",
                            index,
                            block_begin,
                            block.len(),
                            piece.index,
                            expected_begin,
                            expected_len
                        )));
                    }

                    let at = block_begin as usize;
                    data[at..at + block.len()].copy_from_slice(block);
                    expected_begin += block.len() as u32;
                }
                // Keep-alives and availability updates are applied by the
                // connection; everything else is ignored here
                _ => {}
            }
        }

        Ok(FetchOutcome::Complete(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::path::PathBuf;
    use std::thread;
    use tempfile::tempdir;

    use crate::handshake::{Handshake, HANDSHAKE_LEN};
    use crate::message::{Message, MESSAGE_INTERESTED, MESSAGE_REQUEST, MESSAGE_UNCHOKE};
    use crate::piece::{sha1, MAX_RETRIES};
    use crate::torrent::{FileEntry, Metainfo};

    // A two-piece torrent (20000 bytes) with hashes over real content.
    fn test_meta() -> (Metainfo, Vec<Vec<u8>>) {
        let piece_length = 16384u64;
        let total = 20000u64;
        let pieces = vec![
            (0..16384u32).map(|i| (i % 199) as u8).collect::<Vec<u8>>(),
            (0..3616u32).map(|i| (i % 211) as u8).collect::<Vec<u8>>(),
        ];
        let meta = Metainfo {
            name: "w.bin".into(),
            info_hash: [0xAB; 20],
            piece_hashes: pieces.iter().map(|p| sha1(p)).collect(),
            piece_length,
            total_length: total,
            files: vec![FileEntry {
                path: PathBuf::from("w.bin"),
                length: total,
                offset: 0,
            }],
            multi_file: false,
            trackers: vec!["http://tracker.test/ann".into()],
        };
        (meta, pieces)
    }

    // A scripted seeder: serves blocks from `content`, corrupting the first
    // served block `corrupt_first_n` times.
    fn scripted_peer(info_hash: [u8; 20], pieces: Vec<Vec<u8>>, corrupt_first_n: usize) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut corruptions_left = corrupt_first_n;

            // Handshake
            let mut buf = [0u8; HANDSHAKE_LEN];
            stream.read_exact(&mut buf).unwrap();
            stream
                .write_all(&Handshake::new(info_hash, [0x77; 20]).serialize())
                .unwrap();

            // Advertise everything
            stream
                .write_all(&Message::new(crate::message::MESSAGE_HAVE_ALL).serialize())
                .unwrap();

            // Interested -> unchoke
            let msg = message::read_message(&mut stream).unwrap();
            assert_eq!(msg.id, MESSAGE_INTERESTED);
            stream
                .write_all(&Message::new(MESSAGE_UNCHOKE).serialize())
                .unwrap();

            // Serve requests until the client hangs up
            while let Ok(msg) = message::read_message(&mut stream) {
                if msg.id != MESSAGE_REQUEST {
                    continue;
                }
                let (index, begin, length) = message::parse_request(&msg).unwrap();
                let piece = &pieces[index as usize];
                let mut block =
                    piece[begin as usize..(begin + length) as usize].to_vec();
                if corruptions_left > 0 {
                    corruptions_left -= 1;
                    block[0] ^= 0xFF;
                }
                let reply = Message::piece(index, begin, &block);
                if stream.write_all(&reply.serialize()).is_err() {
                    break;
                }
            }
        });

        addr
    }

    fn build_worker(
        meta: &Metainfo,
        dir: &std::path::Path,
        addr: SocketAddr,
    ) -> (
        DownloadWorker,
        Arc<PieceManager>,
        Arc<FileStore>,
        crossbeam_channel::Receiver<PieceCompletion>,
    ) {
        let store = Arc::new(FileStore::allocate(meta, dir).unwrap());
        let manager = Arc::new(PieceManager::with_retry_pacing(
            meta,
            dir,
            MAX_RETRIES,
            Duration::ZERO,
        ));
        manager.initialize(&store, false).unwrap();

        let peers = Arc::new(PeerDirectory::new());
        peers.merge(&[crate::tracker::TrackerPeer {
            ip: match addr.ip() {
                std::net::IpAddr::V4(ip) => ip,
                _ => unreachable!(),
            },
            port: addr.port(),
        }]);

        let (tx, rx) = crossbeam_channel::unbounded();
        let worker = DownloadWorker::new(
            0,
            meta.info_hash,
            [0x11; 20],
            peers,
            Arc::clone(&manager),
            Arc::clone(&store),
            Arc::new(TransferMeter::new(Duration::from_secs(2))),
            tx,
            Arc::new(Shutdown::new()),
        );
        (worker, manager, store, rx)
    }

    #[test]
    fn downloads_and_verifies_all_pieces() {
        let dir = tempdir().unwrap();
        let (meta, pieces) = test_meta();
        let addr = scripted_peer(meta.info_hash, pieces.clone(), 0);
        let (worker, manager, store, completions) = build_worker(&meta, dir.path(), addr);

        worker.download_from_peer(addr).unwrap();

        assert!(manager.is_complete());
        assert_eq!(completions.try_iter().count(), 2);
        assert_eq!(store.read_piece(0).unwrap(), pieces[0]);
        assert_eq!(store.read_piece(1).unwrap(), pieces[1]);
    }

    #[test]
    fn hash_mismatch_triggers_retry_then_success() {
        let dir = tempdir().unwrap();
        let (meta, pieces) = test_meta();
        // The first served block is corrupted once, failing one piece
        let addr = scripted_peer(meta.info_hash, pieces.clone(), 1);
        let (worker, manager, _store, completions) = build_worker(&meta, dir.path(), addr);

        worker.download_from_peer(addr).unwrap();

        assert!(manager.is_complete());
        // Exactly one completion per piece despite the retry
        let mut indices: Vec<usize> = completions.try_iter().map(|c| c.index).collect();
        indices.sort_unstable();
        assert_eq!(indices, vec![0, 1]);
    }

    #[test]
    fn wrong_info_hash_drops_the_peer() {
        let dir = tempdir().unwrap();
        let (meta, pieces) = test_meta();
        let addr = scripted_peer([0xEE; 20], pieces, 0);
        let (worker, manager, _store, _completions) = build_worker(&meta, dir.path(), addr);

        assert!(matches!(
            worker.download_from_peer(addr),
            Err(ClientError::PeerProtocol(_))
        ));
        assert!(!manager.is_complete());
    }
}
