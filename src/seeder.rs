//! # Seeding Listener
//!
//! Accepts inbound peer connections and serves blocks from locally present
//! pieces. One worker thread per accepted socket, capped; connections over
//! the cap are closed right after accept.
//!
//! ## Per-Peer Protocol
//!
//! ```text
//! read handshake -> send handshake -> send bitfield snapshot -> idle
//!                                                                │ interested
//!                                                                ▼
//!                                                      unchoked (serve requests)
//! ```
//!
//! The bitfield reflects the present set at handshake time; later
//! completions are not pushed. Requests are validated (piece present,
//! length within the block size, range within the piece); invalid requests
//! are dropped with a log and only a repeat offender gets disconnected.

use std::io::{self, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::error::{ClientError, Result};
use crate::events::ClientEvents;
use crate::handshake::Handshake;
use crate::manager::PieceManager;
use crate::message::{self, Message};
use crate::meter::TransferMeter;
use crate::piece::BLOCK_SIZE;
use crate::shutdown::Shutdown;
use crate::storage::FileStore;

// How many successive ports to probe when the preferred one is taken
const PORT_PROBE_RANGE: u16 = 20;

// Handshake phase timeout
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

// Serve-loop poll granularity; idle peers are legal, shutdown must not wait
const POLL_TIMEOUT: Duration = Duration::from_secs(1);

// Invalid requests tolerated before the connection is closed
const MAX_BAD_REQUESTS: u32 = 8;

/// Bind a listener, probing successive ports from the preferred one.
pub fn bind_listener(base_port: u16, torrent_index: usize) -> Result<(TcpListener, u16)> {
    let first = base_port.saturating_add(torrent_index as u16);
    for candidate in 0..PORT_PROBE_RANGE {
        let port = match first.checked_add(candidate) {
            Some(port) => port,
            None => break,
        };
        match TcpListener::bind(("0.0.0.0", port)) {
            Ok(listener) => {
                if candidate > 0 {
                    info!("Port {} was taken, listening on {}", first, port);
                }
                return Ok((listener, port));
            }
            Err(e) => debug!("Cannot listen on port {}: {}", port, e),
        }
    }
    Err(ClientError::FileSystem(io::Error::new(
        io::ErrorKind::AddrInUse,
        format!(
            "no free listen port in {}..{}",
            first,
            first.saturating_add(PORT_PROBE_RANGE)
        ),
    )))
}

/// The inbound side of a torrent: listener plus serving workers.
pub struct Seeder {
    listener: TcpListener,
    port: u16,
    /// Torrent name, for error reporting through the observer
    name: String,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    manager: Arc<PieceManager>,
    store: Arc<FileStore>,
    meter: Arc<TransferMeter>,
    events: Arc<dyn ClientEvents>,
    shutdown: Arc<Shutdown>,
    max_uploads: usize,
    active: AtomicUsize,
}

impl Seeder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        listener: TcpListener,
        port: u16,
        name: String,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        manager: Arc<PieceManager>,
        store: Arc<FileStore>,
        meter: Arc<TransferMeter>,
        events: Arc<dyn ClientEvents>,
        shutdown: Arc<Shutdown>,
        max_uploads: usize,
    ) -> Arc<Seeder> {
        Arc::new(Seeder {
            listener,
            port,
            name,
            info_hash,
            peer_id,
            manager,
            store,
            meter,
            events,
            shutdown,
            max_uploads,
            active: AtomicUsize::new(0),
        })
    }

    /// Connected inbound peers right now.
    pub fn active_peers(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Accept loop; returns once the shutdown latch is set and all serving
    /// workers have drained.
    pub fn run(self: &Arc<Self>) {
        if let Err(e) = self.listener.set_nonblocking(true) {
            // A listener that cannot be polled means no seeding at all;
            // that must be visible outside this thread
            let err = ClientError::FileSystem(e);
            error!("Cannot poll the seeding listener: {}", err);
            self.events.seeding_error(&self.name, &err);
            return;
        }

        info!("Accepting peer connections on port {}", self.port);
        let mut workers = Vec::new();

        loop {
            if self.shutdown.is_set() {
                break;
            }

            match self.listener.accept() {
                Ok((stream, addr)) => {
                    if self.active.load(Ordering::SeqCst) >= self.max_uploads {
                        warn!("Upload slots exhausted, rejecting {}", addr);
                        drop(stream);
                        continue;
                    }

                    self.active.fetch_add(1, Ordering::SeqCst);
                    self.events.peer_connected(addr);
                    info!("Accepted peer connection from {}", addr);

                    let seeder = Arc::clone(self);
                    workers.push(thread::spawn(move || {
                        if let Err(e) = seeder.serve_peer(stream, addr) {
                            debug!("Connection with {} ended: {}", addr, e);
                        }
                        seeder.active.fetch_sub(1, Ordering::SeqCst);
                        seeder.events.peer_disconnected(addr);
                    }));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if self.shutdown.wait_timeout(Duration::from_millis(200)) {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    if self.shutdown.wait_timeout(Duration::from_secs(1)) {
                        break;
                    }
                }
            }
        }

        for worker in workers {
            let _ = worker.join();
        }
        info!("Seeding listener on port {} stopped", self.port);
    }

    /// Serve one inbound peer until it disconnects or shutdown.
    fn serve_peer(&self, mut stream: TcpStream, addr: SocketAddr) -> Result<()> {
        // Accepted sockets may inherit the listener's non-blocking mode
        stream
            .set_nonblocking(false)
            .map_err(ClientError::FileSystem)?;
        stream
            .set_read_timeout(Some(HANDSHAKE_TIMEOUT))
            .map_err(ClientError::FileSystem)?;
        stream
            .set_write_timeout(Some(HANDSHAKE_TIMEOUT))
            .map_err(ClientError::FileSystem)?;

        // The inbound peer speaks first
        let remote = Handshake::read_from(&mut stream)?;
        if remote.info_hash != self.info_hash {
            return Err(ClientError::peer(format!(
                "info hash mismatch in handshake from {}",
                addr
            )));
        }
        Handshake::new(self.info_hash, self.peer_id).write_to(&mut stream)?;

        // Advertise the present set as of this moment
        let bitfield = Message::bitfield(self.manager.bitfield_payload());
        stream
            .write_all(&bitfield.serialize())
            .map_err(|e| ClientError::peer(format!("could not send bitfield: {}", e)))?;
        debug!("Sent bitfield to {}", addr);

        // Short read timeouts so shutdown is noticed while the peer idles
        stream
            .set_read_timeout(Some(POLL_TIMEOUT))
            .map_err(ClientError::FileSystem)?;

        let mut interested = false;
        let mut choked = true;
        let mut bad_requests = 0u32;

        loop {
            if self.shutdown.is_set() {
                return Ok(());
            }

            // Wait for traffic without committing to a full frame read
            let mut probe = [0u8; 1];
            match stream.peek(&mut probe) {
                Ok(0) => return Ok(()), // peer closed
                Ok(_) => {}
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => return Err(ClientError::FileSystem(e)),
            }

            let msg = message::read_message(&mut stream)?;
            match msg.id {
                message::MESSAGE_INTERESTED => {
                    debug!("Peer {} is interested", addr);
                    interested = true;
                    stream
                        .write_all(&Message::new(message::MESSAGE_UNCHOKE).serialize())
                        .map_err(|e| ClientError::peer(format!("could not unchoke: {}", e)))?;
                    choked = false;
                }
                message::MESSAGE_NOT_INTERESTED => {
                    debug!("Peer {} is no longer interested", addr);
                    interested = false;
                }
                message::MESSAGE_REQUEST => {
                    if interested && !choked {
                        if !self.serve_block(&mut stream, &msg, addr)? {
                            bad_requests += 1;
                            if bad_requests > MAX_BAD_REQUESTS {
                                return Err(ClientError::peer(format!(
                                    "{} keeps sending invalid requests",
                                    addr
                                )));
                            }
                        }
                    } else {
                        debug!("Ignoring request from choked or uninterested peer {}", addr);
                    }
                }
                message::MESSAGE_CANCEL => {
                    // Requests are served synchronously, nothing to revoke
                    let (index, _, _) = message::parse_request(&msg)?;
                    debug!("Peer {} cancelled request for piece {}", addr, index);
                }
                message::MESSAGE_KEEPALIVE => {}
                other => {
                    trace!("Ignoring message {} from {}", other, addr);
                }
            }
        }
    }

    /// Validate and answer one block request. Returns whether it was valid.
    fn serve_block(&self, stream: &mut TcpStream, msg: &Message, addr: SocketAddr) -> Result<bool> {
        let (index, begin, length) = message::parse_request(msg)?;

        if length == 0 || length > BLOCK_SIZE {
            warn!(
                "Peer {} requested {} bytes of piece {}, outside the block size",
                addr, length, index
            );
            return Ok(false);
        }
        if !self.manager.has_piece(index as usize) {
            warn!("Peer {} requested piece {} we do not have", addr, index);
            return Ok(false);
        }
        if u64::from(begin) + u64::from(length)
            > u64::from(self.store.piece_len(index as usize))
        {
            warn!(
                "Peer {} requested range {}+{} beyond piece {}",
                addr, begin, length, index
            );
            return Ok(false);
        }

        let block = match self.store.read_range(index as usize, begin, length) {
            Ok(block) => block,
            Err(e) => {
                // The piece is verified on disk; a read failure here is
                // local trouble, not the peer's fault
                error!("Could not read piece {} block for {}: {}", index, addr, e);
                self.events.seeding_error(&self.name, &e);
                return Ok(true);
            }
        };

        stream
            .write_all(&Message::piece(index, begin, &block).serialize())
            .map_err(|e| ClientError::peer(format!("could not send block: {}", e)))?;

        self.meter.add_uploaded(u64::from(length));
        self.events
            .piece_uploaded(index as usize, u64::from(length), addr);
        trace!(
            "Served piece {} [{}..{}] to {}",
            index,
            begin,
            begin + length,
            addr
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::tempdir;

    use crate::events::NullEvents;
    use crate::handshake::HANDSHAKE_LEN;
    use crate::message::{
        MESSAGE_BITFIELD, MESSAGE_INTERESTED, MESSAGE_PIECE, MESSAGE_UNCHOKE,
    };
    use crate::piece::{sha1, MAX_RETRIES};
    use crate::torrent::{FileEntry, Metainfo};

    fn complete_torrent(dir: &std::path::Path) -> (Metainfo, Vec<Vec<u8>>, Arc<PieceManager>, Arc<FileStore>) {
        let piece_length = 16384u64;
        let total = 20000u64;
        let pieces = vec![
            (0..16384u32).map(|i| (i % 199) as u8).collect::<Vec<u8>>(),
            (0..3616u32).map(|i| (i % 211) as u8).collect::<Vec<u8>>(),
        ];
        let meta = Metainfo {
            name: "s.bin".into(),
            info_hash: [0xCD; 20],
            piece_hashes: pieces.iter().map(|p| sha1(p)).collect(),
            piece_length,
            total_length: total,
            files: vec![FileEntry {
                path: PathBuf::from("s.bin"),
                length: total,
                offset: 0,
            }],
            multi_file: false,
            trackers: vec!["http://tracker.test/ann".into()],
        };

        let store = Arc::new(FileStore::allocate(&meta, dir).unwrap());
        store.write_piece(0, &pieces[0]).unwrap();
        store.write_piece(1, &pieces[1]).unwrap();

        let manager = Arc::new(PieceManager::with_retry_pacing(
            &meta,
            dir,
            MAX_RETRIES,
            Duration::ZERO,
        ));
        assert!(manager.initialize(&store, true).unwrap());

        (meta, pieces, manager, store)
    }

    fn spawn_seeder(
        manager: Arc<PieceManager>,
        store: Arc<FileStore>,
        info_hash: [u8; 20],
        max_uploads: usize,
        events: Arc<dyn ClientEvents>,
    ) -> (Arc<Seeder>, SocketAddr, Arc<Shutdown>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = Arc::new(Shutdown::new());

        let seeder = Seeder::new(
            listener,
            addr.port(),
            "s.bin".into(),
            info_hash,
            [0x55; 20],
            manager,
            store,
            Arc::new(TransferMeter::new(Duration::from_secs(2))),
            events,
            Arc::clone(&shutdown),
            max_uploads,
        );

        let runner = Arc::clone(&seeder);
        thread::spawn(move || runner.run());

        (seeder, addr, shutdown)
    }

    fn client_handshake(stream: &mut TcpStream, info_hash: [u8; 20]) {
        stream
            .write_all(&Handshake::new(info_hash, [0x66; 20]).serialize())
            .unwrap();
        let mut buf = [0u8; HANDSHAKE_LEN];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf[28..48], &info_hash);
    }

    #[test]
    fn serves_a_block_and_ignores_oversize_requests() {
        let dir = tempdir().unwrap();
        let (meta, pieces, manager, store) = complete_torrent(dir.path());
        let (_seeder, addr, shutdown) =
            spawn_seeder(manager, store, meta.info_hash, 4, Arc::new(NullEvents));

        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        client_handshake(&mut stream, meta.info_hash);

        // Bitfield snapshot: both pieces present
        let bitfield = message::read_message(&mut stream).unwrap();
        assert_eq!(bitfield.id, MESSAGE_BITFIELD);
        assert_eq!(bitfield.payload, vec![0b1100_0000]);

        // Interested -> unchoke
        stream
            .write_all(&Message::new(MESSAGE_INTERESTED).serialize())
            .unwrap();
        let unchoke = message::read_message(&mut stream).unwrap();
        assert_eq!(unchoke.id, MESSAGE_UNCHOKE);

        // A valid request gets the block from disk
        stream
            .write_all(&Message::request(0, 0, 16384).serialize())
            .unwrap();
        let reply = message::read_message(&mut stream).unwrap();
        assert_eq!(reply.id, MESSAGE_PIECE);
        let (index, begin, block) = message::parse_piece(&reply).unwrap();
        assert_eq!((index, begin), (0, 0));
        assert_eq!(block, &pieces[0][..]);

        // An over-size request is ignored, the connection stays usable
        stream
            .write_all(&Message::request(0, 0, 1_048_577).serialize())
            .unwrap();
        stream
            .write_all(&Message::request(1, 0, 3616).serialize())
            .unwrap();
        let reply = message::read_message(&mut stream).unwrap();
        let (index, _, block) = message::parse_piece(&reply).unwrap();
        assert_eq!(index, 1);
        assert_eq!(block, &pieces[1][..]);

        shutdown.trigger();
    }

    #[test]
    fn rejects_mismatched_info_hash() {
        let dir = tempdir().unwrap();
        let (_meta, _pieces, manager, store) = complete_torrent(dir.path());
        let (_seeder, addr, shutdown) =
            spawn_seeder(manager, store, [0xCD; 20], 4, Arc::new(NullEvents));

        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
            .write_all(&Handshake::new([0x01; 20], [0x66; 20]).serialize())
            .unwrap();

        // The seeder drops us without answering
        let mut buf = [0u8; 1];
        assert_eq!(stream.read(&mut buf).unwrap_or(0), 0);

        shutdown.trigger();
    }

    #[test]
    fn connections_over_the_cap_are_closed() {
        let dir = tempdir().unwrap();
        let (meta, _pieces, manager, store) = complete_torrent(dir.path());
        let (seeder, addr, shutdown) =
            spawn_seeder(manager, store, meta.info_hash, 1, Arc::new(NullEvents));

        let mut first = TcpStream::connect(addr).unwrap();
        first
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        client_handshake(&mut first, meta.info_hash);
        let _bitfield = message::read_message(&mut first).unwrap();
        assert_eq!(seeder.active_peers(), 1);

        // The second connection is closed right after accept
        let mut second = TcpStream::connect(addr).unwrap();
        second
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(second.read(&mut buf).unwrap_or(0), 0);

        shutdown.trigger();
    }

    #[derive(Default)]
    struct RecordingSeedingErrors {
        errors: Mutex<Vec<String>>,
    }

    impl ClientEvents for RecordingSeedingErrors {
        fn seeding_error(&self, name: &str, error: &ClientError) {
            self.errors
                .lock()
                .unwrap()
                .push(format!("{}: {}", name, error));
        }
    }

    #[test]
    fn disk_read_failure_is_reported_as_seeding_error() {
        let dir = tempdir().unwrap();
        let (meta, _pieces, manager, store) = complete_torrent(dir.path());

        // Truncate the content behind the store's back so block reads fail
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(dir.path().join("s.bin"))
            .unwrap();
        file.set_len(0).unwrap();

        let events = Arc::new(RecordingSeedingErrors::default());
        let (_seeder, addr, shutdown) = spawn_seeder(
            manager,
            store,
            meta.info_hash,
            4,
            Arc::<RecordingSeedingErrors>::clone(&events) as Arc<dyn ClientEvents>,
        );

        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        client_handshake(&mut stream, meta.info_hash);
        let _bitfield = message::read_message(&mut stream).unwrap();

        stream
            .write_all(&Message::new(MESSAGE_INTERESTED).serialize())
            .unwrap();
        let unchoke = message::read_message(&mut stream).unwrap();
        assert_eq!(unchoke.id, MESSAGE_UNCHOKE);

        stream
            .write_all(&Message::request(0, 0, 16384).serialize())
            .unwrap();

        // The block is dropped, but the failure surfaces through the observer
        for _ in 0..100 {
            if !events.errors.lock().unwrap().is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(50));
        }
        let errors = events.errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("s.bin:"));

        shutdown.trigger();
    }
}
