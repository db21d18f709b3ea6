//! # Torrent Session
//!
//! Per-torrent orchestration: allocate files, verify what is already on
//! disk, discover peers, download the missing pieces, and seed everything
//! present until shutdown. Downloading and seeding share one piece manager,
//! so every completed piece becomes servable the moment it is marked.
//!
//! ## Thread Layout
//!
//! - W download workers (one peer connection each)
//! - the seeding listener plus one thread per inbound peer
//! - the download and seeding announcers' timer threads
//! - the transfer meter's sampling thread
//! - this thread, monitoring piece completions
//!
//! ## Shutdown
//!
//! The session owns a local latch bridged from the process-wide one, so a
//! fatal error in one torrent tears down that torrent only. Teardown stops
//! workers and the listener, sends the final `stopped` announces, flushes
//! the resume bitmap, and reports `seeding stopped`.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;

use crate::announcer::Announcer;
use crate::error::{ClientError, Result};
use crate::events::{ClientEvents, SeedingSnapshot};
use crate::manager::PieceManager;
use crate::meter::{TransferMeter, SAMPLE_INTERVAL};
use crate::seeder::{self, Seeder};
use crate::shutdown::Shutdown;
use crate::storage::{self, FileStore};
use crate::torrent::Metainfo;
use crate::tracker::{self, PeerDirectory, NUM_WANT_DOWNLOADING, NUM_WANT_SEEDING};
use crate::worker::DownloadWorker;

// Cadence of the seeding statistics callback
const SEEDING_HEARTBEAT: Duration = Duration::from_secs(5);

// Cadence of progress callbacks while downloading
const MONITOR_TICK: Duration = Duration::from_millis(500);

/// Engine configuration consumed by every torrent session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Root directory for all produced files
    pub download_dir: PathBuf,
    /// The first torrent listens here; torrent n probes from base + n
    pub base_listen_port: u16,
    /// Download worker pool size per torrent
    pub max_downloads: usize,
    /// Concurrent inbound upload connections per torrent
    pub max_uploads: usize,
    /// Re-announce period
    pub announce_interval: Duration,
}

/// One torrent's full lifecycle.
pub struct TorrentSession {
    meta: Metainfo,
    torrent_index: usize,
    config: SessionConfig,
    events: Arc<dyn ClientEvents>,
    shutdown: Arc<Shutdown>,
}

impl TorrentSession {
    pub fn new(
        meta: Metainfo,
        torrent_index: usize,
        config: SessionConfig,
        events: Arc<dyn ClientEvents>,
        shutdown: Arc<Shutdown>,
    ) -> TorrentSession {
        TorrentSession {
            meta,
            torrent_index,
            config,
            events,
            shutdown,
        }
    }

    /// Drive the torrent to completion and seed until shutdown.
    pub fn run(&self) -> Result<()> {
        let result = self.run_inner();
        if let Err(e) = &result {
            if !matches!(e, ClientError::Shutdown) {
                self.events.download_failed(&self.meta.name, e);
            }
        }
        result
    }

    fn run_inner(&self) -> Result<()> {
        let meta = &self.meta;
        info!(
            "Processing torrent {:?}: {} piece(s), {} byte(s), {} tracker(s)",
            meta.name,
            meta.num_pieces(),
            meta.total_length,
            meta.trackers.len()
        );

        fs::create_dir_all(&self.config.download_dir)?;
        let peer_id = tracker::generate_peer_id();

        // Existence must be checked before allocation extends the files
        let had_all_files = storage::files_at_declared_lengths(meta, &self.config.download_dir);
        let store = Arc::new(FileStore::allocate(meta, &self.config.download_dir)?);
        let manager = Arc::new(PieceManager::new(meta, &self.config.download_dir));
        let complete_at_start = manager.initialize(&store, had_all_files)?;

        let meter = Arc::new(TransferMeter::new(SAMPLE_INTERVAL));
        meter.start();

        let (listener, listen_port) =
            seeder::bind_listener(self.config.base_listen_port, self.torrent_index)?;

        // A per-torrent latch so a fatal error here cannot stop siblings;
        // the bridge thread forwards the process-wide trigger into it.
        let local_shutdown = Arc::new(Shutdown::new());
        let bridge = {
            let global = Arc::clone(&self.shutdown);
            let local = Arc::clone(&local_shutdown);
            thread::spawn(move || loop {
                if global.wait_timeout(MONITOR_TICK) {
                    local.trigger();
                    break;
                }
                if local.is_set() {
                    break;
                }
            })
        };

        let peers = Arc::new(PeerDirectory::new());

        let download_announcer = Announcer::new(
            "download",
            meta.trackers.clone(),
            meta.info_hash,
            peer_id,
            listen_port,
            NUM_WANT_DOWNLOADING,
            self.config.announce_interval,
            Arc::clone(&manager),
            Arc::clone(&meter),
            Arc::clone(&peers),
        );
        let seeding_announcer = Announcer::new(
            "seeding",
            meta.trackers.clone(),
            meta.info_hash,
            peer_id,
            listen_port,
            NUM_WANT_SEEDING,
            self.config.announce_interval,
            Arc::clone(&manager),
            Arc::clone(&meter),
            Arc::clone(&peers),
        );

        let seeder = Seeder::new(
            listener,
            listen_port,
            meta.name.clone(),
            meta.info_hash,
            peer_id,
            Arc::clone(&manager),
            Arc::clone(&store),
            Arc::clone(&meter),
            Arc::clone(&self.events),
            Arc::clone(&local_shutdown),
            self.config.max_uploads,
        );
        let seeder_handle = {
            let seeder = Arc::clone(&seeder);
            thread::spawn(move || seeder.run())
        };

        // Seeding starts with the first present piece
        let seeding_started = AtomicBool::new(false);
        let maybe_start_seeding = || {
            if manager.completed_count() > 0
                && seeding_started
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            {
                info!(
                    "Seeding {:?}: {} piece(s) available",
                    meta.name,
                    manager.completed_count()
                );
                seeding_announcer.start();
                self.events.seeding_started(&meta.name, meta.total_length);
            }
        };

        if complete_at_start {
            info!("All pieces of {:?} already on disk", meta.name);
            self.events
                .download_completed(&meta.name, meta.total_length);
        } else {
            self.events.download_started(&meta.name, meta.total_length);
            download_announcer.start();
        }
        maybe_start_seeding();

        // Download phase
        let download_result: Result<bool> = if complete_at_start {
            Ok(true)
        } else {
            self.download_phase(
                &manager,
                &store,
                &meter,
                &peers,
                peer_id,
                &local_shutdown,
                &maybe_start_seeding,
            )
        };

        match &download_result {
            Ok(true) => {
                if !complete_at_start {
                    info!("Download of {:?} completed", meta.name);
                    self.events
                        .download_completed(&meta.name, meta.total_length);
                    // The seeding announcer takes over from here
                    download_announcer.stop(false);
                    seeding_announcer.announce_completed();
                }

                // Seed until told to stop
                while !local_shutdown.wait_timeout(SEEDING_HEARTBEAT) {
                    let snapshot = SeedingSnapshot {
                        uploaded: meter.total_uploaded(),
                        downloaded: meter.total_downloaded(),
                        upload_rate: meter.upload_rate(),
                        download_rate: meter.download_rate(),
                        active_peers: seeder.active_peers(),
                    };
                    self.events.seeding_progress(&meta.name, &snapshot);
                }
            }
            Ok(false) => {
                info!("Shutdown requested while downloading {:?}", meta.name);
                download_announcer.stop(true);
            }
            Err(e) => {
                error!("Torrent {:?} failed: {}", meta.name, e);
                download_announcer.stop(true);
            }
        }

        // Teardown, common to every exit path
        local_shutdown.trigger();
        let _ = seeder_handle.join();
        seeding_announcer.stop(true);
        meter.stop();
        manager.shutdown();
        let _ = bridge.join();

        if seeding_started.load(Ordering::SeqCst) {
            self.events
                .seeding_stopped(&meta.name, meter.total_uploaded());
        }
        info!("Torrent session for {:?} finished", meta.name);

        download_result.map(|_| ())
    }

    /// Spawn the worker pool and monitor completions until the torrent is
    /// complete (`Ok(true)`), shut down (`Ok(false)`), or failed.
    #[allow(clippy::too_many_arguments)]
    fn download_phase(
        &self,
        manager: &Arc<PieceManager>,
        store: &Arc<FileStore>,
        meter: &Arc<TransferMeter>,
        peers: &Arc<PeerDirectory>,
        peer_id: [u8; 20],
        local_shutdown: &Arc<Shutdown>,
        maybe_start_seeding: &dyn Fn(),
    ) -> Result<bool> {
        let (completions_tx, completions_rx) = crossbeam_channel::unbounded();

        let mut workers = Vec::with_capacity(self.config.max_downloads);
        for worker_id in 0..self.config.max_downloads {
            let worker = DownloadWorker::new(
                worker_id,
                self.meta.info_hash,
                peer_id,
                Arc::clone(peers),
                Arc::clone(manager),
                Arc::clone(store),
                Arc::clone(meter),
                completions_tx.clone(),
                Arc::clone(local_shutdown),
            );
            workers.push(thread::spawn(move || worker.run()));
        }
        drop(completions_tx);
        info!("Started {} download worker(s)", workers.len());

        let num_pieces = self.meta.num_pieces();
        let result = loop {
            if local_shutdown.is_set() {
                break Ok(false);
            }
            if let Some(e) = manager.failure() {
                break Err(e);
            }
            if manager.is_complete() {
                break Ok(true);
            }

            match completions_rx.recv_timeout(MONITOR_TICK) {
                Ok(completion) => {
                    let completed = manager.completed_count();
                    self.events
                        .piece_completed(completion.index, completed, num_pieces);
                    self.events.progress(
                        completed as f64 * 100.0 / num_pieces as f64,
                        meter.download_rate(),
                    );
                    maybe_start_seeding();
                }
                Err(RecvTimeoutError::Timeout) => {
                    self.events.progress(
                        manager.completed_count() as f64 * 100.0 / num_pieces as f64,
                        meter.download_rate(),
                    );
                }
                Err(RecvTimeoutError::Disconnected) => {
                    // Every worker has exited; settle on why
                    break if manager.is_complete() {
                        Ok(true)
                    } else if let Some(e) = manager.failure() {
                        Err(e)
                    } else if local_shutdown.is_set() {
                        Ok(false)
                    } else {
                        Err(ClientError::peer("download workers exited unexpectedly"))
                    };
                }
            }
        };

        // Workers observe completion, shutdown, or the latched failure
        if result.is_err() || matches!(result, Ok(false)) {
            local_shutdown.trigger();
        }
        for worker in workers {
            let _ = worker.join();
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::Mutex;
    use tempfile::tempdir;

    use crate::piece::sha1;
    use crate::torrent::FileEntry;

    #[derive(Default)]
    struct RecordingEvents {
        log: Mutex<Vec<String>>,
    }

    impl RecordingEvents {
        fn contains(&self, entry: &str) -> bool {
            self.log.lock().unwrap().iter().any(|e| e == entry)
        }
    }

    impl ClientEvents for RecordingEvents {
        fn download_started(&self, _name: &str, _total: u64) {
            self.log.lock().unwrap().push("download_started".into());
        }
        fn download_completed(&self, _name: &str, _total: u64) {
            self.log.lock().unwrap().push("download_completed".into());
        }
        fn download_failed(&self, _name: &str, _error: &ClientError) {
            self.log.lock().unwrap().push("download_failed".into());
        }
        fn seeding_started(&self, _name: &str, _total: u64) {
            self.log.lock().unwrap().push("seeding_started".into());
        }
        fn seeding_stopped(&self, _name: &str, _uploaded: u64) {
            self.log.lock().unwrap().push("seeding_stopped".into());
        }
        fn peer_connected(&self, _addr: SocketAddr) {
            self.log.lock().unwrap().push("peer_connected".into());
        }
    }

    // A one-piece torrent whose content is already on disk.
    fn seeded_torrent(dir: &std::path::Path) -> Metainfo {
        let content: Vec<u8> = (0..5000u32).map(|i| (i % 163) as u8).collect();
        std::fs::write(dir.join("done.bin"), &content).unwrap();
        Metainfo {
            name: "done.bin".into(),
            info_hash: [0x42; 20],
            piece_hashes: vec![sha1(&content)],
            piece_length: 16384,
            total_length: 5000,
            files: vec![FileEntry {
                path: PathBuf::from("done.bin"),
                length: 5000,
                offset: 0,
            }],
            multi_file: false,
            // Unreachable tracker: announce failures must not stop the session
            trackers: vec!["http://127.0.0.1:1/announce".into()],
        }
    }

    #[test]
    fn complete_content_goes_straight_to_seeding() {
        let dir = tempdir().unwrap();
        let meta = seeded_torrent(dir.path());

        let events = Arc::new(RecordingEvents::default());
        let shutdown = Arc::new(Shutdown::new());
        let config = SessionConfig {
            download_dir: dir.path().to_path_buf(),
            base_listen_port: 58620,
            max_downloads: 2,
            max_uploads: 2,
            announce_interval: Duration::from_secs(60),
        };

        let session = TorrentSession::new(
            meta,
            0,
            config,
            Arc::<RecordingEvents>::clone(&events) as Arc<dyn ClientEvents>,
            Arc::clone(&shutdown),
        );

        let runner = thread::spawn(move || session.run());

        // Give the session a moment to reach the seeding phase, then stop
        thread::sleep(Duration::from_millis(600));
        shutdown.trigger();
        runner.join().unwrap().unwrap();

        assert!(events.contains("download_completed"));
        assert!(events.contains("seeding_started"));
        assert!(events.contains("seeding_stopped"));
        assert!(!events.contains("download_started"));
        assert!(!events.contains("download_failed"));
    }
}
