//! # Announce Scheduling
//!
//! Periodic tracker announcements for one torrent. Two announcers coexist:
//! the *download* announcer runs while pieces are still missing (it asks for
//! many peers and feeds the peer directory), and the *seeding* announcer
//! runs from the first present piece until shutdown. Both fire an immediate
//! `started` on start, a plain announce every interval tick, `completed`
//! when asked, and `stopped` when stopped with notification.
//!
//! Every announce iterates all configured trackers in list order; a failure
//! on one tracker never skips the remaining ones. Transfer totals come from
//! the transfer meter, and the `left` field from the piece manager, at the
//! moment of the announce.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::manager::PieceManager;
use crate::meter::TransferMeter;
use crate::shutdown::Shutdown;
use crate::tracker::{self, AnnounceEvent, AnnounceRequest, PeerDirectory};

/// Periodic announcer for one torrent and one role (download or seeding).
pub struct Announcer {
    /// Role tag used in logs ("download" or "seeding")
    label: &'static str,
    trackers: Vec<String>,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    listen_port: u16,
    num_want: u32,
    interval: Duration,
    manager: Arc<PieceManager>,
    meter: Arc<TransferMeter>,
    peers: Arc<PeerDirectory>,
    running: AtomicBool,
    stop: Arc<Shutdown>,
    ticker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Announcer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        label: &'static str,
        trackers: Vec<String>,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        listen_port: u16,
        num_want: u32,
        interval: Duration,
        manager: Arc<PieceManager>,
        meter: Arc<TransferMeter>,
        peers: Arc<PeerDirectory>,
    ) -> Arc<Announcer> {
        Arc::new(Announcer {
            label,
            trackers,
            info_hash,
            peer_id,
            listen_port,
            num_want,
            interval,
            manager,
            meter,
            peers,
            running: AtomicBool::new(false),
            stop: Arc::new(Shutdown::new()),
            ticker: Mutex::new(None),
        })
    }

    /// Fire the immediate `started` announce and begin periodic ticking.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("{} announcer already running", self.label);
            return;
        }

        info!(
            "Starting {} announcements every {:?} across {} tracker(s)",
            self.label,
            self.interval,
            self.trackers.len()
        );

        self.announce_all(AnnounceEvent::Started);

        let announcer = Arc::clone(self);
        let mut ticker = self.ticker.lock().unwrap();
        *ticker = Some(thread::spawn(move || {
            while !announcer.stop.wait_timeout(announcer.interval) {
                announcer.announce_all(AnnounceEvent::None);
            }
        }));
    }

    /// Whether the announcer has been started and not yet stopped.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Tell every tracker the download finished.
    pub fn announce_completed(&self) {
        if self.is_running() {
            info!("Announcing completion via {} announcer", self.label);
            self.announce_all(AnnounceEvent::Completed);
        }
    }

    /// Stop ticking. When `announce_stopped` is set, tell the trackers too
    /// (best effort, bounded by the per-transport timeouts).
    pub fn stop(&self, announce_stopped: bool) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        self.stop.trigger();
        if let Some(handle) = self.ticker.lock().unwrap().take() {
            let _ = handle.join();
        }

        if announce_stopped {
            self.announce_all(AnnounceEvent::Stopped);
        }

        info!("{} announcements stopped", self.label);
    }

    /// Announce to every configured tracker in list order.
    fn announce_all(&self, event: AnnounceEvent) {
        let request = AnnounceRequest {
            info_hash: self.info_hash,
            peer_id: self.peer_id,
            port: self.listen_port,
            uploaded: self.meter.total_uploaded(),
            downloaded: self.meter.total_downloaded(),
            left: self.manager.bytes_left(),
            num_want: self.num_want,
        };

        for url in &self.trackers {
            match tracker::announce(url, &request, event) {
                Ok(response) => {
                    debug!(
                        "Announced to {} ({:?}): interval {:?}s (min {:?}s), \
                         {:?} seeder(s)/{:?} leecher(s), {} peer(s)",
                        url,
                        event,
                        response.interval,
                        response.min_interval,
                        response.seeders,
                        response.leechers,
                        response.peers.len()
                    );
                    let added = self.peers.merge(&response.peers);
                    if added > 0 {
                        info!("Discovered {} new peer(s) from {}", added, url);
                    }
                }
                Err(e) => {
                    warn!("Failed to announce to {} for {}: {}", url, self.label, e);
                }
            }
        }
    }
}
