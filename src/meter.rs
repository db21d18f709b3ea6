//! # Transfer Meter
//!
//! Cumulative upload/download byte counters for the session plus a sampling
//! thread that turns their deltas into current rates (bytes per second).
//! The meter is the single authority for transfer statistics: workers and
//! the seeder feed it, while the announcers and progress reporting read it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::shutdown::Shutdown;

// Default sampling interval for rate calculation
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Default)]
struct Counters {
    uploaded: AtomicU64,
    downloaded: AtomicU64,
    upload_rate: AtomicU64,
    download_rate: AtomicU64,
}

/// Rolling transfer statistics for one torrent session.
pub struct TransferMeter {
    counters: Arc<Counters>,
    interval: Duration,
    stop: Arc<Shutdown>,
    sampler: Mutex<Option<thread::JoinHandle<()>>>,
}

impl TransferMeter {
    pub fn new(interval: Duration) -> TransferMeter {
        TransferMeter {
            counters: Arc::new(Counters::default()),
            interval,
            stop: Arc::new(Shutdown::new()),
            sampler: Mutex::new(None),
        }
    }

    /// Start the sampling thread. A second call is a no-op.
    pub fn start(&self) {
        let mut sampler = self.sampler.lock().unwrap();
        if sampler.is_some() {
            return;
        }

        let counters = Arc::clone(&self.counters);
        let stop = Arc::clone(&self.stop);
        let interval = self.interval;

        *sampler = Some(thread::spawn(move || {
            let mut last_at = Instant::now();
            let mut last_uploaded = counters.uploaded.load(Ordering::Relaxed);
            let mut last_downloaded = counters.downloaded.load(Ordering::Relaxed);

            while !stop.wait_timeout(interval) {
                let now = Instant::now();
                let elapsed_ms = now.duration_since(last_at).as_millis() as u64;
                if elapsed_ms == 0 {
                    continue;
                }

                let uploaded = counters.uploaded.load(Ordering::Relaxed);
                let downloaded = counters.downloaded.load(Ordering::Relaxed);

                let upload_rate = (uploaded - last_uploaded) * 1000 / elapsed_ms;
                let download_rate = (downloaded - last_downloaded) * 1000 / elapsed_ms;
                counters.upload_rate.store(upload_rate, Ordering::Relaxed);
                counters
                    .download_rate
                    .store(download_rate, Ordering::Relaxed);

                if upload_rate > 0 || download_rate > 0 {
                    trace!(
                        "Transfer rates: up {} B/s, down {} B/s",
                        upload_rate,
                        download_rate
                    );
                }

                last_at = now;
                last_uploaded = uploaded;
                last_downloaded = downloaded;
            }
        }));
    }

    /// Stop the sampling thread and wait for it.
    pub fn stop(&self) {
        self.stop.trigger();
        if let Some(handle) = self.sampler.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    pub fn add_uploaded(&self, bytes: u64) {
        self.counters.uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_downloaded(&self, bytes: u64) {
        self.counters.downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn total_uploaded(&self) -> u64 {
        self.counters.uploaded.load(Ordering::Relaxed)
    }

    pub fn total_downloaded(&self) -> u64 {
        self.counters.downloaded.load(Ordering::Relaxed)
    }

    /// Current upload rate in bytes per second.
    pub fn upload_rate(&self) -> u64 {
        self.counters.upload_rate.load(Ordering::Relaxed)
    }

    /// Current download rate in bytes per second.
    pub fn download_rate(&self) -> u64 {
        self.counters.download_rate.load(Ordering::Relaxed)
    }

    /// Zero every counter and rate. Idempotent.
    #[allow(dead_code)]
    pub fn reset(&self) {
        self.counters.uploaded.store(0, Ordering::Relaxed);
        self.counters.downloaded.store(0, Ordering::Relaxed);
        self.counters.upload_rate.store(0, Ordering::Relaxed);
        self.counters.download_rate.store(0, Ordering::Relaxed);
    }
}

impl Drop for TransferMeter {
    fn drop(&mut self) {
        self.stop();
    }
}
