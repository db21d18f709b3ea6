//! # Observability Callbacks
//!
//! The engine reports progress through this observer trait instead of
//! rendering anything itself. The binary installs a console implementation;
//! tests can install a recording one. Every method has an empty default so
//! implementations subscribe only to what they care about.

use std::net::SocketAddr;

use crate::error::ClientError;

/// Periodic statistics snapshot while seeding.
#[derive(Debug, Clone, Copy, Default)]
pub struct SeedingSnapshot {
    /// Total bytes uploaded this session
    pub uploaded: u64,
    /// Total bytes downloaded this session
    pub downloaded: u64,
    /// Current upload rate in bytes per second
    pub upload_rate: u64,
    /// Current download rate in bytes per second
    pub download_rate: u64,
    /// Connected inbound peers
    pub active_peers: usize,
}

/// Callbacks the engine invokes on torrent lifecycle events.
#[allow(unused_variables)]
pub trait ClientEvents: Send + Sync {
    fn download_started(&self, name: &str, total_bytes: u64) {}

    fn piece_completed(&self, index: usize, completed: usize, total_pieces: usize) {}

    fn download_completed(&self, name: &str, total_bytes: u64) {}

    fn download_failed(&self, name: &str, error: &ClientError) {}

    /// Periodic progress: percentage of pieces present and download rate.
    fn progress(&self, percent: f64, download_rate: u64) {}

    fn seeding_started(&self, name: &str, total_bytes: u64) {}

    fn peer_connected(&self, addr: SocketAddr) {}

    fn peer_disconnected(&self, addr: SocketAddr) {}

    fn piece_uploaded(&self, index: usize, bytes: u64, addr: SocketAddr) {}

    fn seeding_progress(&self, name: &str, stats: &SeedingSnapshot) {}

    fn seeding_stopped(&self, name: &str, total_uploaded: u64) {}

    fn seeding_error(&self, name: &str, error: &ClientError) {}
}

/// An observer that ignores everything; useful as a test default.
#[allow(dead_code)]
pub struct NullEvents;

impl ClientEvents for NullEvents {}
