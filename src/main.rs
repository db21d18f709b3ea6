//! # Remora BitTorrent Client
//!
//! A command-line BitTorrent client written in Rust.
//!
//! ## Features
//!
//! - Unified downloading and seeding with a single piece state
//! - Verification of existing files and resume across restarts
//! - HTTP and UDP tracker support with periodic announces
//! - Multi-file torrents
//! - Piece verification with SHA-1 hashing
//! - Progress tracking with a visual progress bar
//!
//! ## Usage
//!
//! ```bash
//! remora <torrent_file>...
//! remora -d <download_dir> a.torrent b.torrent
//! remora --port 7000 --max-downloads 32 --max-uploads 5 a.torrent
//! ```
//!
//! ## Architecture
//!
//! The client follows a multi-threaded architecture:
//!
//! - **Main thread**: Parses arguments, then waits on one session per torrent
//! - **Session threads**: Each drives one torrent end to end
//! - **Worker threads**: Each handles one peer connection
//! - **Timer threads**: Announcers and the transfer rate sampler

#[macro_use]
extern crate log;

mod announcer;
mod client;
mod error;
mod events;
mod handshake;
mod manager;
mod message;
mod meter;
mod piece;
mod seeder;
mod session;
mod shutdown;
mod storage;
mod torrent;
mod tracker;
mod tracker_http;
mod tracker_udp;
mod worker;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};

use crate::error::ClientError;
use crate::events::{ClientEvents, SeedingSnapshot};
use crate::session::{SessionConfig, TorrentSession};
use crate::shutdown::Shutdown;
use crate::torrent::Metainfo;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "A BitTorrent client that verifies, downloads, and seeds torrents."
)]
struct Args {
    /// Paths to the .torrent files to process
    #[arg(required = true)]
    torrents: Vec<String>,

    /// Directory to download files into
    #[arg(short = 'd', long = "download-dir")]
    download_dir: Option<PathBuf>,

    /// Base listening port; the nth torrent probes ports from base+n
    #[arg(short = 'p', long, default_value_t = 6881)]
    port: u16,

    /// Maximum concurrent download connections per torrent
    #[arg(long, default_value_t = 48)]
    max_downloads: usize,

    /// Maximum concurrent upload connections per torrent
    #[arg(long, default_value_t = 10)]
    max_uploads: usize,

    /// Tracker announce interval in minutes
    #[arg(long, default_value_t = 1)]
    announce_interval: u64,

    /// Enable verbose logging output
    #[arg(short, long)]
    verbose: bool,
}

/// Reject configurations the engine should never see.
fn validate_args(args: &Args) -> Result<()> {
    if args.port < 1024 {
        return Err(anyhow!("port must be between 1024 and 65535"));
    }
    if args.max_downloads == 0 || args.max_downloads > 200 {
        return Err(anyhow!("max downloads must be between 1 and 200"));
    }
    if args.max_uploads == 0 || args.max_uploads > 50 {
        return Err(anyhow!("max uploads must be between 1 and 50"));
    }
    if args.announce_interval == 0 || args.announce_interval > 1440 {
        return Err(anyhow!("announce interval must be between 1 and 1440 minutes"));
    }

    for path in &args.torrents {
        if !Path::new(path).is_file() {
            return Err(anyhow!("could not find torrent file: {}", path));
        }
        if !path.to_lowercase().ends_with(".torrent") {
            warn!("File does not have a .torrent extension: {}", path);
        }
    }

    Ok(())
}

/// Default download directory under the user's home.
fn default_download_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join("Downloads").join("remora"),
        None => PathBuf::from("downloads"),
    }
}

/// Human-readable byte counts for console output.
fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[unit])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Console renderer for the engine's callbacks.
struct ConsoleEvents {
    bar: Mutex<Option<ProgressBar>>,
}

impl ConsoleEvents {
    fn new() -> ConsoleEvents {
        ConsoleEvents {
            bar: Mutex::new(None),
        }
    }
}

impl ClientEvents for ConsoleEvents {
    fn download_started(&self, name: &str, total_bytes: u64) {
        println!("Downloading {:?} ({})", name, format_bytes(total_bytes));

        let bar = ProgressBar::new(100);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}% {msg}")
                .unwrap()
                .progress_chars("#>-"),
        );
        *self.bar.lock().unwrap() = Some(bar);
    }

    fn progress(&self, percent: f64, download_rate: u64) {
        if let Some(bar) = self.bar.lock().unwrap().as_ref() {
            bar.set_position(percent as u64);
            bar.set_message(format!("{}/s", format_bytes(download_rate)));
        }
    }

    fn download_completed(&self, name: &str, total_bytes: u64) {
        if let Some(bar) = self.bar.lock().unwrap().take() {
            bar.finish_and_clear();
        }
        println!("Download of {:?} complete ({})", name, format_bytes(total_bytes));
    }

    fn download_failed(&self, name: &str, error: &ClientError) {
        if let Some(bar) = self.bar.lock().unwrap().take() {
            bar.abandon();
        }
        eprintln!("Download of {:?} failed: {}", name, error);
    }

    fn seeding_started(&self, name: &str, _total_bytes: u64) {
        println!("Seeding {:?} (press Ctrl-C to stop)", name);
    }

    fn peer_connected(&self, addr: SocketAddr) {
        println!("Peer connected: {}", addr);
    }

    fn peer_disconnected(&self, addr: SocketAddr) {
        println!("Peer disconnected: {}", addr);
    }

    fn seeding_progress(&self, name: &str, stats: &SeedingSnapshot) {
        if stats.active_peers > 0 || stats.upload_rate > 0 || stats.download_rate > 0 {
            println!(
                "Seeding {:?}: {} up ({}/s), {} down, {} peer(s)",
                name,
                format_bytes(stats.uploaded),
                format_bytes(stats.upload_rate),
                format_bytes(stats.downloaded),
                stats.active_peers
            );
        }
    }

    fn seeding_stopped(&self, name: &str, total_uploaded: u64) {
        println!(
            "Stopped seeding {:?} ({} uploaded this session)",
            name,
            format_bytes(total_uploaded)
        );
    }

    fn seeding_error(&self, name: &str, error: &ClientError) {
        eprintln!("Seeding error on {:?}: {}", name, error);
    }
}

fn run(args: Args) -> Result<()> {
    let config = SessionConfig {
        download_dir: args
            .download_dir
            .clone()
            .unwrap_or_else(default_download_dir),
        base_listen_port: args.port,
        max_downloads: args.max_downloads,
        max_uploads: args.max_uploads,
        announce_interval: Duration::from_secs(args.announce_interval * 60),
    };

    // One shared latch; Ctrl-C stops every torrent cooperatively
    let shutdown = Arc::new(Shutdown::new());
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            println!("\nShutting down...");
            shutdown.trigger();
        })
        .context("could not install the signal handler")?;
    }

    // A bad metainfo aborts only its own torrent
    let mut failed = 0usize;
    let mut sessions = Vec::new();
    for (index, path) in args.torrents.iter().enumerate() {
        let meta = match Metainfo::open(Path::new(path)) {
            Ok(meta) => meta,
            Err(e) => {
                error!("Could not load torrent {}: {}", path, e);
                failed += 1;
                continue;
            }
        };

        let events: Arc<dyn ClientEvents> = Arc::new(ConsoleEvents::new());
        let session = TorrentSession::new(
            meta,
            index,
            config.clone(),
            events,
            Arc::clone(&shutdown),
        );
        sessions.push((path.clone(), thread::spawn(move || session.run())));
    }

    for (path, handle) in sessions {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("Torrent {} failed: {}", path, e);
                failed += 1;
            }
            Err(_) => {
                error!("Session thread for {} panicked", path);
                failed += 1;
            }
        }
    }

    if failed > 0 {
        return Err(anyhow!("{} torrent(s) failed", failed));
    }
    Ok(())
}

fn main() {
    // Parse arguments
    let args = Args::parse();

    // Initialize logger
    if args.verbose && std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "debug");
    }
    pretty_env_logger::init_timed();

    // Validate and run, eventually exit failure
    if let Err(error) = validate_args(&args).and_then(|_| run(args)) {
        eprintln!("Error: {:#}", error);
        std::process::exit(1);
    }

    std::process::exit(0);
}
