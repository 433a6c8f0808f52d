//! Aggregated statistics published by the scheduler.
//!
//! Observers never reach into the scheduler; they receive serializable
//! snapshots through a [`TelemetrySink`].

use serde::Serialize;
use tokio::sync::mpsc;

use crate::peer::ConnectionState;
use crate::torrent::SessionState;
use crate::tracker::EndpointStatus;

/// One tracker endpoint as seen at snapshot time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackerSnapshot {
    pub url: String,
    pub status: EndpointStatus,
    pub seeders: u32,
    pub leechers: u32,
    pub peer_count: u32,
    pub completed: Option<u32>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    /// Seconds until the next regular announce
    pub next_announce_in: u64,
}

/// One peer connection as seen at snapshot time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerSnapshot {
    pub address: String,
    pub inbound: bool,
    pub state: ConnectionState,
    pub uploaded: u64,
    pub downloaded: u64,
}

/// Per-torrent statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TorrentSnapshot {
    pub info_hash: String,
    pub name: String,
    pub state: SessionState,
    pub profile: String,
    /// Bytes uploaded since the session was added
    pub uploaded: u64,
    pub downloaded: u64,
    /// Including the resumed totals
    pub total_uploaded: u64,
    pub total_downloaded: u64,
    /// Reported speeds in bytes per second
    pub upload_speed: u64,
    pub download_speed: u64,
    pub left: u64,
    pub connections: usize,
    pub queued_candidates: usize,
    pub trackers: Vec<TrackerSnapshot>,
    pub peers: Vec<PeerSnapshot>,
    pub error: Option<String>,
}

/// Everything published on one stats tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    /// Milliseconds since the UNIX epoch
    pub timestamp_ms: u64,
    pub torrents: Vec<TorrentSnapshot>,
    pub total_connections: usize,
    pub upload_speed: u64,
    pub download_speed: u64,
}

impl TelemetrySnapshot {
    pub fn total_uploaded(&self) -> u64 {
        self.torrents.iter().map(|t| t.uploaded).sum()
    }

    pub fn torrent(&self, info_hash: &str) -> Option<&TorrentSnapshot> {
        self.torrents.iter().find(|t| t.info_hash == info_hash)
    }
}

/// Destination for periodic snapshots.
pub trait TelemetrySink: Send + Sync {
    fn publish(&self, snapshot: &TelemetrySnapshot);
}

/// Forwards snapshots over an unbounded channel.
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<TelemetrySnapshot>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TelemetrySnapshot>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl TelemetrySink for ChannelSink {
    fn publish(&self, snapshot: &TelemetrySnapshot) {
        // Receiver gone means nobody is watching
        let _ = self.sender.send(snapshot.clone());
    }
}

/// Logs a one-line summary per torrent and the full snapshot at debug level.
#[derive(Debug, Default)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn publish(&self, snapshot: &TelemetrySnapshot) {
        for torrent in &snapshot.torrents {
            tracing::info!(
                info_hash = %torrent.info_hash,
                "{} [{:?}] up {} B/s ({} total), down {} B/s, {} peers",
                torrent.name,
                torrent.state,
                torrent.upload_speed,
                torrent.total_uploaded,
                torrent.download_speed,
                torrent.connections
            );
        }
        match serde_json::to_string(snapshot) {
            Ok(json) => tracing::debug!(target: "seedsim::telemetry", "{json}"),
            Err(e) => tracing::warn!("Failed to serialize telemetry snapshot: {e}"),
        }
    }
}
