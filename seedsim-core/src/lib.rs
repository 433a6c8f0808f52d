//! SeedSim Core - BitTorrent client network-behavior emulation
//!
//! Announces to HTTP and UDP trackers, speaks the peer wire protocol and
//! serves synthetic piece data at shaped rates, so trackers and swarm
//! tooling see a believable seeding client. No real file content is ever
//! read, stored or sent.

pub mod bencode;
pub mod config;
pub mod dht;
pub mod peer;
pub mod profile;
pub mod random;
pub mod scheduler;
pub mod settings;
pub mod shaper;
pub mod telemetry;
pub mod torrent;
pub mod tracing_setup;
pub mod tracker;

// Re-export main types for convenient access
pub use config::{ConfigurationError, SeedSimConfig};
pub use dht::DhtError;
pub use peer::{AdmitError, CapacityError, PeerProtocolError};
pub use profile::SeedingProfile;
pub use scheduler::{SchedulerError, SchedulerHandle, SessionScheduler, spawn_scheduler};
pub use torrent::{InfoHash, MetadataError, TorrentMetadata};
pub use tracker::TrackerError;

/// Errors that can bubble up from any SeedSim component.
#[derive(Debug, thiserror::Error)]
pub enum SeedSimError {
    #[error("Tracker error: {0}")]
    Tracker(#[from] TrackerError),

    #[error("Peer protocol error: {0}")]
    Peer(#[from] PeerProtocolError),

    #[error("Connection not admitted: {0}")]
    Admit(#[from] AdmitError),

    #[error("Capacity error: {0}")]
    Capacity(#[from] CapacityError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("DHT error: {0}")]
    Dht(#[from] DhtError),

    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SeedSimError {
    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            SeedSimError::Configuration(_)
                | SeedSimError::Metadata(_)
                | SeedSimError::Tracker(TrackerError::InvalidUrl { .. })
                | SeedSimError::Scheduler(SchedulerError::DuplicateTorrent { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, SeedSimError>;
