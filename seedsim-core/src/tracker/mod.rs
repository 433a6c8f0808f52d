//! BitTorrent tracker communication.
//!
//! HTTP (BEP 3, BEP 23 compact peers, BEP 48 scrape) and UDP (BEP 15)
//! clients behind the [`TrackerClient`] trait, plus the per-endpoint
//! schedule that decides when each tracker is contacted.

pub mod client;
pub mod endpoint;
pub mod http;
pub mod test_mocks;
pub mod types;
pub mod udp;

pub use client::MultiProtocolTrackerClient;
pub use endpoint::{AnnounceTicket, EndpointStats, EndpointStatus, TrackerEndpoint};
pub use http::HttpTrackerClient;
pub use types::{
    AnnounceEvent, AnnounceRequest, AnnounceResponse, ScrapeStats, TrackerClient, TrackerError,
    TrackerProtocol,
};
pub use udp::UdpTrackerClient;
