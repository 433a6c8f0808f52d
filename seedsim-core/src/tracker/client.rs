//! Protocol dispatch over the HTTP and UDP clients

use std::sync::Arc;

use async_trait::async_trait;

use super::http::HttpTrackerClient;
use super::types::{
    AnnounceRequest, AnnounceResponse, ScrapeStats, TrackerClient, TrackerError, TrackerProtocol,
};
use super::udp::UdpTrackerClient;
use crate::config::TrackerConfig;
use crate::torrent::InfoHash;

/// Routes each call to the client matching the URL scheme.
pub struct MultiProtocolTrackerClient {
    http: Arc<dyn TrackerClient>,
    udp: Arc<dyn TrackerClient>,
}

impl MultiProtocolTrackerClient {
    /// Creates the production HTTP and UDP clients.
    ///
    /// # Errors
    ///
    /// - `reqwest::Error` - HTTP client could not be built
    pub fn new(config: &TrackerConfig) -> Result<Self, reqwest::Error> {
        Ok(Self {
            http: Arc::new(HttpTrackerClient::new(config)?),
            udp: Arc::new(UdpTrackerClient::new(config)),
        })
    }

    /// Combines arbitrary clients, used to inject fakes.
    pub fn with_clients(http: Arc<dyn TrackerClient>, udp: Arc<dyn TrackerClient>) -> Self {
        Self { http, udp }
    }

    fn client_for(&self, url: &str) -> Result<&Arc<dyn TrackerClient>, TrackerError> {
        Ok(match TrackerProtocol::from_url(url)? {
            TrackerProtocol::Http => &self.http,
            TrackerProtocol::Udp => &self.udp,
        })
    }
}

#[async_trait]
impl TrackerClient for MultiProtocolTrackerClient {
    async fn announce(
        &self,
        url: &str,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse, TrackerError> {
        self.client_for(url)?.announce(url, request).await
    }

    async fn scrape(&self, url: &str, info_hash: InfoHash) -> Result<ScrapeStats, TrackerError> {
        self.client_for(url)?.scrape(url, info_hash).await
    }
}
