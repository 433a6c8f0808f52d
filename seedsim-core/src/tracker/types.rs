//! Core types and enumerations for BitTorrent tracker communication

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::peer::PeerId;
use crate::torrent::InfoHash;

/// Errors from a single tracker exchange.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TrackerError {
    #[error("Tracker {url} timed out")]
    Timeout { url: String },

    #[error("Tracker {url} unreachable: {reason}")]
    Unreachable { url: String, reason: String },

    #[error("Tracker {url} returned HTTP status {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("Protocol error from {url}: {message}")]
    ProtocolError { url: String, message: String },

    #[error("Tracker {url} refused request: {reason}")]
    TrackerFailure { url: String, reason: String },

    #[error("Invalid tracker URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// Transport a tracker URL speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerProtocol {
    Http,
    Udp,
}

impl TrackerProtocol {
    /// Determines the transport from the URL scheme.
    ///
    /// # Errors
    ///
    /// - `TrackerError::InvalidUrl` - Unparseable URL or unsupported scheme
    pub fn from_url(url: &str) -> Result<Self, TrackerError> {
        let parsed = url::Url::parse(url).map_err(|e| TrackerError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        match parsed.scheme() {
            "http" | "https" => Ok(Self::Http),
            "udp" => Ok(Self::Udp),
            other => Err(TrackerError::InvalidUrl {
                url: url.to_string(),
                reason: format!("unsupported scheme '{other}'"),
            }),
        }
    }
}

/// BitTorrent announce events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    /// Regular re-announce
    None,
    Started,
    Stopped,
    Completed,
}

impl AnnounceEvent {
    /// Query string value; `None` is omitted from HTTP announces.
    pub fn as_http_param(self) -> Option<&'static str> {
        match self {
            AnnounceEvent::None => None,
            AnnounceEvent::Started => Some("started"),
            AnnounceEvent::Stopped => Some("stopped"),
            AnnounceEvent::Completed => Some("completed"),
        }
    }

    /// BEP 15 event code.
    pub fn as_udp_code(self) -> u32 {
        match self {
            AnnounceEvent::None => 0,
            AnnounceEvent::Completed => 1,
            AnnounceEvent::Started => 2,
            AnnounceEvent::Stopped => 3,
        }
    }
}

/// Tracker announce request.
///
/// Client statistics and torrent identity sent with every announce.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnounceRequest {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    /// TCP port we accept peers on
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    /// Bytes remaining (0 for seeders)
    pub left: u64,
    pub event: AnnounceEvent,
    pub numwant: u32,
    /// Per-session random key letting trackers recognize us across IP changes
    pub key: u32,
    /// Echoed back when a tracker handed one out
    pub tracker_id: Option<String>,
}

/// Tracker announce response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnnounceResponse {
    /// Seconds until the next regular announce
    pub interval: u32,
    /// Minimum seconds between announces
    pub min_interval: Option<u32>,
    pub tracker_id: Option<String>,
    /// Seeders in the swarm
    pub complete: u32,
    /// Leechers in the swarm
    pub incomplete: u32,
    pub peers: Vec<SocketAddr>,
    pub warning_message: Option<String>,
}

/// Swarm statistics from a scrape.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScrapeStats {
    /// Seeders
    pub complete: u32,
    /// Times the torrent was fully downloaded
    pub downloaded: u32,
    /// Leechers
    pub incomplete: u32,
}

/// Abstract tracker communication interface.
///
/// One client serves every tracker URL of its protocol; the URL is passed
/// per call so connection state (UDP connection ids, HTTP keep-alive) can
/// be shared between torrents.
#[async_trait]
pub trait TrackerClient: Send + Sync {
    /// Announces to the tracker at `url` and returns its response.
    ///
    /// # Errors
    ///
    /// - `TrackerError::Timeout` - No response within the configured bound
    /// - `TrackerError::Unreachable` - Network failure
    /// - `TrackerError::HttpStatus` - Non-success HTTP status
    /// - `TrackerError::TrackerFailure` - Tracker replied with a failure reason
    /// - `TrackerError::ProtocolError` - Malformed response
    async fn announce(
        &self,
        url: &str,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse, TrackerError>;

    /// Fetches swarm statistics for one torrent.
    ///
    /// # Errors
    ///
    /// Same as [`TrackerClient::announce`], plus `TrackerError::InvalidUrl`
    /// when the tracker has no scrape endpoint.
    async fn scrape(&self, url: &str, info_hash: InfoHash) -> Result<ScrapeStats, TrackerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_from_url() {
        assert_eq!(
            TrackerProtocol::from_url("http://t.example/announce").unwrap(),
            TrackerProtocol::Http
        );
        assert_eq!(
            TrackerProtocol::from_url("https://t.example/announce").unwrap(),
            TrackerProtocol::Http
        );
        assert_eq!(
            TrackerProtocol::from_url("udp://t.example:1337/announce").unwrap(),
            TrackerProtocol::Udp
        );
        assert!(matches!(
            TrackerProtocol::from_url("wss://t.example"),
            Err(TrackerError::InvalidUrl { .. })
        ));
        assert!(TrackerProtocol::from_url("not a url").is_err());
    }

    #[test]
    fn test_event_encodings() {
        assert_eq!(AnnounceEvent::None.as_http_param(), None);
        assert_eq!(AnnounceEvent::Started.as_http_param(), Some("started"));
        assert_eq!(AnnounceEvent::None.as_udp_code(), 0);
        assert_eq!(AnnounceEvent::Completed.as_udp_code(), 1);
        assert_eq!(AnnounceEvent::Started.as_udp_code(), 2);
        assert_eq!(AnnounceEvent::Stopped.as_udp_code(), 3);
    }
}
