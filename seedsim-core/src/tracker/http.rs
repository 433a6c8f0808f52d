//! HTTP tracker client with URL building and response parsing

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use async_trait::async_trait;

use super::types::{AnnounceRequest, AnnounceResponse, ScrapeStats, TrackerClient, TrackerError};
use crate::config::TrackerConfig;
use crate::torrent::InfoHash;

type BencodeDict<'a> = HashMap<&'a [u8], bencode_rs::Value<'a>>;

/// HTTP(S) tracker client shared by every torrent.
pub struct HttpTrackerClient {
    client: reqwest::Client,
}

impl HttpTrackerClient {
    /// Creates a client whose requests are bounded by `http_timeout`.
    ///
    /// # Errors
    ///
    /// - `reqwest::Error` - TLS backend could not be initialized
    pub fn new(config: &TrackerConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .user_agent(config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::limited(3))
            .build()?;
        Ok(Self { client })
    }

    /// Builds the announce URL with every query parameter.
    ///
    /// Binary values are percent-encoded byte by byte; an existing query in
    /// the announce URL is preserved.
    pub fn build_announce_url(announce_url: &str, request: &AnnounceRequest) -> String {
        let mut query = format!(
            "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1&numwant={}&key={:08X}",
            url_encode_bytes(request.info_hash.as_bytes()),
            url_encode_bytes(request.peer_id.as_bytes()),
            request.port,
            request.uploaded,
            request.downloaded,
            request.left,
            request.numwant,
            request.key,
        );
        if let Some(event) = request.event.as_http_param() {
            query.push_str("&event=");
            query.push_str(event);
        }
        if let Some(tracker_id) = &request.tracker_id {
            query.push_str("&trackerid=");
            query.push_str(&url_encode_bytes(tracker_id.as_bytes()));
        }

        let separator = if announce_url.contains('?') { '&' } else { '?' };
        format!("{announce_url}{separator}{query}")
    }

    /// Derives the scrape URL following the BEP 48 convention.
    ///
    /// Only URLs whose last path segment starts with `announce` have one.
    pub fn scrape_url(announce_url: &str) -> Option<String> {
        let (path, query) = match announce_url.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (announce_url, None),
        };
        let slash = path.rfind('/')?;
        let last = &path[slash + 1..];
        let rest = last.strip_prefix("announce")?;

        let mut scrape = format!("{}/scrape{rest}", &path[..slash]);
        if let Some(query) = query {
            scrape.push('?');
            scrape.push_str(query);
        }
        Some(scrape)
    }

    /// Parses a bencoded announce response.
    ///
    /// # Errors
    ///
    /// - `TrackerError::TrackerFailure` - Response carried a failure reason
    /// - `TrackerError::ProtocolError` - Not a dictionary, missing interval, bad peers
    pub fn parse_announce_response(
        url: &str,
        body: &[u8],
    ) -> Result<AnnounceResponse, TrackerError> {
        let protocol_error = |message: String| TrackerError::ProtocolError {
            url: url.to_string(),
            message,
        };

        let parsed = bencode_rs::Value::parse(body)
            .map_err(|e| protocol_error(format!("failed to parse response: {e:?}")))?;
        let Some(bencode_rs::Value::Dictionary(dict)) = parsed.first() else {
            return Err(protocol_error("response is not a dictionary".to_string()));
        };

        if let Some(reason) = get_string(dict, b"failure reason") {
            return Err(TrackerError::TrackerFailure {
                url: url.to_string(),
                reason,
            });
        }

        let interval = get_u32(dict, b"interval")
            .ok_or_else(|| protocol_error("missing interval".to_string()))?;

        let mut peers = match dict.get(b"peers".as_slice()) {
            Some(bencode_rs::Value::Bytes(compact)) => {
                parse_compact_peers(compact, 6).map_err(protocol_error)?
            }
            Some(bencode_rs::Value::List(entries)) => parse_dict_peers(entries),
            _ => Vec::new(),
        };
        if let Some(bencode_rs::Value::Bytes(compact)) = dict.get(b"peers6".as_slice()) {
            peers.extend(parse_compact_peers(compact, 18).map_err(protocol_error)?);
        }

        Ok(AnnounceResponse {
            interval,
            min_interval: get_u32(dict, b"min interval"),
            tracker_id: get_string(dict, b"tracker id"),
            complete: get_u32(dict, b"complete").unwrap_or(0),
            incomplete: get_u32(dict, b"incomplete").unwrap_or(0),
            peers,
            warning_message: get_string(dict, b"warning message"),
        })
    }

    /// Parses a scrape response and extracts the entry for `info_hash`.
    ///
    /// # Errors
    ///
    /// - `TrackerError::TrackerFailure` - Response carried a failure reason
    /// - `TrackerError::ProtocolError` - Malformed response or torrent missing
    pub fn parse_scrape_response(
        url: &str,
        body: &[u8],
        info_hash: &InfoHash,
    ) -> Result<ScrapeStats, TrackerError> {
        let protocol_error = |message: &str| TrackerError::ProtocolError {
            url: url.to_string(),
            message: message.to_string(),
        };

        let parsed = bencode_rs::Value::parse(body)
            .map_err(|e| protocol_error(&format!("failed to parse scrape response: {e:?}")))?;
        let Some(bencode_rs::Value::Dictionary(dict)) = parsed.first() else {
            return Err(protocol_error("scrape response is not a dictionary"));
        };

        if let Some(reason) = get_string(dict, b"failure reason") {
            return Err(TrackerError::TrackerFailure {
                url: url.to_string(),
                reason,
            });
        }

        let Some(bencode_rs::Value::Dictionary(files)) = dict.get(b"files".as_slice()) else {
            return Err(protocol_error("scrape response has no files"));
        };
        let Some(bencode_rs::Value::Dictionary(stats)) = files.get(info_hash.as_bytes().as_slice())
        else {
            return Err(protocol_error("torrent missing from scrape response"));
        };

        Ok(ScrapeStats {
            complete: get_u32(stats, b"complete").unwrap_or(0),
            downloaded: get_u32(stats, b"downloaded").unwrap_or(0),
            incomplete: get_u32(stats, b"incomplete").unwrap_or(0),
        })
    }

    async fn fetch(&self, url: &str, full_url: &str) -> Result<Vec<u8>, TrackerError> {
        let response = self.client.get(full_url).send().await.map_err(|e| {
            tracing::debug!("HTTP request to {url} failed: {e}");
            if e.is_timeout() {
                TrackerError::Timeout {
                    url: url.to_string(),
                }
            } else {
                TrackerError::Unreachable {
                    url: url.to_string(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(TrackerError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                TrackerError::Timeout {
                    url: url.to_string(),
                }
            } else {
                TrackerError::Unreachable {
                    url: url.to_string(),
                    reason: format!("failed to read response body: {e}"),
                }
            }
        })?;
        Ok(body.to_vec())
    }
}

#[async_trait]
impl TrackerClient for HttpTrackerClient {
    async fn announce(
        &self,
        url: &str,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse, TrackerError> {
        let full_url = Self::build_announce_url(url, request);
        tracing::debug!(info_hash = %request.info_hash, event = ?request.event, "Announcing to {url}");

        let body = self.fetch(url, &full_url).await?;
        let response = Self::parse_announce_response(url, &body)?;
        if let Some(warning) = &response.warning_message {
            tracing::warn!("Tracker {url} warning: {warning}");
        }
        Ok(response)
    }

    async fn scrape(&self, url: &str, info_hash: InfoHash) -> Result<ScrapeStats, TrackerError> {
        let scrape_url = Self::scrape_url(url).ok_or_else(|| TrackerError::InvalidUrl {
            url: url.to_string(),
            reason: "tracker has no scrape endpoint".to_string(),
        })?;
        let separator = if scrape_url.contains('?') { '&' } else { '?' };
        let full_url = format!(
            "{scrape_url}{separator}info_hash={}",
            url_encode_bytes(info_hash.as_bytes())
        );

        let body = self.fetch(url, &full_url).await?;
        Self::parse_scrape_response(url, &body, &info_hash)
    }
}

/// Percent-encodes every byte.
pub(crate) fn url_encode_bytes(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| format!("%{b:02X}")).collect()
}

/// Decodes compact peers: 6 bytes per IPv4 entry, 18 per IPv6 entry.
pub(crate) fn parse_compact_peers(data: &[u8], entry_len: usize) -> Result<Vec<SocketAddr>, String> {
    if !data.len().is_multiple_of(entry_len) {
        return Err(format!(
            "compact peer data length {} is not a multiple of {entry_len}",
            data.len()
        ));
    }

    let peers = data
        .chunks_exact(entry_len)
        .map(|chunk| {
            let (ip, port) = chunk.split_at(entry_len - 2);
            let ip = if entry_len == 6 {
                IpAddr::V4(Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3]))
            } else {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(ip);
                IpAddr::V6(Ipv6Addr::from(octets))
            };
            SocketAddr::new(ip, u16::from_be_bytes([port[0], port[1]]))
        })
        .collect();
    Ok(peers)
}

/// Decodes the original list-of-dictionaries peer format, skipping bad entries.
fn parse_dict_peers(entries: &[bencode_rs::Value<'_>]) -> Vec<SocketAddr> {
    entries
        .iter()
        .filter_map(|entry| {
            let bencode_rs::Value::Dictionary(peer) = entry else {
                return None;
            };
            let ip: IpAddr = get_string(peer, b"ip")?.parse().ok()?;
            let port = u16::try_from(get_i64(peer, b"port")?).ok()?;
            Some(SocketAddr::new(ip, port))
        })
        .collect()
}

fn get_i64(dict: &BencodeDict<'_>, key: &[u8]) -> Option<i64> {
    match dict.get(key) {
        Some(bencode_rs::Value::Integer(value)) => Some(*value as i64),
        _ => None,
    }
}

fn get_u32(dict: &BencodeDict<'_>, key: &[u8]) -> Option<u32> {
    get_i64(dict, key).and_then(|value| u32::try_from(value).ok())
}

fn get_string(dict: &BencodeDict<'_>, key: &[u8]) -> Option<String> {
    match dict.get(key) {
        Some(bencode_rs::Value::Bytes(bytes)) => Some(String::from_utf8_lossy(bytes).to_string()),
        _ => None,
    }
}
