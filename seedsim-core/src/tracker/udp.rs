//! UDP tracker client (BEP 15)

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::{Buf, BufMut};
use parking_lot::Mutex;
use rand::Rng as _;
use tokio::net::UdpSocket;

use super::http::parse_compact_peers;
use super::types::{AnnounceRequest, AnnounceResponse, ScrapeStats, TrackerClient, TrackerError};
use crate::config::TrackerConfig;
use crate::torrent::InfoHash;

const PROTOCOL_ID: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_SCRAPE: u32 = 2;
const ACTION_ERROR: u32 = 3;

/// How long a tracker-issued connection id may be reused.
pub const CONNECTION_ID_TTL: Duration = Duration::from_secs(60);

const CONNECT_RESPONSE_LEN: usize = 16;
const ANNOUNCE_RESPONSE_MIN_LEN: usize = 20;
// interval, leechers and seeders
const ANNOUNCE_BODY_FIXED_LEN: usize = 12;
const SCRAPE_RESPONSE_LEN: usize = 20;

/// Why a single request attempt produced no usable reply.
#[derive(Debug)]
enum AttemptFailure {
    Timeout,
    TransactionMismatch { expected: u32, received: u32 },
    Malformed(String),
}

/// BEP 15 client shared by every UDP tracker.
///
/// Each exchange uses its own ephemeral socket; connection ids are cached
/// per tracker address for [`CONNECTION_ID_TTL`].
pub struct UdpTrackerClient {
    connect_timeout: Duration,
    announce_timeout: Duration,
    max_retries: u32,
    connections: Mutex<HashMap<SocketAddr, (u64, Instant)>>,
}

impl UdpTrackerClient {
    pub fn new(config: &TrackerConfig) -> Self {
        Self {
            connect_timeout: config.udp_connect_timeout,
            announce_timeout: config.udp_announce_timeout,
            max_retries: config.udp_max_retries.max(1),
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Number of tracker addresses with a live connection id.
    pub fn cached_connections(&self) -> usize {
        let now = Instant::now();
        self.connections
            .lock()
            .values()
            .filter(|(_, obtained)| now.duration_since(*obtained) < CONNECTION_ID_TTL)
            .count()
    }

    /// Builds an announce datagram.
    pub fn build_announce_packet(
        connection_id: u64,
        transaction_id: u32,
        request: &AnnounceRequest,
    ) -> Vec<u8> {
        let mut packet = Vec::with_capacity(98);
        packet.put_u64(connection_id);
        packet.put_u32(ACTION_ANNOUNCE);
        packet.put_u32(transaction_id);
        packet.put_slice(request.info_hash.as_bytes());
        packet.put_slice(request.peer_id.as_bytes());
        packet.put_u64(request.downloaded);
        packet.put_u64(request.left);
        packet.put_u64(request.uploaded);
        packet.put_u32(request.event.as_udp_code());
        packet.put_u32(0); // default IP
        packet.put_u32(request.key);
        packet.put_u32(request.numwant);
        packet.put_u16(request.port);
        packet
    }

    /// Parses an announce reply body (after action and transaction id).
    ///
    /// # Errors
    ///
    /// - `TrackerError::ProtocolError` - Body shorter than the fixed fields, or
    ///   peer list not a multiple of 6 bytes
    pub fn parse_announce_body(url: &str, mut body: &[u8]) -> Result<AnnounceResponse, TrackerError> {
        if body.len() < ANNOUNCE_BODY_FIXED_LEN {
            return Err(TrackerError::ProtocolError {
                url: url.to_string(),
                message: format!("announce reply body is only {} bytes", body.len()),
            });
        }
        let interval = body.get_u32();
        let leechers = body.get_u32();
        let seeders = body.get_u32();
        let peers = parse_compact_peers(body, 6).map_err(|message| TrackerError::ProtocolError {
            url: url.to_string(),
            message,
        })?;

        Ok(AnnounceResponse {
            interval,
            complete: seeders,
            incomplete: leechers,
            peers,
            ..AnnounceResponse::default()
        })
    }

    async fn open(url: &str) -> Result<(UdpSocket, SocketAddr), TrackerError> {
        let unreachable = |reason: String| TrackerError::Unreachable {
            url: url.to_string(),
            reason,
        };
        let parsed = url::Url::parse(url).map_err(|e| TrackerError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        let (Some(host), Some(port)) = (parsed.host_str(), parsed.port()) else {
            return Err(TrackerError::InvalidUrl {
                url: url.to_string(),
                reason: "UDP tracker URL needs a host and port".to_string(),
            });
        };

        let addr = tokio::net::lookup_host((host.trim_matches(|c| c == '[' || c == ']'), port))
            .await
            .map_err(|e| unreachable(format!("DNS lookup failed: {e}")))?
            .find(SocketAddr::is_ipv4)
            .ok_or_else(|| unreachable("no IPv4 address for tracker".to_string()))?;

        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| unreachable(e.to_string()))?;
        socket
            .connect(addr)
            .await
            .map_err(|e| unreachable(e.to_string()))?;
        Ok((socket, addr))
    }

    /// Sends a request built around a fresh transaction id until a reply
    /// with the matching id and action arrives or retries run out.
    ///
    /// Returns the reply body following the 8-byte action/transaction header.
    async fn exchange<F>(
        &self,
        url: &str,
        socket: &UdpSocket,
        build: F,
        expected_action: u32,
        min_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TrackerError>
    where
        F: Fn(u32) -> Vec<u8>,
    {
        let mut buf = vec![0u8; 2048];
        let mut last_failure = AttemptFailure::Timeout;

        for attempt in 1..=self.max_retries {
            let transaction_id: u32 = rand::rng().random();
            socket
                .send(&build(transaction_id))
                .await
                .map_err(|e| TrackerError::Unreachable {
                    url: url.to_string(),
                    reason: e.to_string(),
                })?;

            let received = match tokio::time::timeout(timeout, socket.recv(&mut buf)).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    last_failure = AttemptFailure::Malformed(e.to_string());
                    continue;
                }
                Err(_) => {
                    tracing::debug!("UDP tracker {url} attempt {attempt} timed out");
                    last_failure = AttemptFailure::Timeout;
                    continue;
                }
            };

            let mut reply = &buf[..received];
            if reply.len() < 8 {
                last_failure = AttemptFailure::Malformed(format!("{received}-byte datagram"));
                continue;
            }
            let action = reply.get_u32();
            let reply_transaction = reply.get_u32();

            if reply_transaction != transaction_id {
                tracing::debug!(
                    "UDP tracker {url} answered transaction {reply_transaction:08x}, expected {transaction_id:08x}"
                );
                last_failure = AttemptFailure::TransactionMismatch {
                    expected: transaction_id,
                    received: reply_transaction,
                };
                continue;
            }

            if action == ACTION_ERROR {
                self.forget(url, socket);
                return Err(TrackerError::TrackerFailure {
                    url: url.to_string(),
                    reason: String::from_utf8_lossy(reply).to_string(),
                });
            }
            if action != expected_action {
                last_failure =
                    AttemptFailure::Malformed(format!("action {action}, expected {expected_action}"));
                continue;
            }
            if received < min_len {
                last_failure = AttemptFailure::Malformed(format!(
                    "{received}-byte reply, expected at least {min_len}"
                ));
                continue;
            }

            return Ok(reply.to_vec());
        }

        Err(match last_failure {
            AttemptFailure::Timeout => TrackerError::Timeout {
                url: url.to_string(),
            },
            AttemptFailure::TransactionMismatch { expected, received } => {
                TrackerError::ProtocolError {
                    url: url.to_string(),
                    message: format!(
                        "transaction id mismatch after {} attempts (sent {expected:08x}, got {received:08x})",
                        self.max_retries
                    ),
                }
            }
            AttemptFailure::Malformed(message) => TrackerError::ProtocolError {
                url: url.to_string(),
                message,
            },
        })
    }

    fn forget(&self, url: &str, socket: &UdpSocket) {
        if let Ok(addr) = socket.peer_addr() {
            tracing::debug!("Dropping cached connection id for {url}");
            self.connections.lock().remove(&addr);
        }
    }

    async fn connection_id(
        &self,
        url: &str,
        socket: &UdpSocket,
        addr: SocketAddr,
    ) -> Result<u64, TrackerError> {
        if let Some((id, obtained)) = self.connections.lock().get(&addr).copied() {
            if obtained.elapsed() < CONNECTION_ID_TTL {
                return Ok(id);
            }
        }

        let body = self
            .exchange(
                url,
                socket,
                |transaction_id| {
                    let mut packet = Vec::with_capacity(16);
                    packet.put_u64(PROTOCOL_ID);
                    packet.put_u32(ACTION_CONNECT);
                    packet.put_u32(transaction_id);
                    packet
                },
                ACTION_CONNECT,
                CONNECT_RESPONSE_LEN,
                self.connect_timeout,
            )
            .await?;

        let id = (&body[..]).get_u64();
        self.connections.lock().insert(addr, (id, Instant::now()));
        Ok(id)
    }
}

#[async_trait]
impl TrackerClient for UdpTrackerClient {
    async fn announce(
        &self,
        url: &str,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse, TrackerError> {
        let (socket, addr) = Self::open(url).await?;
        let connection_id = self.connection_id(url, &socket, addr).await?;
        tracing::debug!(info_hash = %request.info_hash, event = ?request.event, "Announcing to {url}");

        let result = self
            .exchange(
                url,
                &socket,
                |transaction_id| Self::build_announce_packet(connection_id, transaction_id, request),
                ACTION_ANNOUNCE,
                ANNOUNCE_RESPONSE_MIN_LEN,
                self.announce_timeout,
            )
            .await;

        match result {
            Ok(body) => Self::parse_announce_body(url, &body),
            Err(e) => {
                self.connections.lock().remove(&addr);
                Err(e)
            }
        }
    }

    async fn scrape(&self, url: &str, info_hash: InfoHash) -> Result<ScrapeStats, TrackerError> {
        let (socket, addr) = Self::open(url).await?;
        let connection_id = self.connection_id(url, &socket, addr).await?;

        let body = self
            .exchange(
                url,
                &socket,
                |transaction_id| {
                    let mut packet = Vec::with_capacity(36);
                    packet.put_u64(connection_id);
                    packet.put_u32(ACTION_SCRAPE);
                    packet.put_u32(transaction_id);
                    packet.put_slice(info_hash.as_bytes());
                    packet
                },
                ACTION_SCRAPE,
                SCRAPE_RESPONSE_LEN,
                self.announce_timeout,
            )
            .await?;

        let mut body = &body[..];
        Ok(ScrapeStats {
            complete: body.get_u32(),
            downloaded: body.get_u32(),
            incomplete: body.get_u32(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::peer::PeerId;
    use crate::tracker::AnnounceEvent;

    fn config() -> TrackerConfig {
        TrackerConfig {
            udp_connect_timeout: Duration::from_millis(200),
            udp_announce_timeout: Duration::from_millis(200),
            udp_max_retries: 3,
            ..TrackerConfig::default()
        }
    }

    fn request() -> AnnounceRequest {
        AnnounceRequest {
            info_hash: InfoHash::new([0xab; 20]),
            peer_id: PeerId::new([b'p'; 20]),
            port: 6881,
            uploaded: 300,
            downloaded: 200,
            left: 0,
            event: AnnounceEvent::Started,
            numwant: 50,
            key: 7,
            tracker_id: None,
        }
    }

    /// Fake tracker: answers connects with id 0x1122, announces with one
    /// peer, scrapes with fixed stats. `corrupt_tid` flips transaction ids.
    async fn fake_tracker(corrupt_tid: bool) -> (String, Arc<AtomicU32>, Arc<AtomicU32>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let url = format!("udp://{}/announce", socket.local_addr().unwrap());
        let connects = Arc::new(AtomicU32::new(0));
        let announces = Arc::new(AtomicU32::new(0));
        let (connect_count, announce_count) = (Arc::clone(&connects), Arc::clone(&announces));

        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            loop {
                let Ok((n, from)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                let mut packet = &buf[..n];
                let connection_id = packet.get_u64();
                let action = packet.get_u32();
                let mut tid = packet.get_u32();
                if corrupt_tid {
                    tid = tid.wrapping_add(1);
                }

                let mut reply = Vec::new();
                match action {
                    ACTION_CONNECT => {
                        assert_eq!(connection_id, PROTOCOL_ID);
                        connect_count.fetch_add(1, Ordering::SeqCst);
                        reply.put_u32(ACTION_CONNECT);
                        reply.put_u32(tid);
                        reply.put_u64(0x1122);
                    }
                    ACTION_ANNOUNCE => {
                        assert_eq!(connection_id, 0x1122);
                        announce_count.fetch_add(1, Ordering::SeqCst);
                        reply.put_u32(ACTION_ANNOUNCE);
                        reply.put_u32(tid);
                        reply.put_u32(1800);
                        reply.put_u32(4);
                        reply.put_u32(9);
                        reply.put_slice(&[10, 0, 0, 5, 0x1a, 0xe1]);
                    }
                    ACTION_SCRAPE => {
                        reply.put_u32(ACTION_SCRAPE);
                        reply.put_u32(tid);
                        reply.put_u32(12);
                        reply.put_u32(34);
                        reply.put_u32(5);
                    }
                    _ => continue,
                }
                let _ = socket.send_to(&reply, from).await;
            }
        });

        (url, connects, announces)
    }

    #[test]
    fn test_announce_packet_layout() {
        let packet = UdpTrackerClient::build_announce_packet(0x1122, 0xAABBCCDD, &request());
        assert_eq!(packet.len(), 98);
        assert_eq!(&packet[0..8], &0x1122u64.to_be_bytes());
        assert_eq!(&packet[8..12], &ACTION_ANNOUNCE.to_be_bytes());
        assert_eq!(&packet[12..16], &0xAABBCCDDu32.to_be_bytes());
        assert_eq!(&packet[16..36], &[0xab; 20]);
        assert_eq!(&packet[56..64], &200u64.to_be_bytes());
        assert_eq!(&packet[72..80], &300u64.to_be_bytes());
        assert_eq!(&packet[80..84], &2u32.to_be_bytes());
        assert_eq!(&packet[96..98], &6881u16.to_be_bytes());
    }

    #[test]
    fn test_short_announce_body_is_protocol_error() {
        let url = "udp://tracker.example:6969/announce";
        for len in [0, 4, 11] {
            assert!(matches!(
                UdpTrackerClient::parse_announce_body(url, &vec![0u8; len]),
                Err(TrackerError::ProtocolError { .. })
            ));
        }

        let mut body = vec![0, 0, 7, 8, 0, 0, 0, 1, 0, 0, 0, 2];
        body.extend_from_slice(&[10, 1, 2, 3, 0x1a, 0xe1]);
        let response = UdpTrackerClient::parse_announce_body(url, &body).unwrap();
        assert_eq!(response.interval, 1800);
        assert_eq!(response.incomplete, 1);
        assert_eq!(response.complete, 2);
        assert_eq!(response.peers, vec!["10.1.2.3:6881".parse().unwrap()]);
    }

    #[tokio::test]
    async fn test_announce_reuses_connection_id() {
        let (url, connects, announces) = fake_tracker(false).await;
        let client = UdpTrackerClient::new(&config());

        let response = client.announce(&url, &request()).await.unwrap();
        assert_eq!(response.interval, 1800);
        assert_eq!(response.incomplete, 4);
        assert_eq!(response.complete, 9);
        assert_eq!(response.peers, vec!["10.0.0.5:6881".parse().unwrap()]);

        client.announce(&url, &request()).await.unwrap();
        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert_eq!(announces.load(Ordering::SeqCst), 2);
        assert_eq!(client.cached_connections(), 1);
    }

    #[tokio::test]
    async fn test_mismatched_transaction_id_retried_then_fails() {
        let (url, connects, announces) = fake_tracker(true).await;
        let client = UdpTrackerClient::new(&config());

        let result = client.announce(&url, &request()).await;
        assert!(matches!(result, Err(TrackerError::ProtocolError { .. })));
        assert_eq!(connects.load(Ordering::SeqCst), 3);
        assert_eq!(announces.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_silent_tracker_times_out() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let url = format!("udp://{}", socket.local_addr().unwrap());
        let client = UdpTrackerClient::new(&TrackerConfig {
            udp_max_retries: 2,
            ..config()
        });

        let result = client.announce(&url, &request()).await;
        assert!(matches!(result, Err(TrackerError::Timeout { .. })));
        drop(socket);
    }

    #[tokio::test]
    async fn test_error_action_is_tracker_failure() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let url = format!("udp://{}", socket.local_addr().unwrap());
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (n, from) = socket.recv_from(&mut buf).await.unwrap();
            let tid = (&buf[12..n]).get_u32();
            let mut reply = Vec::new();
            reply.put_u32(ACTION_ERROR);
            reply.put_u32(tid);
            reply.put_slice(b"torrent not registered");
            socket.send_to(&reply, from).await.unwrap();
        });

        let client = UdpTrackerClient::new(&config());
        let result = client.announce(&url, &request()).await;
        assert_eq!(
            result,
            Err(TrackerError::TrackerFailure {
                url,
                reason: "torrent not registered".to_string()
            })
        );
        assert_eq!(client.cached_connections(), 0);
    }

    #[tokio::test]
    async fn test_scrape() {
        let (url, _, _) = fake_tracker(false).await;
        let client = UdpTrackerClient::new(&config());

        let stats = client.scrape(&url, InfoHash::new([1; 20])).await.unwrap();
        assert_eq!(
            stats,
            ScrapeStats {
                complete: 12,
                downloaded: 34,
                incomplete: 5
            }
        );
    }

    #[tokio::test]
    async fn test_url_without_port_rejected() {
        let client = UdpTrackerClient::new(&config());
        let result = client.announce("udp://tracker.example/announce", &request()).await;
        assert!(matches!(result, Err(TrackerError::InvalidUrl { .. })));
    }
}
