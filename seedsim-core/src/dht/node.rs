//! UDP DHT node: answers the four KRPC queries and issues them.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::DhtError;
use super::krpc::{
    ERROR_GENERIC, ERROR_PROTOCOL, KrpcBody, KrpcMessage, KrpcQuery, KrpcResponse,
};
use super::routing::{DhtNodeEntry, K, NodeId, RoutingTable};
use crate::random::RandomSource;
use crate::torrent::InfoHash;

/// Announced peers are forgotten after this long.
const PEER_LIFETIME: Duration = Duration::from_secs(30 * 60);
const MAX_PEERS_PER_TORRENT: usize = 500;
const MAX_PENDING_QUERIES: usize = 256;
const TOKEN_LEN: usize = 8;

type Responder = oneshot::Sender<Result<KrpcResponse, DhtError>>;

struct TokenSecrets {
    current: [u8; 16],
    previous: [u8; 16],
}

/// Minimal BEP 5 node.
///
/// The receive loop runs on its own task until [`DhtNode::shutdown`].
pub struct DhtNode {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    own_id: NodeId,
    query_timeout: Duration,
    table: Mutex<RoutingTable>,
    pending: Mutex<HashMap<Vec<u8>, Responder>>,
    peers: Mutex<HashMap<InfoHash, Vec<(SocketAddr, Instant)>>>,
    secrets: Mutex<TokenSecrets>,
    next_transaction: AtomicU16,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl DhtNode {
    /// Binds the UDP socket and starts answering queries.
    ///
    /// # Errors
    ///
    /// - `DhtError::Io` - Socket could not be bound
    pub async fn bind(
        addr: SocketAddr,
        own_id: NodeId,
        query_timeout: Duration,
        rng: &mut dyn RandomSource,
    ) -> Result<Arc<Self>, DhtError> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        let mut current = [0u8; 16];
        let mut previous = [0u8; 16];
        rng.fill_bytes(&mut current);
        rng.fill_bytes(&mut previous);

        let node = Arc::new(Self {
            socket: Arc::new(socket),
            local_addr,
            own_id,
            query_timeout,
            table: Mutex::new(RoutingTable::new(own_id)),
            pending: Mutex::new(HashMap::new()),
            peers: Mutex::new(HashMap::new()),
            secrets: Mutex::new(TokenSecrets { current, previous }),
            next_transaction: AtomicU16::new(rng.next_u32() as u16),
            receiver: Mutex::new(None),
        });

        let receiver = tokio::spawn(Arc::clone(&node).receive_loop());
        *node.receiver.lock() = Some(receiver);
        tracing::info!("DHT node {own_id} listening on {local_addr}");
        Ok(node)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn own_id(&self) -> NodeId {
        self.own_id
    }

    pub fn node_count(&self) -> usize {
        self.table.lock().len()
    }

    /// Up to `count` known nodes closest to `target`.
    pub fn closest_nodes(&self, target: &NodeId, count: usize) -> Vec<DhtNodeEntry> {
        self.table.lock().closest(target, count)
    }

    /// Adds a node learned out of band.
    pub fn add_node(&self, id: NodeId, address: SocketAddr) {
        self.table
            .lock()
            .insert(DhtNodeEntry::new(id, address), Instant::now());
    }

    /// Peers stored for `info_hash` by remote `announce_peer` queries.
    pub fn stored_peers(&self, info_hash: &InfoHash) -> Vec<SocketAddr> {
        let now = Instant::now();
        let mut peers = self.peers.lock();
        match peers.get_mut(info_hash) {
            Some(list) => {
                list.retain(|(_, at)| now.duration_since(*at) < PEER_LIFETIME);
                list.iter().map(|(addr, _)| *addr).collect()
            }
            None => Vec::new(),
        }
    }

    /// Replaces the token secret; tokens from the previous one stay valid.
    pub fn rotate_token_secret(&self, rng: &mut dyn RandomSource) {
        let mut secrets = self.secrets.lock();
        secrets.previous = secrets.current;
        rng.fill_bytes(&mut secrets.current);
    }

    /// Stops the receive loop and fails every pending query.
    pub fn shutdown(&self) {
        if let Some(receiver) = self.receiver.lock().take() {
            receiver.abort();
        }
        for (_, responder) in self.pending.lock().drain() {
            let _ = responder.send(Err(DhtError::Shutdown));
        }
    }

    /// # Errors
    ///
    /// - `DhtError::Timeout` - No reply within the query timeout
    /// - `DhtError::Remote` - Node answered with a KRPC error
    pub async fn ping(&self, addr: SocketAddr) -> Result<NodeId, DhtError> {
        Ok(self.query(addr, KrpcQuery::Ping).await?.id)
    }

    /// # Errors
    ///
    /// Same as [`DhtNode::ping`].
    pub async fn find_node(
        &self,
        addr: SocketAddr,
        target: NodeId,
    ) -> Result<Vec<DhtNodeEntry>, DhtError> {
        let response = self.query(addr, KrpcQuery::FindNode { target }).await?;
        self.learn(&response.nodes);
        Ok(response.nodes)
    }

    /// # Errors
    ///
    /// Same as [`DhtNode::ping`].
    pub async fn get_peers(
        &self,
        addr: SocketAddr,
        info_hash: InfoHash,
    ) -> Result<KrpcResponse, DhtError> {
        let response = self.query(addr, KrpcQuery::GetPeers { info_hash }).await?;
        self.learn(&response.nodes);
        Ok(response)
    }

    /// # Errors
    ///
    /// Same as [`DhtNode::ping`].
    pub async fn announce_peer(
        &self,
        addr: SocketAddr,
        info_hash: InfoHash,
        port: u16,
        token: Vec<u8>,
    ) -> Result<(), DhtError> {
        self.query(
            addr,
            KrpcQuery::AnnouncePeer {
                info_hash,
                port,
                token,
                implied_port: false,
            },
        )
        .await
        .map(|_| ())
    }

    /// Pings each bootstrap address, then asks responders for our own
    /// neighbourhood. Returns the routing table size afterwards.
    pub async fn bootstrap(&self, nodes: &[String]) -> usize {
        let mut responders = Vec::new();
        for node in nodes {
            let addr = match tokio::net::lookup_host(node.as_str()).await {
                Ok(mut addrs) => addrs.find(SocketAddr::is_ipv4),
                Err(e) => {
                    tracing::warn!("Failed to resolve DHT bootstrap node {node}: {e}");
                    None
                }
            };
            let Some(addr) = addr else {
                continue;
            };
            match self.ping(addr).await {
                Ok(_) => responders.push(addr),
                Err(e) => tracing::debug!("Bootstrap node {addr} did not answer: {e}"),
            }
        }

        let lookups = responders
            .iter()
            .map(|addr| self.find_node(*addr, self.own_id));
        futures::future::join_all(lookups).await;

        let count = self.node_count();
        tracing::info!("DHT bootstrap complete, {count} nodes known");
        count
    }

    /// One round of `get_peers` against the closest known nodes, followed
    /// by `announce_peer` to every node that handed out a token when
    /// `announce_port` is set.
    pub async fn lookup_peers(
        &self,
        info_hash: InfoHash,
        announce_port: Option<u16>,
    ) -> Vec<SocketAddr> {
        let targets = self.closest_nodes(&NodeId::from(info_hash), K);
        let replies = futures::future::join_all(
            targets
                .iter()
                .map(|node| async move { (node, self.get_peers(node.address, info_hash).await) }),
        )
        .await;

        let mut peers = Vec::new();
        let mut seen = HashSet::new();
        let mut tokens = Vec::new();
        for (node, reply) in replies {
            match reply {
                Ok(response) => {
                    for peer in response.values {
                        if seen.insert(peer) {
                            peers.push(peer);
                        }
                    }
                    if let Some(token) = response.token {
                        tokens.push((node.address, token));
                    }
                }
                Err(e) => {
                    tracing::debug!("get_peers to {} failed: {e}", node.address);
                    self.table.lock().record_failure(&node.id);
                }
            }
        }

        if let Some(port) = announce_port {
            let announces = tokens
                .into_iter()
                .map(|(addr, token)| self.announce_peer(addr, info_hash, port, token));
            for result in futures::future::join_all(announces).await {
                if let Err(e) = result {
                    tracing::debug!("announce_peer failed: {e}");
                }
            }
        }

        tracing::debug!(info_hash = %info_hash, "DHT lookup found {} peers", peers.len());
        peers
    }

    async fn query(&self, addr: SocketAddr, query: KrpcQuery) -> Result<KrpcResponse, DhtError> {
        let transaction_id = self
            .next_transaction
            .fetch_add(1, Ordering::Relaxed)
            .to_be_bytes()
            .to_vec();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            if pending.len() >= MAX_PENDING_QUERIES {
                return Err(DhtError::Overloaded);
            }
            pending.insert(transaction_id.clone(), tx);
        }

        let message = KrpcMessage::query(transaction_id.clone(), self.own_id, query);
        if let Err(e) = self.socket.send_to(&message.encode(), addr).await {
            self.pending.lock().remove(&transaction_id);
            return Err(e.into());
        }

        let result = tokio::time::timeout(self.query_timeout, rx).await;
        self.pending.lock().remove(&transaction_id);
        match result {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(DhtError::Shutdown),
            Err(_) => Err(DhtError::Timeout { addr }),
        }
    }

    fn learn(&self, nodes: &[DhtNodeEntry]) {
        let now = Instant::now();
        let mut table = self.table.lock();
        for node in nodes {
            table.insert(node.clone(), now);
        }
    }

    async fn receive_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; 65535];
        loop {
            let (len, from) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    tracing::debug!("DHT receive failed: {e}");
                    continue;
                }
            };
            match KrpcMessage::decode(&buf[..len]) {
                Ok(message) => self.handle(message, from).await,
                Err(e) => tracing::trace!("Dropping DHT datagram from {from}: {e}"),
            }
        }
    }

    async fn handle(&self, message: KrpcMessage, from: SocketAddr) {
        match message.body {
            KrpcBody::Query { sender, query } => {
                self.add_node(sender, from);
                let reply = self.answer(message.transaction_id, query, from);
                if let Err(e) = self.socket.send_to(&reply.encode(), from).await {
                    tracing::debug!("Failed to answer DHT query from {from}: {e}");
                }
            }
            KrpcBody::Response(response) => {
                self.add_node(response.id, from);
                if let Some(responder) = self.pending.lock().remove(&message.transaction_id) {
                    let _ = responder.send(Ok(response));
                }
            }
            KrpcBody::Error { code, message: text } => {
                if let Some(responder) = self.pending.lock().remove(&message.transaction_id) {
                    let _ = responder.send(Err(DhtError::Remote {
                        code,
                        message: text,
                    }));
                }
            }
        }
    }

    fn answer(&self, transaction_id: Vec<u8>, query: KrpcQuery, from: SocketAddr) -> KrpcMessage {
        let mut response = KrpcResponse::new(self.own_id);
        match query {
            KrpcQuery::Ping => {}
            KrpcQuery::FindNode { target } => {
                response.nodes = self.closest_nodes(&target, K);
            }
            KrpcQuery::GetPeers { info_hash } => {
                response.token = Some(self.token_for(&from, false));
                response.values = self.stored_peers(&info_hash);
                if response.values.is_empty() {
                    response.nodes = self.closest_nodes(&NodeId::from(info_hash), K);
                }
            }
            KrpcQuery::AnnouncePeer {
                info_hash,
                port,
                token,
                implied_port,
            } => {
                if token != self.token_for(&from, false) && token != self.token_for(&from, true) {
                    tracing::debug!("Rejecting announce_peer from {from}: bad token");
                    return KrpcMessage::error(transaction_id, ERROR_PROTOCOL, "bad token");
                }
                let port = if implied_port { from.port() } else { port };
                if port == 0 {
                    return KrpcMessage::error(transaction_id, ERROR_GENERIC, "invalid port");
                }
                self.store_peer(info_hash, SocketAddr::new(from.ip(), port));
            }
        }
        KrpcMessage::response(transaction_id, response)
    }

    fn store_peer(&self, info_hash: InfoHash, peer: SocketAddr) {
        let now = Instant::now();
        let mut peers = self.peers.lock();
        let list = peers.entry(info_hash).or_default();
        list.retain(|(addr, at)| *addr != peer && now.duration_since(*at) < PEER_LIFETIME);
        if list.len() < MAX_PEERS_PER_TORRENT {
            list.push((peer, now));
        }
    }

    fn token_for(&self, addr: &SocketAddr, previous: bool) -> Vec<u8> {
        let secrets = self.secrets.lock();
        let secret = if previous {
            &secrets.previous
        } else {
            &secrets.current
        };
        let mut hasher = Sha1::new();
        hasher.update(secret);
        match addr.ip() {
            std::net::IpAddr::V4(ip) => hasher.update(ip.octets()),
            std::net::IpAddr::V6(ip) => hasher.update(ip.octets()),
        }
        hasher.finalize()[..TOKEN_LEN].to_vec()
    }
}
