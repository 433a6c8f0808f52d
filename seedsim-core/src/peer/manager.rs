//! Connection pool across all torrents.
//!
//! The ledger of live connections sits behind a single lock. Admission
//! checks the per-torrent and global caps and reserves the slot in the same
//! critical section, so concurrent admissions can never overshoot a cap.
//! Each admitted connection runs a [`PeerProtocolEngine`] task and is
//! steered through its control channel.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;

use super::engine::{
    CloseReason, ConnectionCommand, ConnectionOutcome, ConnectionShared, EngineContext,
    PeerProtocolEngine,
};
use super::types::{ConnectionState, Direction, PeerHandshake, PeerProtocolError};
use crate::config::PeerConfig;
use crate::random::RandomSource;
use crate::torrent::{InfoHash, PieceIndex};

const CONTROL_CHANNEL_CAPACITY: usize = 16;

/// A connection cap would be exceeded.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CapacityError {
    #[error("Global connection cap of {cap} reached")]
    GlobalCapReached { cap: usize },

    #[error("Connection cap of {cap} reached for torrent {info_hash}")]
    TorrentCapReached { info_hash: InfoHash, cap: usize },
}

/// Reasons a connection is not admitted.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AdmitError {
    #[error(transparent)]
    Capacity(#[from] CapacityError),

    #[error("Already connected to {address}")]
    AlreadyConnected { address: SocketAddr },

    #[error("Torrent {info_hash} is not accepting connections")]
    UnknownTorrent { info_hash: InfoHash },
}

/// Per-tick realism knobs taken from the torrent's seeding profile.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnectionBehavior {
    /// Chance per tick that an established connection toggles idle
    pub idle_probability: f64,
    /// Chance per tick that a connection advertises a piece
    pub have_probability: f64,
}

/// What one manager tick did for a torrent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub reaped: usize,
    pub started: usize,
    pub cleanup_requested: usize,
    pub force_closed: usize,
}

/// Point-in-time view of one connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSnapshot {
    pub address: SocketAddr,
    pub direction: Direction,
    pub state: ConnectionState,
    pub uploaded: u64,
    pub downloaded: u64,
    pub remote_pieces: u32,
    pub remote_peer_id: Option<String>,
    pub age: Duration,
}

struct ConnectionRecord {
    direction: Direction,
    shared: Arc<ConnectionShared>,
    control: mpsc::Sender<ConnectionCommand>,
    task: Option<JoinHandle<ConnectionOutcome>>,
    admitted_at: Instant,
    close_requested_at: Option<Instant>,
}

impl ConnectionRecord {
    fn request_close(&mut self, now: Instant) {
        if self.close_requested_at.is_none() {
            let _ = self.control.try_send(ConnectionCommand::Close);
            self.close_requested_at = Some(now);
        }
    }

    fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.shared.finish(false);
    }
}

struct TorrentPool {
    ctx: EngineContext,
    cap: usize,
    closing: bool,
    connections: BTreeMap<SocketAddr, ConnectionRecord>,
    candidates: VecDeque<SocketAddr>,
}

struct Ledger {
    config: PeerConfig,
    active: usize,
    torrents: HashMap<InfoHash, TorrentPool>,
    local_addresses: HashSet<SocketAddr>,
}

struct Admission {
    ctx: EngineContext,
    shared: Arc<ConnectionShared>,
    commands: mpsc::Receiver<ConnectionCommand>,
}

/// Connections of a torrent whose close has been requested but not awaited.
pub struct ClosingTorrent {
    addresses: Vec<SocketAddr>,
    tasks: Vec<JoinHandle<ConnectionOutcome>>,
}

/// Owns every peer connection and enforces the connection caps.
pub struct PeerConnectionManager {
    ledger: Mutex<Ledger>,
    connect_permits: Arc<Semaphore>,
}

impl PeerConnectionManager {
    /// Creates a manager; outbound TCP connects share `connect_permits`.
    pub fn new(config: PeerConfig, connect_permits: Arc<Semaphore>) -> Self {
        Self {
            ledger: Mutex::new(Ledger {
                config,
                active: 0,
                torrents: HashMap::new(),
                local_addresses: HashSet::new(),
            }),
            connect_permits,
        }
    }

    /// Starts accepting connections for a torrent.
    ///
    /// Re-registering a torrent that is still closing revives its pool.
    pub fn register_torrent(&self, ctx: EngineContext, cap: usize) {
        let mut ledger = self.ledger.lock();
        let info_hash = ctx.info_hash;
        match ledger.torrents.get_mut(&info_hash) {
            Some(pool) => {
                pool.ctx = ctx;
                pool.cap = cap;
                pool.closing = false;
            }
            None => {
                ledger.torrents.insert(
                    info_hash,
                    TorrentPool {
                        ctx,
                        cap,
                        closing: false,
                        connections: BTreeMap::new(),
                        candidates: VecDeque::new(),
                    },
                );
            }
        }
    }

    /// Changes a torrent's cap. Existing connections above a lowered cap
    /// are left to age out.
    pub fn set_torrent_cap(&self, info_hash: &InfoHash, cap: usize) {
        if let Some(pool) = self.ledger.lock().torrents.get_mut(info_hash) {
            pool.cap = cap;
        }
    }

    /// Replaces the peer configuration used for caps and new connections.
    pub fn update_config(&self, config: PeerConfig) {
        let mut ledger = self.ledger.lock();
        for pool in ledger.torrents.values_mut() {
            pool.ctx.config = config.clone();
        }
        ledger.config = config;
    }

    /// Marks an address as our own so tracker and DHT results never dial it.
    pub fn add_local_address(&self, address: SocketAddr) {
        self.ledger.lock().local_addresses.insert(address);
    }

    /// Connections currently counted against the global cap.
    pub fn total_connections(&self) -> usize {
        self.ledger.lock().active
    }

    /// Connections currently counted against a torrent's cap.
    pub fn connection_count(&self, info_hash: &InfoHash) -> usize {
        self.ledger
            .lock()
            .torrents
            .get(info_hash)
            .map_or(0, |pool| pool.connections.len())
    }

    /// Candidates waiting for a free slot.
    pub fn queued_candidates(&self, info_hash: &InfoHash) -> usize {
        self.ledger
            .lock()
            .torrents
            .get(info_hash)
            .map_or(0, |pool| pool.candidates.len())
    }

    /// Opens an outbound connection to `address`.
    ///
    /// # Errors
    ///
    /// - `AdmitError::Capacity` - Torrent or global cap reached
    /// - `AdmitError::AlreadyConnected` - A connection to this address exists
    /// - `AdmitError::UnknownTorrent` - Torrent not registered or closing
    pub fn connect(&self, info_hash: InfoHash, address: SocketAddr) -> Result<(), AdmitError> {
        let mut ledger = self.ledger.lock();
        self.start_outbound_locked(&mut ledger, info_hash, address)
    }

    /// Hands an accepted inbound socket whose handshake was already read to
    /// the torrent it asked for.
    ///
    /// # Errors
    ///
    /// - `AdmitError::Capacity` - Torrent or global cap reached
    /// - `AdmitError::AlreadyConnected` - A connection to this address exists
    /// - `AdmitError::UnknownTorrent` - Torrent not registered or closing
    pub fn accept(
        &self,
        stream: TcpStream,
        address: SocketAddr,
        handshake: PeerHandshake,
    ) -> Result<(), AdmitError> {
        self.attach(
            handshake.info_hash,
            address,
            Direction::Inbound,
            stream,
            Some(handshake),
        )
    }

    /// Admits an already connected stream of any transport.
    ///
    /// # Errors
    ///
    /// - `AdmitError::Capacity` - Torrent or global cap reached
    /// - `AdmitError::AlreadyConnected` - A connection to this address exists
    /// - `AdmitError::UnknownTorrent` - Torrent not registered or closing
    pub fn attach<S>(
        &self,
        info_hash: InfoHash,
        address: SocketAddr,
        direction: Direction,
        stream: S,
        remote_handshake: Option<PeerHandshake>,
    ) -> Result<(), AdmitError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut ledger = self.ledger.lock();
        let admission = admit_locked(&mut ledger, info_hash, address, direction)?;
        let shared = Arc::clone(&admission.shared);
        let engine = PeerProtocolEngine::new(
            stream,
            admission.ctx,
            shared,
            address,
            direction,
            admission.commands,
        );
        let task = tokio::spawn(engine.run(remote_handshake));
        set_task(&mut ledger, &info_hash, &address, task);
        Ok(())
    }

    fn start_outbound_locked(
        &self,
        ledger: &mut Ledger,
        info_hash: InfoHash,
        address: SocketAddr,
    ) -> Result<(), AdmitError> {
        let admission = admit_locked(ledger, info_hash, address, Direction::Outbound)?;
        let permits = Arc::clone(&self.connect_permits);
        let connect_timeout = ledger.config.connect_timeout;

        let task = tokio::spawn(async move {
            let permit = permits.acquire_owned().await.ok();
            let connected = tokio::time::timeout(connect_timeout, TcpStream::connect(address)).await;
            drop(permit);

            match connected {
                Ok(Ok(stream)) => {
                    let engine = PeerProtocolEngine::new(
                        stream,
                        admission.ctx,
                        Arc::clone(&admission.shared),
                        address,
                        Direction::Outbound,
                        admission.commands,
                    );
                    engine.run(None).await
                }
                failed => {
                    let reason = match failed {
                        Ok(Err(e)) => e.to_string(),
                        _ => format!("connect timed out after {connect_timeout:?}"),
                    };
                    tracing::debug!(peer = %address, "Outbound connect failed: {reason}");
                    admission.shared.finish(false);
                    ConnectionOutcome {
                        remote: address,
                        reason: CloseReason::Error,
                        error: Some(PeerProtocolError::ConnectionReset { reason }),
                        uploaded: 0,
                        downloaded: 0,
                    }
                }
            }
        });
        set_task(ledger, &info_hash, &address, task);
        Ok(())
    }

    /// Queues peers learned from a tracker or the DHT and connects to as
    /// many as the caps allow. Returns the number of connections started.
    pub fn add_candidates(&self, info_hash: &InfoHash, peers: &[SocketAddr]) -> usize {
        let mut guard = self.ledger.lock();
        let ledger = &mut *guard;
        let limit = ledger.config.candidate_queue_limit;
        let Some(pool) = ledger.torrents.get_mut(info_hash) else {
            return 0;
        };
        if pool.closing {
            return 0;
        }

        for &peer in peers {
            if peer.port() == 0
                || peer.ip().is_unspecified()
                || ledger.local_addresses.contains(&peer)
            {
                continue;
            }
            if pool.connections.contains_key(&peer) || pool.candidates.contains(&peer) {
                continue;
            }
            if pool.candidates.len() >= limit {
                break;
            }
            pool.candidates.push_back(peer);
        }

        self.start_candidates_locked(ledger, info_hash)
    }

    fn start_candidates_locked(&self, ledger: &mut Ledger, info_hash: &InfoHash) -> usize {
        let mut started = 0;
        loop {
            let global_cap = ledger.config.global_max_connections;
            let active = ledger.active;
            let Some(pool) = ledger.torrents.get_mut(info_hash) else {
                break;
            };
            if pool.closing || pool.connections.len() >= pool.cap || active >= global_cap {
                break;
            }
            let Some(address) = pool.candidates.pop_front() else {
                break;
            };

            match self.start_outbound_locked(ledger, *info_hash, address) {
                Ok(()) => started += 1,
                Err(AdmitError::AlreadyConnected { .. }) => continue,
                Err(_) => break,
            }
        }
        started
    }

    /// Periodic maintenance for one torrent.
    ///
    /// Reaps finished connections, force-closes silent ones, rolls idle and
    /// `have` behavior for established ones and fills free slots from the
    /// candidate queue.
    pub fn tick(
        &self,
        info_hash: &InfoHash,
        behavior: &ConnectionBehavior,
        rng: &mut dyn RandomSource,
    ) -> TickReport {
        let now = Instant::now();
        let mut report = TickReport::default();
        let mut ledger = self.ledger.lock();
        let Ledger {
            config,
            active,
            torrents,
            ..
        } = &mut *ledger;
        let Some(pool) = torrents.get_mut(info_hash) else {
            return report;
        };

        let abort_after = config.peer_update_interval * 2;
        let mut finished = Vec::new();
        for (address, record) in pool.connections.iter_mut() {
            let state = record.shared.state();
            if state == ConnectionState::Closed {
                finished.push(*address);
                report.reaped += 1;
                continue;
            }

            if let Some(requested) = record.close_requested_at {
                if now.duration_since(requested) >= abort_after {
                    record.abort();
                    finished.push(*address);
                    report.force_closed += 1;
                }
                continue;
            }

            if now.duration_since(record.shared.last_activity()) >= config.cleanup_timeout {
                tracing::debug!(peer = %address, "Closing silent connection");
                record.request_close(now);
                report.cleanup_requested += 1;
                continue;
            }

            if state.is_established() {
                if rng.chance(behavior.idle_probability) {
                    let idle = state == ConnectionState::Established;
                    let _ = record.control.try_send(ConnectionCommand::SetIdle(idle));
                }
                if pool.ctx.piece_count > 0 && rng.chance(behavior.have_probability) {
                    let piece = PieceIndex::new(rng.below(pool.ctx.piece_count));
                    let _ = record.control.try_send(ConnectionCommand::SendHave(piece));
                }
            }
        }

        for address in finished {
            pool.connections.remove(&address);
            *active -= 1;
        }

        report.started = self.start_candidates_locked(&mut ledger, info_hash);
        report
    }

    /// Closes a share of long-lived connections so new candidates get a turn.
    ///
    /// Only established connections older than `rotation_min_age` are
    /// eligible; the oldest `ceil(eligible * percentage / 100)` are closed.
    pub fn rotate(&self, info_hash: &InfoHash, percentage: f64) -> usize {
        let now = Instant::now();
        let mut ledger = self.ledger.lock();
        let min_age = ledger.config.rotation_min_age;
        let Some(pool) = ledger.torrents.get_mut(info_hash) else {
            return 0;
        };

        let mut eligible: Vec<(Instant, SocketAddr)> = pool
            .connections
            .iter()
            .filter(|(_, record)| record.close_requested_at.is_none())
            .filter(|(_, record)| record.shared.state().is_established())
            .filter_map(|(address, record)| {
                let since = record.shared.established_at()?;
                (now.duration_since(since) >= min_age).then_some((since, *address))
            })
            .collect();
        if eligible.is_empty() || percentage <= 0.0 {
            return 0;
        }

        eligible.sort();
        let count = ((eligible.len() as f64 * percentage / 100.0).ceil() as usize)
            .min(eligible.len());
        for (_, address) in eligible.iter().take(count) {
            if let Some(record) = pool.connections.get_mut(address) {
                record.request_close(now);
            }
        }
        tracing::debug!(info_hash = %info_hash, rotated = count, "Rotated connections");
        count
    }

    /// Point-in-time view of a torrent's connections.
    pub fn snapshot(&self, info_hash: &InfoHash) -> Vec<ConnectionSnapshot> {
        let now = Instant::now();
        let ledger = self.ledger.lock();
        let Some(pool) = ledger.torrents.get(info_hash) else {
            return Vec::new();
        };
        pool.connections
            .iter()
            .map(|(address, record)| ConnectionSnapshot {
                address: *address,
                direction: record.direction,
                state: record.shared.state(),
                uploaded: record.shared.uploaded(),
                downloaded: record.shared.downloaded(),
                remote_pieces: record.shared.remote_pieces(),
                remote_peer_id: record.shared.remote_peer_id().map(|id| id.to_string()),
                age: now.duration_since(record.admitted_at),
            })
            .collect()
    }

    /// Closes every connection of a torrent and stops admitting new ones.
    ///
    /// Connections get `grace` to finish cleanly before they are aborted.
    /// The slots are released once the connections are gone.
    pub async fn close_torrent(&self, info_hash: &InfoHash, grace: Duration) {
        if let Some(closing) = self.begin_close(info_hash) {
            self.finish_close(info_hash, closing, grace).await;
        }
    }

    /// First half of [`close_torrent`](Self::close_torrent): stops admissions,
    /// drops queued candidates and asks every connection to close.
    ///
    /// Returns `None` for an unknown torrent.
    pub fn begin_close(&self, info_hash: &InfoHash) -> Option<ClosingTorrent> {
        let now = Instant::now();
        let mut ledger = self.ledger.lock();
        let pool = ledger.torrents.get_mut(info_hash)?;
        pool.closing = true;
        pool.candidates.clear();

        let mut closing = ClosingTorrent {
            addresses: Vec::new(),
            tasks: Vec::new(),
        };
        for (address, record) in pool.connections.iter_mut() {
            record.request_close(now);
            closing.addresses.push(*address);
            if let Some(task) = record.task.take() {
                closing.tasks.push(task);
            }
        }
        Some(closing)
    }

    /// Second half of [`close_torrent`](Self::close_torrent): waits up to
    /// `grace`, aborts stragglers and releases their slots.
    pub async fn finish_close(&self, info_hash: &InfoHash, closing: ClosingTorrent, grace: Duration) {
        let ClosingTorrent { addresses, tasks } = closing;
        let aborts: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();
        if tokio::time::timeout(grace, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            tracing::debug!(info_hash = %info_hash, "Aborting connections after close grace");
            for abort in aborts {
                abort.abort();
            }
        }

        let mut ledger = self.ledger.lock();
        let Ledger {
            active, torrents, ..
        } = &mut *ledger;
        if let Some(pool) = torrents.get_mut(info_hash) {
            for address in addresses {
                if let Some(record) = pool.connections.remove(&address) {
                    record.shared.finish(false);
                    *active -= 1;
                }
            }
            if pool.closing {
                torrents.remove(info_hash);
            }
        }
    }

    /// Closes every torrent's connections concurrently.
    pub async fn close_all(&self, grace: Duration) {
        let hashes: Vec<InfoHash> = self.ledger.lock().torrents.keys().copied().collect();
        futures::future::join_all(hashes.iter().map(|hash| self.close_torrent(hash, grace))).await;
    }
}

fn admit_locked(
    ledger: &mut Ledger,
    info_hash: InfoHash,
    address: SocketAddr,
    direction: Direction,
) -> Result<Admission, AdmitError> {
    let global_cap = ledger.config.global_max_connections;
    let active = ledger.active;
    let pool = ledger
        .torrents
        .get_mut(&info_hash)
        .filter(|pool| !pool.closing)
        .ok_or(AdmitError::UnknownTorrent { info_hash })?;

    if pool.connections.contains_key(&address) {
        return Err(AdmitError::AlreadyConnected { address });
    }
    if pool.connections.len() >= pool.cap {
        return Err(CapacityError::TorrentCapReached {
            info_hash,
            cap: pool.cap,
        }
        .into());
    }
    if active >= global_cap {
        return Err(CapacityError::GlobalCapReached { cap: global_cap }.into());
    }

    let initial = match direction {
        Direction::Outbound => ConnectionState::Connecting,
        Direction::Inbound => ConnectionState::Handshaking,
    };
    let shared = Arc::new(ConnectionShared::new(initial));
    let (control, commands) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
    pool.connections.insert(
        address,
        ConnectionRecord {
            direction,
            shared: Arc::clone(&shared),
            control,
            task: None,
            admitted_at: Instant::now(),
            close_requested_at: None,
        },
    );
    let ctx = pool.ctx.clone();
    ledger.active += 1;

    tracing::debug!(peer = %address, info_hash = %info_hash, ?direction, "Admitted connection");
    Ok(Admission {
        ctx,
        shared,
        commands,
    })
}

fn set_task(
    ledger: &mut Ledger,
    info_hash: &InfoHash,
    address: &SocketAddr,
    task: JoinHandle<ConnectionOutcome>,
) {
    if let Some(record) = ledger
        .torrents
        .get_mut(info_hash)
        .and_then(|pool| pool.connections.get_mut(address))
    {
        record.task = Some(task);
    }
}
